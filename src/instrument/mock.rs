//! Mock devices that simulate a pulse generator and a frequency source.
//!
//! `mock_dds` models a two-level system driven near resonance: `measure`
//! returns the excited state population for the current frequency, which
//! follows a Lorentzian line with optional noise.
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, info};

use super::{Command, Device, DeviceRegistry};
use crate::protocol::Value;

pub(super) fn register(registry: &mut DeviceRegistry) {
    registry.register("mock_ttl", |name, args| {
        Ok(Box::new(MockTtl::new(name, args)?) as Box<dyn Device>)
    });
    registry.register("mock_dds", |name, args| {
        Ok(Box::new(MockDds::new(name, args)?) as Box<dyn Device>)
    });
}

fn float_arg(args: &Value, key: &str, default: f64) -> Result<f64> {
    match args.get(key) {
        None => Ok(default),
        Some(v) => v
            .as_f64()
            .ok_or_else(|| anyhow!("'{}' must be a number, got {}", key, v.kind())),
    }
}

/// A digital output that counts the pulses it has produced.
pub struct MockTtl {
    id: String,
    channel: i64,
    pulses: u64,
    open: bool,
}

impl MockTtl {
    /// Builds the device from its description `arguments`.
    pub fn new(id: &str, args: &Value) -> Result<Self> {
        let channel = match args.get("channel") {
            None => 0,
            Some(v) => v
                .as_i64()
                .ok_or_else(|| anyhow!("'channel' must be an integer"))?,
        };
        Ok(Self {
            id: id.to_string(),
            channel,
            pulses: 0,
            open: false,
        })
    }
}

#[async_trait]
impl Device for MockTtl {
    fn id(&self) -> &str {
        &self.id
    }

    async fn initialize(&mut self) -> Result<()> {
        info!("Opening mock TTL '{}' on channel {}", self.id, self.channel);
        self.open = true;
        Ok(())
    }

    async fn execute(&mut self, cmd: Command) -> Result<Value> {
        if !self.open {
            bail!("mock TTL '{}' is not open", self.id);
        }
        match cmd {
            Command::Custom(op, _) if op == "pulse" => {
                self.pulses += 1;
                Ok(Value::None)
            }
            Command::Get(key) if key == "pulses" => Ok(Value::from(self.pulses)),
            Command::Get(key) if key == "channel" => Ok(Value::Int(self.channel)),
            other => bail!("mock TTL does not support {:?}", other),
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        debug!("Closing mock TTL '{}' after {} pulses", self.id, self.pulses);
        self.open = false;
        Ok(())
    }
}

/// A frequency source whose `measure` samples a resonance line.
pub struct MockDds {
    id: String,
    frequency: f64,
    center_frequency: f64,
    linewidth: f64,
    noise: f64,
    open: bool,
}

impl MockDds {
    /// Builds the device from its description `arguments`.
    pub fn new(id: &str, args: &Value) -> Result<Self> {
        let center_frequency = float_arg(args, "center_frequency", 100e6)?;
        let linewidth = float_arg(args, "linewidth", 1e6)?;
        if linewidth <= 0.0 {
            bail!("'linewidth' must be positive");
        }
        Ok(Self {
            id: id.to_string(),
            frequency: float_arg(args, "frequency", center_frequency)?,
            center_frequency,
            linewidth,
            noise: float_arg(args, "noise", 0.0)?,
            open: false,
        })
    }

    fn population(&self) -> f64 {
        let detuning = (self.frequency - self.center_frequency) / (self.linewidth / 2.0);
        1.0 / (1.0 + detuning * detuning)
    }
}

#[async_trait]
impl Device for MockDds {
    fn id(&self) -> &str {
        &self.id
    }

    async fn initialize(&mut self) -> Result<()> {
        info!("Opening mock DDS '{}'", self.id);
        self.open = true;
        Ok(())
    }

    async fn execute(&mut self, cmd: Command) -> Result<Value> {
        if !self.open {
            bail!("mock DDS '{}' is not open", self.id);
        }
        match cmd {
            Command::Set(key, value) if key == "frequency" => {
                self.frequency = value
                    .as_f64()
                    .ok_or_else(|| anyhow!("frequency must be a number"))?;
                Ok(Value::None)
            }
            Command::Get(key) if key == "frequency" => Ok(Value::Float(self.frequency)),
            Command::Custom(op, _) if op == "measure" => {
                let mut p = self.population();
                if self.noise > 0.0 {
                    p += rand::thread_rng().gen_range(-self.noise..=self.noise);
                }
                Ok(Value::Float(p.clamp(0.0, 1.0)))
            }
            other => bail!("mock DDS does not support {:?}", other),
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        debug!("Closing mock DDS '{}'", self.id);
        self.open = false;
        Ok(())
    }
}
