//! Built-in experiments.
//!
//! | name       | behaviour                                                  |
//! |------------|------------------------------------------------------------|
//! | `noop`     | completes immediately                                      |
//! | `fail`     | fails with `message`                                       |
//! | `hang`     | sleeps for `seconds` (an hour by default)                  |
//! | `crash`    | aborts the worker process                                  |
//! | `print`    | writes `text` to stdout                                    |
//! | `flopping` | scans a DDS frequency and records the measured brightness  |

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tracing::info;

use super::{Experiment, ExperimentRegistry};
use crate::db::DbHub;
use crate::instrument::Command;
use crate::protocol::Value;

pub(super) fn register(registry: &mut ExperimentRegistry) {
    registry.register("noop", |_| Ok(Box::new(Noop) as Box<dyn Experiment>));
    registry.register("fail", |args| {
        let message = str_arg(args, "message", "requested failure")?;
        Ok(Box::new(Fail { message }) as Box<dyn Experiment>)
    });
    registry.register("hang", |args| {
        let seconds = float_arg(args, "seconds", 3600.0)?;
        let duration = Duration::try_from_secs_f64(seconds)
            .map_err(|e| anyhow!("'seconds' is not a valid duration: {}", e))?;
        Ok(Box::new(Hang { duration }) as Box<dyn Experiment>)
    });
    registry.register("crash", |_| Ok(Box::new(Crash) as Box<dyn Experiment>));
    registry.register("print", |args| {
        let text = str_arg(args, "text", "hello")?;
        Ok(Box::new(Print { text }) as Box<dyn Experiment>)
    });
    registry.register("flopping", |args| {
        Ok(Box::new(Flopping::from_arguments(args)?) as Box<dyn Experiment>)
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

fn str_arg(args: &Value, key: &str, default: &str) -> Result<String> {
    match args.get(key) {
        None => Ok(default.to_string()),
        Some(v) => v
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("'{}' must be a string, got {}", key, v.kind())),
    }
}

struct Noop;

#[async_trait]
impl Experiment for Noop {
    async fn run(&mut self, _hub: &mut DbHub) -> Result<()> {
        info!("noop run");
        Ok(())
    }
}

struct Fail {
    message: String,
}

#[async_trait]
impl Experiment for Fail {
    async fn run(&mut self, _hub: &mut DbHub) -> Result<()> {
        bail!("{}", self.message)
    }
}

struct Hang {
    duration: Duration,
}

#[async_trait]
impl Experiment for Hang {
    async fn run(&mut self, _hub: &mut DbHub) -> Result<()> {
        tokio::time::sleep(self.duration).await;
        Ok(())
    }
}

struct Crash;

#[async_trait]
impl Experiment for Crash {
    async fn run(&mut self, _hub: &mut DbHub) -> Result<()> {
        std::process::abort()
    }
}

struct Print {
    text: String,
}

#[async_trait]
impl Experiment for Print {
    async fn run(&mut self, _hub: &mut DbHub) -> Result<()> {
        println!("{}", self.text);
        Ok(())
    }
}

/// Frequency scan across a resonance ("Rabi flopping" style).
///
/// Realtime results: `frequency` and `brightness`, one entry per point.
/// When the scan completes the frequency of the brightest point is stored
/// as the ordinary result `peak` and persisted as the parameter
/// `flopping_peak`.
struct Flopping {
    npoints: usize,
    start: f64,
    stop: f64,
    dds: String,
    ttl: String,
}

impl Flopping {
    fn from_arguments(args: &Value) -> Result<Self> {
        let npoints = match args.get("npoints") {
            None => 21,
            Some(v) => {
                let n = v.as_i64().context("'npoints' must be an integer")?;
                usize::try_from(n).context("'npoints' must not be negative")?
            }
        };
        if npoints == 0 {
            bail!("'npoints' must be at least 1");
        }
        Ok(Self {
            npoints,
            start: float_arg(args, "start", 99e6)?,
            stop: float_arg(args, "stop", 101e6)?,
            dds: str_arg(args, "dds", "dds")?,
            ttl: str_arg(args, "ttl", "ttl")?,
        })
    }

    fn frequency(&self, i: usize) -> f64 {
        if self.npoints == 1 {
            return self.start;
        }
        self.start + (self.stop - self.start) * i as f64 / (self.npoints - 1) as f64
    }
}

#[async_trait]
impl Experiment for Flopping {
    fn realtime_results(&self) -> Value {
        Value::Dict(vec![(
            Value::Tuple(vec![Value::from("frequency"), Value::from("brightness")]),
            Value::from_pairs([
                ("kind", Value::from("xy")),
                ("x", Value::from("frequency")),
            ]),
        )])
    }

    async fn run(&mut self, hub: &mut DbHub) -> Result<()> {
        let mut peak: Option<(f64, f64)> = None;
        for i in 0..self.npoints {
            let f = self.frequency(i);
            hub.get_device(&self.dds)
                .await?
                .execute(Command::Set("frequency".into(), Value::Float(f)))
                .await?;
            hub.get_device(&self.ttl)
                .await?
                .execute(Command::Custom("pulse".into(), Value::None))
                .await?;
            let brightness = hub
                .get_device(&self.dds)
                .await?
                .execute(Command::Custom("measure".into(), Value::None))
                .await?
                .as_f64()
                .context("measurement is not a number")?;

            hub.append_result("frequency", Value::Float(f)).await?;
            hub.append_result("brightness", Value::Float(brightness))
                .await?;
            if peak.map_or(true, |(_, best)| brightness > best) {
                peak = Some((f, brightness));
            }
        }

        if let Some((f, brightness)) = peak {
            info!("Peak brightness {:.3} at {:.1} Hz", brightness, f);
            hub.set_result("peak", Value::Float(f)).await?;
            hub.set_parameter("flopping_peak", Value::Float(f)).await?;
        }
        Ok(())
    }
}
