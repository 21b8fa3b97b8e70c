//! Structured state replication.
//!
//! A [`Notifier`] wraps a sequence or mapping and turns every mutation into a
//! [`Mod`] event. A [`Publisher`] serves those events over TCP: each
//! subscriber first receives a snapshot (`init`), then every later mutation
//! in order. A [`Subscriber`] rebuilds a local mirror from that stream.
//!
//! ```text
//! Notifier::append/insert/remove_at/remove_key
//!      │  (backing store mutated first)
//!      ▼
//! ModSink::publish(&Mod) ──► Publisher recipients ──► [queue C1] [queue C2] ...
//!                                                        │          │
//!                                                     conn C1    conn C2 ──► Subscriber mirror
//! ```
//!
//! The same four-way dispatch ([`Mod::apply`]) mutates the server-side
//! backing store and every mirror, so a drained mirror always equals the
//! server state.
//!
//! # Example
//!
//! ```
//! use daq_master::protocol::Value;
//! use daq_master::sync_struct::{lock, Notifier, Publisher, Subscriber};
//!
//! # tokio_test::block_on(async {
//! let queue = Notifier::shared(Value::list());
//! let mut publisher = Publisher::new(queue.clone());
//! let addr = publisher.start("127.0.0.1:0").await.unwrap();
//!
//! let mirror = Subscriber::connect_value(addr).await.unwrap();
//! mirror.wait_until(|v| v.as_list().is_some()).await.unwrap();
//!
//! lock(&queue).append(Value::from("run")).unwrap();
//! mirror
//!     .wait_until(|v| v.as_list().is_some_and(|l| l.len() == 1))
//!     .await
//!     .unwrap();
//!
//! mirror.close().await.unwrap();
//! publisher.stop().await;
//! # });
//! ```

pub mod notifier;
pub mod publisher;
pub mod subscriber;

pub use notifier::{lock, ModSink, Notifier, SharedNotifier};
pub use publisher::Publisher;
pub use subscriber::{NotifyCallback, Subscriber};

use serde::{Deserialize, Serialize};

use crate::error::{MasterError, MasterResult};
use crate::protocol::Value;

/// First line a subscriber must send after connecting.
pub const PREAMBLE: &[u8] = b"daq_master sync_struct\n";

/// One replication message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Mod {
    /// Full snapshot, always the first message on a connection.
    Init {
        /// The whole structure
        #[serde(rename = "struct")]
        structure: Value,
    },
    /// Push onto a sequence
    Append {
        /// Element to add
        x: Value,
    },
    /// Positional insert on a sequence, insert-or-replace on a mapping.
    Insert {
        /// Position for a sequence, key for a mapping
        i: Value,
        /// Element to add
        x: Value,
    },
    /// Remove from a sequence by position
    Pop {
        /// Position; negative counts from the end
        i: i64,
    },
    /// Remove a mapping entry, or a sequence element by position
    Delitem {
        /// Mapping key or sequence index
        key: Value,
    },
}

impl Mod {
    /// Replays this event onto `target`.
    ///
    /// Returns the removed element for `pop`. On error `target` is left
    /// unchanged.
    pub fn apply(&self, target: &mut Value) -> MasterResult<Option<Value>> {
        match self {
            Mod::Init { structure } => {
                *target = structure.clone();
                Ok(None)
            }
            Mod::Append { x } => match target {
                Value::List(items) => {
                    items.push(x.clone());
                    Ok(None)
                }
                other => Err(mismatch("append", other)),
            },
            Mod::Insert { i, x } => match target {
                Value::List(items) => {
                    let index = i
                        .as_i64()
                        .ok_or_else(|| MasterError::Protocol(format!("insert index {i} is not an integer")))?;
                    if index < 0 || index as usize > items.len() {
                        return Err(MasterError::Lookup(format!(
                            "insert index {index} out of range for length {}",
                            items.len()
                        )));
                    }
                    items.insert(index as usize, x.clone());
                    Ok(None)
                }
                Value::Dict(entries) => {
                    match entries.iter_mut().find(|(k, _)| k == i) {
                        Some((_, slot)) => *slot = x.clone(),
                        None => entries.push((i.clone(), x.clone())),
                    }
                    Ok(None)
                }
                other => Err(mismatch("insert", other)),
            },
            Mod::Pop { i } => match target {
                Value::List(items) => {
                    let index = resolve_index(*i, items.len())?;
                    Ok(Some(items.remove(index)))
                }
                other => Err(mismatch("pop", other)),
            },
            Mod::Delitem { key } => match target {
                Value::List(items) => {
                    let raw = key
                        .as_i64()
                        .ok_or_else(|| MasterError::Protocol(format!("sequence key {key} is not an integer")))?;
                    let index = resolve_index(raw, items.len())?;
                    Ok(Some(items.remove(index)))
                }
                Value::Dict(entries) => {
                    let position = entries
                        .iter()
                        .position(|(k, _)| k == key)
                        .ok_or_else(|| MasterError::Lookup(format!("key {key} not found")))?;
                    Ok(Some(entries.remove(position).1))
                }
                other => Err(mismatch("delitem", other)),
            },
        }
    }
}

/// Python-style index resolution: negative indices count from the end.
fn resolve_index(i: i64, len: usize) -> MasterResult<usize> {
    let resolved = if i < 0 { len as i64 + i } else { i };
    if resolved < 0 || resolved as usize >= len {
        return Err(MasterError::Lookup(format!(
            "index {i} out of range for length {len}"
        )));
    }
    Ok(resolved as usize)
}

fn mismatch(action: &str, target: &Value) -> MasterError {
    MasterError::Protocol(format!("cannot {action} on a {}", target.kind()))
}

/// A structure kept in sync by replaying [`Mod`] events.
pub trait Mirror: Send + 'static {
    /// Applies one event. On error the mirror is unchanged.
    fn apply_mod(&mut self, m: &Mod) -> MasterResult<()>;
}

impl Mirror for Value {
    fn apply_mod(&mut self, m: &Mod) -> MasterResult<()> {
        m.apply(self).map(|_| ())
    }
}
