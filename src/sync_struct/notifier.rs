//! Mutation-tracking container.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::Mod;
use crate::error::{MasterError, MasterResult};
use crate::protocol::Value;

/// Receives every mutation applied to a [`Notifier`].
///
/// `publish` is called while the notifier's lock is held, right after the
/// backing store changed. Implementations must not block.
pub trait ModSink: Send + Sync {
    /// Called once per mutation, in order.
    fn publish(&self, m: &Mod);
}

/// Wraps a sequence or mapping so that every mutation can be replicated.
///
/// The backing store is only reachable mutably through the four operations
/// below; [`Notifier::read`] hands out shared references only.
pub struct Notifier {
    backing: Value,
    sink: Option<Arc<dyn ModSink>>,
}

/// A notifier shared between tasks.
pub type SharedNotifier = Arc<Mutex<Notifier>>;

/// Locks a shared notifier. A poisoned lock is recovered: mutations apply
/// atomically, so the store is consistent even if a holder panicked.
pub fn lock(notifier: &SharedNotifier) -> MutexGuard<'_, Notifier> {
    notifier.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Notifier {
    /// Unshared notifier over `backing`, with no sink attached.
    pub fn new(backing: Value) -> Self {
        Self {
            backing,
            sink: None,
        }
    }

    /// A new notifier behind an `Arc<Mutex<_>>`.
    pub fn shared(backing: Value) -> SharedNotifier {
        Arc::new(Mutex::new(Self::new(backing)))
    }

    /// Current contents of the backing store.
    pub fn read(&self) -> &Value {
        &self.backing
    }

    /// Attaches the sink that receives all subsequent mutations, replacing
    /// any previous one.
    pub fn set_sink(&mut self, sink: Arc<dyn ModSink>) {
        self.sink = Some(sink);
    }

    /// True once a sink is attached.
    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// Appends to a sequence.
    pub fn append(&mut self, x: Value) -> MasterResult<()> {
        self.mutate(Mod::Append { x }).map(|_| ())
    }

    /// Inserts at a sequence position, or inserts/replaces a mapping entry.
    pub fn insert(&mut self, i: impl Into<Value>, x: Value) -> MasterResult<()> {
        self.mutate(Mod::Insert { i: i.into(), x }).map(|_| ())
    }

    /// Removes and returns the sequence element at `i` (negative counts from
    /// the end).
    pub fn remove_at(&mut self, i: i64) -> MasterResult<Value> {
        self.mutate(Mod::Pop { i }).map(Option::unwrap_or_default)
    }

    /// Removes a mapping entry (or a sequence position given as an integer).
    pub fn remove_key(&mut self, key: impl Into<Value>) -> MasterResult<()> {
        self.mutate(Mod::Delitem { key: key.into() }).map(|_| ())
    }

    /// Applies an event produced by another notifier through the matching
    /// operation above. Snapshots are refused: they would bypass the event
    /// stream.
    pub fn replay(&mut self, m: Mod) -> MasterResult<()> {
        match m {
            Mod::Init { .. } => Err(MasterError::Protocol(
                "cannot replay a snapshot onto a notifier".to_string(),
            )),
            Mod::Append { x } => self.append(x),
            Mod::Insert { i, x } => self.insert(i, x),
            Mod::Pop { i } => self.remove_at(i).map(|_| ()),
            Mod::Delitem { key } => self.remove_key(key),
        }
    }

    fn mutate(&mut self, m: Mod) -> MasterResult<Option<Value>> {
        let removed = m.apply(&mut self.backing)?;
        if let Some(sink) = &self.sink {
            sink.publish(&m);
        }
        Ok(removed)
    }
}
