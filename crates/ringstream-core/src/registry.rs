//! Per-stream registry of buffers awaiting release.
//!
//! Each stream owns one entry: a mutex-guarded list of buffer handles in
//! enqueue order. Device callbacks complete in per-stream FIFO order, so
//! when a callback proves the device is done with a buffer, every buffer
//! enqueued before it on the same stream is done too and the whole prefix
//! can be dropped in one step.
//!
//! Two levels of locking are used:
//!
//! - the key set (adding, retiring or dropping whole entries) is guarded by
//!   a coarse `RwLock`;
//! - each list is guarded by its own `Mutex`.
//!
//! The coarse lock is only held long enough to clone the entry's `Arc`, so
//! the two locks are never nested.
//!
//! Entries are retired rather than removed when a stream is torn down. A
//! handle that was never registered and one that was registered and then
//! destroyed therefore produce different outcomes.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::buffer::{DeviceBuffer, TrackedBuffer};
use crate::device::QueueHandle;
use crate::error::{Result, StreamError};

type BufferList<B> = Arc<Mutex<VecDeque<B>>>;

enum EntryState<B> {
    /// Registered and accepting buffers.
    Live(BufferList<B>),
    /// Torn down by `delete_stream`; the key stays so later probes fail
    /// loudly instead of looking unregistered.
    Retired,
    /// Lock and list disagree. Never repaired implicitly.
    #[cfg_attr(not(test), allow(dead_code))]
    Inconsistent,
}

/// Observable state of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// No entry for the handle.
    Unregistered,
    /// Entry accepts buffers.
    Live,
    /// Entry was torn down.
    Retired,
    /// Entry is corrupted.
    Inconsistent,
}

/// Registry of buffers pending release, keyed by queue handle.
pub struct BufferRegistry<B: TrackedBuffer = DeviceBuffer> {
    entries: RwLock<HashMap<QueueHandle, EntryState<B>>>,
}

impl<B: TrackedBuffer> BufferRegistry<B> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register a stream, or re-arm a retired entry.
    pub fn add_stream(&self, queue: QueueHandle) -> Result<()> {
        let mut entries = self.entries.write();
        match entries.entry(queue) {
            Entry::Vacant(slot) => {
                slot.insert(EntryState::Live(Arc::new(Mutex::new(VecDeque::new()))));
            }
            Entry::Occupied(mut slot) => {
                let reason = match slot.get() {
                    EntryState::Retired => None,
                    EntryState::Live(_) => Some("already registered"),
                    EntryState::Inconsistent => Some("inconsistent"),
                };
                if let Some(reason) = reason {
                    warn!(%queue, reason, "cannot register stream");
                    return Err(StreamError::InitFailed(format!(
                        "stream {} is {}",
                        queue, reason
                    )));
                }
                slot.insert(EntryState::Live(Arc::new(Mutex::new(VecDeque::new()))));
            }
        }
        debug!(%queue, "registered stream");
        Ok(())
    }

    /// Append a buffer to the stream's list.
    ///
    /// Unregistered streams are tolerated: the buffer is not tracked and a
    /// warning is logged.
    pub fn add_tensor(&self, queue: QueueHandle, buffer: B) -> Result<()> {
        match self.list(queue, "add_tensor")? {
            Some(list) => {
                list.lock().push_back(buffer);
                Ok(())
            }
            None => {
                warn!(%queue, "stream is not registered, buffer is not tracked");
                Ok(())
            }
        }
    }

    /// Most recently added buffer, or the default value if nothing is pending.
    pub fn last_tensor(&self, queue: QueueHandle) -> Result<B> {
        let list = self.live_list(queue, "last_tensor")?;
        let last = list.lock().back().cloned().unwrap_or_default();
        Ok(last)
    }

    /// Drop every pending buffer of the stream.
    pub fn clear_by_stream(&self, queue: QueueHandle) -> Result<()> {
        let list = self.live_list(queue, "clear_by_stream")?;
        list.lock().clear();
        Ok(())
    }

    /// Remove the first occurrence of `buffer` and everything before it.
    ///
    /// A missing buffer is not an error: a concurrent synchronize may have
    /// already cleared the list.
    pub fn delete_tensor(&self, queue: QueueHandle, buffer: &B) -> Result<()> {
        let list = self.live_list(queue, "delete_tensor")?;
        let mut list = list.lock();
        match list.iter().position(|b| b == buffer) {
            Some(pos) => {
                list.drain(..=pos);
            }
            None => {
                warn!(%queue, "buffer not found in the stream's pending list");
            }
        }
        Ok(())
    }

    /// Retire the stream's entry. The key is kept.
    pub fn delete_stream(&self, queue: QueueHandle) -> Result<()> {
        let mut entries = self.entries.write();
        let Some(state) = entries.get_mut(&queue) else {
            return Err(Self::not_live(queue, "delete_stream", None));
        };
        if !matches!(state, EntryState::Live(_)) {
            return Err(Self::not_live(queue, "delete_stream", Some(&*state)));
        }
        *state = EntryState::Retired;
        debug!(%queue, "retired stream entry");
        Ok(())
    }

    /// Number of pending buffers, `None` unless the entry is live.
    pub fn pending(&self, queue: QueueHandle) -> Option<usize> {
        match self.entries.read().get(&queue) {
            Some(EntryState::Live(list)) => Some(list.lock().len()),
            _ => None,
        }
    }

    /// Copy of the stream's pending list, oldest first.
    pub fn snapshot(&self, queue: QueueHandle) -> Result<Vec<B>> {
        let list = self.live_list(queue, "snapshot")?;
        let items = list.lock().iter().cloned().collect();
        Ok(items)
    }

    /// State of the entry for `queue`.
    pub fn status(&self, queue: QueueHandle) -> EntryStatus {
        match self.entries.read().get(&queue) {
            None => EntryStatus::Unregistered,
            Some(EntryState::Live(_)) => EntryStatus::Live,
            Some(EntryState::Retired) => EntryStatus::Retired,
            Some(EntryState::Inconsistent) => EntryStatus::Inconsistent,
        }
    }

    /// Number of keys, retired ones included.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when no stream was ever registered (or after `deinit`).
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop every entry.
    pub fn deinit(&self) {
        self.entries.write().clear();
        debug!("buffer registry cleared");
    }

    fn list(&self, queue: QueueHandle, op: &str) -> Result<Option<BufferList<B>>> {
        let entries = self.entries.read();
        match entries.get(&queue) {
            None => Ok(None),
            Some(EntryState::Live(list)) => Ok(Some(Arc::clone(list))),
            other => Err(Self::not_live(queue, op, other)),
        }
    }

    fn live_list(&self, queue: QueueHandle, op: &str) -> Result<BufferList<B>> {
        let entries = self.entries.read();
        match entries.get(&queue) {
            Some(EntryState::Live(list)) => Ok(Arc::clone(list)),
            other => Err(Self::not_live(queue, op, other)),
        }
    }

    fn not_live(queue: QueueHandle, op: &str, state: Option<&EntryState<B>>) -> StreamError {
        let reason = match state {
            None => "not registered",
            Some(EntryState::Retired) => "torn down",
            Some(EntryState::Inconsistent) => "inconsistent",
            Some(EntryState::Live(_)) => "live",
        };
        warn!(%queue, op, reason, "stream entry is not usable");
        StreamError::CommFailure(format!("{}: stream {} is {}", op, queue, reason))
    }

    #[cfg(test)]
    fn corrupt(&self, queue: QueueHandle) {
        self.entries.write().insert(queue, EntryState::Inconsistent);
    }
}

impl<B: TrackedBuffer> Default for BufferRegistry<B> {
    fn default() -> Self {
        Self::new()
    }
}
