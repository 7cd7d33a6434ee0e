//! Device buffer handles tracked by the buffer registry.
//!
//! A [`DeviceBuffer`] is a cheap, clonable handle. Memory stays alive while
//! any handle exists, so keeping a clone in the registry keeps the region
//! valid for in-flight work.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::device::DeviceId;

/// Values the buffer registry can track.
///
/// The registry compares entries for equality and hands out the default
/// value when a stream has nothing pending. It never frees what it tracks.
pub trait TrackedBuffer: Clone + Default + PartialEq + Send + 'static {}

impl<T> TrackedBuffer for T where T: Clone + Default + PartialEq + Send + 'static {}

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

struct BufferInner {
    id: u64,
    device_id: DeviceId,
    bytes: Mutex<Vec<u8>>,
}

/// Shared handle to a device-resident memory region.
///
/// Equality is identity: two handles are equal when they refer to the same
/// allocation. The default handle refers to nothing.
#[derive(Clone, Default)]
pub struct DeviceBuffer {
    inner: Option<Arc<BufferInner>>,
}

impl DeviceBuffer {
    /// Allocate a zeroed region of `len` bytes on `device_id`.
    pub fn alloc(device_id: DeviceId, len: usize) -> Self {
        Self {
            inner: Some(Arc::new(BufferInner {
                id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
                device_id,
                bytes: Mutex::new(vec![0; len]),
            })),
        }
    }

    /// Allocation id, `None` for the empty handle.
    pub fn id(&self) -> Option<u64> {
        self.inner.as_ref().map(|i| i.id)
    }

    /// Device the region lives on.
    pub fn device_id(&self) -> Option<DeviceId> {
        self.inner.as_ref().map(|i| i.device_id)
    }

    /// True for the empty handle.
    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.inner.as_ref().map_or(0, |i| i.bytes.lock().len())
    }

    /// True when the region is empty or the handle is null.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live handles to this allocation.
    pub fn handle_count(&self) -> usize {
        self.inner.as_ref().map_or(0, Arc::strong_count)
    }

    /// Copy `data` into the start of the region. Returns bytes written.
    pub fn write(&self, data: &[u8]) -> usize {
        let Some(inner) = &self.inner else {
            return 0;
        };
        let mut bytes = inner.bytes.lock();
        let n = data.len().min(bytes.len());
        bytes[..n].copy_from_slice(&data[..n]);
        n
    }

    /// Snapshot of the region contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.inner
            .as_ref()
            .map_or_else(Vec::new, |i| i.bytes.lock().clone())
    }
}

impl PartialEq for DeviceBuffer {
    fn eq(&self, other: &Self) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl Eq for DeviceBuffer {}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Some(inner) => f
                .debug_struct("DeviceBuffer")
                .field("id", &inner.id)
                .field("device_id", &inner.device_id)
                .field("len", &inner.bytes.lock().len())
                .finish(),
            None => f.write_str("DeviceBuffer(null)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_identity() {
        let a = DeviceBuffer::alloc(0, 16);
        let b = DeviceBuffer::alloc(0, 16);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(DeviceBuffer::default(), DeviceBuffer::default());
        assert_ne!(a, DeviceBuffer::default());
    }

    #[test]
    fn test_buffer_handle_count() {
        let a = DeviceBuffer::alloc(1, 8);
        assert_eq!(a.handle_count(), 1);
        let b = a.clone();
        assert_eq!(a.handle_count(), 2);
        drop(b);
        assert_eq!(a.handle_count(), 1);
        assert_eq!(DeviceBuffer::default().handle_count(), 0);
    }

    #[test]
    fn test_buffer_write_truncates() {
        let a = DeviceBuffer::alloc(0, 4);
        assert_eq!(a.write(&[1, 2, 3, 4, 5, 6]), 4);
        assert_eq!(a.to_vec(), vec![1, 2, 3, 4]);
        assert_eq!(a.device_id(), Some(0));
        assert!(DeviceBuffer::default().is_null());
    }
}
