//! Slab-backed buffers and the pooled allocation primitive they come from.
//!
//! A slab is one backing region. Many [`SlabBuf`] views may share it, and the
//! region lives for as long as any of them does. That is exactly the retention
//! pattern the auditor is looking for: a 50-byte view that keeps an 8 KiB pool
//! slab alive.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

/// Default pool slab size. Requests under half of it are carved from a pool.
pub const DEFAULT_POOL_SIZE: usize = 8 * 1024;

/// Pool offsets are rounded up to this alignment after every carve.
const POOL_ALIGN: usize = 8;

/// Identity of a backing region (reference identity, not value equality).
///
/// Derived from the region's address. Addresses can be recycled only after the
/// region is gone, and a region cannot be gone while a tracked view still holds
/// it, so an id never names two live regions at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlabId(usize);

impl SlabId {
    #[must_use]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_raw(self) -> usize {
        self.0
    }
}

/// The handle shape the auditor understands: a length-limited view onto a
/// larger backing region.
pub trait SlabView {
    /// Bytes the caller asked for.
    fn len(&self) -> usize;

    /// Identity of the backing region.
    fn slab_id(&self) -> SlabId;

    /// Total length of the backing region.
    fn slab_len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An allocation primitive of shape `len -> handle`.
pub trait SlabAllocator {
    type Buf: SlabView;

    fn allocate(&self, len: usize) -> Self::Buf;
}

/// One backing region.
#[derive(Debug)]
pub struct Slab {
    bytes: RwLock<Box<[u8]>>,
    len: usize,
}

impl Slab {
    fn zeroed(len: usize) -> Arc<Self> {
        Arc::new(Self {
            bytes: RwLock::new(vec![0_u8; len].into_boxed_slice()),
            len,
        })
    }

    fn from_vec(bytes: Vec<u8>) -> Arc<Self> {
        let len = bytes.len();
        Arc::new(Self {
            bytes: RwLock::new(bytes.into_boxed_slice()),
            len,
        })
    }
}

/// A view `[offset, offset + len)` onto a shared slab.
///
/// Cloning produces another view of the same bytes; it keeps the slab alive
/// just like the view it was cloned from.
#[derive(Debug, Clone)]
pub struct SlabBuf {
    slab: Arc<Slab>,
    offset: usize,
    len: usize,
}

impl SlabBuf {
    /// A buffer that owns its own exactly-sized region.
    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            slab: Slab::from_vec(bytes),
            offset: 0,
            len,
        }
    }

    /// A zero-filled buffer that owns its own exactly-sized region.
    #[must_use]
    pub fn standalone(len: usize) -> Self {
        Self {
            slab: Slab::zeroed(len),
            offset: 0,
            len,
        }
    }

    /// Run `f` over the viewed bytes.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let bytes = self.slab.bytes.read();
        f(&bytes[self.offset..self.offset + self.len])
    }

    /// Run `f` over the viewed bytes, mutably. Other views of the same slab
    /// are blocked for the duration.
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut bytes = self.slab.bytes.write();
        f(&mut bytes[self.offset..self.offset + self.len])
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.read(<[u8]>::to_vec)
    }

    /// Sub-view `[start, end)` of this view, sharing the slab.
    #[must_use]
    pub fn slice(&self, start: usize, end: usize) -> Option<Self> {
        if start > end || end > self.len {
            return None;
        }
        Some(Self {
            slab: Arc::clone(&self.slab),
            offset: self.offset + start,
            len: end - start,
        })
    }

    /// Whether both views are backed by the same region.
    #[must_use]
    pub fn shares_slab_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slab, &other.slab)
    }

    /// Offset of this view inside its slab.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }
}

impl SlabView for SlabBuf {
    fn len(&self) -> usize {
        self.len
    }

    fn slab_id(&self) -> SlabId {
        SlabId(Arc::as_ptr(&self.slab).cast::<()>() as usize)
    }

    fn slab_len(&self) -> usize {
        self.slab.len
    }
}

#[derive(Debug, Default)]
struct PoolCursor {
    slab: Option<Arc<Slab>>,
    offset: usize,
}

/// Pooled "fast" allocator.
///
/// Requests below half the pool size are carved out of the current pool slab;
/// a fresh pool slab is started when the request no longer fits. Larger
/// requests, and every request when the pool size is 0, get their own region.
/// Bytes are zeroed on slab creation but carved views are not re-zeroed.
#[derive(Debug)]
pub struct SlabPool {
    pool_size: usize,
    cursor: Mutex<PoolCursor>,
}

impl SlabPool {
    #[must_use]
    pub fn new() -> Self {
        Self::with_pool_size(DEFAULT_POOL_SIZE)
    }

    /// A pool carving from slabs of `pool_size` bytes. `0` disables pooling.
    #[must_use]
    pub fn with_pool_size(pool_size: usize) -> Self {
        Self {
            pool_size,
            cursor: Mutex::new(PoolCursor::default()),
        }
    }

    #[must_use]
    pub const fn pool_size(&self) -> usize {
        self.pool_size
    }

    fn carve(&self, len: usize) -> SlabBuf {
        let mut cursor = self.cursor.lock();
        let remaining = self.pool_size.saturating_sub(cursor.offset);
        let slab = match &cursor.slab {
            Some(slab) if len <= remaining => Arc::clone(slab),
            _ => {
                let slab = Slab::zeroed(self.pool_size);
                cursor.slab = Some(Arc::clone(&slab));
                cursor.offset = 0;
                slab
            }
        };
        let offset = cursor.offset;
        cursor.offset = (offset + len).next_multiple_of(POOL_ALIGN);
        SlabBuf { slab, offset, len }
    }
}

impl Default for SlabPool {
    fn default() -> Self {
        Self::new()
    }
}

impl SlabAllocator for SlabPool {
    type Buf = SlabBuf;

    fn allocate(&self, len: usize) -> SlabBuf {
        if len == 0 || self.pool_size == 0 || len >= self.pool_size / 2 {
            return SlabBuf::standalone(len);
        }
        self.carve(len)
    }
}

impl<A: SlabAllocator + ?Sized> SlabAllocator for &A {
    type Buf = A::Buf;

    fn allocate(&self, len: usize) -> A::Buf {
        (**self).allocate(len)
    }
}

impl<A: SlabAllocator + ?Sized> SlabAllocator for Arc<A> {
    type Buf = A::Buf;

    fn allocate(&self, len: usize) -> A::Buf {
        (**self).allocate(len)
    }
}
