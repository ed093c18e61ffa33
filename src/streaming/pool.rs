//! Tiered buffer pool for frame encoding and stream parsing.
//!
//! Five fixed size classes, each backed by a bounded lock-free queue of idle
//! buffers. `allocate` picks the smallest class whose capacity covers the
//! request; requests larger than the biggest class get an exact-size buffer
//! that is never pooled.
//!
//! ```ignore
//! let pool = BufferPool::shared();
//!
//! let mut buf = pool.lease(payload.len() + 4);
//! buf[..4].copy_from_slice(&len.to_le_bytes());
//! // ... buf goes back to its tier on drop
//! ```

use crossbeam::queue::ArrayQueue;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

pub const MICRO_BUFFER_SIZE: usize = KIB / 2;
pub const SMALL_BUFFER_SIZE: usize = 4 * KIB;
pub const REGULAR_BUFFER_SIZE: usize = 64 * KIB;
pub const BIG_BUFFER_SIZE: usize = 512 * KIB;
pub const HUGE_BUFFER_SIZE: usize = 4 * MIB;

static SHARED_POOL: OnceLock<Arc<BufferPool>> = OnceLock::new();

/// Fixed capacity bucket of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeClass {
    Micro,
    Small,
    Regular,
    Big,
    Huge,
}

impl SizeClass {
    /// All classes, smallest first.
    pub const ALL: [SizeClass; 5] = [
        SizeClass::Micro,
        SizeClass::Small,
        SizeClass::Regular,
        SizeClass::Big,
        SizeClass::Huge,
    ];

    pub const fn capacity(self) -> usize {
        match self {
            SizeClass::Micro => MICRO_BUFFER_SIZE,
            SizeClass::Small => SMALL_BUFFER_SIZE,
            SizeClass::Regular => REGULAR_BUFFER_SIZE,
            SizeClass::Big => BIG_BUFFER_SIZE,
            SizeClass::Huge => HUGE_BUFFER_SIZE,
        }
    }

    /// Maximum number of idle buffers retained for this class.
    pub const fn max_pooled(self) -> usize {
        match self {
            SizeClass::Micro | SizeClass::Small | SizeClass::Regular => 100,
            SizeClass::Big => 50,
            SizeClass::Huge => 30,
        }
    }

    /// Smallest class whose capacity is at least `min_size`.
    pub fn for_size(min_size: usize) -> Option<SizeClass> {
        Self::ALL.into_iter().find(|c| min_size <= c.capacity())
    }

    const fn index(self) -> usize {
        match self {
            SizeClass::Micro => 0,
            SizeClass::Small => 1,
            SizeClass::Regular => 2,
            SizeClass::Big => 3,
            SizeClass::Huge => 4,
        }
    }
}

/// Counters for pool monitoring
#[derive(Debug, Default)]
pub struct BufferPoolMetrics {
    /// Buffer reused from a tier
    pub hits: AtomicU64,

    /// Tier was empty, fresh buffer allocated
    pub misses: AtomicU64,

    /// Request above the largest tier, exact-size buffer allocated
    pub oversized: AtomicU64,

    /// Buffers retained on free
    pub returns: AtomicU64,

    /// Buffers discarded on free (tier full, oversized, or not a tier size)
    pub drops: AtomicU64,
}

impl BufferPoolMetrics {
    pub const fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            oversized: AtomicU64::new(0),
            returns: AtomicU64::new(0),
            drops: AtomicU64::new(0),
        }
    }

    #[inline]
    fn record(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            oversized: self.oversized.load(Ordering::Relaxed),
            returns: self.returns.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub oversized: u64,
    pub returns: u64,
    pub drops: u64,
}

impl MetricsSnapshot {
    /// Hit rate over tiered allocations (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            1.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Tiered pool of reusable byte buffers, safe to share across operations.
pub struct BufferPool {
    tiers: [ArrayQueue<Vec<u8>>; 5],
    metrics: BufferPoolMetrics,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            tiers: SizeClass::ALL.map(|c| ArrayQueue::new(c.max_pooled())),
            metrics: BufferPoolMetrics::new(),
        }
    }

    /// Process-wide pool shared by every operation and parser.
    pub fn shared() -> Arc<BufferPool> {
        Arc::clone(SHARED_POOL.get_or_init(|| Arc::new(BufferPool::new())))
    }

    /// Get a buffer whose length is at least `min_size`.
    ///
    /// The returned length is the tier capacity, or exactly `min_size` when
    /// the request is larger than every tier.
    pub fn allocate(&self, min_size: usize) -> Vec<u8> {
        let Some(class) = SizeClass::for_size(min_size) else {
            BufferPoolMetrics::record(&self.metrics.oversized);
            return vec![0u8; min_size];
        };

        match self.tiers[class.index()].pop() {
            Some(buf) => {
                BufferPoolMetrics::record(&self.metrics.hits);
                buf
            }
            None => {
                BufferPoolMetrics::record(&self.metrics.misses);
                vec![0u8; class.capacity()]
            }
        }
    }

    /// Return a buffer obtained from `allocate`.
    ///
    /// The tier is derived from the buffer length. The buffer must have come
    /// from this pool unmodified in length; buffers that do not match a tier
    /// capacity exactly are discarded rather than filed under the wrong tier.
    pub fn free(&self, buf: Vec<u8>) {
        let class = match SizeClass::for_size(buf.len()) {
            Some(class) if class.capacity() == buf.len() => class,
            _ => {
                BufferPoolMetrics::record(&self.metrics.drops);
                return;
            }
        };

        match self.tiers[class.index()].push(buf) {
            Ok(()) => BufferPoolMetrics::record(&self.metrics.returns),
            Err(_) => BufferPoolMetrics::record(&self.metrics.drops),
        }
    }

    /// Allocate a buffer that returns itself to this pool when dropped.
    pub fn lease(self: &Arc<Self>, min_size: usize) -> PooledBuffer {
        PooledBuffer {
            buf: Some(self.allocate(min_size)),
            pool: Arc::clone(self),
        }
    }

    /// Idle buffers currently held by a tier
    pub fn available(&self, class: SizeClass) -> usize {
        self.tiers[class.index()].len()
    }

    pub fn metrics(&self) -> &BufferPoolMetrics {
        &self.metrics
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped pool buffer; freed back to its pool exactly once, on drop.
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// Usable length (tier capacity, or the exact size for oversized requests)
    pub fn capacity(&self) -> usize {
        self.len()
    }

    /// Tier this buffer belongs to, `None` for one-off oversized buffers.
    pub fn size_class(&self) -> Option<SizeClass> {
        SizeClass::for_size(self.len()).filter(|c| c.capacity() == self.len())
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.free(buf);
        }
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("capacity", &self.capacity())
            .field("size_class", &self.size_class())
            .finish()
    }
}
