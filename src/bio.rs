//! Buffer cache.
//!
//! The buffer cache holds cached copies of disk block contents.
//! Caching disk blocks in memory reduces the number of disk reads and
//! also provides a synchronization point for blocks used by multiple
//! processes.
//!
//! Interface:
//! * To get a buffer for a particular disk block, call [`bread`].
//! * After changing buffer data, call [`bwrite`] to write it to disk.
//! * When done with the buffer, drop it (brelse).
//! * Only one process at a time can use a buffer, so do not keep them
//!   longer than necessary.
//!
//! Slot assignment (dev, blockno, refcnt) is guarded by the cache
//! spinlock; the block contents are guarded by a per-buffer
//! sleep-lock, held across disk I/O. A held [`Buf`] is the witness of
//! that sleep-lock.

use array_macro::array;

use crate::device::{self, DeviceId};
use crate::kernel::Kernel;
use crate::lock::{Sleeplock, Spinlock};
use crate::param::{BSIZE, NBUF};

pub struct Bcache {
    meta: Spinlock<BcacheMeta>,
    data: [Sleeplock<BufInner>; NBUF],
}

struct BcacheMeta {
    bufs: [BufMeta; NBUF],

    /// Monotonic use counter driving LRU recycling.
    tick: u64,
}

#[derive(Clone, Copy)]
struct BufMeta {
    dev: Option<DeviceId>,
    blockno: u32,
    refcnt: u32,
    last_use: u64,
}

pub struct BufInner {
    /// Has data been read from disk?
    valid: bool,

    data: [u8; BSIZE],
}

impl Bcache {
    pub fn new() -> Self {
        Self {
            meta: Spinlock::new(
                "bcache",
                BcacheMeta {
                    bufs: [BufMeta {
                        dev: None,
                        blockno: 0,
                        refcnt: 0,
                        last_use: 0,
                    }; NBUF],
                    tick: 0,
                },
            ),
            data: array![_ => Sleeplock::new("buffer", BufInner { valid: false, data: [0; BSIZE] }); NBUF],
        }
    }
}

impl Default for Bcache {
    fn default() -> Self {
        Self::new()
    }
}

/// A locked buffer: sleep-lock held, contents valid.
pub struct Buf<'k> {
    k: &'k Kernel,
    idx: usize,
    pub dev: DeviceId,
    pub blockno: u32,
}

impl Buf<'_> {
    pub fn data(&self) -> &[u8; BSIZE] {
        // SAFETY: this Buf witnesses the slot's sleep-lock.
        unsafe { &(*self.k.bcache.data[self.idx].get_mut_raw()).data }
    }

    pub fn data_mut(&mut self) -> &mut [u8; BSIZE] {
        // SAFETY: this Buf witnesses the slot's sleep-lock.
        unsafe { &mut (*self.k.bcache.data[self.idx].get_mut_raw()).data }
    }
}

impl Drop for Buf<'_> {
    /// Releases the buffer and moves it toward the LRU end.
    fn drop(&mut self) {
        // SAFETY: acquired in `bread`.
        unsafe { self.k.bcache.data[self.idx].unlock() };
        let mut meta = self.k.bcache.meta.lock();
        meta.tick += 1;
        let tick = meta.tick;
        let b = &mut meta.bufs[self.idx];
        assert!(b.refcnt > 0, "brelse");
        b.refcnt -= 1;
        b.last_use = tick;
    }
}

/// Looks the block up in the cache, recycling the least recently used
/// unreferenced slot on a miss. Returns the slot index with its
/// refcnt bumped.
fn bget(k: &Kernel, dev: DeviceId, blockno: u32) -> usize {
    let mut meta = k.bcache.meta.lock();
    meta.tick += 1;
    let tick = meta.tick;

    // Is the block already cached?
    for (i, b) in meta.bufs.iter_mut().enumerate() {
        if b.dev == Some(dev) && b.blockno == blockno {
            b.refcnt += 1;
            b.last_use = tick;
            return i;
        }
    }

    // Not cached; recycle the least recently used unreferenced buffer.
    let idx = meta
        .bufs
        .iter()
        .enumerate()
        .filter(|(_, b)| b.refcnt == 0)
        .min_by_key(|(_, b)| b.last_use)
        .map(|(i, _)| i)
        .expect("bget: no buffers");
    meta.bufs[idx] = BufMeta {
        dev: Some(dev),
        blockno,
        refcnt: 1,
        last_use: tick,
    };
    // SAFETY: refcnt was 0, so no thread holds this slot's sleep-lock
    // or a `Buf` for it.
    unsafe { (*k.bcache.data[idx].get_mut_raw()).valid = false };
    idx
}

/// Returns a locked buffer with the contents of the indicated block.
pub fn bread(k: &Kernel, dev: DeviceId, blockno: u32) -> Buf<'_> {
    let idx = bget(k, dev, blockno);
    // SAFETY: released in `Buf::drop`.
    unsafe { k.bcache.data[idx].acquire() };
    // SAFETY: sleep-lock held.
    let inner = unsafe { &mut *k.bcache.data[idx].get_mut_raw() };
    if !inner.valid {
        device::block_read(k, dev, blockno, &mut inner.data);
        inner.valid = true;
    }
    Buf {
        k,
        idx,
        dev,
        blockno,
    }
}

/// Writes the buffer's contents to disk. Caller still owns the buffer.
pub fn bwrite(k: &Kernel, b: &Buf<'_>) {
    device::block_write(k, b.dev, b.blockno, b.data());
}

/// Pins the buffer in the cache by bumping its refcnt. Used by the
/// log to keep dirty blocks resident until commit.
pub fn bpin(k: &Kernel, b: &Buf<'_>) {
    let mut meta = k.bcache.meta.lock();
    meta.bufs[b.idx].refcnt += 1;
}

/// Undoes a `bpin` by (dev, blockno); the block must still be cached.
pub fn bunpin(k: &Kernel, dev: DeviceId, blockno: u32) {
    let mut meta = k.bcache.meta.lock();
    let b = meta
        .bufs
        .iter_mut()
        .find(|b| b.dev == Some(dev) && b.blockno == blockno)
        .expect("bunpin: not cached");
    assert!(b.refcnt > 0, "bunpin");
    b.refcnt -= 1;
}

/// Drops every unreferenced cached block of `dev`. Called when a
/// device dies so a later device in the same slot cannot see stale
/// contents.
pub fn invalidate(k: &Kernel, dev: DeviceId) {
    let mut meta = k.bcache.meta.lock();
    for (i, b) in meta.bufs.iter_mut().enumerate() {
        if b.dev == Some(dev) && b.refcnt == 0 {
            b.dev = None;
            // SAFETY: refcnt is 0, so no holder of this slot exists.
            unsafe { (*k.bcache.data[i].get_mut_raw()).valid = false };
        }
    }
}
