//! Inodes.
//!
//! An inode describes a single unnamed file. Every filesystem driver
//! keeps a cache of in-use inodes in memory to provide a place for
//! synchronizing access to inodes used by multiple processes. The
//! cached inodes include book-keeping information that is not stored
//! on the backing store: the reference count and the valid flag.
//!
//! An inode and its in-memory representation go through a sequence of
//! states before they can be used by the rest of the file system code:
//!
//! * Allocation: an inode is allocated if its type (on the backing
//!   store) is non-zero. The superblock's `alloc_inode` allocates, and
//!   `put` frees if the reference and link counts have fallen to zero.
//!
//! * Referencing in cache: an entry in a cache is free if its refcnt
//!   is zero. Otherwise the refcnt tracks the number of in-memory
//!   pointers to the entry (open files, current directories, mount
//!   anchors). `iget` finds or creates a cache entry and increments
//!   its ref; `put` decrements it.
//!
//! * Valid: the information (type, size, &c) in a cache entry is only
//!   correct when `valid` is set. `lock` reads the inode from the
//!   backing store and sets `valid`, while `put` clears `valid` when
//!   the refcnt falls to zero.
//!
//! * Locked: file system code may only examine and modify the
//!   information in an inode and its content if it has first locked
//!   the inode. The lock witness is [`InodeGuard`].
//!
//! Thus a typical sequence is:
//!   let ip = sb.get_inode(k, inum);
//!   let g = ip.lock(k);
//!   ... examine and modify through g ...
//!   drop(g);            // iunlock
//!   ip.put(k);          // iput
//!
//! `lock` is separate from `iget` so that system calls can keep a
//! long-term reference to an inode (as for an open file) and only lock
//! it for short periods (e.g., in read). The separation also helps
//! avoid deadlock and races during pathname lookup.
//!
//! The cache spinlock protects refcnt and the (superblock, inum)
//! identity of each slot; one must hold it to use any of those fields.
//! The per-inode sleep-lock protects everything else (valid, type,
//! size, nlink, driver-private data), and is legal to hold across disk
//! I/O.
//!
//! Lock order note: `iget` takes its extra device reference after the
//! cache lock is released, keeping the device-table-before-inode-cache
//! order of the rest of the kernel.

use array_macro::array;

use super::path::FileName;
use super::stat::Stat;
use super::SbId;
use crate::device::DeviceId;
use crate::fs::{native, obj, synth, unionfs};
use crate::kernel::Kernel;
use crate::lock::{Sleeplock, Spinlock};
use crate::param::NINODE;
use crate::Result;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InodeType {
    None,
    Dir,
    File,
    Device { major: u16, minor: u16 },
}

/// Identity and liveness of one cache slot, guarded by the cache
/// spinlock.
#[derive(Clone, Copy, Debug)]
pub struct InodeMeta {
    pub refcnt: u32,
    pub sb: Option<SbId>,
    pub inum: u32,

    /// The device whose reference this slot holds, recorded at claim
    /// time so teardown does not depend on superblock state that may
    /// already be destroyed.
    pub dev: Option<DeviceId>,
}

/// Cached copy of an inode, guarded by the slot's sleep-lock.
pub struct InodeInner<P> {
    /// Has the inode been read from the backing store?
    pub valid: bool,
    pub typ: InodeType,
    pub nlink: i16,
    pub size: u32,

    /// Driver-private part (block addresses, union layers, ...).
    pub private: P,
}

impl<P: Default> Default for InodeInner<P> {
    fn default() -> Self {
        Self {
            valid: false,
            typ: InodeType::None,
            nlink: 0,
            size: 0,
            private: P::default(),
        }
    }
}

/// A bounded inode cache. Each concrete filesystem driver owns one,
/// typed by its private inode payload.
pub struct InodeCache<P> {
    meta: Spinlock<[InodeMeta; NINODE]>,
    data: [Sleeplock<InodeInner<P>>; NINODE],
}

impl<P: Default> InodeCache<P> {
    pub fn new() -> Self {
        Self {
            meta: Spinlock::new(
                "icache",
                [InodeMeta {
                    refcnt: 0,
                    sb: None,
                    inum: 0,
                    dev: None,
                }; NINODE],
            ),
            data: array![_ => Sleeplock::new("inode", InodeInner::default()); NINODE],
        }
    }

    /// Finds the slot caching `(sb, inum)` and bumps its ref, or
    /// claims the first free slot for it. Returns the slot index and
    /// whether it was newly claimed (the caller then owes the owning
    /// device a reference, which `dev` records for teardown).
    pub fn get(&self, sb: SbId, inum: u32, dev: Option<DeviceId>) -> (usize, bool) {
        let mut meta = self.meta.lock();

        let mut empty = None;
        let mut hit = None;
        for (i, m) in meta.iter().enumerate() {
            if m.refcnt > 0 && m.sb == Some(sb) && m.inum == inum {
                hit = Some(i);
                break;
            }
            if empty.is_none() && m.refcnt == 0 {
                empty = Some(i);
            }
        }
        if let Some(i) = hit {
            meta[i].refcnt += 1;
            return (i, false);
        }

        // Recycle a cache entry.
        let i = empty.expect("iget: no inodes");
        meta[i] = InodeMeta {
            refcnt: 1,
            sb: Some(sb),
            inum,
            dev,
        };
        // SAFETY: refcnt was 0, so no thread holds this slot's
        // sleep-lock or a reference to it.
        unsafe { (*self.data[i].get_mut_raw()).valid = false };
        (i, true)
    }

    /// Claims a free slot with a synthetic identity (slot index as
    /// inum). Used by drivers whose inodes have no stable on-store
    /// number, e.g. merged union directories.
    pub fn alloc_slot(&self, sb: SbId) -> usize {
        let mut meta = self.meta.lock();
        let i = meta
            .iter()
            .position(|m| m.refcnt == 0)
            .expect("iget: no inodes");
        meta[i] = InodeMeta {
            refcnt: 1,
            sb: Some(sb),
            inum: i as u32,
            dev: None,
        };
        // SAFETY: refcnt was 0; no holder exists.
        unsafe { (*self.data[i].get_mut_raw()).valid = false };
        i
    }

    pub fn dup(&self, idx: usize) {
        let mut meta = self.meta.lock();
        assert!(meta[idx].refcnt > 0, "idup: dead inode");
        meta[idx].refcnt += 1;
    }

    /// Snapshot of a slot's identity.
    pub fn meta_at(&self, idx: usize) -> InodeMeta {
        self.meta.lock()[idx]
    }

    /// Decrements a slot's refcnt, returning the new value.
    pub fn put_ref(&self, idx: usize) -> u32 {
        let mut meta = self.meta.lock();
        assert!(meta[idx].refcnt > 0, "iput");
        meta[idx].refcnt -= 1;
        meta[idx].refcnt
    }

    /// Acquires the slot's sleep-lock without a lexical guard.
    ///
    /// # Safety
    ///
    /// Must be paired with [`InodeCache::unlock_slot`].
    pub unsafe fn lock_slot(&self, idx: usize) {
        self.data[idx].acquire();
    }

    /// # Safety
    ///
    /// The slot's sleep-lock must be held by this thread.
    pub unsafe fn unlock_slot(&self, idx: usize) {
        self.data[idx].unlock();
    }

    /// Raw pointer to a slot's inner data.
    ///
    /// # Safety of use
    ///
    /// Dereference only while holding the slot's sleep-lock, or while
    /// being the sole owner of a freshly claimed slot.
    pub fn inner_raw(&self, idx: usize) -> *mut InodeInner<P> {
        self.data[idx].get_mut_raw()
    }
}

impl<P: Default> Default for InodeCache<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// A reference to a cached inode: which driver's cache, and which
/// slot. Holding one implies a share of the slot's refcnt; every copy
/// handed out must come from `dup` (or from an operation documented
/// to return a referenced inode) and must be returned with `put`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum InodeRef {
    Native(usize),
    Obj(usize),
    Union(usize),
    Synth(usize),
}

/// Runs `$body` with `$cache`/`$idx` bound to the concrete cache and
/// slot of `$ip`. Each arm monomorphizes over that cache's payload.
macro_rules! with_cache {
    ($k:expr, $ip:expr, $cache:ident, $idx:ident => $body:expr) => {
        match $ip {
            InodeRef::Native($idx) => {
                let $cache = &$k.itable;
                $body
            }
            InodeRef::Obj($idx) => {
                let $cache = &$k.obj_itable;
                $body
            }
            InodeRef::Union($idx) => {
                let $cache = &$k.union_itable;
                $body
            }
            InodeRef::Synth($idx) => {
                let $cache = &$k.synth_itable;
                $body
            }
        }
    };
}

impl InodeRef {
    /// Increments the reference count. Returns itself to enable the
    /// `let ip2 = ip.dup(k)` idiom.
    pub fn dup(self, k: &Kernel) -> InodeRef {
        with_cache!(k, self, cache, idx => cache.dup(idx));
        self
    }

    /// Drops a reference to an in-memory inode.
    ///
    /// If that was the last reference, the cache entry can be
    /// recycled; if additionally the inode has no links to it, the
    /// driver frees the inode and its content on the backing store,
    /// and the entry's share of the owning device is released.
    pub fn put(self, k: &Kernel) {
        match self {
            InodeRef::Native(idx) => native::iput(k, idx),
            InodeRef::Obj(idx) => obj::iput(k, idx),
            InodeRef::Union(idx) => unionfs::iput(k, idx),
            InodeRef::Synth(idx) => synth::iput(k, idx),
        }
    }

    /// Locks the inode, reading it from the backing store if
    /// necessary.
    pub fn lock(self, k: &Kernel) -> InodeGuard<'_> {
        assert!(self.meta(k).refcnt >= 1, "ilock");
        with_cache!(k, self, cache, idx =>
            // SAFETY: released in `InodeGuard::drop`.
            unsafe { cache.lock_slot(idx) });
        match self {
            InodeRef::Native(idx) => native::ilock_load(k, idx),
            InodeRef::Obj(idx) => obj::ilock_load(k, idx),
            InodeRef::Union(idx) => unionfs::ilock_load(k, idx),
            InodeRef::Synth(idx) => synth::ilock_load(k, idx),
        }
        InodeGuard { k, ip: self }
    }

    pub fn meta(self, k: &Kernel) -> InodeMeta {
        with_cache!(k, self, cache, idx => cache.meta_at(idx))
    }

    /// The superblock this inode belongs to.
    pub fn sb(self, k: &Kernel) -> SbId {
        self.meta(k).sb.expect("inode without superblock")
    }
}

/// Witness that the inode's sleep-lock is held by the current thread.
/// Unlocks on drop; `unlockput` also drops the caller's reference.
pub struct InodeGuard<'k> {
    pub(crate) k: &'k Kernel,
    pub ip: InodeRef,
}

/// Runs `$body` with `$inner` bound to the guard's locked
/// `InodeInner`. The guard itself is the safety witness.
macro_rules! with_inner {
    ($g:expr, $inner:ident => $e:expr) => {
        with_cache!($g.k, $g.ip, cache, idx => {
            // SAFETY: `$g` witnesses that the sleep-lock is held.
            let $inner = unsafe { &mut *cache.inner_raw(idx) };
            $e
        })
    };
}

impl Drop for InodeGuard<'_> {
    /// iunlock.
    fn drop(&mut self) {
        with_cache!(self.k, self.ip, cache, idx =>
            // SAFETY: acquired in `InodeRef::lock`.
            unsafe { cache.unlock_slot(idx) });
    }
}

impl InodeGuard<'_> {
    /// Common idiom: unlock, then put.
    pub fn unlockput(self) {
        let k = self.k;
        let ip = self.ip;
        drop(self);
        ip.put(k);
    }

    pub fn typ(&self) -> InodeType {
        with_inner!(self, inner => inner.typ)
    }

    pub fn size(&self) -> u32 {
        with_inner!(self, inner => inner.size)
    }

    pub fn nlink(&self) -> i16 {
        with_inner!(self, inner => inner.nlink)
    }

    pub fn set_nlink(&mut self, nlink: i16) {
        with_inner!(self, inner => inner.nlink = nlink);
    }

    /// Copies the cached metadata back to the backing store. Must be
    /// called after every change to a field that lives there.
    pub fn update(&mut self) {
        match self.ip {
            InodeRef::Native(idx) => native::iupdate(self.k, idx),
            InodeRef::Obj(idx) => obj::iupdate(self.k, idx),
            InodeRef::Union(idx) => unionfs::iupdate(self.k, idx),
            InodeRef::Synth(_) => {}
        }
    }

    /// Reads data from the inode into `dst`, starting at byte `off`.
    /// Returns the number of bytes read, clamped to the file length.
    pub fn readi(&mut self, off: u32, dst: &mut [u8]) -> Result<usize> {
        match self.ip {
            InodeRef::Native(idx) => native::readi(self.k, idx, off, dst),
            InodeRef::Obj(idx) => obj::readi(self.k, idx, off, dst),
            InodeRef::Union(idx) => unionfs::readi(self.k, idx, off, dst),
            InodeRef::Synth(idx) => synth::readi(self.k, idx, off, dst),
        }
    }

    /// Writes `src` into the inode at byte `off`, growing the file as
    /// needed. Returns the number of bytes written.
    pub fn writei(&mut self, src: &[u8], off: u32) -> Result<usize> {
        match self.ip {
            InodeRef::Native(idx) => native::writei(self.k, idx, src, off),
            InodeRef::Obj(idx) => obj::writei(self.k, idx, src, off),
            InodeRef::Union(idx) => unionfs::writei(self.k, idx, src, off),
            InodeRef::Synth(idx) => synth::writei(self.k, idx, src, off),
        }
    }

    pub fn stat(&self) -> Stat {
        match self.ip {
            InodeRef::Native(idx) => native::stati(self.k, idx),
            InodeRef::Obj(idx) => obj::stati(self.k, idx),
            InodeRef::Union(idx) => unionfs::stati(self.k, idx),
            InodeRef::Synth(idx) => synth::stati(self.k, idx),
        }
    }

    /// Looks for a directory entry in this directory. If found,
    /// returns a referenced inode and the byte offset of the entry.
    pub fn dirlookup(&mut self, name: &FileName) -> Result<(InodeRef, u32)> {
        assert_eq!(self.typ(), InodeType::Dir, "dirlookup not DIR");
        match self.ip {
            InodeRef::Native(idx) => native::dirlookup(self.k, idx, name),
            InodeRef::Obj(idx) => obj::dirlookup(self.k, idx, name),
            InodeRef::Union(idx) => unionfs::dirlookup(self.k, idx, name),
            InodeRef::Synth(idx) => synth::dirlookup(self.k, idx, name),
        }
    }

    /// Writes a new directory entry (`name` -> `ip`) into this
    /// directory.
    pub fn dirlink(&mut self, name: &FileName, ip: InodeRef) -> Result<()> {
        assert_eq!(self.typ(), InodeType::Dir, "dirlink not DIR");
        match self.ip {
            InodeRef::Native(idx) => native::dirlink(self.k, idx, name, ip),
            InodeRef::Obj(idx) => obj::dirlink(self.k, idx, name, ip),
            InodeRef::Union(idx) => unionfs::dirlink(self.k, idx, name, ip),
            InodeRef::Synth(idx) => synth::dirlink(self.k, idx, name, ip),
        }
    }

    /// Is the directory empty except for "." and ".." ?
    pub fn is_dir_empty(&mut self) -> bool {
        assert_eq!(self.typ(), InodeType::Dir, "isdirempty not DIR");
        match self.ip {
            InodeRef::Native(idx) => native::is_dir_empty(self.k, idx),
            InodeRef::Obj(idx) => obj::is_dir_empty(self.k, idx),
            InodeRef::Union(idx) => unionfs::is_dir_empty(self.k, idx),
            InodeRef::Synth(_) => false,
        }
    }

    /// Discards the inode's contents.
    pub fn truncate(&mut self) {
        match self.ip {
            InodeRef::Native(idx) => native::itrunc_logged(self.k, idx),
            InodeRef::Obj(idx) => obj::itrunc(self.k, idx),
            InodeRef::Union(idx) => unionfs::itrunc(self.k, idx),
            InodeRef::Synth(_) => panic!("truncate on synthetic fs"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_finds_then_recycles() {
        let cache: InodeCache<()> = InodeCache::new();

        let (a, fresh) = cache.get(SbId(0), 7, None);
        assert!(fresh);
        let (b, fresh) = cache.get(SbId(0), 7, None);
        assert!(!fresh);
        assert_eq!(a, b);
        assert_eq!(cache.meta_at(a).refcnt, 2);

        // A different identity lands elsewhere.
        let (c, fresh) = cache.get(SbId(1), 7, None);
        assert!(fresh);
        assert_ne!(a, c);

        assert_eq!(cache.put_ref(a), 1);
        assert_eq!(cache.put_ref(a), 0);
        // The slot is recyclable now.
        let (d, fresh) = cache.get(SbId(2), 1, None);
        assert!(fresh);
        assert_eq!(d, a);
    }

    #[test]
    fn refs_are_conserved_across_dup_put() {
        let cache: InodeCache<()> = InodeCache::new();
        let (i, _) = cache.get(SbId(0), 1, None);
        cache.dup(i);
        cache.dup(i);
        assert_eq!(cache.meta_at(i).refcnt, 3);
        assert_eq!(cache.put_ref(i), 2);
        assert_eq!(cache.put_ref(i), 1);
        assert_eq!(cache.put_ref(i), 0);
    }

    #[test]
    #[should_panic(expected = "iget: no inodes")]
    fn cache_exhaustion_is_fatal() {
        let cache: InodeCache<()> = InodeCache::new();
        for inum in 0..=crate::param::NINODE as u32 {
            cache.get(SbId(0), inum, None);
        }
    }
}
