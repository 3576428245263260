//! The filesystem layer.
//!
//! One object model (superblocks, inodes, devices, mounts) under
//! which the concrete filesystems plug in:
//!   + `native`: classic Unix-style block FS with a write-ahead log.
//!   + `obj`: inode namespace over a flat key/value object store.
//!   + `unionfs`: read-mostly overlay of N directory layers with
//!     copy-up on write.
//!   + `synth`: synthetic proc/cgroup trees.
//!
//! A [`VfsSuperblock`] slot binds one mounted filesystem instance to
//! its driver state and (if any) its device. Polymorphism is by
//! dispatch on the driver tag, the Rust rendition of the C-style
//! per-FS operation vectors: the superblock surface is
//! `alloc_inode`/`get_inode`/`start`/destroy-on-last-ref, the inode
//! surface lives on [`inode::InodeGuard`].

use core::mem;

use array_macro::array;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::kernel::Kernel;
use crate::lock::{Spinlock, SpinlockGuard};
use crate::param::NSUPERBLOCK;
use crate::{KernelError, Result};

pub mod inode;
pub mod namei;
pub mod native;
pub mod obj;
pub mod path;
pub mod stat;
pub mod synth;
pub mod unionfs;

use inode::{InodeRef, InodeType};

/// Root i-number of native-style filesystems.
pub const ROOTINO: u32 = 1;

/// Maximum length of a directory entry name.
pub const DIRSIZ: usize = 14;

/// Directory entry: a directory is a file whose content is a packed
/// sequence of these. Entry 0 is ".", entry 1 is "..". Free entries
/// have `inum == 0`.
#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy, Default)]
pub struct Dirent {
    pub inum: u16,
    name: [u8; DIRSIZ],
}

pub const DIRENT_SIZE: usize = mem::size_of::<Dirent>();
const_assert!(DIRENT_SIZE == 16);

impl Dirent {
    /// Fill in name. If name is shorter than DIRSIZ, a NUL terminator
    /// is appended.
    pub fn set_name(&mut self, name: &path::FileName) {
        let name = name.as_bytes();
        if name.len() == DIRSIZ {
            self.name.copy_from_slice(name);
        } else {
            self.name[..name.len()].copy_from_slice(name);
            self.name[name.len()] = 0;
        }
    }

    /// Returns the slice that exactly contains the stored name.
    pub fn get_name(&self) -> &path::FileName {
        let len = self.name.iter().position(|ch| *ch == 0).unwrap_or(DIRSIZ);
        path::FileName::from_bytes(&self.name[..len])
    }
}

/// Superblock table slot id.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SbId(pub usize);

/// Driver state of a mounted filesystem instance.
pub enum FsPrivate {
    None,
    Native(native::NativeFsState),
    Obj(obj::ObjFsState),
    Union(unionfs::UnionFsState),
    Synth(synth::SynthFsState),
}

/// In-memory superblock: driver state plus the root inode installed
/// by `start`. The slot's reference count lives beside it in the
/// table; the count is shared by every mount using the superblock and
/// conceptually by every cached inode pointing at it (those hold the
/// device alive instead, which owns the storage).
pub struct VfsSuperblock {
    pub fs: FsPrivate,
    pub root_ip: Option<InodeRef>,
}

impl VfsSuperblock {
    /// The device backing this filesystem, if it has one.
    pub fn dev(&self) -> Option<crate::device::DeviceId> {
        match &self.fs {
            FsPrivate::Native(st) => Some(st.dev),
            FsPrivate::Obj(st) => Some(st.dev),
            _ => None,
        }
    }
}

pub struct SbTable {
    refs: Spinlock<[u32; NSUPERBLOCK]>,
    slots: [Spinlock<VfsSuperblock>; NSUPERBLOCK],
}

impl SbTable {
    pub fn new() -> Self {
        Self {
            refs: Spinlock::new("sb_refs", [0; NSUPERBLOCK]),
            slots: array![_ => Spinlock::new("sb", VfsSuperblock {
                fs: FsPrivate::None,
                root_ip: None,
            }); NSUPERBLOCK],
        }
    }

    /// Locks and returns a superblock's in-memory state.
    pub fn inner(&self, sb: SbId) -> SpinlockGuard<'_, VfsSuperblock> {
        self.slots[sb.0].lock()
    }

    #[cfg(test)]
    pub(crate) fn refcnt(&self, sb: SbId) -> u32 {
        self.refs.lock()[sb.0]
    }
}

impl Default for SbTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocates a free superblock slot with one reference. The caller
/// initializes the driver state before the slot becomes reachable.
pub fn sballoc(k: &Kernel) -> Result<SbId> {
    let mut refs = k.superblocks.refs.lock();
    for (i, r) in refs.iter_mut().enumerate() {
        if *r == 0 {
            *r = 1;
            return Ok(SbId(i));
        }
    }
    Err(KernelError::NoMem)
}

pub fn sbdup(k: &Kernel, sb: SbId) -> SbId {
    let mut refs = k.superblocks.refs.lock();
    assert!(refs[sb.0] > 0, "sbdup: dead superblock");
    refs[sb.0] += 1;
    sb
}

/// Drops a superblock reference. The last one tears the filesystem
/// down: driver state is taken out of the slot first (so destruction
/// happens exactly once and with no table lock held), then the root
/// inode and any layer references are released. For device-backed
/// filesystems the device itself dies when its last cached inode
/// goes, not here.
pub fn sbput(k: &Kernel, sb: SbId) {
    {
        let mut refs = k.superblocks.refs.lock();
        assert!(refs[sb.0] > 0, "sbput");
        if refs[sb.0] > 1 {
            refs[sb.0] -= 1;
            return;
        }
    }

    let (fs, root_ip) = {
        let mut inner = k.superblocks.inner(sb);
        (
            mem::replace(&mut inner.fs, FsPrivate::None),
            inner.root_ip.take(),
        )
    };

    if let Some(root) = root_ip {
        root.put(k);
    }
    match fs {
        FsPrivate::Union(state) => {
            for layer in state.layers {
                layer.put(k);
            }
        }
        // Dropping native state drops its log and geometry.
        FsPrivate::Native(_) | FsPrivate::Obj(_) | FsPrivate::Synth(_) | FsPrivate::None => {}
    }

    let mut refs = k.superblocks.refs.lock();
    refs[sb.0] -= 1;
    assert_eq!(refs[sb.0], 0, "sbput: ref gained during destroy");
}

/// The driver tag of a superblock, read with its slot lock held and
/// used with the lock released (driver entry points relock as they
/// need).
#[derive(Clone, Copy)]
enum Driver {
    Native,
    Obj,
    Union,
    Synth,
}

fn driver_of(k: &Kernel, sb: SbId) -> Driver {
    match &k.superblocks.inner(sb).fs {
        FsPrivate::Native(_) => Driver::Native,
        FsPrivate::Obj(_) => Driver::Obj,
        FsPrivate::Union(_) => Driver::Union,
        FsPrivate::Synth(_) => Driver::Synth,
        FsPrivate::None => panic!("dead superblock"),
    }
}

impl SbId {
    /// Allocates an inode on this filesystem, marked with `typ`.
    /// Returns an unlocked but allocated and referenced inode.
    pub fn alloc_inode(self, k: &Kernel, typ: InodeType) -> Result<InodeRef> {
        match driver_of(k, self) {
            Driver::Native => native::ialloc(k, self, typ),
            Driver::Obj => obj::ialloc(k, self, typ),
            Driver::Union => unionfs::ialloc(k, self, typ),
            Driver::Synth => Err(KernelError::Inval),
        }
    }

    /// Finds the inode with number `inum` on this filesystem and
    /// returns its in-memory copy without locking it or reading it
    /// from the store.
    pub fn get_inode(self, k: &Kernel, inum: u32) -> InodeRef {
        match driver_of(k, self) {
            Driver::Native => native::iget(k, self, inum),
            Driver::Obj => obj::iget(k, self, inum),
            Driver::Synth => synth::iget(k, self, inum),
            Driver::Union => panic!("get_inode on union fs"),
        }
    }

    /// Brings the filesystem up after its first mount: reads on-store
    /// metadata, recovers the log, installs the root inode. Runs once
    /// per superblock, in user context.
    pub(crate) fn start(self, k: &Kernel) {
        match driver_of(k, self) {
            Driver::Native => native::fsstart(k, self),
            Driver::Obj => obj::fsstart(k, self),
            Driver::Union => unionfs::fsstart(k, self),
            Driver::Synth => synth::fsstart(k, self),
        }
    }

    /// Snapshot of the root inode installed by `start`.
    pub fn root_ip(self, k: &Kernel) -> Option<InodeRef> {
        k.superblocks.inner(self).root_ip
    }
}
