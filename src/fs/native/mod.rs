//! The native file system: a classic Unix-style block FS.
//!
//! Five layers:
//!   + Blocks: bitmap allocator for raw disk blocks.
//!   + Log: crash recovery for multi-step updates (`log`).
//!   + Files: inode allocator, reading, writing, metadata (`inode`).
//!   + Directories: inodes with special contents (lists of dirents).
//!   + Names: handled one level up by the path resolver.
//!
//! Disk layout:
//! [ boot block | super block | log | inode blocks |
//!                                          free bit map | data blocks]
//!
//! mkfs computes the super block and builds an initial file system;
//! the super block describes the disk layout.

use core::mem;

use spin::Once;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::bio;
use crate::device::{DeviceId, DeviceKind};
use crate::fs::{FsPrivate, SbId, ROOTINO};
use crate::kernel::Kernel;
use crate::lock::Sleepablelock;
use crate::param::BSIZE;

mod inode;
mod log;

pub use self::inode::{
    dirlink, dirlookup, ialloc, iget, ilock_load, iput, is_dir_empty, itrunc_logged, iupdate,
    readi, stati, writei, NativePayload,
};
pub use self::log::{Log, Tx};

pub const NDIRECT: usize = 12;
pub const NINDIRECT: usize = BSIZE / mem::size_of::<u32>();
pub const MAXFILE: usize = NDIRECT + NINDIRECT;

/// On-disk superblock, at block 1.
#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy, Default, Debug)]
pub struct NativeSuperblock {
    /// Size of file system image (blocks)
    pub size: u32,

    /// Number of data blocks
    pub nblocks: u32,

    /// Number of inodes
    pub ninodes: u32,

    /// Number of log blocks
    pub nlog: u32,

    /// Block number of first log block
    pub logstart: u32,

    /// Block number of first inode block
    pub inodestart: u32,

    /// Block number of first free map block
    pub bmapstart: u32,
}

/// On-disk inode structure.
#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy, Default)]
pub struct Dinode {
    /// File type; 0 marks a free inode slot.
    pub typ: i16,

    /// Major device number (device files only)
    pub major: i16,

    /// Minor device number (device files only)
    pub minor: i16,

    /// Number of links to inode in file system
    pub nlink: i16,

    /// Size of file (bytes)
    pub size: u32,

    /// Data block addresses; the last is a single indirect block.
    pub addrs: [u32; NDIRECT + 1],
}

pub const DINODE_SIZE: usize = mem::size_of::<Dinode>();

/// Inodes per block.
pub const IPB: usize = BSIZE / DINODE_SIZE;
const_assert!(BSIZE % DINODE_SIZE == 0);

/// Bitmap bits per block.
pub const BPB: u32 = (BSIZE * 8) as u32;

impl NativeSuperblock {
    /// Block containing inode i.
    pub fn iblock(&self, i: u32) -> u32 {
        i / IPB as u32 + self.inodestart
    }

    /// Block of free map containing bit for block b.
    pub fn bblock(&self, b: u32) -> u32 {
        b / BPB + self.bmapstart
    }
}

/// Driver state of one mounted native filesystem.
pub struct NativeFsState {
    pub dev: DeviceId,

    /// Geometry and log, brought up once by `fsstart` in user
    /// context.
    vol: Once<Box<NativeVolume>>,
}

pub struct NativeVolume {
    pub dev: DeviceId,
    pub sb: NativeSuperblock,

    /// None on loop-backed filesystems, which run logless: their
    /// blocks are already journaled by the filesystem holding the
    /// backing file.
    pub log: Option<Sleepablelock<Log>>,
}

/// Binds a fresh superblock slot to `dev` as a native filesystem.
/// The heavy lifting waits for `fsstart`.
pub fn fsinit(k: &Kernel, sb: SbId, dev: DeviceId) {
    let mut inner = k.superblocks.inner(sb);
    inner.fs = FsPrivate::Native(NativeFsState {
        dev,
        vol: Once::new(),
    });
    inner.root_ip = None;
}

/// Reads the on-disk superblock.
pub fn readsb(k: &Kernel, dev: DeviceId) -> NativeSuperblock {
    let bp = bio::bread(k, dev, 1);
    NativeSuperblock::read_from_prefix(&bp.data()[..]).unwrap()
}

/// Brings the filesystem up: reads the superblock, recovers the log,
/// installs the root inode. Must run from process context (sleeps).
pub fn fsstart(k: &Kernel, sb: SbId) {
    let dev = state_dev(k, sb);
    let sbdisk = readsb(k, dev);
    assert!(sbdisk.size > 0, "fsstart: unformatted device");

    let log = match k.devices.kind(dev) {
        DeviceKind::Loop { .. } => None,
        _ => Some(Sleepablelock::new(
            "log",
            Log::new(k, dev, sbdisk.logstart, sbdisk.nlog),
        )),
    };
    let vol = Box::new(NativeVolume {
        dev,
        sb: sbdisk,
        log,
    });

    {
        let inner = k.superblocks.inner(sb);
        match &inner.fs {
            FsPrivate::Native(st) => {
                let mut set = false;
                st.vol.call_once(|| {
                    set = true;
                    vol
                });
                assert!(set, "fsstart: started twice");
            }
            _ => panic!("fsstart: not a native fs"),
        }
    }

    let root = iget(k, sb, ROOTINO);
    k.superblocks.inner(sb).root_ip = Some(root);
}

/// The device of a native superblock.
pub(crate) fn state_dev(k: &Kernel, sb: SbId) -> DeviceId {
    match &k.superblocks.inner(sb).fs {
        FsPrivate::Native(st) => st.dev,
        _ => panic!("not a native fs"),
    }
}

/// The started volume (geometry + log) of a native superblock.
///
/// The returned reference points into the boxed volume, which lives
/// until the superblock's last reference is dropped; callers hold a
/// superblock reference, directly or through a cached inode.
pub(crate) fn volume<'k>(k: &'k Kernel, sb: SbId) -> &'k NativeVolume {
    let inner = k.superblocks.inner(sb);
    let vol: *const NativeVolume = match &inner.fs {
        FsPrivate::Native(st) => &**st.vol.get().expect("native fs not started"),
        _ => panic!("not a native fs"),
    };
    drop(inner);
    // SAFETY: see above; the box is not dropped while the superblock
    // is referenced.
    unsafe { &*vol }
}

// Blocks.

impl Tx<'_> {
    /// Zero a block.
    fn bzero(&self, bno: u32) {
        let mut bp = bio::bread(self.kernel(), self.dev(), bno);
        bp.data_mut().fill(0);
        self.write(bp);
    }

    /// Allocate a zeroed disk block.
    pub fn balloc(&self) -> u32 {
        let sb = self.geometry();
        let mut b = 0;
        while b < sb.size {
            let mut bp = bio::bread(self.kernel(), self.dev(), sb.bblock(b));
            let mut bi = 0;
            while bi < BPB && b + bi < sb.size {
                let m = 1u8 << (bi % 8);
                if bp.data()[(bi / 8) as usize] & m == 0 {
                    // Is block free?
                    bp.data_mut()[(bi / 8) as usize] |= m; // Mark block in use.
                    self.write(bp);
                    self.bzero(b + bi);
                    return b + bi;
                }
                bi += 1;
            }
            drop(bp);
            b += BPB;
        }
        panic!("balloc: out of blocks");
    }

    /// Free a disk block.
    pub fn bfree(&self, b: u32) {
        let sb = self.geometry();
        let mut bp = bio::bread(self.kernel(), self.dev(), sb.bblock(b));
        let bi = b % BPB;
        let m = 1u8 << (bi % 8);
        assert_ne!(
            bp.data()[(bi / 8) as usize] & m,
            0,
            "freeing free block"
        );
        bp.data_mut()[(bi / 8) as usize] &= !m;
        self.write(bp);
    }
}
