//! The kernel state: every table the VFS core needs, in one value
//! passed explicitly to every operation.
//!
//! Initialization order matters: device table, then the mount
//! namespace table (with the initial namespace), then the per-driver
//! inode caches; the root mount is installed by `mount_root`, and the
//! root filesystem's log is recovered there, in the first "user
//! context" call.

use array_macro::array;

use crate::bio::Bcache;
use crate::device::{self, Devices};
use crate::fs::inode::InodeCache;
use crate::fs::native::NativePayload;
use crate::fs::obj::ObjPayload;
use crate::fs::synth::SynthPayload;
use crate::fs::unionfs::UnionPayload;
use crate::fs::{self, native, SbTable};
use crate::lock::Spinlock;
use crate::mount::{self, MountPayload, MountTable};
use crate::mount_ns::{NsId, NsTable};
use crate::param::NDEV;
use crate::Result;

/// A character-device driver, dispatched by major number from
/// `readi`/`writei` on device inodes.
#[derive(Clone, Copy, Default)]
pub struct Devsw {
    pub read: Option<fn(&Kernel, &mut [u8]) -> Result<usize>>,
    pub write: Option<fn(&Kernel, &[u8]) -> Result<usize>>,
}

pub struct Kernel {
    pub devices: Devices,
    pub bcache: Bcache,
    pub superblocks: SbTable,
    pub mounts: MountTable,
    pub namespaces: NsTable,

    /// Per-driver inode caches.
    pub itable: InodeCache<NativePayload>,
    pub obj_itable: InodeCache<ObjPayload>,
    pub union_itable: InodeCache<UnionPayload>,
    pub synth_itable: InodeCache<SynthPayload>,

    /// Character-device switch table.
    pub devsw: Spinlock<[Devsw; NDEV]>,
}

impl Kernel {
    pub fn new() -> Kernel {
        let k = Kernel {
            devices: Devices::new(),
            bcache: Bcache::new(),
            superblocks: SbTable::new(),
            mounts: MountTable::new(),
            namespaces: NsTable::new(),
            itable: InodeCache::new(),
            obj_itable: InodeCache::new(),
            union_itable: InodeCache::new(),
            synth_itable: InodeCache::new(),
            devsw: Spinlock::new("devsw", array![_ => Devsw::default(); NDEV]),
        };
        // The initial mount namespace.
        let ns0 = k.namespaces.alloc();
        assert_eq!(ns0, NsId(0));
        k
    }

    /// Registers a character-device driver under `major`.
    pub fn set_devsw(&self, major: usize, devsw: Devsw) {
        self.devsw.lock()[major] = devsw;
    }

    /// Installs the root mount of the initial namespace from the IDE
    /// device on `port`, then brings the filesystem up.
    pub fn mount_root(&self, port: usize) -> Result<()> {
        let dev = device::get_or_create_ide(self, port)?;
        let m = mount::alloc_mnt(self);
        let sb = fs::sballoc(self)?;
        native::fsinit(self, sb, dev);
        {
            let mut slots = self.mounts.slots_mut();
            slots[m.0].payload = MountPayload::Sb(sb);
        }
        {
            let mut ns = self.namespaces.inner(NsId(0));
            assert!(ns.root.is_none(), "mount_root: root already mounted");
            ns.root = Some(m);
            ns.active.push(m);
        }

        // fs start: reads the superblock, recovers the log, installs
        // the root inode.
        sb.start(self);

        // The filesystem's cached inodes keep the device alive from
        // here on.
        device::device_put(self, dev);
        Ok(())
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}
