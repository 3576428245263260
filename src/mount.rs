//! The mount table.
//!
//! One global table of mount slots (the mount holder); each namespace
//! keeps its own list of active mounts and its own root. A mount
//! binds a mountpoint directory inode to either a freshly allocated
//! superblock (device-backed, union, or synthetic filesystems) or to
//! an existing directory inode (bind mounts).
//!
//! A mount's base reference is 1 from allocation; lookups hand out
//! extra references. Unmounting requires that no references beyond
//! the caller's own remain.

use arrayvec::ArrayVec;
use log::warn;

use crate::device::{DeviceId, DeviceKind};
use crate::fs::inode::InodeRef;
use crate::fs::synth::SynthKind;
use crate::fs::{self, native, obj, synth, unionfs, SbId};
use crate::kernel::Kernel;
use crate::lock::Spinlock;
use crate::mount_ns::NsId;
use crate::param::{NMOUNT, UNION_MAX_LAYERS};
use crate::{KernelError, Result};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MountId(pub usize);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MountPayload {
    None,
    /// A mounted filesystem instance.
    Sb(SbId),
    /// A bind mount re-exposing an existing directory inode.
    Bind(InodeRef),
}

#[derive(Clone, Copy)]
pub struct MountSlot {
    pub refcnt: u32,

    /// Parent mount; `None` for a namespace's root mount.
    pub parent: Option<MountId>,

    /// The mountpoint inode through which the mount is reachable;
    /// `None` for a namespace's root mount.
    pub mountpoint: Option<InodeRef>,

    pub payload: MountPayload,
}

pub struct MountTable {
    slots: Spinlock<[MountSlot; NMOUNT]>,
}

impl MountTable {
    pub fn new() -> Self {
        Self {
            slots: Spinlock::new(
                "mount_list",
                [MountSlot {
                    refcnt: 0,
                    parent: None,
                    mountpoint: None,
                    payload: MountPayload::None,
                }; NMOUNT],
            ),
        }
    }

    /// Snapshot of one slot.
    pub fn slot(&self, m: MountId) -> MountSlot {
        self.slots.lock()[m.0]
    }

    /// Locks the whole table for multi-field updates.
    pub(crate) fn slots_mut(&self) -> crate::lock::SpinlockGuard<'_, [MountSlot; NMOUNT]> {
        self.slots.lock()
    }
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Claims a free mount slot with one reference.
pub(crate) fn alloc_mnt(k: &Kernel) -> MountId {
    let mut slots = k.mounts.slots.lock();
    for (i, s) in slots.iter_mut().enumerate() {
        if s.refcnt == 0 {
            *s = MountSlot {
                refcnt: 1,
                parent: None,
                mountpoint: None,
                payload: MountPayload::None,
            };
            return MountId(i);
        }
    }
    panic!("out of mount objects");
}

pub fn mntdup(k: &Kernel, m: MountId) -> MountId {
    let mut slots = k.mounts.slots.lock();
    assert!(slots[m.0].refcnt > 0, "mntdup: dead mount");
    slots[m.0].refcnt += 1;
    m
}

pub fn mntput(k: &Kernel, m: MountId) {
    let mut slots = k.mounts.slots.lock();
    assert!(slots[m.0].refcnt > 0, "mntput");
    slots[m.0].refcnt -= 1;
}

/// What to mount.
pub enum MountReq {
    /// A block device; the filesystem flavor follows the device type.
    Device(DeviceId),
    /// Re-expose `0` at the mountpoint. The request borrows the
    /// caller's reference; the mount takes its own.
    Bind(InodeRef),
    /// A union of resolved layer directories, top first. Takes
    /// ownership of the references.
    Union(ArrayVec<InodeRef, UNION_MAX_LAYERS>),
    /// A synthetic tree.
    Synth(SynthKind),
}

/// Mounts `req` at `mountpoint` (which must be locked by the caller,
/// who on success forfeits its reference to the mount). Rejects a
/// second mount with the same `(parent, mountpoint)` in the
/// namespace. Device requests allocate a fresh superblock and start
/// the filesystem once the namespace lock is dropped.
pub fn mount(
    k: &Kernel,
    ns: NsId,
    mountpoint: Option<InodeRef>,
    req: MountReq,
    parent: Option<MountId>,
) -> Result<MountId> {
    let m = alloc_mnt(k);

    let started_sb = {
        let mut ns_inner = k.namespaces.inner(ns);

        for &mid in ns_inner.active.iter() {
            let s = k.mounts.slot(mid);
            if s.parent == parent && s.mountpoint == mountpoint {
                warn!("mount already exists at that point");
                k.mounts.slots.lock()[m.0].refcnt = 0;
                if let MountReq::Union(layers) = req {
                    for l in layers {
                        l.put(k);
                    }
                }
                return Err(KernelError::Exist);
            }
        }

        if let Some(p) = parent {
            mntdup(k, p);
        }

        let payload = match req {
            MountReq::Bind(ip) => MountPayload::Bind(ip.dup(k)),
            MountReq::Device(dev) => {
                let sb = match fs::sballoc(k) {
                    Ok(sb) => sb,
                    Err(e) => {
                        if let Some(p) = parent {
                            mntput(k, p);
                        }
                        k.mounts.slots.lock()[m.0].refcnt = 0;
                        return Err(e);
                    }
                };
                match k.devices.kind(dev) {
                    DeviceKind::Ide { .. } | DeviceKind::Loop { .. } => {
                        native::fsinit(k, sb, dev)
                    }
                    DeviceKind::Obj { .. } => obj::fsinit(k, sb, dev),
                    DeviceKind::None => panic!("mount: dead device"),
                }
                MountPayload::Sb(sb)
            }
            MountReq::Union(layers) => {
                let sb = match fs::sballoc(k) {
                    Ok(sb) => sb,
                    Err(e) => {
                        if let Some(p) = parent {
                            mntput(k, p);
                        }
                        for l in layers {
                            l.put(k);
                        }
                        k.mounts.slots.lock()[m.0].refcnt = 0;
                        return Err(e);
                    }
                };
                unionfs::fsinit(k, sb, layers);
                MountPayload::Sb(sb)
            }
            MountReq::Synth(kind) => {
                let sb = match fs::sballoc(k) {
                    Ok(sb) => sb,
                    Err(e) => {
                        if let Some(p) = parent {
                            mntput(k, p);
                        }
                        k.mounts.slots.lock()[m.0].refcnt = 0;
                        return Err(e);
                    }
                };
                synth::fsinit(k, sb, kind, ns);
                MountPayload::Sb(sb)
            }
        };

        {
            let mut slots = k.mounts.slots.lock();
            slots[m.0].parent = parent;
            slots[m.0].mountpoint = mountpoint;
            slots[m.0].payload = payload;
        }
        ns_inner.active.push(m);

        match payload {
            MountPayload::Sb(sb) => Some(sb),
            _ => None,
        }
    };

    // Bring the filesystem up outside the namespace lock; this reads
    // the disk and may sleep.
    if let Some(sb) = started_sb {
        sb.start(k);
    }
    Ok(m)
}

/// Unmounts `m` from `ns`. The caller's lookup reference is consumed
/// on success and kept on failure, as in the syscall layer's
/// contract.
pub fn umount(k: &Kernel, ns: NsId, m: MountId) -> Result<()> {
    let (is_root, mountpoint, payload, parent) = {
        let mut ns_inner = k.namespaces.inner(ns);
        let pos = match ns_inner.active.iter().position(|&mid| mid == m) {
            Some(pos) => pos,
            None => {
                // not actually mounted.
                warn!("umount: mount not active");
                return Err(KernelError::Inval);
            }
        };

        let mut slots = k.mounts.slots.lock();
        let is_root = slots[m.0].parent.is_none();
        // sanity -- the root mount has no attached mountpoint.
        assert!(!is_root || slots[m.0].mountpoint.is_none());

        // Base ref is 1, +1 for the reference taken by the caller.
        if slots[m.0].refcnt > 2 {
            warn!("umount: {} extra references", slots[m.0].refcnt - 2);
            return Err(KernelError::Busy);
        }

        ns_inner.active.remove(pos);

        let slot = &mut slots[m.0];
        let fields = (
            is_root,
            slot.mountpoint.take(),
            core::mem::replace(&mut slot.payload, MountPayload::None),
            slot.parent.take(),
        );
        slot.refcnt = 0;
        fields
    };

    if let Some(p) = parent {
        mntput(k, p);
    }
    if !is_root {
        mountpoint
            .expect("umount: non-root mount without mountpoint")
            .put(k);
    }
    match payload {
        MountPayload::Bind(ip) => ip.put(k),
        MountPayload::Sb(sb) => fs::sbput(k, sb),
        MountPayload::None => {}
    }
    Ok(())
}

/// Finds the active mount anchored at `mountpoint` under `parent`.
/// Bind mounts match on the mountpoint alone, since they inherently
/// have different parents. Returns a new reference.
pub fn mnt_lookup(
    k: &Kernel,
    ns: NsId,
    mountpoint: InodeRef,
    parent: MountId,
) -> Option<MountId> {
    let ns_inner = k.namespaces.inner(ns);
    for &mid in ns_inner.active.iter() {
        let s = k.mounts.slot(mid);
        if s.mountpoint == Some(mountpoint)
            && (s.parent == Some(parent) || matches!(s.payload, MountPayload::Bind(_)))
        {
            return Some(mntdup(k, mid));
        }
    }
    None
}

/// The root inode a mount exposes: the superblock's root for device
/// mounts, the bind target for bind mounts. No reference is taken.
pub(crate) fn mount_root_of(k: &Kernel, m: MountId) -> InodeRef {
    match k.mounts.slot(m).payload {
        MountPayload::Sb(sb) => sb.root_ip(k).expect("mount of unstarted fs"),
        MountPayload::Bind(ip) => ip,
        MountPayload::None => panic!("root of dead mount"),
    }
}

/// The root inode of the mount, referenced.
pub fn get_mount_root_ip(k: &Kernel, m: MountId) -> InodeRef {
    mount_root_of(k, m).dup(k)
}

/// Swaps the namespace's root to `new_root` and reparents the old
/// root under `put_old`'s inode. The whole swap happens under the
/// namespace and mount-table locks.
pub fn pivot_root(
    k: &Kernel,
    ns: NsId,
    new_root_mnt: MountId,
    put_old_ip: InodeRef,
) -> Result<()> {
    let released_mountpoint = {
        let mut ns_inner = k.namespaces.inner(ns);
        let mut slots = k.mounts.slots.lock();

        let old_root = ns_inner.root.expect("pivot_root: namespace without root");
        if old_root == new_root_mnt {
            return Err(KernelError::Inval);
        }

        slots[old_root.0].parent = Some(new_root_mnt);
        ns_inner.root = Some(new_root_mnt);
        slots[new_root_mnt.0].refcnt += 1;

        if let Some(p) = slots[new_root_mnt.0].parent.take() {
            slots[p.0].refcnt -= 1;
        }

        // Mount the old root on put_old, so the previous tree stays
        // reachable.
        slots[old_root.0].mountpoint = Some(put_old_ip.dup(k));

        // A root mount anchors nowhere: its old mountpoint reference
        // is released once the locks are dropped.
        slots[new_root_mnt.0].mountpoint.take()
    };
    if let Some(mp) = released_mountpoint {
        mp.put(k);
    }
    Ok(())
}

/// Tears down every mount of a dying namespace, children before
/// parents, the root last.
pub(crate) fn umount_all(k: &Kernel, ns: NsId) {
    loop {
        let next = {
            let ns_inner = k.namespaces.inner(ns);
            ns_inner
                .active
                .iter()
                .rev()
                .copied()
                .find(|&mid| k.mounts.slot(mid).parent.is_some())
        };
        match next {
            Some(m) => umount(k, ns, m).expect("failed to umount upon namespace close"),
            None => break,
        }
    }

    let root = k.namespaces.inner(ns).root;
    if let Some(root) = root {
        umount(k, ns, root).expect("failed to umount upon namespace close");
        k.namespaces.inner(ns).root = None;
    }
}
