//! Mount namespaces.
//!
//! Each namespace owns a mount tree: a root mount and the list of
//! active mounts. Cloning a namespace (unshare) produces a
//! structurally identical tree whose inode and superblock references
//! are shared (and re-counted); mounts added in one namespace
//! afterwards are invisible in the other.

use array_macro::array;
use arrayvec::ArrayVec;

use crate::fs;
use crate::kernel::Kernel;
use crate::lock::{Spinlock, SpinlockGuard};
use crate::mount::{self, MountId, MountPayload};
use crate::param::{NMOUNT, NNAMESPACE};
use crate::proc::Proc;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct NsId(pub usize);

pub struct NsInner {
    pub root: Option<MountId>,
    pub active: ArrayVec<MountId, NMOUNT>,
}

pub struct NsTable {
    refs: Spinlock<[u32; NNAMESPACE]>,
    ns: [Spinlock<NsInner>; NNAMESPACE],
}

impl NsTable {
    pub fn new() -> Self {
        Self {
            refs: Spinlock::new("mountns", [0; NNAMESPACE]),
            ns: array![_ => Spinlock::new("mount_ns", NsInner {
                root: None,
                active: ArrayVec::new(),
            }); NNAMESPACE],
        }
    }

    /// Locks and returns a namespace's mount list and root pointer.
    pub fn inner(&self, ns: NsId) -> SpinlockGuard<'_, NsInner> {
        self.ns[ns.0].lock()
    }

    /// Claims a free namespace with one reference.
    pub(crate) fn alloc(&self) -> NsId {
        let mut refs = self.refs.lock();
        for (i, r) in refs.iter_mut().enumerate() {
            if *r == 0 {
                *r = 1;
                return NsId(i);
            }
        }
        panic!("out of mount_ns objects");
    }

    #[cfg(test)]
    pub(crate) fn refcnt(&self, ns: NsId) -> u32 {
        self.refs.lock()[ns.0]
    }
}

impl Default for NsTable {
    fn default() -> Self {
        Self::new()
    }
}

pub fn nsdup(k: &Kernel, ns: NsId) -> NsId {
    let mut refs = k.namespaces.refs.lock();
    assert!(refs[ns.0] > 0, "nsdup: dead namespace");
    refs[ns.0] += 1;
    ns
}

/// Drops a namespace reference; the last one unmounts everything in
/// the namespace, with the table lock released.
pub fn nsput(k: &Kernel, ns: NsId) {
    {
        let mut refs = k.namespaces.refs.lock();
        assert!(refs[ns.0] > 0, "nsput");
        if refs[ns.0] > 1 {
            refs[ns.0] -= 1;
            return;
        }
    }

    mount::umount_all(k, ns);

    let mut refs = k.namespaces.refs.lock();
    refs[ns.0] -= 1;
}

/// Clones the current namespace: a shallow copy of the mount list
/// with parent pointers re-bound by positional correspondence, the
/// process's cwd mount translated into the new tree. Underlying
/// superblocks and inodes are shared, with their counts bumped.
pub fn clone_ns(k: &Kernel, p: &mut Proc) -> NsId {
    let new_ns = k.namespaces.alloc();

    let old_ns = p.ns;
    let old_inner = k.namespaces.inner(old_ns);

    // Shallow copy, in list order.
    let mut new_active: ArrayVec<MountId, NMOUNT> = ArrayVec::new();
    for &old_m in old_inner.active.iter() {
        let s = k.mounts.slot(old_m);
        let new_m = mount::alloc_mnt(k);
        {
            let mountpoint = s.mountpoint.map(|ip| ip.dup(k));
            let payload = match s.payload {
                MountPayload::Bind(ip) => MountPayload::Bind(ip.dup(k)),
                MountPayload::Sb(sb) => MountPayload::Sb(fs::sbdup(k, sb)),
                MountPayload::None => panic!("clone_ns: dead mount in active list"),
            };
            let mut slots = k.mounts.slots_mut();
            slots[new_m.0].mountpoint = mountpoint;
            slots[new_m.0].payload = payload;
        }
        new_active.push(new_m);
    }

    // Re-point parents into the new list by position.
    for (i, &old_m) in old_inner.active.iter().enumerate() {
        if let Some(old_parent) = k.mounts.slot(old_m).parent {
            let j = old_inner
                .active
                .iter()
                .position(|&m| m == old_parent)
                .expect("invalid mount tree structure");
            let new_parent = mount::mntdup(k, new_active[j]);
            k.mounts.slots_mut()[new_active[i].0].parent = Some(new_parent);
        }
    }

    // Translate the process's cwd mount into the new tree.
    if let Some(cwd_mount) = p.cwd_mount {
        if let Some(i) = old_inner.active.iter().position(|&m| m == cwd_mount) {
            p.cwd_mount = Some(mount::mntdup(k, new_active[i]));
            mount::mntput(k, cwd_mount);
        }
    }

    // The new root is the entry whose parent chain ends nowhere.
    let root = new_active
        .iter()
        .copied()
        .find(|&m| k.mounts.slot(m).parent.is_none())
        .expect("malformed mount structure - no root");

    drop(old_inner);

    let mut new_inner = k.namespaces.inner(new_ns);
    new_inner.root = Some(root);
    new_inner.active = new_active;
    new_ns
}
