//! Synthetic filesystems: the proc and cgroup trees.
//!
//! Both are real mounts with their own superblocks and inode ops, not
//! path-string side channels: they allocate a superblock, install a
//! root inode, and unmount through the same path as every other
//! filesystem. The trees are flat and read-only; file contents are
//! rendered from live kernel state at read time, so sizes are
//! computed, not stored.

use super::inode::{InodeInner, InodeRef, InodeType};
use super::path::FileName;
use super::stat::{Stat, T_DIR, T_FILE};
use super::{Dirent, FsPrivate, SbId, DIRENT_SIZE, ROOTINO};
use crate::kernel::Kernel;
use crate::mount::MountPayload;
use crate::mount_ns::NsId;
use crate::{KernelError, Result};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SynthKind {
    Proc,
    Cgroup,
}

pub struct SynthFsState {
    pub kind: SynthKind,

    /// The namespace whose state the tree renders.
    pub ns: NsId,
}

/// Synth driver-private part of a cached inode: the node index into
/// the kind's table.
#[derive(Default)]
pub struct SynthPayload {
    node: usize,
}

struct SynthNode {
    name: &'static [u8],
    dir: bool,
}

/// Node 0 is the root; inum = node index + 1.
const PROC_NODES: &[SynthNode] = &[
    SynthNode { name: b"", dir: true },
    SynthNode { name: b"mounts", dir: false },
    SynthNode { name: b"filesystems", dir: false },
];

const CGROUP_NODES: &[SynthNode] = &[
    SynthNode { name: b"", dir: true },
    SynthNode { name: b"cgroup.procs", dir: false },
    SynthNode { name: b"cgroup.controllers", dir: false },
];

fn nodes_of(kind: SynthKind) -> &'static [SynthNode] {
    match kind {
        SynthKind::Proc => PROC_NODES,
        SynthKind::Cgroup => CGROUP_NODES,
    }
}

fn state_of(k: &Kernel, sb: SbId) -> (SynthKind, NsId) {
    match &k.superblocks.inner(sb).fs {
        FsPrivate::Synth(st) => (st.kind, st.ns),
        _ => panic!("not a synthetic fs"),
    }
}

type Inner = InodeInner<SynthPayload>;

/// The locked inner data of slot `idx`.
///
/// # Safety
///
/// The slot's sleep-lock must be held by this thread.
unsafe fn inner(k: &Kernel, idx: usize) -> &mut Inner {
    &mut *k.synth_itable.inner_raw(idx)
}

pub fn fsinit(k: &Kernel, sb: SbId, kind: SynthKind, ns: NsId) {
    let mut inner = k.superblocks.inner(sb);
    inner.fs = FsPrivate::Synth(SynthFsState { kind, ns });
    inner.root_ip = None;
}

pub fn fsstart(k: &Kernel, sb: SbId) {
    let root = iget(k, sb, ROOTINO);
    k.superblocks.inner(sb).root_ip = Some(root);
}

pub fn iget(k: &Kernel, sb: SbId, inum: u32) -> InodeRef {
    let (idx, _) = k.synth_itable.get(sb, inum, None);
    InodeRef::Synth(idx)
}

pub fn iput(k: &Kernel, idx: usize) {
    // SAFETY: paired with the unlock below.
    unsafe { k.synth_itable.lock_slot(idx) };
    if k.synth_itable.meta_at(idx).refcnt == 1 {
        unsafe { inner(k, idx) }.valid = false;
    }
    unsafe { k.synth_itable.unlock_slot(idx) };
    k.synth_itable.put_ref(idx);
}

/// Renders a file's contents from live kernel state.
fn content(k: &Kernel, kind: SynthKind, ns: NsId, node: usize) -> Vec<u8> {
    match (kind, nodes_of(kind)[node].name) {
        (SynthKind::Proc, b"mounts") => {
            let mut out = String::new();
            let mounts = {
                let ns_inner = k.namespaces.inner(ns);
                ns_inner.active.clone()
            };
            for m in mounts {
                let s = k.mounts.slot(m);
                let what = match s.payload {
                    MountPayload::Bind(_) => "bind",
                    MountPayload::Sb(sb) => match &k.superblocks.inner(sb).fs {
                        FsPrivate::Native(_) => "native",
                        FsPrivate::Obj(_) => "objfs",
                        FsPrivate::Union(_) => "union",
                        FsPrivate::Synth(st) => match st.kind {
                            SynthKind::Proc => "proc",
                            SynthKind::Cgroup => "cgroup",
                        },
                        FsPrivate::None => "dead",
                    },
                    MountPayload::None => "dead",
                };
                out.push_str(&format!("mount{} {}\n", m.0, what));
            }
            out.into_bytes()
        }
        (SynthKind::Proc, b"filesystems") => {
            b"native\nobjfs\nunion\nnodev proc\nnodev cgroup\n".to_vec()
        }
        (SynthKind::Cgroup, b"cgroup.procs") => Vec::new(),
        (SynthKind::Cgroup, b"cgroup.controllers") => b"\n".to_vec(),
        _ => Vec::new(),
    }
}

pub fn ilock_load(k: &Kernel, idx: usize) {
    // SAFETY: caller holds the slot's sleep-lock.
    let inner = unsafe { inner(k, idx) };
    if inner.valid {
        return;
    }
    let meta = k.synth_itable.meta_at(idx);
    let sb = meta.sb.expect("synth ilock");
    let (kind, ns) = state_of(k, sb);
    let node = (meta.inum - 1) as usize;
    assert!(node < nodes_of(kind).len(), "synth ilock: no such node");

    inner.private.node = node;
    inner.typ = if nodes_of(kind)[node].dir {
        InodeType::Dir
    } else {
        InodeType::File
    };
    inner.nlink = 1;
    inner.size = if nodes_of(kind)[node].dir {
        ((nodes_of(kind).len() + 1) * DIRENT_SIZE) as u32
    } else {
        content(k, kind, ns, node).len() as u32
    };
    inner.valid = true;
}

pub fn readi(k: &Kernel, idx: usize, off: u32, dst: &mut [u8]) -> Result<usize> {
    let meta = k.synth_itable.meta_at(idx);
    let sb = meta.sb.expect("synth readi");
    let (kind, ns) = state_of(k, sb);
    // SAFETY: caller holds the slot's sleep-lock.
    let (typ, node) = {
        let inner = unsafe { inner(k, idx) };
        (inner.typ, inner.private.node)
    };

    let stream = match typ {
        InodeType::Dir => {
            // "." and ".." point back at the root of the flat tree.
            let mut stream = Vec::new();
            let mut push = |name: &[u8], inum: u16| {
                let mut de = Dirent {
                    inum,
                    ..Dirent::default()
                };
                de.set_name(FileName::from_bytes(name));
                stream.extend_from_slice(zerocopy::AsBytes::as_bytes(&de));
            };
            push(b".", ROOTINO as u16);
            push(b"..", ROOTINO as u16);
            for (i, n) in nodes_of(kind).iter().enumerate().skip(1) {
                push(n.name, (i + 1) as u16);
            }
            stream
        }
        _ => content(k, kind, ns, node),
    };

    if off as usize >= stream.len() {
        return Ok(0);
    }
    let n = dst.len().min(stream.len() - off as usize);
    dst[..n].copy_from_slice(&stream[off as usize..off as usize + n]);
    Ok(n)
}

pub fn writei(_k: &Kernel, _idx: usize, _src: &[u8], _off: u32) -> Result<usize> {
    Err(KernelError::Inval)
}

pub fn dirlookup(k: &Kernel, idx: usize, name: &FileName) -> Result<(InodeRef, u32)> {
    let meta = k.synth_itable.meta_at(idx);
    let sb = meta.sb.expect("synth dirlookup");
    let (kind, _) = state_of(k, sb);

    for (i, n) in nodes_of(kind).iter().enumerate().skip(1) {
        if name.as_bytes() == n.name {
            return Ok((iget(k, sb, (i + 1) as u32), 0));
        }
    }
    Err(KernelError::NoEnt)
}

pub fn dirlink(
    _k: &Kernel,
    _idx: usize,
    _name: &FileName,
    _ip: InodeRef,
) -> Result<()> {
    Err(KernelError::Inval)
}

pub fn stati(k: &Kernel, idx: usize) -> Stat {
    // SAFETY: caller holds the slot's sleep-lock.
    let inner = unsafe { inner(k, idx) };
    let meta = k.synth_itable.meta_at(idx);
    Stat {
        dev: -1,
        ino: meta.inum,
        typ: match inner.typ {
            InodeType::Dir => T_DIR,
            _ => T_FILE,
        },
        nlink: inner.nlink,
        size: inner.size,
    }
}
