//! The union file system: a read-mostly overlay of N directory
//! layers, top layer first, with copy-up on first write.
//!
//! A union inode is either a file wrapping one underlying inode (and
//! remembering which layer it came from) or a directory holding the
//! per-layer directory inodes that exist for its path. Name lookup
//! walks layers top to bottom: the first file hit wins and stops the
//! walk; directory hits from every layer are merged into one inode so
//! deeper layers' entries remain discoverable.
//!
//! Writing to a file that came from a lower layer first materializes
//! it on the top layer: the contents are cloned up, the name is
//! linked into the top-layer parent directory, and only then is the
//! write applied. The union inode's identity does not change across
//! copy-up.
//!
//! Union inodes have no stable on-store identity; every lookup mints
//! a fresh cache slot. Consequently a union directory is not a stable
//! anchor for further mounts.

use arrayvec::ArrayVec;
use itertools::Itertools;
use log::warn;
use zerocopy::{AsBytes, FromBytes};

use super::inode::{InodeInner, InodeRef, InodeType};
use super::path::FileName;
use super::stat::Stat;
use super::{Dirent, FsPrivate, SbId, DIRENT_SIZE, DIRSIZ};
use crate::kernel::Kernel;
use crate::param::{BSIZE, UNION_MAX_LAYERS, UNION_TOP_LAYER};
use crate::{KernelError, Result};

pub struct UnionFsState {
    /// Layer directory inodes, top first. The superblock owns one
    /// reference per layer.
    pub layers: ArrayVec<InodeRef, UNION_MAX_LAYERS>,
}

pub enum UnionNode {
    File {
        /// The inode of the underlying filesystem for this file.
        underlying: InodeRef,
        /// Which layer the underlying inode came from.
        layer: usize,
    },
    Dir {
        /// For each layer, the directory inode at this path in that
        /// layer, if it exists there.
        layers: [Option<InodeRef>; UNION_MAX_LAYERS],
    },
}

/// Union driver-private part of a cached inode.
#[derive(Default)]
pub struct UnionPayload {
    node: Option<UnionNode>,

    /// Name under which this inode was found in its parent, and the
    /// parent's top-layer directory; both feed copy-up.
    name: ArrayVec<u8, DIRSIZ>,
    top_parent: Option<InodeRef>,
}

type Inner = InodeInner<UnionPayload>;

/// The locked inner data of slot `idx`.
///
/// # Safety
///
/// The slot's sleep-lock must be held by this thread, or the slot
/// must be freshly claimed and still private to this thread.
unsafe fn inner(k: &Kernel, idx: usize) -> &mut Inner {
    &mut *k.union_itable.inner_raw(idx)
}

fn state_layers(k: &Kernel, sb: SbId) -> ArrayVec<InodeRef, UNION_MAX_LAYERS> {
    match &k.superblocks.inner(sb).fs {
        FsPrivate::Union(st) => st.layers.clone(),
        _ => panic!("not a union fs"),
    }
}

/// Binds a fresh superblock slot to a parsed layer list. Takes
/// ownership of the callers' references on the layer inodes.
pub fn fsinit(k: &Kernel, sb: SbId, layers: ArrayVec<InodeRef, UNION_MAX_LAYERS>) {
    assert!(!layers.is_empty(), "union: no layers");
    let mut inner = k.superblocks.inner(sb);
    inner.fs = FsPrivate::Union(UnionFsState { layers });
    inner.root_ip = None;
}

/// Installs the root: a merged directory over all layer roots.
pub fn fsstart(k: &Kernel, sb: SbId) {
    let state = state_layers(k, sb);
    let idx = k.union_itable.alloc_slot(sb);
    {
        // SAFETY: freshly claimed slot, still private to this thread.
        let inner = unsafe { inner(k, idx) };
        let mut layers = [None; UNION_MAX_LAYERS];
        for (i, layer) in state.iter().enumerate() {
            layers[i] = Some(layer.dup(k));
        }
        inner.private = UnionPayload {
            node: Some(UnionNode::Dir { layers }),
            name: ArrayVec::new(),
            top_parent: None,
        };
        inner.typ = InodeType::Dir;
        inner.nlink = 1;
        inner.size = 0;
        inner.valid = true;
    }
    k.superblocks.inner(sb).root_ip = Some(InodeRef::Union(idx));
}

/// The "top" underlying inode: the stored one for files, the first
/// present layer for directories.
fn top_inode(inner: &Inner) -> InodeRef {
    match inner.private.node.as_ref().expect("union: empty inode") {
        UnionNode::File { underlying, .. } => *underlying,
        UnionNode::Dir { layers } => layers
            .iter()
            .flatten()
            .next()
            .copied()
            .expect("union: directory with no layers"),
    }
}

/// Mints a union inode wrapping `node`, remembering `name` and the
/// parent's top-layer directory for later copy-up. The fresh slot is
/// initialized before it is shared.
fn wrap(
    k: &Kernel,
    sb: SbId,
    node: UnionNode,
    name: &FileName,
    top_parent: Option<InodeRef>,
    typ: InodeType,
    nlink: i16,
    size: u32,
) -> InodeRef {
    let idx = k.union_itable.alloc_slot(sb);
    // SAFETY: freshly claimed slot, still private to this thread.
    let inner = unsafe { inner(k, idx) };
    let mut stored = ArrayVec::new();
    stored.try_extend_from_slice(name.as_bytes()).unwrap();
    inner.private = UnionPayload {
        node: Some(node),
        name: stored,
        top_parent,
    };
    inner.typ = typ;
    inner.nlink = nlink;
    inner.size = size;
    inner.valid = true;
    InodeRef::Union(idx)
}

/// Refreshes the cached metadata from the top underlying inode.
pub fn ilock_load(k: &Kernel, idx: usize) {
    // SAFETY: caller holds the slot's sleep-lock.
    let inner = unsafe { inner(k, idx) };
    assert!(inner.private.node.is_some(), "union ilock: empty inode");
    let top = top_inode(inner);
    let g = top.lock(k);
    inner.nlink = g.nlink();
    inner.size = g.size();
    drop(g);
    inner.valid = true;
}

/// Writes metadata through to the top underlying inode.
pub fn iupdate(k: &Kernel, idx: usize) {
    // SAFETY: caller holds the slot's sleep-lock.
    let inner = unsafe { inner(k, idx) };
    let top = top_inode(inner);
    let mut g = top.lock(k);
    g.set_nlink(inner.nlink);
    g.update();
}

/// Drops a reference. The underlying layer references are released
/// only on the last drop, and the cache lock is released on every
/// path.
pub fn iput(k: &Kernel, idx: usize) {
    // SAFETY: paired with the unlock below.
    unsafe { k.union_itable.lock_slot(idx) };
    let teardown = {
        let inner = unsafe { inner(k, idx) };
        if k.union_itable.meta_at(idx).refcnt == 1 {
            // Last reference: empty the slot while it still cannot be
            // reclaimed, release the layer refs after unlocking.
            inner.valid = false;
            Some((inner.private.node.take(), inner.private.top_parent.take()))
        } else {
            None
        }
    };
    unsafe { k.union_itable.unlock_slot(idx) };

    if let Some((node, top_parent)) = teardown {
        match node {
            Some(UnionNode::File { underlying, .. }) => underlying.put(k),
            Some(UnionNode::Dir { layers }) => {
                for layer in layers.iter().flatten() {
                    layer.put(k);
                }
            }
            None => {}
        }
        if let Some(tp) = top_parent {
            tp.put(k);
        }
    }

    k.union_itable.put_ref(idx);
}

/// Layered lookup: walk layers top to bottom; the first file hit
/// wins, directory hits are merged across all layers.
pub fn dirlookup(k: &Kernel, idx: usize, name: &FileName) -> Result<(InodeRef, u32)> {
    let sb = k.union_itable.meta_at(idx).sb.expect("union dirlookup");

    // Snapshot our per-layer directories and the top-layer parent for
    // the child.
    let (layers, child_top_parent) = {
        // SAFETY: caller holds the slot's sleep-lock.
        let inner = unsafe { inner(k, idx) };
        match inner.private.node.as_ref() {
            Some(UnionNode::Dir { layers }) => (*layers, layers[UNION_TOP_LAYER]),
            _ => panic!("dirlookup not DIR"),
        }
    };

    let mut dir_layers = [None; UNION_MAX_LAYERS];
    let mut have_dir = false;

    for (i, layer_dir) in layers.iter().enumerate() {
        let layer_dir = match layer_dir {
            Some(ip) => *ip,
            None => continue,
        };
        let found = {
            let mut g = layer_dir.lock(k);
            match g.dirlookup(name) {
                Ok((ip, _)) => Some(ip),
                Err(KernelError::NoEnt) => None,
                Err(e) => return Err(e),
            }
        };
        let found = match found {
            Some(ip) => ip,
            None => continue,
        };

        let (typ, nlink, size) = {
            let g = found.lock(k);
            (g.typ(), g.nlink(), g.size())
        };
        match typ {
            InodeType::Dir => {
                dir_layers[i] = Some(found);
                have_dir = true;
            }
            _ if have_dir => {
                // A file shadowed by a shallower directory.
                found.put(k);
            }
            typ => {
                // First hit is a file: it wins and the walk stops.
                let tp = child_top_parent.map(|ip| ip.dup(k));
                let ip = wrap(
                    k,
                    sb,
                    UnionNode::File {
                        underlying: found,
                        layer: i,
                    },
                    name,
                    tp,
                    typ,
                    nlink,
                    size,
                );
                return Ok((ip, 0));
            }
        }
    }

    if !have_dir {
        return Err(KernelError::NoEnt);
    }
    let tp = child_top_parent.map(|ip| ip.dup(k));
    let ip = wrap(
        k,
        sb,
        UnionNode::Dir { layers: dir_layers },
        name,
        tp,
        InodeType::Dir,
        1,
        0,
    );
    Ok((ip, 0))
}

/// The underlying inode of a union inode whose lock is held by this
/// thread (or which is still private to it).
fn underlying_of(k: &Kernel, ip: InodeRef) -> InodeRef {
    match ip {
        InodeRef::Union(idx) => {
            // SAFETY: see above.
            let inner = unsafe { inner(k, idx) };
            top_inode(inner)
        }
        _ => panic!("union dirlink: non-union child"),
    }
}

/// Allocates an inode on the top layer's filesystem and wraps it.
pub fn ialloc(k: &Kernel, sb: SbId, typ: InodeType) -> Result<InodeRef> {
    assert!(
        matches!(typ, InodeType::File | InodeType::Dir),
        "union ialloc: type"
    );
    let state = state_layers(k, sb);
    let top_root = state[UNION_TOP_LAYER];
    let underlying = top_root.sb(k).alloc_inode(k, typ)?;

    let node = match typ {
        InodeType::File => UnionNode::File {
            underlying,
            layer: UNION_TOP_LAYER,
        },
        _ => {
            let mut layers = [None; UNION_MAX_LAYERS];
            layers[UNION_TOP_LAYER] = Some(underlying);
            UnionNode::Dir { layers }
        }
    };
    Ok(wrap(
        k,
        sb,
        node,
        FileName::from_bytes(b""),
        None,
        typ,
        0,
        0,
    ))
}

/// Creates the link on the top layer, the only writable one.
pub fn dirlink(k: &Kernel, idx: usize, name: &FileName, ip: InodeRef) -> Result<()> {
    let top_dir = {
        // SAFETY: caller holds the slot's sleep-lock.
        let inner = unsafe { inner(k, idx) };
        match inner.private.node.as_ref() {
            Some(UnionNode::Dir { layers }) => match layers[UNION_TOP_LAYER] {
                Some(d) => d,
                None => {
                    warn!("unionfs: directory absent on the top layer");
                    return Err(KernelError::NoEnt);
                }
            },
            _ => panic!("dirlink not DIR"),
        }
    };

    let underlying = underlying_of(k, ip);
    {
        let mut g = top_dir.lock(k);
        g.dirlink(name, underlying)?;
    }

    // Remember where the child lives on the top layer.
    if let InodeRef::Union(cidx) = ip {
        // SAFETY: the child is locked by this thread or still private
        // to it (fresh from ialloc).
        let cinner = unsafe { inner(k, cidx) };
        cinner.private.name.clear();
        cinner
            .private
            .name
            .try_extend_from_slice(name.as_bytes())
            .unwrap();
        if cinner.private.top_parent.is_none() {
            cinner.private.top_parent = Some(top_dir.dup(k));
        }
    }
    Ok(())
}

/// Ensures the file lives on the top layer, cloning contents up when
/// `copy_contents` (the O_TRUNC path skips the clone). Until the
/// swap, the old file stays visible; the union inode's identity never
/// changes.
fn ensure_top(k: &Kernel, idx: usize, copy_contents: bool) -> Result<()> {
    // SAFETY: caller holds the slot's sleep-lock.
    let (old, name, top_parent) = {
        let inner = unsafe { inner(k, idx) };
        match inner.private.node.as_ref() {
            Some(UnionNode::File { underlying, layer }) => {
                if *layer == UNION_TOP_LAYER {
                    return Ok(());
                }
                (
                    *underlying,
                    inner.private.name.clone(),
                    inner.private.top_parent,
                )
            }
            _ => panic!("union write: not a file"),
        }
    };
    let top_parent = match top_parent {
        Some(tp) => tp,
        None => {
            warn!("unionfs: copy-up with no top-layer parent directory");
            return Err(KernelError::NoEnt);
        }
    };

    let new = top_parent.sb(k).alloc_inode(k, InodeType::File)?;
    {
        let mut g = new.lock(k);
        g.set_nlink(1);
        g.update();
    }

    if copy_contents {
        // Clone the old contents block by block, locking one
        // underlying inode at a time.
        let mut off = 0u32;
        let mut buf = [0u8; BSIZE];
        loop {
            let n = {
                let mut g = old.lock(k);
                g.readi(off, &mut buf)?
            };
            if n == 0 {
                break;
            }
            let mut g = new.lock(k);
            let written = g.writei(&buf[..n], off)?;
            assert_eq!(written, n, "union copy-up: short write");
            drop(g);
            off += n as u32;
        }
    }

    {
        let mut g = top_parent.lock(k);
        match g.dirlink(FileName::from_bytes(&name), new) {
            Ok(()) | Err(KernelError::Exist) => {}
            Err(e) => {
                drop(g);
                new.put(k);
                return Err(e);
            }
        }
    }

    // Swap: from here on the file is the top-layer one.
    {
        let inner = unsafe { inner(k, idx) };
        inner.private.node = Some(UnionNode::File {
            underlying: new,
            layer: UNION_TOP_LAYER,
        });
    }
    old.put(k);
    Ok(())
}

pub fn readi(k: &Kernel, idx: usize, off: u32, dst: &mut [u8]) -> Result<usize> {
    // SAFETY: caller holds the slot's sleep-lock.
    let typ = unsafe { inner(k, idx) }.typ;
    match typ {
        InodeType::Dir => readdir_merged(k, idx, off, dst),
        _ => {
            let top = {
                let inner = unsafe { inner(k, idx) };
                top_inode(inner)
            };
            let mut g = top.lock(k);
            g.readi(off, dst)
        }
    }
}

/// Synthesizes the merged directory stream: layers top to bottom,
/// deduplicated by name, first occurrence wins.
fn readdir_merged(k: &Kernel, idx: usize, off: u32, dst: &mut [u8]) -> Result<usize> {
    let layers = {
        // SAFETY: caller holds the slot's sleep-lock.
        let inner = unsafe { inner(k, idx) };
        match inner.private.node.as_ref() {
            Some(UnionNode::Dir { layers }) => *layers,
            _ => panic!("union readdir: not a dir"),
        }
    };

    let mut entries: Vec<Dirent> = Vec::new();
    for layer_dir in layers.iter().flatten() {
        let mut g = layer_dir.lock(k);
        let size = g.size();
        let mut buf = [0u8; DIRENT_SIZE];
        for o in (0..size).step_by(DIRENT_SIZE) {
            if g.readi(o, &mut buf)? != DIRENT_SIZE {
                break;
            }
            let de = Dirent::read_from(&buf[..]).unwrap();
            if de.inum != 0 {
                entries.push(de);
            }
        }
    }

    let stream: Vec<u8> = entries
        .into_iter()
        .unique_by(|de| de.get_name().as_bytes().to_vec())
        .flat_map(|de| de.as_bytes().to_vec())
        .collect();

    if off as usize >= stream.len() {
        return Ok(0);
    }
    let n = dst.len().min(stream.len() - off as usize);
    dst[..n].copy_from_slice(&stream[off as usize..off as usize + n]);
    Ok(n)
}

pub fn writei(k: &Kernel, idx: usize, src: &[u8], off: u32) -> Result<usize> {
    // SAFETY: caller holds the slot's sleep-lock.
    let typ = unsafe { inner(k, idx) }.typ;
    assert!(typ != InodeType::Dir, "union writei: directory");

    ensure_top(k, idx, true)?;
    let top = {
        let inner = unsafe { inner(k, idx) };
        top_inode(inner)
    };
    let n = {
        let mut g = top.lock(k);
        g.writei(src, off)?
    };
    let inner = unsafe { inner(k, idx) };
    if off + n as u32 > inner.size {
        inner.size = off + n as u32;
    }
    Ok(n)
}

/// Discards contents; a lower-layer file is first materialized empty
/// on the top layer.
pub fn itrunc(k: &Kernel, idx: usize) {
    ensure_top(k, idx, false).expect("union truncate");
    let top = {
        // SAFETY: caller holds the slot's sleep-lock.
        let inner = unsafe { inner(k, idx) };
        top_inode(inner)
    };
    let mut g = top.lock(k);
    g.truncate();
    drop(g);
    unsafe { inner(k, idx) }.size = 0;
}

/// Delegates to the top underlying inode.
pub fn stati(k: &Kernel, idx: usize) -> Stat {
    let top = {
        // SAFETY: caller holds the slot's sleep-lock.
        let inner = unsafe { inner(k, idx) };
        top_inode(inner)
    };
    let g = top.lock(k);
    g.stat()
}

/// True iff every present layer directory is empty.
pub fn is_dir_empty(k: &Kernel, idx: usize) -> bool {
    let layers = {
        // SAFETY: caller holds the slot's sleep-lock.
        let inner = unsafe { inner(k, idx) };
        match inner.private.node.as_ref() {
            Some(UnionNode::Dir { layers }) => *layers,
            _ => panic!("union isdirempty: not a dir"),
        }
    };
    for layer_dir in layers.iter().flatten() {
        let mut g = layer_dir.lock(k);
        if !g.is_dir_empty() {
            return false;
        }
    }
    true
}
