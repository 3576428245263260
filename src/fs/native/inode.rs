//! Native inode operations.
//!
//! The content (data) associated with each inode is stored in blocks
//! on the disk. The first NDIRECT block numbers are listed in
//! `addrs`; the next NINDIRECT blocks are listed in the single
//! indirect block `addrs[NDIRECT]`.
//!
//! These functions are the native arm of the VFS dispatch in
//! `fs::inode`; the ones that touch cached inode state are entered
//! with the inode's sleep-lock held (the caller's `InodeGuard` is the
//! witness), and every disk write happens inside a [`Tx`].

use core::cmp;
use core::convert::TryInto;

use zerocopy::{AsBytes, FromBytes};

use super::{Dinode, Tx, DINODE_SIZE, IPB, MAXFILE, NDIRECT, NINDIRECT};
use crate::bio;
use crate::device;
use crate::fs::inode::{InodeInner, InodeRef, InodeType};
use crate::fs::stat::{Stat, T_DEV, T_DIR, T_FILE};
use crate::fs::{path::FileName, Dirent, SbId, DIRENT_SIZE};
use crate::kernel::Kernel;
use crate::param::{BSIZE, NDEV};
use crate::{KernelError, Result};

/// Native driver-private part of a cached inode.
#[derive(Default)]
pub struct NativePayload {
    /// Copy of the on-disk block addresses; the last is the indirect
    /// block.
    pub addrs: [u32; NDIRECT + 1],
}

type Inner = InodeInner<NativePayload>;

/// The locked inner data of slot `idx`.
///
/// # Safety
///
/// The slot's sleep-lock must be held by this thread (an `InodeGuard`
/// up the call stack), or the slot must be freshly claimed and still
/// private to this thread.
unsafe fn inner(k: &Kernel, idx: usize) -> &mut Inner {
    &mut *k.itable.inner_raw(idx)
}

fn encode_typ(typ: InodeType) -> (i16, i16, i16) {
    match typ {
        InodeType::None => (0, 0, 0),
        InodeType::Dir => (T_DIR as i16, 0, 0),
        InodeType::File => (T_FILE as i16, 0, 0),
        InodeType::Device { major, minor } => (T_DEV as i16, major as i16, minor as i16),
    }
}

fn decode_typ(typ: i16, major: i16, minor: i16) -> InodeType {
    match typ as u16 {
        0 => InodeType::None,
        T_DIR => InodeType::Dir,
        T_FILE => InodeType::File,
        T_DEV => InodeType::Device {
            major: major as u16,
            minor: minor as u16,
        },
        _ => panic!("unknown on-disk inode type {}", typ),
    }
}

/// Find the inode with number `inum` on `sb` and return the
/// in-memory copy. Does not lock the inode and does not read it from
/// disk. A newly cached inode links its liveness to the device's by
/// taking a device reference.
pub fn iget(k: &Kernel, sb: SbId, inum: u32) -> InodeRef {
    let dev = super::state_dev(k, sb);
    let (idx, fresh) = k.itable.get(sb, inum, Some(dev));
    if fresh {
        // After the cache lock is released: device table before
        // inode cache in the lock order.
        device::device_get(k, dev);
    }
    InodeRef::Native(idx)
}

/// Allocate an inode on `sb`, marked allocated on disk with `typ`.
/// Returns an unlocked but allocated and referenced inode.
pub fn ialloc(k: &Kernel, sb: SbId, typ: InodeType) -> Result<InodeRef> {
    let tx = Tx::begin(k, sb);
    let ninodes = tx.geometry().ninodes;
    for inum in 1..ninodes {
        let mut bp = bio::bread(k, tx.dev(), tx.geometry().iblock(inum));
        let off = (inum as usize % IPB) * DINODE_SIZE;
        let dip = Dinode::read_from(&bp.data()[off..off + DINODE_SIZE]).unwrap();
        if dip.typ == 0 {
            // a free inode
            let mut dip = Dinode::default();
            let (t, major, minor) = encode_typ(typ);
            dip.typ = t;
            dip.major = major;
            dip.minor = minor;
            bp.data_mut()[off..off + DINODE_SIZE].copy_from_slice(dip.as_bytes());
            // mark it allocated on the disk
            tx.write(bp);
            return Ok(iget(k, sb, inum));
        }
    }
    panic!("ialloc: no inodes");
}

/// Reads the inode from disk if the cached copy is not valid. Runs
/// under the inode's sleep-lock, on the way into an `InodeGuard`.
pub fn ilock_load(k: &Kernel, idx: usize) {
    // SAFETY: caller holds the slot's sleep-lock.
    let inner = unsafe { inner(k, idx) };
    if inner.valid {
        return;
    }
    let meta = k.itable.meta_at(idx);
    let sb = meta.sb.expect("ilock: no superblock");
    let vol = super::volume(k, sb);

    let bp = bio::bread(k, vol.dev, vol.sb.iblock(meta.inum));
    let off = (meta.inum as usize % IPB) * DINODE_SIZE;
    let dip = Dinode::read_from(&bp.data()[off..off + DINODE_SIZE]).unwrap();
    drop(bp);

    inner.typ = decode_typ(dip.typ, dip.major, dip.minor);
    inner.nlink = dip.nlink;
    inner.size = dip.size;
    inner.private.addrs = dip.addrs;
    inner.valid = true;
    assert_ne!(inner.typ, InodeType::None, "ilock: no type");
}

/// Copy a modified in-memory inode to disk within `tx`. Must be
/// called after every change to a field that lives on disk, since the
/// cache is write-through.
fn iupdate_tx(k: &Kernel, idx: usize, tx: &Tx<'_>) {
    // SAFETY: caller holds the slot's sleep-lock.
    let inner = unsafe { inner(k, idx) };
    let meta = k.itable.meta_at(idx);

    let (t, major, minor) = encode_typ(inner.typ);
    let dip = Dinode {
        typ: t,
        major,
        minor,
        nlink: inner.nlink,
        size: inner.size,
        addrs: inner.private.addrs,
    };

    let mut bp = bio::bread(k, tx.dev(), tx.geometry().iblock(meta.inum));
    let off = (meta.inum as usize % IPB) * DINODE_SIZE;
    bp.data_mut()[off..off + DINODE_SIZE].copy_from_slice(dip.as_bytes());
    tx.write(bp);
}

pub fn iupdate(k: &Kernel, idx: usize) {
    let sb = k.itable.meta_at(idx).sb.expect("iupdate");
    let tx = Tx::begin(k, sb);
    iupdate_tx(k, idx, &tx);
}

/// Return the disk block address of the `bn`th block in the inode.
/// With a transaction, missing blocks are allocated on demand;
/// without one the block must exist.
fn bmap(k: &Kernel, idx: usize, bn: usize, tx: Option<&Tx<'_>>) -> u32 {
    // SAFETY: caller holds the slot's sleep-lock.
    let inner = unsafe { inner(k, idx) };
    let sb = k.itable.meta_at(idx).sb.expect("bmap");
    let vol = super::volume(k, sb);

    if bn < NDIRECT {
        let mut addr = inner.private.addrs[bn];
        if addr == 0 {
            addr = tx.expect("bmap: read hole").balloc();
            inner.private.addrs[bn] = addr;
        }
        return addr;
    }
    let bn = bn - NDIRECT;
    assert!(bn < NINDIRECT, "bmap: out of range");

    // Load the indirect block, allocating if necessary.
    let mut indirect = inner.private.addrs[NDIRECT];
    if indirect == 0 {
        indirect = tx.expect("bmap: read hole").balloc();
        inner.private.addrs[NDIRECT] = indirect;
    }
    let mut bp = bio::bread(k, vol.dev, indirect);
    let off = bn * 4;
    let mut addr = u32::from_le_bytes(bp.data()[off..off + 4].try_into().unwrap());
    if addr == 0 {
        let tx = tx.expect("bmap: read hole");
        addr = tx.balloc();
        bp.data_mut()[off..off + 4].copy_from_slice(&addr.to_le_bytes());
        tx.write(bp);
    }
    addr
}

/// Truncate inode (discard contents) within `tx`. Called with the
/// inode's sleep-lock held.
fn itrunc_tx(k: &Kernel, idx: usize, tx: &Tx<'_>) {
    // SAFETY: caller holds the slot's sleep-lock.
    let inner = unsafe { inner(k, idx) };

    for addr in inner.private.addrs[..NDIRECT].iter_mut() {
        if *addr != 0 {
            tx.bfree(*addr);
            *addr = 0;
        }
    }

    let indirect = inner.private.addrs[NDIRECT];
    if indirect != 0 {
        let bp = bio::bread(k, tx.dev(), indirect);
        for i in 0..NINDIRECT {
            let a = u32::from_le_bytes(bp.data()[i * 4..i * 4 + 4].try_into().unwrap());
            if a != 0 {
                tx.bfree(a);
            }
        }
        drop(bp);
        tx.bfree(indirect);
        inner.private.addrs[NDIRECT] = 0;
    }

    inner.size = 0;
    iupdate_tx(k, idx, tx);
}

/// Truncate in a transaction of its own (the O_TRUNC path).
pub fn itrunc_logged(k: &Kernel, idx: usize) {
    let sb = k.itable.meta_at(idx).sb.expect("itrunc");
    let tx = Tx::begin(k, sb);
    itrunc_tx(k, idx, &tx);
}

/// Drop a reference to an in-memory inode.
///
/// If that was the last reference and the inode has no links to it,
/// free the inode and its content on disk. The freeing transaction is
/// entered before the sleep-lock is retaken, honoring the lock order;
/// ref == 1 with nlink == 0 means no directory entry can revive the
/// inode in between, so the re-check after retaking the lock is just
/// paranoia against a racing `iget` holder.
pub fn iput(k: &Kernel, idx: usize) {
    let sb = k.itable.meta_at(idx).sb.expect("iput");

    // SAFETY: paired with the unlocks below.
    unsafe { k.itable.lock_slot(idx) };
    let needs_free = {
        let ip = unsafe { inner(k, idx) };
        ip.valid && ip.nlink == 0 && k.itable.meta_at(idx).refcnt == 1
    };
    if needs_free {
        // inode has no links and no other references: truncate and
        // free. The transaction must be entered outside the
        // sleep-lock, so drop and retake it; ref == 1 with nlink == 0
        // means nothing can revive the inode in between.
        unsafe { k.itable.unlock_slot(idx) };
        let tx = Tx::begin(k, sb);
        unsafe { k.itable.lock_slot(idx) };
        itrunc_tx(k, idx, &tx);
        {
            let ip = unsafe { inner(k, idx) };
            ip.typ = InodeType::None;
        }
        iupdate_tx(k, idx, &tx);
        unsafe { inner(k, idx) }.valid = false;
        unsafe { k.itable.unlock_slot(idx) };
        drop(tx);
    } else {
        unsafe { k.itable.unlock_slot(idx) };
    }

    // The slot's device share is recorded in its meta: the superblock
    // may already be torn down when the last reference arrives here.
    let dev = k.itable.meta_at(idx).dev.expect("iput: no device");
    if k.itable.put_ref(idx) == 0 {
        device::device_put(k, dev);
    }
}

/// Read data from the inode. Device inodes forward to the character
/// device registered under their major number.
pub fn readi(k: &Kernel, idx: usize, off: u32, dst: &mut [u8]) -> Result<usize> {
    // SAFETY: caller holds the slot's sleep-lock.
    let (typ, size) = {
        let inner = unsafe { inner(k, idx) };
        (inner.typ, inner.size)
    };

    if let InodeType::Device { major, .. } = typ {
        if major as usize >= NDEV {
            return Err(KernelError::Inval);
        }
        let read = k.devsw.lock()[major as usize].read.ok_or(KernelError::Inval)?;
        return read(k, dst);
    }

    let mut n = dst.len() as u32;
    if off > size || off.checked_add(n).is_none() {
        return Err(KernelError::Inval);
    }
    if off + n > size {
        n = size - off;
    }

    let sb = k.itable.meta_at(idx).sb.expect("readi");
    let dev = super::volume(k, sb).dev;
    let mut tot = 0;
    let mut off = off;
    while tot < n {
        let bp = bio::bread(k, dev, bmap(k, idx, off as usize / BSIZE, None));
        let m = cmp::min(n - tot, BSIZE as u32 - off % BSIZE as u32);
        let begin = (off % BSIZE as u32) as usize;
        dst[tot as usize..(tot + m) as usize]
            .copy_from_slice(&bp.data()[begin..begin + m as usize]);
        tot += m;
        off += m;
    }
    Ok(n as usize)
}

/// Write data to the inode, growing it as needed (but never beyond
/// MAXFILE blocks). Device inodes forward to the character device.
pub fn writei(k: &Kernel, idx: usize, src: &[u8], off: u32) -> Result<usize> {
    // SAFETY: caller holds the slot's sleep-lock.
    let (typ, size) = {
        let inner = unsafe { inner(k, idx) };
        (inner.typ, inner.size)
    };

    if let InodeType::Device { major, .. } = typ {
        if major as usize >= NDEV {
            return Err(KernelError::Inval);
        }
        let write = k.devsw.lock()[major as usize].write.ok_or(KernelError::Inval)?;
        return write(k, src);
    }

    let n = src.len() as u32;
    if off > size || off.checked_add(n).is_none() {
        return Err(KernelError::Inval);
    }
    if (off + n) as usize > MAXFILE * BSIZE {
        return Err(KernelError::Inval);
    }

    let sb = k.itable.meta_at(idx).sb.expect("writei");
    let tx = Tx::begin(k, sb);
    let mut tot = 0;
    let mut off = off;
    while tot < n {
        let mut bp = bio::bread(k, tx.dev(), bmap(k, idx, off as usize / BSIZE, Some(&tx)));
        let m = cmp::min(n - tot, BSIZE as u32 - off % BSIZE as u32);
        let begin = (off % BSIZE as u32) as usize;
        bp.data_mut()[begin..begin + m as usize]
            .copy_from_slice(&src[tot as usize..(tot + m) as usize]);
        tx.write(bp);
        tot += m;
        off += m;
    }

    {
        // SAFETY: caller holds the slot's sleep-lock.
        let inner = unsafe { inner(k, idx) };
        if off > inner.size {
            inner.size = off;
        }
    }
    // Write the inode back even if the size didn't change, because
    // bmap may have added a block to addrs.
    iupdate_tx(k, idx, &tx);
    Ok(n as usize)
}

/// Copy stat information from the inode.
pub fn stati(k: &Kernel, idx: usize) -> Stat {
    // SAFETY: caller holds the slot's sleep-lock.
    let inner = unsafe { inner(k, idx) };
    let meta = k.itable.meta_at(idx);
    let dev = super::state_dev(k, meta.sb.expect("stati"));
    let (t, _, _) = encode_typ(inner.typ);
    Stat {
        dev: dev.0 as i32,
        ino: meta.inum,
        typ: t as u16,
        nlink: inner.nlink,
        size: inner.size,
    }
}

// Directories

/// Look for a directory entry in a directory. If found, return the
/// referenced target inode and the byte offset of the entry.
pub fn dirlookup(k: &Kernel, idx: usize, name: &FileName) -> Result<(InodeRef, u32)> {
    let sb = k.itable.meta_at(idx).sb.expect("dirlookup");
    // SAFETY: caller holds the slot's sleep-lock.
    let size = unsafe { inner(k, idx) }.size;

    let mut de = [0u8; DIRENT_SIZE];
    for off in (0..size).step_by(DIRENT_SIZE) {
        let n = readi(k, idx, off, &mut de)?;
        assert_eq!(n, DIRENT_SIZE, "dirlookup read");
        let de = Dirent::read_from(&de[..]).unwrap();
        if de.inum == 0 {
            continue;
        }
        if de.get_name() == name {
            // entry matches path element
            return Ok((iget(k, sb, de.inum as u32), off));
        }
    }
    Err(KernelError::NoEnt)
}

/// Write a new directory entry (`name` -> `ip`) into the directory,
/// reusing the first free slot or appending.
pub fn dirlink(k: &Kernel, idx: usize, name: &FileName, ip: InodeRef) -> Result<()> {
    // Check that name is not present.
    if let Ok((existing, _)) = dirlookup(k, idx, name) {
        existing.put(k);
        return Err(KernelError::Exist);
    }

    let inum = ip.meta(k).inum;
    debug_assert_eq!(ip.meta(k).sb, k.itable.meta_at(idx).sb, "dirlink across fs");

    // Look for an empty dirent.
    // SAFETY: caller holds the slot's sleep-lock.
    let size = unsafe { inner(k, idx) }.size;
    let mut off = size;
    let mut buf = [0u8; DIRENT_SIZE];
    for o in (0..size).step_by(DIRENT_SIZE) {
        let n = readi(k, idx, o, &mut buf)?;
        assert_eq!(n, DIRENT_SIZE, "dirlink read");
        if Dirent::read_from(&buf[..]).unwrap().inum == 0 {
            off = o;
            break;
        }
    }

    let mut de = Dirent {
        inum: inum as u16,
        ..Dirent::default()
    };
    de.set_name(name);
    let n = writei(k, idx, de.as_bytes(), off)?;
    assert_eq!(n, DIRENT_SIZE, "dirlink");
    Ok(())
}

/// Is the directory empty except for "." and ".." ?
pub fn is_dir_empty(k: &Kernel, idx: usize) -> bool {
    // SAFETY: caller holds the slot's sleep-lock.
    let size = unsafe { inner(k, idx) }.size;
    let mut de = [0u8; DIRENT_SIZE];
    for off in ((2 * DIRENT_SIZE) as u32..size).step_by(DIRENT_SIZE) {
        let n = readi(k, idx, off, &mut de).expect("isdirempty: readi");
        assert_eq!(n, DIRENT_SIZE, "isdirempty: readi");
        if Dirent::read_from(&de[..]).unwrap().inum != 0 {
            return false;
        }
    }
    true
}
