//! The object file system: an inode namespace over a flat key/value
//! object store.
//!
//! Each inode `N` is two objects: `inodeN`, a fixed metadata record,
//! and `dataN`, the raw content. A directory's content is a packed
//! dirent sequence, exactly as in the native FS. Inode numbers come
//! from a `counter` object. File size is not stored in the metadata
//! record; it is the size of the data object.

use core::convert::TryInto;

use zerocopy::{AsBytes, FromBytes};

use super::inode::{InodeInner, InodeRef, InodeType};
use super::path::FileName;
use super::stat::{Stat, T_DEV, T_DIR, T_FILE};
use super::{Dirent, FsPrivate, SbId, DIRENT_SIZE, ROOTINO};
use crate::device::{self, DeviceId, DeviceKind};
use crate::kernel::Kernel;
use crate::{KernelError, Result};

/// Obj driver-private part of a cached inode: everything lives in the
/// store, keyed by the inode number.
#[derive(Default)]
pub struct ObjPayload;

pub struct ObjFsState {
    pub dev: DeviceId,
    pub store: usize,
}

/// On-store inode metadata record.
#[repr(C)]
#[derive(AsBytes, FromBytes, Clone, Copy, Default)]
struct ObjDinode {
    typ: i16,
    major: i16,
    minor: i16,
    nlink: i16,
}

fn meta_id(inum: u32) -> String {
    format!("inode{}", inum)
}

fn data_id(inum: u32) -> String {
    format!("data{}", inum)
}

fn store_of(k: &Kernel, sb: SbId) -> usize {
    match &k.superblocks.inner(sb).fs {
        FsPrivate::Obj(st) => st.store,
        _ => panic!("not an obj fs"),
    }
}

fn dev_of(k: &Kernel, sb: SbId) -> DeviceId {
    match &k.superblocks.inner(sb).fs {
        FsPrivate::Obj(st) => st.dev,
        _ => panic!("not an obj fs"),
    }
}

type Inner = InodeInner<ObjPayload>;

/// The locked inner data of slot `idx`.
///
/// # Safety
///
/// The slot's sleep-lock must be held by this thread, or the slot
/// must be freshly claimed and still private to this thread.
unsafe fn inner(k: &Kernel, idx: usize) -> &mut Inner {
    &mut *k.obj_itable.inner_raw(idx)
}

/// Binds a fresh superblock slot to an obj device.
pub fn fsinit(k: &Kernel, sb: SbId, dev: DeviceId) {
    let store = match k.devices.kind(dev) {
        DeviceKind::Obj { store } => store,
        _ => panic!("obj fs on non-obj device"),
    };
    let mut inner = k.superblocks.inner(sb);
    inner.fs = FsPrivate::Obj(ObjFsState { dev, store });
    inner.root_ip = None;
}

/// Creates the root directory on a fresh store and installs the root
/// inode.
pub fn fsstart(k: &Kernel, sb: SbId) {
    let store = store_of(k, sb);
    {
        let mut s = k.devices.obj_store(store);
        if s.get_object("counter").is_err() {
            s.add_object("counter", &(ROOTINO + 1).to_le_bytes()).unwrap();

            let root = ObjDinode {
                typ: T_DIR as i16,
                nlink: 1,
                ..ObjDinode::default()
            };
            s.add_object(&meta_id(ROOTINO), root.as_bytes()).unwrap();

            let mut dots = Vec::new();
            for name in [&b"."[..], &b".."[..]] {
                let mut de = Dirent {
                    inum: ROOTINO as u16,
                    ..Dirent::default()
                };
                de.set_name(FileName::from_bytes(name));
                dots.extend_from_slice(de.as_bytes());
            }
            s.add_object(&data_id(ROOTINO), &dots).unwrap();
        }
    }
    let root = iget(k, sb, ROOTINO);
    k.superblocks.inner(sb).root_ip = Some(root);
}

pub fn iget(k: &Kernel, sb: SbId, inum: u32) -> InodeRef {
    let dev = dev_of(k, sb);
    let (idx, fresh) = k.obj_itable.get(sb, inum, Some(dev));
    if fresh {
        device::device_get(k, dev);
    }
    InodeRef::Obj(idx)
}

/// Allocates a fresh inode number and its two objects.
pub fn ialloc(k: &Kernel, sb: SbId, typ: InodeType) -> Result<InodeRef> {
    let store = store_of(k, sb);
    let inum = {
        let mut s = k.devices.obj_store(store);
        let counter = s.get_object("counter")?;
        let inum = u32::from_le_bytes(counter[..4].try_into().unwrap());
        s.rewrite_object("counter", &(inum + 1).to_le_bytes())?;

        let (t, major, minor) = match typ {
            InodeType::None => (0, 0, 0),
            InodeType::Dir => (T_DIR as i16, 0, 0),
            InodeType::File => (T_FILE as i16, 0, 0),
            InodeType::Device { major, minor } => (T_DEV as i16, major as i16, minor as i16),
        };
        let din = ObjDinode {
            typ: t,
            major,
            minor,
            nlink: 0,
        };
        s.add_object(&meta_id(inum), din.as_bytes())?;
        s.add_object(&data_id(inum), &[])?;
        inum
    };
    Ok(iget(k, sb, inum))
}

pub fn ilock_load(k: &Kernel, idx: usize) {
    // SAFETY: caller holds the slot's sleep-lock.
    let inner = unsafe { inner(k, idx) };
    if inner.valid {
        return;
    }
    let meta = k.obj_itable.meta_at(idx);
    let sb = meta.sb.expect("obj ilock: no superblock");
    let store = store_of(k, sb);

    let s = k.devices.obj_store(store);
    let blob = s.get_object(&meta_id(meta.inum)).expect("obj ilock: no metadata");
    let din = ObjDinode::read_from_prefix(&blob[..]).unwrap();
    let size = s.object_size(&data_id(meta.inum)).unwrap_or(0);
    drop(s);

    inner.typ = match din.typ as u16 {
        T_DIR => InodeType::Dir,
        T_FILE => InodeType::File,
        T_DEV => InodeType::Device {
            major: din.major as u16,
            minor: din.minor as u16,
        },
        _ => panic!("obj ilock: no type"),
    };
    inner.nlink = din.nlink;
    inner.size = size as u32;
    inner.valid = true;
}

pub fn iupdate(k: &Kernel, idx: usize) {
    // SAFETY: caller holds the slot's sleep-lock.
    let inner = unsafe { inner(k, idx) };
    let meta = k.obj_itable.meta_at(idx);
    let store = store_of(k, meta.sb.expect("obj iupdate"));

    let (t, major, minor) = match inner.typ {
        InodeType::None => (0, 0, 0),
        InodeType::Dir => (T_DIR as i16, 0, 0),
        InodeType::File => (T_FILE as i16, 0, 0),
        InodeType::Device { major, minor } => (T_DEV as i16, major as i16, minor as i16),
    };
    let din = ObjDinode {
        typ: t,
        major,
        minor,
        nlink: inner.nlink,
    };
    k.devices
        .obj_store(store)
        .rewrite_object(&meta_id(meta.inum), din.as_bytes())
        .expect("obj iupdate");
}

pub fn iput(k: &Kernel, idx: usize) {
    let meta = k.obj_itable.meta_at(idx);
    let sb = meta.sb.expect("obj iput");

    // SAFETY: paired with the unlock below.
    unsafe { k.obj_itable.lock_slot(idx) };
    {
        let inner = unsafe { inner(k, idx) };
        if inner.valid && inner.nlink == 0 && k.obj_itable.meta_at(idx).refcnt == 1 {
            // No links and no other references: delete the objects.
            let store = store_of(k, sb);
            let mut s = k.devices.obj_store(store);
            s.delete_object(&data_id(meta.inum)).expect("obj iput: data");
            s.delete_object(&meta_id(meta.inum)).expect("obj iput: meta");
            drop(s);
            inner.valid = false;
        }
    }
    unsafe { k.obj_itable.unlock_slot(idx) };

    // Read from the slot meta: the superblock may already be gone.
    let dev = k.obj_itable.meta_at(idx).dev.expect("obj iput: no device");
    if k.obj_itable.put_ref(idx) == 0 {
        device::device_put(k, dev);
    }
}

pub fn readi(k: &Kernel, idx: usize, off: u32, dst: &mut [u8]) -> Result<usize> {
    // SAFETY: caller holds the slot's sleep-lock.
    let (typ, size) = {
        let inner = unsafe { inner(k, idx) };
        (inner.typ, inner.size)
    };
    if let InodeType::Device { major, .. } = typ {
        if major as usize >= crate::param::NDEV {
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

    let meta = k.obj_itable.meta_at(idx);
    let store = store_of(k, meta.sb.expect("obj readi"));
    let blob = k.devices.obj_store(store).get_object(&data_id(meta.inum))?;
    dst[..n as usize].copy_from_slice(&blob[off as usize..(off + n) as usize]);
    Ok(n as usize)
}

pub fn writei(k: &Kernel, idx: usize, src: &[u8], off: u32) -> Result<usize> {
    // SAFETY: caller holds the slot's sleep-lock.
    let (typ, size) = {
        let inner = unsafe { inner(k, idx) };
        (inner.typ, inner.size)
    };
    if let InodeType::Device { major, .. } = typ {
        if major as usize >= crate::param::NDEV {
            return Err(KernelError::Inval);
        }
        let write = k.devsw.lock()[major as usize].write.ok_or(KernelError::Inval)?;
        return write(k, src);
    }

    let n = src.len() as u32;
    if off > size || off.checked_add(n).is_none() {
        return Err(KernelError::Inval);
    }

    let meta = k.obj_itable.meta_at(idx);
    let store = store_of(k, meta.sb.expect("obj writei"));
    {
        let mut s = k.devices.obj_store(store);
        let mut blob = s.get_object(&data_id(meta.inum))?;
        if blob.len() < (off + n) as usize {
            blob.resize((off + n) as usize, 0);
        }
        blob[off as usize..(off + n) as usize].copy_from_slice(src);
        s.rewrite_object(&data_id(meta.inum), &blob)?;
    }

    // SAFETY: caller holds the slot's sleep-lock.
    let inner = unsafe { inner(k, idx) };
    if off + n > inner.size {
        inner.size = off + n;
    }
    Ok(n as usize)
}

/// Discards the inode's contents.
pub fn itrunc(k: &Kernel, idx: usize) {
    let meta = k.obj_itable.meta_at(idx);
    let store = store_of(k, meta.sb.expect("obj itrunc"));
    k.devices
        .obj_store(store)
        .rewrite_object(&data_id(meta.inum), &[])
        .expect("obj itrunc");
    // SAFETY: caller holds the slot's sleep-lock.
    unsafe { inner(k, idx) }.size = 0;
}

pub fn stati(k: &Kernel, idx: usize) -> Stat {
    // SAFETY: caller holds the slot's sleep-lock.
    let inner = unsafe { inner(k, idx) };
    let meta = k.obj_itable.meta_at(idx);
    let dev = dev_of(k, meta.sb.expect("obj stati"));
    let typ = match inner.typ {
        InodeType::None => 0,
        InodeType::Dir => T_DIR,
        InodeType::File => T_FILE,
        InodeType::Device { .. } => T_DEV,
    };
    Stat {
        dev: dev.0 as i32,
        ino: meta.inum,
        typ,
        nlink: inner.nlink,
        size: inner.size,
    }
}

// Directories: same packed dirent format as the native FS, stored in
// the directory's data object.

pub fn dirlookup(k: &Kernel, idx: usize, name: &FileName) -> Result<(InodeRef, u32)> {
    let sb = k.obj_itable.meta_at(idx).sb.expect("obj dirlookup");
    // SAFETY: caller holds the slot's sleep-lock.
    let size = unsafe { inner(k, idx) }.size;

    let mut buf = [0u8; DIRENT_SIZE];
    for off in (0..size).step_by(DIRENT_SIZE) {
        let n = readi(k, idx, off, &mut buf)?;
        assert_eq!(n, DIRENT_SIZE, "obj dirlookup read");
        let de = Dirent::read_from(&buf[..]).unwrap();
        if de.inum == 0 {
            continue;
        }
        if de.get_name() == name {
            return Ok((iget(k, sb, de.inum as u32), off));
        }
    }
    Err(KernelError::NoEnt)
}

pub fn dirlink(k: &Kernel, idx: usize, name: &FileName, ip: InodeRef) -> Result<()> {
    if let Ok((existing, _)) = dirlookup(k, idx, name) {
        existing.put(k);
        return Err(KernelError::Exist);
    }

    let inum = ip.meta(k).inum;
    // SAFETY: caller holds the slot's sleep-lock.
    let size = unsafe { inner(k, idx) }.size;
    let mut off = size;
    let mut buf = [0u8; DIRENT_SIZE];
    for o in (0..size).step_by(DIRENT_SIZE) {
        let n = readi(k, idx, o, &mut buf)?;
        assert_eq!(n, DIRENT_SIZE, "obj dirlink read");
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
    assert_eq!(n, DIRENT_SIZE, "obj dirlink");
    Ok(())
}

pub fn is_dir_empty(k: &Kernel, idx: usize) -> bool {
    // SAFETY: caller holds the slot's sleep-lock.
    let size = unsafe { inner(k, idx) }.size;
    let mut buf = [0u8; DIRENT_SIZE];
    for off in ((2 * DIRENT_SIZE) as u32..size).step_by(DIRENT_SIZE) {
        let n = readi(k, idx, off, &mut buf).expect("obj isdirempty");
        assert_eq!(n, DIRENT_SIZE, "obj isdirempty");
        if Dirent::read_from(&buf[..]).unwrap().inum != 0 {
            return false;
        }
    }
    true
}
