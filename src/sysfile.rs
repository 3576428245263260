//! File-level operations built on the VFS: create/open/read/write,
//! link/unlink, mkdir/mknod, chdir, stat.
//!
//! These are the library-level equivalents of the file syscalls; an
//! open file holds both the inode and the mount it was resolved
//! through, which is what makes `umount` refuse while files are open.

use bitflags::bitflags;

use crate::device;
use crate::fs::inode::{InodeRef, InodeType};
use crate::fs::namei::{namei, nameimount, nameiparent};
use crate::fs::path::{FileName, Path};
use crate::fs::stat::Stat;
use crate::fs::{Dirent, DIRENT_SIZE};
use crate::kernel::Kernel;
use crate::mount::{self, MountId};
use crate::param::{BSIZE, MAXOPBLOCKS};
use crate::proc::Proc;
use crate::{KernelError, Result};
use zerocopy::AsBytes;

bitflags! {
    pub struct OpenFlags: u32 {
        const RDONLY = 0x000;
        const WRONLY = 0x001;
        const RDWR = 0x002;
        const CREATE = 0x200;
        const TRUNC = 0x400;
    }
}

/// An open file: a long-term reference to an inode and to the mount
/// it was reached through.
pub struct OpenFile {
    pub ip: InodeRef,
    pub mnt: MountId,
}

/// Creates `path` as `typ`, returning a referenced (unlocked) inode.
/// An existing file satisfies a `File` request, open(O_CREATE)-style;
/// anything else existing is an error.
pub fn create(k: &Kernel, p: &Proc, path: &Path, typ: InodeType) -> Result<InodeRef> {
    let (dp, name) = nameiparent(k, p, path)?;
    let mut dg = dp.lock(k);

    match dg.dirlookup(name) {
        Ok((ip, _)) => {
            dg.unlockput();
            if typ == InodeType::File {
                let g = ip.lock(k);
                let t = g.typ();
                drop(g);
                if matches!(t, InodeType::File | InodeType::Device { .. }) {
                    return Ok(ip);
                }
            }
            ip.put(k);
            return Err(KernelError::Exist);
        }
        Err(KernelError::NoEnt) => {}
        Err(e) => {
            dg.unlockput();
            return Err(e);
        }
    }

    let sb = dp.sb(k);
    let ip = match sb.alloc_inode(k, typ) {
        Ok(ip) => ip,
        Err(e) => {
            dg.unlockput();
            return Err(e);
        }
    };

    let mut g = ip.lock(k);
    g.set_nlink(1);
    g.update();

    let linked = (|| -> Result<()> {
        if typ == InodeType::Dir {
            // "." and ".." first, then make us reachable; the parent
            // gains a link from "..".
            dg.set_nlink(dg.nlink() + 1);
            dg.update();
            g.dirlink(FileName::from_bytes(b"."), ip)?;
            g.dirlink(FileName::from_bytes(b".."), dp)?;
        }
        dg.dirlink(name, ip)
    })();

    match linked {
        Ok(()) => {
            drop(g);
            dg.unlockput();
            Ok(ip)
        }
        Err(e) => {
            // Undo the allocation: drop our link count and let iput
            // free it.
            g.set_nlink(0);
            g.update();
            g.unlockput();
            dg.unlockput();
            Err(e)
        }
    }
}

pub fn open(k: &Kernel, p: &Proc, path: &Path, flags: OpenFlags) -> Result<OpenFile> {
    let created = if flags.contains(OpenFlags::CREATE) {
        Some(create(k, p, path, InodeType::File)?)
    } else {
        None
    };

    let (ip, mnt) = match nameimount(k, p, path) {
        Ok(pair) => pair,
        Err(e) => {
            if let Some(c) = created {
                c.put(k);
            }
            return Err(e);
        }
    };
    if let Some(c) = created {
        // Keep the resolver's reference; the create-time one is
        // redundant.
        c.put(k);
    }

    let mut g = ip.lock(k);
    if g.typ() == InodeType::Dir
        && flags.intersects(OpenFlags::WRONLY | OpenFlags::RDWR)
    {
        g.unlockput();
        mount::mntput(k, mnt);
        return Err(KernelError::Inval);
    }
    if flags.contains(OpenFlags::TRUNC) && g.typ() == InodeType::File {
        g.truncate();
    }
    drop(g);

    Ok(OpenFile { ip, mnt })
}

pub fn close(k: &Kernel, f: OpenFile) {
    f.ip.put(k);
    mount::mntput(k, f.mnt);
}

pub fn read_file(k: &Kernel, ip: InodeRef, off: u32, dst: &mut [u8]) -> Result<usize> {
    let mut g = ip.lock(k);
    g.readi(off, dst)
}

/// Writes in chunks small enough that each inode operation fits the
/// log.
pub fn write_file(k: &Kernel, ip: InodeRef, src: &[u8], off: u32) -> Result<usize> {
    let max = ((MAXOPBLOCKS - 4) / 2) * BSIZE;
    let mut done = 0;
    while done < src.len() {
        let n = core::cmp::min(max, src.len() - done);
        let mut g = ip.lock(k);
        let written = g.writei(&src[done..done + n], off + done as u32)?;
        drop(g);
        done += written;
        if written < n {
            break;
        }
    }
    Ok(done)
}

pub fn mkdir(k: &Kernel, p: &Proc, path: &Path) -> Result<()> {
    let ip = create(k, p, path, InodeType::Dir)?;
    ip.put(k);
    Ok(())
}

pub fn mknod(k: &Kernel, p: &Proc, path: &Path, major: u16, minor: u16) -> Result<()> {
    let ip = create(k, p, path, InodeType::Device { major, minor })?;
    ip.put(k);
    Ok(())
}

/// Creates `new` as another link to `old`. Both must live on the
/// same filesystem; directories cannot be linked.
pub fn link(k: &Kernel, p: &Proc, old: &Path, new: &Path) -> Result<()> {
    let ip = namei(k, p, old)?;

    {
        let mut g = ip.lock(k);
        if g.typ() == InodeType::Dir {
            g.unlockput();
            return Err(KernelError::Inval);
        }
        g.set_nlink(g.nlink() + 1);
        g.update();
    }

    let undo = |k: &Kernel| {
        let mut g = ip.lock(k);
        g.set_nlink(g.nlink() - 1);
        g.update();
        g.unlockput();
    };

    let (dp, name) = match nameiparent(k, p, new) {
        Ok(v) => v,
        Err(e) => {
            undo(k);
            return Err(e);
        }
    };
    if dp.sb(k) != ip.sb(k) {
        dp.put(k);
        undo(k);
        return Err(KernelError::Inval);
    }

    let mut dg = dp.lock(k);
    if let Err(e) = dg.dirlink(name, ip) {
        dg.unlockput();
        undo(k);
        return Err(e);
    }
    dg.unlockput();
    ip.put(k);
    Ok(())
}

pub fn unlink(k: &Kernel, p: &Proc, path: &Path) -> Result<()> {
    let (dp, name) = nameiparent(k, p, path)?;
    let mut dg = dp.lock(k);

    // Cannot unlink "." or "..".
    if name.as_bytes() == b"." || name.as_bytes() == b".." {
        dg.unlockput();
        return Err(KernelError::Inval);
    }

    let (ip, off) = match dg.dirlookup(name) {
        Ok(found) => found,
        Err(e) => {
            dg.unlockput();
            return Err(e);
        }
    };

    let mut g = ip.lock(k);
    assert!(g.nlink() >= 1, "unlink: nlink < 1");
    if g.typ() == InodeType::Dir && !g.is_dir_empty() {
        g.unlockput();
        dg.unlockput();
        return Err(KernelError::Inval);
    }
    if device::holds_inode(k, ip) {
        // The file backs a live loop device.
        g.unlockput();
        dg.unlockput();
        return Err(KernelError::Busy);
    }

    let zero = Dirent::default();
    let n = dg
        .writei(zero.as_bytes(), off)
        .expect("unlink: dirent write");
    assert_eq!(n, DIRENT_SIZE, "unlink: dirent write");
    if g.typ() == InodeType::Dir {
        dg.set_nlink(dg.nlink() - 1);
        dg.update();
    }
    dg.unlockput();

    g.set_nlink(g.nlink() - 1);
    g.update();
    g.unlockput();
    Ok(())
}

pub fn chdir(k: &Kernel, p: &mut Proc, path: &Path) -> Result<()> {
    let (ip, mnt) = nameimount(k, p, path)?;
    let g = ip.lock(k);
    if g.typ() != InodeType::Dir {
        g.unlockput();
        mount::mntput(k, mnt);
        return Err(KernelError::NotDir);
    }
    drop(g);

    if let Some(old) = p.cwd.take() {
        old.put(k);
    }
    if let Some(old) = p.cwd_mount.take() {
        mount::mntput(k, old);
    }
    p.cwd = Some(ip);
    p.cwd_mount = Some(mnt);
    Ok(())
}

pub fn stat(k: &Kernel, p: &Proc, path: &Path) -> Result<Stat> {
    let ip = namei(k, p, path)?;
    let g = ip.lock(k);
    let st = g.stat();
    g.unlockput();
    Ok(st)
}
