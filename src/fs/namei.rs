//! Pathname resolution across mountpoints.
//!
//! Resolution state is an (inode, mount) pair. Walking starts at the
//! namespace root for absolute paths or at the process cwd otherwise,
//! takes one component at a time, and:
//!   * skips ".",
//!   * for "..", first pops out of a mount whose root we stand on,
//!   * after an ordinary lookup, enters any mount anchored at the
//!     found inode, replacing it with the mounted filesystem's root.
//!
//! Every function returns referenced objects; callers put what they
//! take.

use super::inode::{InodeGuard, InodeRef, InodeType};
use super::path::{FileName, Path};
use crate::kernel::Kernel;
use crate::mount::{self, MountId};
use crate::proc::Proc;
use crate::{KernelError, Result};

/// Resolves `path` to an inode.
pub fn namei(k: &Kernel, p: &Proc, path: &Path) -> Result<InodeRef> {
    let (ip, mnt, _) = namex(k, p, path, false)?;
    mount::mntput(k, mnt);
    Ok(ip)
}

/// Resolves `path` to its parent directory and the final name.
pub fn nameiparent<'p>(
    k: &Kernel,
    p: &Proc,
    path: &'p Path,
) -> Result<(InodeRef, &'p FileName)> {
    let (ip, mnt, name) = namex(k, p, path, true)?;
    mount::mntput(k, mnt);
    Ok((ip, name.expect("nameiparent: no final component")))
}

/// Resolves `path` to an inode and the mount it lives in.
pub fn nameimount(k: &Kernel, p: &Proc, path: &Path) -> Result<(InodeRef, MountId)> {
    let (ip, mnt, _) = namex(k, p, path, false)?;
    Ok((ip, mnt))
}

fn namex<'p>(
    k: &Kernel,
    p: &Proc,
    mut path: &'p Path,
    parent: bool,
) -> Result<(InodeRef, MountId, Option<&'p FileName>)> {
    let ns = p.ns;

    let (mut ip, mut mnt) = if path.is_absolute() {
        let root = k
            .namespaces
            .inner(ns)
            .root
            .expect("namespace without root");
        let mnt = mount::mntdup(k, root);
        (mount::get_mount_root_ip(k, mnt), mnt)
    } else {
        let cwd = p.cwd.expect("process without cwd");
        let cwd_mount = p.cwd_mount.expect("process without cwd mount");
        (cwd.dup(k), mount::mntdup(k, cwd_mount))
    };

    while let Some((rest, name)) = path.skipelem() {
        path = rest;

        if name.as_bytes() == b".." {
            // Standing on the root of a mount: pop to the mountpoint
            // in the parent mount before looking up "..". Stacked
            // mounts pop one level per round.
            loop {
                let slot = k.mounts.slot(mnt);
                if ip != mount::mount_root_of(k, mnt) || slot.parent.is_none() {
                    break;
                }
                let up = slot
                    .mountpoint
                    .expect("mount without mountpoint")
                    .dup(k);
                let parent_mnt = mount::mntdup(k, slot.parent.unwrap());
                ip.put(k);
                mount::mntput(k, mnt);
                ip = up;
                mnt = parent_mnt;
            }
        }

        let mut guard: InodeGuard<'_> = ip.lock(k);
        if guard.typ() != InodeType::Dir {
            guard.unlockput();
            mount::mntput(k, mnt);
            return Err(KernelError::NotDir);
        }
        if parent && path.is_empty_string() {
            // Stop one level early.
            drop(guard);
            return Ok((ip, mnt, Some(name)));
        }
        if name.as_bytes() == b"." {
            drop(guard);
            continue;
        }

        let next = match guard.dirlookup(name) {
            Ok((next, _)) => next,
            Err(e) => {
                guard.unlockput();
                mount::mntput(k, mnt);
                return Err(e);
            }
        };
        guard.unlockput();

        // Crossing a mountpoint yields the mounted root inode.
        if let Some(m2) = mount::mnt_lookup(k, ns, next, mnt) {
            next.put(k);
            let root = mount::get_mount_root_ip(k, m2);
            mount::mntput(k, mnt);
            mnt = m2;
            ip = root;
        } else {
            ip = next;
        }
    }

    if parent {
        ip.put(k);
        mount::mntput(k, mnt);
        return Err(KernelError::NoEnt);
    }
    Ok((ip, mnt, None))
}
