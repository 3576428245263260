//! The mount-family call surface: mount, umount, pivot_root,
//! unshare. Mostly argument checking and reference bookkeeping;
//! the real work happens in `mount` and `mount_ns`.

use arrayvec::ArrayVec;
use log::warn;
use scopeguard::guard;

use crate::device;
use crate::fs::inode::{InodeRef, InodeType};
use crate::fs::namei::{namei, nameimount};
use crate::fs::path::Path;
use crate::fs::synth::SynthKind;
use crate::fs::ROOTINO;
use crate::kernel::Kernel;
use crate::mount::{self, MountReq};
use crate::mount_ns::{self};
use crate::param::{UNION_MAX_LAYERS, UNION_OPTIONS_SEP};
use crate::proc::Proc;
use crate::{KernelError, Result};
use bitflags::bitflags;

bitflags! {
    pub struct UnshareFlags: u32 {
        const MOUNT_NS = 1 << 0;
    }
}

/// Resolves a union option string: a ';'-separated list of layer
/// directory paths, top first. Returns referenced layer inodes.
fn resolve_union_layers(
    k: &Kernel,
    p: &Proc,
    options: &[u8],
) -> Result<ArrayVec<InodeRef, UNION_MAX_LAYERS>> {
    let mut layers: ArrayVec<InodeRef, UNION_MAX_LAYERS> = ArrayVec::new();
    let mut release = guard(&mut layers, |layers| {
        for l in layers.drain(..) {
            l.put(k);
        }
    });

    for part in options.split(|&b| b == UNION_OPTIONS_SEP) {
        if part.is_empty() {
            warn!("unionfs: empty layer path");
            return Err(KernelError::Inval);
        }
        if release.is_full() {
            warn!("unionfs: too many layers");
            return Err(KernelError::Inval);
        }
        let layer = namei(k, p, Path::new(part))?;
        release.push(layer);
        let g = layer.lock(k);
        let typ = g.typ();
        drop(g);
        if typ != InodeType::Dir {
            warn!("unionfs: layer is not a directory");
            return Err(KernelError::NotDir);
        }
    }
    if release.is_empty() {
        return Err(KernelError::Inval);
    }
    Ok(scopeguard::ScopeGuard::into_inner(release).clone())
}

/// mount(options, target_path, fstype).
///
/// fstype selects the filesystem: "bind", "objfs", "union", "proc",
/// "cgroup"; anything else mounts a native FS from a loop device
/// backed by the file at `options`.
pub fn sys_mount(k: &Kernel, p: &Proc, options: &[u8], target: &[u8], fstype: &[u8]) -> Result<()> {
    let (dest_ip, parent) = nameimount(k, p, Path::new(target))?;
    // The parent lookup reference is dropped on every path out of
    // this function; mount takes its own.
    let put_parent = guard((), |()| {
        mount::mntput(k, parent);
    });

    if dest_ip.meta(k).inum == ROOTINO {
        warn!("can't mount over a filesystem root directory");
        dest_ip.put(k);
        return Err(KernelError::Inval);
    }

    // Resolve everything the request needs before taking the
    // mountpoint lock, so nested path resolution cannot deadlock on
    // it. The created device reference (if any) is dropped at the
    // end: mounted filesystems keep their device alive through their
    // cached inodes.
    let mut created_dev = None;
    let mut bind_ip = None;
    let req = if fstype == b"objfs" {
        let dev = match device::create_obj_device(k) {
            Ok(dev) => dev,
            Err(e) => {
                dest_ip.put(k);
                return Err(e);
            }
        };
        created_dev = Some(dev);
        MountReq::Device(dev)
    } else if fstype == b"proc" {
        MountReq::Synth(SynthKind::Proc)
    } else if fstype == b"cgroup" {
        MountReq::Synth(SynthKind::Cgroup)
    } else if fstype == b"bind" {
        let ip = match namei(k, p, Path::new(options)) {
            Ok(ip) => ip,
            Err(e) => {
                warn!("bad bind mount path");
                dest_ip.put(k);
                return Err(e);
            }
        };
        bind_ip = Some(ip);
        MountReq::Bind(ip)
    } else if fstype == b"union" {
        let layers = match resolve_union_layers(k, p, options) {
            Ok(layers) => layers,
            Err(e) => {
                dest_ip.put(k);
                return Err(e);
            }
        };
        MountReq::Union(layers)
    } else {
        // Native FS from a file-backed loop device.
        let backing = match namei(k, p, Path::new(options)) {
            Ok(ip) => ip,
            Err(e) => {
                warn!("bad device path");
                dest_ip.put(k);
                return Err(e);
            }
        };
        let dev = device::get_or_create_loop(k, backing);
        backing.put(k);
        let dev = match dev {
            Ok(dev) => dev,
            Err(e) => {
                dest_ip.put(k);
                return Err(e);
            }
        };
        created_dev = Some(dev);
        MountReq::Device(dev)
    };

    let release_req_extras = |k: &Kernel| {
        if let Some(dev) = created_dev {
            device::device_put(k, dev);
        }
        if let Some(ip) = bind_ip {
            ip.put(k);
        }
    };

    let mut g = dest_ip.lock(k);
    if g.typ() != InodeType::Dir {
        warn!("mount destination is not a directory");
        g.unlockput();
        if let MountReq::Union(layers) = req {
            for l in layers {
                l.put(k);
            }
        }
        release_req_extras(k);
        drop(put_parent);
        return Err(KernelError::NotDir);
    }

    let res = mount::mount(k, p.ns, Some(dest_ip), req, Some(parent));
    match &res {
        // The mount owns the mountpoint reference now; just unlock.
        Ok(_) => drop(g),
        Err(_) => g.unlockput(),
    }
    release_req_extras(k);
    drop(put_parent);
    res.map(|_| ())
}

/// umount(target_path). The target must be the root of an active
/// mount, not merely a directory under one.
pub fn sys_umount(k: &Kernel, p: &Proc, target: &[u8]) -> Result<()> {
    let (ip, mnt) = nameimount(k, p, Path::new(target))?;

    // Make sure we are unmounting a mountpoint, not just any dir.
    let root_ip = mount::get_mount_root_ip(k, mnt);
    if root_ip != ip {
        warn!("directory is not a mountpoint");
        root_ip.put(k);
        ip.put(k);
        mount::mntput(k, mnt);
        return Err(KernelError::Inval);
    }
    root_ip.put(k);
    ip.put(k);

    match mount::umount(k, p.ns, mnt) {
        Ok(()) => Ok(()),
        Err(e) => {
            mount::mntput(k, mnt);
            Err(e)
        }
    }
}

/// pivot_root(new_root, put_old): swap the namespace's root to the
/// mount at `new_root` and reattach the old root under `put_old`.
pub fn sys_pivot_root(k: &Kernel, p: &Proc, new_root: &[u8], put_old: &[u8]) -> Result<()> {
    let (new_ip, new_mnt) = nameimount(k, p, Path::new(new_root))?;

    let fail = |e: KernelError, refs: &[InodeRef], mnts: &[crate::mount::MountId]| {
        for ip in refs {
            ip.put(k);
        }
        for &m in mnts {
            mount::mntput(k, m);
        }
        Err(e)
    };

    {
        let g = new_ip.lock(k);
        let typ = g.typ();
        drop(g);
        if typ != InodeType::Dir {
            warn!("new root is not a directory");
            return fail(KernelError::NotDir, &[new_ip], &[new_mnt]);
        }
    }
    // The new root must itself be a mountpoint.
    if new_ip != mount::mount_root_of(k, new_mnt) {
        warn!("new root is not a mountpoint");
        return fail(KernelError::Inval, &[new_ip], &[new_mnt]);
    }

    let (old_ip, old_mnt) = match nameimount(k, p, Path::new(put_old)) {
        Ok(v) => v,
        Err(e) => return fail(e, &[new_ip], &[new_mnt]),
    };
    {
        let g = old_ip.lock(k);
        let typ = g.typ();
        drop(g);
        if typ != InodeType::Dir {
            warn!("old root landing path is not a directory");
            return fail(KernelError::NotDir, &[new_ip, old_ip], &[new_mnt, old_mnt]);
        }
    }

    let res = mount::pivot_root(k, p.ns, new_mnt, old_ip);

    new_ip.put(k);
    old_ip.put(k);
    mount::mntput(k, new_mnt);
    mount::mntput(k, old_mnt);
    res
}

/// unshare(flags): give the process a private copy of the selected
/// namespaces.
pub fn sys_unshare(k: &Kernel, p: &mut Proc, flags: UnshareFlags) -> Result<()> {
    if flags.contains(UnshareFlags::MOUNT_NS) {
        let old = p.ns;
        let new = mount_ns::clone_ns(k, p);
        p.ns = new;
        mount_ns::nsput(k, old);
    }
    Ok(())
}
