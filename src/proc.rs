//! Process context, as far as the VFS cares: a current working
//! directory, the mount it lives in, and a mount namespace. In this
//! model every thread of execution carries one of these explicitly.

use crate::fs::inode::InodeRef;
use crate::kernel::Kernel;
use crate::mount::{self, MountId};
use crate::mount_ns::{self, NsId};

pub struct Proc {
    pub cwd: Option<InodeRef>,
    pub cwd_mount: Option<MountId>,
    pub ns: NsId,
}

impl Proc {
    /// The first process: cwd at the initial namespace's root.
    /// `Kernel::mount_root` must have run.
    pub fn new_init(k: &Kernel) -> Proc {
        let ns = mount_ns::nsdup(k, NsId(0));
        let root = k
            .namespaces
            .inner(ns)
            .root
            .expect("new_init before mount_root");
        let mnt = mount::mntdup(k, root);
        let cwd = mount::get_mount_root_ip(k, mnt);
        Proc {
            cwd: Some(cwd),
            cwd_mount: Some(mnt),
            ns,
        }
    }

    /// A child process sharing cwd and namespace, each re-counted.
    pub fn fork(&self, k: &Kernel) -> Proc {
        Proc {
            cwd: self.cwd.map(|ip| ip.dup(k)),
            cwd_mount: self.cwd_mount.map(|m| mount::mntdup(k, m)),
            ns: mount_ns::nsdup(k, self.ns),
        }
    }

    /// Releases everything the process holds. The last process of a
    /// namespace tears its mounts down.
    pub fn exit(mut self, k: &Kernel) {
        if let Some(cwd) = self.cwd.take() {
            cwd.put(k);
        }
        if let Some(m) = self.cwd_mount.take() {
            mount::mntput(k, m);
        }
        mount_ns::nsput(k, self.ns);
    }
}
