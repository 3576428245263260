//! The virtual-filesystem core of a small Unix-like teaching kernel,
//! built as a hosted model: kernel data structures, kernel lock
//! discipline and kernel reference counting, with threads standing in
//! for processes and in-memory images standing in for disks.
//!
//! The pieces, bottom up:
//!   + Locks: spinlocks for reference counts and table slots,
//!     sleep-locks held across disk I/O.
//!   + Buffer cache: cached copies of disk blocks (`bio`).
//!   + Devices: IDE, file-backed loop, and object-store devices,
//!     owned by a single reference-counted table (`device`).
//!   + Filesystems: a native block FS with a write-ahead log, an
//!     object-store FS, a union (overlay) FS, and synthetic
//!     proc/cgroup trees, all behind one superblock/inode model
//!     (`fs`).
//!   + Mounts: per-namespace mount trees, bind mounts, pivot_root,
//!     and a pathname resolver that crosses mountpoints (`mount`,
//!     `mount_ns`, `fs::namei`).
//!   + Calls: the mount/umount/pivot_root/unshare surface and the
//!     file-level operations built on it (`sysmount`, `sysfile`).
//!
//! There are no globals: all state lives in a [`Kernel`] value that is
//! passed explicitly to every operation. Reference counts are explicit
//! (`dup`/`put` pairs); nothing load-bearing hides in destructors.

pub mod bio;
pub mod device;
pub mod error;
pub mod fs;
pub mod kernel;
pub mod lock;
pub mod mkfs;
pub mod mount;
pub mod mount_ns;
pub mod obj_disk;
pub mod param;
pub mod proc;
pub mod sysfile;
pub mod sysmount;

pub use error::{KernelError, Result};
pub use kernel::Kernel;
pub use proc::Proc;
