//! Error kinds surfaced by the VFS core.
//!
//! Driver-level operations return these as values; fatal invariant
//! violations (cache exhaustion with nothing reclaimable, freeing a
//! free block, an inode with no type after load) are panics, since the
//! kernel cannot meaningfully continue past them.

use core::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum KernelError {
    /// Name not found.
    NoEnt,
    /// Path component is not a directory.
    NotDir,
    /// Name already present.
    Exist,
    /// Storage exhausted.
    NoSpc,
    /// In-memory table full.
    NoMem,
    /// References still outstanding.
    Busy,
    /// Malformed path, fstype, or argument.
    Inval,
}

pub type Result<T> = core::result::Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KernelError::NoEnt => "no such file or directory",
            KernelError::NotDir => "not a directory",
            KernelError::Exist => "already exists",
            KernelError::NoSpc => "no space left on device",
            KernelError::NoMem => "kernel table full",
            KernelError::Busy => "resource busy",
            KernelError::Inval => "invalid argument",
        };
        f.write_str(s)
    }
}
