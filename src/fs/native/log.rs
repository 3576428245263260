//! Simple logging that allows concurrent FS system calls.
//!
//! A log transaction contains the updates of multiple FS operations.
//! The logging system only commits when there are no operations
//! active, so there is never any reasoning required about whether a
//! commit might write an uncommitted operation's updates to disk.
//!
//! An operation should hold a [`Tx`] to mark its start and end.
//! Usually beginning just increments the count of in-progress
//! operations; if the log is close to running out, it sleeps until
//! the last outstanding operation commits.
//!
//! The log is a physical re-do log containing disk blocks. The
//! on-disk format:
//!   header block, containing block #s for block A, B, C, ...
//!   block A
//!   block B
//!   block C
//!   ...
//! Log appends are synchronous.

use core::mem;

use arrayvec::ArrayVec;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use super::{volume, NativeSuperblock};
use crate::bio::{self, Buf};
use crate::device::DeviceId;
use crate::fs::SbId;
use crate::kernel::Kernel;
use crate::lock::Sleepablelock;
use crate::param::{BSIZE, LOGSIZE, MAXOPBLOCKS};

pub struct Log {
    dev: DeviceId,

    /// First block of the on-disk log area (the header block).
    start: u32,

    /// Blocks in the log area, header included.
    size: u32,

    /// How many FS operations are executing?
    outstanding: u32,

    /// In commit(), please wait.
    committing: bool,

    /// Block numbers of this transaction's dirty blocks, pinned in
    /// the buffer cache until install.
    blocks: ArrayVec<u32, LOGSIZE>,
}

/// Contents of the header block, used for the on-disk header.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
struct LogHeader {
    n: u32,
    block: [u32; LOGSIZE],
}

const_assert!(mem::size_of::<LogHeader>() <= BSIZE);

impl Log {
    pub fn new(k: &Kernel, dev: DeviceId, start: u32, size: u32) -> Self {
        assert!(
            size as usize > LOGSIZE,
            "log: on-disk log area too small"
        );
        let mut log = Self {
            dev,
            start,
            size,
            outstanding: 0,
            committing: false,
            blocks: ArrayVec::new(),
        };
        log.recover(k);
        log
    }

    /// Replays a committed-but-uninstalled transaction left by a
    /// crash, then clears the log.
    fn recover(&mut self, k: &Kernel) {
        let head = read_head(k, self.dev, self.start);
        install_trans(k, self.dev, self.start, &head, true);
        write_head(k, self.dev, self.start, &[]);
    }

    /// Caller has modified the buffer's data and is done with it.
    /// Record the block number and pin the block in the cache; commit
    /// will do the disk write.
    ///
    /// A typical use is:
    ///   let mut bp = bio::bread(...);
    ///   ... modify bp.data_mut() ...
    ///   tx.write(bp);
    fn write(&mut self, k: &Kernel, b: Buf<'_>) {
        assert!(
            self.blocks.len() < LOGSIZE && (self.blocks.len() as u32) < self.size - 1,
            "too big a transaction"
        );
        assert!(self.outstanding >= 1, "write outside of trans");

        if !self.blocks.contains(&b.blockno) {
            // Add new block to the log; absorption keeps a block
            // written twice in one transaction pinned only once.
            bio::bpin(k, &b);
            self.blocks.push(b.blockno);
        }
    }
}

fn read_head(k: &Kernel, dev: DeviceId, start: u32) -> Vec<u32> {
    let bp = bio::bread(k, dev, start);
    let head = LogHeader::read_from_prefix(&bp.data()[..]).unwrap();
    head.block[..head.n as usize].to_vec()
}

/// Write the in-memory list of dirty blocks to the on-disk header.
/// This is the true point at which the current transaction commits;
/// an empty list erases the transaction.
fn write_head(k: &Kernel, dev: DeviceId, start: u32, blocks: &[u32]) {
    let mut head = LogHeader {
        n: blocks.len() as u32,
        block: [0; LOGSIZE],
    };
    head.block[..blocks.len()].copy_from_slice(blocks);

    let mut bp = bio::bread(k, dev, start);
    bp.data_mut()[..mem::size_of::<LogHeader>()].copy_from_slice(head.as_bytes());
    bio::bwrite(k, &bp);
}

/// Copy modified blocks from the cache to the log area.
fn write_log(k: &Kernel, dev: DeviceId, start: u32, blocks: &[u32]) {
    for (tail, &bn) in blocks.iter().enumerate() {
        let from = bio::bread(k, dev, bn);
        let mut to = bio::bread(k, dev, start + tail as u32 + 1);
        to.data_mut().copy_from_slice(from.data());
        bio::bwrite(k, &to);
    }
}

/// Copy committed blocks from the log area to their home locations.
fn install_trans(k: &Kernel, dev: DeviceId, start: u32, blocks: &[u32], recovering: bool) {
    for (tail, &bn) in blocks.iter().enumerate() {
        let lbuf = bio::bread(k, dev, start + tail as u32 + 1);
        let mut dbuf = bio::bread(k, dev, bn);
        dbuf.data_mut().copy_from_slice(lbuf.data());
        bio::bwrite(k, &dbuf);
        drop(dbuf);
        if !recovering {
            bio::bunpin(k, dev, bn);
        }
    }
}

fn commit(k: &Kernel, dev: DeviceId, start: u32, blocks: &[u32]) {
    if !blocks.is_empty() {
        // Write modified blocks from cache to log.
        write_log(k, dev, start, blocks);

        // Write header to disk -- the real commit.
        write_head(k, dev, start, blocks);

        // Now install writes to home locations.
        install_trans(k, dev, start, blocks, false);

        // Erase the transaction from the log.
        write_head(k, dev, start, &[]);
    }
}

/// Called at the start of each FS operation.
fn begin_op(log: &Sleepablelock<Log>) {
    let mut guard = log.lock();
    loop {
        if guard.committing
            // This op might exhaust log space; wait for commit.
            || guard.blocks.len() + (guard.outstanding as usize + 1) * MAXOPBLOCKS > LOGSIZE
        {
            guard.sleep();
        } else {
            guard.outstanding += 1;
            break;
        }
    }
}

/// Called at the end of each FS operation.
/// Commits if this was the last outstanding operation.
fn end_op(k: &Kernel, log: &Sleepablelock<Log>) {
    let mut guard = log.lock();
    guard.outstanding -= 1;
    assert!(!guard.committing, "end_op: committing");

    if guard.outstanding == 0 {
        // Since outstanding is 0, no ongoing operation exists.
        // Committing stays true until the commit is done, so new
        // operations cannot start even after releasing the lock.
        guard.committing = true;
        let blocks = mem::take(&mut guard.blocks);
        let (dev, start) = (guard.dev, guard.start);

        // Commit without holding the lock, since it is not allowed to
        // sleep with locks.
        guard.reacquire_after(|| commit(k, dev, start, &blocks));
        guard.committing = false;
    }

    // Beginners may be waiting for log space or for the commit.
    guard.wakeup();
}

/// One FS operation against one native filesystem. Writes issued
/// through it reach the disk atomically at commit. On loop-backed
/// (logless) filesystems `write` degrades to a direct write-through.
pub struct Tx<'k> {
    k: &'k Kernel,
    vol: &'k super::NativeVolume,
}

impl<'k> Tx<'k> {
    pub(crate) fn begin(k: &'k Kernel, sb: SbId) -> Tx<'k> {
        let vol = volume(k, sb);
        if let Some(log) = &vol.log {
            begin_op(log);
        }
        Tx { k, vol }
    }

    pub(crate) fn kernel(&self) -> &'k Kernel {
        self.k
    }

    pub(crate) fn dev(&self) -> DeviceId {
        self.vol.dev
    }

    pub(crate) fn geometry(&self) -> &NativeSuperblock {
        &self.vol.sb
    }

    /// Takes a modified buffer into the transaction.
    pub fn write(&self, b: Buf<'_>) {
        match &self.vol.log {
            Some(log) => log.lock().write(self.k, b),
            None => bio::bwrite(self.k, &b),
        }
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if let Some(log) = &self.vol.log {
            end_op(self.k, log);
        }
    }
}
