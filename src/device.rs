//! The device table.
//!
//! One fixed-size table owns every block device the kernel knows:
//! IDE disks (in-memory images in this model), file-backed loop
//! devices, and object-store devices. Slots are reference counted;
//! a slot is created by the first mount that needs it and destroyed
//! when its last reference drops.
//!
//! Invariants:
//! * A loop device holds its own reference on the backing inode for
//!   the device's whole lifetime, and no two loop devices share a
//!   backing inode; lookup-then-create is a single pass under the
//!   table lock.
//! * Destruction runs with the table lock released (it calls back
//!   into inode and buffer-cache operations); the per-type live
//!   counter is updated together with the ref reaching zero.

use array_macro::array;
use log::warn;

use crate::bio;
use crate::error::{KernelError, Result};
use crate::fs::inode::InodeRef;
use crate::kernel::Kernel;
use crate::lock::{Sleeplock, SleeplockGuard, Spinlock};
use crate::obj_disk::ObjDisk;
use crate::param::{BSIZE, NIDEDEVS, NLOOPDEVS, NMAXDEVS, NOBJDEVS};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DeviceId(pub usize);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DeviceKind {
    None,
    Ide { port: usize },
    Loop { backing: InodeRef },
    Obj { store: usize },
}

impl DeviceKind {
    fn type_index(&self) -> usize {
        match self {
            DeviceKind::None => 0,
            DeviceKind::Ide { .. } => 1,
            DeviceKind::Loop { .. } => 2,
            DeviceKind::Obj { .. } => 3,
        }
    }
}

/// Live devices allowed per type, indexed by `DeviceKind::type_index`.
const DEV_TO_MAX_COUNT: [usize; 4] = [0, NIDEDEVS, NLOOPDEVS, NOBJDEVS];

#[derive(Clone, Copy)]
struct DeviceSlot {
    refcnt: u32,
    kind: DeviceKind,
}

struct DevTable {
    slots: [DeviceSlot; NMAXDEVS],

    /// Live devices per type.
    counts: [usize; 4],
}

pub struct Devices {
    table: Spinlock<DevTable>,

    /// IDE disk images, indexed by port.
    ide: [Sleeplock<IdeDisk>; NIDEDEVS],

    /// Object stores, indexed by the `store` field of obj devices.
    obj: [Sleeplock<ObjDisk>; NOBJDEVS],
}

/// An in-memory IDE disk image.
pub struct IdeDisk {
    data: Vec<u8>,
}

impl IdeDisk {
    fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn nblocks(&self) -> usize {
        self.data.len() / BSIZE
    }

    fn read_block(&self, blockno: u32, out: &mut [u8; BSIZE]) {
        let off = blockno as usize * BSIZE;
        assert!(off + BSIZE <= self.data.len(), "ide: block out of range");
        out.copy_from_slice(&self.data[off..off + BSIZE]);
    }

    fn write_block(&mut self, blockno: u32, data: &[u8; BSIZE]) {
        let off = blockno as usize * BSIZE;
        assert!(off + BSIZE <= self.data.len(), "ide: block out of range");
        self.data[off..off + BSIZE].copy_from_slice(data);
    }
}

impl Devices {
    pub fn new() -> Self {
        Self {
            table: Spinlock::new(
                "dev_list",
                DevTable {
                    slots: [DeviceSlot {
                        refcnt: 0,
                        kind: DeviceKind::None,
                    }; NMAXDEVS],
                    counts: [0; 4],
                },
            ),
            ide: array![_ => Sleeplock::new("ide", IdeDisk::new()); NIDEDEVS],
            obj: array![_ => Sleeplock::new("obj_disk", ObjDisk::new()); NOBJDEVS],
        }
    }

    /// Replaces the image of an IDE disk. The model's stand-in for
    /// plugging a formatted disk into a port.
    pub fn install_ide_image(&self, port: usize, image: Vec<u8>) {
        assert!(port < NIDEDEVS, "no such ide port");
        assert_eq!(image.len() % BSIZE, 0, "ide image not block-aligned");
        self.ide[port].lock().data = image;
    }

    /// Locks and returns the object store backing an obj device.
    pub fn obj_store(&self, store: usize) -> SleeplockGuard<'_, ObjDisk> {
        self.obj[store].lock()
    }

    /// Snapshot of a device's kind.
    pub fn kind(&self, dev: DeviceId) -> DeviceKind {
        self.table.lock().slots[dev.0].kind
    }

    #[cfg(test)]
    pub(crate) fn refcnt(&self, dev: DeviceId) -> u32 {
        self.table.lock().slots[dev.0].refcnt
    }
}

impl Default for Devices {
    fn default() -> Self {
        Self::new()
    }
}

impl DevTable {
    /// One pass under the table lock: return an existing device
    /// matching `matches`, or claim a free slot for `kind`.
    /// `Ok(second)` tells the caller whether the device pre-existed.
    fn find_or_claim<F>(&mut self, kind: DeviceKind, matches: F) -> Result<(DeviceId, bool)>
    where
        F: Fn(&DeviceKind) -> bool,
    {
        let mut empty = None;
        let mut hit = None;
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.refcnt == 0 && slot.kind == DeviceKind::None {
                if empty.is_none() {
                    empty = Some(i);
                }
            } else if matches(&slot.kind) {
                hit = Some(i);
                break;
            }
        }
        if let Some(i) = hit {
            self.slots[i].refcnt += 1;
            return Ok((DeviceId(i), true));
        }

        let t = kind.type_index();
        if self.counts[t] >= DEV_TO_MAX_COUNT[t] {
            warn!("device table: no {} slots left", ["?", "ide", "loop", "obj"][t]);
            return Err(KernelError::NoMem);
        }
        let i = match empty {
            Some(i) => i,
            None => {
                warn!("device table: no free slots");
                return Err(KernelError::NoMem);
            }
        };
        self.slots[i] = DeviceSlot { refcnt: 1, kind };
        self.counts[t] += 1;
        Ok((DeviceId(i), false))
    }
}

/// Finds the loop device backed by `backing`, or creates one, taking
/// an independent reference on the backing inode for the device's
/// lifetime.
pub fn get_or_create_loop(k: &Kernel, backing: InodeRef) -> Result<DeviceId> {
    let mut table = k.devices.table.lock();
    let (dev, existed) = table.find_or_claim(DeviceKind::Loop { backing }, |kind| {
        matches!(kind, DeviceKind::Loop { backing: b } if *b == backing)
    })?;
    if !existed {
        // Device-table lock before inode-cache lock; see the lock
        // order in `fs::inode`.
        backing.dup(k);
    }
    Ok(dev)
}

/// Finds the IDE device on `port`, or creates one.
pub fn get_or_create_ide(k: &Kernel, port: usize) -> Result<DeviceId> {
    if port >= NIDEDEVS {
        return Err(KernelError::Inval);
    }
    let mut table = k.devices.table.lock();
    let (dev, _) = table.find_or_claim(DeviceKind::Ide { port }, |kind| {
        matches!(kind, DeviceKind::Ide { port: p } if *p == port)
    })?;
    Ok(dev)
}

/// Creates a fresh object-store device with its own store.
pub fn create_obj_device(k: &Kernel) -> Result<DeviceId> {
    let (dev, store) = {
        let mut table = k.devices.table.lock();
        let store = (0..NOBJDEVS).find(|&s| {
            !table
                .slots
                .iter()
                .any(|sl| sl.refcnt > 0 && sl.kind == DeviceKind::Obj { store: s })
        });
        let store = match store {
            Some(s) => s,
            None => return Err(KernelError::NoMem),
        };
        let (dev, _) = table.find_or_claim(DeviceKind::Obj { store }, |_| false)?;
        (dev, store)
    };
    // The slot is claimed; format its store outside the table lock.
    k.devices.obj[store].lock().format();
    Ok(dev)
}

/// Bumps the reference count of a live device.
pub fn device_get(k: &Kernel, dev: DeviceId) {
    let mut table = k.devices.table.lock();
    let slot = &mut table.slots[dev.0];
    assert!(slot.refcnt > 0, "device_get: dead device");
    slot.refcnt += 1;
}

/// Drops a reference. On the last one, destroys the device with the
/// table lock released: a loop device releases its backing inode and
/// invalidates its cached blocks, which may call back into this
/// table for the lower device.
pub fn device_put(k: &Kernel, dev: DeviceId) {
    let kind = {
        let mut table = k.devices.table.lock();
        let slot = &mut table.slots[dev.0];
        assert!(slot.refcnt > 0, "device_put");
        if slot.refcnt > 1 {
            slot.refcnt -= 1;
            return;
        }
        slot.kind
    };

    match kind {
        DeviceKind::Loop { backing } => {
            // The backing inode can be released now.
            backing.put(k);
            bio::invalidate(k, dev);
        }
        DeviceKind::Ide { .. } => bio::invalidate(k, dev),
        DeviceKind::Obj { .. } | DeviceKind::None => {}
    }

    let mut table = k.devices.table.lock();
    let t = kind.type_index();
    assert!(table.counts[t] > 0, "device_put: type count");
    table.counts[t] -= 1;
    let slot = &mut table.slots[dev.0];
    slot.kind = DeviceKind::None;
    slot.refcnt -= 1;
}

/// The backing inode of a loop device, if `dev` is a live one.
pub fn backing_inode(k: &Kernel, dev: DeviceId) -> Option<InodeRef> {
    let table = k.devices.table.lock();
    let slot = &table.slots[dev.0];
    match slot.kind {
        DeviceKind::Loop { backing } if slot.refcnt > 0 => Some(backing),
        _ => None,
    }
}

/// Is `ip` the backing inode of any live loop device?
pub fn holds_inode(k: &Kernel, ip: InodeRef) -> bool {
    let table = k.devices.table.lock();
    table
        .slots
        .iter()
        .any(|s| matches!(s.kind, DeviceKind::Loop { backing } if backing == ip))
}

/// Reads one block of `dev` into `out`.
pub fn block_read(k: &Kernel, dev: DeviceId, blockno: u32, out: &mut [u8; BSIZE]) {
    match k.devices.kind(dev) {
        DeviceKind::Ide { port } => k.devices.ide[port].lock().read_block(blockno, out),
        DeviceKind::Loop { backing } => {
            let mut ip = backing.lock(k);
            let n = ip
                .readi(blockno * BSIZE as u32, out)
                .expect("loop: read error");
            // Short read past the image end reads as zeroes.
            out[n..].iter_mut().for_each(|b| *b = 0);
        }
        DeviceKind::Obj { .. } | DeviceKind::None => panic!("block_read: not a block device"),
    }
}

/// Writes one block of `dev`.
pub fn block_write(k: &Kernel, dev: DeviceId, blockno: u32, data: &[u8; BSIZE]) {
    match k.devices.kind(dev) {
        DeviceKind::Ide { port } => k.devices.ide[port].lock().write_block(blockno, data),
        DeviceKind::Loop { backing } => {
            let mut ip = backing.lock(k);
            let n = ip
                .writei(data, blockno * BSIZE as u32)
                .expect("loop: write error");
            assert_eq!(n, BSIZE, "loop: short write");
        }
        DeviceKind::Obj { .. } | DeviceKind::None => panic!("block_write: not a block device"),
    }
}
