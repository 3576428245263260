//! Flat key/value object store backing an obj device.
//!
//! Objects live in one byte arena described by a bounded table of
//! `{id, offset, size}` entries. Two entries are reserved at format
//! time for the store's own metadata, mirroring a real device where
//! the super block sits at address zero and the table right behind
//! it. Free-space management is first-fit over the gaps between
//! occupied ranges in address order; a smarter free list is future
//! work, as the comment in every toy allocator says.

use arrayvec::ArrayString;
use itertools::Itertools;

use crate::error::{KernelError, Result};

/// Bounded object id length.
pub const MAX_OBJECT_ID: usize = 32;

/// Total bytes of one store.
pub const STORAGE_DEVICE_SIZE: usize = 256 * 1024;

/// Table entries per store.
pub const OBJECTS_TABLE_SIZE: usize = 128;

const SUPER_BLOCK_ID: &str = "super_block";
const OBJECT_TABLE_ID: &str = "objects_table";

/// Bytes the reserved metadata entries stand for.
const SUPER_BLOCK_BYTES: usize = 64;
const TABLE_BYTES: usize = OBJECTS_TABLE_SIZE * 48;

pub type ObjectId = ArrayString<MAX_OBJECT_ID>;

#[derive(Clone, Copy)]
struct TableEntry {
    object_id: ObjectId,
    disk_offset: usize,
    size: usize,
    occupied: bool,
}

impl TableEntry {
    const fn empty() -> Self {
        Self {
            object_id: ObjectId::new_const(),
            disk_offset: 0,
            size: 0,
            occupied: false,
        }
    }
}

pub struct ObjDisk {
    table: [TableEntry; OBJECTS_TABLE_SIZE],
    storage: Vec<u8>,
    occupied_objects: usize,
    bytes_occupied: usize,
}

fn object_id(name: &str) -> Result<ObjectId> {
    ObjectId::from(name).map_err(|_| KernelError::Inval)
}

impl ObjDisk {
    pub fn new() -> Self {
        Self {
            table: [TableEntry::empty(); OBJECTS_TABLE_SIZE],
            storage: Vec::new(),
            occupied_objects: 0,
            bytes_occupied: 0,
        }
    }

    /// (Re)initializes the store: empty table except for the two
    /// reserved metadata entries.
    pub fn format(&mut self) {
        self.table = [TableEntry::empty(); OBJECTS_TABLE_SIZE];
        self.storage = vec![0; STORAGE_DEVICE_SIZE];
        self.occupied_objects = 0;
        self.bytes_occupied = 0;

        self.table[0] = TableEntry {
            object_id: ObjectId::from(SUPER_BLOCK_ID).unwrap(),
            disk_offset: 0,
            size: SUPER_BLOCK_BYTES,
            occupied: true,
        };
        self.table[1] = TableEntry {
            object_id: ObjectId::from(OBJECT_TABLE_ID).unwrap(),
            disk_offset: SUPER_BLOCK_BYTES,
            size: TABLE_BYTES,
            occupied: true,
        };
        self.occupied_objects = 2;
        self.bytes_occupied = SUPER_BLOCK_BYTES + TABLE_BYTES;
    }

    fn find(&self, id: &ObjectId) -> Option<usize> {
        self.table
            .iter()
            .position(|e| e.occupied && e.object_id == *id)
    }

    /// First-fit search for a gap of at least `size` bytes: occupied
    /// ranges are visited in address order and the hole after each is
    /// checked, then the tail of the device. The reserved entries
    /// guarantee the table is never empty and address 0 is covered.
    fn find_empty_space(&self, size: usize) -> Option<usize> {
        let occupied = self
            .table
            .iter()
            .filter(|e| e.occupied)
            .sorted_by_key(|e| e.disk_offset)
            .collect::<Vec<_>>();

        for (cur, next) in occupied.iter().tuple_windows() {
            let hole = cur.disk_offset + cur.size;
            if next.disk_offset - hole >= size {
                return Some(hole);
            }
        }
        let last = occupied.last().expect("obj_disk: reserved entries missing");
        let hole = last.disk_offset + last.size;
        if self.storage.len() - hole >= size {
            return Some(hole);
        }
        None
    }

    pub fn add_object(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let id = object_id(name)?;
        if self.find(&id).is_some() {
            return Err(KernelError::Exist);
        }
        let free = self
            .table
            .iter()
            .position(|e| !e.occupied)
            .ok_or(KernelError::NoSpc)?;
        let off = self.find_empty_space(data.len()).ok_or(KernelError::NoSpc)?;

        self.table[free] = TableEntry {
            object_id: id,
            disk_offset: off,
            size: data.len(),
            occupied: true,
        };
        self.storage[off..off + data.len()].copy_from_slice(data);
        self.occupied_objects += 1;
        self.bytes_occupied += data.len();
        Ok(())
    }

    pub fn get_object(&self, name: &str) -> Result<Vec<u8>> {
        let id = object_id(name)?;
        let e = &self.table[self.find(&id).ok_or(KernelError::NoEnt)?];
        Ok(self.storage[e.disk_offset..e.disk_offset + e.size].to_vec())
    }

    pub fn object_size(&self, name: &str) -> Result<usize> {
        let id = object_id(name)?;
        Ok(self.table[self.find(&id).ok_or(KernelError::NoEnt)?].size)
    }

    /// Replaces an object's contents. Shrinking rewrites in place;
    /// growth relocates, releasing the old range only after the new
    /// one is populated so a failed fit loses nothing.
    pub fn rewrite_object(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let id = object_id(name)?;
        let i = self.find(&id).ok_or(KernelError::NoEnt)?;
        let (old_off, old_size) = (self.table[i].disk_offset, self.table[i].size);

        if old_size >= data.len() {
            self.storage[old_off..old_off + data.len()].copy_from_slice(data);
        } else {
            let off = self.find_empty_space(data.len()).ok_or(KernelError::NoSpc)?;
            self.storage[off..off + data.len()].copy_from_slice(data);
            self.table[i].disk_offset = off;
        }
        self.table[i].size = data.len();
        self.bytes_occupied = self.bytes_occupied - old_size + data.len();
        Ok(())
    }

    pub fn delete_object(&mut self, name: &str) -> Result<()> {
        let id = object_id(name)?;
        let i = self.find(&id).ok_or(KernelError::NoEnt)?;
        self.table[i].occupied = false;
        self.occupied_objects -= 1;
        self.bytes_occupied -= self.table[i].size;
        Ok(())
    }

    pub fn max_objects(&self) -> usize {
        OBJECTS_TABLE_SIZE
    }

    pub fn occupied_objects(&self) -> usize {
        self.occupied_objects
    }

    pub fn occupied_bytes(&self) -> usize {
        self.bytes_occupied
    }
}

impl Default for ObjDisk {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ObjDisk {
        let mut d = ObjDisk::new();
        d.format();
        d
    }

    #[test]
    fn add_get_roundtrip() {
        let mut d = store();
        d.add_object("hello", b"world").unwrap();
        assert_eq!(d.get_object("hello").unwrap(), b"world");
        assert_eq!(d.object_size("hello").unwrap(), 5);
        assert_eq!(d.add_object("hello", b"again"), Err(KernelError::Exist));
    }

    #[test]
    fn rewrite_in_place_and_grow() {
        let mut d = store();
        d.add_object("a", &[1; 100]).unwrap();
        d.add_object("b", &[2; 100]).unwrap();
        d.rewrite_object("a", &[3; 10]).unwrap();
        assert_eq!(d.get_object("a").unwrap(), vec![3; 10]);
        // Growth relocates past "b" without disturbing it.
        d.rewrite_object("a", &[4; 500]).unwrap();
        assert_eq!(d.get_object("a").unwrap(), vec![4; 500]);
        assert_eq!(d.get_object("b").unwrap(), vec![2; 100]);
    }

    #[test]
    fn delete_frees_space() {
        let mut d = store();
        let big = STORAGE_DEVICE_SIZE - SUPER_BLOCK_BYTES - TABLE_BYTES;
        d.add_object("big", &vec![7; big]).unwrap();
        assert_eq!(d.add_object("more", &[1]), Err(KernelError::NoSpc));
        d.delete_object("big").unwrap();
        d.add_object("more", &[1]).unwrap();
        assert_eq!(d.get_object("big"), Err(KernelError::NoEnt));
    }

    #[test]
    fn name_too_long() {
        let mut d = store();
        let long = "x".repeat(MAX_OBJECT_ID + 1);
        assert_eq!(d.add_object(&long, b""), Err(KernelError::Inval));
    }
}
