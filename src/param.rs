/// Maximum number of active i-nodes per filesystem driver.
pub const NINODE: usize = 50;

/// Maximum major device number for character devices.
pub const NDEV: usize = 10;

/// IDE port of the file system root disk.
pub const ROOTDEV: usize = 0;

/// Block size.
pub const BSIZE: usize = 1024;

/// Max # of blocks any FS op writes.
pub const MAXOPBLOCKS: usize = 10;

/// Max data blocks in on-disk log.
pub const LOGSIZE: usize = MAXOPBLOCKS * 3;

/// Size of disk block cache.
pub const NBUF: usize = MAXOPBLOCKS * 3;

/// File-backed loop devices.
pub const NLOOPDEVS: usize = 10;

/// IDE devices.
pub const NIDEDEVS: usize = 2;

/// Object-store devices.
pub const NOBJDEVS: usize = 2;

/// Device table slots.
pub const NMAXDEVS: usize = NLOOPDEVS + NIDEDEVS + NOBJDEVS;

/// Superblock table slots.
pub const NSUPERBLOCK: usize = 32;

/// Mount table slots.
pub const NMOUNT: usize = 200;

/// Mount namespaces.
pub const NNAMESPACE: usize = 16;

/// Union FS: maximum stacked layers.
pub const UNION_MAX_LAYERS: usize = 4;

/// Union FS: separator between layer paths in mount options.
pub const UNION_OPTIONS_SEP: u8 = b';';

/// Union FS: index of the writable top layer.
pub const UNION_TOP_LAYER: usize = 0;
