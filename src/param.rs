/// Size of a device sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Size of the disk block cache, in sectors.
pub const NBUF: usize = 64;

/// Open file descriptors per process.
pub const NOFILE: usize = 128;

/// First descriptor slot not reserved for the standard streams.
pub const FD_FIRST_FILE: usize = 3;

/// Maximum length of one path component.
pub const NAME_MAX: usize = 14;

/// Sector holding the free-map file's inode.
pub const FREE_MAP_SECTOR: u32 = 0;

/// Sector holding the root directory's inode.
pub const ROOT_DIR_SECTOR: u32 = 1;

/// Direct sector pointers per inode.
pub const NDIRECT: usize = 12;

/// Sector pointers per index sector.
pub const NINDIRECT: usize = SECTOR_SIZE / core::mem::size_of::<u32>();

/// Largest number of data sectors one inode can address.
pub const MAXSECTORS: usize = NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT;

/// Largest file length in bytes.
pub const MAXFILE: usize = MAXSECTORS * SECTOR_SIZE;

/// Bytes per chunk when writing to the console.
pub const CONSOLE_CHUNK: usize = 256;
