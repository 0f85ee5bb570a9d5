use std::io;

/// Flat, sector-addressed storage, from sector 0 to `sector_count - 1`.
///
/// All methods take `&self`: implementations use interior mutability so a
/// single device can be shared between the file system and every open file
/// handle. That sharing is not a concurrency feature — callers serialize
/// access themselves.
pub trait SectorStorage: Send + Sync {
    /// Reads one sector into `buf`.
    ///
    /// # Errors
    ///
    /// Reading a sector out of range, or into a buffer smaller than a full
    /// sector, returns an error.
    fn read_sector(&self, sector: u32, buf: &mut [u8]) -> io::Result<()>;

    /// Writes `buf` into the given sector, truncating anything beyond the
    /// sector length. A short buffer leaves the sector's remaining bytes
    /// untouched.
    ///
    /// # Errors
    ///
    /// Writing a sector out of range returns an error.
    fn write_sector(&self, sector: u32, buf: &[u8]) -> io::Result<()>;

    /// Flushes any buffered writes to the underlying medium. Useful when the
    /// content must be re-readable through another handle on the same
    /// backing store.
    fn sync_disk(&self) -> io::Result<()>;
}
