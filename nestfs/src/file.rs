use std::fmt;
use std::io;
use std::sync::Arc;

use crate::header::FileHeader;
use crate::io::SectorStorage;
use crate::SECTOR_SIZE;

/// Byte-level handle on one file, bound to the sector holding its header.
///
/// The header is fetched once at open time; besides it the handle holds only
/// a seek position, so handles are cheap to construct and discard. Files have
/// a fixed size, so reads and writes are clamped to the end of the file —
/// writing never extends it.
pub struct OpenFile {
    dev: Arc<dyn SectorStorage>,
    header: FileHeader,
    header_sector: u32,
    position: usize,
}

impl fmt::Debug for OpenFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenFile")
            .field("header_sector", &self.header_sector)
            .field("position", &self.position)
            .field("length", &self.length())
            .finish()
    }
}

impl OpenFile {
    /// Opens the file whose header lives at `sector`.
    pub fn new(dev: Arc<dyn SectorStorage>, sector: u32) -> io::Result<Self> {
        let header = FileHeader::fetch(&dev, sector)?;
        Ok(Self {
            dev,
            header,
            header_sector: sector,
            position: 0,
        })
    }

    /// The file's size in bytes, fixed at creation.
    pub fn length(&self) -> usize {
        self.header.size() as usize
    }

    /// The sector this handle's header was fetched from.
    pub fn header_sector(&self) -> u32 {
        self.header_sector
    }

    /// Reads at `offset` without touching the seek position, returning the
    /// number of bytes read.
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> io::Result<usize> {
        let size = self.length();
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min(size - offset);
        let mut sector_buf = [0u8; SECTOR_SIZE];
        let mut copied = 0;
        while copied < len {
            let position = offset + copied;
            let within = position % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - within).min(len - copied);
            let sector = self.header.data_sector(position / SECTOR_SIZE);
            self.dev.read_sector(sector, &mut sector_buf)?;
            buf[copied..copied + chunk].copy_from_slice(&sector_buf[within..within + chunk]);
            copied += chunk;
        }
        Ok(len)
    }

    /// Writes at `offset` without touching the seek position, returning the
    /// number of bytes written. Partially covered sectors are read, patched
    /// and written back.
    pub fn write_at(&self, buf: &[u8], offset: usize) -> io::Result<usize> {
        let size = self.length();
        if offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min(size - offset);
        let mut sector_buf = [0u8; SECTOR_SIZE];
        let mut copied = 0;
        while copied < len {
            let position = offset + copied;
            let within = position % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - within).min(len - copied);
            let sector = self.header.data_sector(position / SECTOR_SIZE);
            if chunk < SECTOR_SIZE {
                self.dev.read_sector(sector, &mut sector_buf)?;
            }
            sector_buf[within..within + chunk].copy_from_slice(&buf[copied..copied + chunk]);
            self.dev.write_sector(sector, &sector_buf)?;
            copied += chunk;
        }
        Ok(len)
    }

    /// Reads from the seek position, advancing it.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let transferred = self.read_at(buf, self.position)?;
        self.position += transferred;
        Ok(transferred)
    }

    /// Writes at the seek position, advancing it.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let transferred = self.write_at(buf, self.position)?;
        self.position += transferred;
        Ok(transferred)
    }

    /// Moves the seek position used by `read` and `write`.
    pub fn seek(&mut self, position: usize) {
        self.position = position;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::SectorMap;
    use crate::io::FileDiskEmulatorBuilder;
    use crate::NUM_SECTORS;

    fn open_test_file(bytes: u32) -> OpenFile {
        let backing = tempfile::tempfile().unwrap();
        let dev: Arc<dyn SectorStorage> = Arc::new(
            FileDiskEmulatorBuilder::from(backing)
                .with_sector_count(NUM_SECTORS as u32)
                .build()
                .expect("failed to prepare backing file"),
        );
        let mut map = SectorMap::new();
        let header_sector = map.find_and_reserve().unwrap();
        let mut header = FileHeader::new();
        assert!(header.allocate(&mut map, bytes));
        header.write_back(&dev, header_sector).unwrap();
        OpenFile::new(dev, header_sector).unwrap()
    }

    #[test]
    fn read_write_round_trip_across_sectors() {
        let file = open_test_file(3 * SECTOR_SIZE as u32);

        let content: Vec<u8> = (0..=255).cycle().take(300).collect();
        assert_eq!(file.write_at(&content, 50).unwrap(), 300);

        let mut read_back = vec![0u8; 300];
        assert_eq!(file.read_at(&mut read_back, 50).unwrap(), 300);
        assert_eq!(read_back, content);
    }

    #[test]
    fn transfers_clamp_to_file_size() {
        let file = open_test_file(100);

        assert_eq!(file.write_at(&[0x7f; 200], 0).unwrap(), 100);
        assert_eq!(file.write_at(&[0x7f; 10], 100).unwrap(), 0);

        let mut buf = [0u8; 200];
        assert_eq!(file.read_at(&mut buf, 40).unwrap(), 60);
        assert_eq!(file.read_at(&mut buf, 100).unwrap(), 0);
    }

    #[test]
    fn sequential_io_advances_position() {
        let mut file = open_test_file(SECTOR_SIZE as u32);

        assert_eq!(file.write(b"alpha").unwrap(), 5);
        assert_eq!(file.write(b"beta").unwrap(), 4);

        file.seek(0);
        let mut buf = [0u8; 9];
        assert_eq!(file.read(&mut buf).unwrap(), 9);
        assert_eq!(&buf, b"alphabeta");
    }

    #[test]
    fn partial_sector_write_preserves_neighbors() {
        let file = open_test_file(2 * SECTOR_SIZE as u32);

        file.write_at(&[0xaa; 2 * SECTOR_SIZE], 0).unwrap();
        file.write_at(&[0x11; 4], 126).unwrap();

        let mut buf = [0u8; 2 * SECTOR_SIZE];
        file.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf[..126], &[0xaa; 126][..]);
        assert_eq!(&buf[126..130], &[0x11; 4][..]);
        assert_eq!(&buf[130..], &[0xaa; 2 * SECTOR_SIZE - 130][..]);
    }
}
