use std::fs::File;
use std::io::prelude::*;
use std::io::{self, BufWriter, ErrorKind, SeekFrom};
use std::sync::Mutex;

use crate::io::SectorStorage;
use crate::SECTOR_SIZE;

/// Emulates sector-addressed disk storage in userspace using an ordinary
/// file. This is only meant to be used for file system development and
/// testing.
pub struct FileDiskEmulator {
    /// The file must be a fixed-size file some exact multiple of the sector
    /// size.
    fd: Mutex<File>,
    sector_count: u32,
}

impl FileDiskEmulator {
    /// Returns ownership of the underlying file to the caller.
    pub fn into_file(self) -> File {
        self.fd.into_inner().unwrap()
    }
}

impl SectorStorage for FileDiskEmulator {
    fn read_sector(&self, sector: u32, buf: &mut [u8]) -> io::Result<()> {
        if sector >= self.sector_count {
            return Err(io::Error::new(ErrorKind::InvalidInput, "sector out of range"));
        }
        if buf.len() < SECTOR_SIZE {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "buffer does not hold a full sector",
            ));
        }
        let mut fd = self.fd.lock().unwrap();
        fd.seek(SeekFrom::Start(u64::from(sector) * SECTOR_SIZE as u64))?;
        fd.read_exact(&mut buf[..SECTOR_SIZE])?;
        Ok(())
    }

    fn write_sector(&self, sector: u32, buf: &[u8]) -> io::Result<()> {
        if sector >= self.sector_count {
            return Err(io::Error::new(ErrorKind::InvalidInput, "sector out of range"));
        }
        let mut fd = self.fd.lock().unwrap();
        fd.seek(SeekFrom::Start(u64::from(sector) * SECTOR_SIZE as u64))?;
        let max = buf.len().min(SECTOR_SIZE);
        fd.write_all(&buf[..max])?;
        Ok(())
    }

    fn sync_disk(&self) -> io::Result<()> {
        self.fd.lock().unwrap().sync_all()
    }
}

pub struct FileDiskEmulatorBuilder {
    fd: File,
    sector_count: u32,
    clear: bool,
}

impl From<File> for FileDiskEmulatorBuilder {
    fn from(fd: File) -> Self {
        FileDiskEmulatorBuilder {
            fd,
            // A better default here might be the size of the file rounded
            // down to the nearest sector.
            sector_count: 0,
            clear: true,
        }
    }
}

impl FileDiskEmulatorBuilder {
    /// Sets the number of sectors on the emulated device.
    pub fn with_sector_count(mut self, sectors: u32) -> Self {
        self.sector_count = sectors;
        self
    }

    /// Whether `build` zero-fills the backing file first. Pass `false` to
    /// attach to an already initialized image.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear = clear;
        self
    }

    /// This builder assumes ownership of the file used and by default does
    /// destructive things to prepare it. Ownership of the file is transferred
    /// to the emulator, so a builder can only be used once.
    pub fn build(mut self) -> io::Result<FileDiskEmulator> {
        debug_assert!(self.sector_count > 0);
        if self.clear {
            self.zero_sectors()?;
        }
        Ok(FileDiskEmulator {
            fd: Mutex::new(self.fd),
            sector_count: self.sector_count,
        })
    }

    fn zero_sectors(&mut self) -> io::Result<()> {
        self.fd.seek(SeekFrom::Start(0))?;
        let mut bfd = BufWriter::new(&self.fd);
        // Zero out the "disk" sectors, buffering each write to prevent
        // excessive syscalls.
        for _ in 0..self.sector_count {
            bfd.write_all(&[0u8; SECTOR_SIZE])?;
        }
        bfd.flush()
    }
}
