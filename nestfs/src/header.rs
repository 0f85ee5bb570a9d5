use std::fmt;
use std::io;
use std::sync::Arc;

use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use crate::alloc::SectorMap;
use crate::io::SectorStorage;
use crate::SECTOR_SIZE;

type Le32 = U32<LittleEndian>;

/// Data sectors one header record can address.
pub const NUM_DIRECT: usize = (SECTOR_SIZE - 12) / 4;

/// File bytes one header record can cover.
const RECORD_BYTES: usize = NUM_DIRECT * SECTOR_SIZE;

/// Chain terminator for `next`.
const NO_SUCCESSOR: u32 = u32::MAX;

/// One on-disk link of a header chain.
#[repr(C)]
#[derive(AsBytes, FromBytes, Unaligned, Clone, Copy)]
struct HeaderRecord {
    /// File bytes covered by this record and its successors.
    bytes: Le32,
    /// Data sectors listed in this record's table.
    sectors: Le32,
    /// Sector of the successor record, or `NO_SUCCESSOR`.
    next: Le32,
    table: [Le32; NUM_DIRECT],
}

// A record must fill its sector exactly.
const _: [(); SECTOR_SIZE] = [(); std::mem::size_of::<HeaderRecord>()];

impl HeaderRecord {
    fn empty() -> Self {
        Self {
            bytes: Le32::new(0),
            sectors: Le32::new(0),
            next: Le32::new(NO_SUCCESSOR),
            table: [Le32::new(0); NUM_DIRECT],
        }
    }
}

/// Per-file metadata occupying one sector per record: the file's size and the
/// physical sector backing each logical one. Files too large for a single
/// record chain through successor records; the whole chain is fetched into
/// memory at once and written back record by record.
pub struct FileHeader {
    bytes: u32,
    data: Vec<u32>,
    /// Sectors holding the records after the first. Empty for files that fit
    /// one record; the first record's sector is owned by the caller.
    successors: Vec<u32>,
}

impl FileHeader {
    pub fn new() -> Self {
        Self {
            bytes: 0,
            data: Vec::new(),
            successors: Vec::new(),
        }
    }

    /// Total file size in bytes.
    pub fn size(&self) -> u32 {
        self.bytes
    }

    /// Number of data sectors backing the file.
    pub fn sector_count(&self) -> usize {
        self.data.len()
    }

    /// Physical sector backing the `index`th logical sector.
    pub fn data_sector(&self, index: usize) -> u32 {
        self.data[index]
    }

    /// Record sectors past the first.
    pub fn successor_sectors(&self) -> &[u32] {
        &self.successors
    }

    /// Reserves data sectors for `bytes` of content, plus a sector for every
    /// successor record the chain needs. Returns `false`, reserving nothing,
    /// when the map cannot hold all of it.
    pub fn allocate(&mut self, map: &mut SectorMap, bytes: u32) -> bool {
        let data_needed = (bytes as usize).div_ceil(SECTOR_SIZE);
        let records = data_needed.div_ceil(NUM_DIRECT).max(1);
        if (map.free_count() as usize) < data_needed + records - 1 {
            return false;
        }
        self.bytes = bytes;
        self.successors = (1..records)
            .map(|_| map.find_and_reserve().expect("free count checked above"))
            .collect();
        self.data = (0..data_needed)
            .map(|_| map.find_and_reserve().expect("free count checked above"))
            .collect();
        true
    }

    /// Returns the file's data sectors to the map. The record sectors
    /// themselves are cleared by the caller, walking `successor_sectors`.
    pub fn deallocate(&self, map: &mut SectorMap) {
        for &sector in &self.data {
            map.clear(sector);
        }
    }

    /// Reads the header chain starting at `sector`.
    pub fn fetch(dev: &Arc<dyn SectorStorage>, sector: u32) -> io::Result<Self> {
        let mut header = Self::new();
        let mut current = sector;
        loop {
            let record = read_record(dev.as_ref(), current)?;
            if current == sector {
                header.bytes = record.bytes.get();
            } else {
                header.successors.push(current);
            }
            let listed = (record.sectors.get() as usize).min(NUM_DIRECT);
            for slot in &record.table[..listed] {
                header.data.push(slot.get());
            }
            match record.next.get() {
                NO_SUCCESSOR => break,
                next => current = next,
            }
        }
        Ok(header)
    }

    /// Writes the chain back, the first record at `sector` and the rest at
    /// the successor sectors reserved during allocation.
    pub fn write_back(&self, dev: &Arc<dyn SectorStorage>, sector: u32) -> io::Result<()> {
        let chunks: Vec<&[u32]> = if self.data.is_empty() {
            vec![&self.data[..]]
        } else {
            self.data.chunks(NUM_DIRECT).collect()
        };
        debug_assert_eq!(chunks.len(), self.successors.len() + 1);

        let mut remaining = self.bytes;
        for (index, chunk) in chunks.iter().enumerate() {
            let mut record = HeaderRecord::empty();
            record.bytes.set(remaining);
            record.sectors.set(chunk.len() as u32);
            for (slot, &data_sector) in record.table.iter_mut().zip(chunk.iter()) {
                slot.set(data_sector);
            }
            if let Some(&next) = self.successors.get(index) {
                record.next.set(next);
            }
            let target = if index == 0 {
                sector
            } else {
                self.successors[index - 1]
            };
            dev.write_sector(target, record.as_bytes())?;
            remaining = remaining.saturating_sub(RECORD_BYTES as u32);
        }
        Ok(())
    }
}

impl fmt::Display for FileHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytes in sectors {:?}", self.bytes, self.data)?;
        if !self.successors.is_empty() {
            write!(f, " (records chained through {:?})", self.successors)?;
        }
        Ok(())
    }
}

fn read_record(dev: &dyn SectorStorage, sector: u32) -> io::Result<HeaderRecord> {
    let mut buf = [0u8; SECTOR_SIZE];
    dev.read_sector(sector, &mut buf)?;
    let record = LayoutVerified::<_, HeaderRecord>::new_unaligned(&buf[..])
        .expect("a record fills one sector exactly");
    Ok(*record)
}
