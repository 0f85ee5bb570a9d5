use std::io;
use std::sync::Arc;

use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned};

use crate::file::OpenFile;
use crate::fs::FsError;
use crate::io::SectorStorage;
use crate::ROOT_DIR_SECTOR;

type Le32 = U32<LittleEndian>;

/// Longest allowed name component, in bytes. Names are single components,
/// never full paths.
pub const NAME_MAX: usize = 13;

const NAME_BUF: usize = NAME_MAX + 1;

/// Slots in every directory table, root and subdirectories alike.
pub const DIR_CAPACITY: usize = 64;

/// One slot of a directory table: a name bound to the sector holding either
/// a regular file's header or a subdirectory's table.
#[repr(C)]
#[derive(AsBytes, FromBytes, Unaligned, Clone)]
pub struct DirEntry {
    in_use: u8,
    /// NUL-padded; the final byte is always NUL.
    name: [u8; NAME_BUF],
    sector: Le32,
    is_dir: u8,
}

/// On-disk record size.
const _: [(); DirEntry::SIZE] = [(); std::mem::size_of::<DirEntry>()];

impl DirEntry {
    pub const SIZE: usize = 20;

    fn empty() -> Self {
        Self {
            in_use: 0,
            name: [0; NAME_BUF],
            sector: Le32::new(0),
            is_dir: 0,
        }
    }

    fn occupy(name: &str, sector: u32, is_dir: bool) -> Self {
        debug_assert!(name.len() <= NAME_MAX);
        let mut buf = [0u8; NAME_BUF];
        buf[..name.len()].copy_from_slice(name.as_bytes());
        Self {
            in_use: 1,
            name: buf,
            sector: Le32::new(sector),
            is_dir: is_dir as u8,
        }
    }

    pub fn name(&self) -> String {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_BUF);
        String::from_utf8_lossy(&self.name[..len]).into_owned()
    }

    pub fn sector(&self) -> u32 {
        self.sector.get()
    }

    pub fn is_directory(&self) -> bool {
        self.is_dir != 0
    }

    fn matches(&self, name: &str) -> bool {
        let bytes = name.as_bytes();
        bytes.len() <= NAME_MAX
            && self.name[..bytes.len()] == *bytes
            && self.name[bytes.len()] == 0
    }
}

/// Fixed-capacity table of named entries, persisted as the byte content of an
/// ordinary file. A subdirectory is a file whose bytes deserialize as another
/// table of the same capacity, so the whole tree is built out of files; only
/// the root's sector is known a priori.
///
/// No table is cached across operations: callers load a fresh copy, mutate it
/// in memory and write it back.
pub struct Directory {
    table: Vec<DirEntry>,
}

impl Directory {
    /// Serialized size of a table at the system-wide capacity.
    pub const FILE_SIZE: usize = DIR_CAPACITY * DirEntry::SIZE;

    /// An empty table of `capacity` slots. The capacity is fixed for the
    /// lifetime of the table.
    pub fn new(capacity: usize) -> Self {
        Self {
            table: vec![DirEntry::empty(); capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.table.len()
    }

    /// Reads a table of `capacity` entries from offset 0 of `file`. The
    /// file's declared size is trusted to match the serialized table size.
    pub fn load(file: &OpenFile, capacity: usize) -> io::Result<Self> {
        let mut buf = vec![0u8; capacity * DirEntry::SIZE];
        file.read_at(&mut buf, 0)?;
        let table = buf
            .chunks_exact(DirEntry::SIZE)
            .map(|chunk| {
                let entry = LayoutVerified::<_, DirEntry>::new_unaligned(chunk)
                    .expect("chunk length equals the record size");
                (*entry).clone()
            })
            .collect();
        Ok(Self { table })
    }

    /// Writes the whole table to offset 0 of `file`.
    pub fn save(&self, file: &OpenFile) -> io::Result<()> {
        let mut buf = Vec::with_capacity(self.table.len() * DirEntry::SIZE);
        for entry in &self.table {
            buf.extend_from_slice(entry.as_bytes());
        }
        file.write_at(&buf, 0)?;
        Ok(())
    }

    /// Index of the in-use entry named `name`, comparing byte-for-byte up to
    /// the name bound. First match in slot order wins.
    pub fn find_index(&self, name: &str) -> Option<usize> {
        self.table
            .iter()
            .position(|entry| entry.in_use != 0 && entry.matches(name))
    }

    /// Header sector of the entry named `name`.
    pub fn find_sector(&self, name: &str) -> Option<u32> {
        self.find_index(name).map(|index| self.table[index].sector())
    }

    /// Whether `name` is a subdirectory. `None` means the name is absent,
    /// which is not the same as `Some(false)`.
    pub fn is_directory_flag(&self, name: &str) -> Option<bool> {
        self.find_index(name)
            .map(|index| self.table[index].is_directory())
    }

    /// Resolves an absolute `/`-separated path against this table acting as
    /// the root of its own subtree. The literal path `"/"` names the
    /// well-known root sector itself. Empty components are skipped; a missing
    /// component, or a non-directory component with path left over, is
    /// `NotFound`.
    ///
    /// Each recursive step owns a freshly opened file and table for the
    /// duration of that step only.
    pub fn resolve(&self, dev: &Arc<dyn SectorStorage>, path: &str) -> Result<u32, FsError> {
        if path == "/" {
            return Ok(ROOT_DIR_SECTOR);
        }
        let rest = path.trim_start_matches('/');
        let (head, tail) = match rest.split_once('/') {
            Some((head, tail)) => (head, tail.trim_start_matches('/')),
            None => (rest, ""),
        };
        if head.is_empty() {
            return Err(FsError::NotFound);
        }
        let entry = &self.table[self.find_index(head).ok_or(FsError::NotFound)?];
        if tail.is_empty() {
            return Ok(entry.sector());
        }
        if !entry.is_directory() {
            return Err(FsError::NotFound);
        }
        let sub_file = OpenFile::new(dev.clone(), entry.sector())?;
        let sub = Directory::load(&sub_file, self.capacity())?;
        sub.resolve(dev, tail)
    }

    /// Adds `name` at the first free slot. Fails when the name is already
    /// present or every slot is in use; a full table stays full until a
    /// `remove` frees a slot.
    pub fn add(&mut self, name: &str, sector: u32, is_dir: bool) -> bool {
        debug_assert!(name.len() <= NAME_MAX);
        if self.find_index(name).is_some() {
            return false;
        }
        match self.table.iter_mut().find(|entry| entry.in_use == 0) {
            Some(slot) => {
                *slot = DirEntry::occupy(name, sector, is_dir);
                true
            }
            None => false,
        }
    }

    /// Marks the entry's slot free. The slot's other bytes go stale until a
    /// future `add` lands on it; callers must not rely on them.
    pub fn remove(&mut self, name: &str) -> bool {
        match self.find_index(name) {
            Some(index) => {
                self.table[index].in_use = 0;
                true
            }
            None => false,
        }
    }

    /// Names of the in-use entries, in slot order.
    pub fn list(&self) -> Vec<String> {
        self.entries().map(|entry| entry.name()).collect()
    }

    /// Full paths of every entry below this table, depth first: each entry
    /// before its children, siblings in slot order.
    pub fn list_all(
        &self,
        dev: &Arc<dyn SectorStorage>,
        prefix: &str,
    ) -> Result<Vec<String>, FsError> {
        let mut paths = Vec::new();
        self.walk(dev, prefix, &mut paths)?;
        Ok(paths)
    }

    fn walk(
        &self,
        dev: &Arc<dyn SectorStorage>,
        prefix: &str,
        out: &mut Vec<String>,
    ) -> Result<(), FsError> {
        for entry in self.entries() {
            let path = format!("{}/{}", prefix, entry.name());
            if entry.is_directory() {
                let sub_file = OpenFile::new(dev.clone(), entry.sector())?;
                let sub = Directory::load(&sub_file, self.capacity())?;
                out.push(path.clone());
                sub.walk(dev, &path, out)?;
            } else {
                out.push(path);
            }
        }
        Ok(())
    }

    /// In-use entries in slot order.
    pub fn entries(&self) -> impl Iterator<Item = &DirEntry> + '_ {
        self.table.iter().filter(|entry| entry.in_use != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn added_entry_is_found_with_its_sector_and_flag() {
        let mut dir = Directory::new(8);

        assert!(dir.add("notes", 42, false));
        assert_eq!(dir.find_sector("notes"), Some(42));
        assert_eq!(dir.is_directory_flag("notes"), Some(false));

        assert!(dir.add("sub", 43, true));
        assert_eq!(dir.is_directory_flag("sub"), Some(true));
    }

    #[test]
    fn absent_name_is_distinguishable_from_false_flag() {
        let mut dir = Directory::new(8);
        assert!(dir.add("plain", 3, false));

        assert_eq!(dir.is_directory_flag("plain"), Some(false));
        assert_eq!(dir.is_directory_flag("missing"), None);
        assert_eq!(dir.find_sector("missing"), None);
    }

    #[test]
    fn duplicate_add_fails_while_entry_is_in_use() {
        let mut dir = Directory::new(8);

        assert!(dir.add("twice", 5, false));
        assert!(!dir.add("twice", 6, true));
        assert_eq!(dir.find_sector("twice"), Some(5));

        assert!(dir.remove("twice"));
        assert!(dir.add("twice", 6, true));
        assert_eq!(dir.find_sector("twice"), Some(6));
    }

    #[test]
    fn table_accepts_exactly_its_capacity() {
        let mut dir = Directory::new(4);

        for index in 0..4 {
            assert!(dir.add(&format!("f{}", index), index as u32 + 10, false));
        }
        assert!(!dir.add("overflow", 99, false));

        assert!(dir.remove("f2"));
        assert!(dir.add("overflow", 99, false));
    }

    #[test]
    fn removed_slot_is_reused_by_the_next_add() {
        let mut dir = Directory::new(4);
        dir.add("a", 1, false);
        dir.add("b", 2, false);

        let freed = dir.find_index("a").unwrap();
        dir.remove("a");
        assert_eq!(dir.find_index("a"), None);

        dir.add("c", 3, false);
        assert_eq!(dir.find_index("c"), Some(freed));
    }

    #[test]
    fn names_compare_up_to_the_full_bound() {
        let mut dir = Directory::new(4);
        let longest = "abcdefghijklm";
        assert_eq!(longest.len(), NAME_MAX);

        assert!(dir.add(longest, 7, false));
        assert_eq!(dir.find_sector(longest), Some(7));
        assert_eq!(dir.find_sector("abcdefghijkl"), None);
    }

    #[test]
    fn list_preserves_slot_order() {
        let mut dir = Directory::new(4);
        dir.add("first", 1, false);
        dir.add("second", 2, true);
        dir.add("third", 3, false);

        assert_eq!(dir.list(), vec!["first", "second", "third"]);
    }
}
