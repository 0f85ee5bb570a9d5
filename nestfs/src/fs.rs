use std::io;
use std::sync::Arc;

use log::{debug, info};
use thiserror::Error;

use crate::alloc::SectorMap;
use crate::dir::{Directory, DIR_CAPACITY, NAME_MAX};
use crate::file::OpenFile;
use crate::header::FileHeader;
use crate::io::SectorStorage;
use crate::{FREE_MAP_SECTOR, NUM_SECTORS, ROOT_DIR_SECTOR};

/// Size of the free map's backing file: one bit per sector.
const FREE_MAP_FILE_SIZE: usize = NUM_SECTORS / 8;

/// Open-descriptor slots; descriptor 0 is reserved and never handed out.
const DESCRIPTOR_SLOTS: usize = 20;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("found no entry at path or descriptor")]
    NotFound,
    #[error("name already present in directory")]
    AlreadyExists,
    #[error("out of directory slots, descriptors, or free sectors")]
    CapacityExhausted,
    #[error("storage failure")]
    Storage(#[from] io::Error),
}

/// The file-system orchestrator: owns the shared device, the two
/// permanently-open files backing the free map and the root directory, and
/// the bounded table of numbered descriptors.
///
/// Every operation re-reads the directory tables it needs from disk, mutates
/// them in memory, and flushes only once the whole operation has succeeded.
/// The flush sequence itself is not atomic against a crash between writes.
pub struct FileSystem {
    dev: Arc<dyn SectorStorage>,
    free_map_file: OpenFile,
    root_dir_file: OpenFile,
    open_table: [Option<OpenFile>; DESCRIPTOR_SLOTS],
}

impl FileSystem {
    /// Formats a blank volume and mounts it: reserves the two well-known
    /// sectors, lays out header and storage for the free map's and the root
    /// directory's own backing files, and persists an empty root table.
    pub fn format(dev: Arc<dyn SectorStorage>) -> Result<Self, FsError> {
        info!("formatting the volume");
        let mut map = SectorMap::new();
        map.reserve(FREE_MAP_SECTOR);
        map.reserve(ROOT_DIR_SECTOR);

        let mut map_header = FileHeader::new();
        let mut dir_header = FileHeader::new();
        if !map_header.allocate(&mut map, FREE_MAP_FILE_SIZE as u32)
            || !dir_header.allocate(&mut map, Directory::FILE_SIZE as u32)
        {
            return Err(FsError::CapacityExhausted);
        }

        // The headers must land on disk before the two files can be opened:
        // opening reads the header back from its sector.
        map_header.write_back(&dev, FREE_MAP_SECTOR)?;
        dir_header.write_back(&dev, ROOT_DIR_SECTOR)?;

        let free_map_file = OpenFile::new(dev.clone(), FREE_MAP_SECTOR)?;
        let root_dir_file = OpenFile::new(dev.clone(), ROOT_DIR_SECTOR)?;
        map.save(&free_map_file)?;
        Directory::new(DIR_CAPACITY).save(&root_dir_file)?;
        dev.sync_disk()?;

        Ok(Self {
            dev,
            free_map_file,
            root_dir_file,
            open_table: Default::default(),
        })
    }

    /// Mounts an already formatted volume. The on-disk content is trusted
    /// as-is.
    pub fn mount(dev: Arc<dyn SectorStorage>) -> Result<Self, FsError> {
        info!("mounting the volume");
        let free_map_file = OpenFile::new(dev.clone(), FREE_MAP_SECTOR)?;
        let root_dir_file = OpenFile::new(dev.clone(), ROOT_DIR_SECTOR)?;
        Ok(Self {
            dev,
            free_map_file,
            root_dir_file,
            open_table: Default::default(),
        })
    }

    /// Creates a regular file of `initial_size` bytes at `path`, or a
    /// subdirectory when `is_directory` is set (the size is then the fixed
    /// table size, whatever the caller asked for). All bookkeeping happens on
    /// in-memory copies; the new header, the parent table and the free map
    /// are flushed, in that order, only once every step has succeeded, so a
    /// failed create leaves the disk untouched.
    pub fn create(
        &mut self,
        path: &str,
        initial_size: u32,
        is_directory: bool,
    ) -> Result<(), FsError> {
        let (parent_path, name) = split_path(path)?;
        debug!("creating {:?} under {:?}", name, parent_path);

        let parent_sector = self.load_root()?.resolve(&self.dev, parent_path)?;
        let parent_file = OpenFile::new(self.dev.clone(), parent_sector)?;
        let mut parent = Directory::load(&parent_file, DIR_CAPACITY)?;
        if parent.find_index(name).is_some() {
            return Err(FsError::AlreadyExists);
        }

        let mut map = SectorMap::load(&self.free_map_file)?;
        let header_sector = map.find_and_reserve().ok_or(FsError::CapacityExhausted)?;
        if !parent.add(name, header_sector, is_directory) {
            return Err(FsError::CapacityExhausted);
        }

        let size = if is_directory {
            Directory::FILE_SIZE as u32
        } else {
            initial_size
        };
        let mut header = FileHeader::new();
        if !header.allocate(&mut map, size) {
            return Err(FsError::CapacityExhausted);
        }

        header.write_back(&self.dev, header_sector)?;
        parent.save(&parent_file)?;
        map.save(&self.free_map_file)?;

        if is_directory {
            let new_dir_file = OpenFile::new(self.dev.clone(), header_sector)?;
            Directory::new(DIR_CAPACITY).save(&new_dir_file)?;
        }
        Ok(())
    }

    /// Opens the file or directory at `path` as a standalone handle.
    pub fn open(&self, path: &str) -> Result<OpenFile, FsError> {
        let sector = self.load_root()?.resolve(&self.dev, path)?;
        Ok(OpenFile::new(self.dev.clone(), sector)?)
    }

    /// As `open`, but parks the handle in the first free slot of the bounded
    /// descriptor table.
    pub fn open_numbered(&mut self, path: &str) -> Result<usize, FsError> {
        let file = self.open(path)?;
        let descriptor = (1..DESCRIPTOR_SLOTS)
            .find(|&slot| self.open_table[slot].is_none())
            .ok_or(FsError::CapacityExhausted)?;
        self.open_table[descriptor] = Some(file);
        Ok(descriptor)
    }

    /// Reads from the descriptor's seek position, advancing it.
    pub fn read(&mut self, descriptor: usize, buf: &mut [u8]) -> Result<usize, FsError> {
        Ok(self.handle_mut(descriptor)?.read(buf)?)
    }

    /// Writes at the descriptor's seek position, advancing it.
    pub fn write(&mut self, descriptor: usize, buf: &[u8]) -> Result<usize, FsError> {
        Ok(self.handle_mut(descriptor)?.write(buf)?)
    }

    /// Releases the descriptor's handle and frees its slot.
    pub fn close(&mut self, descriptor: usize) -> Result<(), FsError> {
        match self.open_table.get_mut(descriptor) {
            Some(slot) if descriptor >= 1 && slot.is_some() => {
                *slot = None;
                Ok(())
            }
            _ => Err(FsError::NotFound),
        }
    }

    /// Removes the entry at `path`, returning its header chain and data
    /// sectors to the free map. A subdirectory needs `recursive`, which
    /// removes its contents depth first; that walk is not transactional — a
    /// failure partway through leaves the already-removed part removed.
    pub fn remove(&mut self, path: &str, recursive: bool) -> Result<(), FsError> {
        let (parent_path, name) = split_path(path)?;
        debug!("removing {:?} under {:?}", name, parent_path);

        let parent_sector = self.load_root()?.resolve(&self.dev, parent_path)?;
        let parent_file = OpenFile::new(self.dev.clone(), parent_sector)?;
        let mut parent = Directory::load(&parent_file, DIR_CAPACITY)?;
        let target_sector = parent.find_sector(name).ok_or(FsError::NotFound)?;
        let is_directory = parent.is_directory_flag(name) == Some(true);

        if is_directory && !recursive {
            return Err(FsError::InvalidArgument(
                "removing a directory needs the recursive flag".to_string(),
            ));
        }
        if is_directory {
            let target_file = OpenFile::new(self.dev.clone(), target_sector)?;
            let children = Directory::load(&target_file, DIR_CAPACITY)?.list();
            let base = path.trim_end_matches('/');
            for child in children {
                self.remove(&format!("{}/{}", base, child), true)?;
            }
        }

        // The free map is loaded only now: the recursive walk above persists
        // its own map updates as it goes.
        let header = FileHeader::fetch(&self.dev, target_sector)?;
        let mut map = SectorMap::load(&self.free_map_file)?;
        header.deallocate(&mut map);
        for &record_sector in header.successor_sectors() {
            map.clear(record_sector);
        }
        map.clear(target_sector);
        parent.remove(name);

        map.save(&self.free_map_file)?;
        parent.save(&parent_file)?;
        Ok(())
    }

    /// Lists the directory at `path`: the direct entry names, or with
    /// `recursive` the full paths of the whole subtree.
    pub fn list(&self, path: &str, recursive: bool) -> Result<Vec<String>, FsError> {
        let sector = if path == "/" {
            ROOT_DIR_SECTOR
        } else {
            let (parent_path, name) = split_path(path)?;
            let parent_sector = self.load_root()?.resolve(&self.dev, parent_path)?;
            let parent_file = OpenFile::new(self.dev.clone(), parent_sector)?;
            let parent = Directory::load(&parent_file, DIR_CAPACITY)?;
            match parent.is_directory_flag(name) {
                Some(true) => parent.find_sector(name).ok_or(FsError::NotFound)?,
                Some(false) => {
                    return Err(FsError::InvalidArgument(format!(
                        "{} is not a directory",
                        path
                    )))
                }
                None => return Err(FsError::NotFound),
            }
        };

        let dir_file = OpenFile::new(self.dev.clone(), sector)?;
        let dir = Directory::load(&dir_file, DIR_CAPACITY)?;
        if recursive {
            let prefix = if path == "/" {
                ""
            } else {
                path.trim_end_matches('/')
            };
            dir.list_all(&self.dev, prefix)
        } else {
            Ok(dir.list())
        }
    }

    /// Free sectors remaining in the allocator.
    pub fn free_sector_count(&self) -> Result<u32, FsError> {
        Ok(SectorMap::load(&self.free_map_file)?.free_count())
    }

    /// Dumps the two well-known headers, the free-sector count and the root
    /// table's in-use entries. Reads only, mutates nothing.
    pub fn print(&self) -> Result<(), FsError> {
        let map_header = FileHeader::fetch(&self.dev, FREE_MAP_SECTOR)?;
        let dir_header = FileHeader::fetch(&self.dev, ROOT_DIR_SECTOR)?;
        println!("free map header: {}", map_header);
        println!("root directory header: {}", dir_header);
        println!("free sectors: {}", self.free_sector_count()?);

        println!("root directory contents:");
        let root = self.load_root()?;
        for entry in root.entries() {
            let header = FileHeader::fetch(&self.dev, entry.sector())?;
            println!("  {} (sector {}): {}", entry.name(), entry.sector(), header);
        }
        Ok(())
    }

    fn load_root(&self) -> io::Result<Directory> {
        Directory::load(&self.root_dir_file, DIR_CAPACITY)
    }

    fn handle_mut(&mut self, descriptor: usize) -> Result<&mut OpenFile, FsError> {
        match self.open_table.get_mut(descriptor) {
            Some(Some(file)) if descriptor >= 1 => Ok(file),
            _ => Err(FsError::NotFound),
        }
    }
}

/// Splits an absolute path into the parent directory's path and the final
/// name component: `"/a/b/c"` becomes `("/a/b", "c")` and `"/a"` becomes
/// `("/", "a")`. The root itself has no final component and is rejected, as
/// are relative paths and components longer than the name bound.
fn split_path(path: &str) -> Result<(&str, &str), FsError> {
    if !path.starts_with('/') {
        return Err(FsError::InvalidArgument(format!(
            "path {:?} is not absolute",
            path
        )));
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(FsError::InvalidArgument(
            "the root itself cannot be created or removed".to_string(),
        ));
    }
    let split = trimmed
        .rfind('/')
        .expect("an absolute path keeps its leading separator");
    let name = &trimmed[split + 1..];
    if name.len() > NAME_MAX {
        return Err(FsError::InvalidArgument(format!(
            "name {:?} exceeds {} bytes",
            name, NAME_MAX
        )));
    }
    let parent = if split == 0 { "/" } else { &trimmed[..split] };
    Ok((parent, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::FileDiskEmulatorBuilder;

    fn create_test_device() -> Arc<dyn SectorStorage> {
        let backing = tempfile::tempfile().unwrap();
        Arc::new(
            FileDiskEmulatorBuilder::from(backing)
                .with_sector_count(NUM_SECTORS as u32)
                .build()
                .expect("could not initialize disk emulator"),
        )
    }

    #[test]
    fn fresh_volume_has_an_empty_root() {
        let fs = FileSystem::format(create_test_device()).unwrap();
        assert!(fs.list("/", false).unwrap().is_empty());
    }

    #[test]
    fn create_then_open_finds_the_file() {
        let mut fs = FileSystem::format(create_test_device()).unwrap();
        fs.create("/hello", 64, false).unwrap();

        let file = fs.open("/hello").unwrap();
        assert_eq!(file.length(), 64);
    }

    #[test]
    fn open_of_missing_path_returns_not_found() {
        let fs = FileSystem::format(create_test_device()).unwrap();
        match fs.open("/absent").unwrap_err() {
            FsError::NotFound => (),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn create_on_existing_name_fails() {
        let mut fs = FileSystem::format(create_test_device()).unwrap();
        fs.create("/dup", 0, false).unwrap();

        match fs.create("/dup", 0, true).unwrap_err() {
            FsError::AlreadyExists => (),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn relative_and_overlong_paths_are_rejected() {
        let mut fs = FileSystem::format(create_test_device()).unwrap();

        match fs.create("oops", 0, false).unwrap_err() {
            FsError::InvalidArgument(_) => (),
            other => panic!("unexpected error: {}", other),
        }
        match fs.create("/name-is-way-too-long", 0, false).unwrap_err() {
            FsError::InvalidArgument(_) => (),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn descriptor_io_round_trips() {
        let mut fs = FileSystem::format(create_test_device()).unwrap();
        fs.create("/data", 256, false).unwrap();

        let writer = fs.open_numbered("/data").unwrap();
        assert_eq!(fs.write(writer, b"over the sector").unwrap(), 15);
        fs.close(writer).unwrap();

        let reader = fs.open_numbered("/data").unwrap();
        let mut buf = [0u8; 15];
        assert_eq!(fs.read(reader, &mut buf).unwrap(), 15);
        assert_eq!(&buf, b"over the sector");
        fs.close(reader).unwrap();
    }

    #[test]
    fn io_on_a_free_descriptor_fails() {
        let mut fs = FileSystem::format(create_test_device()).unwrap();
        let mut buf = [0u8; 4];

        for descriptor in [0, 7, DESCRIPTOR_SLOTS] {
            match fs.read(descriptor, &mut buf).unwrap_err() {
                FsError::NotFound => (),
                other => panic!("unexpected error: {}", other),
            }
        }
        match fs.close(3).unwrap_err() {
            FsError::NotFound => (),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn closed_descriptor_slot_is_reusable() {
        let mut fs = FileSystem::format(create_test_device()).unwrap();
        fs.create("/f", 0, false).unwrap();

        let first = fs.open_numbered("/f").unwrap();
        let second = fs.open_numbered("/f").unwrap();
        assert_ne!(first, second);

        fs.close(first).unwrap();
        assert_eq!(fs.open_numbered("/f").unwrap(), first);
    }

    #[test]
    fn listing_a_file_is_an_invalid_argument() {
        let mut fs = FileSystem::format(create_test_device()).unwrap();
        fs.create("/plain", 0, false).unwrap();

        match fs.list("/plain", false).unwrap_err() {
            FsError::InvalidArgument(_) => (),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn directory_contents_survive_a_remount() {
        let image = tempfile::NamedTempFile::new().unwrap();
        let dev: Arc<dyn SectorStorage> = Arc::new(
            FileDiskEmulatorBuilder::from(image.reopen().unwrap())
                .with_sector_count(NUM_SECTORS as u32)
                .build()
                .unwrap(),
        );
        let mut fs = FileSystem::format(dev).unwrap();
        fs.create("/kept", 100, false).unwrap();
        drop(fs);

        let dev: Arc<dyn SectorStorage> = Arc::new(
            FileDiskEmulatorBuilder::from(image.reopen().unwrap())
                .with_sector_count(NUM_SECTORS as u32)
                // Don't reset the initialized image.
                .clear_medium(false)
                .build()
                .unwrap(),
        );
        let fs = FileSystem::mount(dev).unwrap();
        assert_eq!(fs.list("/", false).unwrap(), vec!["kept"]);
        assert_eq!(fs.open("/kept").unwrap().length(), 100);
    }
}
