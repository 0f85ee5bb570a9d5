mod diskemu;
mod sector;

pub use diskemu::{FileDiskEmulator, FileDiskEmulatorBuilder};
pub use sector::SectorStorage;
