use std::sync::Arc;

use nestfs::io::FileDiskEmulatorBuilder;
use nestfs::{FileSystem, NUM_SECTORS};

/// Formats a throwaway disk image and walks the whole surface: create, write,
/// read, list, print, remove. Run with RUST_LOG=debug to watch the
/// operations.
pub fn main() {
    env_logger::init();

    let image = tempfile::tempfile().expect("could not create a disk image");
    let dev = Arc::new(
        FileDiskEmulatorBuilder::from(image)
            .with_sector_count(NUM_SECTORS as u32)
            .build()
            .expect("could not initialize disk emulator"),
    );

    let mut fs = FileSystem::format(dev).expect("format failed");
    fs.create("/notes", 0, true).expect("mkdir /notes");
    fs.create("/notes/today", 256, false).expect("create /notes/today");
    fs.create("/readme", 64, false).expect("create /readme");

    let fd = fs.open_numbered("/notes/today").expect("open /notes/today");
    fs.write(fd, b"sector by sector").expect("write");
    fs.close(fd).expect("close");

    let fd = fs.open_numbered("/notes/today").expect("reopen /notes/today");
    let mut buf = [0u8; 16];
    fs.read(fd, &mut buf).expect("read");
    fs.close(fd).expect("close");
    println!("read back: {}", String::from_utf8_lossy(&buf));

    println!("full tree:");
    for path in fs.list("/", true).expect("list") {
        println!("  {}", path);
    }

    fs.print().expect("print");

    fs.remove("/notes", true).expect("remove /notes");
    println!("after removing /notes:");
    for path in fs.list("/", true).expect("list") {
        println!("  {}", path);
    }
}
