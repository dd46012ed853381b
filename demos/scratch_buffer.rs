// Grows a file-backed scratch buffer a page at a time, the way a block store would.



use std::os::fd::AsFd;

use fmap::{Advice, MapCfg, SyncMode};



fn main() -> fmap::Result<()> {
    env_logger::init();

    let file = tempfile::tempfile().expect("create scratch file");
    let mut map = MapCfg::new().sync_mode(SyncMode::Sync).map_file(&file)?;

    for block in 0..8usize {
        // Every outstanding slice into `map` has to be gone before it can move.
        map = map.resize((block + 1) * 4096)?;
        map[block * 4096..].fill(block as u8);
        map.sync()?;
    }

    map.advise(0, map.len(), Advice::Sequential)?;
    println!(
        "{} bytes mapped at {:p}, file is {} bytes",
        map.len(),
        map.as_ptr(),
        fmap::fd::file_len(file.as_fd())?,
    );

    let map = map.resize(4096)?;
    println!("shrunk to {} bytes, first byte is {}", map.len(), map[0]);

    map.destroy()
}
