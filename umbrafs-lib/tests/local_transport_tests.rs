//! Local transport integration tests against a temporary image file

use std::path::PathBuf;

use umbrafs_lib::{
    constants, read_block, write_block, BlockCache, BlockTransport, CacheTuning, LocalTransport,
};

const BLOCK_SIZE: usize = constants::BLOCK_SIZE;

struct TempImage {
    path: PathBuf,
}

impl TempImage {
    fn new(name: &str, blocks: u64) -> Self {
        let path = std::env::temp_dir().join(format!(
            "umbrafs-test-{}-{}.img",
            name,
            std::process::id()
        ));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        file.set_len(blocks * BLOCK_SIZE as u64).unwrap();
        Self { path }
    }

    fn cache(&self) -> BlockCache {
        let path = self.path.clone();
        BlockCache::new(CacheTuning::default(), move |completions| {
            Ok(Box::new(LocalTransport::new(&path, completions)?) as Box<dyn BlockTransport>)
        })
        .unwrap()
    }
}

impl Drop for TempImage {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[test]
fn test_fresh_image_reads_zeros() {
    let image = TempImage::new("zeros", 16);
    let cache = image.cache();

    let data = read_block(&cache, 3).unwrap();
    assert_eq!(data.len(), BLOCK_SIZE);
    assert!(data.iter().all(|&b| b == 0));
    cache.shutdown();
}

#[test]
fn test_write_sync_persists_to_image() {
    let image = TempImage::new("persist", 16);
    {
        let cache = image.cache();
        for bnr in 0..8u64 {
            write_block(&cache, bnr, &[0xC0 + bnr as u8; 32]).unwrap();
        }
        cache.sync().unwrap();
        cache.shutdown();
    }

    // The bytes are on disk at the block offsets
    let raw = std::fs::read(&image.path).unwrap();
    for bnr in 0..8usize {
        let offset = bnr * BLOCK_SIZE;
        assert_eq!(raw[offset], 0xC0 + bnr as u8);
        assert_eq!(raw[offset + 31], 0xC0 + bnr as u8);
        assert_eq!(raw[offset + 32], 0);
    }

    // A fresh cache over the same image reads them back
    let cache = image.cache();
    for bnr in 0..8u64 {
        let data = read_block(&cache, bnr).unwrap();
        assert_eq!(data[0], 0xC0 + bnr as u8);
    }
    cache.shutdown();
}

#[test]
fn test_many_blocks_under_queue_pressure() {
    let image = TempImage::new("pressure", 256);
    let cache = image.cache();

    // More writes than the 63-descriptor pool; pacing must hold
    for bnr in 0..200u64 {
        write_block(&cache, bnr, &[(bnr % 251) as u8; 8]).unwrap();
    }
    cache.sync().unwrap();

    for bnr in 0..200u64 {
        let data = read_block(&cache, bnr).unwrap();
        assert_eq!(data[0], (bnr % 251) as u8);
    }
    cache.shutdown();
}
