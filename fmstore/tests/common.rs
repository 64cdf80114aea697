use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use fmstore::cadapter::memory::MemoryObjectStore;
use fmstore::{CacheRegistry, StorageContext, StoreConfig};

pub struct Fixture {
    pub ctx: Arc<StorageContext>,
    pub store: Arc<MemoryObjectStore>,
    pub registry: Arc<CacheRegistry>,
}

pub fn fixture() -> Fixture {
    fixture_with(StoreConfig::default())
}

pub fn fixture_with(config: StoreConfig) -> Fixture {
    let store = Arc::new(MemoryObjectStore::new());
    let registry = Arc::new(CacheRegistry::new(&config));
    let ctx = StorageContext::new(registry.clone()).with_object_store(store.clone());
    Fixture {
        ctx: Arc::new(ctx),
        store,
        registry,
    }
}

/// Writes a plain tarball with the given `(member, contents)` pairs.
#[allow(dead_code)]
pub fn write_tar(path: &Path, members: &[(&str, &str)]) {
    let mut builder = tar::Builder::new(File::create(path).unwrap());
    for (name, data) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(1_700_000_000);
        header.set_cksum();
        builder.append_data(&mut header, name, data.as_bytes()).unwrap();
    }
    builder.finish().unwrap();
}
