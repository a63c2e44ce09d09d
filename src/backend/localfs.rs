//! Concrete backend drivers (§4.10): `localfs`, a durable on-disk origin
//! tier, and `memcache`, an in-memory tier used to exercise two-tier
//! composition without touching disk. Neither is part of the wire-facing
//! surface; both exist only to make the backend chain's GET/SET/DEL/TEST/
//! freeup composition testable end to end.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use super::{BackendDriver, BackendLink};
use crate::error::{EngineError, Status};

/// Files a value under `address/<hex key>`. `is_cacheable` always reports
/// true (disk is assumed not to run out for these tests); `evict` is a
/// no-op that reports success.
pub struct LocalFsDriver {
    root: PathBuf,
}

impl LocalFsDriver {
    pub fn new() -> Self {
        LocalFsDriver { root: PathBuf::new() }
    }

    fn path_for(&self, key: &[u8]) -> PathBuf {
        self.root.join(hex_encode(key))
    }
}

impl Default for LocalFsDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendDriver for LocalFsDriver {
    fn open(&mut self, link: &BackendLink) -> Result<(), EngineError> {
        let root = PathBuf::from(&link.address);
        fs::create_dir_all(&root)?;
        self.root = root;
        Ok(())
    }

    fn close(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn is_cacheable(&self, _value_len: u64) -> bool {
        true
    }

    fn get(&mut self, key: &[u8]) -> (Status, Vec<u8>) {
        match fs::read(self.path_for(key)) {
            Ok(value) => (Status::Ok, value),
            Err(_) => (Status::NotFound, Vec::new()),
        }
    }

    fn set(&mut self, key: &[u8], value: &[u8], _timeout_ns: u64) -> Status {
        match fs::write(self.path_for(key), value) {
            Ok(()) => Status::Ok,
            Err(_) => Status::Error,
        }
    }

    fn del(&mut self, key: &[u8]) -> Status {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Status::Ok,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Status::Ok,
            Err(_) => Status::Error,
        }
    }

    fn test(&mut self, key: &[u8]) -> Status {
        if self.path_for(key).exists() {
            Status::Ok
        } else {
            Status::NotFound
        }
    }

    fn evict(&mut self, _value_len: u64) -> Status {
        Status::Ok
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// In-memory tier with a configurable capacity, used as a stand-in "cache"
/// tier in tests. `is_cacheable` rejects once the tier is at capacity;
/// `evict` drops one arbitrary entry to make room.
pub struct MemCacheDriver {
    capacity: usize,
    store: HashMap<Vec<u8>, Vec<u8>>,
}

impl MemCacheDriver {
    pub fn new() -> Self {
        MemCacheDriver {
            capacity: 1024,
            store: HashMap::new(),
        }
    }
}

impl Default for MemCacheDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendDriver for MemCacheDriver {
    fn open(&mut self, _link: &BackendLink) -> Result<(), EngineError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), EngineError> {
        self.store.clear();
        Ok(())
    }

    fn is_cacheable(&self, _value_len: u64) -> bool {
        self.store.len() < self.capacity
    }

    fn get(&mut self, key: &[u8]) -> (Status, Vec<u8>) {
        match self.store.get(key) {
            Some(value) => (Status::Ok, value.clone()),
            None => (Status::NotFound, Vec::new()),
        }
    }

    fn set(&mut self, key: &[u8], value: &[u8], _timeout_ns: u64) -> Status {
        self.store.insert(key.to_vec(), value.to_vec());
        Status::Ok
    }

    fn del(&mut self, key: &[u8]) -> Status {
        self.store.remove(key);
        Status::Ok
    }

    fn test(&mut self, key: &[u8]) -> Status {
        if self.store.contains_key(key) {
            Status::Ok
        } else {
            Status::NotFound
        }
    }

    fn evict(&mut self, _value_len: u64) -> Status {
        if let Some(key) = self.store.keys().next().cloned() {
            self.store.remove(&key);
            Status::Ok
        } else {
            Status::Error
        }
    }

    fn clearup(&mut self) -> Result<(), EngineError> {
        self.store.clear();
        Ok(())
    }
}
