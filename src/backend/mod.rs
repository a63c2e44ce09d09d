//! Tiered backend chain (C6): composes a cache tier in front of zero or
//! more origin tiers. Each `BackendDevice` owns one driver and, optionally,
//! a child device representing the next tier down.
//!
//! The original engine drives this composition through heap-allocated
//! continuation contexts passed to callbacks; this engine's thread-per-device
//! model (§5) makes every driver call synchronous from the owning I/O
//! thread's perspective, so the same GET/SET/DEL/TEST/freeup composition is
//! expressed directly as ordinary call chains instead.

pub mod localfs;

use std::collections::HashMap;

use log::warn;

use crate::error::{EngineError, Status};
use crate::metrics::Metrics;

/// Parsed `PROTO:ADDRESS(;PROTO:ADDRESS)*` link, one level at a time: a
/// non-empty `child_address` means another tier should be opened below
/// this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendLink {
    pub protocol: String,
    pub address: String,
    pub child_address: Option<String>,
}

pub fn parse_link(address: &str) -> Result<BackendLink, EngineError> {
    if address.is_empty() {
        return Err(EngineError::BackendAddress("empty address".into()));
    }
    let colon = address
        .find(':')
        .ok_or_else(|| EngineError::BackendAddress(format!("missing ':' in {address}")))?;
    let protocol = &address[..colon];
    let rest = &address[colon + 1..];

    let (addr, child_address) = match rest.find(';') {
        Some(semi) => (&rest[..semi], Some(rest[semi + 1..].to_string())),
        None => (rest, None),
    };

    if protocol.is_empty()
        || addr.is_empty()
        || child_address.as_deref().is_some_and(str::is_empty)
    {
        return Err(EngineError::BackendAddress(format!(
            "malformed backend link: {address}"
        )));
    }

    Ok(BackendLink {
        protocol: protocol.to_string(),
        address: addr.to_string(),
        child_address,
    })
}

/// Vtable every backend tier implements, grounded in `priskv_backend_driver`.
pub trait BackendDriver: Send {
    fn open(&mut self, link: &BackendLink) -> Result<(), EngineError>;
    fn close(&mut self) -> Result<(), EngineError>;
    fn is_cacheable(&self, value_len: u64) -> bool;
    fn get(&mut self, key: &[u8]) -> (Status, Vec<u8>);
    fn set(&mut self, key: &[u8], value: &[u8], timeout_ns: u64) -> Status;
    fn del(&mut self, key: &[u8]) -> Status;
    fn test(&mut self, key: &[u8]) -> Status;
    /// Free up space to make room for a future value of `value_len` bytes.
    fn evict(&mut self, value_len: u64) -> Status;
    /// Called once on the parent tier right after its child has been opened,
    /// so a freshly paired cache;origin chain starts consistent (stale
    /// entries left over from a previous run are dropped). No-op for tiers
    /// with nothing to reconcile.
    fn clearup(&mut self) -> Result<(), EngineError> {
        Ok(())
    }
}

pub type DriverFactory = Box<dyn Fn() -> Box<dyn BackendDriver> + Send + Sync>;

/// Name-keyed registry of driver factories, built once with
/// [`BackendRegistry::with_builtins`] and looked up during
/// [`BackendDevice::open`]. Stands in for the original's
/// constructor-attribute self-registration, which has no Rust equivalent.
#[derive(Default)]
pub struct BackendRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, factory: DriverFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("localfs", Box::new(|| Box::new(localfs::LocalFsDriver::new())));
        registry.register("memcache", Box::new(|| Box::new(localfs::MemCacheDriver::new())));
        registry
    }

    fn create(&self, protocol: &str) -> Option<Box<dyn BackendDriver>> {
        self.factories.get(protocol).map(|f| f())
    }
}

pub struct BackendDevice {
    link: BackendLink,
    driver: Box<dyn BackendDriver>,
    child: Option<Box<BackendDevice>>,
}

impl BackendDevice {
    /// Recursively open `address` and every tier chained behind it.
    pub fn open(address: &str, registry: &BackendRegistry) -> Result<Self, EngineError> {
        let link = parse_link(address)?;
        let mut driver = registry.create(&link.protocol).ok_or_else(|| {
            EngineError::BackendAddress(format!("unknown backend protocol: {}", link.protocol))
        })?;
        driver.open(&link)?;

        let child = match &link.child_address {
            Some(child_address) => match BackendDevice::open(child_address, registry) {
                Ok(child) => {
                    if let Err(e) = driver.clearup() {
                        warn!("backend: clearup device({}) failed: {e}", link.address);
                        let _ = driver.close();
                        return Err(e);
                    }
                    Some(Box::new(child))
                }
                Err(e) => {
                    let _ = driver.close();
                    return Err(e);
                }
            },
            None => None,
        };

        Ok(BackendDevice { link, driver, child })
    }

    pub fn close(&mut self) -> Result<(), EngineError> {
        if let Some(child) = &mut self.child {
            child.close()?;
        }
        self.driver.close()
    }

    pub fn link(&self) -> &BackendLink {
        &self.link
    }

    /// Evict from this tier until it can hold `value_len` bytes, or report
    /// the failure from an eviction attempt that made no progress.
    fn freeup(&mut self, value_len: u64) -> Status {
        loop {
            if self.driver.is_cacheable(value_len) {
                return Status::Ok;
            }
            let status = self.driver.evict(value_len);
            if !status.is_ok() {
                return status;
            }
        }
    }

    /// GET: try this tier; on miss, recurse into the child and, on a child
    /// hit, best-effort repopulate this tier's cache.
    pub fn get(&mut self, key: &[u8], metrics: &Metrics) -> (Status, Vec<u8>) {
        let (status, value) = self.driver.get(key);
        if status.is_ok() {
            return (status, value);
        }

        let Some(child) = &mut self.child else {
            return (status, value);
        };

        let (child_status, child_value) = child.get(key, metrics);
        if !child_status.is_ok() {
            return (child_status, child_value);
        }

        let freeup_status = self.freeup(child_value.len() as u64);
        if freeup_status.is_ok() {
            let set_status = self.driver.set(key, &child_value, 0);
            if !set_status.is_ok() {
                metrics.inc_backend_populate_failure();
                warn!("backend: cache population failed for key, status {set_status}");
            }
        } else {
            metrics.inc_backend_populate_failure();
            warn!("backend: freeup failed for key, status {freeup_status}");
        }

        // Cache-population failure never downgrades a successful child read.
        (Status::Ok, child_value)
    }

    /// SET: populate the child first (so it never lags the cache), then
    /// invalidate this tier's stale copy; with no child, write straight
    /// through to this tier.
    pub fn set(&mut self, key: &[u8], value: &[u8], timeout_ns: u64) -> Status {
        match &mut self.child {
            Some(child) => {
                let status = child.set(key, value, timeout_ns);
                if status.is_ok() {
                    self.driver.del(key)
                } else {
                    status
                }
            }
            None => self.driver.set(key, value, timeout_ns),
        }
    }

    /// DEL: remove from the child first, then from this tier.
    pub fn del(&mut self, key: &[u8]) -> Status {
        match &mut self.child {
            Some(child) => {
                let status = child.del(key);
                if status.is_ok() {
                    self.driver.del(key)
                } else {
                    status
                }
            }
            None => self.driver.del(key),
        }
    }

    /// TEST: report presence in this tier, else fall through to the child.
    pub fn test(&mut self, key: &[u8]) -> Status {
        let status = self.driver.test(key);
        if status.is_ok() {
            return status;
        }
        match &mut self.child {
            Some(child) => child.test(key),
            None => status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn parses_single_tier_link() {
        let link = parse_link("localfs:/tmp/cache").unwrap();
        assert_eq!(link.protocol, "localfs");
        assert_eq!(link.address, "/tmp/cache");
        assert!(link.child_address.is_none());
    }

    #[test]
    fn parses_chained_link() {
        let link = parse_link("memcache:hot;localfs:/tmp/origin").unwrap();
        assert_eq!(link.protocol, "memcache");
        assert_eq!(link.address, "hot");
        assert_eq!(link.child_address.as_deref(), Some("localfs:/tmp/origin"));
    }

    #[test]
    fn rejects_malformed_links() {
        assert!(parse_link("").is_err());
        assert!(parse_link(":address").is_err());
        assert!(parse_link("proto:").is_err());
        assert!(parse_link("proto:addr;").is_err());
    }

    #[test]
    fn two_tier_get_populates_cache_from_child() {
        let registry = BackendRegistry::with_builtins();
        let mut device = BackendDevice::open("memcache:hot;memcache:cold", &registry).unwrap();

        // Seed only the child (cold) tier directly through a DEL-free path:
        // go through the device SET, which writes through both tiers.
        device.set(b"k", b"v", 0);
        // Remove from the cache tier only by reaching into the child chain:
        // simulate an eviction at the top tier.
        assert!(device.driver.del(b"k").is_ok());

        let metrics = Metrics::new();
        let (status, value) = device.get(b"k", &metrics);
        assert!(status.is_ok());
        assert_eq!(value, b"v");

        // The top tier should now have been repopulated by the GET.
        let (status2, value2) = device.driver.get(b"k");
        assert!(status2.is_ok());
        assert_eq!(value2, b"v");
    }

    #[test]
    fn set_invalidates_top_tier_after_child_write() {
        let registry = BackendRegistry::with_builtins();
        let mut device = BackendDevice::open("memcache:hot;memcache:cold", &registry).unwrap();
        device.set(b"k", b"v1", 0);
        // top tier was invalidated (del'd) after the child set succeeded
        assert_eq!(device.driver.test(b"k"), Status::NotFound);

        let metrics = Metrics::new();
        let (status, value) = device.get(b"k", &metrics);
        assert!(status.is_ok());
        assert_eq!(value, b"v1");
    }

    #[test]
    fn single_tier_roundtrip() {
        let registry = BackendRegistry::with_builtins();
        let mut device = BackendDevice::open("memcache:solo", &registry).unwrap();
        assert_eq!(device.set(b"x", b"y", 0), Status::Ok);
        let metrics = Metrics::new();
        let (status, value) = device.get(b"x", &metrics);
        assert!(status.is_ok());
        assert_eq!(value, b"y");
    }

    #[test]
    fn localfs_tier_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = BackendRegistry::with_builtins();
        let address = format!("localfs:{}", dir.path().display());
        let mut device = BackendDevice::open(&address, &registry).unwrap();
        assert_eq!(device.set(b"x", b"y", 0), Status::Ok);
        let metrics = Metrics::new();
        let (status, value) = device.get(b"x", &metrics);
        assert!(status.is_ok());
        assert_eq!(value, b"y");
    }

    /// Cache tier whose `set` always fails, to exercise the
    /// cache-population-failure path in `get` without touching the read
    /// result.
    struct WriteFailingDriver {
        store: HashMap<Vec<u8>, Vec<u8>>,
    }

    impl BackendDriver for WriteFailingDriver {
        fn open(&mut self, _link: &BackendLink) -> Result<(), EngineError> {
            Ok(())
        }
        fn close(&mut self) -> Result<(), EngineError> {
            Ok(())
        }
        fn is_cacheable(&self, _value_len: u64) -> bool {
            true
        }
        fn get(&mut self, key: &[u8]) -> (Status, Vec<u8>) {
            match self.store.get(key) {
                Some(v) => (Status::Ok, v.clone()),
                None => (Status::NotFound, Vec::new()),
            }
        }
        fn set(&mut self, _key: &[u8], _value: &[u8], _timeout_ns: u64) -> Status {
            Status::Error
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
            Status::Ok
        }
    }

    #[test]
    fn repopulate_failure_is_counted_but_does_not_fail_the_read() {
        let mut registry = BackendRegistry::with_builtins();
        registry.register(
            "writefail",
            Box::new(|| {
                Box::new(WriteFailingDriver {
                    store: HashMap::new(),
                })
            }),
        );
        let mut device = BackendDevice::open("writefail:top;memcache:cold", &registry).unwrap();
        device.set(b"k", b"v", 0);
        assert!(device.driver.del(b"k").is_ok());

        let metrics = Metrics::new();
        let (status, value) = device.get(b"k", &metrics);
        assert!(status.is_ok());
        assert_eq!(value, b"v");
        assert_eq!(metrics.backend_populate_failures.load(Ordering::Relaxed), 1);
    }
}
