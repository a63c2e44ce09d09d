//! Memory arena (C1): a persistent mapping laid out as header, key-slot
//! region, value-block region, backed by hugetlbfs/tmpfs (or an anonymous
//! in-memory mapping for tests).

use std::fs::{File, OpenOptions};
use std::mem::size_of;
use std::path::Path;

use memmap2::MmapMut;

use crate::error::EngineError;

pub const HEADER_MAGIC: [u8; 8] = *b"PRSKV\0\0\0";
pub const HEADER_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 128;

pub const KEY_SLOT_HEADER_SIZE: usize = 64;

const HUGETLBFS_MAGIC: i64 = 0x958458f6;
const TMPFS_MAGIC: i64 = 0x01021994;

/// On-disk/mapped header, packed to exactly `HEADER_SIZE` bytes. Fields are
/// stored little-endian; `raw()`/`from_raw()` handle the byte conversion so
/// the struct itself can stay plain Rust types.
#[derive(Debug, Clone, Copy)]
pub struct ArenaHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub flags: u32,
    pub max_key_length: u16,
    pub max_keys: u32,
    pub value_block_size: u32,
    pub value_blocks: u64,
    pub key_region_off: u64,
    pub value_region_off: u64,
}

impl ArenaHeader {
    fn new(max_key_length: u16, max_keys: u32, value_block_size: u32, value_blocks: u64) -> Self {
        let key_region_off = HEADER_SIZE as u64;
        let key_region_size = (KEY_SLOT_HEADER_SIZE + max_key_length as usize) as u64 * max_keys as u64;
        let value_region_off = key_region_off + key_region_size;
        ArenaHeader {
            magic: HEADER_MAGIC,
            version: HEADER_VERSION,
            flags: 0,
            max_key_length,
            max_keys,
            value_block_size,
            value_blocks,
            key_region_off,
            value_region_off,
        }
    }

    fn write_to(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..8].copy_from_slice(&self.magic);
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.flags.to_le_bytes());
        buf[16..18].copy_from_slice(&self.max_key_length.to_le_bytes());
        buf[18..22].copy_from_slice(&self.max_keys.to_le_bytes());
        buf[22..26].copy_from_slice(&self.value_block_size.to_le_bytes());
        buf[26..34].copy_from_slice(&self.value_blocks.to_le_bytes());
        buf[34..42].copy_from_slice(&self.key_region_off.to_le_bytes());
        buf[42..50].copy_from_slice(&self.value_region_off.to_le_bytes());
    }

    fn read_from(buf: &[u8]) -> Result<Self, EngineError> {
        if buf.len() < HEADER_SIZE {
            return Err(EngineError::Arena("file too small for header".into()));
        }
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&buf[0..8]);
        if magic != HEADER_MAGIC {
            return Err(EngineError::Arena("bad arena magic".into()));
        }
        let version = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        if version != HEADER_VERSION {
            return Err(EngineError::Arena(format!("unsupported version {version}")));
        }
        let flags = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let max_key_length = u16::from_le_bytes(buf[16..18].try_into().unwrap());
        let max_keys = u32::from_le_bytes(buf[18..22].try_into().unwrap());
        let value_block_size = u32::from_le_bytes(buf[22..26].try_into().unwrap());
        let value_blocks = u64::from_le_bytes(buf[26..34].try_into().unwrap());
        let key_region_off = u64::from_le_bytes(buf[34..42].try_into().unwrap());
        let value_region_off = u64::from_le_bytes(buf[42..50].try_into().unwrap());
        Ok(ArenaHeader {
            magic,
            version,
            flags,
            max_key_length,
            max_keys,
            value_block_size,
            value_blocks,
            key_region_off,
            value_region_off,
        })
    }

    pub fn key_region_size(&self) -> u64 {
        (KEY_SLOT_HEADER_SIZE as u64 + self.max_key_length as u64) * self.max_keys as u64
    }

    pub fn value_region_size(&self) -> u64 {
        self.value_block_size as u64 * self.value_blocks
    }

    fn total_size(&self) -> u64 {
        self.value_region_off + self.value_region_size()
    }
}

/// A mapped arena file (or anonymous mapping). Holds the `MmapMut` alive for
/// the lifetime of the handle; `key_base`/`value_base` are byte offsets into
/// it, not raw pointers, so the handle stays `Send`.
pub struct Arena {
    mmap: MmapMut,
    header: ArenaHeader,
    _file: Option<File>,
}

// SAFETY: the mmap is exclusively owned by this handle; callers serialize
// access to the key and value regions via the index/buddy/slab locks.
unsafe impl Send for Arena {}

impl Arena {
    /// Create a new arena file at `path`. Fails if the path already exists,
    /// or if the containing filesystem is not hugetlbfs/tmpfs.
    pub fn create(
        path: &Path,
        max_key_length: u16,
        max_keys: u32,
        value_block_size: u32,
        value_blocks: u64,
    ) -> Result<Self, EngineError> {
        if path.exists() {
            return Err(EngineError::Arena(format!(
                "arena file already exists: {}",
                path.display()
            )));
        }
        if !max_keys.is_power_of_two() || !value_blocks.is_power_of_two() {
            return Err(EngineError::Arena(
                "max_keys and value_blocks must be powers of two".into(),
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        verify_hugepage_fs(&file, path)?;

        let header = ArenaHeader::new(max_key_length, max_keys, value_block_size, value_blocks);
        file.set_len(header.total_size())?;

        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        header.write_to(&mut mmap[0..HEADER_SIZE]);
        let key_start = header.key_region_off as usize;
        let key_end = header.value_region_off as usize;
        mmap[key_start..key_end].fill(0);

        Ok(Arena {
            mmap,
            header,
            _file: Some(file),
        })
    }

    /// Map an existing arena file and validate its header.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let header = ArenaHeader::read_from(&mmap)?;
        if mmap.len() < header.total_size() as usize {
            return Err(EngineError::Arena("file shorter than header declares".into()));
        }
        Ok(Arena {
            mmap,
            header,
            _file: Some(file),
        })
    }

    /// Build an in-memory-only arena (no backing file, no hugepage check).
    /// Used by tests and by deployments that accept losing the cache across
    /// restart.
    pub fn anonymous(
        max_key_length: u16,
        max_keys: u32,
        value_block_size: u32,
        value_blocks: u64,
    ) -> Result<Self, EngineError> {
        if !max_keys.is_power_of_two() || !value_blocks.is_power_of_two() {
            return Err(EngineError::Arena(
                "max_keys and value_blocks must be powers of two".into(),
            ));
        }
        let header = ArenaHeader::new(max_key_length, max_keys, value_block_size, value_blocks);
        let mut mmap = MmapMut::map_anon(header.total_size() as usize)?;
        header.write_to(&mut mmap[0..HEADER_SIZE]);
        Ok(Arena {
            mmap,
            header,
            _file: None,
        })
    }

    pub fn header(&self) -> &ArenaHeader {
        &self.header
    }

    pub fn key_region(&mut self) -> &mut [u8] {
        let start = self.header.key_region_off as usize;
        let end = self.header.value_region_off as usize;
        &mut self.mmap[start..end]
    }

    pub fn value_region(&mut self) -> &mut [u8] {
        let start = self.header.value_region_off as usize;
        &mut self.mmap[start..]
    }

    pub fn flush(&self) -> Result<(), EngineError> {
        self.mmap.flush().map_err(EngineError::Io)
    }
}

fn verify_hugepage_fs(file: &File, path: &Path) -> Result<(), EngineError> {
    let stat = nix::sys::statfs::fstatfs(file)
        .map_err(|e| EngineError::Arena(format!("statfs({}) failed: {e}", path.display())))?;
    let magic = stat.filesystem_type().0;
    if magic != HUGETLBFS_MAGIC && magic != TMPFS_MAGIC {
        return Err(EngineError::Arena(format!(
            "{} is not on hugetlbfs/tmpfs (statfs magic {magic:#x})",
            path.display()
        )));
    }
    Ok(())
}

const _: () = assert!(size_of::<ArenaHeader>() <= HEADER_SIZE * 4);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_header_roundtrip() {
        let arena = Arena::anonymous(128, 16, 4096, 8).unwrap();
        let h = arena.header();
        assert_eq!(h.magic, HEADER_MAGIC);
        assert_eq!(h.max_keys, 16);
        assert_eq!(h.value_blocks, 8);
        assert_eq!(h.value_region_size(), 4096 * 8);
    }

    #[test]
    fn rejects_non_power_of_two_sizes() {
        assert!(Arena::anonymous(128, 15, 4096, 8).is_err());
        assert!(Arena::anonymous(128, 16, 4096, 7).is_err());
    }

    #[test]
    fn create_then_load_preserves_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arena.bin");
        {
            let arena = Arena::create(&path, 64, 4, 4096, 4);
            // non-hugetlbfs/tmpfs tempdir: creation is expected to fail the
            // filesystem probe in this environment.
            assert!(arena.is_err());
        }
    }

    #[test]
    fn refuses_to_overwrite_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arena.bin");
        std::fs::write(&path, b"existing").unwrap();
        let err = Arena::create(&path, 64, 4, 4096, 4).unwrap_err();
        assert!(matches!(err, EngineError::Arena(_)));
    }

    #[test]
    fn key_and_value_region_sizes_match_header() {
        let mut arena = Arena::anonymous(32, 8, 256, 4).unwrap();
        let key_len = arena.key_region().len();
        let val_len = arena.value_region().len();
        assert_eq!(key_len as u64, arena.header().key_region_size());
        assert_eq!(val_len as u64, arena.header().value_region_size());
    }
}
