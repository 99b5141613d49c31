//! Block storage: the trait the cache talks to, and a reference
//! implementation with a memory budget, LRU pressure handling, and disk
//! spill.

use crate::level::StorageLevel;
use lru::LruCache;
use parking_lot::Mutex;
use relcache_columnar::{BlockId, ColumnarBlock};
use relcache_core::{CacheError, Result};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Storage primitives consumed by the cache.
///
/// Eviction may complete asynchronously; callers that need confirmation
/// poll `is_materialized` within a bounded window after `evict` returns.
pub trait BlockStore: Send + Sync + fmt::Debug {
    /// Store a block under the given level. Overwrites any previous copy.
    fn put(&self, block: Arc<ColumnarBlock>, level: StorageLevel) -> Result<()>;

    /// Fetch a block from whichever tier holds it. `None` is a clean miss.
    fn get(&self, id: &BlockId) -> Result<Option<Arc<ColumnarBlock>>>;

    /// Drop every copy of the block. With `blocking` the call returns only
    /// once removal is confirmed.
    fn evict(&self, id: &BlockId, blocking: bool) -> Result<()>;

    /// True while any tier still holds the block.
    fn is_materialized(&self, id: &BlockId) -> bool;
}

/// Configuration for [`InMemoryBlockStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Byte budget for the memory tier; exceeding it evicts LRU blocks.
    pub memory_budget: usize,
    /// Directory for spilled and disk-only block files.
    pub spill_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            memory_budget: 64 * 1024 * 1024,
            spill_dir: std::env::temp_dir().join("relcache-blocks"),
        }
    }
}

impl StoreConfig {
    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = bytes;
        self
    }

    pub fn with_spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = dir.into();
        self
    }
}

/// In-memory representation of one resident block.
enum BlockRepr {
    Decoded(Arc<ColumnarBlock>),
    Serialized(Vec<u8>),
}

struct MemoryEntry {
    repr: BlockRepr,
    size: usize,
    level: StorageLevel,
}

struct MemoryTier {
    blocks: LruCache<BlockId, MemoryEntry>,
    used: usize,
}

/// Reference block store: bounded memory tier with LRU pressure eviction,
/// spilling to disk when the block's storage level allows it.
pub struct InMemoryBlockStore {
    config: StoreConfig,
    memory: Mutex<MemoryTier>,
    disk: Mutex<HashMap<BlockId, PathBuf>>,
}

impl InMemoryBlockStore {
    pub fn new(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.spill_dir)?;
        Ok(Self {
            config,
            memory: Mutex::new(MemoryTier {
                blocks: LruCache::unbounded(),
                used: 0,
            }),
            disk: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(StoreConfig::default())
    }

    pub fn memory_used(&self) -> usize {
        self.memory.lock().used
    }

    pub fn resident_blocks(&self) -> usize {
        self.memory.lock().blocks.len()
    }

    fn block_path(&self, id: &BlockId) -> PathBuf {
        self.config.spill_dir.join(format!("{}.block", id))
    }

    fn write_disk(&self, id: &BlockId, bytes: &[u8]) -> Result<()> {
        let path = self.block_path(id);
        fs::write(&path, bytes)?;
        self.disk.lock().insert(*id, path);
        Ok(())
    }

    fn serialize(block: &ColumnarBlock) -> Result<Vec<u8>> {
        bincode::serialize(block).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    fn deserialize(bytes: &[u8]) -> Result<ColumnarBlock> {
        bincode::deserialize(bytes).map_err(|e| CacheError::Serialization(e.to_string()))
    }

    /// Evict LRU memory entries until `incoming` fits in the budget.
    /// Entries whose level allows disk are spilled; the rest are dropped.
    fn make_room(&self, tier: &mut MemoryTier, incoming: usize) -> Result<()> {
        while tier.used + incoming > self.config.memory_budget {
            let (victim_id, victim) = match tier.blocks.pop_lru() {
                Some(entry) => entry,
                None => break,
            };
            tier.used -= victim.size;
            if victim.level.use_disk {
                let bytes = match &victim.repr {
                    BlockRepr::Serialized(bytes) => bytes.clone(),
                    BlockRepr::Decoded(block) => Self::serialize(block)?,
                };
                self.write_disk(&victim_id, &bytes)?;
                debug!("spilled block {} to disk under memory pressure", victim_id);
            } else {
                warn!("dropped memory-only block {} under memory pressure", victim_id);
            }
        }
        Ok(())
    }
}

impl BlockStore for InMemoryBlockStore {
    fn put(&self, block: Arc<ColumnarBlock>, level: StorageLevel) -> Result<()> {
        if !level.is_valid() {
            return Err(CacheError::Storage(format!(
                "invalid storage level {}",
                level
            )));
        }
        let id = block.id;
        if level.use_memory {
            let (repr, size) = if level.serialized {
                let bytes = Self::serialize(&block)?;
                let size = bytes.len();
                (BlockRepr::Serialized(bytes), size)
            } else {
                let size = block.size_in_bytes();
                (BlockRepr::Decoded(block.clone()), size)
            };
            let mut tier = self.memory.lock();
            if let Some(old) = tier.blocks.pop(&id) {
                tier.used -= old.size;
            }
            self.make_room(&mut tier, size)?;
            tier.used += size;
            tier.blocks.put(id, MemoryEntry { repr, size, level });
        } else {
            self.write_disk(&id, &Self::serialize(&block)?)?;
        }
        debug!("stored block {} at {}", id, level);
        Ok(())
    }

    fn get(&self, id: &BlockId) -> Result<Option<Arc<ColumnarBlock>>> {
        {
            let mut tier = self.memory.lock();
            if let Some(entry) = tier.blocks.get(id) {
                return Ok(Some(match &entry.repr {
                    BlockRepr::Decoded(block) => block.clone(),
                    BlockRepr::Serialized(bytes) => Arc::new(Self::deserialize(bytes)?),
                }));
            }
        }
        let path = match self.disk.lock().get(id) {
            Some(path) => path.clone(),
            None => return Ok(None),
        };
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(Arc::new(Self::deserialize(&bytes)?))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn evict(&self, id: &BlockId, _blocking: bool) -> Result<()> {
        {
            let mut tier = self.memory.lock();
            if let Some(entry) = tier.blocks.pop(id) {
                tier.used -= entry.size;
            }
        }
        if let Some(path) = self.disk.lock().remove(id) {
            remove_file_if_present(&path)?;
        }
        debug!("evicted block {}", id);
        Ok(())
    }

    fn is_materialized(&self, id: &BlockId) -> bool {
        if self.memory.lock().blocks.contains(id) {
            return true;
        }
        self.disk.lock().contains_key(id)
    }
}

fn remove_file_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl fmt::Debug for InMemoryBlockStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tier = self.memory.lock();
        f.debug_struct("InMemoryBlockStore")
            .field("memory_budget", &self.config.memory_budget)
            .field("memory_used", &tier.used)
            .field("resident_blocks", &tier.blocks.len())
            .field("disk_blocks", &self.disk.lock().len())
            .finish()
    }
}
