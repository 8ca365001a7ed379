use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use ember_types::EntityId;

use crate::error::{StoreError, StoreResult};
use crate::record::EntityRecord;
use crate::traits::{StorageAdapter, StoreAction};

/// Extension of record documents.
const RECORD_EXT: &str = "json";

/// Directory-backed storage: one JSON document per entity.
///
/// On-disk layout:
/// ```text
/// <root>/<cache>/<entity-id>.json
/// ```
///
/// Writes go to a temporary file in the cache directory which is then
/// renamed over the target, so a crash never leaves a half-written record.
/// Disk I/O is not cheap, so the backend reports itself as asynchronous and
/// the persistence layer runs its actions on worker threads.
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
    identity: String,
}

impl FileStorage {
    /// Open (or create) a store rooted at `root`.
    pub fn open(root: &Path) -> StoreResult<Self> {
        fs::create_dir_all(root)?;
        let root = root.canonicalize()?;
        let identity = format!("file:{}", root.display());
        debug!(root = %root.display(), "file storage opened");
        Ok(Self { root, identity })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn cache_dir(&self, cache: &str) -> PathBuf {
        self.root.join(cache)
    }

    fn record_path(&self, cache: &str, id: &EntityId) -> PathBuf {
        self.cache_dir(cache).join(format!("{id}.{RECORD_EXT}"))
    }
}

fn read_record(path: &Path) -> StoreResult<EntityRecord> {
    let bytes = fs::read(path)?;
    EntityRecord::from_json_bytes(&bytes).map_err(|e| StoreError::CorruptRecord {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn write_atomically(path: &Path, record: &EntityRecord) -> StoreResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| StoreError::unrecoverable(format!("no parent for {}", path.display())))?;
    fs::create_dir_all(dir)?;
    let bytes = record.to_json_bytes()?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

impl StorageAdapter for FileStorage {
    fn backend_identity(&self) -> &str {
        &self.identity
    }

    fn is_synchronous(&self) -> bool {
        false
    }

    fn get(&self, cache: &str, id: &EntityId) -> StoreResult<EntityRecord> {
        let path = self.record_path(cache, id);
        match read_record(&path) {
            Err(StoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound {
                    cache: cache.to_string(),
                    id: *id,
                })
            }
            other => other,
        }
    }

    fn scan(&self, cache: &str) -> StoreResult<Vec<EntityRecord>> {
        let dir = self.cache_dir(cache);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            match read_record(&path) {
                Ok(record) => records.push(record),
                // Removed between read_dir and read.
                Err(StoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {}
                Err(StoreError::CorruptRecord { path, reason }) => {
                    warn!(path = %path.display(), %reason, "skipping corrupt record");
                }
                Err(e) => return Err(e),
            }
        }
        records.sort_by(|a, b| a.created.cmp(&b.created).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    fn add_action(&self, cache: &str, record: EntityRecord) -> StoreResult<StoreAction> {
        let path = self.record_path(cache, &record.id);
        let cache = cache.to_string();
        Ok(Box::new(move || {
            if path.exists() {
                return Err(StoreError::AlreadyExists {
                    cache,
                    id: record.id,
                });
            }
            write_atomically(&path, &record)
        }))
    }

    fn update_action(&self, cache: &str, record: EntityRecord) -> StoreResult<StoreAction> {
        let path = self.record_path(cache, &record.id);
        let cache = cache.to_string();
        Ok(Box::new(move || {
            match read_record(&path) {
                Ok(stored) if record.version <= stored.version => {
                    return Err(StoreError::VersionConflict {
                        cache,
                        id: record.id,
                        stored: stored.version,
                        attempted: record.version,
                    });
                }
                Ok(_) => {}
                Err(StoreError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            write_atomically(&path, &record)
        }))
    }

    fn remove_action(&self, cache: &str, id: &EntityId) -> StoreResult<StoreAction> {
        let path = self.record_path(cache, id);
        Ok(Box::new(move || match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }))
    }
}
