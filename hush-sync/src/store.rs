//! RocksDB-backed device store.
//!
//! Column families:
//! - `interactions`: `InteractionRecord` per (content, identity), bincode
//! - `bookmarks`:    `BookmarkSnapshot` per (content, identity), bincode
//! - `event_log`:    one key, the recent-events snapshot (bincode + LZ4)
//!
//! Keys of the first two are `InteractionKey::encode()`: identity first,
//! length-prefixed, so one identity's data is a single prefix range.

use hush_core::{BookmarkSnapshot, Identity, InteractionKey, InteractionRecord, LiveEvent};
use rocksdb::{
    ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, Direction, IteratorMode,
    Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

const CF_INTERACTIONS: &str = "interactions";
const CF_BOOKMARKS: &str = "bookmarks";
const CF_EVENT_LOG: &str = "event_log";

const COLUMN_FAMILIES: &[&str] = &[CF_INTERACTIONS, CF_BOOKMARKS, CF_EVENT_LOG];

const EVENT_LOG_KEY: &[u8] = b"recent";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("hush_data"),
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 8 * 1024 * 1024, // 8MB
        }
    }
}

impl StoreConfig {
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("column family '{0}' not found")]
    MissingColumnFamily(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable interaction and event-log storage on the local device.
pub struct LocalStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl LocalStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened device store at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        match name {
            // Already LZ4-compressed by us.
            CF_EVENT_LOG => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts
    }

    // ─── Interaction records ──────────────────────────────────────────

    pub fn put_record(
        &self,
        key: &InteractionKey,
        record: &InteractionRecord,
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_INTERACTIONS)?;
        self.db
            .put_cf_opt(&cf, key.encode(), encode(record)?, &self.write_opts())?;
        Ok(())
    }

    pub fn delete_record(&self, key: &InteractionKey) -> Result<(), StoreError> {
        let cf = self.cf(CF_INTERACTIONS)?;
        self.db.delete_cf_opt(&cf, key.encode(), &self.write_opts())?;
        Ok(())
    }

    /// Every stored record, all identities.
    pub fn load_records(&self) -> Result<Vec<(InteractionKey, InteractionRecord)>, StoreError> {
        self.load_all(CF_INTERACTIONS)
    }

    // ─── Bookmarks ────────────────────────────────────────────────────

    pub fn put_bookmark(
        &self,
        key: &InteractionKey,
        snapshot: &BookmarkSnapshot,
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_BOOKMARKS)?;
        self.db
            .put_cf_opt(&cf, key.encode(), encode(snapshot)?, &self.write_opts())?;
        Ok(())
    }

    pub fn delete_bookmark(&self, key: &InteractionKey) -> Result<(), StoreError> {
        let cf = self.cf(CF_BOOKMARKS)?;
        self.db.delete_cf_opt(&cf, key.encode(), &self.write_opts())?;
        Ok(())
    }

    pub fn load_bookmarks(&self) -> Result<Vec<(InteractionKey, BookmarkSnapshot)>, StoreError> {
        self.load_all(CF_BOOKMARKS)
    }

    /// Erase every record and bookmark of `identity` in one batch.
    /// Returns the number of keys removed.
    pub fn forget_identity(&self, identity: &Identity) -> Result<usize, StoreError> {
        let prefix = InteractionKey::identity_prefix(identity);
        let mut batch = WriteBatch::default();
        let mut removed = 0;

        for name in [CF_INTERACTIONS, CF_BOOKMARKS] {
            let cf = self.cf(name)?;
            let iter = self
                .db
                .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
            for item in iter {
                let (key, _) = item?;
                if !key.starts_with(&prefix) {
                    break;
                }
                batch.delete_cf(&cf, &key);
                removed += 1;
            }
        }

        if removed > 0 {
            self.db.write_opt(batch, &self.write_opts())?;
        }
        Ok(removed)
    }

    // ─── Event log ────────────────────────────────────────────────────

    /// Replace the stored recent-events snapshot.
    pub fn save_event_log(&self, events: &[LiveEvent]) -> Result<(), StoreError> {
        let cf = self.cf(CF_EVENT_LOG)?;
        let compressed = lz4_flex::compress_prepend_size(&encode(&events)?);
        self.db
            .put_cf_opt(&cf, EVENT_LOG_KEY, compressed, &self.write_opts())?;
        Ok(())
    }

    /// The stored snapshot, oldest first. Empty if none was saved.
    pub fn load_event_log(&self) -> Result<Vec<LiveEvent>, StoreError> {
        let cf = self.cf(CF_EVENT_LOG)?;
        match self.db.get_cf(&cf, EVENT_LOG_KEY)? {
            Some(compressed) => {
                let raw = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                decode(&raw)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Force memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        for name in COLUMN_FAMILIES {
            let cf = self.cf(name)?;
            self.db.flush_cf(&cf)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn load_all<T: DeserializeOwned>(
        &self,
        name: &str,
    ) -> Result<Vec<(InteractionKey, T)>, StoreError> {
        let cf = self.cf(name)?;
        let mut out = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item?;
            match InteractionKey::decode(&key) {
                Some(k) => out.push((k, decode(&value)?)),
                None => log::warn!("Skipping malformed key in '{name}'"),
            }
        }
        Ok(out)
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::MissingColumnFamily(name.to_string()))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}
