use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use serde::{de::DeserializeOwned, Serialize};
use anyhow::{Context, Result};

/// Headers, bodies, receipts, code and trusted section roots.
pub const CF_CHAIN: &str = "chain";
/// Serialized trie contents keyed by root.
pub const CF_TRIE: &str = "trie";
/// Server Pool entries keyed by peer id bytes.
pub const CF_SERVERPOOL: &str = "serverpool";

const CF_NAMES: [&str; 4] = ["default", CF_CHAIN, CF_TRIE, CF_SERVERPOOL];

// Values are bincode; keys are raw bytes chosen by the caller.
pub struct Store {
    db: DB,
    path: String,
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        let mut cf_opts = Options::default();
        cf_opts.set_write_buffer_size(16 * 1024 * 1024);
        cf_opts.set_max_write_buffer_number(2);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = CF_NAMES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, cf_opts.clone()))
            .collect();

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(256);
        db_opts.set_keep_log_file_num(4);

        std::fs::create_dir_all(path).with_context(|| format!("Failed to create database directory '{path}'"))?;
        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)
            .with_context(|| format!("Failed to open database at '{path}'"))?;

        let store = Store { db, path: path.to_string() };
        store.health_check().context("Database health check failed during initialization")?;
        tracing::debug!(path, "database opened");
        Ok(store)
    }

    /// Round-trip a scratch key through the database.
    pub fn health_check(&self) -> Result<()> {
        let test_key = b"health_check";
        self.db.put(test_key, b"ok").context("Database write test failed")?;
        let value = self.db.get(test_key).context("Database read test failed")?;
        if value.as_deref() != Some(b"ok") {
            anyhow::bail!("Database read/write consistency check failed");
        }
        self.db.delete(test_key).context("Database delete test failed")?;
        Ok(())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn handle(&self, cf: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db.cf_handle(cf).ok_or_else(|| anyhow::anyhow!("Column family '{}' not found", cf))
    }

    pub fn put<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let data = bincode::serialize(value)
            .with_context(|| format!("Failed to serialize value for key '{}' in CF '{cf}'", hex::encode(key)))?;
        self.db
            .put_cf_opt(self.handle(cf)?, key, &data, &WriteOptions::default())
            .with_context(|| format!("Failed to PUT key '{}' in CF '{cf}'", hex::encode(key)))
    }

    pub fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        match self.db.get_cf(self.handle(cf)?, key)? {
            Some(value) => bincode::deserialize(&value)
                .map(Some)
                .with_context(|| format!("Failed to deserialize value for key '{}' in CF '{cf}'", hex::encode(key))),
            None => Ok(None),
        }
    }

    pub fn delete(&self, cf: &str, key: &[u8]) -> Result<()> {
        self.db.delete_cf(self.handle(cf)?, key).with_context(|| format!("Failed to DELETE in CF '{cf}'"))
    }

    /// Every row of a column family; rows that fail to decode are skipped.
    pub fn iterate<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<(Vec<u8>, T)>> {
        let mut rows = Vec::new();
        for item in self.db.iterator_cf(self.handle(cf)?, IteratorMode::Start) {
            let (key, value) = item?;
            match bincode::deserialize::<T>(&value) {
                Ok(v) => rows.push((key.to_vec(), v)),
                Err(e) => tracing::warn!(cf, key = %hex::encode(&key), error = %e, "skipping undecodable row"),
            }
        }
        Ok(rows)
    }

    pub fn keys(&self, cf: &str) -> Result<Vec<Vec<u8>>> {
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(self.handle(cf)?, IteratorMode::Start) {
            let (key, _) = item?;
            keys.push(key.to_vec());
        }
        Ok(keys)
    }

    /// Stage a bincode value into `batch`.
    pub fn batch_put<T: Serialize>(&self, batch: &mut WriteBatch, cf: &str, key: &[u8], value: &T) -> Result<()> {
        let data = bincode::serialize(value)?;
        batch.put_cf(self.handle(cf)?, key, data);
        Ok(())
    }

    pub fn batch_delete(&self, batch: &mut WriteBatch, cf: &str, key: &[u8]) -> Result<()> {
        batch.delete_cf(self.handle(cf)?, key);
        Ok(())
    }

    /// Atomically applies a set of writes.
    pub fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db.write_opt(batch, &write_opts).context("Failed to write batch to database")
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush().context("Failed to flush database")?;
        if let Err(e) = self.db.flush_wal(true) {
            tracing::warn!(error = %e, "🔥 WAL flush failed");
        }
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.db.cancel_all_background_work(true);
        Ok(())
    }
}
