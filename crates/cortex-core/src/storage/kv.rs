use cortex_common::{CortexError, Result};
use rocksdb::{Options, WriteBatch, DB};
use std::path::Path;
use std::sync::Arc;

/// Row store shared by all logical tables. Each mutation is a single
/// RocksDB write, so a row update either commits entirely or leaves
/// storage unchanged.
#[derive(Clone)]
pub struct KvStore {
    db: Arc<DB>,
}

impl KvStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path).map_err(CortexError::transport)?;
        Ok(Self { db: Arc::new(db) })
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.put(key, value).map_err(CortexError::transport)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db.get(key).map_err(CortexError::transport)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.db.delete(key).map_err(CortexError::transport)
    }

    /// Atomic multi-key write; used where one mutation touches several rows
    /// (e.g. supersession flips two fact rows at once).
    pub fn write_batch(&self, puts: Vec<(Vec<u8>, Vec<u8>)>, deletes: Vec<Vec<u8>>) -> Result<()> {
        let mut batch = WriteBatch::default();
        for (k, v) in puts {
            batch.put(k, v);
        }
        for k in deletes {
            batch.delete(k);
        }
        self.db.write(batch).map_err(CortexError::transport)
    }

    pub fn multi_get(&self, keys: &[&[u8]]) -> Result<Vec<Option<Vec<u8>>>> {
        let results = self.db.multi_get(keys);
        let mut out = Vec::with_capacity(results.len());
        for res in results {
            out.push(res.map_err(CortexError::transport)?);
        }
        Ok(out)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush().map_err(CortexError::transport)
    }

    pub fn scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        // Explicit seek iterator instead of prefix_iterator: prefix_iterator
        // requires a configured SliceTransform prefix extractor; without one
        // its behaviour is undefined and bloom filters are bypassed.
        use rocksdb::{Direction, IteratorMode};
        let iter = self.db.iterator(IteratorMode::From(prefix, Direction::Forward));
        let mut results = Vec::new();
        for item in iter {
            let (k, v) = item.map_err(CortexError::transport)?;
            if !k.starts_with(prefix) {
                break;
            }
            results.push((k.to_vec(), v.to_vec()));
        }
        Ok(results)
    }

    /// Count keys under a prefix without loading values.
    pub fn count_prefix(&self, prefix: &[u8]) -> Result<usize> {
        use rocksdb::{Direction, IteratorMode};
        let iter = self.db.iterator(IteratorMode::From(prefix, Direction::Forward));
        let mut count = 0;
        for item in iter {
            let (k, _) = item.map_err(CortexError::transport)?;
            if !k.starts_with(prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }
}
