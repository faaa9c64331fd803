use super::{decode_row, encode_row, table_prefix};
use crate::storage::kv::KvStore;
use cortex_common::error::require_id;
use cortex_common::{
    now_ms, CortexError, ImmutableRecord, MutableRecord, Result, MAX_PREVIOUS_VERSIONS,
};
use serde_json::Value;

const IMMUTABLE_TABLE: &str = "imm";
const MUTABLE_TABLE: &str = "mut";

fn immutable_key(tenant_id: &str, record_type: &str, id: &str) -> String {
    format!("{IMMUTABLE_TABLE}:{tenant_id}:{record_type}:{id}")
}

fn mutable_key(tenant_id: &str, namespace: &str, key: &str) -> String {
    format!("{MUTABLE_TABLE}:{tenant_id}:{namespace}:{key}")
}

/// Versioned append-only records plus last-write-wins mutable KV. User
/// profiles live in the immutable table under `record_type == "user"`.
#[derive(Clone)]
pub struct RecordStore {
    kv: KvStore,
}

impl RecordStore {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    // ── Immutable ───────────────────────────────────────────────

    /// Create version 1, or append version N+1 pushing the prior payload
    /// onto `previous_versions` (bounded to the most recent 10).
    pub fn immutable_store(
        &self,
        tenant_id: &str,
        record_type: &str,
        id: &str,
        data: Value,
        user_id: Option<&str>,
    ) -> Result<ImmutableRecord> {
        require_id(record_type, "recordType")?;
        require_id(id, "recordId")?;
        let key = immutable_key(tenant_id, record_type, id);
        let now = now_ms();

        let record = match self.kv.get(key.as_bytes())? {
            None => ImmutableRecord {
                record_type: record_type.to_string(),
                id: id.to_string(),
                data,
                version: 1,
                previous_versions: Vec::new(),
                user_id: user_id.map(str::to_string),
                tenant_id: tenant_id.to_string(),
                created_at: now,
                updated_at: now,
            },
            Some(bytes) => {
                let mut record: ImmutableRecord = decode_row(&bytes)?;
                record.previous_versions.push(record.data.clone());
                if record.previous_versions.len() > MAX_PREVIOUS_VERSIONS {
                    let overflow = record.previous_versions.len() - MAX_PREVIOUS_VERSIONS;
                    record.previous_versions.drain(0..overflow);
                }
                record.data = data;
                record.version += 1;
                record.updated_at = now;
                if user_id.is_some() {
                    record.user_id = user_id.map(str::to_string);
                }
                record
            }
        };
        self.kv.put(key.as_bytes(), &encode_row(&record)?)?;
        Ok(record)
    }

    pub fn immutable_get(
        &self,
        tenant_id: &str,
        record_type: &str,
        id: &str,
    ) -> Result<Option<ImmutableRecord>> {
        require_id(record_type, "recordType")?;
        require_id(id, "recordId")?;
        match self
            .kv
            .get(immutable_key(tenant_id, record_type, id).as_bytes())?
        {
            Some(bytes) => Ok(Some(decode_row(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Retrieve one historical payload. Versions older than the retained
    /// window are gone and reported as `NotFound`.
    pub fn immutable_get_version(
        &self,
        tenant_id: &str,
        record_type: &str,
        id: &str,
        version: u32,
    ) -> Result<Value> {
        let record = self
            .immutable_get(tenant_id, record_type, id)?
            .ok_or_else(|| CortexError::not_found(format!("{record_type} {id}")))?;
        if version == 0 || version > record.version {
            return Err(CortexError::not_found(format!(
                "{record_type} {id} version {version}"
            )));
        }
        if version == record.version {
            return Ok(record.data);
        }
        let retained = record.previous_versions.len() as u32;
        let oldest_retained = record.version - retained;
        if version < oldest_retained {
            return Err(CortexError::not_found(format!(
                "{record_type} {id} version {version} has been pruned"
            )));
        }
        let idx = (version - oldest_retained) as usize;
        Ok(record.previous_versions[idx].clone())
    }

    pub fn immutable_list(
        &self,
        tenant_id: &str,
        record_type: &str,
    ) -> Result<Vec<ImmutableRecord>> {
        let prefix = format!("{IMMUTABLE_TABLE}:{tenant_id}:{record_type}:");
        let mut records = Vec::new();
        for (_, bytes) in self.kv.scan(prefix.as_bytes())? {
            records.push(decode_row(&bytes)?);
        }
        Ok(records)
    }

    pub fn immutable_list_for_user(
        &self,
        tenant_id: &str,
        user_id: &str,
        exclude_type: Option<&str>,
    ) -> Result<Vec<ImmutableRecord>> {
        let prefix = table_prefix(IMMUTABLE_TABLE, tenant_id);
        let mut records = Vec::new();
        for (_, bytes) in self.kv.scan(prefix.as_bytes())? {
            let record: ImmutableRecord = decode_row(&bytes)?;
            if record.user_id.as_deref() != Some(user_id) {
                continue;
            }
            if exclude_type == Some(record.record_type.as_str()) {
                continue;
            }
            records.push(record);
        }
        Ok(records)
    }

    pub fn immutable_purge(&self, tenant_id: &str, record_type: &str, id: &str) -> Result<()> {
        self.kv
            .delete(immutable_key(tenant_id, record_type, id).as_bytes())
    }

    // ── Mutable ─────────────────────────────────────────────────

    pub fn mutable_set(
        &self,
        tenant_id: &str,
        namespace: &str,
        key: &str,
        value: Value,
        user_id: Option<&str>,
    ) -> Result<MutableRecord> {
        require_id(namespace, "namespace")?;
        require_id(key, "key")?;
        let record = MutableRecord {
            namespace: namespace.to_string(),
            key: key.to_string(),
            value,
            user_id: user_id.map(str::to_string),
            tenant_id: tenant_id.to_string(),
            updated_at: now_ms(),
        };
        let row = mutable_key(tenant_id, namespace, key);
        self.kv.put(row.as_bytes(), &encode_row(&record)?)?;
        Ok(record)
    }

    pub fn mutable_get(
        &self,
        tenant_id: &str,
        namespace: &str,
        key: &str,
    ) -> Result<Option<MutableRecord>> {
        require_id(namespace, "namespace")?;
        require_id(key, "key")?;
        match self.kv.get(mutable_key(tenant_id, namespace, key).as_bytes())? {
            Some(bytes) => Ok(Some(decode_row(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn mutable_delete(&self, tenant_id: &str, namespace: &str, key: &str) -> Result<()> {
        self.kv
            .delete(mutable_key(tenant_id, namespace, key).as_bytes())
    }

    pub fn mutable_purge_namespace(&self, tenant_id: &str, namespace: &str) -> Result<usize> {
        let prefix = format!("{MUTABLE_TABLE}:{tenant_id}:{namespace}:");
        let rows = self.kv.scan(prefix.as_bytes())?;
        let count = rows.len();
        for (key, _) in rows {
            self.kv.delete(&key)?;
        }
        Ok(count)
    }

    pub fn mutable_list_for_user(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<Vec<MutableRecord>> {
        let prefix = table_prefix(MUTABLE_TABLE, tenant_id);
        let mut records = Vec::new();
        for (_, bytes) in self.kv.scan(prefix.as_bytes())? {
            let record: MutableRecord = decode_row(&bytes)?;
            if record.user_id.as_deref() == Some(user_id) {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, RecordStore) {
        let dir = tempdir().expect("tempdir");
        let kv = KvStore::open(dir.path()).expect("kv");
        (dir, RecordStore::new(kv))
    }

    #[test]
    fn test_versions_are_contiguous_from_one() -> anyhow::Result<()> {
        let (_dir, store) = store();
        let v1 = store.immutable_store("t1", "user", "u1", json!({"name": "v1"}), Some("u1"))?;
        assert_eq!(v1.version, 1);
        let v2 = store.immutable_store("t1", "user", "u1", json!({"name": "v2"}), Some("u1"))?;
        assert_eq!(v2.version, 2);
        let v3 = store.immutable_store("t1", "user", "u1", json!({"name": "v3"}), Some("u1"))?;
        assert_eq!(v3.version, 3);

        assert_eq!(
            store.immutable_get_version("t1", "user", "u1", 2)?,
            json!({"name": "v2"})
        );
        assert_eq!(
            store.immutable_get_version("t1", "user", "u1", 3)?,
            json!({"name": "v3"})
        );
        assert!(store.immutable_get_version("t1", "user", "u1", 4).is_err());
        Ok(())
    }

    #[test]
    fn test_previous_versions_bounded() -> anyhow::Result<()> {
        let (_dir, store) = store();
        for i in 0..15 {
            store.immutable_store("t1", "user", "u1", json!({"rev": i}), Some("u1"))?;
        }
        let record = store.immutable_get("t1", "user", "u1")?.unwrap();
        assert_eq!(record.version, 15);
        assert_eq!(record.previous_versions.len(), MAX_PREVIOUS_VERSIONS);
        // Newest retained history is version 14; version 4 is pruned.
        assert_eq!(
            store.immutable_get_version("t1", "user", "u1", 14)?,
            json!({"rev": 13})
        );
        assert!(store.immutable_get_version("t1", "user", "u1", 4).is_err());
        Ok(())
    }

    #[test]
    fn test_mutable_last_write_wins() -> anyhow::Result<()> {
        let (_dir, store) = store();
        store.mutable_set("t1", "prefs", "theme", json!("light"), Some("u1"))?;
        store.mutable_set("t1", "prefs", "theme", json!("dark"), Some("u1"))?;
        let record = store.mutable_get("t1", "prefs", "theme")?.unwrap();
        assert_eq!(record.value, json!("dark"));

        assert_eq!(store.mutable_purge_namespace("t1", "prefs")?, 1);
        assert!(store.mutable_get("t1", "prefs", "theme")?.is_none());
        Ok(())
    }
}
