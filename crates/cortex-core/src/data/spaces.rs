use super::{decode_row, encode_row, row_key, table_prefix};
use crate::storage::kv::KvStore;
use cortex_common::error::require_id;
use cortex_common::{now_ms, CortexError, MemorySpace, Result, SpaceStatus, SpaceType};

const TABLE: &str = "space";

#[derive(Clone)]
pub struct SpaceStore {
    kv: KvStore,
}

impl SpaceStore {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    pub fn register(
        &self,
        tenant_id: &str,
        id: &str,
        space_type: SpaceType,
    ) -> Result<MemorySpace> {
        require_id(id, "memorySpaceId")?;
        let key = row_key(TABLE, tenant_id, id);
        if self.kv.get(key.as_bytes())?.is_some() {
            return Err(CortexError::conflict(format!(
                "memory space {id} already registered"
            )));
        }
        let space = MemorySpace::new(id.to_string(), space_type, tenant_id.to_string());
        self.kv.put(key.as_bytes(), &encode_row(&space)?)?;
        Ok(space)
    }

    pub fn get(&self, tenant_id: &str, id: &str) -> Result<Option<MemorySpace>> {
        require_id(id, "memorySpaceId")?;
        let key = row_key(TABLE, tenant_id, id);
        match self.kv.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(decode_row(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list(&self, tenant_id: &str) -> Result<Vec<MemorySpace>> {
        let prefix = table_prefix(TABLE, tenant_id);
        let mut spaces = Vec::new();
        for (_, bytes) in self.kv.scan(prefix.as_bytes())? {
            spaces.push(decode_row(&bytes)?);
        }
        Ok(spaces)
    }

    pub fn archive(&self, tenant_id: &str, id: &str) -> Result<MemorySpace> {
        self.set_status(tenant_id, id, SpaceStatus::Archived)
    }

    pub fn reactivate(&self, tenant_id: &str, id: &str) -> Result<MemorySpace> {
        self.set_status(tenant_id, id, SpaceStatus::Active)
    }

    fn set_status(&self, tenant_id: &str, id: &str, status: SpaceStatus) -> Result<MemorySpace> {
        let mut space = self
            .get(tenant_id, id)?
            .ok_or_else(|| CortexError::not_found(format!("memory space {id}")))?;
        space.status = status;
        space.updated_at = now_ms();
        let key = row_key(TABLE, tenant_id, id);
        self.kv.put(key.as_bytes(), &encode_row(&space)?)?;
        Ok(space)
    }

    pub fn delete(&self, tenant_id: &str, id: &str) -> Result<()> {
        require_id(id, "memorySpaceId")?;
        let key = row_key(TABLE, tenant_id, id);
        self.kv.delete(key.as_bytes())
    }

    /// Archived spaces preserve contents but reject new writes. Unregistered
    /// ids are writable: callers are not forced to register a space before
    /// first use.
    pub fn ensure_writable(&self, tenant_id: &str, id: &str) -> Result<()> {
        if let Some(space) = self.get(tenant_id, id)? {
            if space.status == SpaceStatus::Archived {
                return Err(CortexError::validation(format!(
                    "memory space {id} is archived"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, SpaceStore) {
        let dir = tempdir().expect("tempdir");
        let kv = KvStore::open(dir.path()).expect("kv");
        (dir, SpaceStore::new(kv))
    }

    #[test]
    fn test_register_archive_reactivate() -> anyhow::Result<()> {
        let (_dir, store) = store();
        store.register("t1", "s1", SpaceType::Personal)?;
        assert!(store.ensure_writable("t1", "s1").is_ok());

        store.archive("t1", "s1")?;
        assert!(matches!(
            store.ensure_writable("t1", "s1"),
            Err(CortexError::Validation(_))
        ));

        store.reactivate("t1", "s1")?;
        assert!(store.ensure_writable("t1", "s1").is_ok());
        Ok(())
    }

    #[test]
    fn test_double_register_conflicts() {
        let (_dir, store) = store();
        store.register("t1", "s1", SpaceType::Team).expect("first");
        assert!(matches!(
            store.register("t1", "s1", SpaceType::Team),
            Err(CortexError::Conflict(_))
        ));
    }

    #[test]
    fn test_tenants_do_not_leak() -> anyhow::Result<()> {
        let (_dir, store) = store();
        store.register("t1", "s1", SpaceType::Project)?;
        assert!(store.get("t2", "s1")?.is_none());
        assert!(store.list("t2")?.is_empty());
        Ok(())
    }
}
