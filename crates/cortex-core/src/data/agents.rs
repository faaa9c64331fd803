use super::{decode_row, encode_row, row_key, table_prefix};
use crate::storage::kv::KvStore;
use cortex_common::error::require_id;
use cortex_common::{now_ms, AgentProfile, Result};

const TABLE: &str = "agent";

#[derive(Clone)]
pub struct AgentStore {
    kv: KvStore,
}

impl AgentStore {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    /// Idempotent: registering an existing agent keeps its first row.
    pub fn register(
        &self,
        tenant_id: &str,
        id: &str,
        display_name: Option<String>,
    ) -> Result<AgentProfile> {
        require_id(id, "agentId")?;
        let key = row_key(TABLE, tenant_id, id);
        if let Some(bytes) = self.kv.get(key.as_bytes())? {
            return decode_row(&bytes);
        }
        let agent = AgentProfile {
            id: id.to_string(),
            display_name,
            tenant_id: tenant_id.to_string(),
            created_at: now_ms(),
        };
        self.kv.put(key.as_bytes(), &encode_row(&agent)?)?;
        Ok(agent)
    }

    pub fn get(&self, tenant_id: &str, id: &str) -> Result<Option<AgentProfile>> {
        require_id(id, "agentId")?;
        match self.kv.get(row_key(TABLE, tenant_id, id).as_bytes())? {
            Some(bytes) => Ok(Some(decode_row(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list(&self, tenant_id: &str) -> Result<Vec<AgentProfile>> {
        let prefix = table_prefix(TABLE, tenant_id);
        let mut agents = Vec::new();
        for (_, bytes) in self.kv.scan(prefix.as_bytes())? {
            agents.push(decode_row(&bytes)?);
        }
        Ok(agents)
    }
}
