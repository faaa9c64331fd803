use super::{decode_row, encode_row, row_key, table_prefix};
use crate::storage::kv::KvStore;
use cortex_common::error::{require_id, require_limit};
use cortex_common::{
    now_ms, Conversation, ConversationType, CortexError, Message, Participants, Result,
};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const TABLE: &str = "conv";

/// Conversation log store. Appends to the same conversation are serialized
/// through a per-id async mutex so concurrent writers interleave whole
/// messages, never clobber each other, and timestamps stay non-decreasing.
#[derive(Clone)]
pub struct ConversationStore {
    kv: KvStore,
    append_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl ConversationStore {
    pub fn new(kv: KvStore) -> Self {
        Self {
            kv,
            append_locks: Arc::new(DashMap::new()),
        }
    }

    fn lock_for(&self, tenant_id: &str, id: &str) -> Arc<Mutex<()>> {
        let key = format!("{tenant_id}:{id}");
        self.append_locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn create(
        &self,
        tenant_id: &str,
        id: &str,
        memory_space_id: &str,
        conversation_type: ConversationType,
        participants: Participants,
    ) -> Result<Conversation> {
        require_id(id, "conversationId")?;
        require_id(memory_space_id, "memorySpaceId")?;
        if conversation_type == ConversationType::UserAgent
            && (participants.user_id.is_none() || participants.agent_id.is_none())
        {
            return Err(CortexError::validation(
                "user-agent conversations require both userId and agentId participants",
            ));
        }

        let key = row_key(TABLE, tenant_id, id);
        if self.kv.get(key.as_bytes())?.is_some() {
            return Err(CortexError::conflict(format!(
                "conversation {id} already exists"
            )));
        }
        let now = now_ms();
        let conversation = Conversation {
            id: id.to_string(),
            memory_space_id: memory_space_id.to_string(),
            conversation_type,
            participants,
            messages: Vec::new(),
            message_count: 0,
            tenant_id: tenant_id.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.kv.put(key.as_bytes(), &encode_row(&conversation)?)?;
        Ok(conversation)
    }

    pub fn get(&self, tenant_id: &str, id: &str) -> Result<Option<Conversation>> {
        require_id(id, "conversationId")?;
        match self.kv.get(row_key(TABLE, tenant_id, id).as_bytes())? {
            Some(bytes) => Ok(Some(decode_row(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn require(&self, tenant_id: &str, id: &str) -> Result<Conversation> {
        self.get(tenant_id, id)?
            .ok_or_else(|| CortexError::not_found(format!("conversation {id}")))
    }

    /// Append messages under the per-conversation lock. Timestamps are
    /// clamped to the last stored message so the log stays non-decreasing
    /// even when callers race.
    pub async fn add_messages(
        &self,
        tenant_id: &str,
        id: &str,
        mut messages: Vec<Message>,
    ) -> Result<Vec<String>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let lock = self.lock_for(tenant_id, id);
        let _guard = lock.lock().await;

        let mut conversation = self.require(tenant_id, id)?;
        let mut last_ts = conversation
            .messages
            .last()
            .map(|m| m.timestamp)
            .unwrap_or(i64::MIN);

        let mut appended_ids = Vec::with_capacity(messages.len());
        for message in &mut messages {
            if message.timestamp < last_ts {
                message.timestamp = last_ts;
            }
            last_ts = message.timestamp;
            appended_ids.push(message.id.clone());
        }
        conversation.messages.append(&mut messages);
        conversation.message_count = conversation.messages.len();
        conversation.updated_at = now_ms();

        let key = row_key(TABLE, tenant_id, id);
        self.kv.put(key.as_bytes(), &encode_row(&conversation)?)?;
        Ok(appended_ids)
    }

    /// Overwrite a message in place by id (progressive streaming commits a
    /// growing partial agent message under a stable id).
    pub async fn replace_message(
        &self,
        tenant_id: &str,
        id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<()> {
        let lock = self.lock_for(tenant_id, id);
        let _guard = lock.lock().await;

        let mut conversation = self.require(tenant_id, id)?;
        let message = conversation
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| CortexError::not_found(format!("message {message_id}")))?;
        message.content = content.to_string();
        conversation.updated_at = now_ms();

        let key = row_key(TABLE, tenant_id, id);
        self.kv.put(key.as_bytes(), &encode_row(&conversation)?)?;
        Ok(())
    }

    pub async fn remove_message(
        &self,
        tenant_id: &str,
        id: &str,
        message_id: &str,
    ) -> Result<()> {
        let lock = self.lock_for(tenant_id, id);
        let _guard = lock.lock().await;

        let mut conversation = self.require(tenant_id, id)?;
        conversation.messages.retain(|m| m.id != message_id);
        conversation.message_count = conversation.messages.len();
        conversation.updated_at = now_ms();

        let key = row_key(TABLE, tenant_id, id);
        self.kv.put(key.as_bytes(), &encode_row(&conversation)?)?;
        Ok(())
    }

    pub fn delete(&self, tenant_id: &str, id: &str) -> Result<()> {
        require_id(id, "conversationId")?;
        self.kv.delete(row_key(TABLE, tenant_id, id).as_bytes())
    }

    pub fn list(
        &self,
        tenant_id: &str,
        memory_space_id: Option<&str>,
        user_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Conversation>> {
        require_limit(limit)?;
        let prefix = table_prefix(TABLE, tenant_id);
        let mut conversations = Vec::new();
        for (_, bytes) in self.kv.scan(prefix.as_bytes())? {
            let conversation: Conversation = decode_row(&bytes)?;
            if let Some(space) = memory_space_id {
                if conversation.memory_space_id != space {
                    continue;
                }
            }
            if let Some(uid) = user_id {
                if conversation.participants.user_id.as_deref() != Some(uid) {
                    continue;
                }
            }
            conversations.push(conversation);
            if conversations.len() >= limit {
                break;
            }
        }
        Ok(conversations)
    }

    pub fn count(&self, tenant_id: &str, memory_space_id: Option<&str>) -> Result<usize> {
        match memory_space_id {
            None => self.kv.count_prefix(table_prefix(TABLE, tenant_id).as_bytes()),
            Some(space) => {
                let mut count = 0;
                for (_, bytes) in self.kv.scan(table_prefix(TABLE, tenant_id).as_bytes())? {
                    let conversation: Conversation = decode_row(&bytes)?;
                    if conversation.memory_space_id == space {
                        count += 1;
                    }
                }
                Ok(count)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, ConversationStore) {
        let dir = tempdir().expect("tempdir");
        let kv = KvStore::open(dir.path()).expect("kv");
        (dir, ConversationStore::new(kv))
    }

    fn user_agent_participants() -> Participants {
        Participants {
            user_id: Some("u1".into()),
            agent_id: Some("a1".into()),
            participant_ids: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_append_keeps_count_consistent() -> anyhow::Result<()> {
        let (_dir, store) = store();
        store.create(
            "t1",
            "c1",
            "s1",
            ConversationType::UserAgent,
            user_agent_participants(),
        )?;

        store
            .add_messages(
                "t1",
                "c1",
                vec![Message::user("hello"), Message::agent("hi", "a1")],
            )
            .await?;

        let conversation = store.require("t1", "c1")?;
        assert_eq!(conversation.message_count, 2);
        assert_eq!(conversation.messages.len(), 2);
        assert!(conversation.messages[1].timestamp >= conversation.messages[0].timestamp);
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_appends_serialize() -> anyhow::Result<()> {
        let (_dir, store) = store();
        store.create(
            "t1",
            "c1",
            "s1",
            ConversationType::UserAgent,
            user_agent_participants(),
        )?;

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .add_messages("t1", "c1", vec![Message::user(format!("msg {i}"))])
                    .await
            }));
        }
        for handle in handles {
            handle.await??;
        }

        let conversation = store.require("t1", "c1")?;
        assert_eq!(conversation.message_count, 8);
        let mut last = i64::MIN;
        for message in &conversation.messages {
            assert!(message.timestamp >= last);
            last = message.timestamp;
        }
        Ok(())
    }

    #[test]
    fn test_user_agent_requires_both_participants() {
        let (_dir, store) = store();
        let result = store.create(
            "t1",
            "c1",
            "s1",
            ConversationType::UserAgent,
            Participants {
                user_id: Some("u1".into()),
                agent_id: None,
                participant_ids: Vec::new(),
            },
        );
        assert!(matches!(result, Err(CortexError::Validation(_))));
    }

    #[tokio::test]
    async fn test_replace_message_in_place() -> anyhow::Result<()> {
        let (_dir, store) = store();
        store.create(
            "t1",
            "c1",
            "s1",
            ConversationType::UserAgent,
            user_agent_participants(),
        )?;
        let ids = store
            .add_messages("t1", "c1", vec![Message::agent("partial", "a1")])
            .await?;

        store
            .replace_message("t1", "c1", &ids[0], "partial plus more")
            .await?;
        let conversation = store.require("t1", "c1")?;
        assert_eq!(conversation.messages[0].content, "partial plus more");
        assert_eq!(conversation.message_count, 1);
        Ok(())
    }
}
