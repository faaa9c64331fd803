use super::{decode_row, encode_row, row_key, table_prefix};
use crate::storage::index::{DocKind, TextIndex};
use crate::storage::kv::KvStore;
use cortex_common::error::{require_id, require_limit};
use cortex_common::{normalize_predicate, now_ms, CortexError, Fact, Result};

const TABLE: &str = "fact";

/// Fact store. Rows are authoritative in KV; statements and aliases are
/// mirrored into the keyword index for `facts.search` and recall.
#[derive(Clone)]
pub struct FactStore {
    kv: KvStore,
    index: TextIndex,
}

#[derive(Debug, Clone)]
pub struct FactHit {
    pub fact: Fact,
    pub score: f32,
}

impl FactStore {
    pub fn new(kv: KvStore, index: TextIndex) -> Self {
        Self { kv, index }
    }

    async fn reindex(&self, fact: &Fact) -> Result<()> {
        let index = self.index.clone();
        let f = fact.clone();
        tokio::task::spawn_blocking(move || {
            let mut searchable = f.search_aliases.clone();
            searchable.push(f.subject.clone());
            if let Some(obj) = f.kind.object() {
                searchable.push(obj.to_string());
            }
            index.upsert(
                DocKind::Fact,
                &f.id,
                &f.tenant_id,
                &f.memory_space_id,
                f.user_id.as_deref(),
                &f.statement,
                &searchable,
                f.is_active(),
            )
        })
        .await
        .map_err(CortexError::transport)??;
        Ok(())
    }

    pub async fn store(&self, fact: &Fact) -> Result<()> {
        require_id(&fact.id, "factId")?;
        require_id(&fact.memory_space_id, "memorySpaceId")?;
        require_id(&fact.subject, "subject")?;

        let key = row_key(TABLE, &fact.tenant_id, &fact.id);
        self.kv.put(key.as_bytes(), &encode_row(fact)?)?;
        self.reindex(fact).await
    }

    pub fn get(&self, tenant_id: &str, id: &str) -> Result<Option<Fact>> {
        require_id(id, "factId")?;
        match self.kv.get(row_key(TABLE, tenant_id, id).as_bytes())? {
            Some(bytes) => Ok(Some(decode_row(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn require(&self, tenant_id: &str, id: &str) -> Result<Fact> {
        self.get(tenant_id, id)?
            .ok_or_else(|| CortexError::not_found(format!("fact {id}")))
    }

    /// In-place update. Identity and `valid_from` are preserved; the stored
    /// `updated_at` guards against lost updates.
    pub async fn update(&self, fact: &Fact, expected_updated_at: i64) -> Result<Fact> {
        let current = self.require(&fact.tenant_id, &fact.id)?;
        if current.updated_at != expected_updated_at {
            return Err(CortexError::conflict(format!(
                "fact {} was modified concurrently",
                fact.id
            )));
        }
        let mut next = fact.clone();
        next.valid_from = current.valid_from;
        next.created_at = current.created_at;
        next.updated_at = now_ms().max(current.updated_at + 1);

        let key = row_key(TABLE, &next.tenant_id, &next.id);
        self.kv.put(key.as_bytes(), &encode_row(&next)?)?;
        self.reindex(&next).await?;
        Ok(next)
    }

    /// Retire `old_id` and store `replacement` in one atomic batch, wiring
    /// the supersession back-reference. Returns `(retired, stored)`; the
    /// stored replacement's `valid_from` is clamped past the retired fact's
    /// so slot history stays strictly ordered.
    pub async fn supersede(&self, old_id: &str, replacement: &Fact) -> Result<(Fact, Fact)> {
        let mut old = self.require(&replacement.tenant_id, old_id)?;
        if !old.is_active() {
            return Err(CortexError::conflict(format!(
                "fact {old_id} is already superseded"
            )));
        }
        let now = now_ms();
        old.valid_until = Some(now);
        old.superseded_by = Some(replacement.id.clone());
        old.updated_at = now;

        let mut stored = replacement.clone();
        if stored.valid_from <= old.valid_from {
            stored.valid_from = old.valid_from + 1;
        }

        let old_key = row_key(TABLE, &old.tenant_id, &old.id);
        let new_key = row_key(TABLE, &stored.tenant_id, &stored.id);
        self.kv.write_batch(
            vec![
                (old_key.into_bytes(), encode_row(&old)?),
                (new_key.into_bytes(), encode_row(&stored)?),
            ],
            Vec::new(),
        )?;
        self.reindex(&old).await?;
        self.reindex(&stored).await?;
        Ok((old, stored))
    }

    /// Diminishing-returns confidence bump for duplicate sightings:
    /// `new = old + (100 - old) * 0.2`.
    pub async fn bump_confidence(&self, tenant_id: &str, id: &str) -> Result<Fact> {
        let mut fact = self.require(tenant_id, id)?;
        let old = f32::from(fact.confidence);
        fact.confidence = (old + (100.0 - old) * 0.2).round().min(100.0) as u8;
        fact.updated_at = now_ms().max(fact.updated_at + 1);
        let key = row_key(TABLE, tenant_id, id);
        self.kv.put(key.as_bytes(), &encode_row(&fact)?)?;
        Ok(fact)
    }

    pub fn list(
        &self,
        tenant_id: &str,
        memory_space_id: &str,
        active_only: bool,
        limit: usize,
    ) -> Result<Vec<Fact>> {
        require_limit(limit)?;
        let prefix = table_prefix(TABLE, tenant_id);
        let mut facts = Vec::new();
        for (_, bytes) in self.kv.scan(prefix.as_bytes())? {
            let fact: Fact = decode_row(&bytes)?;
            if fact.memory_space_id != memory_space_id {
                continue;
            }
            if active_only && !fact.is_active() {
                continue;
            }
            facts.push(fact);
            if facts.len() >= limit {
                break;
            }
        }
        Ok(facts)
    }

    pub fn list_for_user(&self, tenant_id: &str, user_id: &str) -> Result<Vec<Fact>> {
        let prefix = table_prefix(TABLE, tenant_id);
        let mut facts = Vec::new();
        for (_, bytes) in self.kv.scan(prefix.as_bytes())? {
            let fact: Fact = decode_row(&bytes)?;
            if fact.user_id.as_deref() == Some(user_id) {
                facts.push(fact);
            }
        }
        Ok(facts)
    }

    /// Active facts sharing a subject: the candidate set belief revision
    /// considers.
    pub fn active_for_subject(
        &self,
        tenant_id: &str,
        memory_space_id: &str,
        subject: &str,
    ) -> Result<Vec<Fact>> {
        let wanted = subject.trim().to_lowercase();
        let prefix = table_prefix(TABLE, tenant_id);
        let mut facts = Vec::new();
        for (_, bytes) in self.kv.scan(prefix.as_bytes())? {
            let fact: Fact = decode_row(&bytes)?;
            if fact.memory_space_id == memory_space_id
                && fact.is_active()
                && fact.subject.trim().to_lowercase() == wanted
            {
                facts.push(fact);
            }
        }
        Ok(facts)
    }

    /// Keyword search over active facts, scored by statement/alias overlap
    /// blended with stored confidence.
    pub async fn search(
        &self,
        tenant_id: &str,
        memory_space_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<FactHit>> {
        require_limit(limit)?;
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let index = self.index.clone();
        let tenant = tenant_id.to_string();
        let space = memory_space_id.to_string();
        let q = query.to_string();
        let scored = tokio::task::spawn_blocking(move || {
            index.search(DocKind::Fact, &tenant, &space, &q, limit * 2, true)
        })
        .await
        .map_err(CortexError::transport)??;

        let mut hits = Vec::new();
        for (id, score) in scored {
            let Some(fact) = self.get(tenant_id, &id)? else {
                continue;
            };
            if !fact.is_active() {
                continue;
            }
            hits.push(FactHit { fact, score });
            if hits.len() >= limit {
                break;
            }
        }
        Ok(hits)
    }

    /// Every fact ever recorded for a slot, newest-first.
    pub fn history(
        &self,
        tenant_id: &str,
        memory_space_id: &str,
        subject: &str,
        predicate: Option<&str>,
    ) -> Result<Vec<Fact>> {
        let wanted_subject = subject.trim().to_lowercase();
        let wanted_predicate = predicate.map(normalize_predicate);
        let prefix = table_prefix(TABLE, tenant_id);
        let mut facts: Vec<Fact> = Vec::new();
        for (_, bytes) in self.kv.scan(prefix.as_bytes())? {
            let fact: Fact = decode_row(&bytes)?;
            if fact.memory_space_id != memory_space_id {
                continue;
            }
            let (subj, pred) = fact.slot();
            if subj != wanted_subject {
                continue;
            }
            if wanted_predicate.is_some() && pred != wanted_predicate {
                continue;
            }
            facts.push(fact);
        }
        facts.sort_by(|a, b| b.valid_from.cmp(&a.valid_from).then(b.id.cmp(&a.id)));
        Ok(facts)
    }

    /// Walk `superseded_by` links from a fact to its active successor.
    /// Cycles or dangling links violate the supersession invariant.
    pub fn supersession_chain(&self, tenant_id: &str, id: &str) -> Result<Vec<Fact>> {
        let mut chain = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut current = self.require(tenant_id, id)?;
        loop {
            if !seen.insert(current.id.clone()) {
                return Err(CortexError::invariant(format!(
                    "supersession cycle at fact {}",
                    current.id
                )));
            }
            let next_id = current.superseded_by.clone();
            chain.push(current);
            match next_id {
                None => break,
                Some(next_id) => {
                    current = self.get(tenant_id, &next_id)?.ok_or_else(|| {
                        CortexError::invariant(format!(
                            "supersession chain dangles at fact {next_id}"
                        ))
                    })?;
                }
            }
        }
        if let Some(last) = chain.last() {
            if !last.is_active() {
                return Err(CortexError::invariant(format!(
                    "supersession chain from {id} does not end in an active fact"
                )));
            }
        }
        Ok(chain)
    }

    pub async fn delete(&self, tenant_id: &str, id: &str) -> Result<()> {
        require_id(id, "factId")?;
        self.kv.delete(row_key(TABLE, tenant_id, id).as_bytes())?;
        let index = self.index.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || index.delete(&id))
            .await
            .map_err(CortexError::transport)??;
        Ok(())
    }

    pub async fn purge_all(&self, tenant_id: &str, memory_space_id: &str) -> Result<usize> {
        let prefix = table_prefix(TABLE, tenant_id);
        let mut ids = Vec::new();
        for (_, bytes) in self.kv.scan(prefix.as_bytes())? {
            let fact: Fact = decode_row(&bytes)?;
            if fact.memory_space_id == memory_space_id {
                ids.push(fact.id);
            }
        }
        let count = ids.len();
        for id in ids {
            self.delete(tenant_id, &id).await?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_common::{new_id, FactKind};
    use tempfile::tempdir;

    async fn store() -> (tempfile::TempDir, FactStore) {
        let dir = tempdir().expect("tempdir");
        let kv = KvStore::open(dir.path().join("kv")).expect("kv");
        let index = TextIndex::new(dir.path().join("tantivy")).expect("index");
        (dir, FactStore::new(kv, index))
    }

    fn preference(space: &str, subject: &str, predicate: &str, object: &str) -> Fact {
        let now = now_ms();
        Fact {
            id: new_id(),
            memory_space_id: space.into(),
            user_id: Some("u1".into()),
            statement: format!("{subject} {predicate} {object}"),
            kind: FactKind::Preference {
                predicate: predicate.into(),
                object: object.into(),
            },
            subject: subject.into(),
            confidence: 80,
            valid_from: now,
            valid_until: None,
            superseded_by: None,
            category: None,
            search_aliases: vec![predicate.to_string()],
            semantic_context: None,
            entities: Vec::new(),
            relations: Vec::new(),
            extensions: Default::default(),
            tenant_id: cortex_common::DEFAULT_TENANT.into(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_supersession_chain_resolves_to_active() -> anyhow::Result<()> {
        let (_dir, store) = store().await;
        let blue = preference("s1", "user", "favorite color", "blue");
        store.store(&blue).await?;

        let mut purple = preference("s1", "user", "favorite color", "purple");
        purple.valid_from = blue.valid_from + 1;
        store.supersede(&blue.id, &purple).await?;

        let mut green = preference("s1", "user", "favorite color", "green");
        green.valid_from = purple.valid_from + 1;
        store.supersede(&purple.id, &green).await?;

        let chain = store.supersession_chain(&blue.tenant_id, &blue.id)?;
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.last().unwrap().id, green.id);
        assert!(chain.last().unwrap().is_active());

        let active = store.active_for_subject(&blue.tenant_id, "s1", "user")?;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, green.id);

        let history = store.history(&blue.tenant_id, "s1", "user", Some("favorite color"))?;
        assert_eq!(
            history.iter().map(|f| f.id.as_str()).collect::<Vec<_>>(),
            vec![green.id.as_str(), purple.id.as_str(), blue.id.as_str()]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_double_supersede_conflicts() -> anyhow::Result<()> {
        let (_dir, store) = store().await;
        let blue = preference("s1", "user", "favorite color", "blue");
        store.store(&blue).await?;
        let purple = preference("s1", "user", "favorite color", "purple");
        store.supersede(&blue.id, &purple).await?;

        let green = preference("s1", "user", "favorite color", "green");
        assert!(matches!(
            store.supersede(&blue.id, &green).await,
            Err(CortexError::Conflict(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_confidence_bump_diminishes() -> anyhow::Result<()> {
        let (_dir, store) = store().await;
        let fact = preference("s1", "user", "drinks", "tea");
        store.store(&fact).await?;

        let bumped = store.bump_confidence(&fact.tenant_id, &fact.id).await?;
        assert_eq!(bumped.confidence, 84);
        let again = store.bump_confidence(&fact.tenant_id, &fact.id).await?;
        assert_eq!(again.confidence, 87);
        Ok(())
    }

    #[tokio::test]
    async fn test_update_detects_concurrent_writes() -> anyhow::Result<()> {
        let (_dir, store) = store().await;
        let fact = preference("s1", "user", "drinks", "tea");
        store.store(&fact).await?;

        let stored = store.require(&fact.tenant_id, &fact.id)?;
        let mut edited = stored.clone();
        edited.search_aliases.push("beverage".into());
        store.update(&edited, stored.updated_at).await?;

        // Second writer with a stale snapshot loses.
        let mut stale = stored;
        stale.confidence = 10;
        assert!(matches!(
            store.update(&stale, fact.updated_at).await,
            Err(CortexError::Conflict(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_search_prefers_active_facts() -> anyhow::Result<()> {
        let (_dir, store) = store().await;
        let blue = preference("s1", "user", "favorite color", "blue");
        store.store(&blue).await?;
        let purple = preference("s1", "user", "favorite color", "purple");
        store.supersede(&blue.id, &purple).await?;

        let hits = store
            .search(&blue.tenant_id, "s1", "favorite color", 10)
            .await?;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].fact.id, purple.id);
        Ok(())
    }
}
