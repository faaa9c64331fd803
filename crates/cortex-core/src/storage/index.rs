use cortex_common::{CortexError, Result};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tantivy::schema::{Schema, INDEXED, STORED, STRING, TEXT};
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};

/// What a document in the text index describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocKind {
    Memory,
    Fact,
}

impl DocKind {
    fn as_str(&self) -> &'static str {
        match self {
            DocKind::Memory => "memory",
            DocKind::Fact => "fact",
        }
    }
}

/// Keyword index over vector-memory content and fact statements/aliases.
/// Writes commit synchronously; per-turn volumes are small and recall needs
/// read-your-writes.
#[derive(Clone)]
pub struct TextIndex {
    index: Index,
    writer: Arc<Mutex<IndexWriter>>,
    reader: IndexReader,
}

impl TextIndex {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let index_path = path.as_ref();
        std::fs::create_dir_all(index_path).map_err(CortexError::transport)?;

        let mut schema_builder = Schema::builder();
        schema_builder.add_text_field("id", STRING | STORED);
        schema_builder.add_text_field("tenant_id", STRING);
        schema_builder.add_text_field("memory_space_id", STRING);
        schema_builder.add_text_field("doc_kind", STRING | STORED);
        schema_builder.add_text_field("user_id", STRING);
        schema_builder.add_text_field("content", TEXT);
        schema_builder.add_text_field("aliases", TEXT);
        schema_builder.add_u64_field("active", INDEXED);
        let schema = schema_builder.build();

        let dir = tantivy::directory::MmapDirectory::open(index_path)
            .map_err(CortexError::transport)?;
        let index = match Index::open_or_create(dir, schema.clone()) {
            Ok(idx) => idx,
            Err(e) => {
                // Schema incompatible - recreate index
                tracing::warn!("Tantivy schema incompatible, recreating index: {}", e);
                std::fs::remove_dir_all(index_path).map_err(CortexError::transport)?;
                std::fs::create_dir_all(index_path).map_err(CortexError::transport)?;
                let dir = tantivy::directory::MmapDirectory::open(index_path)
                    .map_err(CortexError::transport)?;
                Index::open_or_create(dir, schema).map_err(CortexError::transport)?
            }
        };

        let writer = index.writer(50_000_000).map_err(CortexError::transport)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(CortexError::transport)?;

        Ok(Self {
            index,
            writer: Arc::new(Mutex::new(writer)),
            reader,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn upsert(
        &self,
        kind: DocKind,
        id: &str,
        tenant_id: &str,
        memory_space_id: &str,
        user_id: Option<&str>,
        content: &str,
        aliases: &[String],
        active: bool,
    ) -> Result<()> {
        let schema = self.index.schema();
        let get = |name: &str| schema.get_field(name).expect("schema field");

        let mut doc = TantivyDocument::default();
        doc.add_text(get("id"), id);
        doc.add_text(get("tenant_id"), tenant_id);
        doc.add_text(get("memory_space_id"), memory_space_id);
        doc.add_text(get("doc_kind"), kind.as_str());
        doc.add_text(get("user_id"), user_id.unwrap_or(""));
        doc.add_text(get("content"), content);
        doc.add_text(get("aliases"), &aliases.join(" "));
        doc.add_u64(get("active"), u64::from(active));

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| CortexError::invariant("text index writer lock poisoned"))?;
        writer.delete_term(Term::from_field_text(get("id"), id));
        writer
            .add_document(doc)
            .map_err(CortexError::transport)?;
        writer.commit().map_err(CortexError::transport)?;
        drop(writer);
        self.reader.reload().map_err(CortexError::transport)?;
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let schema = self.index.schema();
        let id_field = schema.get_field("id").expect("schema field");
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| CortexError::invariant("text index writer lock poisoned"))?;
        writer.delete_term(Term::from_field_text(id_field, id));
        writer.commit().map_err(CortexError::transport)?;
        drop(writer);
        self.reader.reload().map_err(CortexError::transport)?;
        Ok(())
    }

    /// Keyword search scoped to one tenant and space. Scores are normalized
    /// to [0, 1] against the best hit so they can stand in for cosine
    /// similarity during recall ranking.
    pub fn search(
        &self,
        kind: DocKind,
        tenant_id: &str,
        memory_space_id: &str,
        query_str: &str,
        limit: usize,
        active_only: bool,
    ) -> Result<Vec<(String, f32)>> {
        use tantivy::collector::TopDocs;
        use tantivy::query::{BooleanQuery, Occur, Query, TermQuery};
        use tantivy::schema::IndexRecordOption;

        let searcher = self.reader.searcher();
        let schema = self.index.schema();
        let get = |name: &str| schema.get_field(name).expect("schema field");

        let parser = tantivy::query::QueryParser::for_index(
            &self.index,
            vec![get("content"), get("aliases")],
        );
        // Lenient parse: recall queries are raw user text and may contain
        // operators tantivy would otherwise reject.
        let (user_query, _errors) = parser.parse_query_lenient(query_str);

        let mut sub_queries: Vec<(Occur, Box<dyn Query>)> = vec![
            (Occur::Must, user_query),
            (
                Occur::Must,
                Box::new(TermQuery::new(
                    Term::from_field_text(get("tenant_id"), tenant_id),
                    IndexRecordOption::Basic,
                )),
            ),
            (
                Occur::Must,
                Box::new(TermQuery::new(
                    Term::from_field_text(get("memory_space_id"), memory_space_id),
                    IndexRecordOption::Basic,
                )),
            ),
            (
                Occur::Must,
                Box::new(TermQuery::new(
                    Term::from_field_text(get("doc_kind"), kind.as_str()),
                    IndexRecordOption::Basic,
                )),
            ),
        ];
        if active_only {
            sub_queries.push((
                Occur::Must,
                Box::new(TermQuery::new(
                    Term::from_field_u64(get("active"), 1),
                    IndexRecordOption::Basic,
                )),
            ));
        }

        let combined = BooleanQuery::new(sub_queries);
        let top_docs = searcher
            .search(&combined, &TopDocs::with_limit(limit))
            .map_err(CortexError::transport)?;

        let max_score = top_docs
            .iter()
            .map(|(s, _)| *s)
            .fold(0.0_f32, f32::max)
            .max(f32::EPSILON);

        let mut results = Vec::new();
        for (score, addr) in top_docs {
            let doc: TantivyDocument = searcher.doc(addr).map_err(CortexError::transport)?;
            if let Some(value) = doc.get_first(get("id")) {
                if let Some(id) = value.as_str() {
                    results.push((id.to_string(), score / max_score));
                }
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_index_and_search() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let index = TextIndex::new(temp_dir.path())?;

        index.upsert(
            DocKind::Memory,
            "m1",
            "t1",
            "s1",
            None,
            "The quick brown fox jumps",
            &[],
            true,
        )?;

        let results = index.search(DocKind::Memory, "t1", "s1", "fox", 10, false)?;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "m1");
        assert!(results[0].1 > 0.99);
        Ok(())
    }

    #[test]
    fn test_search_respects_kind_and_tenant() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let index = TextIndex::new(temp_dir.path())?;

        index.upsert(DocKind::Memory, "m1", "t1", "s1", None, "blue sky", &[], true)?;
        index.upsert(
            DocKind::Fact,
            "f1",
            "t1",
            "s1",
            None,
            "user likes blue",
            &["color".to_string()],
            true,
        )?;

        let facts = index.search(DocKind::Fact, "t1", "s1", "blue", 10, true)?;
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].0, "f1");

        let other_tenant = index.search(DocKind::Fact, "t2", "s1", "blue", 10, true)?;
        assert!(other_tenant.is_empty());
        Ok(())
    }

    #[test]
    fn test_alias_search_and_inactive_filter() -> anyhow::Result<()> {
        let temp_dir = tempdir()?;
        let index = TextIndex::new(temp_dir.path())?;

        index.upsert(
            DocKind::Fact,
            "f1",
            "t1",
            "s1",
            None,
            "user works at Acme",
            &["employer".to_string(), "job".to_string()],
            true,
        )?;
        let hits = index.search(DocKind::Fact, "t1", "s1", "employer", 10, true)?;
        assert_eq!(hits.len(), 1);

        // Re-index as superseded; active-only search no longer returns it.
        index.upsert(
            DocKind::Fact,
            "f1",
            "t1",
            "s1",
            None,
            "user works at Acme",
            &["employer".to_string()],
            false,
        )?;
        let hits = index.search(DocKind::Fact, "t1", "s1", "employer", 10, true)?;
        assert!(hits.is_empty());
        Ok(())
    }
}
