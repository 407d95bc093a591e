//! NRT and committed readers.
//!
//! Two independent `tantivy::IndexReader`s are kept: one that reloads after
//! every writer commit (used for exact-path existence and prefix
//! traversal, where staleness would corrupt the merge/filter pipeline's
//! view of the index) and one that reloads on a slower, explicit cadence
//! (used for free-text search, where a few seconds of staleness is an
//! acceptable trade for fewer reopen stalls). Reopening either is guarded
//! by one mutex so two reload calls never race tantivy's segment readers.

use std::sync::Mutex;

use tantivy::collector::{DocSetCollector, TopDocs};
use tantivy::query::{AllQuery, Query, QueryParser, RegexQuery, TermQuery};
use tantivy::schema::IndexRecordOption;
use tantivy::{Index, IndexReader, ReloadPolicy, TantivyDocument, Term};

use crate::error::Result;
use crate::index::schema::Fields;
use crate::index::writer::DocFields;

pub struct Readers {
    nrt: IndexReader,
    committed: IndexReader,
    reopen_lock: Mutex<()>,
    fields: Fields,
}

impl Readers {
    pub fn open(index: &Index, fields: Fields) -> Result<Self> {
        let nrt = index.reader_builder().reload_policy(ReloadPolicy::Manual).try_into()?;
        let committed = index.reader_builder().reload_policy(ReloadPolicy::Manual).try_into()?;
        Ok(Self { nrt, committed, reopen_lock: Mutex::new(()), fields })
    }

    /// Forces the NRT reader to pick up the latest commit (called after a
    /// volatile-window commit).
    pub fn reload_nrt(&self) -> Result<()> {
        let _guard = self.reopen_lock.lock().expect("reopen lock poisoned");
        self.nrt.reload()?;
        Ok(())
    }

    /// Forces the committed (search) reader to pick up the latest commit.
    pub fn reload_committed(&self) -> Result<()> {
        let _guard = self.reopen_lock.lock().expect("reopen lock poisoned");
        self.committed.reload()?;
        Ok(())
    }

    pub fn exists(&self, full_path: &str) -> Result<bool> {
        let searcher = self.nrt.searcher();
        let term = Term::from_field_text(self.fields.full_path, full_path);
        let query = TermQuery::new(term, IndexRecordOption::Basic);
        let hits = searcher.search(&query, &TopDocs::with_limit(1))?;
        Ok(!hits.is_empty())
    }

    /// All stored rows whose `full_path` starts with `prefix` (directory
    /// rename fix-up and descendant lookups).
    pub fn rows_with_prefix(&self, prefix: &str) -> Result<Vec<DocFields>> {
        let searcher = self.nrt.searcher();
        let pattern = format!("{}.*", regex::escape(prefix));
        let query = RegexQuery::from_pattern(&pattern, self.fields.full_path)?;
        let addresses = searcher.search(&query, &DocSetCollector)?;
        let mut out = Vec::with_capacity(addresses.len());
        for address in addresses {
            let doc: TantivyDocument = searcher.doc(address)?;
            out.push(row_from_document(&self.fields, &doc));
        }
        Ok(out)
    }

    /// Every stored row in the committed reader, used by the index-refresh
    /// operation to evict stale or newly-blacklisted documents.
    pub fn all_rows(&self) -> Result<Vec<DocFields>> {
        let searcher = self.committed.searcher();
        let addresses = searcher.search(&AllQuery, &DocSetCollector)?;
        let mut out = Vec::with_capacity(addresses.len());
        for address in addresses {
            let doc: TantivyDocument = searcher.doc(address)?;
            out.push(row_from_document(&self.fields, &doc));
        }
        Ok(out)
    }

    /// Free-text search over `file_name` and `pinyin`, scored by
    /// relevance, limited to `limit` hits.
    pub fn search(&self, query_text: &str, limit: usize) -> Result<Vec<(DocFields, f32)>> {
        let searcher = self.committed.searcher();
        let parser = QueryParser::for_index(searcher.index(), vec![self.fields.file_name, self.fields.pinyin]);
        let query: Box<dyn Query> = parser.parse_query(query_text)?;
        let hits = searcher.search(&query, &TopDocs::with_limit(limit))?;
        let mut out = Vec::with_capacity(hits.len());
        for (score, address) in hits {
            let doc: TantivyDocument = searcher.doc(address)?;
            out.push((row_from_document(&self.fields, &doc), score));
        }
        Ok(out)
    }
}

fn row_from_document(fields: &Fields, doc: &TantivyDocument) -> DocFields {
    use tantivy::schema::document::Value;

    let text_of = |field| -> String {
        doc.get_first(field).and_then(|v| v.as_str()).unwrap_or_default().to_string()
    };
    let u64_of = |field| -> u64 { doc.get_first(field).and_then(|v| v.as_u64()).unwrap_or(0) };
    DocFields {
        full_path: text_of(fields.full_path),
        file_name: text_of(fields.file_name),
        pinyin: text_of(fields.pinyin),
        bucket: text_of(fields.bucket),
        file_ext: text_of(fields.file_ext),
        mtime: doc.get_first(fields.mtime).and_then(|v| v.as_i64()).unwrap_or(0),
        modify_time_str: text_of(fields.modify_time_str),
        file_size: u64_of(fields.file_size),
        file_size_str: text_of(fields.file_size_str),
        is_dir: u64_of(fields.is_dir) != 0,
        is_hidden: text_of(fields.is_hidden),
    }
}
