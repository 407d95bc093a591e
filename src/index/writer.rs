//! Single-writer discipline over a tantivy index.

use std::path::Path;
use std::sync::Mutex;

use tantivy::{doc, Index, IndexWriter, TantivyDocument, Term};

use crate::error::Result;
use crate::index::schema::Fields;
use crate::timefmt;

const WRITER_HEAP_BYTES: usize = 50 * 1024 * 1024;

pub struct DocFields {
    pub full_path: String,
    pub file_name: String,
    pub pinyin: String,
    pub bucket: String,
    pub file_ext: String,
    pub mtime: i64,
    pub modify_time_str: String,
    pub file_size: u64,
    pub file_size_str: String,
    pub is_dir: bool,
    pub is_hidden: String,
}

/// Wraps the one `tantivy::IndexWriter` an index is allowed, behind a mutex
/// so concurrent callers serialize rather than racing tantivy's own
/// single-writer invariant.
pub struct IndexWriterHandle {
    writer: Mutex<IndexWriter>,
    fields: Fields,
}

impl IndexWriterHandle {
    pub fn open(index: &Index, fields: Fields) -> Result<Self> {
        let writer = index.writer(WRITER_HEAP_BYTES)?;
        Ok(Self { writer: Mutex::new(writer), fields })
    }

    fn full_path_term(&self, path: &str) -> Term {
        Term::from_field_text(self.fields.full_path, path)
    }

    pub fn delete_path(&self, path: &str) -> Result<()> {
        let writer = self.writer.lock().expect("writer mutex poisoned");
        writer.delete_term(self.full_path_term(path));
        Ok(())
    }

    pub fn upsert(&self, fields: DocFields) -> Result<()> {
        let writer = self.writer.lock().expect("writer mutex poisoned");
        writer.delete_term(self.full_path_term(&fields.full_path));
        let document: TantivyDocument = doc!(
            self.fields.full_path => fields.full_path,
            self.fields.file_name => fields.file_name,
            self.fields.pinyin => fields.pinyin,
            self.fields.bucket => fields.bucket,
            self.fields.file_ext => fields.file_ext,
            self.fields.mtime => fields.mtime,
            self.fields.modify_time_str => fields.modify_time_str,
            self.fields.file_size => fields.file_size,
            self.fields.file_size_str => fields.file_size_str,
            self.fields.is_dir => fields.is_dir as u64,
            self.fields.is_hidden => fields.is_hidden,
        );
        writer.add_document(document)?;
        Ok(())
    }

    /// Rewrites every document whose `full_path` starts with `old_prefix` to
    /// start with `new_prefix` instead (directory-rename descendant
    /// fix-up). `rows` is the caller-supplied snapshot of
    /// matching documents, fetched from a reader before this call.
    pub fn rewrite_prefix(&self, old_prefix: &str, new_prefix: &str, rows: Vec<DocFields>) -> Result<()> {
        let writer = self.writer.lock().expect("writer mutex poisoned");
        for mut row in rows {
            writer.delete_term(Term::from_field_text(self.fields.full_path, &row.full_path));
            if let Some(rest) = row.full_path.strip_prefix(old_prefix) {
                row.full_path = format!("{new_prefix}{rest}");
            }
            let document: TantivyDocument = doc!(
                self.fields.full_path => row.full_path,
                self.fields.file_name => row.file_name,
                self.fields.pinyin => row.pinyin,
                self.fields.bucket => row.bucket,
                self.fields.file_ext => row.file_ext,
                self.fields.mtime => row.mtime,
                self.fields.modify_time_str => row.modify_time_str,
                self.fields.file_size => row.file_size,
                self.fields.file_size_str => row.file_size_str,
                self.fields.is_dir => row.is_dir as u64,
                self.fields.is_hidden => row.is_hidden,
            );
            writer.add_document(document)?;
        }
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        let mut writer = self.writer.lock().expect("writer mutex poisoned");
        writer.commit()?;
        Ok(())
    }
}

/// Builds an on-disk [`DocFields`] for `path`, classifying its extension and
/// expanding pinyin.
pub fn doc_fields_for(path: &Path, config: &crate::config::Config) -> Option<DocFields> {
    let metadata = std::fs::symlink_metadata(path).ok()?;
    let file_name = path.file_name()?.to_string_lossy().into_owned();
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let is_dir = metadata.is_dir();
    let bucket = if is_dir { "dir".to_string() } else { config.bucket_for_extension(ext).unwrap_or("other").to_string() };
    let mtime = filetime::FileTime::from_last_modification_time(&metadata).unix_seconds();
    let file_size = metadata.len();
    let is_hidden = path.components().any(|c| c.as_os_str().to_string_lossy().starts_with('.'));

    Some(DocFields {
        full_path: path.to_string_lossy().into_owned(),
        file_name: file_name.clone(),
        pinyin: crate::pinyin::index_terms(&file_name),
        bucket,
        file_ext: ext.to_ascii_lowercase(),
        mtime,
        modify_time_str: timefmt::format_unix_time(mtime),
        file_size,
        file_size_str: timefmt::format_size(file_size),
        is_dir,
        is_hidden: if is_hidden { "Y".to_string() } else { "N".to_string() },
    })
}
