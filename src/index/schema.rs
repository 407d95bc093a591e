//! Tantivy schema for indexed paths.

use tantivy::schema::{
    Field, IndexRecordOption, Schema, SchemaBuilder, TextFieldIndexing, TextOptions, FAST, STORED, STRING,
};

use crate::tokenizer::TOKENIZER_NAME;

/// Handles into the built schema, resolved once at index-open time.
#[derive(Debug, Clone, Copy)]
pub struct Fields {
    pub full_path: Field,
    pub file_name: Field,
    pub pinyin: Field,
    /// `file_type` in the data model: `dir`, a configured bucket, or `other`.
    pub bucket: Field,
    pub file_ext: Field,
    pub mtime: Field,
    pub modify_time_str: Field,
    pub file_size: Field,
    pub file_size_str: Field,
    pub is_dir: Field,
    pub is_hidden: Field,
}

pub fn build() -> (Schema, Fields) {
    let mut builder = SchemaBuilder::new();

    let path_indexing = TextFieldIndexing::default()
        .set_tokenizer(TOKENIZER_NAME)
        .set_index_option(IndexRecordOption::WithFreqsAndPositions);
    let tokenized_stored = TextOptions::default().set_indexing_options(path_indexing.clone()).set_stored();
    let tokenized = TextOptions::default().set_indexing_options(path_indexing);

    let full_path = builder.add_text_field("full_path", STRING | STORED);
    let file_name = builder.add_text_field("file_name", tokenized_stored);
    let pinyin = builder.add_text_field("pinyin", tokenized);
    let bucket = builder.add_text_field("bucket", STRING | STORED);
    let file_ext = builder.add_text_field("file_ext", STRING | STORED);
    let mtime = builder.add_i64_field("mtime", FAST | STORED);
    let modify_time_str = builder.add_text_field("modify_time_str", STRING | STORED);
    let file_size = builder.add_u64_field("file_size", FAST | STORED);
    let file_size_str = builder.add_text_field("file_size_str", STRING | STORED);
    let is_dir = builder.add_u64_field("is_dir", FAST | STORED);
    let is_hidden = builder.add_text_field("is_hidden", STRING | STORED);

    let schema = builder.build();
    (schema, Fields { full_path, file_name, pinyin, bucket, file_ext, mtime, modify_time_str, file_size, file_size_str, is_dir, is_hidden })
}
