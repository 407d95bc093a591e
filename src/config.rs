//! Configuration loading.
//!
//! Delivered in this crate as a TOML file parsed with `serde`; a real
//! deployment would wire this to whatever external configuration system the
//! host provides.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

const VOLATILE_COMMIT_RANGE: std::ops::RangeInclusive<u64> = 1..=60;
const PERSISTENT_COMMIT_RANGE: std::ops::RangeInclusive<u64> = 60..=3600;
const DEFAULT_VOLATILE_COMMIT_SECS: u64 = 2;
const DEFAULT_PERSISTENT_COMMIT_SECS: u64 = 600;
const DEFAULT_BATCH_SIZE: usize = 100;

/// The file-type buckets a configured extension can be classified into.
pub const BUCKETS: [&str; 6] = ["app", "archive", "audio", "doc", "pic", "video"];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RawConfig {
    indexing_paths: Vec<PathBuf>,
    blacklist_paths: Vec<String>,
    app_file_suffix: String,
    archive_file_suffix: String,
    audio_file_suffix: String,
    doc_file_suffix: String,
    pic_file_suffix: String,
    video_file_suffix: String,
    commit_volatile_index_timeout: u64,
    commit_persistent_index_timeout: u64,
    batch_size: usize,
    log_level: String,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            indexing_paths: vec![],
            blacklist_paths: vec![],
            app_file_suffix: String::new(),
            archive_file_suffix: "zip;tar;gz;xz;7z;rar;bz2".into(),
            audio_file_suffix: "mp3;flac;wav;ogg;m4a".into(),
            doc_file_suffix: "doc;docx;pdf;txt;md;odt;xls;xlsx;ppt;pptx".into(),
            pic_file_suffix: "jpg;jpeg;png;gif;bmp;svg;webp".into(),
            video_file_suffix: "mp4;mkv;avi;mov;webm".into(),
            commit_volatile_index_timeout: DEFAULT_VOLATILE_COMMIT_SECS,
            commit_persistent_index_timeout: DEFAULT_PERSISTENT_COMMIT_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
            log_level: "info".into(),
        }
    }
}

/// Resolved, validated daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub indexing_paths: Vec<PathBuf>,
    pub blacklist_paths: Vec<String>,
    /// lowercased extension (without dot) -> bucket name.
    pub extension_buckets: HashMap<String, &'static str>,
    pub commit_volatile_index_timeout: Duration,
    pub commit_persistent_index_timeout: Duration,
    pub batch_size: usize,
    pub log_level: String,
}

impl Config {
    /// Loads and validates configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_str(&text)
    }

    /// Parses configuration from a TOML string, clamping the commit windows
    /// into the accepted commit-window ranges.
    pub fn from_str(text: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(text)
            .map_err(|e| Error::ConfigConflict(format!("invalid config: {e}")))?;

        let volatile = clamp_secs(raw.commit_volatile_index_timeout, VOLATILE_COMMIT_RANGE);
        let persistent = clamp_secs(raw.commit_persistent_index_timeout, PERSISTENT_COMMIT_RANGE);

        let mut extension_buckets = HashMap::new();
        for (bucket, suffixes) in [
            ("app", &raw.app_file_suffix),
            ("archive", &raw.archive_file_suffix),
            ("audio", &raw.audio_file_suffix),
            ("doc", &raw.doc_file_suffix),
            ("pic", &raw.pic_file_suffix),
            ("video", &raw.video_file_suffix),
        ] {
            for ext in suffixes.split(';').map(str::trim).filter(|s| !s.is_empty()) {
                extension_buckets.insert(ext.to_ascii_lowercase(), BUCKETS.iter().find(|b| **b == bucket).copied().unwrap());
            }
        }

        Ok(Self {
            indexing_paths: raw.indexing_paths,
            blacklist_paths: raw.blacklist_paths,
            extension_buckets,
            commit_volatile_index_timeout: Duration::from_secs(volatile),
            commit_persistent_index_timeout: Duration::from_secs(persistent),
            batch_size: raw.batch_size.max(1),
            log_level: raw.log_level,
        })
    }

    /// Classifies an extension into one of the configured buckets, or `None`
    /// for `other`.
    pub fn bucket_for_extension(&self, ext: &str) -> Option<&'static str> {
        self.extension_buckets.get(&ext.to_ascii_lowercase()).copied()
    }
}

fn clamp_secs(value: u64, range: std::ops::RangeInclusive<u64>) -> u64 {
    value.clamp(*range.start(), *range.end())
}

/// Worker-pool size: `max(cpu_count - 3, 1)`, overridable by
/// `ANYTHING_INDEXD_WORKERS`.
pub fn worker_pool_size() -> usize {
    if let Ok(v) = std::env::var("ANYTHING_INDEXD_WORKERS") {
        if let Ok(n) = v.parse::<usize>() {
            if n > 0 {
                return n;
            }
        }
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .saturating_sub(3)
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_windows_are_clamped() {
        let cfg = Config::from_str(
            r#"
            commit_volatile_index_timeout = 9999
            commit_persistent_index_timeout = 1
            "#,
        )
        .unwrap();
        assert_eq!(cfg.commit_volatile_index_timeout, Duration::from_secs(60));
        assert_eq!(cfg.commit_persistent_index_timeout, Duration::from_secs(60));
    }

    #[test]
    fn default_bucket_suffixes_populate_map() {
        let cfg = Config::from_str("").unwrap();
        assert_eq!(cfg.bucket_for_extension("MP3"), Some("audio"));
        assert_eq!(cfg.bucket_for_extension("pdf"), Some("doc"));
        assert_eq!(cfg.bucket_for_extension("xyz"), None);
    }

    #[test]
    fn worker_pool_size_is_at_least_one() {
        std::env::remove_var("ANYTHING_INDEXD_WORKERS");
        assert!(worker_pool_size() >= 1);
    }
}
