//! Durable per-term output.
//!
//! Every term gets its own artifact, so sinks never share mutable state
//! between terms. Writing a term twice replaces the earlier artifact.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::Result;

/// Final artifact for one term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TermResult {
    /// The API payload for the term.
    Succeeded { payload: Value },
    /// Terminal failure marker.
    Failed { reason: String, attempts: u32 },
}

impl TermResult {
    pub fn is_success(&self) -> bool {
        matches!(self, TermResult::Succeeded { .. })
    }
}

/// Destination for term results.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Persists `result` under `term`, replacing any earlier write.
    async fn write(&self, term: &str, result: &TermResult) -> Result<()>;
}

/// Longest percent-encoded term used verbatim as a file stem.
///
/// Leaves room for the `.json` extension and the temp-file decorations under
/// the usual 255-byte file name limit.
pub const MAX_STEM_LEN: usize = 200;

/// Hex digits of the term hash appended to shortened stems.
const STEM_HASH_LEN: usize = 16;

/// File stem for `term`.
///
/// Verbatim stems are at most [`MAX_STEM_LEN`] bytes; shortened ones are
/// exactly one byte longer, so the two forms can never collide.
fn file_stem(term: &str) -> String {
    let encoded = urlencoding::encode(term);
    if encoded.len() <= MAX_STEM_LEN {
        return encoded.into_owned();
    }

    let digest = format!("{:x}", Sha256::digest(term.as_bytes()));
    // Percent-encoding is pure ASCII, so any byte offset is a char boundary.
    let keep = MAX_STEM_LEN - STEM_HASH_LEN;
    format!("{}-{}", &encoded[..keep], &digest[..STEM_HASH_LEN])
}

/// Writes one pretty-printed JSON file per term into a directory.
///
/// Successful terms contain the raw API payload; failed terms contain a
/// `{"term", "status": "failed", "reason", "attempts"}` marker. File names
/// are the percent-encoded term, so distinct terms never collide and no term
/// can escape the directory. Encodings longer than [`MAX_STEM_LEN`] bytes are
/// cut short and suffixed with a hash of the full term.
#[derive(Debug)]
pub struct FileSink {
    dir: PathBuf,
    next_tmp: AtomicUsize,
}

impl FileSink {
    /// Creates a sink over `dir` without touching the filesystem.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            next_tmp: AtomicUsize::new(0),
        }
    }

    /// Creates a sink, creating `dir` if it does not exist.
    pub async fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let sink = Self::new(dir);
        tokio::fs::create_dir_all(&sink.dir).await?;
        Ok(sink)
    }

    /// Output directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the artifact for `term`.
    pub fn path_for(&self, term: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(term)))
    }

    fn render(term: &str, result: &TermResult) -> Result<Vec<u8>> {
        let document = match result {
            TermResult::Succeeded { payload } => serde_json::to_vec_pretty(payload)?,
            TermResult::Failed { reason, attempts } => serde_json::to_vec_pretty(&json!({
                "term": term,
                "status": "failed",
                "reason": reason,
                "attempts": attempts,
            }))?,
        };
        Ok(document)
    }
}

#[async_trait]
impl ResultSink for FileSink {
    async fn write(&self, term: &str, result: &TermResult) -> Result<()> {
        let target = self.path_for(term);
        let tmp = self.dir.join(format!(
            ".{}.{}.tmp",
            file_stem(term),
            self.next_tmp.fetch_add(1, Ordering::Relaxed)
        ));

        let document = Self::render(term, result)?;
        tokio::fs::write(&tmp, &document).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(term, path = %target.display(), "Saved result");
        Ok(())
    }
}

/// Keeps results in memory, keyed by term.
#[derive(Debug, Default)]
pub struct MemorySink {
    results: Mutex<HashMap<String, TermResult>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored result for `term`.
    pub fn get(&self, term: &str) -> Option<TermResult> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(term)
            .cloned()
    }

    /// Number of distinct terms stored.
    pub fn len(&self) -> usize {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn write(&self, term: &str, result: &TermResult) -> Result<()> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(term.to_string(), result.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success(n: u64) -> TermResult {
        TermResult::Succeeded {
            payload: json!({"organic_results": [{"position": n}]}),
        }
    }

    #[tokio::test]
    async fn test_file_sink_writes_payload() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::create(dir.path()).await.unwrap();

        sink.write("rust lang", &success(1)).await.unwrap();

        let written = std::fs::read_to_string(dir.path().join("rust%20lang.json")).unwrap();
        let value: Value = serde_json::from_str(&written).unwrap();
        assert_eq!(value["organic_results"][0]["position"], 1);
    }

    #[tokio::test]
    async fn test_file_sink_writes_failure_marker() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::create(dir.path()).await.unwrap();
        let failed = TermResult::Failed {
            reason: "captcha challenge".into(),
            attempts: 3,
        };

        sink.write("nana1", &failed).await.unwrap();

        let written = std::fs::read_to_string(sink.path_for("nana1")).unwrap();
        let value: Value = serde_json::from_str(&written).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["term"], "nana1");
        assert_eq!(value["attempts"], 3);
    }

    #[tokio::test]
    async fn test_file_sink_second_write_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::create(dir.path()).await.unwrap();

        sink.write("term", &success(1)).await.unwrap();
        sink.write("term", &success(2)).await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let value: Value =
            serde_json::from_str(&std::fs::read_to_string(sink.path_for("term")).unwrap())
                .unwrap();
        assert_eq!(value["organic_results"][0]["position"], 2);
    }

    #[tokio::test]
    async fn test_file_sink_keeps_path_like_terms_inside_dir() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::create(dir.path()).await.unwrap();

        sink.write("../escape/attempt", &success(1)).await.unwrap();

        let path = sink.path_for("../escape/attempt");
        assert_eq!(path.parent().unwrap(), dir.path());
        assert!(path.exists());
    }

    #[test]
    fn test_file_sink_distinct_terms_distinct_paths() {
        let sink = FileSink::new("/tmp/out");
        assert_ne!(sink.path_for("a/b"), sink.path_for("a_b"));
        assert_ne!(sink.path_for("a b"), sink.path_for("a+b"));
    }

    #[tokio::test]
    async fn test_file_sink_create_makes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("out").join("serp");
        let sink = FileSink::create(&nested).await.unwrap();
        assert!(sink.dir().is_dir());
    }

    #[tokio::test]
    async fn test_memory_sink_overwrites() {
        let sink = MemorySink::new();
        assert!(sink.is_empty());

        sink.write("term", &success(1)).await.unwrap();
        sink.write("term", &success(2)).await.unwrap();

        assert_eq!(sink.len(), 1);
        assert_eq!(sink.get("term"), Some(success(2)));
    }

    #[test]
    fn test_term_result_serialization() {
        let failed = TermResult::Failed {
            reason: "blocked".into(),
            attempts: 2,
        };
        let json = serde_json::to_string(&failed).unwrap();
        assert!(json.contains("\"status\":\"failed\""));
        assert!(!failed.is_success());
        assert!(success(1).is_success());
    }

    #[tokio::test]
    async fn test_file_sink_long_term_gets_bounded_name() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::create(dir.path()).await.unwrap();
        let term = "搜".repeat(200);

        sink.write(&term, &success(1)).await.unwrap();
        sink.write(&term, &success(2)).await.unwrap();

        let path = sink.path_for(&term);
        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.len() < 255, "{} bytes", name.len());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        let value: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["organic_results"][0]["position"], 2);
    }

    #[test]
    fn test_long_terms_sharing_a_prefix_get_distinct_names() {
        let base = "a".repeat(300);
        let one = file_stem(&format!("{}1", base));
        let two = file_stem(&format!("{}2", base));

        assert_ne!(one, two);
        assert_eq!(one.len(), MAX_STEM_LEN + 1);
        assert_eq!(one, file_stem(&format!("{}1", base)));
        assert_eq!(file_stem(&"a".repeat(MAX_STEM_LEN)).len(), MAX_STEM_LEN);
    }
}
