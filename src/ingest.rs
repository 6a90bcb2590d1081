//! Folder ingestion: scan, chunk, embed, upsert in bounded batches.
//!
//! ```text
//! walk folder ──▶ include/exclude globs ──▶ batches of N files
//!                                              │
//!        size guard ─▶ read ─▶ chunk ─▶ embed ─▶ replace the batch's documents
//! ```
//!
//! Each batch's documents, chunks and vectors are dropped before the next
//! batch is read. A file that cannot be read or written is logged and
//! counted, never fatal. Runs are serialized per collection with an
//! [`IngestLock`]; a second concurrent run reports
//! [`IngestOutcome::InProgress`] instead of failing.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::chunk::ChunkSplitter;
use crate::config::IngestConfig;
use crate::models::{Document, Metadata};
use crate::store::lock::IngestLock;
use crate::store::{Collection, DocumentChunks};

/// Counts for one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub files_found: usize,
    pub files_stored: usize,
    /// Oversized, empty, or non-UTF-8 files.
    pub files_skipped: usize,
    /// Files whose read or write failed.
    pub files_failed: usize,
    pub chunks_written: usize,
    /// Chunks stored with a zero vector because embedding failed.
    pub zero_vectors: usize,
    pub batches: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    Completed(IngestReport),
    /// Another writer holds the collection lock.
    InProgress,
}

/// A file selected for ingestion.
#[derive(Debug, Clone)]
struct Candidate {
    path: PathBuf,
    relative: String,
}

pub struct Ingestor {
    collection: Collection,
    splitter: ChunkSplitter,
    config: IngestConfig,
    lock_dir: PathBuf,
}

impl Ingestor {
    /// `lock_dir` is where the per-collection lock file lives, normally the store directory.
    pub fn new(
        collection: Collection,
        splitter: ChunkSplitter,
        config: IngestConfig,
        lock_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            collection,
            splitter,
            config,
            lock_dir: lock_dir.into(),
        }
    }

    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    pub fn default_folder(&self) -> &Path {
        &self.config.source_dir
    }

    pub async fn ingest_folder(&self, folder: &Path) -> Result<IngestOutcome> {
        let Some(_lock) = IngestLock::try_acquire(&self.lock_dir, self.collection.name())? else {
            return Ok(IngestOutcome::InProgress);
        };

        let mut report = IngestReport::default();
        if !folder.is_dir() {
            tracing::warn!(folder = %folder.display(), "ingest folder does not exist");
            return Ok(IngestOutcome::Completed(report));
        }

        let candidates = scan_folder(folder, &self.config)?;
        report.files_found = candidates.len();
        tracing::info!(
            folder = %folder.display(),
            files = candidates.len(),
            collection = self.collection.name(),
            "starting ingestion"
        );

        for batch in candidates.chunks(self.config.batch_size) {
            self.ingest_batch(batch, &mut report).await;
            report.batches += 1;
            self.collection.embedder().release().await;
        }

        tracing::info!(
            found = report.files_found,
            stored = report.files_stored,
            skipped = report.files_skipped,
            failed = report.files_failed,
            chunks = report.chunks_written,
            "ingestion finished"
        );
        Ok(IngestOutcome::Completed(report))
    }

    async fn ingest_batch(&self, batch: &[Candidate], report: &mut IngestReport) {
        let documents: Vec<Document> = batch
            .iter()
            .filter_map(|candidate| self.load(candidate, report))
            .collect();

        if documents.is_empty() {
            return;
        }

        let pending: Vec<DocumentChunks> = documents
            .iter()
            .map(|document| {
                let chunks = self.splitter.chunk_document(document);
                DocumentChunks {
                    document_id: document.id.clone(),
                    ids: chunks.iter().map(|c| c.id.clone()).collect(),
                    texts: chunks.iter().map(|c| c.text.clone()).collect(),
                    metadata: chunks
                        .iter()
                        .map(|c| {
                            let mut m = Metadata::new();
                            m.insert("source".into(), Value::from(document.id.clone()));
                            m.insert("format".into(), Value::from(document.format.clone()));
                            m.insert("chunk_index".into(), Value::from(c.chunk_index));
                            m.insert("chunk_count".into(), Value::from(c.chunk_count));
                            m.insert("start".into(), Value::from(c.start));
                            m.insert("end".into(), Value::from(c.end));
                            m.insert("hash".into(), Value::from(c.hash.clone()));
                            m
                        })
                        .collect(),
                }
            })
            .collect();

        // The batch replaces its documents in one write; a failure leaves
        // whatever was indexed before untouched.
        match self.collection.replace_documents(&pending).await {
            Ok(upserted) => {
                report.files_stored += pending.len();
                report.chunks_written += upserted.written;
                report.zero_vectors += upserted.zero_vectors;
            }
            Err(e) => {
                let files: Vec<&str> = pending.iter().map(|d| d.document_id.as_str()).collect();
                tracing::warn!(files = ?files, error = %e, "failed to store batch, previous chunks kept");
                report.files_failed += pending.len();
            }
        }
    }

    /// Read a candidate, applying the size guard. `None` means skipped or failed.
    fn load(&self, candidate: &Candidate, report: &mut IngestReport) -> Option<Document> {
        let size = match std::fs::metadata(&candidate.path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                tracing::warn!(file = %candidate.relative, error = %e, "cannot stat file");
                report.files_failed += 1;
                return None;
            }
        };
        if size > self.config.max_file_bytes {
            tracing::info!(
                file = %candidate.relative,
                bytes = size,
                limit = self.config.max_file_bytes,
                "skipping oversized file"
            );
            report.files_skipped += 1;
            return None;
        }

        let text = match std::fs::read(&candidate.path) {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    tracing::info!(file = %candidate.relative, "skipping non-UTF-8 file");
                    report.files_skipped += 1;
                    return None;
                }
            },
            Err(e) => {
                tracing::warn!(file = %candidate.relative, error = %e, "cannot read file");
                report.files_failed += 1;
                return None;
            }
        };

        if text.trim().is_empty() {
            tracing::info!(file = %candidate.relative, "skipping empty file");
            report.files_skipped += 1;
            return None;
        }

        let format = candidate
            .path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "txt".to_string());

        Some(Document {
            id: candidate.relative.clone(),
            text,
            source: candidate.path.display().to_string(),
            format,
        })
    }
}

/// List ingestible files under `root`, sorted by relative path.
fn scan_folder(root: &Path, config: &IngestConfig) -> Result<Vec<Candidate>> {
    let include_set = build_globset(&config.include_globs)?;

    let mut excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    excludes.extend(config.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut candidates = Vec::new();
    for entry in WalkDir::new(root).follow_links(config.follow_symlinks) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");

        if exclude_set.is_match(&relative) || !include_set.is_match(&relative) {
            continue;
        }
        candidates.push(Candidate {
            path: path.to_path_buf(),
            relative,
        });
    }

    candidates.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(candidates)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => bail!("Invalid glob pattern '{}': {}", pattern, e),
        }
    }
    Ok(builder.build()?)
}
