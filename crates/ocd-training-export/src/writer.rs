use crate::{ExportError, TrainingCorpus};
use chrono::{DateTime, Utc};
use ocd_decision_types::AgentType;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

static TEMP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Default artifact location: `<dir>/training-<agent>-<timestamp>.jsonl`.
pub fn default_corpus_path(dir: &Path, agent_type: AgentType, now: DateTime<Utc>) -> PathBuf {
    dir.join(format!(
        "training-{}-{}.jsonl",
        agent_type.slug(),
        now.format("%Y%m%dT%H%M%SZ")
    ))
}

/// Writes the corpus via temp file + rename so readers never observe a
/// partial artifact. Returns the number of bytes written.
pub fn write_training_corpus(path: &Path, corpus: &TrainingCorpus) -> Result<usize, ExportError> {
    if path.as_os_str().is_empty() {
        return Err(ExportError::InvalidOutputPath(
            "destination path cannot be empty".to_string(),
        ));
    }
    if path.is_dir() {
        return Err(ExportError::InvalidOutputPath(format!(
            "destination path '{}' is a directory",
            path.display()
        )));
    }
    if corpus.is_empty() {
        return Err(ExportError::EmptySelection {
            agent_type: corpus.agent_type,
        });
    }

    let content = corpus.to_jsonl()?;
    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent_dir).map_err(|source| ExportError::Io {
        path: parent_dir.to_path_buf(),
        source,
    })?;

    let temp_path = temp_path_for(parent_dir, path);
    std::fs::write(&temp_path, &content).map_err(|source| ExportError::Io {
        path: temp_path.clone(),
        source,
    })?;
    if let Err(source) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(ExportError::Io {
            path: path.to_path_buf(),
            source,
        });
    }
    tracing::debug!(path = %path.display(), bytes = content.len(), "wrote training corpus");
    Ok(content.len())
}

// Unique per process, write, and instant.
fn temp_path_for(parent_dir: &Path, path: &Path) -> PathBuf {
    parent_dir.join(format!(
        ".{}.tmp-{}-{}-{}",
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("training-corpus"),
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        TEMP_SEQUENCE.fetch_add(1, Ordering::Relaxed)
    ))
}
