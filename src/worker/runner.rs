//! Job runner - takes one document through the whole pipeline

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::task::{JoinError, spawn_blocking};
use tracing::{debug, info};

use super::BatchConfig;
use crate::observability::Metrics;
use crate::repair::{self, RepairError};
use crate::signing::{self, EmbedError, IncrementalMutator, MutateError, PreparedDocument};
use crate::tsa::{TimestampAuthority, TsaError};

/// Longest failure reason kept on a job; the full error goes to the log.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 60;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("Repair failed: {0}")]
    Repair(#[from] RepairError),

    #[error("Signature field: {0}")]
    Mutate(#[from] MutateError),

    #[error("{0}")]
    Tsa(#[from] TsaError),

    #[error("Embedding failed: {0}")]
    Embed(#[from] EmbedError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Worker task failed: {0}")]
    Task(#[from] JoinError),
}

pub type Result<T> = std::result::Result<T, StageError>;

/// Repair (optional), add the signature field, fetch a token, embed it and
/// write `output`. Returns the number of bytes written.
pub async fn process_job(
    input: &Path,
    output: &Path,
    config: &BatchConfig,
    authority: &dyn TimestampAuthority,
    metrics: &Metrics,
) -> Result<usize> {
    let original = tokio::fs::read(input).await?;
    debug!(input = %input.display(), size = original.len(), "Input read");

    let repair_enabled = config.repair_enabled;
    let field_name = config.field_name.clone();
    let mutator = IncrementalMutator::new(config.reserved_bytes, config.hash_algorithm);
    let prepared = spawn_blocking(move || -> Result<PreparedDocument> {
        let source = if repair_enabled {
            repair::repair_bytes(original)?
        } else {
            original
        };
        Ok(mutator.append_signature_field(source, &field_name, 0)?)
    })
    .await??;
    debug!(
        input = %input.display(),
        field = %prepared.field_name,
        digest = %hex::encode(&prepared.digest),
        "Signature slot prepared"
    );

    metrics.tsa_request();
    let token = authority
        .request_timestamp(&prepared.digest, prepared.hash_algorithm)
        .await?;
    let gen_time = token.gen_time();

    let sealed = spawn_blocking(move || signing::embed(prepared, token.as_der())).await??;
    write_atomically(output, &sealed).await?;

    info!(
        input = %input.display(),
        output = %output.display(),
        size = sealed.len(),
        gen_time = %gen_time,
        "Document sealed"
    );
    Ok(sealed.len())
}

/// Write through a uniquely named sibling and rename it onto `path`. The
/// sibling is removed if anything fails.
pub async fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let temp = temp_sibling(path);
    let result = async {
        tokio::fs::write(&temp, bytes).await?;
        tokio::fs::rename(&temp, path).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&temp).await;
    }
    result
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()))
}

/// Shorten `message` to at most `max_chars` characters, ending in an ellipsis
/// when cut.
pub fn abbreviate(message: &str, max_chars: usize) -> String {
    if message.chars().count() <= max_chars {
        return message.to_string();
    }
    let mut short: String = message.chars().take(max_chars.saturating_sub(1)).collect();
    short.push('…');
    short
}
