use std::path::PathBuf;

use base64::Engine;
use tempfile::TempDir;
use tracing::debug;

use crate::error::{AgentError, Result};

/// One attachment to materialise for the child. `data` is base64.
#[derive(Debug, Clone)]
pub struct AttachmentFile {
    pub name: String,
    pub data: String,
}

/// Per-invocation attachment staging area.
///
/// The backing temp dir is owned by the invocation and removed on drop, so
/// files disappear on success and error paths alike.
pub struct AttachmentStage {
    dir: TempDir,
    paths: Vec<PathBuf>,
}

impl AttachmentStage {
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Prompt fragment pointing the assistant at the staged files.
    pub fn prompt_suffix(&self) -> String {
        let mut out = String::new();
        for path in &self.paths {
            out.push_str(&format!(
                "\n[Attached file saved to: {}. Read it before starting.]",
                path.display()
            ));
        }
        out
    }
}

/// Decode and write attachments into a fresh temp dir.
///
/// Returns `None` when there is nothing to stage.
pub fn stage(attachments: &[AttachmentFile]) -> Result<Option<AttachmentStage>> {
    if attachments.is_empty() {
        return Ok(None);
    }

    let dir = tempfile::Builder::new()
        .prefix("maestro-attach-")
        .tempdir()?;

    let mut paths = Vec::with_capacity(attachments.len());
    for attachment in attachments {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&attachment.data)
            .map_err(|e| {
                AgentError::Attachments(format!("bad base64 in '{}': {e}", attachment.name))
            })?;
        let name = sanitize_name(&attachment.name);
        let path = dir.path().join(&name);
        std::fs::write(&path, bytes)?;
        debug!(file = %path.display(), "attachment staged");
        paths.push(path);
    }

    Ok(Some(AttachmentStage { dir, paths }))
}

/// Strip path separators and anything else that could escape the stage dir.
fn sanitize_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "attachment".to_string()
    } else {
        trimmed.to_string()
    }
}
