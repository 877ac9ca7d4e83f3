//! Per-request staging of an uploaded artifact.
//!
//! Each upload gets its own temporary directory holding a single file named
//! `artifact`. The directory lives exactly as long as the [`UploadSession`]
//! that owns it, so every exit path of the request (success, error, or the
//! handler future being dropped) removes it.

use std::io;
use std::path::{Path, PathBuf};

use axum::extract::Multipart;
use axum::extract::multipart::{Field, MultipartError};
use axum::http::StatusCode;
use tempfile::TempDir;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Multipart field carrying the artifact.
pub const ARTIFACT_FIELD: &str = "artifact";
/// File name of the artifact inside the staging directory.
pub const ARTIFACT_FILE_NAME: &str = "artifact";
const STAGING_PREFIX: &str = "trogon-intake-";

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("multipart field `{ARTIFACT_FIELD}` is missing")]
    MissingArtifact,

    #[error("malformed multipart body: {0}")]
    Multipart(#[from] MultipartError),

    #[error("cannot create staging directory: {0}")]
    CreateDir(#[source] io::Error),

    #[error("cannot persist artifact to {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StagingError {
    /// Client errors are caused by the request itself. A multipart error is
    /// classified by its own status, so a failed body read is a server error.
    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingArtifact => StatusCode::BAD_REQUEST,
            Self::Multipart(e) => e.status(),
            Self::CreateDir(_) | Self::Persist { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A staged artifact. Dropping the session removes its directory.
#[derive(Debug)]
pub struct UploadSession {
    dir: Option<TempDir>,
    artifact_path: PathBuf,
}

impl UploadSession {
    /// Absolute path of the staged artifact.
    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_ref().map(TempDir::path)
    }
}

impl Drop for UploadSession {
    fn drop(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        let path = dir.path().to_path_buf();
        match dir.close() {
            Ok(()) => debug!(dir = %path.display(), "Staging directory removed"),
            Err(e) => {
                warn!(dir = %path.display(), error = %e, "Failed to remove staging directory")
            }
        }
    }
}

/// Streams the first `artifact` field of `multipart` into a fresh directory
/// under `staging_root`.
///
/// Other fields are skipped. Nothing touches the disk until the artifact
/// field is found.
pub async fn stage(
    multipart: &mut Multipart,
    staging_root: &Path,
) -> Result<UploadSession, StagingError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(ARTIFACT_FIELD) {
            continue;
        }
        return persist(field, staging_root).await;
    }
    Err(StagingError::MissingArtifact)
}

async fn persist(mut field: Field<'_>, staging_root: &Path) -> Result<UploadSession, StagingError> {
    let root = std::path::absolute(staging_root).map_err(StagingError::CreateDir)?;
    let dir = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempdir_in(&root)
        .map_err(StagingError::CreateDir)?;
    let session = UploadSession {
        artifact_path: dir.path().join(ARTIFACT_FILE_NAME),
        dir: Some(dir),
    };

    let persist_err = |source: io::Error| StagingError::Persist {
        path: session.artifact_path.clone(),
        source,
    };
    let mut file = tokio::fs::File::create(&session.artifact_path)
        .await
        .map_err(persist_err)?;

    let mut written: u64 = 0;
    while let Some(chunk) = field.chunk().await? {
        file.write_all(&chunk).await.map_err(persist_err)?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(persist_err)?;

    debug!(
        artifact = %session.artifact_path.display(),
        bytes = written,
        "Artifact staged"
    );
    Ok(session)
}
