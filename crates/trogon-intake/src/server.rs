use std::path::{Path as FsPath, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;

use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::QueryRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinError;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, error, info, instrument, warn};

use crate::catalog::{Product, ProductCatalog};
use crate::config::IntakeConfig;
use crate::pipeline::{self, InvocationError, PipelineExit};
use crate::staging::{self, StagingError};

pub const ERROR_MALFORMED_UPLOAD: u16 = 1;
pub const ERROR_UNAUTHORIZED: u16 = 3;
pub const ERROR_NOT_FOUND: u16 = 4;
pub const ERROR_INTERNAL: u16 = 5;
pub const ERROR_PIPELINE_FAILED: u16 = 8;
pub const ERROR_PIPELINE_TIMEOUT: u16 = 9;

#[derive(Clone)]
pub struct AppState {
    catalog: Arc<ProductCatalog>,
    staging_dir: Arc<PathBuf>,
    max_upload_bytes: usize,
}

impl AppState {
    pub fn new(catalog: ProductCatalog, config: &IntakeConfig) -> Self {
        Self {
            catalog: Arc::new(catalog),
            staging_dir: Arc::new(config.staging_dir.clone()),
            max_upload_bytes: config.max_upload_bytes,
        }
    }
}

/// Build the axum router: `GET /ping` and `POST /v1/upload/{product}`.
pub fn router(state: AppState) -> Router {
    let max_upload_bytes = state.max_upload_bytes;
    Router::new()
        .route("/ping", get(ping))
        .route("/v1/upload/{product}", post(handle_upload))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

/// Serves until `shutdown` resolves, then waits for in-flight requests.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn ping() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "pong" }))
}

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// `Authorization: Bearer <token>` wins over the `token` query parameter.
///
/// The scheme is matched case-insensitively; the token is taken verbatim.
fn presented_token<'a>(headers: &'a HeaderMap, query: &'a TokenQuery) -> Option<&'a str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .or(query.token.as_deref())
}

fn bearer_token(authorization: &str) -> Option<&str> {
    let (scheme, token) = authorization.split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then_some(token)
}

#[instrument(name = "intake.upload", skip_all, fields(product = tracing::field::Empty))]
async fn handle_upload(
    State(state): State<AppState>,
    Path(product): Path<String>,
    query: Result<Query<TokenQuery>, QueryRejection>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<String, UploadError> {
    tracing::Span::current().record("product", product.as_str());

    let Some(target) = state.catalog.lookup(&product) else {
        return Err(UploadError::UnknownProduct(product));
    };

    let query = query.map(|Query(q)| q).unwrap_or_default();
    if !target.token().verify(presented_token(&headers, &query)) {
        return Err(UploadError::Unauthorized(product));
    }

    let multipart = multipart?;
    let staging_dir = Arc::clone(&state.staging_dir);

    // Hyper drops this handler when the caller disconnects. The upload task
    // owns the staged artifact and the child so the pipeline runs to the end.
    let upload = tokio::spawn(
        async move { process_upload(&target, multipart, &staging_dir).await }
            .instrument(tracing::Span::current()),
    );
    upload.await??;

    Ok(format!("Artifact for product {product} processed successfully."))
}

/// Stage the artifact, wait for a pipeline slot, run the script. The staging
/// directory is removed when this returns.
async fn process_upload(
    product: &Product,
    mut multipart: Multipart,
    staging_dir: &FsPath,
) -> Result<(), UploadError> {
    let session = staging::stage(&mut multipart, staging_dir).await?;
    let _slot = product.acquire_pipeline_slot().await;
    let result = pipeline::run(product.script(), session.artifact_path(), product.timeout())
        .await?;

    match result.exit {
        PipelineExit::Failed(status) => {
            warn!(
                %status,
                stdout = %result.stdout.lossy(),
                stderr = %result.stderr.lossy(),
                "Pipeline script failed"
            );
            Err(UploadError::PipelineFailed(status))
        }
        PipelineExit::Succeeded | PipelineExit::Skipped => {
            info!(exit = ?result.exit, "Artifact processed");
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: u16,
    message: String,
}

/// Every way an upload request can fail, mapped onto a status and error code.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("product {0} does not exist")]
    UnknownProduct(String),

    #[error("invalid or missing token for product {0}")]
    Unauthorized(String),

    #[error("request is not a multipart upload: {0}")]
    NotMultipart(#[from] MultipartRejection),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error("pipeline script exited with {0}")]
    PipelineFailed(ExitStatus),

    #[error(transparent)]
    Invocation(#[from] InvocationError),

    #[error("upload task failed: {0}")]
    Task(#[from] JoinError),
}

impl UploadError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnknownProduct(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotMultipart(rejection) => rejection.status(),
            Self::Staging(e) => e.status(),
            Self::PipelineFailed(_) | Self::Invocation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            Self::UnknownProduct(_) => ERROR_NOT_FOUND,
            Self::Unauthorized(_) => ERROR_UNAUTHORIZED,
            Self::NotMultipart(_) => ERROR_MALFORMED_UPLOAD,
            Self::Staging(e) if e.is_client_error() => ERROR_MALFORMED_UPLOAD,
            Self::Staging(_) | Self::Task(_) => ERROR_INTERNAL,
            Self::Invocation(InvocationError::Timeout { .. }) => ERROR_PIPELINE_TIMEOUT,
            Self::PipelineFailed(_) | Self::Invocation(_) => ERROR_PIPELINE_FAILED,
        }
    }

    /// The message sent to the caller. Server-side details stay in the logs.
    fn public_message(&self) -> String {
        match self {
            Self::UnknownProduct(_) => "Resource does not exist.".to_string(),
            Self::Unauthorized(_) => "Invalid or missing token.".to_string(),
            Self::NotMultipart(rejection) => {
                format!("Error while uploading: {}", rejection.body_text())
            }
            Self::Staging(e) if e.is_client_error() => format!("Error while uploading: {e}"),
            Self::Staging(_) => {
                "Could not stage the uploaded artifact. Check logs for details.".to_string()
            }
            Self::Task(_) => "Internal error. Check logs for details.".to_string(),
            Self::Invocation(InvocationError::Timeout { .. }) => {
                "Pipeline associated with resource timed out.".to_string()
            }
            Self::PipelineFailed(_) | Self::Invocation(_) => {
                "Pipeline associated with resource errored.".to_string()
            }
        }
    }
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_client_error() && status != StatusCode::UNPROCESSABLE_ENTITY {
            warn!(error = %self, %status, "Upload rejected");
        } else {
            error!(error = %self, %status, "Upload failed");
        }

        let body = ErrorBody {
            error: self.code(),
            message: self.public_message(),
        };
        (status, Json(body)).into_response()
    }
}
