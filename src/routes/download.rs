use axum::{
    body::Body,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Response},
};
use tokio_util::io::ReaderStream;

use crate::error::Result;
use crate::routes::validation::FilenameParams;
use crate::AppState;

/// GET /api/data-protection/download?filename=
///
/// Streams an artifact. The name must pass the artifact pattern, be known to
/// the catalog and resolve to a non-empty file inside the backup root.
pub async fn download_backup(
    State(state): State<AppState>,
    Query(params): Query<FilenameParams>,
) -> Result<Response> {
    let filename = params.artifact_name()?;
    let target = state.protection.download_target(filename).await?;

    let file = tokio::fs::File::open(&target.path).await?;
    tracing::info!(
        "Serving {} ({} bytes)",
        target.record.file_name,
        target.size_bytes
    );

    let content_type = if target.record.file_name.ends_with(".json.gz") {
        "application/gzip"
    } else {
        "application/x-gtar"
    };
    let disposition = format!("attachment; filename=\"{}\"", target.record.file_name);

    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_LENGTH, target.size_bytes.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}
