//! Serves stored blobs. Public image URLs point here.
//! Bodies are streamed from the store rather than buffered.

use crate::{
    errors::AppError,
    services::object_store::{ObjectStoreError, StoredObject},
    state::AppState,
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use tokio_util::io::ReaderStream;

/// `GET /objects/{*path}`
pub async fn get_object(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response, AppError> {
    let object = state.objects.open(&path).await.map_err(|err| match err {
        ObjectStoreError::NotFound(_) | ObjectStoreError::InvalidPath => {
            AppError::not_found("Object not found.")
        }
        other => {
            tracing::error!(path = %path, error = %other, "failed to open object");
            AppError::internal("Failed to read object.")
        }
    })?;

    let mut headers = HeaderMap::new();
    set_object_headers(&mut headers, &object);

    let body = Body::from_stream(ReaderStream::new(object.reader));
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    *response.headers_mut() = headers;
    Ok(response)
}

fn set_object_headers(headers: &mut HeaderMap, object: &StoredObject) {
    let content_type = object.content_type.unwrap_or("application/octet-stream");
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(object.size));
    // Paths embed fresh ids and are never overwritten.
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000, immutable"),
    );
}
