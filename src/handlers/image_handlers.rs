//! HTTP handlers for image upload and management.
//!
//! Uploads run validator -> transcoder -> repository. The repository checks
//! the stored bytes again on its own.

use crate::{
    auth::Caller,
    errors::AppError,
    services::{
        file_validator::{self, CandidateFile},
        image_repository::{AltTextUpdate, ImageError, UploadFile, UploadImageInput},
        query_cache::Mutation,
        validation::{ValidationError, parse_uuid},
    },
    state::{AppState, CachedView, keys},
};
use axum::{
    Json,
    extract::{Multipart, Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

/// Body of `PATCH /images/{id}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AltTextBody {
    pub alt_text: Option<String>,
}

struct UploadForm {
    bytes: Bytes,
    content_type: String,
    filename: String,
    alt_text: Option<String>,
}

async fn read_upload_form(multipart: &mut Multipart) -> Result<UploadForm, AppError> {
    let mut file: Option<(Bytes, String, String)> = None;
    let mut alt_text = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or("").to_string();
                let content_type = field.content_type().unwrap_or("").to_string();
                let bytes = field.bytes().await?;
                file = Some((bytes, content_type, filename));
            }
            "altText" => alt_text = Some(field.text().await?),
            _ => {}
        }
    }

    let (bytes, content_type, filename) =
        file.ok_or_else(|| ValidationError::single("file", "File is required"))?;
    Ok(UploadForm {
        bytes,
        content_type,
        filename,
        alt_text,
    })
}

fn image_id_from(raw: &str) -> Result<Uuid, AppError> {
    parse_uuid(raw).ok_or_else(|| ValidationError::single("imageId", "Invalid image ID").into())
}

/// `POST /images` (multipart: `file`, optional `altText`)
pub async fn upload_image(
    State(state): State<AppState>,
    Caller(caller): Caller,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let user = caller.ok_or(ImageError::Unauthenticated("upload images"))?;
    let form = read_upload_form(&mut multipart).await?;

    file_validator::validate(&CandidateFile {
        bytes: &form.bytes,
        content_type: &form.content_type,
        filename: &form.filename,
    })?;

    let transcoded = state
        .transcoder
        .transcode_blocking(form.bytes, form.filename.clone())
        .await?;

    let input = UploadImageInput {
        original_filename: form.filename,
        alt_text: form.alt_text,
        width: i64::from(transcoded.width),
        height: i64::from(transcoded.height),
    };
    let file = UploadFile {
        bytes: transcoded.bytes.clone(),
        content_type: transcoded.content_type.to_string(),
        filename: transcoded.filename.clone(),
    };

    let mutation = Mutation::new("upload-image").invalidates(keys::images_of(user.id));
    let uploaded = state
        .cache
        .mutate(mutation, async {
            state
                .images
                .upload(Some(user), file, input)
                .await
                .map_err(AppError::from)
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": "Image uploaded successfully",
            "imageId": uploaded.image_id,
            "publicUrl": uploaded.public_url,
            "width": transcoded.width,
            "height": transcoded.height,
            "originalSize": transcoded.original_size,
            "convertedSize": transcoded.converted_size,
        })),
    ))
}

/// `GET /images` - the caller's images, newest first.
pub async fn list_images(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> Result<impl IntoResponse, AppError> {
    let user = caller.ok_or(ImageError::Unauthenticated("view images"))?;
    let view = state
        .cache
        .get_or_fetch(keys::images_of(user.id), async {
            let images = state.images.list(Some(user)).await?;
            Ok::<_, AppError>(CachedView::Images(images))
        })
        .await?;

    let CachedView::Images(images) = view else {
        return Err(AppError::internal(crate::errors::UNEXPECTED));
    };
    Ok(Json(json!({
        "success": true,
        "message": "Images fetched successfully",
        "images": images,
    })))
}

/// `DELETE /images/{id}`
pub async fn delete_image(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let image_id = image_id_from(&id)?;
    let user = caller.ok_or(ImageError::Unauthenticated("delete images"))?;

    let mutation = Mutation::new("delete-image")
        .optimistic(keys::images_of(user.id), move |view| match view {
            CachedView::Images(images) => CachedView::Images(
                images
                    .iter()
                    .filter(|image| image.id != image_id)
                    .cloned()
                    .collect(),
            ),
            other => other.clone(),
        })
        .invalidates(keys::images_of(user.id))
        .invalidates(keys::projects());

    state
        .cache
        .mutate(mutation, async {
            state
                .images
                .delete(Some(user), image_id)
                .await
                .map_err(AppError::from)
        })
        .await?;

    Ok(Json(json!({
        "success": true,
        "message": "Image deleted successfully",
    })))
}

/// `PATCH /images/{id}` - replace the alt text.
pub async fn update_alt_text(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    payload: Result<Json<AltTextBody>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(body) = payload?;
    let update = AltTextUpdate {
        image_id: id,
        alt_text: body.alt_text,
    };
    let image_id = update.validate()?;
    let user = caller.ok_or(ImageError::Unauthenticated("edit images"))?;

    let alt_text = update.alt_text.clone().filter(|alt| !alt.is_empty());
    let mutation = Mutation::new("update-alt-text")
        .optimistic(keys::images_of(user.id), move |view| match view {
            CachedView::Images(images) => CachedView::Images(
                images
                    .iter()
                    .cloned()
                    .map(|mut image| {
                        if image.id == image_id {
                            image.alt_text = alt_text.clone();
                        }
                        image
                    })
                    .collect(),
            ),
            other => other.clone(),
        })
        .invalidates(keys::images_of(user.id));

    state
        .cache
        .mutate(mutation, async {
            state
                .images
                .update_alt_text(Some(user), update)
                .await
                .map_err(AppError::from)
        })
        .await?;

    Ok(Json(json!({
        "success": true,
        "message": "Alt text updated successfully",
    })))
}
