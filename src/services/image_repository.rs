//! Image repository: blob + metadata persistence for uploaded images.
//!
//! An `images` row exists only while its blob exists. Uploads write the blob
//! first and the row second; if the row insert fails the blob is removed
//! again before the error is returned. Deletes remove the blob first.

use crate::{
    auth::AuthUser,
    models::image::{Image, ImageData},
    services::{
        file_validator::{self, ALLOWED_EXTENSIONS, CandidateFile, FileRejection, extension_of},
        object_store::{ObjectStore, ObjectStoreError},
        saga::Saga,
        validation::{FieldErrors, ValidationError, check_length, parse_uuid},
    },
};
use bytes::Bytes;
use chrono::Utc;
use futures::FutureExt;
use sqlx::SqlitePool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

const MAX_FILENAME_LEN: usize = 255;
const MAX_ALT_TEXT_LEN: usize = 500;
/// Extension used when the supplied one is not on the allow-list.
const CANONICAL_EXTENSION: &str = "jpg";

#[derive(Debug, Error)]
pub enum ImageError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("You must be logged in to {0}.")]
    Unauthenticated(&'static str),
    #[error(transparent)]
    Rejected(#[from] FileRejection),
    #[error("Image not found.")]
    NotFound,
    #[error("You do not have permission to {0} this image.")]
    Forbidden(&'static str),
    #[error("Failed to upload file. Please try again.")]
    Upload(#[source] ObjectStoreError),
    #[error("Failed to save image metadata.")]
    Metadata(#[source] sqlx::Error),
    #[error("Failed to delete image.")]
    Remove(#[source] ObjectStoreError),
    #[error("Failed to delete image record.")]
    DeleteRecord(#[source] sqlx::Error),
    #[error("Failed to update alt text.")]
    Update(#[source] sqlx::Error),
    #[error("Failed to fetch images.")]
    Query(#[source] sqlx::Error),
}

pub type ImageResult<T> = Result<T, ImageError>;

/// Metadata accompanying an upload.
#[derive(Debug, Clone, Default)]
pub struct UploadImageInput {
    pub original_filename: String,
    pub alt_text: Option<String>,
    pub width: i64,
    pub height: i64,
}

impl UploadImageInput {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut errors = FieldErrors::new();
        check_length(
            &mut errors,
            "originalFilename",
            &self.original_filename,
            1,
            MAX_FILENAME_LEN,
            "Filename",
        );
        if let Some(alt) = &self.alt_text {
            check_length(&mut errors, "altText", alt, 0, MAX_ALT_TEXT_LEN, "Alt text");
        }
        if self.width <= 0 {
            errors.add("width", "Width must be a positive number");
        }
        if self.height <= 0 {
            errors.add("height", "Height must be a positive number");
        }
        errors.into_result()
    }
}

/// The bytes to store, as produced by the transcoder.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub bytes: Bytes,
    pub content_type: String,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadedImage {
    pub image_id: Uuid,
    pub public_url: String,
    pub storage_path: String,
}

/// Alt-text edit as submitted by a client.
#[derive(Debug, Clone)]
pub struct AltTextUpdate {
    pub image_id: String,
    pub alt_text: Option<String>,
}

impl AltTextUpdate {
    /// Validate and return the parsed image id.
    pub fn validate(&self) -> Result<Uuid, ValidationError> {
        let mut errors = FieldErrors::new();
        let id = parse_uuid(&self.image_id);
        if id.is_none() {
            errors.add("imageId", "Invalid image ID");
        }
        if let Some(alt) = &self.alt_text {
            check_length(&mut errors, "altText", alt, 0, MAX_ALT_TEXT_LEN, "Alt text");
        }
        errors.into_result()?;
        id.ok_or_else(|| ValidationError::single("imageId", "Invalid image ID"))
    }
}

/// Map a user-supplied extension onto the allow-list.
pub fn sanitize_extension(raw: Option<&str>) -> &'static str {
    raw.and_then(|ext| {
        ALLOWED_EXTENSIONS
            .iter()
            .copied()
            .find(|allowed| allowed.eq_ignore_ascii_case(ext))
    })
    .unwrap_or(CANONICAL_EXTENSION)
}

/// Storage path for an image. Built only from two UUIDs and an allow-listed
/// extension, so no caller-controlled text reaches the path.
pub fn build_storage_path(user_id: Uuid, image_id: Uuid, extension: &'static str) -> String {
    format!("{}/{}.{}", user_id.hyphenated(), image_id.hyphenated(), extension)
}

#[derive(Clone)]
pub struct ImageRepository {
    db: SqlitePool,
    store: Arc<dyn ObjectStore>,
}

impl ImageRepository {
    pub fn new(db: SqlitePool, store: Arc<dyn ObjectStore>) -> Self {
        Self { db, store }
    }

    /// Store a new image for the caller.
    pub async fn upload(
        &self,
        caller: Option<AuthUser>,
        file: UploadFile,
        input: UploadImageInput,
    ) -> ImageResult<UploadedImage> {
        input.validate()?;
        let user = caller.ok_or(ImageError::Unauthenticated("upload images"))?;

        // Independent of the schema above: only the bytes are trusted here.
        let kind = file_validator::validate(&CandidateFile {
            bytes: &file.bytes,
            content_type: &file.content_type,
            filename: &file.filename,
        })?;

        let image_id = Uuid::new_v4();
        let extension = sanitize_extension(extension_of(&file.filename).as_deref());
        let storage_path = build_storage_path(user.id, image_id, extension);
        let file_size = file.bytes.len() as i64;

        self.store
            .upload(&storage_path, file.bytes, kind.mime())
            .await
            .map_err(ImageError::Upload)?;

        let mut saga = Saga::new("image-upload");
        let store = self.store.clone();
        let blob = storage_path.clone();
        saga.completed("store-blob", move || {
            async move { store.remove(&[blob]).await.map_err(anyhow::Error::from) }.boxed()
        });

        let inserted = sqlx::query(
            "INSERT INTO images (
                id, user_id, storage_path, original_filename, alt_text,
                width, height, file_size, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(image_id)
        .bind(user.id)
        .bind(&storage_path)
        .bind(&input.original_filename)
        .bind(input.alt_text.as_deref().filter(|alt| !alt.is_empty()))
        .bind(input.width)
        .bind(input.height)
        .bind(file_size)
        .bind(Utc::now())
        .execute(&self.db)
        .await;

        if let Err(err) = inserted {
            let failures = saga.compensate().await;
            if !failures.is_empty() {
                warn!(
                    path = %storage_path,
                    "metadata insert failed and blob cleanup failed; blob is orphaned"
                );
            }
            return Err(ImageError::Metadata(err));
        }
        saga.commit();

        info!(%image_id, path = %storage_path, size = file_size, "image uploaded");
        Ok(UploadedImage {
            image_id,
            public_url: self.store.public_url(&storage_path),
            storage_path,
        })
    }

    /// Images owned by the caller, newest first.
    pub async fn list(&self, caller: Option<AuthUser>) -> ImageResult<Vec<ImageData>> {
        let user = caller.ok_or(ImageError::Unauthenticated("view images"))?;
        let rows = sqlx::query_as::<_, Image>(
            "SELECT id, user_id, storage_path, original_filename, alt_text,
                    width, height, file_size, created_at
             FROM images
             WHERE user_id = ?
             ORDER BY created_at DESC, rowid DESC",
        )
        .bind(user.id)
        .fetch_all(&self.db)
        .await
        .map_err(ImageError::Query)?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let url = self.store.public_url(&row.storage_path);
                ImageData::from_row(row, url)
            })
            .collect())
    }

    /// Remove an image owned by the caller: blob first, then the row.
    pub async fn delete(&self, caller: Option<AuthUser>, image_id: Uuid) -> ImageResult<()> {
        let user = caller.ok_or(ImageError::Unauthenticated("delete images"))?;
        let image = self.owned(user, image_id, "delete").await?;

        self.store
            .remove(&[image.storage_path.clone()])
            .await
            .map_err(ImageError::Remove)?;

        let result = sqlx::query("DELETE FROM images WHERE id = ? AND user_id = ?")
            .bind(image_id)
            .bind(user.id)
            .execute(&self.db)
            .await
            .map_err(ImageError::DeleteRecord)?;
        if result.rows_affected() == 0 {
            return Err(ImageError::NotFound);
        }

        info!(%image_id, path = %image.storage_path, "image deleted");
        Ok(())
    }

    /// Replace the alt text of an image owned by the caller.
    pub async fn update_alt_text(
        &self,
        caller: Option<AuthUser>,
        update: AltTextUpdate,
    ) -> ImageResult<()> {
        let image_id = update.validate()?;
        let user = caller.ok_or(ImageError::Unauthenticated("edit images"))?;
        self.owned(user, image_id, "edit").await?;

        sqlx::query("UPDATE images SET alt_text = ? WHERE id = ? AND user_id = ?")
            .bind(update.alt_text.as_deref().filter(|alt| !alt.is_empty()))
            .bind(image_id)
            .bind(user.id)
            .execute(&self.db)
            .await
            .map_err(ImageError::Update)?;
        Ok(())
    }

    pub async fn fetch(&self, image_id: Uuid) -> ImageResult<Option<Image>> {
        sqlx::query_as::<_, Image>(
            "SELECT id, user_id, storage_path, original_filename, alt_text,
                    width, height, file_size, created_at
             FROM images WHERE id = ?",
        )
        .bind(image_id)
        .fetch_optional(&self.db)
        .await
        .map_err(ImageError::Query)
    }

    /// Load `image_id` and check the caller owns it.
    async fn owned(&self, user: AuthUser, image_id: Uuid, action: &'static str) -> ImageResult<Image> {
        let image = self.fetch(image_id).await?.ok_or(ImageError::NotFound)?;
        if image.user_id != user.id {
            return Err(ImageError::Forbidden(action));
        }
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::testing, services::object_store::memory::MemoryObjectStore};

    const WEBP: &[u8] = b"RIFF\x24\x00\x00\x00WEBPVP8L....";

    fn webp_file() -> UploadFile {
        UploadFile {
            bytes: Bytes::from_static(WEBP),
            content_type: "image/webp".into(),
            filename: "holiday.webp".into(),
        }
    }

    fn input() -> UploadImageInput {
        UploadImageInput {
            original_filename: "holiday.jpg".into(),
            alt_text: Some("Beach".into()),
            width: 2000,
            height: 1000,
        }
    }

    async fn setup() -> (SqlitePool, Arc<MemoryObjectStore>, ImageRepository) {
        let db = testing::pool().await;
        let store = Arc::new(MemoryObjectStore::default());
        let repo = ImageRepository::new(db.clone(), store.clone());
        (db, store, repo)
    }

    async fn count_rows(db: &SqlitePool) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM images")
            .fetch_one(db)
            .await
            .unwrap()
    }

    #[test]
    fn storage_path_uses_only_ids_and_allowed_extension() {
        let user = Uuid::new_v4();
        let image = Uuid::new_v4();
        assert_eq!(sanitize_extension(Some("PNG")), "png");
        assert_eq!(sanitize_extension(Some("exe")), "jpg");
        assert_eq!(sanitize_extension(Some("../../x")), "jpg");
        assert_eq!(sanitize_extension(None), "jpg");
        assert_eq!(
            build_storage_path(user, image, "jpg"),
            format!("{user}/{image}.jpg")
        );
    }

    #[test]
    fn upload_schema_reports_each_field() {
        let bad = UploadImageInput {
            original_filename: String::new(),
            alt_text: Some("a".repeat(501)),
            width: 0,
            height: -3,
        };
        let err = bad.validate().unwrap_err();
        let fields: Vec<_> = err.errors.fields().collect();
        assert_eq!(fields, vec!["altText", "height", "originalFilename", "width"]);
        assert!(input().validate().is_ok());
    }

    #[tokio::test]
    async fn upload_stores_blob_and_row() {
        let (db, store, repo) = setup().await;
        let user = testing::user(&db, "ada").await;

        let uploaded = repo.upload(Some(user), webp_file(), input()).await.unwrap();

        assert_eq!(
            uploaded.storage_path,
            format!("{}/{}.webp", user.id, uploaded.image_id)
        );
        assert!(store.contains(&uploaded.storage_path));
        assert_eq!(uploaded.public_url, store.public_url(&uploaded.storage_path));

        let row = repo.fetch(uploaded.image_id).await.unwrap().unwrap();
        assert_eq!(row.user_id, user.id);
        assert_eq!(row.alt_text.as_deref(), Some("Beach"));
        assert_eq!(row.file_size, Some(WEBP.len() as i64));
        assert_eq!((row.width, row.height), (Some(2000), Some(1000)));
    }

    #[tokio::test]
    async fn upload_requires_login() {
        let (db, store, repo) = setup().await;
        let err = repo.upload(None, webp_file(), input()).await.unwrap_err();
        assert_eq!(err.to_string(), "You must be logged in to upload images.");
        assert_eq!(store.len(), 0);
        assert_eq!(count_rows(&db).await, 0);
    }

    #[tokio::test]
    async fn schema_failure_is_field_keyed() {
        let (db, _store, repo) = setup().await;
        let user = testing::user(&db, "ada").await;
        let bad = UploadImageInput {
            width: 0,
            ..input()
        };
        match repo.upload(Some(user), webp_file(), bad).await {
            Err(ImageError::Validation(err)) => assert!(err.errors.get("width").is_some()),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn spoofed_content_is_rejected_before_storage() {
        let (db, store, repo) = setup().await;
        let user = testing::user(&db, "ada").await;
        let spoofed = UploadFile {
            bytes: Bytes::from_static(b"%PDF-1.7 fake"),
            content_type: "image/jpeg".into(),
            filename: "x.jpg".into(),
        };
        let err = repo.upload(Some(user), spoofed, input()).await.unwrap_err();
        assert!(matches!(err, ImageError::Rejected(FileRejection::ContentMismatch(_))));
        assert!(err.to_string().contains("type"));
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn store_failure_leaves_nothing_behind() {
        let (db, store, repo) = setup().await;
        let user = testing::user(&db, "ada").await;
        store.set_fail_upload(true);
        let err = repo.upload(Some(user), webp_file(), input()).await.unwrap_err();
        assert_eq!(err.to_string(), "Failed to upload file. Please try again.");
        assert_eq!(count_rows(&db).await, 0);
    }

    #[tokio::test]
    async fn failed_metadata_insert_removes_the_blob() {
        let (db, store, repo) = setup().await;
        let user = testing::user(&db, "ada").await;
        testing::reject_image_inserts(&db).await;

        let err = repo.upload(Some(user), webp_file(), input()).await.unwrap_err();

        assert!(matches!(err, ImageError::Metadata(_)));
        assert_eq!(err.to_string(), "Failed to save image metadata.");
        assert_eq!(store.len(), 0);
        assert!(repo.list(Some(user)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_cleanup_still_reports_failure() {
        let (db, store, repo) = setup().await;
        let user = testing::user(&db, "ada").await;
        testing::reject_image_inserts(&db).await;
        store.set_fail_remove(true);

        let err = repo.upload(Some(user), webp_file(), input()).await.unwrap_err();
        assert!(matches!(err, ImageError::Metadata(_)));
        // accepted inconsistency: the blob is orphaned
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn list_returns_own_images_newest_first() {
        let (db, _store, repo) = setup().await;
        let ada = testing::user(&db, "ada").await;
        let bob = testing::user(&db, "bob").await;

        let first = repo.upload(Some(ada), webp_file(), input()).await.unwrap();
        let second = repo.upload(Some(ada), webp_file(), input()).await.unwrap();
        repo.upload(Some(bob), webp_file(), input()).await.unwrap();

        let images = repo.list(Some(ada)).await.unwrap();
        let ids: Vec<_> = images.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![second.image_id, first.image_id]);
        assert_eq!(images[0].public_url, second.public_url);
        assert!(repo.list(None).await.is_err());
    }

    #[tokio::test]
    async fn owner_can_delete() {
        let (db, store, repo) = setup().await;
        let ada = testing::user(&db, "ada").await;
        let uploaded = repo.upload(Some(ada), webp_file(), input()).await.unwrap();

        repo.delete(Some(ada), uploaded.image_id).await.unwrap();

        assert!(!store.contains(&uploaded.storage_path));
        assert!(repo.fetch(uploaded.image_id).await.unwrap().is_none());
        assert!(matches!(
            repo.delete(Some(ada), uploaded.image_id).await,
            Err(ImageError::NotFound)
        ));
    }

    #[tokio::test]
    async fn non_owner_cannot_delete() {
        let (db, store, repo) = setup().await;
        let ada = testing::user(&db, "ada").await;
        let bob = testing::user(&db, "bob").await;
        let uploaded = repo.upload(Some(bob), webp_file(), input()).await.unwrap();

        let err = repo.delete(Some(ada), uploaded.image_id).await.unwrap_err();

        assert!(err.to_string().contains("permission"));
        assert!(store.contains(&uploaded.storage_path));
        assert!(repo.fetch(uploaded.image_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn blob_removal_failure_keeps_the_row() {
        let (db, store, repo) = setup().await;
        let ada = testing::user(&db, "ada").await;
        let uploaded = repo.upload(Some(ada), webp_file(), input()).await.unwrap();
        store.set_fail_remove(true);

        let err = repo.delete(Some(ada), uploaded.image_id).await.unwrap_err();
        assert!(matches!(err, ImageError::Remove(_)));
        assert!(repo.fetch(uploaded.image_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn alt_text_updates_are_owner_only() {
        let (db, _store, repo) = setup().await;
        let ada = testing::user(&db, "ada").await;
        let bob = testing::user(&db, "bob").await;
        let uploaded = repo.upload(Some(ada), webp_file(), input()).await.unwrap();

        let update = AltTextUpdate {
            image_id: uploaded.image_id.to_string(),
            alt_text: Some("Sunset".into()),
        };
        repo.update_alt_text(Some(ada), update.clone()).await.unwrap();
        let row = repo.fetch(uploaded.image_id).await.unwrap().unwrap();
        assert_eq!(row.alt_text.as_deref(), Some("Sunset"));

        let err = repo.update_alt_text(Some(bob), update).await.unwrap_err();
        assert!(matches!(err, ImageError::Forbidden("edit")));

        let cleared = AltTextUpdate {
            image_id: uploaded.image_id.to_string(),
            alt_text: Some(String::new()),
        };
        repo.update_alt_text(Some(ada), cleared).await.unwrap();
        let row = repo.fetch(uploaded.image_id).await.unwrap().unwrap();
        assert_eq!(row.alt_text, None);
    }

    #[tokio::test]
    async fn alt_text_update_validates_id() {
        let (_db, _store, repo) = setup().await;
        let err = repo
            .update_alt_text(
                None,
                AltTextUpdate {
                    image_id: "not-a-uuid".into(),
                    alt_text: None,
                },
            )
            .await
            .unwrap_err();
        match err {
            ImageError::Validation(v) => assert_eq!(v.errors.get("imageId").unwrap()[0], "Invalid image ID"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
