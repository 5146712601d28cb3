//! Persistence seam for the project pipeline.
//!
//! Every write is keyed by `owner_id` as well as the project id: the owner
//! predicate plays the role of the database permission gate, and a write
//! that matches no row reports `false` rather than an error.

use crate::models::project::{ProjectNote, ProjectRow, ProjectStatus, Visibility};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use uuid::Uuid;

/// Column changes for one project update. `None` leaves a column untouched;
/// `Some(None)` on a nullable column sets it to NULL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectChanges {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<ProjectStatus>,
    pub visibility: Option<Visibility>,
    pub external_url: Option<Option<String>>,
    pub primary_image: Option<Option<Uuid>>,
    pub gallery_images: Option<Vec<Uuid>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProjectChanges {
    /// True when no user-editable column is set (`updated_at` is ignored).
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.status.is_none()
            && self.visibility.is_none()
            && self.external_url.is_none()
            && self.primary_image.is_none()
            && self.gallery_images.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewProjectRow {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub status: ProjectStatus,
    pub visibility: Visibility,
    pub external_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn insert_project(&self, project: &NewProjectRow) -> Result<(), sqlx::Error>;

    /// Apply `changes` to a project owned by `owner_id`. `Ok(false)` when no
    /// such project exists for that owner.
    async fn update_project(
        &self,
        owner_id: Uuid,
        project_id: Uuid,
        changes: &ProjectChanges,
    ) -> Result<bool, sqlx::Error>;

    /// Append a progress note to a project owned by `owner_id`.
    async fn insert_note(
        &self,
        owner_id: Uuid,
        project_id: Uuid,
        body: &str,
    ) -> Result<bool, sqlx::Error>;

    async fn delete_project(&self, owner_id: Uuid, project_id: Uuid) -> Result<bool, sqlx::Error>;

    async fn fetch_project(&self, project_id: Uuid) -> Result<Option<ProjectRow>, sqlx::Error>;

    /// Projects owned by `username`, newest first.
    async fn projects_by_username(&self, username: &str) -> Result<Vec<ProjectRow>, sqlx::Error>;

    /// Notes of a project, newest first.
    async fn notes(&self, project_id: Uuid) -> Result<Vec<ProjectNote>, sqlx::Error>;

    /// `(id, storage_path)` for each image in `ids` that `owner_id` still has.
    async fn image_paths(
        &self,
        owner_id: Uuid,
        ids: &[Uuid],
    ) -> Result<Vec<(Uuid, String)>, sqlx::Error>;

    /// Id of the image `owner_id` stored at `storage_path`.
    async fn image_for_path(
        &self,
        owner_id: Uuid,
        storage_path: &str,
    ) -> Result<Option<Uuid>, sqlx::Error>;

    async fn owns_image(&self, owner_id: Uuid, image_id: Uuid) -> Result<bool, sqlx::Error>;
}

const PROJECT_COLUMNS: &str = "p.id, p.owner_id, pr.username AS owner_username, p.name,
    p.description, p.visibility, p.status, p.external_url, p.primary_image,
    p.gallery_images, p.created_at, p.updated_at";

#[derive(Clone)]
pub struct SqliteProjectStore {
    db: SqlitePool,
}

impl SqliteProjectStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ProjectStore for SqliteProjectStore {
    async fn insert_project(&self, project: &NewProjectRow) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO projects (
                id, owner_id, name, description, visibility, status,
                external_url, primary_image, gallery_images, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, NULL, NULL, ?, ?)",
        )
        .bind(project.id)
        .bind(project.owner_id)
        .bind(&project.name)
        .bind(&project.description)
        .bind(project.visibility.as_str())
        .bind(project.status.as_str())
        .bind(&project.external_url)
        .bind(project.created_at)
        .bind(project.created_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn update_project(
        &self,
        owner_id: Uuid,
        project_id: Uuid,
        changes: &ProjectChanges,
    ) -> Result<bool, sqlx::Error> {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE projects SET updated_at = ");
        builder.push_bind(changes.updated_at.unwrap_or_else(Utc::now));

        if let Some(name) = &changes.name {
            builder.push(", name = ").push_bind(name.clone());
        }
        if let Some(description) = &changes.description {
            builder.push(", description = ").push_bind(description.clone());
        }
        if let Some(status) = changes.status {
            builder.push(", status = ").push_bind(status.as_str());
        }
        if let Some(visibility) = changes.visibility {
            builder.push(", visibility = ").push_bind(visibility.as_str());
        }
        if let Some(url) = &changes.external_url {
            builder.push(", external_url = ").push_bind(url.clone());
        }
        if let Some(primary) = changes.primary_image {
            builder
                .push(", primary_image = ")
                .push_bind(primary.map(|id| id.to_string()));
        }
        if let Some(gallery) = &changes.gallery_images {
            let ids: Vec<String> = gallery.iter().map(Uuid::to_string).collect();
            let json = serde_json::to_string(&ids).map_err(|err| sqlx::Error::Encode(Box::new(err)))?;
            builder.push(", gallery_images = ").push_bind(json);
        }

        builder.push(" WHERE id = ").push_bind(project_id);
        builder.push(" AND owner_id = ").push_bind(owner_id);

        let result = builder.build().execute(&self.db).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_note(
        &self,
        owner_id: Uuid,
        project_id: Uuid,
        body: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO project_updates (id, project_id, body, created_at)
             SELECT ?, id, ?, ? FROM projects WHERE id = ? AND owner_id = ?",
        )
        .bind(Uuid::new_v4())
        .bind(body)
        .bind(Utc::now())
        .bind(project_id)
        .bind(owner_id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_project(&self, owner_id: Uuid, project_id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM projects WHERE id = ? AND owner_id = ?")
            .bind(project_id)
            .bind(owner_id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn fetch_project(&self, project_id: Uuid) -> Result<Option<ProjectRow>, sqlx::Error> {
        sqlx::query_as::<_, ProjectRow>(&format!(
            "SELECT {PROJECT_COLUMNS}
             FROM projects p JOIN profiles pr ON pr.id = p.owner_id
             WHERE p.id = ?"
        ))
        .bind(project_id)
        .fetch_optional(&self.db)
        .await
    }

    async fn projects_by_username(&self, username: &str) -> Result<Vec<ProjectRow>, sqlx::Error> {
        sqlx::query_as::<_, ProjectRow>(&format!(
            "SELECT {PROJECT_COLUMNS}
             FROM projects p JOIN profiles pr ON pr.id = p.owner_id
             WHERE pr.username = ?
             ORDER BY p.created_at DESC, p.rowid DESC"
        ))
        .bind(username)
        .fetch_all(&self.db)
        .await
    }

    async fn notes(&self, project_id: Uuid) -> Result<Vec<ProjectNote>, sqlx::Error> {
        sqlx::query_as::<_, ProjectNote>(
            "SELECT id, project_id, body, created_at
             FROM project_updates
             WHERE project_id = ?
             ORDER BY created_at DESC, rowid DESC",
        )
        .bind(project_id)
        .fetch_all(&self.db)
        .await
    }

    async fn image_paths(
        &self,
        owner_id: Uuid,
        ids: &[Uuid],
    ) -> Result<Vec<(Uuid, String)>, sqlx::Error> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder =
            QueryBuilder::<Sqlite>::new("SELECT id, storage_path FROM images WHERE user_id = ");
        builder.push_bind(owner_id).push(" AND id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        builder.build_query_as().fetch_all(&self.db).await
    }

    async fn image_for_path(
        &self,
        owner_id: Uuid,
        storage_path: &str,
    ) -> Result<Option<Uuid>, sqlx::Error> {
        sqlx::query_scalar("SELECT id FROM images WHERE storage_path = ? AND user_id = ?")
            .bind(storage_path)
            .bind(owner_id)
            .fetch_optional(&self.db)
            .await
    }

    async fn owns_image(&self, owner_id: Uuid, image_id: Uuid) -> Result<bool, sqlx::Error> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM images WHERE id = ? AND user_id = ?")
                .bind(image_id)
                .bind(owner_id)
                .fetch_optional(&self.db)
                .await?;
        Ok(found.is_some())
    }
}
