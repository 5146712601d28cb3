//! Shared handler state and the cache namespaces handlers read and mutate.

use crate::{
    auth::AuthUser,
    models::{image::ImageData, project::Project},
    services::{
        image_repository::ImageRepository,
        image_transcoder::ImageTranscoder,
        object_store::ObjectStore,
        project_pipeline::ProjectPipeline,
        project_store::SqliteProjectStore,
        query_cache::{Notifier, QueryCache, QueryKey},
    },
};
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

/// Values held by the view cache.
#[derive(Debug, Clone)]
pub enum CachedView {
    Project(Box<Project>),
    Projects(Vec<Project>),
    Images(Vec<ImageData>),
}

pub type ViewCache = QueryCache<CachedView>;

#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub objects: Arc<dyn ObjectStore>,
    pub images: ImageRepository,
    pub projects: ProjectPipeline,
    pub transcoder: ImageTranscoder,
    pub cache: Arc<ViewCache>,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        objects: Arc<dyn ObjectStore>,
        transcoder: ImageTranscoder,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let project_store = Arc::new(SqliteProjectStore::new(db.clone()));
        Self {
            images: ImageRepository::new(db.clone(), objects.clone()),
            projects: ProjectPipeline::new(project_store, objects.clone()),
            cache: Arc::new(QueryCache::new(notifier)),
            db,
            objects,
            transcoder,
        }
    }
}

/// Cache keys. Project entries are per viewer because visibility depends on
/// who is asking.
pub mod keys {
    use super::*;

    fn viewer_part(viewer: Option<AuthUser>) -> String {
        viewer.map_or_else(|| "anonymous".to_string(), |user| user.id.to_string())
    }

    pub fn projects() -> QueryKey {
        QueryKey::new(["project"])
    }

    pub fn project(id: Uuid) -> QueryKey {
        projects().child(id.to_string())
    }

    pub fn project_for(id: Uuid, viewer: Option<AuthUser>) -> QueryKey {
        project(id).child(viewer_part(viewer))
    }

    pub fn user_projects_for(username: &str, viewer: Option<AuthUser>) -> QueryKey {
        projects()
            .child("user")
            .child(username)
            .child(viewer_part(viewer))
    }

    pub fn images_of(owner: Uuid) -> QueryKey {
        QueryKey::new(["images", "user"]).child(owner.to_string())
    }
}
