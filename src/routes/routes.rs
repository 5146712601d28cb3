//! Routes for the image and project API.
//!
//! ## Structure
//! - **Images**
//!   - `POST   /images` - multipart upload
//!   - `GET    /images` - caller's images
//!   - `DELETE /images/{id}` - delete image
//!   - `PATCH  /images/{id}` - update alt text
//!   - `GET    /objects/{*path}` - stored blob (target of public URLs)
//!
//! - **Projects**
//!   - `POST   /projects` - create
//!   - `GET    /projects/{id}` - view model
//!   - `PATCH  /projects/{id}` - field edit
//!   - `DELETE /projects/{id}` - delete
//!   - `POST   /projects/{id}/updates` - progress note plus field edits
//!   - `GET    /users/{username}/projects` - a user's projects

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        image_handlers::{delete_image, list_images, update_alt_text, upload_image},
        object_handlers::get_object,
        project_handlers::{
            create_project, delete_project, edit_project, get_project, list_user_projects,
            post_project_update,
        },
    },
    services::file_validator::MAX_FILE_SIZE,
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, patch, post},
};

/// Room for an oversized file to reach the validator, which reports the
/// size limit in its own words.
const UPLOAD_BODY_LIMIT: usize = 2 * MAX_FILE_SIZE;

pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/images",
            post(upload_image)
                .layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT))
                .get(list_images),
        )
        .route("/images/{id}", patch(update_alt_text).delete(delete_image))
        .route("/objects/{*path}", get(get_object))
        .route("/projects", post(create_project))
        .route(
            "/projects/{id}",
            get(get_project).patch(edit_project).delete(delete_project),
        )
        .route("/projects/{id}/updates", post(post_project_update))
        .route("/users/{username}/projects", get(list_user_projects))
}
