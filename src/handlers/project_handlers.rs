//! HTTP handlers for projects and their progress notes.

use crate::{
    auth::Caller,
    errors::{AppError, UNEXPECTED},
    models::project::Project,
    services::{
        project_pipeline::{NewProject, PROJECT_UPDATED, ProjectEdit, ProjectError, ProjectUpdate},
        query_cache::Mutation,
        sanitize::strip_markup,
        validation::parse_uuid,
    },
    state::{AppState, CachedView, keys},
};
use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::json;
use uuid::Uuid;

fn project_id_from(raw: &str) -> Result<Uuid, AppError> {
    parse_uuid(raw).ok_or_else(|| ProjectError::NotFound.into())
}

/// Best guess of an edit's effect on a cached view, shown until the edit
/// settles.
fn apply_edit(project: &Project, edit: &ProjectEdit) -> Project {
    let mut next = project.clone();
    if let Some(name) = edit.name.as_deref().map(strip_markup).filter(|s| !s.is_empty()) {
        next.name = name;
    }
    if let Some(description) = edit
        .description
        .as_deref()
        .map(strip_markup)
        .filter(|s| !s.is_empty())
    {
        next.description = Some(description);
    }
    if let Some(status) = edit.status {
        next.status = status;
    }
    if let Some(visibility) = edit.visibility {
        next.visibility = visibility;
    }
    if let Some(None) = edit.external_url {
        next.external_url = None;
    }
    if let Some(None) = edit.primary_image {
        next.primary_image = None;
    }
    next
}

/// `POST /projects`
pub async fn create_project(
    State(state): State<AppState>,
    Caller(caller): Caller,
    payload: Result<Json<NewProject>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(project) = payload?;
    let mutation = Mutation::new("create-project").invalidates(keys::projects());
    let project_id = state
        .cache
        .mutate(mutation, async {
            state
                .projects
                .create_project(caller, project)
                .await
                .map_err(AppError::from)
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": "Project created!",
            "projectId": project_id,
        })),
    ))
}

/// `GET /projects/{id}`
pub async fn get_project(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let project_id = project_id_from(&id)?;
    let view = state
        .cache
        .get_or_fetch(keys::project_for(project_id, caller), async {
            let project = state.projects.get_project(caller, project_id).await?;
            Ok::<_, AppError>(CachedView::Project(Box::new(project)))
        })
        .await?;

    let CachedView::Project(project) = view else {
        return Err(AppError::internal(UNEXPECTED));
    };
    Ok(Json(json!({ "success": true, "data": project })))
}

/// `PATCH /projects/{id}` - field edit.
pub async fn edit_project(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    payload: Result<Json<ProjectEdit>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(edit) = payload?;
    let project_id = project_id_from(&id)?;
    // Gallery bound and field lengths fail here, before the pipeline runs.
    edit.validate()?;

    let guess = edit.clone();
    let mutation = Mutation::new("edit-project")
        .optimistic(keys::project_for(project_id, caller), move |view| match view {
            CachedView::Project(project) => CachedView::Project(Box::new(apply_edit(project, &guess))),
            other => other.clone(),
        })
        .invalidates(keys::projects());

    state
        .cache
        .mutate(mutation, async {
            state
                .projects
                .edit_project(caller, project_id, edit)
                .await
                .map_err(AppError::from)
        })
        .await?;

    Ok(Json(json!({ "success": true, "message": PROJECT_UPDATED })))
}

/// `POST /projects/{id}/updates` - progress note plus optional field edits.
pub async fn post_project_update(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
    payload: Result<Json<ProjectUpdate>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(update) = payload?;
    let project_id = project_id_from(&id)?;
    update.fields.validate()?;

    let mutation = Mutation::new("update-project").invalidates(keys::projects());
    let project = state
        .cache
        .mutate(mutation, async {
            state
                .projects
                .update_project(caller, project_id, update)
                .await
                .map_err(AppError::from)
        })
        .await?;

    Ok(Json(json!({
        "success": true,
        "message": "Project updated successfully!",
        "data": project,
    })))
}

/// `DELETE /projects/{id}`
pub async fn delete_project(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let project_id = project_id_from(&id)?;
    let mutation = Mutation::new("delete-project").invalidates(keys::projects());
    state
        .cache
        .mutate(mutation, async {
            state
                .projects
                .delete_project(caller, project_id)
                .await
                .map_err(AppError::from)
        })
        .await?;

    Ok(Json(json!({
        "success": true,
        "message": "Project deleted successfully",
    })))
}

/// `GET /users/{username}/projects`
pub async fn list_user_projects(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(username): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let view = state
        .cache
        .get_or_fetch(keys::user_projects_for(&username, caller), async {
            let projects = state.projects.list_by_username(caller, &username).await?;
            Ok::<_, AppError>(CachedView::Projects(projects))
        })
        .await?;

    let CachedView::Projects(projects) = view else {
        return Err(AppError::internal(UNEXPECTED));
    };
    Ok(Json(json!({ "success": true, "data": projects })))
}
