//! Project Mutation Pipeline.
//!
//! Field edits and progress notes share one sanitisation path: free text is
//! stripped of markup, links go through [`validate_external_url`], and image
//! references are canonicalised to image ids before anything is persisted.

use crate::{
    auth::AuthUser,
    models::project::{
        ImageRef, MAX_GALLERY_IMAGES, Project, ProjectNote, ProjectOwner, ProjectRow, ProjectStatus,
        Visibility,
    },
    services::{
        object_store::ObjectStore,
        project_store::{NewProjectRow, ProjectChanges, ProjectStore},
        sanitize::{UrlRejection, strip_markup, validate_external_url},
        validation::{FieldErrors, ValidationError, check_length},
    },
};
use chrono::Utc;
use serde::{Deserialize, Deserializer};
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

const NAME_MIN: usize = 2;
const NAME_MAX: usize = 100;
const DESCRIPTION_MIN: usize = 2;
const DESCRIPTION_MAX: usize = 500;

pub const PROJECT_UPDATED: &str = "Project updated!";

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("You must be logged in to {0}.")]
    Unauthenticated(&'static str),
    #[error("Name cannot be blank")]
    BlankName,
    #[error("Description cannot be blank")]
    BlankDescription,
    #[error("Must be valid URL")]
    InvalidUrl(#[source] UrlRejection),
    #[error("Maximum 4 gallery images allowed")]
    GalleryOverflow(usize),
    #[error("No fields to update")]
    NoFields,
    #[error("Project not found.")]
    NotFound,
    #[error("Project update failed")]
    UpdateFailed(#[source] sqlx::Error),
    #[error("Creating Update failed")]
    NoteFailed(#[source] sqlx::Error),
    #[error("Failed to create project.")]
    CreateFailed(#[source] sqlx::Error),
    #[error("Failed to delete project.")]
    DeleteFailed(#[source] sqlx::Error),
    #[error("Failed to fetch project.")]
    Query(#[source] sqlx::Error),
}

pub type ProjectResult<T> = Result<T, ProjectError>;

/// A partial set of project fields. Absent fields are left untouched; an
/// explicit `null` clears `externalUrl` or `primaryImage`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectEdit {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<ProjectStatus>,
    pub visibility: Option<Visibility>,
    #[serde(default, deserialize_with = "present")]
    pub external_url: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub primary_image: Option<Option<ImageRef>>,
    pub gallery_images: Option<Vec<ImageRef>>,
}

/// Distinguishes a field sent as `null` (`Some(None)`) from one left out
/// (`None`, via `#[serde(default)]`).
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl ProjectEdit {
    /// Field constraints checked before the pipeline runs: lengths of the
    /// raw text and the gallery size bound.
    pub fn validate(&self) -> ProjectResult<()> {
        let mut errors = FieldErrors::new();
        if let Some(name) = &self.name {
            check_length(&mut errors, "name", name, NAME_MIN, NAME_MAX, "Name");
        }
        if let Some(description) = &self.description {
            check_length(
                &mut errors,
                "description",
                description,
                DESCRIPTION_MIN,
                DESCRIPTION_MAX,
                "Description",
            );
        }
        errors.into_result()?;

        match &self.gallery_images {
            Some(gallery) if gallery.len() > MAX_GALLERY_IMAGES => {
                Err(ProjectError::GalleryOverflow(gallery.len()))
            }
            _ => Ok(()),
        }
    }
}

/// Field edits plus an optional progress note.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectUpdate {
    pub update: Option<String>,
    #[serde(flatten)]
    pub fields: ProjectEdit,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProject {
    pub name: String,
    pub description: Option<String>,
    pub status: Option<ProjectStatus>,
    pub visibility: Option<Visibility>,
    pub external_url: Option<String>,
}

impl NewProject {
    pub fn validate(&self) -> ProjectResult<()> {
        let mut errors = FieldErrors::new();
        check_length(&mut errors, "name", &self.name, NAME_MIN, NAME_MAX, "Name");
        if let Some(description) = &self.description {
            check_length(
                &mut errors,
                "description",
                description,
                DESCRIPTION_MIN,
                DESCRIPTION_MAX,
                "Description",
            );
        }
        Ok(errors.into_result()?)
    }
}

#[derive(Clone)]
pub struct ProjectPipeline {
    store: Arc<dyn ProjectStore>,
    objects: Arc<dyn ObjectStore>,
}

impl ProjectPipeline {
    pub fn new(store: Arc<dyn ProjectStore>, objects: Arc<dyn ObjectStore>) -> Self {
        Self { store, objects }
    }

    /// Apply a field edit as one update keyed by project and owner.
    pub async fn edit_project(
        &self,
        caller: Option<AuthUser>,
        project_id: Uuid,
        edit: ProjectEdit,
    ) -> ProjectResult<()> {
        edit.validate()?;
        let user = caller.ok_or(ProjectError::Unauthenticated("edit projects"))?;

        let changes = self.prepare(user, &edit).await?;
        if changes.is_empty() {
            return Err(ProjectError::NoFields);
        }

        let updated = self
            .store
            .update_project(user.id, project_id, &changes)
            .await
            .map_err(|err| {
                warn!(%project_id, error = %err, "project update failed");
                ProjectError::UpdateFailed(err)
            })?;
        if !updated {
            return Err(ProjectError::NotFound);
        }

        info!(%project_id, "project edited");
        Ok(())
    }

    /// Record a progress note (when non-empty after sanitisation), apply any
    /// field edits with a fresh modification time, and return the rebuilt
    /// view.
    ///
    /// The note and the field update are separate writes. A failed field
    /// update after a recorded note leaves the note in place.
    pub async fn update_project(
        &self,
        caller: Option<AuthUser>,
        project_id: Uuid,
        update: ProjectUpdate,
    ) -> ProjectResult<Project> {
        update.fields.validate()?;
        let user = caller.ok_or(ProjectError::Unauthenticated("update projects"))?;
        let mut changes = self.prepare(user, &update.fields).await?;

        let note = update
            .update
            .as_deref()
            .map(strip_markup)
            .filter(|note| !note.is_empty());
        if let Some(note) = note {
            let inserted = self
                .store
                .insert_note(user.id, project_id, &note)
                .await
                .map_err(|err| {
                    warn!(%project_id, error = %err, "progress note insert failed");
                    ProjectError::NoteFailed(err)
                })?;
            if !inserted {
                return Err(ProjectError::NotFound);
            }
            info!(%project_id, "progress note recorded");
        }

        changes.updated_at = Some(Utc::now());
        let updated = self
            .store
            .update_project(user.id, project_id, &changes)
            .await
            .map_err(|err| {
                warn!(%project_id, error = %err, "project update failed");
                ProjectError::UpdateFailed(err)
            })?;
        if !updated {
            return Err(ProjectError::NotFound);
        }

        let row = self
            .store
            .fetch_project(project_id)
            .await
            .map_err(ProjectError::Query)?
            .ok_or(ProjectError::NotFound)?;
        self.view(row).await
    }

    pub async fn create_project(
        &self,
        caller: Option<AuthUser>,
        project: NewProject,
    ) -> ProjectResult<Uuid> {
        project.validate()?;
        let user = caller.ok_or(ProjectError::Unauthenticated("create projects"))?;

        let name = sanitize_name(&project.name)?;
        let description = project
            .description
            .as_deref()
            .map(sanitize_description)
            .transpose()?;
        let external_url = project
            .external_url
            .as_deref()
            .map(sanitize_url)
            .transpose()?
            .flatten();

        let row = NewProjectRow {
            id: Uuid::new_v4(),
            owner_id: user.id,
            name,
            description,
            status: project.status.unwrap_or_default(),
            visibility: project.visibility.unwrap_or_default(),
            external_url,
            created_at: Utc::now(),
        };
        self.store
            .insert_project(&row)
            .await
            .map_err(ProjectError::CreateFailed)?;

        info!(project_id = %row.id, owner = %user.id, "project created");
        Ok(row.id)
    }

    /// Project view for `viewer`. Private projects are reported as missing to
    /// everyone but their owner.
    pub async fn get_project(&self, viewer: Option<AuthUser>, project_id: Uuid) -> ProjectResult<Project> {
        let row = self
            .store
            .fetch_project(project_id)
            .await
            .map_err(ProjectError::Query)?
            .filter(|row| visible_to(row, viewer))
            .ok_or(ProjectError::NotFound)?;
        self.view(row).await
    }

    /// Projects of `username` visible to `viewer`, newest first.
    pub async fn list_by_username(
        &self,
        viewer: Option<AuthUser>,
        username: &str,
    ) -> ProjectResult<Vec<Project>> {
        let rows = self
            .store
            .projects_by_username(username)
            .await
            .map_err(ProjectError::Query)?;

        let mut projects = Vec::with_capacity(rows.len());
        for row in rows.into_iter().filter(|row| visible_to(row, viewer)) {
            projects.push(self.view(row).await?);
        }
        Ok(projects)
    }

    /// Delete a project owned by the caller. Notes go with it, images stay.
    pub async fn delete_project(&self, caller: Option<AuthUser>, project_id: Uuid) -> ProjectResult<()> {
        let user = caller.ok_or(ProjectError::Unauthenticated("delete projects"))?;
        let deleted = self
            .store
            .delete_project(user.id, project_id)
            .await
            .map_err(ProjectError::DeleteFailed)?;
        if !deleted {
            return Err(ProjectError::NotFound);
        }
        info!(%project_id, "project deleted");
        Ok(())
    }

    /// Sanitise an edit into column changes. Image references must name
    /// images owned by `user`.
    async fn prepare(&self, user: AuthUser, edit: &ProjectEdit) -> ProjectResult<ProjectChanges> {
        let mut changes = ProjectChanges {
            status: edit.status,
            visibility: edit.visibility,
            ..ProjectChanges::default()
        };

        if let Some(name) = edit.name.as_deref().filter(|s| !s.is_empty()) {
            changes.name = Some(sanitize_name(name)?);
        }
        if let Some(description) = edit.description.as_deref().filter(|s| !s.is_empty()) {
            changes.description = Some(sanitize_description(description)?);
        }
        match &edit.external_url {
            Some(Some(url)) => {
                if let Some(url) = sanitize_url(url)? {
                    changes.external_url = Some(Some(url));
                }
            }
            Some(None) => changes.external_url = Some(None),
            None => {}
        }

        let mut errors = FieldErrors::new();
        match &edit.primary_image {
            Some(Some(primary)) => match self.resolve_ref(user, primary).await? {
                Some(id) => changes.primary_image = Some(Some(id)),
                None => errors.add("primaryImage", "Image not found"),
            },
            Some(None) => changes.primary_image = Some(None),
            None => {}
        }
        if let Some(gallery) = &edit.gallery_images {
            let mut ids = Vec::with_capacity(gallery.len());
            for image in gallery {
                match self.resolve_ref(user, image).await? {
                    Some(id) => ids.push(id),
                    None => errors.add("galleryImages", "Image not found"),
                }
            }
            changes.gallery_images = Some(ids);
        }
        errors.into_result()?;

        Ok(changes)
    }

    /// Canonical image id for a reference. `None` when it does not name an
    /// image stored by `user`.
    async fn resolve_ref(&self, user: AuthUser, image: &ImageRef) -> ProjectResult<Option<Uuid>> {
        let found = match image {
            ImageRef::Id(id) => self
                .store
                .owns_image(user.id, *id)
                .await
                .map(|owned| owned.then_some(*id)),
            ImageRef::Url(url) => match self.objects.path_for_public_url(url) {
                Some(path) => self.store.image_for_path(user.id, &path).await,
                None => Ok(None),
            },
        };
        found.map_err(ProjectError::Query)
    }

    /// Build the view model: image ids resolved to public URLs, notes newest
    /// first. Images that no longer exist are left out.
    async fn view(&self, row: ProjectRow) -> ProjectResult<Project> {
        let notes: Vec<ProjectNote> = self
            .store
            .notes(row.id)
            .await
            .map_err(ProjectError::Query)?;

        let primary_id = row.primary_image_id();
        let gallery_ids = row.gallery_image_ids();
        let mut wanted: Vec<Uuid> = primary_id.into_iter().chain(gallery_ids.iter().copied()).collect();
        wanted.sort_unstable();
        wanted.dedup();

        let paths: HashMap<Uuid, String> = match self.store.image_paths(row.owner_id, &wanted).await {
            Ok(paths) => paths.into_iter().collect(),
            Err(err) => {
                warn!(project_id = %row.id, error = %err, "image lookup failed; omitting images");
                HashMap::new()
            }
        };
        let url_for = |id: &Uuid| paths.get(id).map(|path| self.objects.public_url(path));

        Ok(Project {
            id: row.id,
            owner: ProjectOwner {
                id: row.owner_id,
                username: row.owner_username.clone(),
            },
            visibility: row.visibility(),
            status: row.status.parse().unwrap_or_default(),
            primary_image: primary_id.as_ref().and_then(url_for),
            gallery_images: gallery_ids.iter().filter_map(url_for).collect(),
            name: row.name,
            description: row.description,
            external_url: row.external_url,
            created_at: row.created_at,
            updates: notes,
        })
    }
}

fn visible_to(row: &ProjectRow, viewer: Option<AuthUser>) -> bool {
    row.visibility() == Visibility::Public || viewer.is_some_and(|user| user.id == row.owner_id)
}

/// Length bounds hold for the stored text, so they are checked again after
/// markup is stripped and angle brackets are escaped.
fn sanitize_name(raw: &str) -> ProjectResult<String> {
    let name = strip_markup(raw);
    if name.is_empty() {
        return Err(ProjectError::BlankName);
    }
    let mut errors = FieldErrors::new();
    check_length(&mut errors, "name", &name, NAME_MIN, NAME_MAX, "Name");
    errors.into_result()?;
    Ok(name)
}

fn sanitize_description(raw: &str) -> ProjectResult<String> {
    let description = strip_markup(raw);
    if description.is_empty() {
        return Err(ProjectError::BlankDescription);
    }
    let mut errors = FieldErrors::new();
    check_length(
        &mut errors,
        "description",
        &description,
        DESCRIPTION_MIN,
        DESCRIPTION_MAX,
        "Description",
    );
    errors.into_result()?;
    Ok(description)
}

/// Empty input means "no link supplied".
fn sanitize_url(raw: &str) -> ProjectResult<Option<String>> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    validate_external_url(raw)
        .map(Some)
        .map_err(ProjectError::InvalidUrl)
}
