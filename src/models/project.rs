//! Projects, their progress notes, and image references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Upper bound on gallery images per project.
pub const MAX_GALLERY_IMAGES: usize = 4;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectStatus {
    #[default]
    Planning,
    InProgress,
    OnHold,
    Completed,
    Launched,
}

impl ProjectStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::InProgress => "in-progress",
            Self::OnHold => "on-hold",
            Self::Completed => "completed",
            Self::Launched => "launched",
        }
    }
}

impl FromStr for ProjectStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planning" => Ok(Self::Planning),
            "in-progress" => Ok(Self::InProgress),
            "on-hold" => Ok(Self::OnHold),
            "completed" => Ok(Self::Completed),
            "launched" => Ok(Self::Launched),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Private => "private",
        }
    }
}

impl FromStr for Visibility {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Self::Public),
            "private" => Ok(Self::Private),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown value `{}`", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

/// Reference to an image from a project field.
///
/// Clients may name an image by id or by the public URL they were given.
/// Persisted references are always ids.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum ImageRef {
    Id(Uuid),
    Url(String),
}

/// Raw `projects` row joined with the owner's username.
#[derive(Clone, FromRow, Debug)]
pub struct ProjectRow {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub owner_username: String,
    pub name: String,
    pub description: Option<String>,
    pub visibility: String,
    pub status: String,
    pub external_url: Option<String>,
    /// Image id, as text.
    pub primary_image: Option<String>,
    /// JSON array of image ids.
    pub gallery_images: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectRow {
    pub fn primary_image_id(&self) -> Option<Uuid> {
        self.primary_image
            .as_deref()
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    /// Gallery ids in stored order. Unparseable entries are skipped.
    pub fn gallery_image_ids(&self) -> Vec<Uuid> {
        self.gallery_images
            .as_deref()
            .and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
            .unwrap_or_default()
            .iter()
            .filter_map(|s| Uuid::parse_str(s).ok())
            .collect()
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility.parse().unwrap_or(Visibility::Private)
    }
}

/// An immutable progress note attached to a project.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectNote {
    pub id: Uuid,
    pub project_id: Uuid,
    #[serde(rename = "update")]
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProjectOwner {
    pub id: Uuid,
    pub username: String,
}

/// Project view model with image references resolved to public URLs and
/// notes ordered newest first.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: Uuid,
    pub owner: ProjectOwner,
    pub name: String,
    pub description: Option<String>,
    pub visibility: Visibility,
    pub status: ProjectStatus,
    pub external_url: Option<String>,
    pub primary_image: Option<String>,
    pub gallery_images: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updates: Vec<ProjectNote>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_round_trip_through_text() {
        for status in [
            ProjectStatus::Planning,
            ProjectStatus::InProgress,
            ProjectStatus::OnHold,
            ProjectStatus::Completed,
            ProjectStatus::Launched,
        ] {
            assert_eq!(status.as_str().parse::<ProjectStatus>(), Ok(status));
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                serde_json::Value::from(status.as_str())
            );
        }
        assert!("archived".parse::<ProjectStatus>().is_err());
        assert_eq!("private".parse::<Visibility>(), Ok(Visibility::Private));
    }

    #[test]
    fn image_ref_is_tagged() {
        let id = Uuid::new_v4();
        let json = serde_json::to_value(ImageRef::Id(id)).unwrap();
        assert_eq!(json["kind"], "id");
        assert_eq!(json["value"], id.to_string());

        let parsed: ImageRef =
            serde_json::from_str(r#"{"kind":"url","value":"https://cdn.test/objects/a.webp"}"#)
                .unwrap();
        assert_eq!(parsed, ImageRef::Url("https://cdn.test/objects/a.webp".into()));
    }

    #[test]
    fn gallery_ids_parse_from_json() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let row = ProjectRow {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            owner_username: "ada".into(),
            name: "Engine".into(),
            description: None,
            visibility: "public".into(),
            status: "planning".into(),
            external_url: None,
            primary_image: Some(a.to_string()),
            gallery_images: Some(format!(r#"["{b}","not-a-uuid","{a}"]"#)),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(row.primary_image_id(), Some(a));
        assert_eq!(row.gallery_image_ids(), vec![b, a]);
    }
}
