//! Field-keyed validation results.
//!
//! Input schemas report every failing field at once so callers can map each
//! entry back onto the form that produced it.

use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// `field -> [messages]`, ordered by field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FieldErrors(BTreeMap<String, Vec<String>>);

impl FieldErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.entry(field.into()).or_default().push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// `Ok(())` when nothing was recorded, otherwise a [`ValidationError`].
    pub fn into_result(self) -> Result<(), ValidationError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::new(self))
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Validation failed")]
pub struct ValidationError {
    pub errors: FieldErrors,
}

impl ValidationError {
    pub fn new(errors: FieldErrors) -> Self {
        Self { errors }
    }

    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = FieldErrors::new();
        errors.add(field, message);
        Self::new(errors)
    }
}

/// Record an error when `value` is shorter than `min` or longer than `max`
/// characters.
pub fn check_length(
    errors: &mut FieldErrors,
    field: &str,
    value: &str,
    min: usize,
    max: usize,
    label: &str,
) {
    let len = value.chars().count();
    if len < min {
        if min == 1 {
            errors.add(field, format!("{label} is required"));
        } else {
            errors.add(field, format!("{label} must be at least {min} characters"));
        }
    } else if len > max {
        errors.add(field, format!("{label} must be no more than {max} characters"));
    }
}

/// Parse a UUID-shaped identifier (hyphenated form only).
pub fn parse_uuid(value: &str) -> Option<Uuid> {
    if value.len() != 36 {
        return None;
    }
    Uuid::parse_str(value).ok()
}
