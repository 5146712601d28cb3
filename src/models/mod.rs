//! Core data models for images and projects.
//!
//! Row types map onto SQLite tables via `sqlx::FromRow`; view types are what
//! the HTTP layer serialises.

pub mod image;
pub mod project;
