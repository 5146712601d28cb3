pub mod file_validator;
pub mod image_repository;
pub mod image_transcoder;
pub mod object_store;
pub mod project_pipeline;
pub mod project_store;
pub mod query_cache;
pub mod saga;
pub mod sanitize;
pub mod validation;
