pub mod health_handlers;
pub mod image_handlers;
pub mod object_handlers;
pub mod project_handlers;
