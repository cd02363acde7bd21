pub mod admin_handlers;
pub mod client;
pub mod health_handlers;
pub mod share_handlers;
