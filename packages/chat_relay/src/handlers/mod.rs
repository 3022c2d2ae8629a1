pub mod chat;
pub mod health;
pub mod sessions;

// Re-export all handlers for easy route registration
pub use chat::{cancel_chat, resume_chat, submit_chat};
pub use health::{
    health_handler, health_live_handler, health_ready_handler, metrics_handler, stats_handler,
};
pub use sessions::{delete_session, get_session, list_sessions};
