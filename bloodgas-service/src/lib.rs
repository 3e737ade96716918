pub mod models;
pub mod service;
pub mod sessions;
pub mod workflow;

pub use models::*;
pub use service::{AppState, build_router, create_app};
pub use sessions::{SessionHandle, SessionRegistry};
