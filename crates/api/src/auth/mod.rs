//! Authentication for admin routes

mod middleware;

pub use middleware::{require_admin, token_matches, AuthError};
