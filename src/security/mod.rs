//! Security middleware: caller identification and CORS.
//!
//! - [`Authentication`] resolves `scope.current_user` from the
//!   `Authorization` header through an [`IdentityResolver`].
//! - [`Cors`] post-processes captured responses for whitelisted client hosts.

mod auth;
mod cors;

pub use self::auth::{Authentication, IdentityResolver, StaticTokens};
pub use self::cors::Cors;
