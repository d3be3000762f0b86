//! # tandem
//!
//! A small async HTTP server core: typed route templates, an immutable
//! middleware chain and a dispatcher, served over either of two transport
//! shapes (streaming or single-shot) through one normalized interface.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use tandem::config::Settings;
//! use tandem::dispatch::{App, Reply};
//! use tandem::middleware::{ChainBuilder, HandleError, RequestLogging};
//! use tandem::router::Router;
//! use tandem::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Arc::new(Settings::default());
//!
//!     let mut router = Router::new();
//!     router.get("/hello/<name:str>/", |ctx| async move {
//!         let name: String = ctx.param("name")?;
//!         Ok(Reply::json(json!({ "hello": name })))
//!     })?;
//!
//!     let chain = ChainBuilder::new(App::new(router, settings.clone()))
//!         .add_middleware(RequestLogging)
//!         .add_middleware(HandleError)
//!         .build();
//!
//!     Server::bind(&settings.bind_addr).await?.serve(chain).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod middleware;
pub mod router;
pub mod security;
pub mod server;
pub mod testing;
pub mod transport;
pub mod validate;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use config::Settings;
pub use context::{Identity, RequestContext};
pub use dispatch::{App, Reply};
pub use error::{Error, HttpError, Result};
pub use http::{Headers, Method, StatusCode};
pub use middleware::{Chain, ChainBuilder};
pub use router::Router;
pub use server::{Server, ServerError};
