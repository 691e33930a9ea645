//! HTTP + SSE surface of the quill session engine: JSON endpoints for
//! projects, sessions, prompts and permissions, plus the `/event` stream
//! fanning every bus event out to connected front-ends.

pub mod error;
pub mod files;
pub mod routes;
pub mod server;
pub mod sse;

pub use routes::AppState;
pub use server::{build_router, start, ServerConfig, ServerHandle};
