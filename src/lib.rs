//! A forward proxy that rewrites fetched pages so every link, asset and form
//! leads back through `/proxy?url=...`.

pub mod config;
pub mod encoding;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod rewrite;
pub mod session;
pub mod shared;
pub mod sites;
pub mod upstream;

pub use config::Config;
pub use error::{FetchError, ProxyError, TransformError};
pub use proxy::{dispatch, router};
pub use shared::AppState;
