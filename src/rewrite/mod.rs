//! URL rewriting for fetched documents.

pub mod css;
pub mod html;
pub mod js;
pub mod url;

pub use self::css::rewrite_css;
pub use self::html::rewrite_html;
pub use self::js::rewrite_js;
pub use self::url::{proxied, rewrite, PROXY_PATH};
