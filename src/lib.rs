//! Fresco: a tag-addressed response cache for multi-site CMS hosts.
//!
//! Rendered HTTP responses and the parts they are composed of are cached
//! under handles derived from descriptive tags (url, language, user, the
//! resources touched while rendering, ...). Invalidation is by tag query:
//! when a resource changes, everything whose rendering depended on it is
//! evicted, including the responses embedding an evicted part.
//!
//! ## Usage
//!
//! ```no_run
//! # async fn handle() -> Result<(), fresco::CacheError> {
//! use std::sync::Arc;
//! use fresco::{BufferedTransport, CacheConfig, RequestFacts, ResponseCache};
//!
//! let cache = Arc::new(ResponseCache::new(CacheConfig::default()));
//!
//! let facts = RequestFacts::new("/home");
//! let mut response = cache.wrap("main", Box::new(BufferedTransport::new()));
//! match cache
//!     .start_response(
//!         &facts.primary_tags(),
//!         &mut response,
//!         fresco::DEFAULT_EXPIRES,
//!         fresco::DEFAULT_RECHECK,
//!     )
//!     .await?
//! {
//!     None => {} // served from cache
//!     Some(handle) => {
//!         response.write(b"<html/>");
//!         handle.add_tag_value("resource", "home-page");
//!         cache.end_response(&mut response)?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! [`CacheConfig`] deserializes from the host application's configuration
//! file, typically a `[cache]` table:
//!
//! ```toml
//! [cache]
//! enabled = true
//! per_site_limit = 200
//! producer_wait_ms = 5000
//! ```

mod config;
mod dispatch;
mod engine;
mod entry;
mod error;
mod events;
mod handle;
mod index;
mod lock;
mod producer;
mod sink;
mod store;
mod tag;
mod tag_set;
mod trigger;

pub use config::CacheConfig;
pub use dispatch::RequestFacts;
pub use engine::ResponseCache;
pub use entry::CachedEntry;
pub use error::{CacheError, HandleError};
pub use events::{Epoch, EventQueue, InvalidationEvent};
pub use handle::{CacheHandle, DEFAULT_EXPIRES, DEFAULT_RECHECK};
pub use sink::{BufferedTransport, CacheableResponse, Transport};
pub use tag::{
    CacheTag, IncomparableTags, TAG_ACTION, TAG_LANGUAGE, TAG_MODULE, TAG_PARAMETERS,
    TAG_RESOURCE, TAG_SITE, TAG_URL, TAG_USER,
};
pub use tag_set::CacheTagSet;
pub use trigger::CacheTrigger;
