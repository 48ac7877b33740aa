//! Primary tag construction for incoming requests.
//!
//! Request handlers describe a request once and get back the primary tag
//! set that identifies its cached response. Two requests that agree on
//! these facts are the same cache entry by construction.

use crate::tag::CacheTag;
use crate::tag_set::CacheTagSet;

/// The request facts that participate in cache identity.
#[derive(Debug, Clone, Default)]
pub struct RequestFacts {
    /// Resolved url path of the request.
    pub path: String,
    /// Originally requested path, when rewriting changed it.
    pub requested_path: Option<String>,
    /// Language the response is rendered in.
    pub language: Option<String>,
    /// Authenticated user, when responses differ per user.
    pub user: Option<String>,
    /// Site serving the request. Selects the storage namespace; never part
    /// of the key itself.
    pub site: Option<String>,
    /// Module handling the request, for module-scoped invalidation.
    pub module: Option<String>,
    /// Action within the module.
    pub action: Option<String>,
    /// Query or form parameters, in request order.
    pub parameters: Vec<(String, String)>,
}

impl RequestFacts {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Build the primary tag set for this request.
    ///
    /// Every fact becomes a tag; parameters additionally contribute a
    /// `parameters` count tag, so `/a?x=1` and `/a` never share an entry
    /// even when the parameter tags alone would be a subset.
    pub fn primary_tags(&self) -> CacheTagSet {
        let mut tags = CacheTagSet::new();
        tags.add(CacheTag::url(&self.path));
        if let Some(requested) = &self.requested_path {
            if requested != &self.path {
                tags.add(CacheTag::url(requested));
            }
        }
        if let Some(language) = &self.language {
            tags.add(CacheTag::language(language));
        }
        if let Some(user) = &self.user {
            tags.add(CacheTag::user(user));
        }
        if let Some(site) = &self.site {
            tags.add(CacheTag::site(site));
        }
        if let Some(module) = &self.module {
            tags.add(CacheTag::module(module));
        }
        if let Some(action) = &self.action {
            tags.add(CacheTag::action(action));
        }
        for (name, value) in &self.parameters {
            tags.add(CacheTag::new(name, value));
        }
        tags.add(CacheTag::parameters(self.parameters.len()));
        tags
    }
}
