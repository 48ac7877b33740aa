//! The response cache engine.
//!
//! [`ResponseCache`] is an explicit instance shared across request handlers.
//! Each site gets its own storage namespace, created lazily on first use.
//! The start/end operations bracket the rendering of whole responses and of
//! nested response parts; everything in between is captured by the response's
//! frame stack and published atomically on completion.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use metrics::counter;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::entry::CachedEntry;
use crate::error::CacheError;
use crate::handle::CacheHandle;
use crate::lock::{rw_read, rw_write};
use crate::producer::{Claim, GateStatus};
use crate::sink::{CacheableResponse, Transport};
use crate::store::SiteCache;
use crate::tag_set::CacheTagSet;

const SOURCE: &str = "engine";

const METRIC_CACHE_HITS: &str = "fresco_cache_hits_total";
const METRIC_CACHE_MISSES: &str = "fresco_cache_misses_total";
const METRIC_CACHE_STORES: &str = "fresco_cache_stores_total";
const METRIC_CACHE_INVALIDATIONS: &str = "fresco_cache_invalidations_total";

/// Tag-addressed response cache for a multi-site host application.
pub struct ResponseCache {
    config: CacheConfig,
    sites: RwLock<HashMap<String, Arc<SiteCache>>>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            sites: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Wrap an outbound transport for one request. Until a response is
    /// started on it, written bytes pass straight through.
    pub fn wrap(&self, site: impl Into<String>, transport: Box<dyn Transport>) -> CacheableResponse {
        CacheableResponse::new(site, transport)
    }

    /// Begin a cacheable response identified by the given primary tags.
    ///
    /// On a hit the cached status, headers and body are written to the
    /// response and `None` is returned; the caller must not render. On a
    /// miss the caller owns production and receives the handle to finish
    /// with [`end_response`](Self::end_response).
    pub async fn start_response(
        &self,
        tags: &CacheTagSet,
        response: &mut CacheableResponse,
        expires_after: Duration,
        recheck_after: Duration,
    ) -> Result<Option<Arc<CacheHandle>>, CacheError> {
        let handle = Arc::new(CacheHandle::from_primary_tags(
            tags,
            expires_after,
            recheck_after,
        )?);
        self.start_response_with(handle, response).await
    }

    /// Begin a cacheable response under an existing handle.
    pub async fn start_response_with(
        &self,
        handle: Arc<CacheHandle>,
        response: &mut CacheableResponse,
    ) -> Result<Option<Arc<CacheHandle>>, CacheError> {
        if response.depth() > 0 {
            return Err(CacheError::AlreadyStarted);
        }
        self.begin(handle, response, false).await
    }

    /// Begin a nested response part inside the currently building response.
    ///
    /// A part served from cache is recorded as a child of every open frame
    /// and `None` is returned. On a miss the caller renders the part and
    /// finishes with [`end_response_part`](Self::end_response_part).
    pub async fn start_response_part(
        &self,
        tags: &CacheTagSet,
        response: &mut CacheableResponse,
        expires_after: Duration,
        recheck_after: Duration,
    ) -> Result<Option<Arc<CacheHandle>>, CacheError> {
        let handle = Arc::new(CacheHandle::from_primary_tags(
            tags,
            expires_after,
            recheck_after,
        )?);
        self.start_response_part_with(handle, response).await
    }

    /// Begin a nested response part under an existing handle.
    pub async fn start_response_part_with(
        &self,
        handle: Arc<CacheHandle>,
        response: &mut CacheableResponse,
    ) -> Result<Option<Arc<CacheHandle>>, CacheError> {
        if response.depth() == 0 {
            if response.is_invalidated() {
                // The transaction was abandoned; the caller keeps rendering
                // uncached and the matching end call is a no-op.
                return Ok(Some(handle));
            }
            return Err(CacheError::NoActiveResponse);
        }
        self.begin(handle, response, true).await
    }

    /// Finish the whole response and publish it atomically.
    ///
    /// Returns whether an entry was stored. With nothing pending, because
    /// the response was served from cache or the transaction was abandoned,
    /// this is a no-op returning `false`, so callers may bracket rendering
    /// with an unconditional end call. An invalidated or disabled
    /// transaction unwinds without storing.
    pub fn end_response(&self, response: &mut CacheableResponse) -> Result<bool, CacheError> {
        match response.depth() {
            0 => return Ok(false),
            1 => {}
            _ => return Err(CacheError::PartsStillOpen),
        }
        // Depth is 1, so the pop cannot fail.
        let Some(mut frame) = response.pop_frame() else {
            return Err(CacheError::NoActiveResponse);
        };
        let handle = frame.handle().clone();
        let site = self.site(response.site());

        if !frame.store() {
            if let Some(permit) = frame.take_permit() {
                site.gate.release(handle.key(), permit, GateStatus::Failed);
            }
            return Ok(false);
        }

        let entry = CachedEntry::new(
            handle.key().to_string(),
            handle.tags(),
            response.status(),
            response.headers().to_vec(),
            response.modified(),
            frame.body(),
            frame.children().to_vec(),
            handle.expires_after(),
            handle.recheck_after(),
        );
        site.store(entry);
        let permit = frame.take_permit();
        let produce_ms = permit.as_ref().map(|p| p.age().as_millis() as u64);
        if let Some(permit) = permit {
            site.gate.release(handle.key(), permit, GateStatus::Done);
        }
        counter!(METRIC_CACHE_STORES).increment(1);
        debug!(
            cache = "response",
            site = response.site(),
            key = handle.key(),
            produce_ms = ?produce_ms,
            "Response stored"
        );
        Ok(true)
    }

    /// Finish the innermost response part and publish it atomically.
    ///
    /// The handle must be the same `Arc` instance returned by the matching
    /// start call; an equal-keyed clone is rejected.
    pub fn end_response_part(
        &self,
        handle: &Arc<CacheHandle>,
        response: &mut CacheableResponse,
    ) -> Result<bool, CacheError> {
        if response.depth() < 2 {
            if response.is_invalidated() {
                return Ok(false);
            }
            return Err(CacheError::NoActivePart);
        }
        match response.top_handle() {
            Some(top) if Arc::ptr_eq(top, handle) => {}
            _ => return Err(CacheError::HandleMismatch),
        }
        // The top frame was just matched, so the pop cannot fail.
        let Some(mut frame) = response.pop_frame() else {
            return Err(CacheError::NoActivePart);
        };
        let site = self.site(response.site());

        if !frame.store() {
            if let Some(permit) = frame.take_permit() {
                site.gate.release(handle.key(), permit, GateStatus::Failed);
            }
            return Ok(false);
        }

        // Parts carry body bytes only; status and headers belong to the
        // whole response.
        let entry = CachedEntry::new(
            handle.key().to_string(),
            handle.tags(),
            200,
            Vec::new(),
            None,
            frame.body(),
            frame.children().to_vec(),
            handle.expires_after(),
            handle.recheck_after(),
        );
        site.store(entry);
        response.record_child(handle.key());
        if let Some(permit) = frame.take_permit() {
            site.gate.release(handle.key(), permit, GateStatus::Done);
        }
        counter!(METRIC_CACHE_STORES).increment(1);
        Ok(true)
    }

    /// Abandon the response without caching anything.
    ///
    /// Bytes already streamed to the client stay sent; every open frame is
    /// discarded, held producer permits are released, and later start/end
    /// calls on this response become no-ops.
    pub fn invalidate_response(&self, response: &mut CacheableResponse) {
        response.invalidate();
        let site = self.site(response.site());
        while let Some(mut frame) = response.pop_frame() {
            if let Some(permit) = frame.take_permit() {
                site.gate
                    .release(frame.handle().key(), permit, GateStatus::Failed);
            }
        }
        debug!(
            cache = "response",
            site = response.site(),
            "Response invalidated, nothing cached"
        );
    }

    /// Evict every entry of the site whose tag set intersects the query.
    ///
    /// A wildcard tag matches any value of its name. Eviction cascades to
    /// entries embedding an evicted child. Returns the eviction count.
    pub fn invalidate(&self, tags: &CacheTagSet, site: &str) -> usize {
        let Some(cache) = self.existing_site(site) else {
            return 0;
        };
        let evicted = cache.evict_matching(tags);
        if evicted > 0 {
            counter!(METRIC_CACHE_INVALIDATIONS).increment(evicted as u64);
            debug!(
                cache = "response",
                site,
                query = %tags,
                evicted,
                "Entries invalidated by tags"
            );
        }
        evicted
    }

    /// Evict exactly the entry identified by the handle, plus ancestors
    /// embedding it. Returns the eviction count.
    pub fn invalidate_handle(&self, handle: &CacheHandle, site: &str) -> usize {
        let Some(cache) = self.existing_site(site) else {
            return 0;
        };
        let evicted = cache.evict_key(handle.key());
        if evicted > 0 {
            counter!(METRIC_CACHE_INVALIDATIONS).increment(evicted as u64);
        }
        evicted
    }

    /// Advisory warm-up hint: refresh the LRU position of entries matching
    /// the tags so they outlive colder neighbors. Returns how many matched.
    pub fn preload(&self, site: &str, tags: &CacheTagSet) -> usize {
        match self.existing_site(site) {
            Some(cache) => cache.touch_matching(tags),
            None => 0,
        }
    }

    /// Number of entries cached for a site.
    pub fn len(&self, site: &str) -> usize {
        self.existing_site(site).map_or(0, |cache| cache.len())
    }

    /// Drop every entry of a site.
    pub fn clear(&self, site: &str) {
        if let Some(cache) = self.existing_site(site) {
            cache.clear();
        }
    }

    /// Shared begin path for whole responses and parts.
    async fn begin(
        &self,
        handle: Arc<CacheHandle>,
        response: &mut CacheableResponse,
        nested: bool,
    ) -> Result<Option<Arc<CacheHandle>>, CacheError> {
        if !self.config.enabled || response.is_invalidated() {
            response.push_frame(handle.clone(), None, false);
            return Ok(Some(handle));
        }

        let site = self.site(response.site());
        let deadline = Instant::now() + self.config.producer_wait();

        loop {
            if let Some(entry) = site.lookup(handle.key()) {
                counter!(METRIC_CACHE_HITS).increment(1);
                debug!(
                    cache = "response",
                    site = response.site(),
                    key = handle.key(),
                    outcome = "hit",
                    nested,
                    "Serving cached entry"
                );
                if nested {
                    response.serve_part(&entry);
                } else {
                    response.serve_response(&entry);
                }
                return Ok(None);
            }

            match site.gate.claim(handle.key()) {
                Claim::Produce(permit) => {
                    counter!(METRIC_CACHE_MISSES).increment(1);
                    debug!(
                        cache = "response",
                        site = response.site(),
                        key = handle.key(),
                        outcome = "miss",
                        nested,
                        "Producing entry"
                    );
                    response.push_frame(handle.clone(), Some(permit), true);
                    return Ok(Some(handle));
                }
                Claim::Wait(wait) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(Some(produce_untracked(handle, response)));
                    }
                    match wait.wait(remaining).await {
                        GateStatus::Timeout => {
                            warn!(
                                cache = "response",
                                site = response.site(),
                                key = handle.key(),
                                "Producer wait timed out, producing independently"
                            );
                            return Ok(Some(produce_untracked(handle, response)));
                        }
                        // Done: re-lookup and hit. Failed or dangling: the
                        // slot is free again, compete for it.
                        _ => continue,
                    }
                }
            }
        }
    }

    /// Site namespace, created on first use.
    fn site(&self, name: &str) -> Arc<SiteCache> {
        if let Some(cache) = rw_read(&self.sites, SOURCE, "site").get(name) {
            return cache.clone();
        }
        let mut sites = rw_write(&self.sites, SOURCE, "site");
        sites
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(SiteCache::new(self.config.per_site_limit_non_zero())))
            .clone()
    }

    fn existing_site(&self, name: &str) -> Option<Arc<SiteCache>> {
        rw_read(&self.sites, SOURCE, "existing_site")
            .get(name)
            .cloned()
    }
}

/// Produce without a gate permit after the wait budget ran out. The
/// completed entry is still stored; whichever producer finishes last
/// overwrites the key.
fn produce_untracked(
    handle: Arc<CacheHandle>,
    response: &mut CacheableResponse,
) -> Arc<CacheHandle> {
    counter!(METRIC_CACHE_MISSES).increment(1);
    response.push_frame(handle.clone(), None, true);
    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::BufferedTransport;
    use crate::tag::CacheTag;

    fn tags(pairs: &[(&str, &str)]) -> CacheTagSet {
        let mut set = CacheTagSet::new();
        for (name, value) in pairs {
            set.add_tag(*name, *value);
        }
        set
    }

    fn cache() -> ResponseCache {
        ResponseCache::new(CacheConfig::default())
    }

    fn response(cache: &ResponseCache) -> (CacheableResponse, BufferedTransport) {
        let transport = BufferedTransport::new();
        let response = cache.wrap("main", Box::new(transport.clone()));
        (response, transport)
    }

    #[tokio::test]
    async fn produced_response_is_served_on_the_next_request() {
        let cache = cache();
        let page = tags(&[("url", "/a")]);

        let (mut first, _) = response(&cache);
        let handle = cache
            .start_response(&page, &mut first, Duration::from_secs(60), Duration::from_secs(30))
            .await
            .unwrap()
            .expect("first request must produce");
        first.set_header("Content-Type", "text/html");
        first.write(b"<html/>");
        let _ = handle;
        assert!(cache.end_response(&mut first).unwrap());

        let (mut second, transport) = response(&cache);
        let outcome = cache
            .start_response(&page, &mut second, Duration::from_secs(60), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(&transport.body()[..], b"<html/>");
        assert_eq!(transport.status(), 200);
        assert!(
            transport
                .headers()
                .contains(&("Content-Type".to_string(), "text/html".to_string()))
        );
    }

    #[tokio::test]
    async fn disabled_cache_always_produces_and_stores_nothing() {
        let cache = ResponseCache::new(CacheConfig {
            enabled: false,
            ..Default::default()
        });
        let page = tags(&[("url", "/a")]);

        let (mut resp, _) = response(&cache);
        let outcome = cache
            .start_response(&page, &mut resp, Duration::from_secs(60), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(outcome.is_some());
        resp.write(b"body");
        assert!(!cache.end_response(&mut resp).unwrap());
        assert_eq!(cache.len("main"), 0);
    }

    #[tokio::test]
    async fn invalidated_response_stores_nothing_but_keeps_streaming() {
        let cache = cache();
        let page = tags(&[("url", "/a")]);

        let (mut resp, transport) = response(&cache);
        cache
            .start_response(&page, &mut resp, Duration::from_secs(60), Duration::from_secs(30))
            .await
            .unwrap();
        resp.write(b"before");
        cache.invalidate_response(&mut resp);
        resp.write(b"after");
        assert!(!cache.end_response(&mut resp).unwrap());
        assert_eq!(cache.len("main"), 0);
        assert_eq!(&transport.body()[..], b"beforeafter");

        // Later start/end calls are no-ops rather than errors.
        let again = cache
            .start_response(&page, &mut resp, Duration::from_secs(60), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(again.is_some());
        assert!(!cache.end_response(&mut resp).unwrap());
    }

    #[tokio::test]
    async fn lifecycle_misuse_is_rejected() {
        let cache = cache();
        let page = tags(&[("url", "/a")]);

        let (mut resp, _) = response(&cache);
        assert!(matches!(
            cache
                .start_response_part(&page, &mut resp, Duration::from_secs(60), Duration::from_secs(30))
                .await,
            Err(CacheError::NoActiveResponse)
        ));

        cache
            .start_response(&page, &mut resp, Duration::from_secs(60), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(matches!(
            cache
                .start_response(&page, &mut resp, Duration::from_secs(60), Duration::from_secs(30))
                .await,
            Err(CacheError::AlreadyStarted)
        ));
        let part = cache
            .start_response_part(&tags(&[("url", "/a#nav")]), &mut resp, Duration::from_secs(60), Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            cache.end_response(&mut resp),
            Err(CacheError::PartsStillOpen)
        ));

        // An equal-keyed clone is not the active part's handle.
        let clone = Arc::new(
            CacheHandle::from_primary_tags(
                &tags(&[("url", "/a#nav")]),
                Duration::from_secs(60),
                Duration::from_secs(30),
            )
            .unwrap(),
        );
        assert!(matches!(
            cache.end_response_part(&clone, &mut resp),
            Err(CacheError::HandleMismatch)
        ));
        assert!(cache.end_response_part(&part, &mut resp).unwrap());
        assert!(cache.end_response(&mut resp).unwrap());
    }

    #[tokio::test]
    async fn end_response_after_a_hit_is_a_no_op() {
        let cache = cache();
        let page = tags(&[("url", "/a")]);

        let (mut first, _) = response(&cache);
        cache
            .start_response(&page, &mut first, Duration::from_secs(60), Duration::from_secs(30))
            .await
            .unwrap();
        first.write(b"body");
        assert!(cache.end_response(&mut first).unwrap());

        // Cache-served request: nothing is pending, the unconditional end
        // call reports that nothing was stored.
        let (mut second, _) = response(&cache);
        assert!(
            cache
                .start_response(&page, &mut second, Duration::from_secs(60), Duration::from_secs(30))
                .await
                .unwrap()
                .is_none()
        );
        assert!(!cache.end_response(&mut second).unwrap());
        assert_eq!(cache.len("main"), 1);
    }

    #[tokio::test]
    async fn invalidation_by_tags_evicts_matching_entries() {
        let cache = cache();
        let page = tags(&[("url", "/a"), ("resource", "r1")]);

        let (mut resp, _) = response(&cache);
        cache
            .start_response(&page, &mut resp, Duration::from_secs(60), Duration::from_secs(30))
            .await
            .unwrap();
        resp.write(b"body");
        cache.end_response(&mut resp).unwrap();
        assert_eq!(cache.len("main"), 1);

        assert_eq!(cache.invalidate(&tags(&[("resource", "r1")]), "main"), 1);
        assert_eq!(cache.len("main"), 0);
        // Unknown sites are a no-op.
        assert_eq!(cache.invalidate(&tags(&[("resource", "r1")]), "other"), 0);
    }

    #[tokio::test]
    async fn part_invalidation_cascades_to_the_embedding_response() {
        let cache = cache();
        let page = tags(&[("url", "/page")]);
        let nav = tags(&[("url", "/page#nav"), ("resource", "nav-doc")]);

        let (mut resp, _) = response(&cache);
        cache
            .start_response(&page, &mut resp, Duration::from_secs(60), Duration::from_secs(30))
            .await
            .unwrap();
        resp.write(b"<header/>");
        let part = cache
            .start_response_part(&nav, &mut resp, Duration::from_secs(60), Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        resp.write(b"<nav/>");
        cache.end_response_part(&part, &mut resp).unwrap();
        resp.write(b"<footer/>");
        cache.end_response(&mut resp).unwrap();
        assert_eq!(cache.len("main"), 2);

        assert_eq!(cache.invalidate(&tags(&[("resource", "nav-doc")]), "main"), 2);
        assert_eq!(cache.len("main"), 0);
    }

    #[tokio::test]
    async fn served_part_is_recorded_as_child_of_a_new_parent() {
        let cache = cache();
        let nav = tags(&[("url", "/shared#nav"), ("resource", "nav-doc")]);

        // Produce the part inside a first page.
        let (mut first, _) = response(&cache);
        cache
            .start_response(&tags(&[("url", "/a")]), &mut first, Duration::from_secs(60), Duration::from_secs(30))
            .await
            .unwrap();
        let part = cache
            .start_response_part(&nav, &mut first, Duration::from_secs(60), Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        first.write(b"<nav/>");
        cache.end_response_part(&part, &mut first).unwrap();
        cache.end_response(&mut first).unwrap();

        // A second page reuses the cached part.
        let (mut second, transport) = response(&cache);
        cache
            .start_response(&tags(&[("url", "/b")]), &mut second, Duration::from_secs(60), Duration::from_secs(30))
            .await
            .unwrap();
        let served = cache
            .start_response_part(&nav, &mut second, Duration::from_secs(60), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(served.is_none());
        cache.end_response(&mut second).unwrap();
        assert_eq!(&transport.body()[..], b"<nav/>");

        // Invalidating the part takes both pages with it.
        assert_eq!(cache.invalidate(&tags(&[("resource", "nav-doc")]), "main"), 3);
    }

    #[tokio::test]
    async fn sites_are_separate_namespaces() {
        let cache = cache();
        let page = tags(&[("url", "/a")]);

        let mut main = cache.wrap("main", Box::new(BufferedTransport::new()));
        cache
            .start_response(&page, &mut main, Duration::from_secs(60), Duration::from_secs(30))
            .await
            .unwrap();
        main.write(b"main body");
        cache.end_response(&mut main).unwrap();

        // The same tags on another site miss.
        let mut other = cache.wrap("other", Box::new(BufferedTransport::new()));
        let outcome = cache
            .start_response(&page, &mut other, Duration::from_secs(60), Duration::from_secs(30))
            .await
            .unwrap();
        assert!(outcome.is_some());
        assert_eq!(cache.len("main"), 1);
        assert_eq!(cache.len("other"), 0);
    }

    #[tokio::test]
    async fn supplementary_tags_participate_in_invalidation() {
        let cache = cache();
        let page = tags(&[("url", "/a")]);

        let (mut resp, _) = response(&cache);
        let handle = cache
            .start_response(&page, &mut resp, Duration::from_secs(60), Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        handle.add_tag(CacheTag::resource("r9"));
        resp.write(b"body");
        cache.end_response(&mut resp).unwrap();

        assert_eq!(cache.invalidate(&tags(&[("resource", "r9")]), "main"), 1);
    }

    #[tokio::test]
    async fn invalidate_handle_evicts_exactly_that_key() {
        let cache = cache();
        let page = tags(&[("url", "/a")]);

        let (mut resp, _) = response(&cache);
        let handle = cache
            .start_response(&page, &mut resp, Duration::from_secs(60), Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        resp.write(b"body");
        cache.end_response(&mut resp).unwrap();

        assert_eq!(cache.invalidate_handle(&handle, "main"), 1);
        assert_eq!(cache.invalidate_handle(&handle, "main"), 0);
    }

    #[tokio::test]
    async fn preload_reports_matching_entries() {
        let cache = cache();
        let page = tags(&[("url", "/a")]);

        let (mut resp, _) = response(&cache);
        cache
            .start_response(&page, &mut resp, Duration::from_secs(60), Duration::from_secs(30))
            .await
            .unwrap();
        resp.write(b"body");
        cache.end_response(&mut resp).unwrap();

        assert_eq!(cache.preload("main", &tags(&[("url", "/a")])), 1);
        assert_eq!(cache.preload("missing", &tags(&[("url", "/a")])), 0);
    }
}
