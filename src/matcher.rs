//! Predicates over (live request, recorded request) and the engine that
//! drives an ordered list of them against a cassette.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use url::Url;

use crate::entry::{body_hash, CassetteEntry, RecordedRequest};

/// Snapshot of a live request. `http_types` bodies are single-shot, so the
/// dispatcher extracts one of these per call and both matching and
/// recording work from it.
#[derive(Debug, Clone)]
pub struct LiveRequest {
    pub method: String,
    pub url: String,
    /// Lowercased header names.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl LiveRequest {
    pub fn body_hash(&self) -> String {
        body_hash(&self.method.to_uppercase(), &self.body)
    }
}

pub trait Matcher: Debug + Send + Sync {
    fn matches(
        &self,
        request: &LiveRequest,
        recorded: &RecordedRequest,
        auth_params: &HashSet<String>,
    ) -> bool;
}

/// Parse, drop auth query parameters, sort the remainder lexicographically
/// by key, and drop an emptied query outright. Host, non-default port,
/// path, and fragment are preserved. Unparseable URLs pass through.
pub fn normalize_url(url: &str, auth_params: &HashSet<String>) -> String {
    let mut parsed = match Url::parse(url) {
        Ok(parsed) => parsed,
        Err(_) => return url.to_string(),
    };

    if parsed.query().is_none() {
        return parsed.to_string();
    }

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !auth_params.contains(&k.to_lowercase()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    if pairs.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear();
        for (key, value) in pairs {
            parsed.query_pairs_mut().append_pair(&key, &value);
        }
    }

    parsed.to_string()
}

#[derive(Debug)]
pub struct MethodMatcher;

impl Matcher for MethodMatcher {
    fn matches(
        &self,
        request: &LiveRequest,
        recorded: &RecordedRequest,
        _: &HashSet<String>,
    ) -> bool {
        request.method.to_uppercase() == recorded.method
    }
}

#[derive(Debug)]
pub struct UriMatcher;

impl Matcher for UriMatcher {
    fn matches(
        &self,
        request: &LiveRequest,
        recorded: &RecordedRequest,
        auth_params: &HashSet<String>,
    ) -> bool {
        normalize_url(&request.url, auth_params) == normalize_url(&recorded.url, auth_params)
    }
}

#[derive(Debug)]
pub struct HostMatcher;

impl Matcher for HostMatcher {
    fn matches(
        &self,
        request: &LiveRequest,
        recorded: &RecordedRequest,
        _: &HashSet<String>,
    ) -> bool {
        match (Url::parse(&request.url), Url::parse(&recorded.url)) {
            (Ok(live), Ok(stored)) => live.host_str() == stored.host_str(),
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct PathMatcher;

impl Matcher for PathMatcher {
    fn matches(
        &self,
        request: &LiveRequest,
        recorded: &RecordedRequest,
        _: &HashSet<String>,
    ) -> bool {
        match (Url::parse(&request.url), Url::parse(&recorded.url)) {
            (Ok(live), Ok(stored)) => live.path() == stored.path(),
            _ => false,
        }
    }
}

/// Every header recorded on the entry must appear in the live request with
/// an equal value. Extra live headers are ignored.
#[derive(Debug)]
pub struct HeadersMatcher;

impl Matcher for HeadersMatcher {
    fn matches(
        &self,
        request: &LiveRequest,
        recorded: &RecordedRequest,
        _: &HashSet<String>,
    ) -> bool {
        recorded
            .headers
            .iter()
            .all(|(name, value)| request.headers.get(name) == Some(value))
    }
}

#[derive(Debug)]
pub struct BodyMatcher;

impl Matcher for BodyMatcher {
    fn matches(
        &self,
        request: &LiveRequest,
        recorded: &RecordedRequest,
        _: &HashSet<String>,
    ) -> bool {
        request.body_hash() == recorded.body_hash
    }
}

type MatcherTable = HashMap<String, Arc<dyn Matcher>>;

static REGISTRY: Lazy<RwLock<MatcherTable>> = Lazy::new(|| {
    let mut table: MatcherTable = HashMap::new();
    table.insert("method".to_string(), Arc::new(MethodMatcher));
    table.insert("uri".to_string(), Arc::new(UriMatcher));
    table.insert("host".to_string(), Arc::new(HostMatcher));
    table.insert("path".to_string(), Arc::new(PathMatcher));
    table.insert("headers".to_string(), Arc::new(HeadersMatcher));
    table.insert("body".to_string(), Arc::new(BodyMatcher));
    RwLock::new(table)
});

/// Register (or replace) a matcher under `name`, process-wide.
pub fn register_matcher(name: impl Into<String>, matcher: Arc<dyn Matcher>) {
    REGISTRY
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .insert(name.into(), matcher);
}

fn lookup_matcher(name: &str) -> Option<Arc<dyn Matcher>> {
    REGISTRY
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .get(name)
        .cloned()
}

/// Applies an ordered list of matchers (by registered name) to find the
/// replay target for a live request.
#[derive(Debug, Clone)]
pub struct MatcherEngine {
    matcher_names: Vec<String>,
    auth_params: HashSet<String>,
}

impl MatcherEngine {
    pub fn new(matcher_names: Vec<String>, auth_params: HashSet<String>) -> Self {
        Self {
            matcher_names,
            auth_params,
        }
    }

    /// The last entry satisfying every matcher in the active list, so
    /// re-recorded episodes shadow their predecessors.
    pub fn find_match<'a>(
        &self,
        request: &LiveRequest,
        entries: &'a [CassetteEntry],
    ) -> Option<&'a CassetteEntry> {
        entries
            .iter()
            .rev()
            .find(|entry| self.matches_entry(request, &entry.req))
    }

    pub fn matches_entry(&self, request: &LiveRequest, recorded: &RecordedRequest) -> bool {
        self.matcher_names.iter().all(|name| {
            let Some(matcher) = lookup_matcher(name) else {
                log::warn!("unknown matcher {name:?}; treating as non-match");
                return false;
            };
            let hit = matcher.matches(request, recorded, &self.auth_params);
            log::debug!(
                "matcher {name} on {} {} vs {} {}: {hit}",
                request.method,
                request.url,
                recorded.method,
                recorded.url
            );
            hit
        })
    }

    /// The recorded request closest to the live URL by edit distance.
    /// Only used to make miss diagnostics actionable.
    pub fn closest_candidate<'a>(
        &self,
        request: &LiveRequest,
        entries: &'a [CassetteEntry],
    ) -> Option<&'a CassetteEntry> {
        entries
            .iter()
            .min_by_key(|entry| levenshtein::levenshtein(&request.url, &entry.req.url))
    }
}
