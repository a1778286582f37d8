//! Strips secrets from everything that gets persisted: URL query
//! parameters, headers, and response bodies.
//!
//! Layer order during recording: user-registered filters and per-test
//! [`CustomRedactor`]s run first, then the built-in layers (auth params in
//! the URL, auth headers, JSON key walk, raw pattern scrub).

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use url::Url;

/// Placeholder written wherever a secret used to be. URL-encoded when it
/// lands in a query string.
pub const REDACTED: &str = "<REDACTED>";

/// Key substrings that mark a JSON value as sensitive regardless of the
/// configured auth-parameter set.
const SENSITIVE_KEY_FRAGMENTS: &[&str] = &["token", "key", "secret", "password"];

static SECRET_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"Bearer \w+",
        r"ghp_[A-Za-z0-9]{40}",
        r"sk_[A-Za-z0-9]+",
        r"pk_[A-Za-z0-9]+",
        r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-4[0-9a-fA-F]{3}-[89abAB][0-9a-fA-F]{3}-[0-9a-fA-F]{12}",
        r"[A-Za-z0-9]{32,}",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("built-in secret pattern"))
    .collect()
});

/// Per-test redaction hooks. Every method defaults to a no-op; implement
/// only the surfaces the test needs to rewrite. These run before the
/// built-in layers and receive decoded structures.
pub trait CustomRedactor: Debug + Send + Sync {
    fn redact_url(&self, _url: &mut String) {}
    fn redact_request_headers(&self, _headers: &mut HashMap<String, String>) {}
    fn redact_response_headers(&self, _headers: &mut HashMap<String, String>) {}
    fn redact_response_json(&self, _body: &mut Value) {}
    fn redact_response_body(&self, _body: &mut String) {}
}

#[derive(Debug, Clone)]
pub struct Redactor {
    auth_params: HashSet<String>,
    auth_headers: HashSet<String>,
    /// `(placeholder, secret value)` pairs registered by the user.
    user_filters: Vec<(String, String)>,
    custom: Vec<Arc<dyn CustomRedactor>>,
}

impl Redactor {
    pub fn new(auth_params: HashSet<String>, auth_headers: HashSet<String>) -> Self {
        Self {
            auth_params,
            auth_headers,
            user_filters: Vec::new(),
            custom: Vec::new(),
        }
    }

    /// Register a `(placeholder, value)` filter: any occurrence of `value`
    /// in URL, header, or body text becomes `placeholder`.
    pub fn add_user_filter(&mut self, placeholder: impl Into<String>, value: impl Into<String>) {
        self.user_filters.push((placeholder.into(), value.into()));
    }

    pub fn add_custom(&mut self, redactor: Arc<dyn CustomRedactor>) {
        self.custom.push(redactor);
    }

    fn apply_user_filters(&self, mut text: String) -> String {
        for (placeholder, value) in &self.user_filters {
            if !value.is_empty() {
                text = text.replace(value, placeholder);
            }
        }
        text
    }

    /// Replace the value of every auth query parameter with [`REDACTED`].
    /// Parameter order is preserved; unparseable URLs pass through.
    pub fn redact_url(&self, url: &str) -> String {
        let mut url_string = self.apply_user_filters(url.to_string());
        for custom in &self.custom {
            custom.redact_url(&mut url_string);
        }

        let mut parsed = match Url::parse(&url_string) {
            Ok(parsed) => parsed,
            Err(_) => return url_string,
        };

        if parsed.query().is_none() {
            return url_string;
        }

        let query = parsed
            .query_pairs()
            .map(|(k, v)| {
                let value = if self.auth_params.contains(&k.to_lowercase()) {
                    REDACTED.into()
                } else {
                    v
                };
                format!("{}={}", urlencoding::encode(&k), urlencoding::encode(&value))
            })
            .collect::<Vec<_>>()
            .join("&");
        parsed.set_query(Some(&query));

        parsed.to_string()
    }

    pub fn redact_request_headers(&self, headers: &mut HashMap<String, String>) {
        self.filter_header_values(headers);
        for custom in &self.custom {
            custom.redact_request_headers(headers);
        }
        self.mask_auth_headers(headers);
    }

    pub fn redact_response_headers(&self, headers: &mut HashMap<String, String>) {
        self.filter_header_values(headers);
        for custom in &self.custom {
            custom.redact_response_headers(headers);
        }
        self.mask_auth_headers(headers);
    }

    fn filter_header_values(&self, headers: &mut HashMap<String, String>) {
        for value in headers.values_mut() {
            *value = self.apply_user_filters(std::mem::take(value));
        }
    }

    fn mask_auth_headers(&self, headers: &mut HashMap<String, String>) {
        for (name, value) in headers.iter_mut() {
            if self.auth_headers.contains(&name.to_lowercase()) {
                *value = REDACTED.to_string();
            }
        }
    }

    /// Redact a response body. JSON mappings get a recursive key walk;
    /// anything else gets the raw pattern scrub.
    pub fn redact_response_body(&self, body: &str) -> String {
        let mut body = self.apply_user_filters(body.to_string());
        for custom in &self.custom {
            custom.redact_response_body(&mut body);
        }

        match serde_json::from_str::<Value>(&body) {
            Ok(mut value) if value.is_object() => {
                for custom in &self.custom {
                    custom.redact_response_json(&mut value);
                }
                self.redact_json_value(&mut value);
                serde_json::to_string(&value).unwrap_or(body)
            }
            _ => self.scrub_patterns(&body),
        }
    }

    fn redact_json_value(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (key, entry) in map.iter_mut() {
                    if self.is_sensitive_key(key) {
                        *entry = Value::String(REDACTED.to_string());
                    } else {
                        self.redact_json_value(entry);
                    }
                }
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.redact_json_value(item);
                }
            }
            _ => {}
        }
    }

    fn is_sensitive_key(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        self.auth_params.contains(&key)
            || SENSITIVE_KEY_FRAGMENTS
                .iter()
                .any(|fragment| key.contains(fragment))
    }

    fn scrub_patterns(&self, text: &str) -> String {
        let mut scrubbed = text.to_string();
        for pattern in SECRET_PATTERNS.iter() {
            scrubbed = pattern.replace_all(&scrubbed, REDACTED).into_owned();
        }
        scrubbed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redactor() -> Redactor {
        let params = ["token", "api_key", "apikey", "access_token", "key"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let headers = ["authorization", "cookie", "x-api-key"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        Redactor::new(params, headers)
    }

    #[test]
    fn url_auth_params_masked_and_encoded() {
        let redacted = redactor().redact_url("https://api.example.com/x?token=SECRET&u=1");
        assert!(redacted.contains("token=%3CREDACTED%3E"));
        assert!(redacted.contains("u=1"));
        assert!(!redacted.contains("SECRET"));
    }

    #[test]
    fn url_without_secrets_is_identity() {
        let url = "https://api.example.com/users?page=2&sort=name";
        assert_eq!(redactor().redact_url(url), url);
    }

    #[test]
    fn auth_headers_masked_case_insensitively() {
        let mut headers = HashMap::from([
            ("Authorization".to_string(), "Bearer abc".to_string()),
            ("accept".to_string(), "application/json".to_string()),
        ]);
        redactor().redact_request_headers(&mut headers);
        assert_eq!(headers["Authorization"], REDACTED);
        assert_eq!(headers["accept"], "application/json");
    }

    #[test]
    fn json_body_walk_masks_sensitive_keys_only() {
        let body = r#"{"api_key":"K","name":"n","nested":{"password":"p","ok":true}}"#;
        let redacted = redactor().redact_response_body(body);
        let value: Value = serde_json::from_str(&redacted).unwrap();
        assert_eq!(value["api_key"], REDACTED);
        assert_eq!(value["name"], "n");
        assert_eq!(value["nested"]["password"], REDACTED);
        assert_eq!(value["nested"]["ok"], true);
    }

    #[test]
    fn raw_patterns_scrubbed_when_not_json() {
        let redacted = redactor().redact_response_body("auth: Bearer abc123 end");
        assert!(!redacted.contains("Bearer abc123"));
        assert!(redacted.contains(REDACTED));

        let long_token = "a".repeat(40);
        let redacted = redactor().redact_response_body(&format!("id {long_token} tail"));
        assert_eq!(redacted, format!("id {REDACTED} tail"));
    }

    #[test]
    fn body_without_secrets_is_identity() {
        let body = "plain text, nothing sensitive here";
        assert_eq!(redactor().redact_response_body(body), body);
    }

    #[test]
    fn normalization_commutes_with_redaction() {
        let auth: HashSet<String> = ["token", "api_key", "apikey", "access_token", "key"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let url = "https://api.example.com/x?b=2&token=SECRET&a=1";

        let redacted_then_normalized =
            crate::matcher::normalize_url(&redactor().redact_url(url), &auth);
        let normalized_directly = crate::matcher::normalize_url(url, &auth);
        assert_eq!(redacted_then_normalized, normalized_directly);
    }

    #[test]
    fn user_filters_run_before_builtins() {
        let mut r = redactor();
        r.add_user_filter("<HOSTNAME>", "internal.corp.example");
        let redacted = r.redact_url("https://internal.corp.example/path?u=1");
        assert!(redacted.starts_with("https://<HOSTNAME>/path") || redacted.contains("%3CHOSTNAME%3E"));
    }
}
