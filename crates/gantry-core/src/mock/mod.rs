//! Network mock registry.
//!
//! Canned responses and scripted push-event sequences substituted for
//! real destinations. Lookups are O(1) keyed maps: origin+pathname at
//! the top level, literal search string (or a single default slot when
//! the mock ignores search) below it.
//!
//! Mocks take priority over everything else in the gateway pipeline so
//! tests can shadow real files.

mod loader;
mod push;

pub use loader::{load_mock_dir, load_mock_file};
pub use push::{replay, EventDef, EventOptions, EventStep, PushMessage, StreamProtocol};

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

/// One mock definition file: either a canned response or a push stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MockDefinition {
    Response {
        request: RequestMatcher,
        response: ResponseSpec,
    },
    Stream {
        stream: StreamMatcher,
        #[serde(default)]
        events: Vec<push::EventDef>,
    },
}

/// Request matcher of a response mock.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMatcher {
    /// Full URL; origin + pathname form the lookup key, the search part
    /// selects the variant.
    pub url: String,
    /// File to serve, relative to the mock definition's directory.
    #[serde(default)]
    pub file_path: Option<PathBuf>,
    /// Match regardless of the search string.
    #[serde(default)]
    pub ignore_search: bool,
    /// Remove the mock after its first successful serve.
    #[serde(default)]
    pub once: bool,
}

/// Canned response description.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSpec {
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub status: Option<u16>,
    /// Never respond (simulated stall).
    #[serde(default)]
    pub hang: bool,
    /// 500 with body "error".
    #[serde(default)]
    pub error: bool,
    /// 404 with body "missing".
    #[serde(default)]
    pub missing: bool,
    /// Forcibly abort the connection.
    #[serde(default)]
    pub offline: bool,
}

/// Stream matcher of a push mock.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMatcher {
    pub url: String,
    /// "ws" or "es".
    #[serde(rename = "type")]
    pub protocol: StreamProtocol,
}

/// What the gateway should do for a matched request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    /// Serve this response.
    Respond {
        status: u16,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    },
    /// Never respond.
    Hang,
    /// Abort the connection without a well-formed response.
    Abort,
}

#[derive(Debug, Clone)]
struct StoredResponse {
    spec: ResponseSpec,
    file_path: Option<PathBuf>,
    once: bool,
    /// Directory of the defining mock file; file bodies resolve here.
    base_dir: PathBuf,
}

#[derive(Debug, Default)]
struct ResponseEntry {
    ignore_search: bool,
    /// Literal search string → response. A single empty-string slot
    /// when `ignore_search`.
    variants: HashMap<String, StoredResponse>,
}

/// Registry of response and push-stream mocks.
#[derive(Debug, Default)]
pub struct MockRegistry {
    responses: RwLock<HashMap<String, ResponseEntry>>,
    streams: RwLock<HashMap<String, push::StreamEntry>>,
}

/// Normalize a matcher URL to its `origin + pathname` lookup key and
/// optional search string.
fn split_url(raw: &str) -> Option<(String, Option<String>)> {
    let parsed = url::Url::parse(raw).ok()?;
    let key = format!(
        "{}://{}{}",
        parsed.scheme(),
        parsed.authority(),
        parsed.path()
    );
    Some((key, parsed.query().map(str::to_string)))
}

impl MockRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any mock is registered; request interception is disabled
    /// entirely when none remain.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.responses.read().unwrap().is_empty() || !self.streams.read().unwrap().is_empty()
    }

    /// Register a canned response.
    ///
    /// At most one entry exists per (origin, path, search): a
    /// re-registration replaces the previous variant.
    pub fn add_response(&self, matcher: &RequestMatcher, spec: ResponseSpec, base_dir: PathBuf) {
        let Some((key, search)) = split_url(&matcher.url) else {
            tracing::warn!(url = %matcher.url, "ignoring mock with unparseable url");
            return;
        };

        let mut responses = self.responses.write().unwrap();
        let entry = responses.entry(key).or_default();
        entry.ignore_search = matcher.ignore_search;

        let variant_key = if matcher.ignore_search {
            String::new()
        } else {
            search.unwrap_or_default()
        };
        entry.variants.insert(
            variant_key,
            StoredResponse {
                spec,
                file_path: matcher.file_path.clone(),
                once: matcher.once,
                base_dir,
            },
        );
    }

    /// Register a push-stream mock.
    pub fn add_push_events(&self, matcher: &StreamMatcher, events: Vec<push::EventDef>) {
        let Some((key, _)) = split_url(&matcher.url) else {
            tracing::warn!(url = %matcher.url, "ignoring stream mock with unparseable url");
            return;
        };
        self.streams
            .write()
            .unwrap()
            .insert(key, push::StreamEntry::new(matcher.protocol, events));
    }

    /// Remove one response sub-entry. Returns true if something was
    /// removed.
    pub fn remove(&self, url: &str) -> bool {
        let Some((key, search)) = split_url(url) else {
            return false;
        };
        let mut responses = self.responses.write().unwrap();
        let Some(entry) = responses.get_mut(&key) else {
            return false;
        };
        let variant_key = if entry.ignore_search {
            String::new()
        } else {
            search.unwrap_or_default()
        };
        let removed = entry.variants.remove(&variant_key).is_some();
        if entry.variants.is_empty() {
            responses.remove(&key);
        }
        removed
    }

    /// Match a request and produce its outcome.
    ///
    /// Matching and `once` removal happen under one write-lock
    /// acquisition, so exactly one request can consume a once-entry.
    pub fn match_response(&self, origin: &str, path: &str, search: Option<&str>) -> Option<MockOutcome> {
        let key = format!("{origin}{path}");
        let mut responses = self.responses.write().unwrap();
        let entry = responses.get_mut(&key)?;

        let variant_key = if entry.ignore_search {
            String::new()
        } else {
            search.unwrap_or_default().to_string()
        };

        let stored = entry.variants.get(&variant_key)?.clone();
        if stored.once {
            entry.variants.remove(&variant_key);
            if entry.variants.is_empty() {
                responses.remove(&key);
            }
        }
        drop(responses);

        Some(render(&stored))
    }

    /// Replay sequence for a named event on a mocked stream, or `None`
    /// when the stream (or event) is not mocked. Synchronous: the
    /// caller spawns the actual replay.
    pub fn sequence_for(&self, origin: &str, path: &str, event: &str) -> Option<Vec<EventStep>> {
        let key = format!("{origin}{path}");
        let streams = self.streams.read().unwrap();
        streams.get(&key)?.sequence_for(event)
    }

    /// Protocol of a mocked stream, when one exists.
    #[must_use]
    pub fn stream_protocol(&self, origin: &str, path: &str) -> Option<StreamProtocol> {
        let key = format!("{origin}{path}");
        self.streams.read().unwrap().get(&key).map(push::StreamEntry::protocol)
    }
}

/// Render a stored response into an outcome, merging caller headers over
/// computed defaults (Content-Type from kind, Content-Length from byte
/// length, Date).
fn render(stored: &StoredResponse) -> MockOutcome {
    let spec = &stored.spec;

    if spec.hang {
        return MockOutcome::Hang;
    }
    if spec.offline {
        return MockOutcome::Abort;
    }
    if spec.error {
        return simple(500, "error");
    }
    if spec.missing {
        return simple(404, "missing");
    }

    let (body, default_content_type): (Vec<u8>, &str) = if let Some(rel) = &stored.file_path {
        let full = stored.base_dir.join(rel);
        match std::fs::read(&full) {
            Ok(bytes) => (bytes, content_type_for_path(rel)),
            Err(e) => {
                tracing::warn!(path = %full.display(), error = %e, "mock file body unreadable");
                return simple(404, "missing");
            }
        }
    } else {
        match &spec.body {
            Some(serde_json::Value::String(s)) => (s.clone().into_bytes(), "text/html"),
            Some(value) => (
                serde_json::to_vec(value).unwrap_or_default(),
                "application/json",
            ),
            None => (Vec::new(), "text/plain"),
        }
    };

    let mut headers = vec![
        ("content-type".to_string(), default_content_type.to_string()),
        ("content-length".to_string(), body.len().to_string()),
        ("date".to_string(), http_date()),
    ];
    if let Some(extra) = &spec.headers {
        for (name, value) in extra {
            let lower = name.to_ascii_lowercase();
            headers.retain(|(n, _)| *n != lower);
            headers.push((lower, value.clone()));
        }
    }

    MockOutcome::Respond {
        status: spec.status.unwrap_or(200),
        headers,
        body,
    }
}

fn simple(status: u16, body: &str) -> MockOutcome {
    MockOutcome::Respond {
        status,
        headers: vec![
            ("content-type".to_string(), "text/plain".to_string()),
            ("content-length".to_string(), body.len().to_string()),
            ("date".to_string(), http_date()),
        ],
        body: body.as_bytes().to_vec(),
    }
}

/// RFC 7231 HTTP date.
fn http_date() -> String {
    chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn content_type_for_path(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "html" => "text/html",
        "js" | "mjs" => "application/javascript",
        "json" => "application/json",
        "css" => "text/css",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(url: &str) -> RequestMatcher {
        RequestMatcher {
            url: url.to_string(),
            file_path: None,
            ignore_search: false,
            once: false,
        }
    }

    fn json_spec(value: serde_json::Value) -> ResponseSpec {
        ResponseSpec {
            body: Some(value),
            ..ResponseSpec::default()
        }
    }

    fn respond_parts(outcome: MockOutcome) -> (u16, Vec<(String, String)>, Vec<u8>) {
        match outcome {
            MockOutcome::Respond {
                status,
                headers,
                body,
            } => (status, headers, body),
            other => panic!("expected Respond, got {other:?}"),
        }
    }

    #[test]
    fn json_body_gets_json_defaults() {
        let registry = MockRegistry::new();
        registry.add_response(
            &matcher("http://x/y"),
            json_spec(serde_json::json!({"a": 1})),
            PathBuf::from("."),
        );

        let outcome = registry.match_response("http://x", "/y", None).unwrap();
        let (status, headers, body) = respond_parts(outcome);

        assert_eq!(status, 200);
        assert_eq!(body, br#"{"a":1}"#);
        let get = |n: &str| headers.iter().find(|(k, _)| k == n).map(|(_, v)| v.clone());
        assert_eq!(get("content-type").unwrap(), "application/json");
        assert_eq!(get("content-length").unwrap(), "7");
        assert!(get("date").is_some());
    }

    #[test]
    fn caller_headers_merge_over_defaults() {
        let registry = MockRegistry::new();
        let mut spec = json_spec(serde_json::json!("ok"));
        spec.headers = Some(
            [("Content-Type".to_string(), "text/x-custom".to_string())]
                .into_iter()
                .collect(),
        );
        registry.add_response(&matcher("http://x/y"), spec, PathBuf::from("."));

        let (_, headers, _) = respond_parts(registry.match_response("http://x", "/y", None).unwrap());
        let ct: Vec<_> = headers.iter().filter(|(k, _)| k == "content-type").collect();
        assert_eq!(ct.len(), 1);
        assert_eq!(ct[0].1, "text/x-custom");
    }

    #[test]
    fn search_is_literal_unless_ignored() {
        let registry = MockRegistry::new();
        let mut m = matcher("http://x/q?a=1");
        registry.add_response(&m, json_spec(serde_json::json!(1)), PathBuf::from("."));

        assert!(registry.match_response("http://x", "/q", Some("a=1")).is_some());
        assert!(registry.match_response("http://x", "/q", Some("a=2")).is_none());

        m = matcher("http://x/q?a=1");
        m.ignore_search = true;
        registry.add_response(&m, json_spec(serde_json::json!(1)), PathBuf::from("."));
        assert!(registry.match_response("http://x", "/q", Some("a=2")).is_some());
        assert!(registry.match_response("http://x", "/q", None).is_some());
    }

    #[test]
    fn once_matches_exactly_one_request() {
        let registry = MockRegistry::new();
        let mut m = matcher("http://x/y");
        m.once = true;
        registry.add_response(&m, json_spec(serde_json::json!(1)), PathBuf::from("."));

        assert!(registry.match_response("http://x", "/y", None).is_some());
        assert!(registry.match_response("http://x", "/y", None).is_none());
        assert!(!registry.is_active());
    }

    #[test]
    fn error_missing_hang_offline_outcomes() {
        let registry = MockRegistry::new();
        for (flag, url) in ["error", "missing", "hang", "offline"].iter().zip([
            "http://x/e",
            "http://x/m",
            "http://x/h",
            "http://x/o",
        ]) {
            let spec = ResponseSpec {
                error: *flag == "error",
                missing: *flag == "missing",
                hang: *flag == "hang",
                offline: *flag == "offline",
                ..ResponseSpec::default()
            };
            registry.add_response(&matcher(url), spec, PathBuf::from("."));
        }

        let (status, _, body) = respond_parts(registry.match_response("http://x", "/e", None).unwrap());
        assert_eq!((status, body.as_slice()), (500, b"error".as_slice()));

        let (status, _, body) = respond_parts(registry.match_response("http://x", "/m", None).unwrap());
        assert_eq!((status, body.as_slice()), (404, b"missing".as_slice()));

        assert_eq!(
            registry.match_response("http://x", "/h", None).unwrap(),
            MockOutcome::Hang
        );
        assert_eq!(
            registry.match_response("http://x", "/o", None).unwrap(),
            MockOutcome::Abort
        );
    }

    #[test]
    fn file_body_resolves_against_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("payload.json"), r#"{"ok":true}"#).unwrap();

        let registry = MockRegistry::new();
        let mut m = matcher("http://x/f");
        m.file_path = Some(PathBuf::from("payload.json"));
        registry.add_response(&m, ResponseSpec::default(), dir.path().to_path_buf());

        let (status, headers, body) = respond_parts(registry.match_response("http://x", "/f", None).unwrap());
        assert_eq!(status, 200);
        assert_eq!(body, br#"{"ok":true}"#);
        assert!(headers.iter().any(|(k, v)| k == "content-type" && v == "application/json"));
    }

    #[test]
    fn remove_deletes_one_sub_entry() {
        let registry = MockRegistry::new();
        registry.add_response(&matcher("http://x/a?v=1"), json_spec(serde_json::json!(1)), PathBuf::from("."));
        registry.add_response(&matcher("http://x/a?v=2"), json_spec(serde_json::json!(2)), PathBuf::from("."));

        assert!(registry.remove("http://x/a?v=1"));
        assert!(registry.match_response("http://x", "/a", Some("v=1")).is_none());
        assert!(registry.match_response("http://x", "/a", Some("v=2")).is_some());

        assert!(registry.remove("http://x/a?v=2"));
        assert!(!registry.is_active());
    }

    #[test]
    fn reregistration_replaces_variant() {
        let registry = MockRegistry::new();
        registry.add_response(&matcher("http://x/y"), json_spec(serde_json::json!(1)), PathBuf::from("."));
        registry.add_response(&matcher("http://x/y"), json_spec(serde_json::json!(2)), PathBuf::from("."));

        let (_, _, body) = respond_parts(registry.match_response("http://x", "/y", None).unwrap());
        assert_eq!(body, b"2");
    }
}
