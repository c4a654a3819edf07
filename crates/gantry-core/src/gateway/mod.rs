//! Request gateway: composes mocks, bundling, static serving,
//! transforms and forwarding into one axum router.
//!
//! Pipeline order per request is fixed: mock match, bundle-cache URL,
//! static file (patched), transpile, forward to the application.
//! Reserved paths live under `/__gantry/` plus `/__deps/` for bundle
//! artifacts.

mod streams;

use crate::app::AppSupervisor;
use crate::bundle::Bundler;
use crate::config::{GatewayConfig, InjectConfig};
use crate::mock::{MockOutcome, MockRegistry};
use crate::patch::ResponsePatcher;
use crate::reload::ReloadBroadcaster;
use crate::resolver::{is_bare_specifier, is_builtin};
use crate::transform::TransformCache;
use crate::watch::{WatchCoordinator, WatchSet};
use axum::body::Body;
use axum::extract::{Path as UrlPath, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

type SharedState = Arc<GatewayState>;

/// Everything a request handler can reach.
pub struct GatewayState {
    pub root: PathBuf,
    pub static_dirs: Vec<PathBuf>,
    pub spa_fallback: bool,
    pub mocks: Arc<MockRegistry>,
    pub bundler: Option<Arc<Bundler>>,
    pub transforms: Option<Arc<TransformCache>>,
    pub patcher: ResponsePatcher,
    pub broadcaster: ReloadBroadcaster,
    pub supervisor: Option<Arc<AppSupervisor>>,
    pub coordinator: Option<Arc<WatchCoordinator>>,
    pub watch: Option<Arc<WatchSet>>,
    client: reqwest::Client,
}

impl GatewayState {
    /// Bare state over a project root; callers attach components before
    /// wrapping it in an `Arc`.
    #[must_use]
    pub fn new(root: PathBuf, config: &GatewayConfig) -> Self {
        let static_dirs: Vec<PathBuf> = config
            .static_dirs
            .iter()
            .map(|d| if d.is_absolute() { d.clone() } else { root.join(d) })
            .collect();
        Self {
            spa_fallback: config.spa_fallback.unwrap_or(!static_dirs.is_empty()),
            static_dirs,
            root,
            mocks: Arc::new(MockRegistry::new()),
            bundler: None,
            transforms: None,
            patcher: default_patcher(&config.inject),
            broadcaster: ReloadBroadcaster::new(),
            supervisor: None,
            coordinator: None,
            watch: None,
            client: reqwest::Client::new(),
        }
    }
}

/// Patcher preloaded with the reload client runtime and the configured
/// injection scripts.
#[must_use]
pub fn default_patcher(inject: &InjectConfig) -> ResponsePatcher {
    let mut patcher = ResponsePatcher::new();
    patcher.inject_body(format!("<script>{}</script>", crate::reload::client_runtime()));
    for script in &inject.head {
        patcher.inject_head(script.clone());
    }
    for script in &inject.body {
        patcher.inject_body(script.clone());
    }
    patcher
}

/// Build the gateway router.
#[must_use]
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/__gantry/reload", get(streams::reload_events))
        .route("/__gantry/ws", get(streams::ws_stream))
        .route("/__gantry/es", get(streams::es_stream))
        .route("/__deps/*artifact", get(serve_dep))
        .fallback(handle_request)
        .with_state(state)
}

async fn handle_request(State(state): State<SharedState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(str::to_string);

    if state.mocks.is_active() {
        let origin = request_origin(&parts.headers);
        if let Some(outcome) = state
            .mocks
            .match_response(&origin, &path, query.as_deref())
        {
            tracing::debug!(%path, "request served by mock");
            return mock_response(outcome).await;
        }
    }

    if parts.method == Method::GET {
        let if_none_match = parts
            .headers
            .get(header::IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(response) = state.serve_static(&path, if_none_match.as_deref()).await {
            return response;
        }
    }

    let method = parts.method.clone();
    if let Some(response) = state.forward(parts, body, &path, query.as_deref()).await {
        return response;
    }

    state.spa_or_not_found(&method, &path).await
}

/// `/__deps/{stem}.js`: await the bundle, then serve it with its bare
/// imports rewritten to further dep URLs.
async fn serve_dep(State(state): State<SharedState>, UrlPath(artifact): UrlPath<String>) -> Response {
    let Some(bundler) = &state.bundler else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let stem = artifact.trim_end_matches(".js");
    let output = match bundler.bundle_stem(stem).await {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!(%stem, error = %e, "bundle request failed");
            return (StatusCode::NOT_FOUND, format!("cannot bundle {stem}")).into_response();
        }
    };
    let code = match tokio::fs::read_to_string(&output).await {
        Ok(code) => code,
        Err(e) => {
            tracing::warn!(path = %output.display(), error = %e, "bundle artifact unreadable");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    let rewritten = state.patcher.patch_js(&code, &|spec| state.dep_url(spec));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/javascript")
        // Content-addressed artifacts never change under the same URL.
        .header(header::CACHE_CONTROL, "public, max-age=31536000, immutable")
        .body(Body::from(rewritten))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

impl GatewayState {
    /// Dep URL for a bare, non-builtin specifier, when a bundler is
    /// configured.
    fn dep_url(&self, spec: &str) -> Option<String> {
        if !is_bare_specifier(spec) || is_builtin(spec) {
            return None;
        }
        self.bundler.as_ref()?.dep_url(spec)
    }

    /// Serve a file from the static directories, patched, with ETag
    /// revalidation. `None` means the path maps to no static file.
    async fn serve_static(&self, url_path: &str, if_none_match: Option<&str>) -> Option<Response> {
        let rel = sanitize_url_path(url_path)?;
        for dir in &self.static_dirs {
            let file = dir.join(&rel);
            if !file.is_file() {
                continue;
            }
            return Some(self.serve_file(&file, url_path, if_none_match).await);
        }
        None
    }

    async fn serve_file(&self, file: &Path, url_path: &str, if_none_match: Option<&str>) -> Response {
        if let Some(watch) = &self.watch {
            watch.add(file);
        }
        if let Some(coordinator) = &self.coordinator {
            coordinator.record_served_url(file, url_path);
        }

        // Transpile step of the pipeline, applied to the matched file.
        if let Some(transforms) = &self.transforms {
            if transforms.handles(file) {
                if let Some(code) = transforms.get(file).await {
                    let patched = self.patcher.patch_js(&code, &|spec| self.dep_url(spec));
                    return text_response(patched.into_bytes(), "application/javascript", if_none_match);
                }
            }
        }

        let bytes = match tokio::fs::read(file).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(path = %file.display(), error = %e, "static read failed");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };

        let content_type = content_type_for(file);
        match content_type {
            "text/html" => {
                let html = String::from_utf8_lossy(&bytes);
                let patched = self.patcher.patch_html(&html);
                text_response(patched.into_bytes(), content_type, if_none_match)
            }
            "application/javascript" => {
                let code = String::from_utf8_lossy(&bytes);
                let patched = self.patcher.patch_js(&code, &|spec| self.dep_url(spec));
                text_response(patched.into_bytes(), content_type, if_none_match)
            }
            _ => text_response(bytes, content_type, if_none_match),
        }
    }

    /// Forward to the supervised application. `None` when no app is
    /// configured; errors become 502 so the gateway itself survives.
    async fn forward(
        &self,
        parts: axum::http::request::Parts,
        body: Body,
        path: &str,
        query: Option<&str>,
    ) -> Option<Response> {
        let supervisor = self.supervisor.as_ref()?;
        let port = supervisor.current_port().await?;

        let mut target_path = path.to_string();
        let mut headers = parts.headers.clone();
        normalize_js_request(&mut target_path, &mut headers);

        let mut url = format!("http://127.0.0.1:{port}{target_path}");
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
        }

        let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "request body read failed");
                return Some(StatusCode::BAD_REQUEST.into_response());
            }
        };

        headers.remove(header::HOST);
        let result = self
            .client
            .request(parts.method, &url)
            .headers(headers)
            .body(body_bytes)
            .send()
            .await;

        match result {
            Ok(upstream) => {
                let status = upstream.status();
                let mut headers = upstream.headers().clone();
                let bytes = match upstream.bytes().await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!(error = %e, "upstream body read failed");
                        return Some(StatusCode::BAD_GATEWAY.into_response());
                    }
                };
                crate::patch::strip_framing_headers(&mut headers);
                let mut response = Response::builder().status(status);
                if let Some(map) = response.headers_mut() {
                    *map = headers;
                }
                Some(
                    response
                        .body(Body::from(bytes))
                        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response()),
                )
            }
            Err(e) => {
                tracing::warn!(%url, error = %e, "forward failed");
                Some((StatusCode::BAD_GATEWAY, "application unreachable").into_response())
            }
        }
    }

    async fn spa_or_not_found(&self, method: &Method, path: &str) -> Response {
        let extensionless = !path.rsplit('/').next().unwrap_or("").contains('.');
        if self.spa_fallback
            && *method == Method::GET
            && extensionless
            && !path.starts_with("/__")
        {
            if let Some(response) = self.serve_static("/index.html", None).await {
                return response;
            }
        }
        StatusCode::NOT_FOUND.into_response()
    }
}

/// URL path → safe relative filesystem path. Rejects traversal.
fn sanitize_url_path(url_path: &str) -> Option<PathBuf> {
    let trimmed = url_path.trim_start_matches('/');
    let rel = if trimmed.is_empty() { "index.html" } else { trimmed };
    let rel = PathBuf::from(rel);
    for component in rel.components() {
        match component {
            Component::Normal(_) => {}
            _ => return None,
        }
    }
    Some(rel)
}

fn request_origin(headers: &HeaderMap) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{host}")
}

/// Extensionless request that asks for JavaScript: point it at the
/// `.js` file and widen Accept so the app's static layer matches.
fn normalize_js_request(path: &mut String, headers: &mut HeaderMap) {
    let wants_js = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("javascript"))
        .unwrap_or(false);
    let last = path.rsplit('/').next().unwrap_or("");
    if wants_js && !last.is_empty() && !last.contains('.') {
        path.push_str(".js");
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
    }
}

async fn mock_response(outcome: MockOutcome) -> Response {
    match outcome {
        MockOutcome::Respond {
            status,
            headers,
            body,
        } => {
            let mut response = Response::builder()
                .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));
            for (name, value) in headers {
                response = response.header(name, value);
            }
            response
                .body(Body::from(body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        MockOutcome::Hang => {
            // Simulated stall: the handler never completes.
            std::future::pending::<()>().await;
            unreachable!()
        }
        MockOutcome::Abort => {
            // A body stream whose first frame errors tears the
            // connection down without a well-formed response.
            let stream = futures::stream::once(async {
                Err::<bytes::Bytes, std::io::Error>(std::io::Error::new(
                    std::io::ErrorKind::ConnectionAborted,
                    "mocked offline destination",
                ))
            });
            Response::builder()
                .status(StatusCode::OK)
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

fn text_response(bytes: Vec<u8>, content_type: &'static str, if_none_match: Option<&str>) -> Response {
    let etag = format!("\"{}\"", gantry_util::hash::short_hash(&bytes));
    if if_none_match == Some(etag.as_str()) {
        return Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .header(header::ETAG, etag)
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    }
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ETAG, etag)
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "html" | "htm" => "text/html",
        "js" | "mjs" | "cjs" => "application/javascript",
        "json" => "application/json",
        "css" => "text/css",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "wasm" => "application/wasm",
        "txt" => "text/plain",
        "map" => "application/json",
        _ => "application/octet-stream",
    }
}
