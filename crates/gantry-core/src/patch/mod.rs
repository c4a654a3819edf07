//! Response patching: in-flight body rewriting with correct framing.
//!
//! Two rewrites apply to static/bundled responses:
//! - HTML: inject the reload client script (and any configured header /
//!   footer snippets) before `</head>` / `</body>`.
//! - JavaScript: rewrite bare import specifiers to dependency-bundle URLs.
//!
//! Patching changes body size, so any Content-Length computed by an
//! underlying handler is discarded and recomputed from the patched bytes.

pub mod rewrite;
pub mod scan;

pub use rewrite::ImportRewriter;

use axum::http::{header, HeaderMap};

/// Patches response bodies for browser consumption.
#[derive(Debug, Clone, Default)]
pub struct ResponsePatcher {
    /// Script tag(s) injected at the top of the document head.
    pub head_scripts: Vec<String>,
    /// Script tag(s) injected at the end of the document body.
    pub body_scripts: Vec<String>,
}

impl ResponsePatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a script tag injected before `</head>` (or prepended when the
    /// document has no head).
    pub fn inject_head(&mut self, script_tag: impl Into<String>) {
        self.head_scripts.push(script_tag.into());
    }

    /// Add a script tag injected before `</body>` (or appended).
    pub fn inject_body(&mut self, script_tag: impl Into<String>) {
        self.body_scripts.push(script_tag.into());
    }

    /// Whether any HTML injection is configured.
    #[must_use]
    pub fn patches_html(&self) -> bool {
        !self.head_scripts.is_empty() || !self.body_scripts.is_empty()
    }

    /// Inject configured scripts into an HTML document.
    #[must_use]
    pub fn patch_html(&self, html: &str) -> String {
        let mut out = html.to_string();

        for script in &self.head_scripts {
            if out.contains(script.as_str()) {
                continue;
            }
            if let Some(pos) = out.find("</head>") {
                out.insert_str(pos, &format!("  {script}\n  "));
            } else if let Some(pos) = out.find("<body") {
                out.insert_str(pos, &format!("{script}\n"));
            } else {
                out = format!("{script}\n{out}");
            }
        }

        for script in &self.body_scripts {
            if out.contains(script.as_str()) {
                continue;
            }
            if let Some(pos) = out.find("</body>") {
                out.insert_str(pos, &format!("  {script}\n  "));
            } else {
                out.push('\n');
                out.push_str(script);
            }
        }

        out
    }

    /// Rewrite import specifiers in a JavaScript body.
    ///
    /// `map` resolves a bare specifier to a servable URL; declined
    /// specifiers stay as written.
    #[must_use]
    pub fn patch_js(&self, code: &str, map: &dyn Fn(&str) -> Option<String>) -> String {
        ImportRewriter::new(map).rewrite(code)
    }
}

/// Strip framing headers that a patched body invalidates.
///
/// Content-Length is recomputed from the patched bytes by the response
/// builder; a stale value or a transfer-encoding from the inner handler
/// must not survive.
pub fn strip_framing_headers(headers: &mut HeaderMap) {
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::TRANSFER_ENCODING);
}
