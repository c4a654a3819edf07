//! Live-reload notification channel.
//!
//! File changes fan out to every connected client over the reserved
//! streams (`/__gantry/reload`, `/__gantry/ws`, `/__gantry/es`).
//! Style-only changes become in-place refreshes so the page keeps its
//! state; anything else is a full reload.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

/// Extensions that can be swapped without reloading the page.
const STYLE_EXTENSIONS: &[&str] = &["css", "scss", "sass", "less", "styl"];

/// Notification pushed to connected clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ReloadMessage {
    /// Full page reload.
    Reload,
    /// Re-fetch one stylesheet in place.
    #[serde(rename_all = "camelCase")]
    Refresh { file_path: String },
}

impl ReloadMessage {
    /// Classify a changed file.
    #[must_use]
    pub fn for_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some(ext) if STYLE_EXTENSIONS.contains(&ext) => ReloadMessage::Refresh {
                file_path: path.to_string_lossy().replace('\\', "/"),
            },
            _ => ReloadMessage::Reload,
        }
    }

    /// Wire form, one JSON object per message.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"reload"}"#.to_string())
    }
}

/// Fan-out hub for reload notifications. Cloning shares the underlying
/// channel.
#[derive(Debug, Clone)]
pub struct ReloadBroadcaster {
    sender: broadcast::Sender<ReloadMessage>,
}

impl ReloadBroadcaster {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Subscribe a new client. Lagged clients drop old messages rather
    /// than blocking the sender.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ReloadMessage> {
        self.sender.subscribe()
    }

    /// Notify all clients about a changed file. Returns the number of
    /// clients reached.
    pub fn notify_change(&self, path: &Path) -> usize {
        self.send(ReloadMessage::for_path(path))
    }

    /// Force a full reload on all clients.
    pub fn notify_reload(&self) -> usize {
        self.send(ReloadMessage::Reload)
    }

    fn send(&self, message: ReloadMessage) -> usize {
        tracing::debug!(?message, "broadcasting reload");
        // Err just means no client is connected right now.
        self.sender.send(message).unwrap_or(0)
    }

    /// Number of currently connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ReloadBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Client runtime injected into served HTML. Listens on the SSE stream
/// and applies refresh or reload messages.
#[must_use]
pub fn client_runtime() -> &'static str {
    RELOAD_CLIENT_RUNTIME
}

const RELOAD_CLIENT_RUNTIME: &str = r#"
(() => {
  const source = new EventSource('/__gantry/reload');
  source.onmessage = (event) => {
    const msg = JSON.parse(event.data);
    if (msg.type === 'refresh' && msg.filePath) {
      for (const link of document.querySelectorAll('link[rel="stylesheet"]')) {
        const href = link.getAttribute('href');
        if (!href) continue;
        const url = new URL(href, location.href);
        url.searchParams.set('t', Date.now().toString());
        link.setAttribute('href', url.pathname + url.search);
      }
      console.log('[gantry] refreshed styles for ' + msg.filePath);
    } else {
      location.reload();
    }
  };
  source.onerror = () => {
    console.log('[gantry] reload stream interrupted, waiting for server...');
  };
})();
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn style_changes_refresh_everything_else_reloads() {
        assert_eq!(
            ReloadMessage::for_path(Path::new("src/app.css")),
            ReloadMessage::Refresh {
                file_path: "src/app.css".to_string()
            }
        );
        assert_eq!(
            ReloadMessage::for_path(Path::new("theme.SCSS")),
            ReloadMessage::Refresh {
                file_path: "theme.SCSS".to_string()
            }
        );
        assert_eq!(ReloadMessage::for_path(Path::new("src/app.js")), ReloadMessage::Reload);
        assert_eq!(ReloadMessage::for_path(Path::new("README")), ReloadMessage::Reload);
    }

    #[test]
    fn wire_form_is_tagged_json() {
        assert_eq!(ReloadMessage::Reload.to_json(), r#"{"type":"reload"}"#);
        let refresh = ReloadMessage::Refresh {
            file_path: "a/b.css".to_string(),
        };
        assert_eq!(refresh.to_json(), r#"{"type":"refresh","filePath":"a/b.css"}"#);
    }

    #[tokio::test]
    async fn notifications_reach_every_subscriber() {
        let hub = ReloadBroadcaster::new();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        assert_eq!(hub.client_count(), 2);

        assert_eq!(hub.notify_change(&PathBuf::from("x.css")), 2);
        let expected = ReloadMessage::Refresh {
            file_path: "x.css".to_string(),
        };
        assert_eq!(a.recv().await.unwrap(), expected);
        assert_eq!(b.recv().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn sending_with_no_clients_is_harmless() {
        let hub = ReloadBroadcaster::new();
        assert_eq!(hub.notify_reload(), 0);
    }
}
