//! Batch loading of mock definition files.

use super::{MockDefinition, MockRegistry};
use std::path::Path;
use walkdir::WalkDir;

/// Load one mock definition file into the registry. Parse failures are
/// logged and skipped so one bad file never blocks the rest of a batch.
pub fn load_mock_file(registry: &MockRegistry, path: &Path) -> bool {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "skipping unreadable mock file");
            return false;
        }
    };
    let definition: MockDefinition = match serde_json::from_str(&text) {
        Ok(definition) => definition,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "skipping unparseable mock file");
            return false;
        }
    };

    let base_dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
    match definition {
        MockDefinition::Response { request, response } => {
            tracing::debug!(url = %request.url, "registered response mock");
            registry.add_response(&request, response, base_dir);
        }
        MockDefinition::Stream { stream, events } => {
            tracing::debug!(url = %stream.url, events = events.len(), "registered stream mock");
            registry.add_push_events(&stream, events);
        }
    }
    true
}

/// Recursively load every `.json` file under `dir`. Returns the number
/// of definitions registered.
pub fn load_mock_dir(registry: &MockRegistry, dir: &Path) -> usize {
    let mut loaded = 0;
    for entry in WalkDir::new(dir).follow_links(false).into_iter().filter_map(Result::ok) {
        let path = entry.path();
        if !entry.file_type().is_file() {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if load_mock_file(registry, path) {
            loaded += 1;
        }
    }
    tracing::info!(dir = %dir.display(), loaded, "loaded mock definitions");
    loaded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_valid_definitions_and_skips_broken_ones() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("ok.json"),
            r#"{"request":{"url":"http://api/items"},"response":{"body":[1,2]}}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("stream.json"),
            r#"{"stream":{"url":"ws://api/live","type":"ws"},"events":[{"name":"tick","message":"t"}]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let registry = MockRegistry::new();
        let loaded = load_mock_dir(&registry, dir.path());

        assert_eq!(loaded, 2);
        assert!(registry.match_response("http://api", "/items", None).is_some());
        assert!(registry.sequence_for("ws://api", "/live", "tick").is_some());
    }

    #[test]
    fn nested_directories_are_walked() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("users");
        std::fs::create_dir_all(&sub).unwrap();
        std::fs::write(
            sub.join("me.json"),
            r#"{"request":{"url":"http://api/me","once":true},"response":{"body":{"id":1}}}"#,
        )
        .unwrap();

        let registry = MockRegistry::new();
        assert_eq!(load_mock_dir(&registry, dir.path()), 1);
        assert!(registry.match_response("http://api", "/me", None).is_some());
        assert!(registry.match_response("http://api", "/me", None).is_none());
    }
}
