//! Statement-oriented scanning of import/export declarations.
//!
//! Text substitution operates on the string literal of a recognized
//! import/export statement, honoring the quote character that opens the
//! literal, so other quoted text on the line is never touched. A full
//! lexer is deliberately out of scope.

/// Check if a trimmed line is a static import statement.
#[must_use]
pub fn is_import_line(trimmed: &str) -> bool {
    trimmed.starts_with("import ")
        && (trimmed.contains(" from ") || trimmed.contains('\'') || trimmed.contains('"'))
}

/// Check if a trimmed line is an `export ... from` re-export.
#[must_use]
pub fn is_export_from_line(trimmed: &str) -> bool {
    trimmed.starts_with("export ") && trimmed.contains(" from ")
}

/// Check if a trimmed line is a CommonJS `require(...)` statement.
#[must_use]
pub fn is_require_line(trimmed: &str) -> bool {
    trimmed.contains("require(")
}

/// Extract the `from 'specifier'` portion of an import/export line.
///
/// Returns (`before`, specifier, `after`, `quote_char`).
#[must_use]
pub fn extract_from_specifier(line: &str) -> Option<(String, String, String, char)> {
    let from_idx = line.find(" from ")?;
    let after_from = &line[from_idx + 6..];
    let trimmed = after_from.trim_start();
    let quote = trimmed.chars().next()?;
    if quote != '\'' && quote != '"' {
        return None;
    }

    let inner = &trimmed[1..];
    let end_idx = inner.find(quote)?;
    let specifier = inner[..end_idx].to_string();
    let before = format!("{} from ", &line[..from_idx]);
    let after = inner[end_idx + 1..].to_string();

    Some((before, specifier, after, quote))
}

/// Extract specifier from a side-effect import: `import 'xxx'`.
#[must_use]
pub fn extract_side_effect_import(line: &str) -> Option<(String, String, String, char)> {
    let trimmed = line.trim();
    if !trimmed.starts_with("import ") {
        return None;
    }

    let after_import = &trimmed[7..].trim_start();
    let quote = after_import.chars().next()?;
    if quote != '\'' && quote != '"' {
        return None;
    }

    let inner = &after_import[1..];
    let end_idx = inner.find(quote)?;
    let specifier = inner[..end_idx].to_string();
    let after = inner[end_idx + 1..].to_string();

    let leading_ws: String = line.chars().take_while(|c| c.is_whitespace()).collect();
    let before = format!("{leading_ws}import ");

    Some((before, specifier, after, quote))
}

/// Extract a string literal from the start of a slice.
///
/// Returns (specifier, `quote_char`, rest).
#[must_use]
pub fn extract_string_from_start(s: &str) -> Option<(String, char, &str)> {
    let trimmed = s.trim_start();
    let quote = trimmed.chars().next()?;
    if quote != '\'' && quote != '"' {
        return None;
    }

    let inner = &trimmed[1..];
    let end_idx = inner.find(quote)?;
    Some((inner[..end_idx].to_string(), quote, &inner[end_idx + 1..]))
}

/// Extract the specifier of a `require('xxx')` call on a line.
#[must_use]
pub fn extract_require_specifier(line: &str) -> Option<String> {
    let start = line.find("require(")?;
    let (spec, _, _) = extract_string_from_start(&line[start + 8..])?;
    Some(spec)
}

/// Collect every specifier referenced by import/export/require/dynamic
/// import statements in a source text, deduplicated in order.
#[must_use]
pub fn collect_specifiers(source: &str) -> Vec<String> {
    let mut specs = Vec::new();
    let mut seen = std::collections::HashSet::new();

    let mut push = |spec: String| {
        if !spec.starts_with('\0') && seen.insert(spec.clone()) {
            specs.push(spec);
        }
    };

    for line in source.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("//") {
            continue;
        }

        if is_import_line(trimmed) || is_export_from_line(trimmed) {
            if let Some((_, spec, _, _)) = extract_from_specifier(line) {
                push(spec);
                continue;
            }
            if let Some((_, spec, _, _)) = extract_side_effect_import(line) {
                push(spec);
                continue;
            }
        }

        if is_require_line(trimmed) {
            if let Some(spec) = extract_require_specifier(line) {
                push(spec);
            }
        }

        let mut remaining = trimmed;
        while let Some(idx) = remaining.find("import(") {
            let after = &remaining[idx + 7..];
            if let Some((spec, _, rest)) = extract_string_from_start(after) {
                push(spec);
                remaining = rest;
            } else {
                break;
            }
        }
    }

    specs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_static_and_dynamic_specifiers() {
        let source = r#"
import React from 'react';
import { pad } from './pad';
import './side-effect.css';
export { x } from "../shared";
const util = require('util');
const lazy = import('lazy-pkg');
"#;
        let specs = collect_specifiers(source);
        assert_eq!(
            specs,
            vec![
                "react",
                "./pad",
                "./side-effect.css",
                "../shared",
                "util",
                "lazy-pkg"
            ]
        );
    }

    #[test]
    fn string_literals_elsewhere_untouched() {
        let (_, spec, after, quote) =
            extract_from_specifier(r#"import x from 'a'; // "not this""#).unwrap();
        assert_eq!(spec, "a");
        assert_eq!(quote, '\'');
        assert!(after.contains("not this"));
    }

    #[test]
    fn comment_lines_are_skipped() {
        let specs = collect_specifiers("// import ghost from 'ghost';\n");
        assert!(specs.is_empty());
    }

    #[test]
    fn dedupes_repeated_specifiers() {
        let specs = collect_specifiers("import a from 'x';\nimport b from 'x';\n");
        assert_eq!(specs, vec!["x"]);
    }
}
