//! Import-specifier rewriting for served JavaScript.
//!
//! Bare specifiers (`lodash`) are rewritten to gateway dependency-bundle
//! URLs (`/__deps/lodash@4.17.21.js`) so the browser's `import` can load
//! them. Relative and absolute specifiers already work in the browser
//! and pass through untouched. Specifiers the mapper declines (built-ins,
//! unresolvable names) are left as written.

use super::scan;
use crate::resolver::is_bare_specifier;

/// Rewrites bare import specifiers through a caller-supplied mapper.
pub struct ImportRewriter<'a> {
    map: &'a dyn Fn(&str) -> Option<String>,
}

impl<'a> ImportRewriter<'a> {
    pub fn new(map: &'a dyn Fn(&str) -> Option<String>) -> Self {
        Self { map }
    }

    /// Rewrite every import/export/dynamic-import statement in `code`.
    #[must_use]
    pub fn rewrite(&self, code: &str) -> String {
        let mut result = String::with_capacity(code.len());

        for line in code.lines() {
            let trimmed = line.trim();

            if scan::is_import_line(trimmed) || scan::is_export_from_line(trimmed) {
                result.push_str(&self.rewrite_static_line(line));
            } else if trimmed.contains("import(") {
                result.push_str(&self.rewrite_dynamic_line(line));
            } else {
                result.push_str(line);
            }
            result.push('\n');
        }

        if !code.ends_with('\n') && result.ends_with('\n') {
            result.pop();
        }

        result
    }

    fn rewrite_static_line(&self, line: &str) -> String {
        if let Some((before, spec, after, quote)) = scan::extract_from_specifier(line) {
            let rewritten = self.rewrite_specifier(&spec);
            format!("{before}{quote}{rewritten}{quote}{after}")
        } else if let Some((before, spec, after, quote)) = scan::extract_side_effect_import(line) {
            let rewritten = self.rewrite_specifier(&spec);
            format!("{before}{quote}{rewritten}{quote}{after}")
        } else {
            line.to_string()
        }
    }

    fn rewrite_dynamic_line(&self, line: &str) -> String {
        let mut result = String::with_capacity(line.len());
        let mut remaining = line;

        while let Some(start) = remaining.find("import(") {
            result.push_str(&remaining[..start]);
            let after = &remaining[start + 7..];

            if let Some((spec, quote, rest)) = scan::extract_string_from_start(after) {
                let rewritten = self.rewrite_specifier(&spec);
                result.push_str("import(");
                result.push(quote);
                result.push_str(&rewritten);
                result.push(quote);
                remaining = rest;
            } else {
                result.push_str("import(");
                remaining = after;
            }
        }

        result.push_str(remaining);
        result
    }

    fn rewrite_specifier(&self, spec: &str) -> String {
        if !is_bare_specifier(spec) {
            return spec.to_string();
        }
        match (self.map)(spec) {
            Some(url) => url,
            None => spec.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper(spec: &str) -> Option<String> {
        match spec {
            "lodash" => Some("/__deps/lodash@4.17.21.js".to_string()),
            "react" => Some("/__deps/react@18.2.0.js".to_string()),
            _ => None,
        }
    }

    #[test]
    fn rewrites_bare_specifiers() {
        let rewriter = ImportRewriter::new(&mapper);
        let code = "import _ from 'lodash';\nimport React from \"react\";";
        let out = rewriter.rewrite(code);
        assert!(out.contains("from '/__deps/lodash@4.17.21.js'"));
        assert!(out.contains("from \"/__deps/react@18.2.0.js\""));
    }

    #[test]
    fn leaves_relative_and_absolute_alone() {
        let rewriter = ImportRewriter::new(&mapper);
        let code = "import a from './a.js';\nimport b from '/src/b.js';";
        assert_eq!(rewriter.rewrite(code), code);
    }

    #[test]
    fn unresolvable_bare_specifier_left_as_written() {
        let rewriter = ImportRewriter::new(&mapper);
        let code = "import ghost from 'ghost-pkg';";
        assert_eq!(rewriter.rewrite(code), code);
    }

    #[test]
    fn rewrites_dynamic_imports() {
        let rewriter = ImportRewriter::new(&mapper);
        let out = rewriter.rewrite("const m = import('lodash');");
        assert_eq!(out, "const m = import('/__deps/lodash@4.17.21.js');");
    }

    #[test]
    fn rewrites_export_from() {
        let rewriter = ImportRewriter::new(&mapper);
        let out = rewriter.rewrite("export { debounce } from 'lodash';");
        assert!(out.contains("from '/__deps/lodash@4.17.21.js'"));
    }

    #[test]
    fn side_effect_import_rewritten() {
        let rewriter = ImportRewriter::new(&mapper);
        let out = rewriter.rewrite("import 'react';");
        assert_eq!(out, "import '/__deps/react@18.2.0.js';");
    }
}
