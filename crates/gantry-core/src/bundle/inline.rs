//! Tree-shake-disabled graph inlining for dependency bundles.
//!
//! Walks a resolved package entry, inlining every first-party (relative
//! or absolute) module into one browser-consumable file. Bare-name
//! imports stay external: they are hoisted to top-level `import`
//! statements and rewritten to gateway URLs when the bundle is served.
//!
//! Each inlined module is wrapped as a CommonJS factory in a registry,
//! executed by a small embedded require shim. ES module sources are
//! converted statement-by-statement (line-scan, not a lexer) before
//! wrapping. This is a dev-grade concatenating linker, not a general
//! bundler.

use crate::patch::scan;
use crate::resolver::{is_bare_specifier, is_builtin, Resolver};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Result of inlining one entry's module graph.
#[derive(Debug)]
pub struct BundleGraph {
    /// The emitted bundle source.
    pub code: String,
    /// Every first-party file inlined (entry first).
    pub files: Vec<PathBuf>,
    /// Bare specifiers left external, in first-seen order.
    pub externals: Vec<String>,
}

/// Inline the module graph rooted at `entry`.
///
/// # Errors
/// Returns a message when a first-party module cannot be read.
pub fn bundle_graph(entry: &Path, resolver: &Resolver) -> Result<BundleGraph, String> {
    let mut modules: BTreeMap<PathBuf, String> = BTreeMap::new();
    // (module path, specifier) → resolved module path, for the shim.
    let mut edges: HashMap<PathBuf, Vec<(String, PathBuf)>> = HashMap::new();
    let mut externals: Vec<String> = Vec::new();
    let mut seen_external: HashSet<String> = HashSet::new();
    let mut files: Vec<PathBuf> = Vec::new();

    let mut queue = vec![entry.to_path_buf()];
    let mut visited: HashSet<PathBuf> = HashSet::new();

    while let Some(path) = queue.pop() {
        if !visited.insert(path.clone()) {
            continue;
        }

        let source = gantry_util::fs::read_to_string_lossy(&path)
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        files.push(path.clone());

        let mut module_edges = Vec::new();
        for spec in scan::collect_specifiers(&source) {
            if is_builtin(&spec) {
                continue;
            }
            if is_bare_specifier(&spec) {
                if seen_external.insert(spec.clone()) {
                    externals.push(spec.clone());
                }
                continue;
            }
            // Relative/absolute: first-party, inline it.
            if let Some(resolved) = resolver.resolve(&path, &spec) {
                module_edges.push((spec, resolved.clone()));
                queue.push(resolved);
            }
        }

        let converted = if is_es_module(&source) {
            to_commonjs(&source)
        } else {
            source
        };
        edges.insert(path.clone(), module_edges);
        modules.insert(path, converted);
    }

    let code = emit(entry, &modules, &edges, &externals);
    Ok(BundleGraph {
        code,
        files,
        externals,
    })
}

/// Whether a source has top-level ESM syntax.
fn is_es_module(source: &str) -> bool {
    source.lines().any(|line| {
        let t = line.trim();
        t.starts_with("import ") || t.starts_with("export ") || t == "export default"
    })
}

/// Statement-level ESM → CommonJS conversion.
///
/// Operates line by line with the shared scan helpers; multi-line
/// declarations keep their bodies intact because only the declaring
/// line is rewritten and export bindings are re-assigned at module end.
fn to_commonjs(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut trailing: Vec<String> = Vec::new();

    out.push_str("module.exports.__esModule = true;\n");

    for line in source.lines() {
        let trimmed = line.trim();

        if scan::is_import_line(trimmed) {
            out.push_str(&convert_import_line(line));
        } else if trimmed.starts_with("export default ") {
            let rest = &trimmed["export default ".len()..];
            out.push_str(&format!("module.exports.default = {rest}"));
        } else if scan::is_export_from_line(trimmed) {
            out.push_str(&convert_export_from_line(line));
        } else if let Some(rest) = strip_export_decl(trimmed) {
            // export const/let/var/function/class NAME ...
            out.push_str(rest);
            if let Some(name) = declared_name(rest) {
                trailing.push(format!("module.exports.{name} = {name};"));
            }
        } else if trimmed.starts_with("export {") || trimmed.starts_with("export{") {
            out.push_str(&convert_export_names(trimmed));
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }

    for t in trailing {
        out.push_str(&t);
        out.push('\n');
    }
    out
}

fn convert_import_line(line: &str) -> String {
    let Some((before, spec, _, _)) = scan::extract_from_specifier(line) else {
        // Side-effect import: `import 's';`
        if let Some((_, spec, _, _)) = scan::extract_side_effect_import(line) {
            return format!("require(\"{spec}\");");
        }
        return line.to_string();
    };

    // `before` is "import <clause> from "
    let clause = before
        .trim_start()
        .strip_prefix("import ")
        .and_then(|c| c.strip_suffix(" from "))
        .unwrap_or("")
        .trim();

    if let Some(ns) = clause.strip_prefix("* as ") {
        return format!("const {ns} = require(\"{spec}\");");
    }
    if clause.starts_with('{') {
        let destructured = clause.replace(" as ", ": ");
        return format!("const {destructured} = require(\"{spec}\");");
    }
    if let Some((default_name, named)) = clause.split_once(',') {
        // require() is cached, so calling twice is harmless.
        let named = named.trim().replace(" as ", ": ");
        return format!(
            "const {d} = (function (m) {{ return m.__esModule ? m.default : m; }})(require(\"{spec}\")); const {named} = require(\"{spec}\");",
            d = default_name.trim()
        );
    }
    format!(
        "const {clause} = (function (m) {{ return m.__esModule ? m.default : m; }})(require(\"{spec}\"));"
    )
}

fn convert_export_from_line(line: &str) -> String {
    let Some((before, spec, _, _)) = scan::extract_from_specifier(line) else {
        return line.to_string();
    };
    let clause = before
        .trim_start()
        .strip_prefix("export ")
        .and_then(|c| c.strip_suffix(" from "))
        .unwrap_or("")
        .trim();

    if clause == "*" {
        return format!("Object.assign(module.exports, require(\"{spec}\"));");
    }
    if clause.starts_with('{') {
        let names = clause.trim_start_matches('{').trim_end_matches('}');
        let mut out = format!("{{ const __r = require(\"{spec}\");");
        for name in names.split(',') {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let (source_name, exported) = match name.split_once(" as ") {
                Some((s, e)) => (s.trim(), e.trim()),
                None => (name, name),
            };
            out.push_str(&format!(" module.exports.{exported} = __r.{source_name};"));
        }
        out.push_str(" }");
        return out;
    }
    line.to_string()
}

fn convert_export_names(trimmed: &str) -> String {
    let inner = trimmed
        .trim_start_matches("export")
        .trim()
        .trim_start_matches('{')
        .trim_end_matches(';')
        .trim_end_matches('}');
    let mut out = String::new();
    for name in inner.split(',') {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        let (local, exported) = match name.split_once(" as ") {
            Some((l, e)) => (l.trim(), e.trim()),
            None => (name, name),
        };
        out.push_str(&format!("module.exports.{exported} = {local}; "));
    }
    out
}

/// Strip a leading `export ` from a declaration line, if it declares
/// a named binding.
fn strip_export_decl(trimmed: &str) -> Option<&str> {
    let rest = trimmed.strip_prefix("export ")?;
    let declares = ["const ", "let ", "var ", "function ", "class ", "async function "]
        .iter()
        .any(|kw| rest.starts_with(kw));
    declares.then_some(rest)
}

/// Name declared by a `const x`, `function f(`, `class C` line.
fn declared_name(decl: &str) -> Option<String> {
    let rest = decl
        .strip_prefix("async function ")
        .or_else(|| decl.strip_prefix("function "))
        .or_else(|| decl.strip_prefix("class "))
        .or_else(|| decl.strip_prefix("const "))
        .or_else(|| decl.strip_prefix("let "))
        .or_else(|| decl.strip_prefix("var "))?;
    let name: String = rest
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '$')
        .collect();
    (!name.is_empty()).then_some(name)
}

/// Exported names detectable in the entry's converted source, for the
/// ESM facade. Textual best-effort: `module.exports.NAME =` /
/// `exports.NAME =` assignments.
fn exported_names(converted: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut seen = HashSet::new();
    for line in converted.lines() {
        let mut rest = line;
        while let Some(idx) = rest.find("exports.") {
            let after = &rest[idx + "exports.".len()..];
            let name: String = after
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '$')
                .collect();
            let after_name = after[name.len()..].trim_start();
            if !name.is_empty()
                && name != "default"
                && name != "__esModule"
                && after_name.starts_with('=')
                && !after_name.starts_with("==")
                && seen.insert(name.clone())
            {
                names.push(name);
            }
            rest = after;
        }
    }
    names
}

/// Emit the registry, shim, hoisted externals and ESM facade.
fn emit(
    entry: &Path,
    modules: &BTreeMap<PathBuf, String>,
    edges: &HashMap<PathBuf, Vec<(String, PathBuf)>>,
    externals: &[String],
) -> String {
    let mut out = String::new();

    for (i, ext) in externals.iter().enumerate() {
        out.push_str(&format!("import * as __gantry_ext_{i} from \"{ext}\";\n"));
    }

    out.push_str("const __gantry_externals = {\n");
    for (i, ext) in externals.iter().enumerate() {
        out.push_str(&format!("  {}: __gantry_ext_{i},\n", js_string(ext)));
    }
    out.push_str("};\n");

    out.push_str("const __gantry_modules = {\n");
    for (path, source) in modules {
        out.push_str(&format!(
            "{}: function (module, exports, require) {{\n{source}\n}},\n",
            js_string(&path.to_string_lossy())
        ));
    }
    out.push_str("};\n");

    out.push_str("const __gantry_edges = {\n");
    for (path, module_edges) in edges {
        out.push_str(&format!("{}: {{", js_string(&path.to_string_lossy())));
        for (spec, target) in module_edges {
            out.push_str(&format!(
                " {}: {},",
                js_string(spec),
                js_string(&target.to_string_lossy())
            ));
        }
        out.push_str(" },\n");
    }
    out.push_str("};\n");

    out.push_str(REQUIRE_SHIM);
    out.push_str(&format!(
        "const __gantry_entry = __gantry_require({});\n",
        js_string(&entry.to_string_lossy())
    ));
    out.push_str(
        "export default (__gantry_entry && __gantry_entry.__esModule) ? __gantry_entry.default : __gantry_entry;\n",
    );

    if let Some(entry_source) = modules.get(entry) {
        for name in exported_names(entry_source) {
            out.push_str(&format!(
                "export const {name} = __gantry_entry.{name};\n"
            ));
        }
    }

    out
}

const REQUIRE_SHIM: &str = r#"const __gantry_cache = {};
function __gantry_require(id, from) {
  if (from !== undefined) {
    const mapped = (__gantry_edges[from] || {})[id];
    if (mapped !== undefined) {
      id = mapped;
    } else if (__gantry_externals[id] !== undefined) {
      return __gantry_externals[id];
    }
  }
  if (__gantry_cache[id]) return __gantry_cache[id].exports;
  const factory = __gantry_modules[id];
  if (!factory) {
    const ext = __gantry_externals[id];
    if (ext !== undefined) return ext;
    throw new Error("module not bundled: " + id);
  }
  const module = { exports: {} };
  __gantry_cache[id] = module;
  factory(module, module.exports, (spec) => __gantry_require(spec, id));
  return module.exports;
}
"#;

/// JSON-style string literal.
fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{s}\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn pkg(dir: &Path, files: &[(&str, &str)]) {
        for (rel, content) in files {
            let path = dir.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
    }

    #[test]
    fn inlines_relative_graph_and_keeps_bare_external() {
        let dir = tempdir().unwrap();
        pkg(
            dir.path(),
            &[
                ("package.json", r#"{"name": "p", "version": "1.0.0"}"#),
                (
                    "index.js",
                    "const helper = require('./helper');\nconst big = require('other-pkg');\nmodule.exports = helper;\n",
                ),
                ("helper.js", "module.exports = function pad() {};\n"),
            ],
        );

        let resolver = Resolver::new();
        let graph = bundle_graph(&dir.path().join("index.js"), &resolver).unwrap();

        assert_eq!(graph.files.len(), 2);
        assert_eq!(graph.externals, vec!["other-pkg"]);
        assert!(graph.code.contains("import * as __gantry_ext_0 from \"other-pkg\";"));
        assert!(graph.code.contains("function pad()"));
        assert!(graph.code.contains("export default"));
    }

    #[test]
    fn converts_esm_imports_to_require() {
        let converted = to_commonjs("import pad from './pad';\nimport { a, b as c } from './x';\n");
        assert!(converted.contains("require(\"./pad\")"));
        assert!(converted.contains("const { a, b: c } = require(\"./x\");"));
    }

    #[test]
    fn converts_esm_exports() {
        let converted = to_commonjs("export const x = 1;\nexport default x;\nexport { y as z };\n");
        assert!(converted.contains("const x = 1;"));
        assert!(converted.contains("module.exports.x = x;"));
        assert!(converted.contains("module.exports.default = x;"));
        assert!(converted.contains("module.exports.z = y;"));
    }

    #[test]
    fn facade_reexports_detected_names() {
        let dir = tempdir().unwrap();
        pkg(
            dir.path(),
            &[
                ("package.json", r#"{"name": "p", "version": "1.0.0"}"#),
                ("index.js", "exports.debounce = () => {};\nexports.throttle = () => {};\n"),
            ],
        );

        let resolver = Resolver::new();
        let graph = bundle_graph(&dir.path().join("index.js"), &resolver).unwrap();
        assert!(graph.code.contains("export const debounce = __gantry_entry.debounce;"));
        assert!(graph.code.contains("export const throttle = __gantry_entry.throttle;"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let resolver = Resolver::new();
        assert!(bundle_graph(Path::new("/nope/missing.js"), &resolver).is_err());
    }
}
