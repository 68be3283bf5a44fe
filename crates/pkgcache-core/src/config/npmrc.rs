//! `.npmrc` file parser.
//!
//! Every `key=value` line becomes an entry of a [`ConfigLayer`]. Host-scoped
//! keys (`//host/:_authToken=TOKEN`) and scope registries
//! (`@scope:registry=URL`) are stored verbatim and interpreted by
//! [`CacheConfig::from_layers`](super::CacheConfig::from_layers).
//! `${ENV_VAR}` references in values are expanded.

use super::ConfigLayer;
use std::path::{Path, PathBuf};

/// Parse a single `.npmrc` file's content into a layer named `name`.
///
/// Ignores comments (`#`, `;`) and blank lines. Surrounding quotes on values
/// are removed.
#[must_use]
pub fn parse_npmrc(name: &str, content: &str) -> ConfigLayer {
    let mut layer = ConfigLayer::new(name);

    for line in content.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            // A bare key is a boolean flag
            layer.set(line, "true");
            continue;
        };

        let key = key.trim();
        if key.is_empty() {
            continue;
        }

        let value = strip_quotes(value.trim());
        layer.set(key, expand_env_vars(value));
    }

    layer
}

/// Collect `.npmrc` layers from `project_dir` upward, then `$HOME/.npmrc`.
///
/// The nearest file comes first, so it wins on lookup. A file is never
/// loaded twice even when the home directory lies on the walk.
#[must_use]
pub fn load_npmrc_layers(project_dir: &Path) -> Vec<ConfigLayer> {
    let mut layers = Vec::new();
    let mut seen: Vec<PathBuf> = Vec::new();

    let mut dir = Some(project_dir.to_path_buf());
    while let Some(d) = dir {
        let npmrc_path = d.join(".npmrc");
        push_file_layer(&npmrc_path, "project", &mut layers, &mut seen);
        dir = d.parent().map(Path::to_path_buf);
    }

    if let Some(home) = dirs_next::home_dir() {
        push_file_layer(&home.join(".npmrc"), "user", &mut layers, &mut seen);
    }

    layers
}

fn push_file_layer(
    path: &Path,
    kind: &str,
    layers: &mut Vec<ConfigLayer>,
    seen: &mut Vec<PathBuf>,
) {
    if !path.is_file() || seen.iter().any(|p| p == path) {
        return;
    }
    if let Ok(content) = std::fs::read_to_string(path) {
        layers.push(parse_npmrc(&format!("{kind}:{}", path.display()), &content));
        seen.push(path.to_path_buf());
    }
}

fn strip_quotes(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && ((bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\''))
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for ch in chars.by_ref() {
                if ch == '}' {
                    break;
                }
                var_name.push(ch);
            }
            // Unset variables expand to the empty string
            if let Ok(val) = std::env::var(&var_name) {
                result.push_str(&val);
            }
        } else {
            result.push(ch);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::tempdir;

    #[test]
    fn test_parse_plain_keys() {
        let layer = parse_npmrc(
            "t",
            "registry=https://registry.example.com/\ncache-min = 3600\n",
        );
        assert_eq!(layer.get("registry"), Some("https://registry.example.com/"));
        assert_eq!(layer.get("cache-min"), Some("3600"));
    }

    #[test]
    fn test_parse_scoped_registry_and_token() {
        let content = "\
# private scope
@acme:registry=https://npm.acme.dev/
//npm.acme.dev/:_authToken=secret123
";
        let layer = parse_npmrc("t", content);
        assert_eq!(layer.get("@acme:registry"), Some("https://npm.acme.dev/"));
        assert_eq!(layer.get("//npm.acme.dev/:_authToken"), Some("secret123"));
    }

    #[test]
    fn test_comments_blank_lines_and_quotes() {
        let content = "\
; comment
# another

tag = \"next\"
force
";
        let layer = parse_npmrc("t", content);
        assert_eq!(layer.get("tag"), Some("next"));
        assert_eq!(layer.get("force"), Some("true"));
        assert_eq!(layer.len(), 2);
    }

    #[test]
    #[serial]
    fn test_env_var_expansion() {
        std::env::set_var("TEST_NPMRC_TOKEN", "expanded_value");
        assert_eq!(expand_env_vars("${TEST_NPMRC_TOKEN}"), "expanded_value");
        std::env::remove_var("TEST_NPMRC_TOKEN");
    }

    #[test]
    fn test_env_var_missing() {
        assert_eq!(expand_env_vars("a${NONEXISTENT_VAR_12345}b"), "ab");
    }

    #[test]
    fn test_nearest_npmrc_comes_first() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("app");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join(".npmrc"), "tag=outer\n").unwrap();
        std::fs::write(nested.join(".npmrc"), "tag=inner\n").unwrap();

        let layers = load_npmrc_layers(&nested);
        assert!(layers.len() >= 2);
        assert_eq!(layers[0].get("tag"), Some("inner"));
        assert_eq!(layers[1].get("tag"), Some("outer"));
    }
}
