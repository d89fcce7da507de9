use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

/// Compiled pattern matching `$VAR`, `${VAR}`, and `$$` escape sequences.
static ENV_VAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)|\$\$")
        .expect("valid regex")
});

// ---------------------------------------------------------------------------
// SecretRegistry: tracks secret values for masking
// ---------------------------------------------------------------------------

/// Tracks configured passwords so they can be masked in log output.
#[derive(Debug, Default)]
pub struct SecretRegistry {
    secret_values: HashSet<String>,
}

impl SecretRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value as secret (to be masked in output).
    pub fn track(&mut self, value: &str) {
        if !value.is_empty() {
            self.secret_values.insert(value.to_string());
        }
    }

    /// Replace any known secret substrings in `value` with `****`.
    pub fn mask_value(&self, value: &str) -> String {
        let mut result = value.to_string();
        for secret in &self.secret_values {
            result = result.replace(secret.as_str(), "****");
        }
        result
    }
}

// ---------------------------------------------------------------------------
// env file parser
// ---------------------------------------------------------------------------

/// Parse a `KEY=VALUE` env file.
///
/// Supports: `KEY=VALUE`, `KEY="VALUE"`, `KEY='VALUE'`, `# comments`, blank lines.
/// Lines without `=` are skipped. Values have `$VAR` and a leading `~`
/// expanded. Returns an empty map if the file does not exist.
pub fn parse_env_file(path: &Path) -> Result<BTreeMap<String, String>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading env file {}", path.display()))?;

    let raw = parse_env_content(&content);
    let mut vars = BTreeMap::new();
    for (key, value) in &raw {
        let expanded = expand_env_vars(value, &raw);
        vars.insert(key.clone(), crate::platform::expand_home(&expanded));
    }
    Ok(vars)
}

fn parse_env_content(content: &str) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();

    for line in content.lines() {
        let trimmed = line.trim();

        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let Some((key, value)) = trimmed.split_once('=') else {
            continue;
        };

        let key = key.trim();
        if key.is_empty() {
            continue;
        }

        let value = value.trim();

        // Strip matching quotes
        let value = if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            &value[1..value.len() - 1]
        } else {
            value
        };

        vars.insert(key.to_string(), value.to_string());
    }

    vars
}

// ---------------------------------------------------------------------------
// $VAR expansion
// ---------------------------------------------------------------------------

/// Expand `$VAR`, `${VAR}`, and `$$` escape sequences in a string.
///
/// Lookup order: (1) host process env, (2) `file_vars`. Unknown variables
/// are left untouched.
pub fn expand_env_vars(input: &str, file_vars: &BTreeMap<String, String>) -> String {
    if !input.contains('$') {
        return input.to_string();
    }

    let mut result = String::with_capacity(input.len());
    let mut last_end = 0;

    for caps in ENV_VAR_RE.captures_iter(input) {
        let Some(m) = caps.get(0) else { continue };
        result.push_str(&input[last_end..m.start()]);

        match caps.get(1).or_else(|| caps.get(2)) {
            None => result.push('$'),
            Some(name) => {
                let value = std::env::var(name.as_str())
                    .ok()
                    .or_else(|| file_vars.get(name.as_str()).cloned());
                match value {
                    Some(val) => result.push_str(&val),
                    None => result.push_str(m.as_str()),
                }
            }
        }

        last_end = m.end();
    }

    result.push_str(&input[last_end..]);
    result
}

/// Merge env-file values under the host environment: keys already present in
/// the process environment win.
pub fn lookup_with_host_env<'a>(
    file_vars: &'a BTreeMap<String, String>,
) -> impl Fn(&str) -> Option<String> + 'a {
    move |key| std::env::var(key).ok().or_else(|| file_vars.get(key).cloned())
}
