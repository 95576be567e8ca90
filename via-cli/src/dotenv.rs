//! Minimal `.env` loader
//!
//! Applies `KEY=VALUE` lines to the process environment without overriding
//! variables that are already set. Quoted values are unquoted; `#` starts a
//! comment.

use std::path::Path;

pub fn load<P: AsRef<Path>>(path: P) {
    let Ok(content) = std::fs::read_to_string(path) else {
        return;
    };
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().trim_matches('"').trim_matches('\'');
        if key.is_empty() || std::env::var_os(key).is_some() {
            continue;
        }
        std::env::set_var(key, value);
    }
}
