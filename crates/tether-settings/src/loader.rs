//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{EmptyResponsePolicy, TetherSettings};

/// `~/.tether`, falling back to `/tmp/.tether` without a home directory.
pub fn tether_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tether")
}

pub fn settings_path() -> PathBuf {
    tether_home().join("settings.json")
}

/// Resolve a configured path: absolute paths are kept, relative ones are
/// taken relative to [`tether_home`].
pub fn resolve_path(configured: &str) -> PathBuf {
    let path = Path::new(configured);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        tether_home().join(path)
    }
}

pub fn load_settings() -> Result<TetherSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<TetherSettings> {
    let defaults = serde_json::to_value(TetherSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: TetherSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `TETHER_*` overrides. Invalid values are logged and ignored.
pub fn apply_env_overrides(settings: &mut TetherSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Same as [`apply_env_overrides`] with an injectable lookup, so tests never
/// touch the process environment.
pub fn apply_overrides_from(settings: &mut TetherSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Server ──
    if let Some(v) = env.u16("TETHER_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.string("TETHER_HOST") {
        settings.server.host = v;
    }

    // ── Engine ──
    if let Some(v) = env.u64("TETHER_APPROVAL_TIMEOUT_MS", 1000, 3_600_000) {
        settings.engine.approval_timeout_ms = v;
    }
    if let Some(v) = env.usize("TETHER_MAX_TURNS_PER_SUB_CHAT", 1, 64) {
        settings.engine.max_turns_per_sub_chat = v;
    }
    if let Some(v) = env.string("TETHER_EMPTY_RESPONSE_POLICY") {
        match serde_json::from_value::<EmptyResponsePolicy>(Value::String(v.clone())) {
            Ok(policy) => settings.engine.empty_response_policy = policy,
            Err(_) => tracing::warn!(key = "TETHER_EMPTY_RESPONSE_POLICY", value = %v, "invalid policy env var, ignoring"),
        }
    }
    if let Some(v) = env.string("TETHER_STATE_DIR") {
        settings.engine.state_dir = v;
    }

    // ── Agent / store / logging ──
    if let Some(v) = env.string("TETHER_AGENT_BIN") {
        settings.agent.binary = Some(v);
    }
    if let Some(v) = env.string("TETHER_DB_PATH") {
        settings.store.db_path = v;
    }
    if let Some(v) = env.string("TETHER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("TETHER_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
    }

    fn string(&self, name: &str) -> Option<String> {
        self.raw(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = self.raw(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = self.raw(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = self.raw(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = self.raw(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    // ── deep_merge ──

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 8080, "host": "localhost"}});
        let source = serde_json::json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "localhost");
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"items": [1, 2, 3]});
        let source = serde_json::json!({"items": [4, 5]});
        assert_eq!(deep_merge(target, source)["items"], serde_json::json!([4, 5]));
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    // ── load_settings_from_path ──

    #[test]
    fn load_missing_file_returns_defaults() {
        let settings = load_settings_from_path(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.server.port, TetherSettings::default().server.port);
    }

    #[test]
    fn load_partial_json_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"engine": {"maxTurnsPerSubChat": 3, "confirmTools": ["AskUserQuestion", "Bash"]}}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.engine.max_turns_per_sub_chat, 3);
        assert_eq!(settings.engine.confirm_tools.len(), 2);
        assert_eq!(settings.engine.approval_timeout_ms, 60_000);
    }

    #[test]
    fn load_invalid_json_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not valid json").unwrap();
        assert!(matches!(load_settings_from_path(&path), Err(SettingsError::Parse(_))));
    }

    // ── env overrides ──

    #[test]
    fn env_overrides_apply() {
        let mut settings = TetherSettings::default();
        apply_overrides_from(
            &mut settings,
            env(&[
                ("TETHER_PORT", "9000"),
                ("TETHER_APPROVAL_TIMEOUT_MS", "5000"),
                ("TETHER_MAX_TURNS_PER_SUB_CHAT", "2"),
                ("TETHER_AGENT_BIN", "/opt/claude"),
                ("TETHER_LOG_JSON", "yes"),
                ("TETHER_EMPTY_RESPONSE_POLICY", "remove_user_message"),
            ]),
        );
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.engine.approval_timeout_ms, 5000);
        assert_eq!(settings.engine.max_turns_per_sub_chat, 2);
        assert_eq!(settings.agent.binary.as_deref(), Some("/opt/claude"));
        assert!(settings.logging.json);
        assert_eq!(settings.engine.empty_response_policy, EmptyResponsePolicy::RemoveUserMessage);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut settings = TetherSettings::default();
        apply_overrides_from(
            &mut settings,
            env(&[
                ("TETHER_APPROVAL_TIMEOUT_MS", "10"),
                ("TETHER_MAX_TURNS_PER_SUB_CHAT", "zero"),
                ("TETHER_LOG_JSON", "maybe"),
                ("TETHER_HOST", ""),
            ]),
        );
        assert_eq!(settings.engine.approval_timeout_ms, 60_000);
        assert_eq!(settings.engine.max_turns_per_sub_chat, 1);
        assert!(!settings.logging.json);
        assert_eq!(settings.server.host, "127.0.0.1");
    }

    // ── parsers ──

    #[test]
    fn parse_bool_variants() {
        for val in ["true", "1", "yes", "ON"] {
            assert_eq!(parse_bool(val), Some(true), "failed for {val}");
        }
        for val in ["false", "0", "no", "Off"] {
            assert_eq!(parse_bool(val), Some(false), "failed for {val}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("9090", 1, 65535), Some(9090));
        assert_eq!(parse_u16_range("99999", 1, 65535), None);
        assert_eq!(parse_u64_range("500", 1000, 600_000), None);
        assert_eq!(parse_usize_range("50", 1, 10_000), Some(50));
    }

    #[test]
    fn resolve_relative_and_absolute_paths() {
        assert_eq!(resolve_path("/var/db.sqlite"), PathBuf::from("/var/db.sqlite"));
        assert!(resolve_path("tether.db").ends_with(".tether/tether.db"));
    }
}
