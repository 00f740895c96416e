//! client configuration, seeded from the environment.
//!
//! native reads the process environment at startup; wasm has none, so the
//! values baked in at build time (`option_env!`) are used instead.

use std::time::Duration;

use bevy::prelude::*;

pub const DEFAULT_BASE_URL: &str = "http://localhost:3001/api";
pub const DEFAULT_REVEAL_PERIOD: Duration = Duration::from_millis(20);
pub const DEFAULT_REVEAL_STEP: usize = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RevealConfig {
    /// fixed period between reveal ticks.
    pub period: Duration,
    /// most characters revealed per tick.
    pub step: usize,
}

impl Default for RevealConfig {
    fn default() -> Self {
        Self {
            period: DEFAULT_REVEAL_PERIOD,
            step: DEFAULT_REVEAL_STEP,
        }
    }
}

#[derive(Resource, Clone, Debug, PartialEq, Eq)]
pub struct ChatConfig {
    pub base_url: String,
    /// use the streaming endpoint for new turns.
    pub stream: bool,
    pub reveal: RevealConfig,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            stream: true,
            reveal: RevealConfig::default(),
        }
    }
}

impl ChatConfig {
    /// `CHAT_API_URL`, `CHAT_STREAM`, `CHAT_REVEAL_MS`, `CHAT_REVEAL_STEP`.
    pub fn from_env() -> Self {
        Self::from_lookup(env_var)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let base_url = lookup("CHAT_API_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.base_url);
        let stream = lookup("CHAT_STREAM")
            .map(|v| parse_flag("CHAT_STREAM", &v, defaults.stream))
            .unwrap_or(defaults.stream);
        let period = lookup("CHAT_REVEAL_MS")
            .and_then(|v| parse_or_warn::<u64>("CHAT_REVEAL_MS", &v))
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.reveal.period);
        let step = lookup("CHAT_REVEAL_STEP")
            .and_then(|v| parse_or_warn::<usize>("CHAT_REVEAL_STEP", &v))
            .filter(|s| *s > 0)
            .unwrap_or(defaults.reveal.step);
        Self {
            base_url,
            stream,
            reveal: RevealConfig { period, step },
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

#[cfg(target_arch = "wasm32")]
fn env_var(key: &str) -> Option<String> {
    let value = match key {
        "CHAT_API_URL" => option_env!("CHAT_API_URL"),
        "CHAT_STREAM" => option_env!("CHAT_STREAM"),
        "CHAT_REVEAL_MS" => option_env!("CHAT_REVEAL_MS"),
        "CHAT_REVEAL_STEP" => option_env!("CHAT_REVEAL_STEP"),
        _ => None,
    };
    value.map(str::to_string)
}

fn parse_or_warn<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
    let parsed = value.trim().parse().ok();
    if parsed.is_none() {
        warn!(target: "bevy_rag_chat", "ignoring {key}={value:?}: not a number");
    }
    parsed
}

fn parse_flag(key: &str, value: &str, default: bool) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            warn!(target: "bevy_rag_chat", "ignoring {key}={value:?}: expected a boolean");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn empty_environment_uses_defaults() {
        assert_eq!(ChatConfig::from_lookup(lookup(&[])), ChatConfig::default());
    }

    #[test]
    fn reads_all_keys() {
        let cfg = ChatConfig::from_lookup(lookup(&[
            ("CHAT_API_URL", "https://news.example/api"),
            ("CHAT_STREAM", "off"),
            ("CHAT_REVEAL_MS", "35"),
            ("CHAT_REVEAL_STEP", "3"),
        ]));
        assert_eq!(cfg.base_url, "https://news.example/api");
        assert!(!cfg.stream);
        assert_eq!(cfg.reveal.period, Duration::from_millis(35));
        assert_eq!(cfg.reveal.step, 3);
    }

    #[test]
    fn bad_values_fall_back() {
        let cfg = ChatConfig::from_lookup(lookup(&[
            ("CHAT_API_URL", "  "),
            ("CHAT_STREAM", "maybe"),
            ("CHAT_REVEAL_MS", "fast"),
            ("CHAT_REVEAL_STEP", "0"),
        ]));
        assert_eq!(cfg, ChatConfig::default());
    }
}
