use std::{collections::HashMap, fs, path::Path, time::Duration};

use serde::Deserialize;
use session_core::{CoreConfig, HandshakeKeyPolicy};
use tracing::warn;

pub const SETTINGS_FILE: &str = "orchestrator.toml";
const ENV_PREFIX: &str = "APP__";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Settings {
    pub sessions_root: String,
    pub media_root: String,
    pub public_media_prefix: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub max_concurrent_connections: usize,
    pub max_password_attempts: u32,
    pub handshake_ttl_secs: u64,
    pub handshake_key_policy: String,
    pub online_scan_limit: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sessions_root: "./sessions".into(),
            media_root: "./media".into(),
            public_media_prefix: "/media".into(),
            connect_timeout_secs: 30,
            request_timeout_secs: 30,
            download_timeout_secs: 120,
            max_concurrent_connections: 4,
            max_password_attempts: 5,
            handshake_ttl_secs: 600,
            handshake_key_policy: "phone_only".into(),
            online_scan_limit: 50,
        }
    }
}

impl Settings {
    pub fn core_config(&self) -> CoreConfig {
        let handshake_key_policy = self
            .handshake_key_policy
            .parse::<HandshakeKeyPolicy>()
            .unwrap_or_else(|err| {
                warn!(error = %err, "falling back to phone_only handshake keys");
                HandshakeKeyPolicy::PhoneOnly
            });
        CoreConfig {
            sessions_root: self.sessions_root.clone().into(),
            media_root: self.media_root.clone().into(),
            public_media_prefix: self.public_media_prefix.trim_end_matches('/').to_string(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            download_timeout: Duration::from_secs(self.download_timeout_secs),
            max_concurrent_connections: self.max_concurrent_connections,
            max_password_attempts: self.max_password_attempts,
            handshake_ttl: Duration::from_secs(self.handshake_ttl_secs),
            handshake_key_policy,
            online_scan_limit: self.online_scan_limit,
        }
    }

    fn apply(&mut self, key: &str, value: &str) {
        let value = value.trim();
        match key {
            "sessions_root" => self.sessions_root = value.to_string(),
            "media_root" => self.media_root = value.to_string(),
            "public_media_prefix" => self.public_media_prefix = value.to_string(),
            "handshake_key_policy" => self.handshake_key_policy = value.to_string(),
            "connect_timeout_secs" => set_parsed(&mut self.connect_timeout_secs, key, value),
            "request_timeout_secs" => set_parsed(&mut self.request_timeout_secs, key, value),
            "download_timeout_secs" => set_parsed(&mut self.download_timeout_secs, key, value),
            "max_concurrent_connections" => {
                set_parsed(&mut self.max_concurrent_connections, key, value)
            }
            "max_password_attempts" => set_parsed(&mut self.max_password_attempts, key, value),
            "handshake_ttl_secs" => set_parsed(&mut self.handshake_ttl_secs, key, value),
            "online_scan_limit" => set_parsed(&mut self.online_scan_limit, key, value),
            _ => {}
        }
    }
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, key: &str, value: &str) {
    match value.parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value, "ignoring unparsable setting"),
    }
}

/// Defaults, then `orchestrator.toml` in the working directory, then `APP__*`
/// environment variables.
pub fn load_settings() -> Settings {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<HashMap<String, toml::Value>>(&raw) {
            Ok(file_cfg) => {
                for (key, value) in &file_cfg {
                    settings.apply(key, &toml_text(value));
                }
            }
            Err(err) => warn!(path = %path.display(), error = %err, "ignoring malformed settings file"),
        }
    }

    let keys = [
        "sessions_root",
        "media_root",
        "public_media_prefix",
        "connect_timeout_secs",
        "request_timeout_secs",
        "download_timeout_secs",
        "max_concurrent_connections",
        "max_password_attempts",
        "handshake_ttl_secs",
        "handshake_key_policy",
        "online_scan_limit",
    ];
    for key in keys {
        if let Some(value) = env(&format!("{ENV_PREFIX}{}", key.to_ascii_uppercase())) {
            settings.apply(key, &value);
        }
    }

    settings
}

fn toml_text(value: &toml::Value) -> String {
    match value {
        toml::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
