use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context};
use url::Url;

use crate::realtime::ReconnectPolicy;

pub const SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub api_url: String,
    pub realtime_url: Option<String>,
    pub credentials_path: Option<PathBuf>,
    pub refresh_timeout: Duration,
    pub connect_timeout: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub reconnect_max_attempts: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:3000".into(),
            realtime_url: None,
            credentials_path: None,
            refresh_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(10),
            reconnect_max_attempts: 6,
        }
    }
}

impl ClientSettings {
    /// Realtime endpoint, derived from the API URL unless set explicitly.
    pub fn resolved_realtime_url(&self) -> anyhow::Result<String> {
        match &self.realtime_url {
            Some(url) => Ok(url.clone()),
            None => realtime_url_from_api(&self.api_url),
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: self.reconnect_base_delay,
            max_delay: self.reconnect_max_delay,
            max_attempts: self.reconnect_max_attempts,
            connect_timeout: self.connect_timeout,
        }
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

/// Defaults, then the flat `key = "value"` file at `path`, then
/// environment overrides looked up through `env`.
pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("api_url") {
                settings.api_url = v.clone();
            }
            if let Some(v) = file_cfg.get("realtime_url") {
                settings.realtime_url = Some(v.clone());
            }
            if let Some(v) = file_cfg.get("credentials_path") {
                settings.credentials_path = Some(PathBuf::from(v));
            }
            apply_numeric_overrides(&mut settings, |key| file_cfg.get(key).cloned());
        }
    }

    if let Some(v) = env("API_URL") {
        settings.api_url = v;
    }
    if let Some(v) = env("APP__API_URL") {
        settings.api_url = v;
    }

    if let Some(v) = env("REALTIME_URL") {
        settings.realtime_url = Some(v);
    }
    if let Some(v) = env("APP__REALTIME_URL") {
        settings.realtime_url = Some(v);
    }

    if let Some(v) = env("APP__CREDENTIALS_PATH") {
        settings.credentials_path = Some(PathBuf::from(v));
    }

    apply_numeric_overrides(&mut settings, |key| env(&format!("APP__{}", key.to_uppercase())));

    settings
}

fn apply_numeric_overrides(settings: &mut ClientSettings, lookup: impl Fn(&str) -> Option<String>) {
    let millis = |key: &str| {
        lookup(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
    };

    if let Some(v) = millis("refresh_timeout_ms") {
        settings.refresh_timeout = v;
    }
    if let Some(v) = millis("connect_timeout_ms") {
        settings.connect_timeout = v;
    }
    if let Some(v) = millis("reconnect_base_delay_ms") {
        settings.reconnect_base_delay = v;
    }
    if let Some(v) = millis("reconnect_max_delay_ms") {
        settings.reconnect_max_delay = v;
    }
    if let Some(v) = lookup("reconnect_max_attempts").and_then(|v| v.trim().parse::<u32>().ok()) {
        settings.reconnect_max_attempts = v;
    }
}

/// Maps `http(s)://host/...` to `ws(s)://host/ws`.
pub fn realtime_url_from_api(api_url: &str) -> anyhow::Result<String> {
    let mut url = Url::parse(api_url.trim())
        .with_context(|| format!("invalid api url '{api_url}'"))?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => return Err(anyhow!("api url must be http:// or https://, got {other}://")),
    };
    url.set_scheme(scheme)
        .map_err(|()| anyhow!("cannot derive realtime url from '{api_url}'"))?;
    url.set_path("/ws");
    url.set_query(None);
    Ok(url.to_string())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
