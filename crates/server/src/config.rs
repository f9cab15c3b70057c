use std::{
    fs,
    net::{IpAddr, SocketAddr},
    path::Path,
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::session::{SessionConfig, SessionRequest};

pub const SETTINGS_FILE: &str = "bridge.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub control_bind: String,
    pub data_host: String,
    pub data_port: Option<u16>,
    pub viewer_url: String,
    pub ack_timeout_secs: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            control_bind: "127.0.0.1:12306".into(),
            data_host: "127.0.0.1".into(),
            data_port: None,
            viewer_url: "https://parquet-viewer.xiangpeng.systems/".into(),
            ack_timeout_secs: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    control_bind: Option<String>,
    data_host: Option<String>,
    data_port: Option<u16>,
    viewer_url: Option<String>,
    ack_timeout_secs: Option<u64>,
}

pub fn load_settings() -> Settings {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

/// Defaults, then `path` if it exists, then environment variables. Each
/// variable has a `BRIDGE_` name and an `APP__` alias; the alias wins.
pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => {
                if let Some(v) = file_cfg.control_bind {
                    settings.control_bind = v;
                }
                if let Some(v) = file_cfg.data_host {
                    settings.data_host = v;
                }
                if file_cfg.data_port.is_some() {
                    settings.data_port = file_cfg.data_port;
                }
                if let Some(v) = file_cfg.viewer_url {
                    settings.viewer_url = v;
                }
                if file_cfg.ack_timeout_secs.is_some() {
                    settings.ack_timeout_secs = file_cfg.ack_timeout_secs;
                }
            }
            Err(error) => {
                warn!(file = %path.display(), %error, "ignoring unreadable settings file");
            }
        }
    }

    if let Some(v) = lookup(&env, "CONTROL_BIND") {
        settings.control_bind = v;
    }
    if let Some(v) = lookup(&env, "DATA_HOST") {
        settings.data_host = v;
    }
    if let Some(v) = lookup(&env, "DATA_PORT") {
        match v.parse::<u16>() {
            Ok(port) => settings.data_port = Some(port),
            Err(error) => warn!(value = %v, %error, "ignoring invalid data port"),
        }
    }
    if let Some(v) = lookup(&env, "VIEWER_URL") {
        settings.viewer_url = v;
    }
    if let Some(v) = lookup(&env, "ACK_TIMEOUT_SECS") {
        match v.parse::<u64>() {
            Ok(secs) => settings.ack_timeout_secs = Some(secs),
            Err(error) => warn!(value = %v, %error, "ignoring invalid ack timeout"),
        }
    }

    settings
}

fn lookup(env: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    env(&format!("APP__{name}")).or_else(|| env(&format!("BRIDGE_{name}")))
}

impl Settings {
    /// Resolves these settings into a runnable session. Command-line values
    /// take precedence over the settings file and environment.
    pub fn session_config(
        &self,
        request: SessionRequest,
        data_port: Option<u16>,
        ack_timeout_secs: Option<u64>,
    ) -> anyhow::Result<SessionConfig> {
        let control_bind: SocketAddr = self
            .control_bind
            .parse()
            .with_context(|| format!("invalid control bind address '{}'", self.control_bind))?;
        let data_host: IpAddr = self
            .data_host
            .parse()
            .with_context(|| format!("invalid data host '{}'", self.data_host))?;
        let viewer_url = Url::parse(&self.viewer_url)
            .with_context(|| format!("invalid viewer url '{}'", self.viewer_url))?;
        // Zero means wait forever, same as leaving it unset.
        let ack_timeout = ack_timeout_secs
            .or(self.ack_timeout_secs)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Ok(SessionConfig {
            request,
            control_bind,
            data_host,
            data_port: data_port.or(self.data_port),
            ack_timeout,
            viewer_url,
        })
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
