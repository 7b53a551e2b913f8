// SPDX-FileCopyrightText: 2025 The peerling Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use tracing::{event, Level};

/// Engine configuration. Everything has a default so a bare config file (or
/// none at all) still yields a working engine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Client id prefix; the remainder of the 20 bytes is randomized.
    pub client_id: String,
    /// Port we advertise in handshakes and tracker announces.
    pub listen_port: u16,

    // Swarm behavior
    pub allow_peer_exchange: bool,
    /// Skip Have messages for pieces the peer already claims to hold.
    pub allow_have_suppression: bool,
    pub maximum_connections: usize,

    // Web seeds
    /// Seconds after start before HTTP seeds are considered.
    pub web_seed_delay_secs: u64,
    /// Attach web seeds only while the sustained download rate is below this.
    pub web_seed_speed_trigger_bps: u64,

    // Pacing
    /// Global byte-rate ceilings; zero means unlimited.
    pub download_limit_bps: u64,
    pub upload_limit_bps: u64,
    pub tick_interval_ms: u64,
    /// Base pending-request allowance per peer.
    pub base_request_queue: u32,
    /// One extra pending request per this many kB/s of download rate.
    pub request_bonus_per_kb: u32,

    // Discovery cadence
    pub lsd_announce_interval_secs: u64,
    pub dht_announce_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            client_id: "-PE0300-".to_string(),
            listen_port: 6881,
            allow_peer_exchange: true,
            allow_have_suppression: true,
            maximum_connections: 80,
            web_seed_delay_secs: 60,
            web_seed_speed_trigger_bps: 50 * 1024,
            download_limit_bps: 0,
            upload_limit_bps: 0,
            tick_interval_ms: 500,
            base_request_queue: 4,
            request_bonus_per_kb: 10,
            lsd_announce_interval_secs: 300,
            dht_announce_interval_secs: 900,
        }
    }
}

impl Settings {
    /// Engine ticks per wall-clock second; rate counters roll on this stride.
    pub fn ticks_per_second(&self) -> u64 {
        (1000 / self.tick_interval_ms.max(1)).max(1)
    }
}

pub fn config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "peerling").map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Loads settings from the config file, overridden by `PEERLING_*` env vars.
/// Falls back to defaults if neither exists or parsing fails.
pub fn load_settings() -> Settings {
    let mut figment = Figment::from(Serialized::defaults(Settings::default()));
    if let Some(path) = config_path() {
        figment = figment.merge(Toml::file(path));
    }
    figment = figment.merge(Env::prefixed("PEERLING_"));

    match figment.extract() {
        Ok(settings) => settings,
        Err(error) => {
            event!(Level::WARN, %error, "failed to load config, using defaults");
            Settings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert!(settings.maximum_connections > 0);
        assert!(settings.tick_interval_ms >= 100);
        assert_eq!(settings.ticks_per_second(), 2);
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                listen_port = 7001
                allow_peer_exchange = false
                "#,
            )?;
            let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
                .merge(Toml::file("config.toml"))
                .extract()?;
            assert_eq!(settings.listen_port, 7001);
            assert!(!settings.allow_peer_exchange);
            assert!(settings.allow_have_suppression);
            Ok(())
        });
    }
}
