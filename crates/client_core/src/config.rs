use std::{collections::HashMap, fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

use crate::{connection::ReconnectPolicy, identity::Identity};

pub const DEFAULT_CONFIG_FILE: &str = "consult.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SyncSettings {
    pub server_url: String,
    pub history_page_size: u32,
    pub roster_page_size: u32,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_max_retries: u32,
    pub token: Option<String>,
    pub guest_id: Option<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        let policy = ReconnectPolicy::default();
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            history_page_size: 50,
            roster_page_size: 20,
            reconnect_base_ms: policy.base_delay.as_millis() as u64,
            reconnect_max_ms: policy.max_delay.as_millis() as u64,
            reconnect_max_retries: policy.max_retries,
            token: None,
            guest_id: None,
        }
    }
}

impl SyncSettings {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_ms),
            max_delay: Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_base_ms)),
            max_retries: self.reconnect_max_retries,
        }
    }

    /// A token beats a guest id; with neither, a fresh guest id is minted.
    pub fn identity(&self) -> Identity {
        match (&self.token, &self.guest_id) {
            (Some(token), _) => Identity::user(token.clone()),
            (None, Some(guest_id)) => Identity::guest(guest_id.clone()),
            (None, None) => Identity::new_guest(),
        }
    }

    /// Overlays keys found in a toml document. Unknown keys are ignored.
    pub fn apply_file(&mut self, raw: &str) -> anyhow::Result<()> {
        let file_cfg: HashMap<String, toml::Value> =
            toml::from_str(raw).context("config file is not valid toml")?;
        for (key, value) in file_cfg {
            let text = match value {
                toml::Value::String(v) => v,
                toml::Value::Integer(v) => v.to_string(),
                other => other.to_string(),
            };
            self.set(&key, text)
                .with_context(|| format!("invalid value for `{key}` in config file"))?;
        }
        Ok(())
    }

    /// Overlays environment variables. `lookup` is `std::env::var` outside tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CONSULT_SERVER_URL") {
            self.server_url = v;
        }
        for key in [
            "server_url",
            "history_page_size",
            "roster_page_size",
            "reconnect_base_ms",
            "reconnect_max_ms",
            "reconnect_max_retries",
        ] {
            let var = format!("APP__{}", key.to_ascii_uppercase());
            if let Some(v) = lookup(&var) {
                self.set(key, v).with_context(|| format!("invalid value in {var}"))?;
            }
        }
        if let Some(v) = lookup("CONSULT_TOKEN") {
            self.token = Some(v);
        }
        if let Some(v) = lookup("CONSULT_GUEST_ID") {
            self.guest_id = Some(v);
        }
        Ok(())
    }

    fn set(&mut self, key: &str, value: String) -> anyhow::Result<()> {
        match key {
            "server_url" => self.server_url = value,
            "history_page_size" => self.history_page_size = value.parse()?,
            "roster_page_size" => self.roster_page_size = value.parse()?,
            "reconnect_base_ms" => self.reconnect_base_ms = value.parse()?,
            "reconnect_max_ms" => self.reconnect_max_ms = value.parse()?,
            "reconnect_max_retries" => self.reconnect_max_retries = value.parse()?,
            "token" => self.token = Some(value),
            "guest_id" => self.guest_id = Some(value),
            _ => {}
        }
        Ok(())
    }
}

/// Defaults, then `consult.toml` in the working directory, then the environment.
pub fn load_settings() -> anyhow::Result<SyncSettings> {
    load_settings_from(Path::new(DEFAULT_CONFIG_FILE))
}

pub fn load_settings_from(path: &Path) -> anyhow::Result<SyncSettings> {
    let mut settings = SyncSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        settings
            .apply_file(&raw)
            .with_context(|| format!("failed to load {}", path.display()))?;
    }
    settings.apply_env(|key| std::env::var(key).ok())?;

    Ok(settings)
}

#[cfg(test)]
mod tests {
    use std::{
        env,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::*;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn file_values_override_defaults() {
        let mut settings = SyncSettings::default();
        settings
            .apply_file(
                r#"
                server_url = "https://chat.example.com"
                history_page_size = 30
                reconnect_max_retries = 3
                unrelated = true
                "#,
            )
            .expect("apply file");

        assert_eq!(settings.server_url, "https://chat.example.com");
        assert_eq!(settings.history_page_size, 30);
        assert_eq!(settings.reconnect_max_retries, 3);
        assert_eq!(settings.roster_page_size, SyncSettings::default().roster_page_size);
    }

    #[test]
    fn env_overrides_file_and_app_prefix_wins() {
        let mut settings = SyncSettings::default();
        settings
            .apply_file("server_url = \"http://from-file\"")
            .expect("apply file");
        settings
            .apply_env(env_from(&[
                ("CONSULT_SERVER_URL", "http://plain-env"),
                ("APP__SERVER_URL", "http://app-env"),
                ("APP__RECONNECT_BASE_MS", "250"),
            ]))
            .expect("apply env");

        assert_eq!(settings.server_url, "http://app-env");
        assert_eq!(settings.reconnect_base_ms, 250);
    }

    #[test]
    fn malformed_numbers_are_errors() {
        let mut settings = SyncSettings::default();
        assert!(settings
            .apply_env(env_from(&[("APP__HISTORY_PAGE_SIZE", "lots")]))
            .is_err());
        assert!(settings.apply_file("roster_page_size = \"ten\"").is_err());
    }

    #[test]
    fn token_takes_precedence_over_guest_id() {
        let mut settings = SyncSettings::default();
        settings
            .apply_env(env_from(&[
                ("CONSULT_TOKEN", "tok"),
                ("CONSULT_GUEST_ID", "g-1"),
            ]))
            .expect("apply env");
        assert_eq!(settings.identity(), Identity::user("tok"));

        settings.token = None;
        assert_eq!(settings.identity(), Identity::guest("g-1"));

        settings.guest_id = None;
        assert!(settings.identity().is_guest());
    }

    #[test]
    fn reconnect_policy_never_caps_below_base() {
        let settings = SyncSettings {
            reconnect_base_ms: 2_000,
            reconnect_max_ms: 500,
            ..SyncSettings::default()
        };
        let policy = settings.reconnect_policy();
        assert_eq!(policy.base_delay, Duration::from_millis(2_000));
        assert_eq!(policy.max_delay, Duration::from_millis(2_000));
    }

    #[test]
    fn loads_settings_file_from_disk() {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = env::temp_dir().join(format!("consult_settings_test_{suffix}.toml"));
        fs::write(&path, "roster_page_size = 7\n").expect("write config");

        let settings = load_settings_from(&path).expect("load settings");
        assert_eq!(settings.roster_page_size, 7);

        fs::remove_file(path).expect("cleanup");
    }
}
