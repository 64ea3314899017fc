use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PanelConfig {
    /// Adresse d'écoute de l'API HTTP.
    pub listen: String,
    /// Identité active; vide, le panneau reste vide.
    pub machine_id: String,
    /// Fiche d'identifiants à utiliser, `machine_id` par défaut.
    pub credential_key: Option<String>,
    pub credentials_file: String,
    pub download_dir: String,
    pub mqtt: MqttConf,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MqttConf {
    pub port: u16,
    pub topic_prefix: String,
    pub keep_alive_secs: u64,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".into(),
            machine_id: String::new(),
            credential_key: None,
            credentials_file: "credentials.json".into(),
            download_dir: "downloads".into(),
            mqtt: MqttConf::default(),
        }
    }
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            port: 1883,
            topic_prefix: "vstore".into(),
            keep_alive_secs: 30,
        }
    }
}

impl MqttConf {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

impl PanelConfig {
    pub fn credential_key(&self) -> &str {
        self.credential_key.as_deref().unwrap_or(&self.machine_id)
    }

    /// `VSTORE_MACHINE_ID` et `VSTORE_LISTEN` priment sur le fichier.
    pub fn apply_env_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(machine_id) = var("VSTORE_MACHINE_ID") {
            self.machine_id = machine_id;
        }
        if let Some(listen) = var("VSTORE_LISTEN").filter(|v| !v.trim().is_empty()) {
            self.listen = listen;
        }
    }
}

pub async fn load_config() -> PanelConfig {
    let path = std::env::var("VSTORE_PANEL_CONFIG").unwrap_or_else(|_| "panel.yaml".into());
    let mut cfg = load_config_from(&path).await;
    cfg.apply_env_overrides(|name| std::env::var(name).ok());
    cfg
}

pub async fn load_config_from(path: impl AsRef<Path>) -> PanelConfig {
    let path = path.as_ref();
    if !path.exists() {
        warn!(path = %path.display(), "no panel config, using defaults");
        return PanelConfig::default();
    }
    let txt = fs::read_to_string(path).await.unwrap_or_default();
    if txt.trim().is_empty() {
        return PanelConfig::default();
    }
    serde_yaml::from_str(&txt).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "invalid panel config, using defaults");
        PanelConfig::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("panel.yaml");
        std::fs::write(&path, "machine_id: robot-7\nmqtt:\n  port: 8883\n").unwrap();

        let cfg = load_config_from(&path).await;
        assert_eq!(cfg.machine_id, "robot-7");
        assert_eq!(cfg.credential_key(), "robot-7");
        assert_eq!(cfg.mqtt.port, 8883);
        assert_eq!(cfg.mqtt.topic_prefix, "vstore");
        assert_eq!(cfg.listen, "0.0.0.0:8080");
    }

    #[tokio::test]
    async fn test_missing_empty_or_invalid_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let absent = dir.path().join("absent.yaml");
        assert_eq!(load_config_from(&absent).await, PanelConfig::default());

        let empty = dir.path().join("empty.yaml");
        std::fs::write(&empty, "  \n").unwrap();
        assert_eq!(load_config_from(&empty).await, PanelConfig::default());

        let invalid = dir.path().join("invalid.yaml");
        std::fs::write(&invalid, "mqtt: [not, a, map]\n").unwrap();
        assert_eq!(load_config_from(&invalid).await, PanelConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> =
            [("VSTORE_MACHINE_ID", "robot-9"), ("VSTORE_LISTEN", " ")].into();
        let mut cfg = PanelConfig {
            credential_key: Some("shared".into()),
            ..PanelConfig::default()
        };
        cfg.apply_env_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(cfg.machine_id, "robot-9");
        assert_eq!(cfg.listen, "0.0.0.0:8080");
        assert_eq!(cfg.credential_key(), "shared");
    }
}
