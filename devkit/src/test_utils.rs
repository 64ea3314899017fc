/*!
Test Harness pour le panneau vstore

Branche un vrai `SessionController` sur un `MockDevice` et des téléchargements
en mémoire :
- fuseau UTC, pour des valeurs device prévisibles
- une identité `operator` avec une fiche d'identifiants valide
- assertions sur les commandes envoyées, le cycle de vie et les fichiers
*/

use crate::device_stub::MockDevice;
use crate::downloads::MemoryMaterializer;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use vstore_core::{
    ActingIdentity, ApiKey, CredentialProvider, Credentials, PayloadDecoder, ResourceSession,
    SessionController, SessionLifecycle, StaticCredentials, TimeRangeCodec,
};

pub type TestController = SessionController<MockDevice, Utc>;

/// Identité pour laquelle agit le harness par défaut.
pub const OPERATOR: &str = "operator";

pub struct PanelHarness {
    pub device: MockDevice,
    pub downloads: MemoryMaterializer,
    pub controller: Arc<TestController>,
}

impl PanelHarness {
    /// Harness qui agit pour [`OPERATOR`], avec des identifiants valides.
    pub fn new(device: MockDevice) -> Self {
        let store = StaticCredentials::new().with(OPERATOR, Self::credentials());
        Self::with_credentials(device, ActingIdentity::new(OPERATOR), Arc::new(store))
    }

    pub fn with_credentials(
        device: MockDevice,
        identity: ActingIdentity,
        store: Arc<dyn CredentialProvider>,
    ) -> Self {
        env_logger::try_init().ok(); // logs pour les tests

        let downloads = MemoryMaterializer::new();
        let controller = SessionController::new(
            ResourceSession::new(device.clone(), store),
            PayloadDecoder::new(Arc::new(downloads.clone())),
            TimeRangeCodec::new(Utc),
            identity,
        );
        Self {
            device,
            downloads,
            controller: Arc::new(controller),
        }
    }

    /// Harness déjà initialisé face à un device qui expose `resources`.
    pub async fn connected(resources: &[&str]) -> Self {
        let harness = Self::new(MockDevice::new().with_resources(resources.iter().copied()));
        harness.controller.initialize().await;
        log::info!("🎬 panel connected with {} resources", resources.len());
        harness
    }

    /// Une fiche machine bien formée.
    pub fn credentials() -> Credentials {
        Credentials {
            api_key: ApiKey {
                id: "key-id".into(),
                key: "key-secret".into(),
            },
            machine_id: "machine-1".into(),
            hostname: "robot.local".into(),
        }
    }

    /// Attend que le device ait enregistré au moins `count` commandes.
    pub async fn wait_for_commands(&self, count: usize, timeout_ms: u64) -> Result<()> {
        let start = std::time::Instant::now();

        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if self.device.commands().len() >= count {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        anyhow::bail!(
            "expected {} commands within {}ms, device saw {}",
            count,
            timeout_ms,
            self.device.commands().len()
        );
    }

    /// Vérifie la séquence exacte des commandes reçues par le device.
    pub fn assert_commands(&self, expected: &[&str]) -> Result<()> {
        let actual = self.device.command_names();
        if actual != expected {
            anyhow::bail!("commands mismatch: expected {:?}, got {:?}", expected, actual);
        }
        Ok(())
    }

    pub fn assert_lifecycle(&self, expected: &SessionLifecycle) -> Result<()> {
        let actual = self.controller.lifecycle();
        if actual != *expected {
            anyhow::bail!("lifecycle mismatch: expected {:?}, got {:?}", expected, actual);
        }
        Ok(())
    }

    pub fn assert_saved(&self, filename: &str, bytes: &[u8]) -> Result<()> {
        let Some(file) = self.downloads.find(filename) else {
            anyhow::bail!("no download named '{}', saved: {:?}", filename, self.saved_names());
        };
        if file.bytes != bytes {
            anyhow::bail!(
                "download '{}' has {} bytes, expected {}",
                filename,
                file.bytes.len(),
                bytes.len()
            );
        }
        if file.mime_type != "video/mp4" {
            anyhow::bail!("download '{}' saved as {}", filename, file.mime_type);
        }
        Ok(())
    }

    pub fn assert_nothing_saved(&self) -> Result<()> {
        let names = self.saved_names();
        if !names.is_empty() {
            anyhow::bail!("expected no downloads, got {:?}", names);
        }
        Ok(())
    }

    fn saved_names(&self) -> Vec<String> {
        self.downloads.saved().into_iter().map(|f| f.filename).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_harness_connects_and_records() {
        let harness = PanelHarness::connected(&["cam1"]).await;
        harness.assert_lifecycle(&SessionLifecycle::Ready).unwrap();
        assert_eq!(harness.device.connection_params()[0].auth_entity_id, "key-id");

        harness.device.reply_with("get-storage-state", Ok(json!({})));
        harness.controller.select("cam1").unwrap();
        harness.controller.get_storage_state().await;
        harness.wait_for_commands(1, 500).await.unwrap();
        harness.assert_commands(&["get-storage-state"]).unwrap();
        assert!(harness.assert_commands(&["fetch"]).is_err());
        harness.assert_nothing_saved().unwrap();
    }
}
