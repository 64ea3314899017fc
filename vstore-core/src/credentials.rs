//! Identifiants device et fournisseurs qui les retrouvent.
//!
//! Les identifiants sont lus par clé juste avant une tentative de connexion
//! et abandonnés dès que les paramètres sont passés au transport. Rien ici ne
//! met en cache ni n'écrit de secret.

use crate::error::AuthError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Paire de clé API émise par le cloud device.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKey {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub key: String,
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKey")
            .field("id", &self.id)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Fiche machine stockée, même forme que l'export machine du cloud device :
/// `{"apiKey": {"id": .., "key": ..}, "machineId": .., "hostname": ..}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    #[serde(default)]
    pub api_key: ApiKey,
    #[serde(default)]
    pub machine_id: String,
    #[serde(default)]
    pub hostname: String,
}

impl Credentials {
    pub fn into_params(self) -> ConnectionParams {
        ConnectionParams {
            host: self.hostname,
            auth_entity_id: self.api_key.id,
            auth_payload: self.api_key.key,
            machine_identifier: self.machine_id,
        }
    }
}

/// Ce dont le transport a besoin pour ouvrir une connexion authentifiée.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub auth_entity_id: String,
    pub auth_payload: String,
    pub machine_identifier: String,
}

impl ConnectionParams {
    /// Id d'entité et secret doivent être présents avant tout appel réseau.
    pub fn validate(&self) -> Result<(), AuthError> {
        if self.auth_entity_id.trim().is_empty() || self.auth_payload.trim().is_empty() {
            return Err(AuthError::EmptyCredentials);
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("auth_entity_id", &self.auth_entity_id)
            .field("auth_payload", &"<redacted>")
            .field("machine_identifier", &self.machine_identifier)
            .finish()
    }
}

/// Source d'identifiants, indexée par l'identifiant de la page machine.
pub trait CredentialProvider: Send + Sync {
    fn lookup(&self, key: &str) -> Result<Credentials, AuthError>;
}

/// Fichier JSON clé -> fiche machine. Relu à chaque recherche.
#[derive(Debug, Clone)]
pub struct JsonFileCredentials {
    path: PathBuf,
}

impl JsonFileCredentials {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialProvider for JsonFileCredentials {
    fn lookup(&self, key: &str) -> Result<Credentials, AuthError> {
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| AuthError::Store(format!("{}: {}", self.path.display(), e)))?;
        let mut records: HashMap<String, Credentials> = serde_json::from_str(&content)
            .map_err(|e| AuthError::Store(format!("{}: {}", self.path.display(), e)))?;
        records
            .remove(key)
            .ok_or_else(|| AuthError::MissingRecord(key.to_string()))
    }
}

/// Fournisseur en mémoire, pour l'intégration et les tests.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    records: HashMap<String, Credentials>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, credentials: Credentials) -> Self {
        self.records.insert(key.to_string(), credentials);
        self
    }
}

impl CredentialProvider for StaticCredentials {
    fn lookup(&self, key: &str) -> Result<Credentials, AuthError> {
        self.records
            .get(key)
            .cloned()
            .ok_or_else(|| AuthError::MissingRecord(key.to_string()))
    }
}
