/*!
Téléchargements en mémoire

Remplace le disque pour que les tests vérifient exactement ce qui aurait été
enregistré, et peuvent simuler un échec d'écriture.
*/

use parking_lot::Mutex;
use std::sync::Arc;
use vstore_core::error::MaterializeError;
use vstore_core::{Materialized, Materializer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedFile {
    pub filename: String,
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// Les clones partagent le même stockage.
#[derive(Clone, Default)]
pub struct MemoryMaterializer {
    saved: Arc<Mutex<Vec<SavedFile>>>,
    failure: Arc<Mutex<Option<String>>>,
}

impl MemoryMaterializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chaque écriture suivante échoue avec une erreur io portant `message`.
    pub fn fail_with(&self, message: &str) {
        *self.failure.lock() = Some(message.to_string());
    }

    pub fn saved(&self) -> Vec<SavedFile> {
        self.saved.lock().clone()
    }

    pub fn find(&self, filename: &str) -> Option<SavedFile> {
        self.saved
            .lock()
            .iter()
            .find(|f| f.filename == filename)
            .cloned()
    }
}

impl Materializer for MemoryMaterializer {
    fn materialize(
        &self,
        bytes: &[u8],
        filename: &str,
        mime_type: &str,
    ) -> Result<Materialized, MaterializeError> {
        if let Some(message) = self.failure.lock().clone() {
            return Err(MaterializeError::Io(std::io::Error::other(message)));
        }
        self.saved.lock().push(SavedFile {
            filename: filename.to_string(),
            bytes: bytes.to_vec(),
            mime_type: mime_type.to_string(),
        });
        log::info!("💾 [MOCK] saved {} ({} bytes)", filename, bytes.len());
        Ok(Materialized {
            filename: filename.to_string(),
            location: format!("memory://{filename}"),
            size_bytes: bytes.len(),
            mime_type: mime_type.to_string(),
        })
    }
}
