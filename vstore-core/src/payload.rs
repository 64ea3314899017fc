/*!
Charges utiles des réponses et matérialisation

Une réponse `fetch` transporte le clip en base64; il est décodé puis confié à
un [`Materializer`] qui l'enregistre sous le nom conventionnel.
Une réponse `get-storage-state` est gardée telle quelle et seulement indentée
pour l'affichage.
*/

use crate::error::{ActionError, DecodeError, MaterializeError};
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use serde::Serialize;
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub const VIDEO_MIME: &str = "video/mp4";

/// Champ de la réponse qui contient le clip base64.
pub const VIDEO_FIELD: &str = "video";

// alphabet standard, padding facultatif, bits résiduels ignorés (comme atob)
const VIDEO_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Clip base64 extrait d'une réponse `fetch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoPayload {
    pub video_base64: String,
}

impl VideoPayload {
    /// La réponse doit porter une chaîne non vide sous `video`.
    pub fn from_reply(reply: &Value) -> Result<Self, DecodeError> {
        match reply.get(VIDEO_FIELD) {
            Some(Value::String(video)) if !video.is_empty() => Ok(Self {
                video_base64: video.clone(),
            }),
            _ => Err(DecodeError::MissingVideo),
        }
    }
}

/// État du stockage, exactement tel que le device l'a renvoyé.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct StorageState(pub Value);

impl StorageState {
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// JSON indenté sur deux espaces, ordre des champs conservé.
    pub fn pretty(&self) -> String {
        serde_json::to_string_pretty(&self.0).unwrap_or_else(|_| self.0.to_string())
    }
}

/// Où le clip a atterri une fois matérialisé.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Materialized {
    pub filename: String,
    pub location: String,
    pub size_bytes: usize,
    pub mime_type: String,
}

/// Capacité plateforme : enregistrer `bytes` sous le nom `filename`.
pub trait Materializer: Send + Sync {
    fn materialize(
        &self,
        bytes: &[u8],
        filename: &str,
        mime_type: &str,
    ) -> Result<Materialized, MaterializeError>;
}

/// `{resource}_{from}_{to}.mp4`; `video` remplace un nom de ressource absent.
pub fn video_filename(resource_name: &str, from_wire: &str, to_wire: &str) -> String {
    let base = if resource_name.is_empty() { "video" } else { resource_name };
    format!("{base}_{from_wire}_{to_wire}.mp4")
}

/// Garde un téléchargement dans son dossier cible.
pub fn sanitize_filename(filename: &str) -> Result<String, MaterializeError> {
    let cleaned: String = filename
        .chars()
        .map(|c| match c {
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().to_string();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        return Err(MaterializeError::InvalidFilename(filename.to_string()));
    }
    Ok(cleaned)
}

/// Enregistre les téléchargements dans un dossier.
///
/// Les octets passent d'abord par un fichier `.part` à côté de la cible, puis
/// sont déplacés en place. Le fichier transitoire ne survit jamais à l'appel :
/// il est renommé ou supprimé.
#[derive(Debug, Clone)]
pub struct DiskMaterializer {
    dir: PathBuf,
}

impl DiskMaterializer {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Materializer for DiskMaterializer {
    fn materialize(
        &self,
        bytes: &[u8],
        filename: &str,
        mime_type: &str,
    ) -> Result<Materialized, MaterializeError> {
        let filename = sanitize_filename(filename)?;
        std::fs::create_dir_all(&self.dir)?;
        let target = self.dir.join(&filename);

        let mut staging = tempfile::Builder::new()
            .prefix(".vstore-")
            .suffix(".part")
            .tempfile_in(&self.dir)?;
        staging.write_all(bytes)?;
        staging.flush()?;
        // en cas d'échec, PersistError garde le fichier et le supprime au drop
        staging.persist(&target).map_err(|e| e.error)?;

        info!(file = %target.display(), size = bytes.len(), "download saved");
        Ok(Materialized {
            filename,
            location: target.display().to_string(),
            size_bytes: bytes.len(),
            mime_type: mime_type.to_string(),
        })
    }
}

/// Transforme les réponses brutes en artefacts visibles.
#[derive(Clone)]
pub struct PayloadDecoder {
    materializer: Arc<dyn Materializer>,
}

impl PayloadDecoder {
    pub fn new(materializer: Arc<dyn Materializer>) -> Self {
        Self { materializer }
    }

    /// Alphabet standard, avec ou sans padding; les blancs ASCII sont ignorés.
    pub fn decode_video(video_base64: &str) -> Result<Vec<u8>, DecodeError> {
        let compact: String = video_base64
            .chars()
            .filter(|c| !c.is_ascii_whitespace())
            .collect();
        Ok(VIDEO_BASE64.decode(compact)?)
    }

    /// Décode le clip et l'enregistre sous `filename` (`video/mp4`).
    pub fn materialize_video(
        &self,
        video_base64: &str,
        filename: &str,
    ) -> Result<Materialized, ActionError> {
        let bytes = Self::decode_video(video_base64)?;
        debug!(filename, size = bytes.len(), "video payload decoded");
        Ok(self.materializer.materialize(&bytes, filename, VIDEO_MIME)?)
    }

    /// Les réponses structurées passent sans modification.
    pub fn storage_state(reply: Value) -> StorageState {
        StorageState(reply)
    }
}
