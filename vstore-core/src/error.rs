//! Types d'erreur du parcours de session.
//!
//! Le contrôleur les capture toutes à la frontière d'une action et les change
//! en un message unique pour l'utilisateur; aucune ne remonte en panic.

use thiserror::Error;

/// Identifiants absents ou inutilisables. Toujours levée avant le réseau.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("no credentials stored for '{0}'")]
    MissingRecord(String),
    #[error("API credentials not found")]
    EmptyCredentials,
    #[error("credential store unreadable: {0}")]
    Store(String),
}

/// La connexion au device n'a pas pu s'établir.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("invalid device host '{0}'")]
    InvalidHost(String),
    #[error("connection to {host} failed: {reason}")]
    Establish { host: String, reason: String },
}

/// Échec d'un aller-retour de commande.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to send request: {0}")]
    Publish(String),
    #[error("connection lost before the device replied")]
    ConnectionLost,
    #[error("connection closed")]
    Closed,
    #[error("device error: {0}")]
    Device(String),
    #[error("malformed reply: {0}")]
    Malformed(String),
}

/// Tout ce qui empêche l'ouverture d'une session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("resource discovery failed: {0}")]
    Discovery(#[from] TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("no device connection yet")]
    NotConnected,
    #[error("unknown resource '{0}'")]
    UnknownResource(String),
}

/// Préconditions vérifiées avant tout envoi.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("select a video-store resource first")]
    NoResourceSelected,
    #[error("select a valid time range")]
    InvalidTimeRange,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("no video data in response")]
    MissingVideo,
    #[error("invalid base64 video payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
}

#[derive(Debug, Error)]
pub enum MaterializeError {
    #[error("invalid download filename '{0}'")]
    InvalidFilename(String),
    #[error("failed to save download: {0}")]
    Io(#[from] std::io::Error),
}

/// Échec d'une action opérateur, tel que remonté par le contrôleur.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Materialize(#[from] MaterializeError),
    #[error("resource selection changed while the request was in flight")]
    Superseded,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_facing_messages() {
        assert_eq!(
            ActionError::from(ValidationError::NoResourceSelected).to_string(),
            "select a video-store resource first"
        );
        assert_eq!(
            ActionError::from(DecodeError::MissingVideo).to_string(),
            "no video data in response"
        );
        assert_eq!(AuthError::EmptyCredentials.to_string(), "API credentials not found");
    }

    #[test]
    fn test_session_error_wraps_sources() {
        let err: SessionError = TransportError::ConnectionLost.into();
        assert!(matches!(err, SessionError::Discovery(TransportError::ConnectionLost)));
        assert!(err.to_string().contains("resource discovery failed"));
    }
}
