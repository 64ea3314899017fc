//! Commandes typées vers une ressource sélectionnée.

use crate::error::{ActionError, TransportError};
use crate::payload::{PayloadDecoder, StorageState, VideoPayload};
use crate::transport::DeviceConnection;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Commandes comprises par une ressource video-store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum DeviceCommand {
    Fetch { from: String, to: String },
    GetStorageState,
}

impl DeviceCommand {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceCommand::Fetch { .. } => "fetch",
            DeviceCommand::GetStorageState => "get-storage-state",
        }
    }

    pub fn to_value(&self) -> Result<Value, TransportError> {
        serde_json::to_value(self).map_err(|e| TransportError::Malformed(e.to_string()))
    }
}

/// Poignée liée à une ressource d'un device connecté.
pub struct CommandDispatcher<C> {
    resource: String,
    connection: Arc<C>,
}

impl<C> Clone for CommandDispatcher<C> {
    fn clone(&self) -> Self {
        Self {
            resource: self.resource.clone(),
            connection: Arc::clone(&self.connection),
        }
    }
}

impl<C> std::fmt::Debug for CommandDispatcher<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("resource", &self.resource)
            .finish()
    }
}

impl<C: DeviceConnection> CommandDispatcher<C> {
    pub fn new(resource: impl Into<String>, connection: Arc<C>) -> Self {
        Self {
            resource: resource.into(),
            connection,
        }
    }

    pub fn resource_name(&self) -> &str {
        &self.resource
    }

    async fn send(&self, command: DeviceCommand) -> Result<Value, TransportError> {
        debug!(resource = %self.resource, command = command.name(), "dispatching");
        let value = command.to_value()?;
        self.connection.do_command(&self.resource, value).await
    }

    /// Demande le clip entre deux bornes au format device.
    pub async fn fetch(&self, from_wire: &str, to_wire: &str) -> Result<VideoPayload, ActionError> {
        let reply = self
            .send(DeviceCommand::Fetch {
                from: from_wire.to_string(),
                to: to_wire.to_string(),
            })
            .await?;
        Ok(VideoPayload::from_reply(&reply)?)
    }

    pub async fn get_storage_state(&self) -> Result<StorageState, TransportError> {
        let reply = self.send(DeviceCommand::GetStorageState).await?;
        Ok(PayloadDecoder::storage_state(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Répond une valeur fixe et note ce qu'on lui envoie.
    struct EchoConnection {
        reply: Result<Value, TransportError>,
        sent: Mutex<Vec<(String, Value)>>,
    }

    impl EchoConnection {
        fn replying(reply: Result<Value, TransportError>) -> Arc<Self> {
            Arc::new(Self {
                reply,
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    impl DeviceConnection for EchoConnection {
        async fn resource_names(&self) -> Result<Vec<String>, TransportError> {
            Ok(vec![])
        }

        async fn do_command(
            &self,
            resource: &str,
            command: Value,
        ) -> Result<Value, TransportError> {
            self.sent.lock().push((resource.to_string(), command));
            self.reply.clone()
        }

        async fn close(&self) {}
    }

    #[test]
    fn test_command_wire_shape() {
        let fetch = DeviceCommand::Fetch {
            from: "2024-01-01_00-00-00Z".into(),
            to: "2024-01-01_00-01-00Z".into(),
        };
        assert_eq!(
            fetch.to_value().unwrap(),
            json!({
                "command": "fetch",
                "from": "2024-01-01_00-00-00Z",
                "to": "2024-01-01_00-01-00Z"
            })
        );
        assert_eq!(
            DeviceCommand::GetStorageState.to_value().unwrap(),
            json!({"command": "get-storage-state"})
        );
    }

    #[tokio::test]
    async fn test_fetch_sends_bounds_to_bound_resource() {
        let conn = EchoConnection::replying(Ok(json!({"video": "AAEC"})));
        let dispatcher = CommandDispatcher::new("cam2", conn.clone());

        let payload = dispatcher.fetch("A", "B").await.unwrap();
        assert_eq!(payload.video_base64, "AAEC");

        let sent = conn.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "cam2");
        assert_eq!(sent[0].1, json!({"command": "fetch", "from": "A", "to": "B"}));
    }

    #[tokio::test]
    async fn test_fetch_without_video_is_decode_error() {
        let conn = EchoConnection::replying(Ok(json!({"status": "ok"})));
        let dispatcher = CommandDispatcher::new("cam1", conn);
        let err = dispatcher.fetch("A", "B").await.unwrap_err();
        assert!(matches!(err, ActionError::Decode(DecodeError::MissingVideo)));
    }

    #[tokio::test]
    async fn test_storage_state_is_verbatim() {
        let reply = json!({"usedBytes": 100, "freeBytes": 900, "segments": [{"from": "x"}]});
        let conn = EchoConnection::replying(Ok(reply.clone()));
        let dispatcher = CommandDispatcher::new("cam1", conn);
        assert_eq!(dispatcher.get_storage_state().await.unwrap().as_value(), &reply);
    }

    #[tokio::test]
    async fn test_transport_failure_surfaces() {
        let conn = EchoConnection::replying(Err(TransportError::Device("disk offline".into())));
        let dispatcher = CommandDispatcher::new("cam1", conn);
        assert_eq!(
            dispatcher.get_storage_state().await.unwrap_err(),
            TransportError::Device("disk offline".into())
        );
    }
}
