/*!
LIEN MQTT DEVICE

RÔLE :
Transporte le RPC générique "exécuter une commande sur une ressource" entre
le panneau et le bridge du device.

FONCTIONNEMENT :
- un client par session, authentifié avec la paire de clé API
  (id d'entité en username, secret en password)
- chaque requête porte un `request_id` et le topic privé `reply_to` du panneau
- une tâche event loop renvoie les réponses à l'appelant en attente via un
  canal oneshot (request_id -> sender)
- quand le lien broker tombe, toutes les requêtes en attente échouent avec
  `ConnectionLost`; rien n'est renvoyé
- un appelant qui abandonne sa requête retire son entrée de la table

TOPICS (sous `{prefix}/{machine_id}`) :
- `resources@v1`      -> `{request_id, reply_to}`
- `command@v1`        -> `{request_id, reply_to, resource, command}`
- `reply@v1/{client}` <- `{"type":"success"|"error", request_id, data|error}`
*/

use super::{DeviceConnection, DeviceConnector};
use crate::credentials::ConnectionParams;
use crate::error::{ConnectionError, TransportError};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_TOPIC_PREFIX: &str = "vstore";

/// Topics d'une machine, vus par un client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTopics {
    pub resources: String,
    pub command: String,
    pub reply: String,
}

impl DeviceTopics {
    pub fn new(prefix: &str, machine_id: &str, client_id: &str) -> Self {
        Self {
            resources: format!("{prefix}/{machine_id}/resources@v1"),
            command: format!("{prefix}/{machine_id}/command@v1"),
            reply: format!("{prefix}/{machine_id}/reply@v1/{client_id}"),
        }
    }
}

#[derive(Debug, Serialize)]
struct ResourcesRequest<'a> {
    request_id: &'a str,
    reply_to: &'a str,
}

#[derive(Debug, Serialize)]
struct CommandRequest<'a> {
    request_id: &'a str,
    reply_to: &'a str,
    resource: &'a str,
    command: Value,
}

/// Enveloppe de réponse publiée par le bridge.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceReply {
    Success {
        request_id: String,
        #[serde(default)]
        data: Value,
    },
    Error {
        request_id: String,
        error: String,
    },
}

impl DeviceReply {
    pub fn request_id(&self) -> &str {
        match self {
            DeviceReply::Success { request_id, .. } => request_id,
            DeviceReply::Error { request_id, .. } => request_id,
        }
    }
}

type ReplySender = oneshot::Sender<Result<Value, TransportError>>;
type ReplyReceiver = oneshot::Receiver<Result<Value, TransportError>>;

/// Requêtes en attente de réponse : request_id -> sender.
#[derive(Clone, Default)]
struct PendingRequests {
    inner: Arc<Mutex<HashMap<String, ReplySender>>>,
}

impl PendingRequests {
    /// Enregistre `request_id`. L'entrée disparaît avec le `PendingSlot`
    /// retourné, que la réponse soit arrivée ou non.
    fn track<'a>(&'a self, request_id: &'a str) -> (PendingSlot<'a>, ReplyReceiver) {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().insert(request_id.to_string(), tx);
        let slot = PendingSlot {
            pending: self,
            request_id,
        };
        (slot, rx)
    }

    fn forget(&self, request_id: &str) {
        self.inner.lock().remove(request_id);
    }

    /// Remet une réponse à son destinataire. `false` pour un request_id inconnu.
    fn resolve(&self, reply: DeviceReply) -> bool {
        let Some(sender) = self.inner.lock().remove(reply.request_id()) else {
            return false;
        };
        let result = match reply {
            DeviceReply::Success { data, .. } => Ok(data),
            DeviceReply::Error { error, .. } => Err(TransportError::Device(error)),
        };
        // l'appelant a pu partir entre-temps
        let _ = sender.send(result);
        true
    }

    fn fail_all(&self, err: TransportError) -> usize {
        let drained: Vec<ReplySender> = self.inner.lock().drain().map(|(_, tx)| tx).collect();
        let count = drained.len();
        for sender in drained {
            let _ = sender.send(Err(err.clone()));
        }
        count
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

struct PendingSlot<'a> {
    pending: &'a PendingRequests,
    request_id: &'a str,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.forget(self.request_id);
    }
}

/// Découpe `host[:port]`, avec `default_port` si le port manque.
pub fn split_host(host: &str, default_port: u16) -> Result<(String, u16), ConnectionError> {
    let host = host.trim();
    let (name, port) = match host.rsplit_once(':') {
        Some((name, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| ConnectionError::InvalidHost(host.to_string()))?;
            (name, port)
        }
        None => (host, default_port),
    };
    if name.is_empty() {
        return Err(ConnectionError::InvalidHost(host.to_string()));
    }
    Ok((name.to_string(), port))
}

/// Ouvre des sessions MQTT vers les bridges device.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    topic_prefix: String,
    default_port: u16,
    keep_alive: Duration,
}

impl Default for MqttConnector {
    fn default() -> Self {
        Self {
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            default_port: DEFAULT_MQTT_PORT,
            keep_alive: Duration::from_secs(30),
        }
    }
}

impl MqttConnector {
    pub fn new(topic_prefix: impl Into<String>) -> Self {
        Self {
            topic_prefix: topic_prefix.into(),
            ..Self::default()
        }
    }

    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }
}

impl DeviceConnector for MqttConnector {
    type Connection = MqttConnection;

    async fn connect(&self, params: &ConnectionParams) -> Result<MqttConnection, ConnectionError> {
        let (host, port) = split_host(&params.host, self.default_port)?;
        let client_id = format!("vstore-panel-{}", Uuid::new_v4().simple());
        let machine_id = if params.machine_identifier.is_empty() {
            host.as_str()
        } else {
            params.machine_identifier.as_str()
        };
        let topics = DeviceTopics::new(&self.topic_prefix, machine_id, &client_id);

        let mut options = MqttOptions::new(client_id.clone(), host.clone(), port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        options.set_credentials(params.auth_entity_id.clone(), params.auth_payload.clone());

        let (client, mut eventloop) = AsyncClient::new(options, 10);

        // attendre que le broker accepte (ou refuse) les identifiants
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(ConnectionError::Establish {
                        host: format!("{host}:{port}"),
                        reason: e.to_string(),
                    })
                }
            }
        }

        client
            .subscribe(topics.reply.clone(), QoS::AtLeastOnce)
            .await
            .map_err(|e| ConnectionError::Establish {
                host: format!("{host}:{port}"),
                reason: format!("subscribe failed: {e}"),
            })?;

        let pending = PendingRequests::default();
        let closing = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(drive_event_loop(
            eventloop,
            client.clone(),
            topics.reply.clone(),
            pending.clone(),
            closing.clone(),
        ));

        info!(%host, port, client = %client_id, "device connection established");
        Ok(MqttConnection {
            client,
            topics,
            pending,
            closing,
            event_loop: Mutex::new(Some(task)),
        })
    }
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    reply_topic: String,
    pending: PendingRequests,
    closing: Arc<AtomicBool>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(publish))) if publish.topic == reply_topic => {
                match serde_json::from_slice::<DeviceReply>(&publish.payload) {
                    Ok(reply) => {
                        let request_id = reply.request_id().to_string();
                        if !pending.resolve(reply) {
                            debug!(%request_id, "reply for unknown request");
                        }
                    }
                    Err(e) => warn!(error = %e, "invalid device reply"),
                }
            }
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                // clean session : l'abonnement aux réponses ne survit pas à une reconnexion
                if let Err(e) = client.try_subscribe(reply_topic.clone(), QoS::AtLeastOnce) {
                    warn!(error = %e, "failed to restore reply subscription");
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                if closing.load(Ordering::Relaxed) {
                    break;
                }
                let failed = pending.fail_all(TransportError::ConnectionLost);
                error!(error = %e, failed, "MQTT connection error");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
    debug!("device event loop stopped");
}

/// Session MQTT active avec un bridge device.
pub struct MqttConnection {
    client: AsyncClient,
    topics: DeviceTopics,
    pending: PendingRequests,
    closing: Arc<AtomicBool>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl MqttConnection {
    async fn round_trip(
        &self,
        topic: &str,
        request_id: &str,
        payload: Vec<u8>,
    ) -> Result<Value, TransportError> {
        if self.closing.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        let (_slot, rx) = self.pending.track(request_id);

        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;

        rx.await.unwrap_or(Err(TransportError::Closed))
    }
}

impl DeviceConnection for MqttConnection {
    async fn resource_names(&self) -> Result<Vec<String>, TransportError> {
        let request_id = Uuid::new_v4().to_string();
        let payload = serde_json::to_vec(&ResourcesRequest {
            request_id: &request_id,
            reply_to: &self.topics.reply,
        })
        .map_err(|e| TransportError::Malformed(e.to_string()))?;

        let data = self
            .round_trip(&self.topics.resources, &request_id, payload)
            .await?;
        serde_json::from_value(data).map_err(|e| TransportError::Malformed(e.to_string()))
    }

    async fn do_command(&self, resource: &str, command: Value) -> Result<Value, TransportError> {
        let request_id = Uuid::new_v4().to_string();
        let payload = serde_json::to_vec(&CommandRequest {
            request_id: &request_id,
            reply_to: &self.topics.reply,
            resource,
            command,
        })
        .map_err(|e| TransportError::Malformed(e.to_string()))?;

        debug!(%request_id, resource, "sending device command");
        self.round_trip(&self.topics.command, &request_id, payload)
            .await
    }

    async fn close(&self) {
        self.closing.store(true, Ordering::Relaxed);
        let task = self.event_loop.lock().take();
        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "disconnect request not delivered");
        }
        let failed = self.pending.fail_all(TransportError::Closed);
        if let Some(task) = task {
            let abort = task.abort_handle();
            if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                abort.abort();
            }
        }
        info!(failed, "device connection closed");
    }
}

impl Drop for MqttConnection {
    fn drop(&mut self) {
        if let Some(task) = self.event_loop.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_topics_layout() {
        let topics = DeviceTopics::new("vstore", "m-1", "panel-a");
        assert_eq!(topics.resources, "vstore/m-1/resources@v1");
        assert_eq!(topics.command, "vstore/m-1/command@v1");
        assert_eq!(topics.reply, "vstore/m-1/reply@v1/panel-a");
    }

    #[test]
    fn test_split_host() {
        assert_eq!(split_host("broker.local", 1883).unwrap(), ("broker.local".into(), 1883));
        assert_eq!(split_host("broker.local:8883", 1883).unwrap(), ("broker.local".into(), 8883));
        assert!(matches!(split_host("", 1883), Err(ConnectionError::InvalidHost(_))));
        assert!(matches!(split_host(":1883", 1883), Err(ConnectionError::InvalidHost(_))));
        assert!(matches!(
            split_host("host:notaport", 1883),
            Err(ConnectionError::InvalidHost(_))
        ));
    }

    #[test]
    fn test_command_envelope() {
        let envelope = CommandRequest {
            request_id: "r1",
            reply_to: "vstore/m/reply@v1/c",
            resource: "video-store",
            command: json!({"command": "get-storage-state"}),
        };
        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({
                "request_id": "r1",
                "reply_to": "vstore/m/reply@v1/c",
                "resource": "video-store",
                "command": {"command": "get-storage-state"}
            })
        );
    }

    #[test]
    fn test_reply_envelope_parsing() {
        let ok: DeviceReply =
            serde_json::from_str(r#"{"type":"success","request_id":"a","data":{"x":1}}"#).unwrap();
        assert_eq!(
            ok,
            DeviceReply::Success {
                request_id: "a".into(),
                data: json!({"x": 1})
            }
        );

        let empty: DeviceReply =
            serde_json::from_str(r#"{"type":"success","request_id":"b"}"#).unwrap();
        assert_eq!(
            empty,
            DeviceReply::Success {
                request_id: "b".into(),
                data: Value::Null
            }
        );

        let err: DeviceReply =
            serde_json::from_str(r#"{"type":"error","request_id":"c","error":"boom"}"#).unwrap();
        assert_eq!(err.request_id(), "c");
    }

    #[tokio::test]
    async fn test_pending_reply_routing() {
        let pending = PendingRequests::default();
        let (_ok_slot, rx_ok) = pending.track("ok");
        let (_err_slot, rx_err) = pending.track("err");

        assert!(pending.resolve(DeviceReply::Success {
            request_id: "ok".into(),
            data: json!([1])
        }));
        assert!(pending.resolve(DeviceReply::Error {
            request_id: "err".into(),
            error: "nope".into()
        }));
        assert!(!pending.resolve(DeviceReply::Success {
            request_id: "ghost".into(),
            data: Value::Null
        }));

        assert_eq!(rx_ok.await.unwrap(), Ok(json!([1])));
        assert_eq!(rx_err.await.unwrap(), Err(TransportError::Device("nope".into())));
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn test_connection_loss_fails_every_waiter() {
        let pending = PendingRequests::default();
        let (_first_slot, first) = pending.track("1");
        let (_second_slot, second) = pending.track("2");

        assert_eq!(pending.fail_all(TransportError::ConnectionLost), 2);
        assert_eq!(first.await.unwrap(), Err(TransportError::ConnectionLost));
        assert_eq!(second.await.unwrap(), Err(TransportError::ConnectionLost));
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_request_leaves_no_entry() {
        let pending = PendingRequests::default();
        let (slot, rx) = pending.track("gone");
        let (_kept_slot, _kept) = pending.track("kept");
        assert_eq!(pending.len(), 2);

        // l'appelant abandonne avant la réponse
        drop(rx);
        drop(slot);
        assert_eq!(pending.len(), 1);
        assert!(!pending.resolve(DeviceReply::Success {
            request_id: "gone".into(),
            data: Value::Null
        }));
    }
}
