/*!
Device video-store scripté pour tester sans broker

`MockDevice` joue les deux côtés du transport : c'est le connecteur passé à
`ResourceSession` et il répond aux commandes sur la connexion qu'il renvoie.
Chaque commande est enregistrée; les réponses peuvent être retenues pour
observer le contrôleur pendant qu'une requête est en vol.
*/

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use vstore_core::error::{ConnectionError, TransportError};
use vstore_core::transport::{DeviceConnection, DeviceConnector};
use vstore_core::ConnectionParams;

/// Une commande telle que le device l'a reçue.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCommand {
    pub resource: String,
    pub command: Value,
}

impl RecordedCommand {
    /// Valeur du discriminant `command`, `""` s'il manque.
    pub fn name(&self) -> &str {
        self.command["command"].as_str().unwrap_or_default()
    }
}

type Reply = Result<Value, TransportError>;

struct DeviceScript {
    resources: Mutex<Result<Vec<String>, TransportError>>,
    connect_error: Mutex<Option<ConnectionError>>,
    queued: Mutex<HashMap<String, VecDeque<Reply>>>,
    standing: Mutex<HashMap<String, Reply>>,
    commands: Mutex<Vec<RecordedCommand>>,
    params: Mutex<Vec<ConnectionParams>>,
    connects: AtomicUsize,
    closes: AtomicUsize,
    gate: watch::Sender<bool>,
}

/// Device scripté. Les clones partagent script et enregistrements.
#[derive(Clone)]
pub struct MockDevice {
    script: Arc<DeviceScript>,
}

impl MockDevice {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            script: Arc::new(DeviceScript {
                resources: Mutex::new(Ok(Vec::new())),
                connect_error: Mutex::new(None),
                queued: Mutex::new(HashMap::new()),
                standing: Mutex::new(HashMap::new()),
                commands: Mutex::new(Vec::new()),
                params: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                gate,
            }),
        }
    }

    pub fn with_resources<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.script.resources.lock() = Ok(names.into_iter().map(Into::into).collect());
        self
    }

    /// La découverte des ressources échoue avec `error`.
    pub fn failing_discovery(self, error: TransportError) -> Self {
        *self.script.resources.lock() = Err(error);
        self
    }

    /// Chaque tentative de connexion est refusée.
    pub fn refusing_connections(self, reason: &str) -> Self {
        *self.script.connect_error.lock() = Some(ConnectionError::Establish {
            host: "mock-device".into(),
            reason: reason.into(),
        });
        self
    }

    /// Réponse à `command` quand rien n'est en file pour elle.
    pub fn reply_with(&self, command: &str, reply: Reply) -> &Self {
        self.script.standing.lock().insert(command.to_string(), reply);
        self
    }

    /// Réponse utilisée une fois, avant la réponse permanente.
    pub fn reply_once(&self, command: &str, reply: Reply) -> &Self {
        self.script
            .queued
            .lock()
            .entry(command.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Les commandes sont toujours enregistrées mais leurs réponses attendent
    /// `release_replies`.
    pub fn hold_replies(&self) {
        self.script.gate.send_replace(false);
        log::info!("⏸️ [MOCK] replies held");
    }

    pub fn release_replies(&self) {
        self.script.gate.send_replace(true);
        log::info!("▶️ [MOCK] replies released");
    }

    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.script.commands.lock().clone()
    }

    pub fn command_names(&self) -> Vec<String> {
        self.script
            .commands
            .lock()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.script.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.script.closes.load(Ordering::SeqCst)
    }

    /// Paramètres de chaque tentative de connexion, dans l'ordre.
    pub fn connection_params(&self) -> Vec<ConnectionParams> {
        self.script.params.lock().clone()
    }

    pub fn clear(&self) {
        self.script.commands.lock().clear();
    }

    fn next_reply(&self, command: &str) -> Reply {
        if let Some(reply) = self
            .script
            .queued
            .lock()
            .get_mut(command)
            .and_then(VecDeque::pop_front)
        {
            return reply;
        }
        self.script
            .standing
            .lock()
            .get(command)
            .cloned()
            .unwrap_or_else(|| {
                Err(TransportError::Device(format!("unsupported command '{command}'")))
            })
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceConnector for MockDevice {
    type Connection = MockLink;

    async fn connect(&self, params: &ConnectionParams) -> Result<MockLink, ConnectionError> {
        self.script.connects.fetch_add(1, Ordering::SeqCst);
        self.script.params.lock().push(params.clone());
        if let Some(error) = self.script.connect_error.lock().clone() {
            log::warn!("🚫 [MOCK] connection refused: {}", error);
            return Err(error);
        }
        log::info!("🔌 [MOCK] connected to {}", params.host);
        Ok(MockLink {
            device: self.clone(),
            closed: AtomicBool::new(false),
        })
    }
}

/// Connexion fournie par [`MockDevice`].
pub struct MockLink {
    device: MockDevice,
    closed: AtomicBool,
}

impl DeviceConnection for MockLink {
    async fn resource_names(&self) -> Result<Vec<String>, TransportError> {
        self.device.script.resources.lock().clone()
    }

    async fn do_command(&self, resource: &str, command: Value) -> Result<Value, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let recorded = RecordedCommand {
            resource: resource.to_string(),
            command,
        };
        let name = recorded.name().to_string();
        log::info!("📤 [MOCK] {} -> {}", name, resource);
        self.device.script.commands.lock().push(recorded);

        let mut gate = self.device.script.gate.subscribe();
        let released = gate.wait_for(|open| *open).await.is_ok();
        if !released || self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.device.next_reply(&name)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.device.script.closes.fetch_add(1, Ordering::SeqCst);
        log::info!("🔌 [MOCK] connection closed");
    }
}

/// Réponses device toutes prêtes.
pub struct ReplyBuilder;

impl ReplyBuilder {
    /// Réponse `fetch` portant un clip déjà encodé.
    pub fn video(base64: &str) -> Value {
        json!({ "video": base64 })
    }

    pub fn storage_state(used_bytes: u64, free_bytes: u64) -> Value {
        json!({ "usedBytes": used_bytes, "freeBytes": free_bytes })
    }
}
