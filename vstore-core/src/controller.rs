/*!
CONTRÔLEUR DE SESSION - machine d'état derrière le panneau

RÔLE :
Transforme les actions opérateur (choix d'une ressource, édition de la fenêtre,
récupération d'un clip, état du stockage) en commandes device et garde tout ce
que l'interface affiche.

RÈGLES :
- la session s'ouvre une seule fois (`initialize`), les appels suivants ne font rien
- chaque type d'action a son propre état; un fetch en cours ne bloque jamais
  une requête d'état du stockage et inversement
- un déclenchement pendant qu'une action du même type est en vol est ignoré,
  pas mis en file
- les préconditions (sélection, fenêtre lisible) sont vérifiées avant tout envoi
- resélectionner incrémente un compteur de génération; un résultat qui revient
  pour une génération plus ancienne est jeté
- un futur d'action abandonné avant la fin rend son slot à `Idle`

Le verrou d'état n'est jamais tenu à travers un `.await`.
*/

use crate::dispatcher::CommandDispatcher;
use crate::error::{ActionError, SelectionError, ValidationError};
use crate::payload::{video_filename, Materialized, PayloadDecoder, StorageState};
use crate::session::{ResourceRef, ResourceSession, Session};
use crate::time_range::{TimeRangeCodec, TimeWindow};
use crate::transport::DeviceConnector;
use chrono::{Local, TimeZone, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt::{self, Display};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum SessionLifecycle {
    Uninitialized,
    Connecting,
    Ready,
    /// Pas d'identité : rien à quoi se connecter.
    Empty,
    Failed(String),
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum ActionState<T> {
    Idle,
    InFlight,
    Succeeded(T),
    Failed(String),
}

impl<T> Default for ActionState<T> {
    fn default() -> Self {
        ActionState::Idle
    }
}

impl<T> ActionState<T> {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, ActionState::InFlight)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            ActionState::Failed(message) => Some(message),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Fetch,
    StorageState,
}

impl Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Fetch => f.write_str("fetch"),
            ActionKind::StorageState => f.write_str("get-storage-state"),
        }
    }
}

/// Ce qu'il est advenu d'un déclenchement.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome<T> {
    /// Une action du même type est déjà en vol.
    Ignored,
    /// La sélection a changé pendant la requête; le résultat est jeté.
    Stale,
    /// L'action est terminée, avec succès ou non.
    Settled(ActionState<T>),
}

/// Pour qui agit le panneau et quel enregistrement d'identifiants s'applique.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActingIdentity {
    pub name: String,
    pub credential_key: String,
}

impl ActingIdentity {
    /// La clé d'identifiants vaut par défaut le nom de l'identité.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            credential_key: name.clone(),
            name,
        }
    }

    pub fn with_credential_key(mut self, key: impl Into<String>) -> Self {
        self.credential_key = key.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowView {
    pub from_local: String,
    pub to_local: String,
    pub from_wire: String,
    pub to_wire: String,
}

/// Tout ce que l'interface affiche, en un seul instantané.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PanelView {
    pub lifecycle: SessionLifecycle,
    pub resources: Vec<ResourceRef>,
    pub selected_resource: Option<String>,
    pub window: WindowView,
    pub fetch: ActionState<Materialized>,
    pub fetching: bool,
    pub storage_state: ActionState<StorageState>,
    pub getting_state: bool,
    pub storage_state_text: Option<String>,
}

struct ControllerState<Conn> {
    lifecycle: SessionLifecycle,
    session: Option<Session<Conn>>,
    selected: Option<CommandDispatcher<Conn>>,
    generation: u64,
    window: TimeWindow,
    fetch: ActionState<Materialized>,
    storage: ActionState<StorageState>,
}

type Slot<Conn, T> = fn(&mut ControllerState<Conn>) -> &mut ActionState<T>;

fn fetch_slot<Conn>(state: &mut ControllerState<Conn>) -> &mut ActionState<Materialized> {
    &mut state.fetch
}

fn storage_slot<Conn>(state: &mut ControllerState<Conn>) -> &mut ActionState<StorageState> {
    &mut state.storage
}

/// Libère le slot d'une action si son futur est abandonné avant `settle`
/// (timeout, requête HTTP coupée, tâche annulée).
struct InFlightGuard<'a, Conn, T> {
    state: &'a Mutex<ControllerState<Conn>>,
    slot: Slot<Conn, T>,
    kind: ActionKind,
    armed: bool,
}

impl<Conn, T> InFlightGuard<'_, Conn, T> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<Conn, T> Drop for InFlightGuard<'_, Conn, T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.state.lock();
        let slot = (self.slot)(&mut *state);
        if slot.is_in_flight() {
            *slot = ActionState::Idle;
            warn!(action = %self.kind, "action dropped before settling, slot released");
        }
    }
}

pub struct SessionController<C: DeviceConnector, Tz: TimeZone = Local> {
    sessions: ResourceSession<C>,
    decoder: PayloadDecoder,
    codec: TimeRangeCodec<Tz>,
    identity: ActingIdentity,
    state: Mutex<ControllerState<C::Connection>>,
}

impl<C, Tz> SessionController<C, Tz>
where
    C: DeviceConnector,
    Tz: TimeZone + Send + Sync + 'static,
    Tz::Offset: Display + Send + Sync,
{
    pub fn new(
        sessions: ResourceSession<C>,
        decoder: PayloadDecoder,
        codec: TimeRangeCodec<Tz>,
        identity: ActingIdentity,
    ) -> Self {
        let window = codec.default_window(Utc::now());
        Self {
            sessions,
            decoder,
            codec,
            identity,
            state: Mutex::new(ControllerState {
                lifecycle: SessionLifecycle::Uninitialized,
                session: None,
                selected: None,
                generation: 0,
                window,
                fetch: ActionState::Idle,
                storage: ActionState::Idle,
            }),
        }
    }

    /// Ouvre la session device. Une seule fois; les appels suivants ne font rien.
    pub async fn initialize(&self) {
        {
            let mut state = self.state.lock();
            if state.lifecycle != SessionLifecycle::Uninitialized {
                debug!(lifecycle = ?state.lifecycle, "session already initialized");
                return;
            }
            state.lifecycle = SessionLifecycle::Connecting;
        }

        let outcome = self
            .sessions
            .open(&self.identity.name, &self.identity.credential_key)
            .await;

        let orphan = {
            let mut state = self.state.lock();
            if state.lifecycle == SessionLifecycle::Closed {
                // arrêt demandé pendant la connexion
                outcome.ok().flatten()
            } else {
                match outcome {
                    Ok(Some(session)) => {
                        info!(resources = session.resources().len(), "device session ready");
                        state.session = Some(session);
                        state.lifecycle = SessionLifecycle::Ready;
                    }
                    Ok(None) => {
                        info!("no acting identity, panel left empty");
                        state.lifecycle = SessionLifecycle::Empty;
                    }
                    Err(e) => {
                        error!(error = %e, "device session failed");
                        state.lifecycle = SessionLifecycle::Failed(e.to_string());
                    }
                }
                None
            }
        };
        if let Some(session) = orphan {
            session.close().await;
        }
    }

    /// Lie les actions suivantes à `resource_name` et remplace la sélection
    /// précédente. Les requêtes déjà parties ne sont pas annulées; leurs
    /// résultats sont jetés à l'arrivée.
    pub fn select(&self, resource_name: &str) -> Result<(), SelectionError> {
        let mut state = self.state.lock();
        if state.lifecycle != SessionLifecycle::Ready {
            return Err(SelectionError::NotConnected);
        }
        let dispatcher = match state.session.as_ref() {
            Some(session) => session.select(resource_name)?,
            None => return Err(SelectionError::NotConnected),
        };

        state.generation += 1;
        state.selected = Some(dispatcher);
        // les résultats de l'ancienne ressource ne s'appliquent plus
        if !state.fetch.is_in_flight() {
            state.fetch = ActionState::Idle;
        }
        if !state.storage.is_in_flight() {
            state.storage = ActionState::Idle;
        }
        info!(resource = resource_name, generation = state.generation, "resource selected");
        Ok(())
    }

    /// Remplace le texte de la fenêtre. La validation a lieu au fetch.
    pub fn set_window(
        &self,
        from_local: impl Into<String>,
        to_local: impl Into<String>,
    ) -> WindowView {
        let mut state = self.state.lock();
        state.window = TimeWindow::new(from_local, to_local);
        self.window_view(&state.window)
    }

    pub async fn get_storage_state(&self) -> TriggerOutcome<StorageState> {
        let (dispatcher, generation) = {
            let mut state = self.state.lock();
            if state.storage.is_in_flight() {
                debug!("storage state query already in flight");
                return TriggerOutcome::Ignored;
            }
            let Some(dispatcher) = state.selected.clone() else {
                let failed = ActionState::Failed(ValidationError::NoResourceSelected.to_string());
                state.storage = failed.clone();
                return TriggerOutcome::Settled(failed);
            };
            state.storage = ActionState::InFlight;
            (dispatcher, state.generation)
        };
        let in_flight = self.in_flight(ActionKind::StorageState, storage_slot);

        info!(resource = dispatcher.resource_name(), "querying storage state");
        let result = dispatcher
            .get_storage_state()
            .await
            .map_err(ActionError::from);
        in_flight.disarm();
        self.settle(ActionKind::StorageState, generation, result, storage_slot)
    }

    pub async fn fetch_video(&self) -> TriggerOutcome<Materialized> {
        let (dispatcher, generation, from, to) = {
            let mut state = self.state.lock();
            if state.fetch.is_in_flight() {
                debug!("fetch already in flight");
                return TriggerOutcome::Ignored;
            }
            let checked = match state.selected.clone() {
                None => Err(ValidationError::NoResourceSelected),
                Some(dispatcher) => {
                    let (from, to) = self.codec.wire_range(&state.window);
                    if from.is_empty() || to.is_empty() {
                        Err(ValidationError::InvalidTimeRange)
                    } else {
                        Ok((dispatcher, from, to))
                    }
                }
            };
            match checked {
                Err(e) => {
                    let failed = ActionState::Failed(e.to_string());
                    state.fetch = failed.clone();
                    return TriggerOutcome::Settled(failed);
                }
                Ok((dispatcher, from, to)) => {
                    state.fetch = ActionState::InFlight;
                    (dispatcher, state.generation, from, to)
                }
            }
        };
        let in_flight = self.in_flight(ActionKind::Fetch, fetch_slot);

        info!(resource = dispatcher.resource_name(), %from, %to, "fetching video");
        let result = self.fetch_and_save(&dispatcher, generation, &from, &to).await;
        in_flight.disarm();
        self.settle(ActionKind::Fetch, generation, result, fetch_slot)
    }

    fn in_flight<T>(
        &self,
        kind: ActionKind,
        slot: Slot<C::Connection, T>,
    ) -> InFlightGuard<'_, C::Connection, T> {
        InFlightGuard {
            state: &self.state,
            slot,
            kind,
            armed: true,
        }
    }

    async fn fetch_and_save(
        &self,
        dispatcher: &CommandDispatcher<C::Connection>,
        generation: u64,
        from: &str,
        to: &str,
    ) -> Result<Materialized, ActionError> {
        let payload = dispatcher.fetch(from, to).await?;

        let current = self.state.lock().generation;
        if current != generation {
            return Err(ActionError::Superseded);
        }
        let filename = video_filename(dispatcher.resource_name(), from, to);
        self.decoder.materialize_video(&payload.video_base64, &filename)
    }

    fn settle<T: Clone>(
        &self,
        kind: ActionKind,
        generation: u64,
        result: Result<T, ActionError>,
        slot: Slot<C::Connection, T>,
    ) -> TriggerOutcome<T> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let stale = state.generation != generation;
        let slot = slot(state);

        if stale {
            warn!(action = %kind, "selection changed while in flight, result dropped");
            *slot = ActionState::Idle;
            return TriggerOutcome::Stale;
        }

        let settled = match result {
            Ok(value) => {
                info!(action = %kind, "action succeeded");
                ActionState::Succeeded(value)
            }
            Err(e) => {
                warn!(action = %kind, error = %e, "action failed");
                ActionState::Failed(e.to_string())
            }
        };
        *slot = settled.clone();
        TriggerOutcome::Settled(settled)
    }

    fn window_view(&self, window: &TimeWindow) -> WindowView {
        let (from_wire, to_wire) = self.codec.wire_range(window);
        WindowView {
            from_local: window.from_local.clone(),
            to_local: window.to_local.clone(),
            from_wire,
            to_wire,
        }
    }

    pub fn lifecycle(&self) -> SessionLifecycle {
        self.state.lock().lifecycle.clone()
    }

    pub fn selected_resource(&self) -> Option<String> {
        self.state
            .lock()
            .selected
            .as_ref()
            .map(|d| d.resource_name().to_string())
    }

    pub fn fetch_state(&self) -> ActionState<Materialized> {
        self.state.lock().fetch.clone()
    }

    pub fn storage_state(&self) -> ActionState<StorageState> {
        self.state.lock().storage.clone()
    }

    pub fn view(&self) -> PanelView {
        let state = self.state.lock();
        let storage_state_text = match &state.storage {
            ActionState::Succeeded(storage) => Some(storage.pretty()),
            _ => None,
        };
        PanelView {
            lifecycle: state.lifecycle.clone(),
            resources: state
                .session
                .as_ref()
                .map(|s| s.resources().to_vec())
                .unwrap_or_default(),
            selected_resource: state.selected.as_ref().map(|d| d.resource_name().to_string()),
            window: self.window_view(&state.window),
            fetch: state.fetch.clone(),
            fetching: state.fetch.is_in_flight(),
            storage_state: state.storage.clone(),
            getting_state: state.storage.is_in_flight(),
            storage_state_text,
        }
    }

    /// Libère la connexion device. Le contrôleur reste fermé.
    pub async fn shutdown(&self) {
        let session = {
            let mut state = self.state.lock();
            state.lifecycle = SessionLifecycle::Closed;
            state.selected = None;
            state.session.take()
        };
        if let Some(session) = session {
            session.close().await;
            info!("device connection released");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{ApiKey, ConnectionParams, Credentials, StaticCredentials};
    use crate::error::{ConnectionError, MaterializeError, TransportError};
    use crate::payload::Materializer;
    use crate::transport::DeviceConnection;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct Device {
        sent: Arc<AtomicUsize>,
        stall: bool,
    }

    impl DeviceConnector for Device {
        type Connection = DeviceLink;

        async fn connect(&self, _params: &ConnectionParams) -> Result<DeviceLink, ConnectionError> {
            Ok(DeviceLink {
                sent: self.sent.clone(),
                stall: self.stall,
            })
        }
    }

    struct DeviceLink {
        sent: Arc<AtomicUsize>,
        stall: bool,
    }

    impl DeviceConnection for DeviceLink {
        async fn resource_names(&self) -> Result<Vec<String>, TransportError> {
            Ok(vec!["cam1".into(), "cam2".into()])
        }

        async fn do_command(
            &self,
            _resource: &str,
            command: Value,
        ) -> Result<Value, TransportError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            if self.stall {
                // le device ne répond jamais
                std::future::pending::<()>().await;
            }
            match command["command"].as_str() {
                Some("fetch") => Ok(json!({"video": "AAEC"})),
                _ => Ok(json!({"usedBytes": 1})),
            }
        }

        async fn close(&self) {}
    }

    struct Discard;

    impl Materializer for Discard {
        fn materialize(
            &self,
            bytes: &[u8],
            filename: &str,
            mime_type: &str,
        ) -> Result<Materialized, MaterializeError> {
            Ok(Materialized {
                filename: filename.into(),
                location: format!("mem://{filename}"),
                size_bytes: bytes.len(),
                mime_type: mime_type.into(),
            })
        }
    }

    fn controller(identity: &str) -> (SessionController<Device, Utc>, Arc<AtomicUsize>) {
        controller_with(identity, false)
    }

    fn controller_with(
        identity: &str,
        stall: bool,
    ) -> (SessionController<Device, Utc>, Arc<AtomicUsize>) {
        let sent = Arc::new(AtomicUsize::new(0));
        let creds = Credentials {
            api_key: ApiKey { id: "id".into(), key: "key".into() },
            machine_id: "m-1".into(),
            hostname: "robot.local".into(),
        };
        let sessions = ResourceSession::new(
            Device {
                sent: sent.clone(),
                stall,
            },
            Arc::new(StaticCredentials::new().with(identity, creds)),
        );
        let ctrl = SessionController::new(
            sessions,
            PayloadDecoder::new(Arc::new(Discard)),
            TimeRangeCodec::new(Utc),
            ActingIdentity::new(identity),
        );
        (ctrl, sent)
    }

    #[tokio::test]
    async fn test_initialize_runs_once() {
        let (ctrl, _) = controller("operator");
        assert_eq!(ctrl.lifecycle(), SessionLifecycle::Uninitialized);

        ctrl.initialize().await;
        assert_eq!(ctrl.lifecycle(), SessionLifecycle::Ready);
        ctrl.select("cam1").unwrap();

        ctrl.initialize().await;
        assert_eq!(ctrl.selected_resource().as_deref(), Some("cam1"));
    }

    #[tokio::test]
    async fn test_blank_identity_leaves_panel_empty() {
        let (ctrl, _) = controller("");
        ctrl.initialize().await;
        assert_eq!(ctrl.lifecycle(), SessionLifecycle::Empty);
        assert_eq!(ctrl.select("cam1"), Err(SelectionError::NotConnected));
        assert!(ctrl.view().resources.is_empty());
    }

    #[tokio::test]
    async fn test_preconditions_checked_before_sending() {
        let (ctrl, sent) = controller("operator");
        ctrl.initialize().await;

        let outcome = ctrl.fetch_video().await;
        assert_eq!(
            outcome,
            TriggerOutcome::Settled(ActionState::Failed(
                "select a video-store resource first".into()
            ))
        );

        ctrl.select("cam1").unwrap();
        ctrl.set_window("yesterday", "2024-01-01T00:01:00");
        let outcome = ctrl.fetch_video().await;
        assert_eq!(
            outcome,
            TriggerOutcome::Settled(ActionState::Failed("select a valid time range".into()))
        );
        assert_eq!(sent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fetch_names_file_after_resource_and_window() {
        let (ctrl, _) = controller("operator");
        ctrl.initialize().await;
        ctrl.select("cam2").unwrap();
        let window = ctrl.set_window("2024-01-01T00:00:00", "2024-01-01T00:01:00");
        assert_eq!(window.from_wire, "2024-01-01_00-00-00Z");

        let TriggerOutcome::Settled(ActionState::Succeeded(saved)) = ctrl.fetch_video().await else {
            panic!("fetch did not succeed");
        };
        assert_eq!(saved.filename, "cam2_2024-01-01_00-00-00Z_2024-01-01_00-01-00Z.mp4");
        assert_eq!(saved.size_bytes, 3);
        assert!(!ctrl.view().fetching);
    }

    #[tokio::test]
    async fn test_reselect_clears_settled_results() {
        let (ctrl, _) = controller("operator");
        ctrl.initialize().await;
        ctrl.select("cam1").unwrap();
        ctrl.get_storage_state().await;
        assert_eq!(ctrl.view().storage_state_text.as_deref(), Some("{\n  \"usedBytes\": 1\n}"));

        ctrl.select("cam2").unwrap();
        assert_eq!(ctrl.storage_state(), ActionState::Idle);
    }

    #[tokio::test]
    async fn test_dropped_action_releases_its_slot() {
        let (ctrl, sent) = controller_with("operator", true);
        ctrl.initialize().await;
        ctrl.select("cam1").unwrap();

        let timed_out =
            tokio::time::timeout(Duration::from_millis(50), ctrl.get_storage_state()).await;
        assert!(timed_out.is_err());
        assert_eq!(ctrl.storage_state(), ActionState::Idle);
        assert!(!ctrl.view().getting_state);

        // un nouveau déclenchement repart vers le device au lieu d'être ignoré
        let retry = tokio::time::timeout(Duration::from_millis(50), ctrl.get_storage_state()).await;
        assert!(retry.is_err());
        assert_eq!(sent.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_closes_panel() {
        let (ctrl, _) = controller("operator");
        ctrl.initialize().await;
        ctrl.select("cam1").unwrap();
        ctrl.shutdown().await;

        assert_eq!(ctrl.lifecycle(), SessionLifecycle::Closed);
        assert_eq!(ctrl.selected_resource(), None);
        assert_eq!(ctrl.select("cam1"), Err(SelectionError::NotConnected));
    }

    #[test]
    fn test_lifecycle_wire_shape() {
        assert_eq!(
            serde_json::to_value(SessionLifecycle::Ready).unwrap(),
            json!({"state": "ready"})
        );
        assert_eq!(
            serde_json::to_value(SessionLifecycle::Failed("boom".into())).unwrap(),
            json!({"state": "failed", "message": "boom"})
        );
    }
}
