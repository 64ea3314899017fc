//! Session device authentifiée et découverte des ressources.

use crate::credentials::CredentialProvider;
use crate::dispatcher::CommandDispatcher;
use crate::error::{SelectionError, SessionError, TransportError};
use crate::transport::{DeviceConnection, DeviceConnector};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Ressource découverte. Le device nomme ses ressources, donc `id == name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub id: String,
    pub name: String,
}

impl ResourceRef {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
        }
    }
}

/// Connexion et ressources trouvées dessus.
#[derive(Debug)]
pub struct Session<Conn> {
    connection: Arc<Conn>,
    resources: Vec<ResourceRef>,
    discovered: bool,
}

impl<Conn: DeviceConnection> Session<Conn> {
    pub fn new(connection: Conn) -> Self {
        Self {
            connection: Arc::new(connection),
            resources: Vec::new(),
            discovered: false,
        }
    }

    /// Interroge le device une seule fois; les appels suivants renvoient la
    /// liste mémorisée, même vide.
    pub async fn list_resources(&mut self) -> Result<&[ResourceRef], TransportError> {
        if !self.discovered {
            let names = self.connection.resource_names().await?;
            self.resources = names.into_iter().map(ResourceRef::new).collect();
            self.discovered = true;
            debug!(count = self.resources.len(), "resources discovered");
        }
        Ok(&self.resources)
    }

    pub fn resources(&self) -> &[ResourceRef] {
        &self.resources
    }

    /// Dispatcher lié à une ressource découverte.
    pub fn select(&self, name: &str) -> Result<CommandDispatcher<Conn>, SelectionError> {
        if !self.resources.iter().any(|r| r.name == name) {
            return Err(SelectionError::UnknownResource(name.to_string()));
        }
        Ok(CommandDispatcher::new(name, Arc::clone(&self.connection)))
    }

    /// Libère la connexion.
    pub async fn close(self) {
        self.connection.close().await;
    }
}

/// Ouvre les sessions : identifiants, validation, connexion puis découverte.
pub struct ResourceSession<C: DeviceConnector> {
    connector: C,
    credentials: Arc<dyn CredentialProvider>,
}

impl<C: DeviceConnector> ResourceSession<C> {
    pub fn new(connector: C, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            connector,
            credentials,
        }
    }

    /// S'authentifie auprès du device décrit par `credential_key`.
    ///
    /// Des identifiants absents ou vides échouent avant tout appel réseau.
    pub async fn connect(
        &self,
        credential_key: &str,
    ) -> Result<Session<C::Connection>, SessionError> {
        let params = self.credentials.lookup(credential_key)?.into_params();
        params.validate()?;

        info!(host = %params.host, machine = %params.machine_identifier, "connecting to device");
        let connection = self.connector.connect(&params).await?;
        Ok(Session::new(connection))
    }

    /// Connecte et découvre les ressources pour `identity`.
    ///
    /// Une identité vide est un résultat valide "rien à afficher" : `Ok(None)`,
    /// sans toucher au réseau.
    pub async fn open(
        &self,
        identity: &str,
        credential_key: &str,
    ) -> Result<Option<Session<C::Connection>>, SessionError> {
        if identity.trim().is_empty() {
            debug!("no acting identity, skipping device connection");
            return Ok(None);
        }

        let mut session = self.connect(credential_key).await?;
        let discovery = session.list_resources().await.map(|_| ());
        if let Err(e) = discovery {
            warn!(error = %e, "resource discovery failed, releasing connection");
            session.close().await;
            return Err(e.into());
        }
        Ok(Some(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{ApiKey, ConnectionParams, Credentials, StaticCredentials};
    use crate::error::{AuthError, ConnectionError};
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct Counters {
        connects: AtomicUsize,
        listings: AtomicUsize,
        closes: AtomicUsize,
    }

    struct FakeConnector {
        names: Result<Vec<String>, TransportError>,
        counters: Arc<Counters>,
    }

    #[derive(Debug)]
    struct FakeConnection {
        names: Result<Vec<String>, TransportError>,
        counters: Arc<Counters>,
    }

    impl DeviceConnector for FakeConnector {
        type Connection = FakeConnection;

        async fn connect(
            &self,
            _params: &ConnectionParams,
        ) -> Result<FakeConnection, ConnectionError> {
            self.counters.connects.fetch_add(1, Ordering::SeqCst);
            Ok(FakeConnection {
                names: self.names.clone(),
                counters: self.counters.clone(),
            })
        }
    }

    impl DeviceConnection for FakeConnection {
        async fn resource_names(&self) -> Result<Vec<String>, TransportError> {
            self.counters.listings.fetch_add(1, Ordering::SeqCst);
            self.names.clone()
        }

        async fn do_command(
            &self,
            _resource: &str,
            _command: Value,
        ) -> Result<Value, TransportError> {
            Ok(Value::Null)
        }

        async fn close(&self) {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn creds(id: &str, key: &str) -> Credentials {
        Credentials {
            api_key: ApiKey { id: id.into(), key: key.into() },
            machine_id: "m-1".into(),
            hostname: "robot.local".into(),
        }
    }

    fn session_with(
        names: Result<Vec<String>, TransportError>,
        store: StaticCredentials,
    ) -> (ResourceSession<FakeConnector>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let connector = FakeConnector { names, counters: counters.clone() };
        (ResourceSession::new(connector, Arc::new(store)), counters)
    }

    #[tokio::test]
    async fn test_blank_identity_never_connects() {
        let store = StaticCredentials::new().with("m", creds("id", "key"));
        let (sessions, counters) = session_with(Ok(vec!["cam1".into()]), store);

        assert!(sessions.open("  ", "m").await.unwrap().is_none());
        assert_eq!(counters.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_secret_fails_before_network() {
        let store = StaticCredentials::new().with("m", creds("id", ""));
        let (sessions, counters) = session_with(Ok(vec![]), store);

        let err = sessions.open("operator", "m").await.unwrap_err();
        assert_eq!(err, SessionError::Auth(AuthError::EmptyCredentials));
        assert_eq!(counters.connects.load(Ordering::SeqCst), 0);

        let err = sessions.open("operator", "unknown").await.unwrap_err();
        assert_eq!(err, SessionError::Auth(AuthError::MissingRecord("unknown".into())));
    }

    #[tokio::test]
    async fn test_open_discovers_in_order_and_memoizes() {
        let store = StaticCredentials::new().with("m", creds("id", "key"));
        let (sessions, counters) = session_with(Ok(vec!["cam1".into(), "cam2".into()]), store);

        let mut session = sessions.open("operator", "m").await.unwrap().unwrap();
        assert_eq!(session.resources(), &[ResourceRef::new("cam1"), ResourceRef::new("cam2")]);
        assert_eq!(session.resources()[1].id, "cam2");

        session.list_resources().await.unwrap();
        assert_eq!(counters.listings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_device_is_memoized_too() {
        let store = StaticCredentials::new().with("m", creds("id", "key"));
        let (sessions, counters) = session_with(Ok(vec![]), store);

        let mut session = sessions.open("operator", "m").await.unwrap().unwrap();
        assert!(session.list_resources().await.unwrap().is_empty());
        assert_eq!(counters.listings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_select_known_and_unknown() {
        let store = StaticCredentials::new().with("m", creds("id", "key"));
        let (sessions, counters) = session_with(Ok(vec!["cam1".into(), "cam2".into()]), store);
        let session = sessions.open("operator", "m").await.unwrap().unwrap();

        let cam2 = session.select("cam2").unwrap();
        let cam1 = session.select("cam1").unwrap();
        assert_eq!(cam2.resource_name(), "cam2");
        assert_eq!(cam1.resource_name(), "cam1");
        // les deux poignées passent par la même connexion
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
        assert_eq!(
            session.select("cam3").unwrap_err(),
            SelectionError::UnknownResource("cam3".into())
        );
    }

    #[tokio::test]
    async fn test_failed_discovery_releases_connection() {
        let store = StaticCredentials::new().with("m", creds("id", "key"));
        let (sessions, counters) = session_with(Err(TransportError::ConnectionLost), store);

        let err = sessions.open("operator", "m").await.unwrap_err();
        assert_eq!(err, SessionError::Discovery(TransportError::ConnectionLost));
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }
}
