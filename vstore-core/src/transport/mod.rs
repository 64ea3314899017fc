//! Points d'accroche vers la connexion device et son canal de commandes.
//!
//! Le cœur n'a besoin que de deux capacités d'un lien device : lister les
//! ressources adressables et exécuter une commande JSON sur l'une d'elles.
//! L'implémentation livrée parle MQTT ([`mqtt::MqttConnector`]); les tests
//! branchent un device scripté à la place.

pub mod mqtt;

use crate::credentials::ConnectionParams;
use crate::error::{ConnectionError, TransportError};
use serde_json::Value;
use std::future::Future;

/// Ouvre des connexions authentifiées vers un device.
pub trait DeviceConnector: Send + Sync + 'static {
    type Connection: DeviceConnection;

    fn connect(
        &self,
        params: &ConnectionParams,
    ) -> impl Future<Output = Result<Self::Connection, ConnectionError>> + Send;
}

/// Connexion device établie, partagée en lecture par chaque dispatcher.
pub trait DeviceConnection: Send + Sync + 'static {
    /// Noms des ressources du device qui acceptent des commandes.
    fn resource_names(&self) -> impl Future<Output = Result<Vec<String>, TransportError>> + Send;

    /// Exécute `command` sur `resource` et renvoie la réponse structurée. Une
    /// seule tentative, sans timeout.
    fn do_command(
        &self,
        resource: &str,
        command: Value,
    ) -> impl Future<Output = Result<Value, TransportError>> + Send;

    /// Libère la connexion. Les requêtes en attente échouent avec `Closed`.
    fn close(&self) -> impl Future<Output = ()> + Send;
}
