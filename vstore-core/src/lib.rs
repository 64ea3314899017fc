/*!
# vstore-core

Parcours opérateur pour les devices video-store distants :
- lecture des identifiants et sessions device authentifiées
- découverte des ressources et envoi de commandes par ressource
- fenêtre en heure locale -> bornes device `YYYY-MM-DD_HH-MM-SSZ`
- décodage des clips reçus et enregistrement en fichiers `.mp4`
- un contrôleur de session à action unique qui porte l'état affiché
*/

pub mod controller;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod payload;
pub mod session;
pub mod time_range;
pub mod transport;

pub use controller::{
    ActingIdentity, ActionKind, ActionState, PanelView, SessionController, SessionLifecycle,
    TriggerOutcome, WindowView,
};
pub use credentials::{
    ApiKey, ConnectionParams, CredentialProvider, Credentials, JsonFileCredentials,
    StaticCredentials,
};
pub use dispatcher::{CommandDispatcher, DeviceCommand};
pub use error::{
    ActionError, AuthError, ConnectionError, DecodeError, MaterializeError, SelectionError,
    SessionError, TransportError, ValidationError,
};
pub use payload::{
    DiskMaterializer, Materialized, Materializer, PayloadDecoder, StorageState, VideoPayload,
};
pub use session::{ResourceRef, ResourceSession, Session};
pub use time_range::{TimeRangeCodec, TimeWindow};
pub use transport::mqtt::{MqttConnection, MqttConnector};
pub use transport::{DeviceConnection, DeviceConnector};
