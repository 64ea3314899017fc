/*!
# vstore DevKit - stubs et helpers pour développer le panneau

- device scripté derrière le point d'accroche transport, sans broker
- téléchargements en mémoire
- un harness qui branche le vrai contrôleur de session sur les deux
*/

pub mod device_stub;
pub mod downloads;
pub mod test_utils;

pub use device_stub::{MockDevice, RecordedCommand, ReplyBuilder};
pub use downloads::{MemoryMaterializer, SavedFile};
pub use test_utils::{PanelHarness, TestController, OPERATOR};
