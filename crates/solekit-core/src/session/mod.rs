// ── Session managers ──
//
// One manager per device message group. Each owns the last-known state for
// its group, decodes inbound messages through the proto codecs and turns
// them into `DeviceEvent`s. Outbound operations go through a `Requester`.

pub mod file_transfer;
pub mod firmware;
pub mod information;
pub mod sensor;
pub mod tflite;
pub mod vibration;

use tokio::sync::broadcast;

use crate::event::DeviceEvent;

pub use file_transfer::{FileTransferManager, FileTransferState};
pub use firmware::FirmwareManager;
pub use information::{InformationManager, InformationState, InformationUpdate};
pub use sensor::SensorManager;
pub use tflite::{TfliteManager, TfliteState};
pub use vibration::VibrationManager;

/// Broadcast an event; having no subscribers is fine.
pub(crate) fn emit(events: &broadcast::Sender<DeviceEvent>, event: DeviceEvent) {
    let _ = events.send(event);
}
