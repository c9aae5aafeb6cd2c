// solekit-proto: wire protocol for instrumented insole sensors
//
// Everything in this crate is transport-agnostic: codecs take and return
// bytes and never hold a connection. The one exception is `websocket`,
// which keeps a bridge socket alive and feeds decoded frames to subscribers.

pub mod bridge;
pub mod cbor;
pub mod codec;
pub mod crc32;
pub mod device_info;
pub mod error;
pub mod file_transfer;
pub mod image;
pub mod information;
pub mod message;
pub mod reader;
pub mod sensor;
pub mod smp;
pub mod tflite;
pub mod vibration;
pub mod websocket;

pub use codec::{LengthWidth, Message};
pub use error::Error;
pub use message::{ConnectionMessageType, DeviceMessageType, MessageKind, ServerMessageType};
