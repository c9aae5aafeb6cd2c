// ── Transport seam ──
//
// The only way a session reaches radio hardware or a relay. Implementations
// own the physical link; the connection manager owns the protocol state.

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::sync::broadcast;

use solekit_proto::ConnectionMessageType;

use crate::connection::ConnectionStatus;
use crate::error::CoreError;

/// Characteristic an outbound write is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "camelCase")]
pub enum WriteTarget {
    /// Device-local TLV stream.
    Tx,
    /// SMP (mcumgr) characteristic.
    Smp,
}

impl WriteTarget {
    pub fn message_type(self) -> ConnectionMessageType {
        match self {
            Self::Tx => ConnectionMessageType::Tx,
            Self::Smp => ConnectionMessageType::Smp,
        }
    }
}

/// Something the transport observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Raw link status changed.
    Status(ConnectionStatus),
    /// Bytes arrived on a characteristic. `Rx` carries device TLV,
    /// `Smp` carries SMP notifications, the rest are device-information
    /// and battery characteristics.
    Message(ConnectionMessageType, Bytes),
}

/// A physical or relayed link to one device.
pub trait Transport: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'_, Result<(), CoreError>>;

    fn disconnect(&self) -> BoxFuture<'_, Result<(), CoreError>>;

    fn reconnect(&self) -> BoxFuture<'_, Result<(), CoreError>>;

    fn write(&self, target: WriteTarget, data: Bytes) -> BoxFuture<'_, Result<(), CoreError>>;

    /// Polled by the liveness timer while connected.
    fn is_connected(&self) -> BoxFuture<'_, bool>;

    fn can_reconnect(&self) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}
