use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Error surfaced by a [`BleTransport`] implementation.
#[derive(Debug, Error)]
pub enum BleError {
    #[error("peripheral not connected")]
    NotConnected,

    #[error("service {0} not found on peripheral")]
    ServiceNotFound(Uuid),

    #[error("characteristic {0} not found on peripheral")]
    CharacteristicNotFound(Uuid),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Narrow GATT capability surface the update engine drives.
///
/// Implementations wrap a platform BLE stack already bound to one
/// peripheral. The engine assumes exclusive ownership of the link for the
/// duration of a session; concurrent GATT traffic from other consumers
/// would corrupt the upload.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Connect to the peripheral, hinting the desired ATT MTU.
    async fn connect(&self, mtu_hint: u16) -> Result<(), BleError>;

    /// Full service and characteristic discovery.
    ///
    /// Must be repeated after every reconnect: DFU mode and application
    /// mode expose different GATT databases behind the same address.
    async fn discover_services(&self) -> Result<(), BleError>;

    /// Request an ATT MTU and return the negotiated value.
    async fn request_mtu(&self, mtu: u16) -> Result<u16, BleError>;

    async fn read_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Vec<u8>, BleError>;

    async fn write_with_response(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), BleError>;

    async fn write_without_response(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), BleError>;

    async fn is_connected(&self) -> bool;

    /// Tear the connection down. Implementations must treat "already
    /// disconnected" as success.
    async fn cancel_connection(&self) -> Result<(), BleError>;
}

/// Parse a characteristic or service UUID regardless of the platform's
/// case convention (some stacks report upper-case, some lower-case).
pub fn parse_uuid(s: &str) -> Result<Uuid, BleError> {
    Uuid::parse_str(s).map_err(|e| BleError::Transport(format!("invalid UUID '{s}': {e}")))
}
