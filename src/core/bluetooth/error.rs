use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by a transport adapter
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Bluetooth radio is powered off or unauthorized")]
    Unavailable,
    #[error("{0}")]
    Failed(String),
}

#[cfg(feature = "bluest")]
impl From<bluest::Error> for TransportError {
    fn from(err: bluest::Error) -> Self {
        match err.kind() {
            bluest::error::ErrorKind::AdapterUnavailable | bluest::error::ErrorKind::NotAuthorized => {
                Self::Unavailable
            }
            _ => Self::Failed(err.to_string()),
        }
    }
}

/// Errors surfaced to callers of the central
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Bluetooth radio is powered off or unauthorized")]
    TransportUnavailable,
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
    #[error("Device {0} not found")]
    DeviceNotFound(String),
    #[error("No device connected")]
    NotConnected,
    #[error("A session is already active")]
    SessionActive,
    #[error("Characteristic {characteristic} not found in service {service}")]
    CharacteristicNotFound { service: Uuid, characteristic: Uuid },
    #[error("Characteristic does not support reads")]
    ReadUnsupported,
    #[error("Characteristic does not support writes")]
    WriteUnsupported,
    #[error("Characteristic does not support notifications")]
    NotifyUnsupported,
    #[error("Peripheral refused to enable notifications")]
    NotifyRejected,
    #[error("No active subscription")]
    NotSubscribed,
    #[error("Another characteristic ({0}) is already subscribed")]
    SubscriptionActive(Uuid),
    #[error("Another operation is still in flight")]
    OperationInFlight,
    #[error("Peripheral disconnected unexpectedly")]
    UnexpectedDisconnect,
    #[error("Operation cancelled by disconnect")]
    Cancelled,
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Central manager is no longer running")]
    ManagerStopped,
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unavailable => Error::TransportUnavailable,
            TransportError::Failed(msg) => Error::Transport(msg),
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ManagerStopped
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::ManagerStopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_transport_maps_to_transport_unavailable() {
        assert_eq!(Error::from(TransportError::Unavailable), Error::TransportUnavailable);
        assert_eq!(
            Error::from(TransportError::Failed("gatt 0x85".into())),
            Error::Transport("gatt 0x85".into())
        );
    }
}
