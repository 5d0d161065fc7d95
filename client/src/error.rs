use thiserror::Error;

/// Errors surfaced to the application by the client runtime.
///
/// Transient network conditions (malformed datagrams, packets for unknown
/// channels) are logged and dropped instead of being raised here.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("the event {0} has already been added")]
    DuplicateChannel(String),

    #[error("could not resolve server address {0}")]
    AddressResolution(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
