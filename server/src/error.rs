use thiserror::Error;

/// Errors surfaced to the application by the server runtime.
///
/// Malformed datagrams and packets for unregistered channels are logged and
/// dropped in the receive path instead of being raised here.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("the event {0} has already been added")]
    DuplicateChannel(String),

    #[error("tick rate cannot be negative or 0 (got {0})")]
    InvalidTickRate(f32),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
