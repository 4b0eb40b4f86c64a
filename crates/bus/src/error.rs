use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Broker connection error: {0}")]
    Connection(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("No reply on '{queue}' within {timeout_secs}s")]
    RpcTimeout { queue: String, timeout_secs: u64 },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Subscription closed")]
    Closed,
}

impl From<lapin::Error> for BusError {
    fn from(error: lapin::Error) -> Self {
        match &error {
            lapin::Error::IOError(_) | lapin::Error::InvalidConnectionState(_) => {
                Self::Connection(error.to_string())
            }
            _ => Self::Channel(error.to_string()),
        }
    }
}
