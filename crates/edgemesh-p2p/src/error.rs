use libp2p::PeerId;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("no relaynodes specified")]
    NoRelaynodes,

    #[error("at least {minimum} relaynodes are required, got {supplied}")]
    MinimumNodes { minimum: usize, supplied: usize },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("keypair error: {0}")]
    Keypair(String),

    #[error("dial error: {0}")]
    Dial(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("protocol not found: {0}")]
    UnknownProtocol(String),

    #[error("peer not connected: {0}")]
    NotConnected(PeerId),

    #[error("routing table full")]
    RoutingTableFull,

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("node already shut down")]
    Shutdown,
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
