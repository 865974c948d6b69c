//! Error handling for mirrormesh

/// Result type alias for mirrormesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for mirrormesh operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    #[error("invalid checksum digest format")]
    InvalidDigest,

    #[error("{0}")]
    InvalidDescriptor(String),

    #[error("could not get digests for image {image}: {source}")]
    WalkImage {
        image: String,
        #[source]
        source: Box<Error>,
    },

    #[error("could not advertise image {image}: {source}")]
    Advertise {
        image: String,
        #[source]
        source: Box<Error>,
    },

    #[error("no peers")]
    NoPeers,

    #[error("exhausted peers")]
    ExhaustedPeers,

    #[error("peer failure: {0}")]
    Peer(String),

    #[error("registry authentication required")]
    AuthRequired,

    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("{0}")]
    ChannelClosed(&'static str),

    #[error("{}", join_errors(.0))]
    Aggregate(Vec<Error>),

    #[error("routing error: {0}")]
    Routing(String),

    #[error("Other error: {0}")]
    Other(String),
}

// libp2p error conversions
impl From<libp2p::swarm::DialError> for Error {
    fn from(err: libp2p::swarm::DialError) -> Self {
        Error::Routing(format!("Dial error: {err}"))
    }
}

impl From<libp2p::noise::Error> for Error {
    fn from(err: libp2p::noise::Error) -> Self {
        Error::Routing(format!("Noise error: {err}"))
    }
}

impl From<libp2p::TransportError<std::io::Error>> for Error {
    fn from(err: libp2p::TransportError<std::io::Error>) -> Self {
        Error::Routing(format!("Transport error: {err}"))
    }
}

impl From<libp2p::multiaddr::Error> for Error {
    fn from(err: libp2p::multiaddr::Error) -> Self {
        Error::Routing(format!("Multiaddr error: {err}"))
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(err: tokio::sync::oneshot::error::RecvError) -> Self {
        Error::Other(format!("Channel receive error: {err}"))
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(err: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Other(format!("Channel send error: {err}"))
    }
}

impl Error {
    /// Create a routing error
    pub fn routing<S: Into<String>>(msg: S) -> Self {
        Error::Routing(msg.into())
    }

    /// Create a peer failure error
    pub fn peer<S: Into<String>>(msg: S) -> Self {
        Error::Peer(msg.into())
    }

    /// Create a generic error
    pub fn other<S: Into<String>>(msg: S) -> Self {
        Error::Other(msg.into())
    }

    /// Join a batch of errors into one, or `Ok` when the batch is empty.
    pub fn join(errs: Vec<Error>) -> Result<()> {
        let mut errs = errs;
        match errs.len() {
            0 => Ok(()),
            1 => Err(errs.remove(0)),
            _ => Err(Error::Aggregate(errs)),
        }
    }
}

fn join_errors(errs: &[Error]) -> String {
    errs.iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
