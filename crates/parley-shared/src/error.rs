use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Identity file is corrupt: {0}")]
    Corrupt(String),

    #[error("Public identity exists at {0} but its private key is missing")]
    MissingPrivateKey(String),

    #[error("Identity IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("No usable private key: {0}")]
    InvalidKey(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Message content is empty")]
    Empty,

    #[error("Message content exceeds {max} characters")]
    TooLong { max: usize },
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Payload of kind {found} does not fit a {expected} envelope")]
    PayloadMismatch { expected: String, found: String },

    #[error("Payload does not match its envelope type: {0}")]
    Payload(#[source] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Not a command")]
    NotACommand,

    #[error("Empty command")]
    Empty,

    #[error("unknown command: {0}")]
    Unknown(String),

    #[error("/{command} needs {what}")]
    MissingArgument {
        command: &'static str,
        what: &'static str,
    },

    #[error("/{0} can only be used inside a room")]
    NoRoom(&'static str),

    #[error(transparent)]
    Envelope(#[from] ProtocolError),
}
