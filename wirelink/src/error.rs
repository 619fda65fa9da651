use thiserror::Error;

/// Errors that can occur while decoding or accumulating facts.
///
/// These are deliberately narrow: a bad datagram or an oversized fact is
/// never a reason to bring down the pipeline, only to drop the offending
/// item and keep going (see the propagation policy in the crate docs).
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FactError {
    #[error("malformed fact: {0}")]
    Malformed(&'static str),

    #[error("fact does not fit within the accumulator budget")]
    FactTooLarge,

    #[error("sealing or opening a signed group failed: {0}")]
    Sealing(String),
}

/// Errors surfaced by the signing primitive.
///
/// `CryptoFailure` is reserved for failures of the primitive itself (e.g. a
/// key that cannot be loaded); a message that merely fails to verify is not
/// an error at all, it's `Ok(false)`.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("signing primitive failed: {0}")]
    CryptoFailure(String),
}

/// Top level errors that can cause a pipeline stage to stop processing
/// an individual item. Matched against the propagation policy:
/// everything here is logged and dropped by the stage that encounters it,
/// except `HardIo`, which tears down the whole pipeline.
#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Fact(#[from] FactError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("fact rejected: sender is not authenticated for this subject")]
    Unauthenticated,

    #[error("fact rejected by trust evaluator")]
    TrustRejected,

    #[error("transient I/O error: {0}")]
    TransientIo(#[source] std::io::Error),

    #[error("unrecoverable I/O error: {0}")]
    HardIo(#[source] std::io::Error),
}

/// Errors raised while parsing the configuration file or CLI flags, fatal
/// to startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid CIDR '{value}' for peer '{peer}': {source}")]
    InvalidCidr {
        peer: String,
        value: String,
        #[source]
        source: ipnet::AddrParseError,
    },

    #[error("invalid endpoint '{value}' for peer '{peer}': {reason}")]
    InvalidEndpoint {
        peer: String,
        value: String,
        reason: String,
    },

    #[error("invalid trust level '{0}'")]
    InvalidTrustLevel(String),

    #[error("invalid public key for peer '{peer}': {source}")]
    InvalidPublicKey {
        peer: String,
        #[source]
        source: wireguard_control::InvalidKey,
    },

    #[error("invalid interface glob '{0}': {1}")]
    InvalidGlob(String, regex::Error),

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: std::path::PathBuf,
        #[source]
        source: ParseFormatError,
    },
}

#[derive(Error, Debug)]
pub enum ParseFormatError {
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] YamlNotSupported),
}

/// wirelink accepts yaml/json/toml config files per the spec; this crate only
/// carries a TOML and JSON parser in its dependency stack, so a `.yaml` file
/// fails fast with a clear message rather than silently being ignored.
#[derive(Error, Debug)]
#[error("YAML config files are not supported by this build")]
pub struct YamlNotSupported;
