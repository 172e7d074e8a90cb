use thiserror::Error;

/// A malformed or unacceptable out-of-band line.
///
/// Every variant is contained: the offending line is logged and discarded,
/// in-band traffic is unaffected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum McpError {
    #[error("missing version info")]
    MissingVersion,
    #[error("malformed version '{0}'")]
    BadVersion(String),
    #[error("server version too low")]
    VersionTooLow,
    #[error("server version too high")]
    VersionTooHigh,

    #[error("incorrect authentication key '{0}'")]
    BadAuthKey(String),

    #[error("missing data tag for multiline message")]
    MissingDataTag,
    #[error("data tag '{0}' already in use")]
    DataTagInUse(String),
    #[error("no multiline message with data tag '{0}'")]
    UnknownDataTag(String),
    #[error("no keyword in multiline continuation message")]
    MissingKeyword,
    #[error("unknown keyword '{0}'")]
    UnknownKeyword(String),
    #[error("non-multiline keyword '{0}'")]
    NonMultilineKeyword(String),

    #[error("invalid keyword token '{0}'")]
    InvalidKeyword(String),
    #[error("duplicated keyword '{0}'")]
    DuplicateKeyword(String),
    #[error("invalid characters in unquoted value '{0}'")]
    InvalidUnquoted(String),
    #[error("unescaped quote or backslash within quoted value")]
    UnescapedChar,
    #[error("unclosed quote")]
    UnclosedQuote,
    #[error("missing value for keyword '{0}'")]
    MissingValue(String),

    #[error("no authentication key yet, handshake not complete")]
    HandshakeNotComplete,
    #[error("multiline values are unsupported in outgoing messages")]
    MultilineUnsupported,
}
