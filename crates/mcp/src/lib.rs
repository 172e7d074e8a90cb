//! Out-of-band line protocol (MCP 2.1) layered on a MOO text stream.
//!
//! MCP messages travel on the same line stream as user-visible text, marked
//! by a reserved `#$#` prefix. The codec filters them out of the in-band
//! stream, handles the version handshake and capability negotiation, and
//! reassembles multiline messages correlated by data tag.
//!
//! Wire grammar per <http://www.moo.mud.org/mcp/mcp2.html>.

pub mod codec;
pub mod error;
pub mod packages;
pub mod parse;
pub mod types;

pub use {
    codec::{LineSink, Mcp},
    error::McpError,
    parse::Version,
    types::{KeyVals, McpMessage, Value},
};

/// Marks a line as protocol metadata rather than user-visible text.
pub const OUT_OF_BAND_PREFIX: &str = "#$#";
/// Escapes an in-band line that happens to start with a reserved marker.
pub const QUOTE_PREFIX: &str = "#$\"";

/// Keyword correlating a multiline message's start, continuation, and end.
pub(crate) const DATA_TAG_KEY: &str = "_data-tag";

/// Highest protocol version this codec speaks.
pub const SUPPORTED_VERSION: Version = Version::new(2, 1);
