use thiserror::Error;

/// Main error type for the HDS library
#[derive(Error, Debug)]
pub enum HdsError {
    /// A standard I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The probed input is not an HDS manifest; other filters may try it
    #[error("not an HDS manifest")]
    NotHds,

    /// The manifest document is malformed or violates a hard limit
    #[error("Manifest parse error: {0}")]
    Manifest(String),

    /// An error reported by the XML reader
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    /// An inline bootstrap body failed to decode
    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// A bootstrap box is truncated or structurally invalid
    #[error("Bootstrap parse error: {0}")]
    Bootstrap(String),

    /// A fragment's box layout is invalid or holds no media payload
    #[error("Box layout error: {0}")]
    BoxLayout(String),

    /// An HTTP protocol-level or transport error
    #[error("HTTP error: {0}")]
    Http(String),

    /// The response body ended before the advertised length
    #[error("Short read: received {received} of {expected} bytes")]
    ShortRead { received: usize, expected: usize },

    /// A downloaded fragment exceeded the size cap
    #[error("Fragment too large: {0} bytes")]
    FragmentTooLarge(usize),

    /// The run tables cannot produce a next fragment
    #[error("Timeline error: {0}")]
    Timeline(String),

    /// A URL could not be parsed or resolved
    #[error("Invalid URL: {0}")]
    Url(String),

    /// The stream was torn down
    #[error("stream closed")]
    Closed,
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, HdsError>;
