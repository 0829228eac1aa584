pub type Result<T, E = CodecError> = core::result::Result<T, E>;

/// Byte-level failures. Encode failures indicate unrepresentable input
/// (programmer error); decode failures indicate a malformed datagram, which
/// callers log and drop without disturbing the link.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("bad magic")]
    Magic,
    #[error("short read [{have} < {need}]")]
    Short { need: usize, have: usize },
    #[error("{what} too large [{len} > {max}]")]
    TooLarge {
        what: &'static str,
        len: usize,
        max: usize,
    },
    #[error("arithmetic on {what} [{value}]")]
    Arithmetic { what: &'static str, value: i64 },
    #[error("header block overrun [{declared} > {remaining}]")]
    HeaderOverrun { declared: usize, remaining: usize },
    #[error("multi-fragment frame [{fragment}/{of_fragments}]")]
    Fragmented { fragment: u8, of_fragments: u8 },
    #[error("unknown message type [{0}]")]
    UnknownType(u8),
    #[error("unsequenced data frame [type {message_type}]")]
    UnsequencedData { message_type: u8 },
    #[error("invalid token: {0}")]
    Token(#[from] std::string::FromUtf8Error),
}
