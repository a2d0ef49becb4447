/// Errors that can occur during packet encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    /// The frame header carries a length outside the sane range.
    #[error("invalid packet size {size} (min {min}, max {max})")]
    InvalidSize {
        size: usize,
        min: usize,
        max: usize,
    },

    /// The frame header carries an unknown type tag.
    #[error("unknown packet type tag {tag}")]
    UnknownType { tag: u8 },

    /// A payload ended before all fields of its packet type were read.
    #[error("truncated payload in {packet} packet")]
    Truncated { packet: &'static str },

    /// A payload field holds a value outside its enum's range.
    #[error("invalid {field} value {value}")]
    InvalidField { field: &'static str, value: u8 },

    /// A payload string is not valid UTF-8.
    #[error("payload text is not valid UTF-8")]
    InvalidText(#[from] std::string::FromUtf8Error),

    /// An I/O error occurred while reading packets.
    #[error("packet I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete packet was received.
    #[error("connection closed (incomplete packet)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, PacketError>;
