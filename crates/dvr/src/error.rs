use thiserror::Error;

/// Errors that can occur while decoding a container.
#[derive(Error, Debug)]
pub enum DvrError {
    #[error("unexpected end of stream: waiting for {needed} bytes, {available} available")]
    UnexpectedEof { needed: usize, available: usize },

    #[error("stream buffer cannot grow past {0} bytes")]
    BufferExhausted(usize),

    #[error("invalid sync byte: expected 0x47, got 0x{0:02x}")]
    InvalidSyncByte(u8),

    #[error("invalid packet size: expected 188 bytes, got {0}")]
    InvalidPacketSize(usize),

    #[error("adaptation field length {0} overruns the packet")]
    InvalidAdaptationField(usize),

    #[error("unhandled start code: 0x{0:08x}")]
    UnknownStartCode(u32),

    #[error("bad container magic: {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("unsupported container variant: {0}")]
    UnsupportedFormat(&'static str),

    #[error("malformed container header: {0}")]
    MalformedHeader(String),

    #[error("decrypt error: {0}")]
    Decrypt(#[from] turing::TuringError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for decode operations.
pub type Result<T> = std::result::Result<T, DvrError>;
