use thiserror::Error;

// Error codes carried in the frame's err_code field and in RpcController.
// 0 means no error.
pub const ERROR_PEER_CLOSED: i32 = 10000000;
pub const ERROR_FAILED_CONNECT: i32 = 10000001;
pub const ERROR_FAILED_GET_REPLY: i32 = 10000002;
pub const ERROR_FAILED_DESERIALIZE: i32 = 10000003;
pub const ERROR_FAILED_SERIALIZE: i32 = 10000004;
pub const ERROR_FAILED_ENCODE: i32 = 10000005;
pub const ERROR_FAILED_DECODE: i32 = 10000006;
pub const ERROR_RPC_CALL_TIMEOUT: i32 = 10000007;
pub const ERROR_SERVICE_NOT_FOUND: i32 = 10000008;
pub const ERROR_METHOD_NOT_FOUND: i32 = 10000009;
pub const ERROR_PARSE_SERVICE_NAME: i32 = 10000010;
pub const ERROR_RPC_CHANNEL_INIT: i32 = 10000011;
pub const ERROR_RPC_PEER_ADDR: i32 = 10000012;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid address: {0}")]
    InvalidAddr(String),

    /// A thread may own at most one EventLoop.
    #[error("this thread already owns an event loop")]
    LoopExists,

    #[error("config error: {0}")]
    Config(String),

    #[error("payload error: {0}")]
    Payload(#[from] PayloadError),

    #[error("connect error [{code}]: {info}")]
    Connect { code: i32, info: String },
}

/// Failure of the external payload serializer.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("failed to serialize payload: {0}")]
    Serialize(String),
    #[error("failed to deserialize payload: {0}")]
    Deserialize(String),
}

pub type Result<T> = std::result::Result<T, RpcError>;

/// Map a failed connect to its wire error code. A refused connection means nobody is listening.
pub fn connect_error_code(err: &std::io::Error) -> i32 {
    if err.kind() == std::io::ErrorKind::ConnectionRefused {
        ERROR_PEER_CLOSED
    } else {
        ERROR_FAILED_CONNECT
    }
}

/// Parse `ip:port`. Used for listen and peer addresses.
pub fn parse_addr(addr: &str) -> Result<std::net::SocketAddr> {
    addr.parse()
        .map_err(|_| RpcError::InvalidAddr(addr.to_owned()))
}
