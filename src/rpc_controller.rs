use std::net::SocketAddr;

pub const DEFAULT_RPC_TIMEOUT_MS: i64 = 1000;

/// Per-call metadata: correlation id, deadline, outcome and endpoint addresses.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcController {
    pub msg_id: String,
    /// ms
    pub timeout: i64,
    pub error_code: i32,
    pub error_info: String,
    pub failed: bool,
    pub canceled: bool,
    pub local_addr: Option<SocketAddr>,
    pub peer_addr: Option<SocketAddr>,
}

impl Default for RpcController {
    fn default() -> Self {
        Self {
            msg_id: String::new(),
            timeout: DEFAULT_RPC_TIMEOUT_MS,
            error_code: 0,
            error_info: String::new(),
            failed: false,
            canceled: false,
            local_addr: None,
            peer_addr: None,
        }
    }
}

impl RpcController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout_ms: i64) -> Self {
        self.timeout = timeout_ms;
        self
    }

    pub fn with_msg_id(mut self, msg_id: impl Into<String>) -> Self {
        self.msg_id = msg_id.into();
        self
    }

    pub fn set_error(&mut self, code: i32, info: impl Into<String>) {
        self.error_code = code;
        self.error_info = info.into();
        self.failed = true;
    }

    pub fn set_failed(&mut self, reason: impl Into<String>) {
        self.error_info = reason.into();
        self.failed = true;
    }

    pub fn start_cancel(&mut self) {
        self.canceled = true;
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    pub fn error_text(&self) -> &str {
        &self.error_info
    }

    /// Back to defaults, keeping nothing.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    pub fn test_controller() {
        let mut c = RpcController::new().with_timeout(100).with_msg_id("42");
        assert_eq!(c.timeout, 100);
        assert!(!c.failed());
        c.set_error(crate::ERROR_RPC_CALL_TIMEOUT, "timeout");
        assert!(c.failed());
        assert_eq!(c.error_code, crate::ERROR_RPC_CALL_TIMEOUT);
        c.start_cancel();
        assert!(c.is_canceled());
        c.reset();
        assert_eq!(c, RpcController::default());
        assert_eq!(c.timeout, DEFAULT_RPC_TIMEOUT_MS);
    }
}
