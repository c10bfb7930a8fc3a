use std::io;
use std::time::Duration;

use aio_core::{CoreError, ErrorCategory};

/// 一类套接字操作：稳定错误码 + 日志前缀。
#[derive(Clone, Copy)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "aio.transport.tcp.bind_failed",
    message: "tcp bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "aio.transport.tcp.accept_failed",
    message: "tcp accept",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "aio.transport.tcp.connect_failed",
    message: "tcp connect",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "aio.transport.tcp.read_failed",
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "aio.transport.tcp.write_failed",
    message: "tcp write",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "aio.transport.tcp.configure_failed",
    message: "tcp configure",
};

/// 将 IO 错误映射为内核错误，并附带错误分类。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> CoreError {
    let category = categorize_io_error(&error);
    CoreError::new(kind.code, format!("{}: {error}", kind.message))
        .with_category(category)
        .with_cause(error)
}

/// 对端断开或地址暂不可用时建议的重试间隔。
const PEER_BACKOFF: Duration = Duration::from_millis(50);

fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind::*;
    match error.kind() {
        TimedOut => ErrorCategory::Timeout,
        WouldBlock | Interrupted | WriteZero => ErrorCategory::Retryable(Duration::from_millis(5)),
        ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected | BrokenPipe
        | AddrInUse | AddrNotAvailable => ErrorCategory::Retryable(PEER_BACKOFF),
        _ => ErrorCategory::NonRetryable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_is_retryable_and_keeps_the_source() {
        let err = map_io_error(READ, io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(err.code(), "aio.transport.tcp.read_failed");
        assert_eq!(err.category(), ErrorCategory::Retryable(PEER_BACKOFF));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn timeouts_and_permissions_are_classified() {
        let timeout = map_io_error(CONNECT, io::Error::from(io::ErrorKind::TimedOut));
        assert_eq!(timeout.category(), ErrorCategory::Timeout);
        let denied = map_io_error(BIND, io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(denied.category(), ErrorCategory::NonRetryable);
        assert!(denied.message().starts_with("tcp bind"));
    }
}
