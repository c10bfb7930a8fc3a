use std::borrow::Cow;
use std::error::Error;
use std::fmt;
use std::time::Duration;

use aio_buffer::BufferError;

/// `CoreError` 是连接内核跨模块共享的稳定错误域。
///
/// # 设计背景（Why）
/// - 内存池、协议解码、业务处理与传输层在不同层次产生的故障需要合流为统一的错误码，
///   状态事件、日志与监控插件才能按码值聚合；
/// - 解码失败与处理失败在连接生命周期上的后果不同（前者强制关闭，后者保持连接），
///   调用方通过 [`ErrorCategory`] 而不是字符串匹配来区分。
///
/// # 逻辑解析（How）
/// - `code` 始终为 `'static` 字符串，遵循 `<域>.<语义>` 约定，见 [`codes`]；
/// - `message` 面向排障人员；`cause` 保存底层错误并通过 `source()` 暴露；
/// - 分类优先取显式设置值，否则按错误码查默认表。
///
/// # 契约说明（What）
/// - `Send + Sync + 'static`，可在线程池与 IO 任务之间移动；
/// - 不实现 `Clone`：底层原因是装箱的 trait 对象，状态事件以引用方式传递错误。
#[derive(Debug)]
pub struct CoreError {
    code: &'static str,
    message: Cow<'static, str>,
    cause: Option<ErrorCause>,
    category: Option<ErrorCategory>,
}

/// 底层原因，保持 `Send + Sync` 以便跨线程传递。
pub type ErrorCause = Box<dyn Error + Send + Sync + 'static>;

/// 内核统一的返回值别名。
pub type Result<T, E = CoreError> = std::result::Result<T, E>;

impl CoreError {
    /// 使用稳定错误码与描述构造错误。
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            category: None,
        }
    }

    /// 附带底层原因。
    pub fn with_cause(mut self, cause: impl Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// 显式覆盖错误分类。
    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// 获取错误分类：显式设置优先，其次按错误码查默认表，查不到时为 `NonRetryable`。
    pub fn category(&self) -> ErrorCategory {
        self.category
            .clone()
            .or_else(|| default_category(self.code))
            .unwrap_or(ErrorCategory::NonRetryable)
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 人类可读描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 底层原因。
    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    /// 是否属于“连接已关闭”。传输层据此区分正常收尾与真正的失败。
    pub fn is_closed(&self) -> bool {
        self.code == codes::CONNECTION_CLOSED || self.code == codes::QUEUE_CLOSED
    }

    pub(crate) fn closed(serial: u64) -> Self {
        Self::new(
            codes::CONNECTION_CLOSED,
            format!("connection #{serial} is not enabled"),
        )
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_ref()
            .map(|boxed| boxed.as_ref() as &(dyn Error + 'static))
    }
}

impl From<BufferError> for CoreError {
    fn from(err: BufferError) -> Self {
        let code = match err {
            BufferError::Exhausted { .. } => codes::BUFFER_EXHAUSTED,
            BufferError::RequestTooLarge { .. } => codes::BUFFER_REQUEST_TOO_LARGE,
            BufferError::Overflow { .. } | BufferError::Underflow { .. } => codes::BUFFER_OVERFLOW,
            BufferError::InvalidConfig(_) => codes::CONFIG_INVALID,
        };
        CoreError::new(code, err.to_string()).with_cause(err)
    }
}

/// 错误分类，驱动连接的处置策略。
///
/// - `ResourceExhausted`：内存池或队列容量耗尽，调用方可稍后重试；
/// - `ProtocolViolation`：字节流已被污染，连接必须关闭；
/// - `Application`：业务处理失败，连接默认保持；
/// - `Closed`：连接或队列已关闭，属于正常收尾；
/// - `Retryable`：携带退避建议，多见于传输层瞬时错误。
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    Retryable(Duration),
    NonRetryable,
    ResourceExhausted,
    ProtocolViolation,
    Application,
    Closed,
    Configuration,
    Timeout,
}

fn default_category(code: &str) -> Option<ErrorCategory> {
    let category = match code {
        codes::BUFFER_EXHAUSTED | codes::BUFFER_REQUEST_TOO_LARGE | codes::BUFFER_OVERFLOW => {
            ErrorCategory::ResourceExhausted
        }
        codes::PROTOCOL_DECODE
        | codes::PROTOCOL_FRAME_TOO_LARGE
        | codes::PROTOCOL_DECODE_STALLED
        | codes::PROTOCOL_ENCODE => ErrorCategory::ProtocolViolation,
        codes::APP_PROCESS_FAILED => ErrorCategory::Application,
        codes::CONNECTION_CLOSED | codes::QUEUE_CLOSED => ErrorCategory::Closed,
        codes::CONFIG_INVALID | codes::PROTOCOL_UNKNOWN | codes::PROTOCOL_UNBOUND => {
            ErrorCategory::Configuration
        }
        _ => return None,
    };
    Some(category)
}

/// 稳定错误码集合，遵循 `<域>.<语义>` 命名约定。
pub mod codes {
    /// 内存池页数耗尽。
    pub const BUFFER_EXHAUSTED: &str = "buffer.exhausted";
    /// 单次租借超过页容量。
    pub const BUFFER_REQUEST_TOO_LARGE: &str = "buffer.request_too_large";
    /// 租约读写越界。
    pub const BUFFER_OVERFLOW: &str = "buffer.overflow";
    /// 协议解码失败（输入并非“不完整”而是非法）。
    pub const PROTOCOL_DECODE: &str = "protocol.decode";
    /// 协议编码失败。
    pub const PROTOCOL_ENCODE: &str = "protocol.encode";
    /// 未解码字节超过 `max_pending_read_bytes`。
    pub const PROTOCOL_FRAME_TOO_LARGE: &str = "protocol.frame_too_large";
    /// 解码器声称完成却没有消费任何字节。
    pub const PROTOCOL_DECODE_STALLED: &str = "protocol.decode_stalled";
    /// 连接尚未绑定协议。
    pub const PROTOCOL_UNBOUND: &str = "protocol.unbound";
    /// 协议名未在分发链中注册。
    pub const PROTOCOL_UNKNOWN: &str = "protocol.unknown";
    /// 连接已进入关闭流程。
    pub const CONNECTION_CLOSED: &str = "connection.closed";
    /// 业务处理失败。
    pub const APP_PROCESS_FAILED: &str = "app.process_failed";
    /// 配置不合法。
    pub const CONFIG_INVALID: &str = "config.invalid";
    /// 队列已关闭。
    pub const QUEUE_CLOSED: &str = "queue.closed";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_errors_keep_their_cause_and_category() {
        let err = CoreError::from(BufferError::Exhausted {
            requested: 8,
            pages: 2,
            max_pages: 2,
        });
        assert_eq!(err.code(), codes::BUFFER_EXHAUSTED);
        assert_eq!(err.category(), ErrorCategory::ResourceExhausted);
        assert!(err.source().is_some(), "底层 BufferError 必须保留在错误链上");
    }

    #[test]
    fn explicit_category_overrides_table() {
        let err = CoreError::new(codes::PROTOCOL_DECODE, "bad frame")
            .with_category(ErrorCategory::Application);
        assert_eq!(err.category(), ErrorCategory::Application);
        assert_eq!(err.to_string(), "[protocol.decode] bad frame");
    }

    #[test]
    fn unknown_codes_fall_back_to_non_retryable() {
        let err = CoreError::new("demo.custom", "custom");
        assert_eq!(err.category(), ErrorCategory::NonRetryable);
        assert!(!err.is_closed());
    }
}
