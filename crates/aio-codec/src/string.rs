use aio_core::{
    ConnectionContext, CoreError, DecodeOutcome, OutputWriter, Packet, ProtocolHandler,
    ReadCursor, codes,
};

use crate::TextHandler;

/// 长度前缀字符串协议：`u32` 大端长度 + UTF-8 负载。
///
/// # 行为概览（How）
/// - `decode`：长度或负载不足返回 `Incomplete`；声明长度超过 `max_length` 同样返回
///   `Incomplete`，把机会留给链上的其它协议；负载不是合法 UTF-8 时报 `protocol.decode`；
/// - `handle`：把 `String` 交给业务回调，`Some(reply)` 作为回复；
/// - `encode`：写出长度与负载。
///
/// # 契约说明（What）
/// - 入站与出站的 [`Packet`] 都承载 `String`；
/// - 未设置 `max_length` 时任意长度都会被等待，实际上限由内核的
///   `max_pending_read_bytes` 兜底。
pub struct StringProtocol {
    max_length: Option<usize>,
    handler: Box<TextHandler>,
}

impl StringProtocol {
    pub fn new(
        handler: impl Fn(&ConnectionContext, String) -> Result<Option<String>, CoreError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            max_length: None,
            handler: Box::new(handler),
        }
    }

    /// 声明长度超过 `limit` 的帧不被认作本协议。
    pub fn max_length(mut self, limit: usize) -> Self {
        self.max_length = Some(limit);
        self
    }
}

impl ProtocolHandler for StringProtocol {
    fn name(&self) -> &str {
        "string"
    }

    fn decode(
        &self,
        cursor: &mut ReadCursor<'_>,
        _ctx: &ConnectionContext,
    ) -> Result<DecodeOutcome, CoreError> {
        let Some(length) = cursor.get_u32() else {
            return Ok(DecodeOutcome::Incomplete);
        };
        let length = length as usize;
        if self.max_length.is_some_and(|limit| length > limit) {
            return Ok(DecodeOutcome::Incomplete);
        }
        let Some(body) = cursor.take(length) else {
            return Ok(DecodeOutcome::Incomplete);
        };
        let text = String::from_utf8(body.to_vec()).map_err(|err| {
            CoreError::new(codes::PROTOCOL_DECODE, "string payload is not valid UTF-8").with_cause(err)
        })?;
        Ok(DecodeOutcome::Complete(Packet::new(text)))
    }

    fn handle(&self, ctx: &ConnectionContext, packet: Packet) -> Result<Option<Packet>, CoreError> {
        let text = packet.downcast::<String>().map_err(|_| {
            CoreError::new(codes::APP_PROCESS_FAILED, "string protocol received a foreign packet")
        })?;
        Ok((self.handler)(ctx, text)?.map(Packet::new))
    }

    fn encode(
        &self,
        packet: &Packet,
        out: &mut OutputWriter<'_>,
        _ctx: &ConnectionContext,
    ) -> Result<(), CoreError> {
        let text = packet.downcast_ref::<String>().ok_or_else(|| {
            CoreError::new(codes::PROTOCOL_ENCODE, "string protocol can only encode `String`")
        })?;
        let length = u32::try_from(text.len()).map_err(|_| {
            CoreError::new(
                codes::PROTOCOL_ENCODE,
                format!("string payload of {} bytes exceeds the u32 length prefix", text.len()),
            )
        })?;
        out.put_u32(length)?;
        out.put_slice(text.as_bytes())
    }
}
