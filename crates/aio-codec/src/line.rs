use aio_core::{
    ConnectionContext, CoreError, DecodeOutcome, OutputWriter, Packet, ProtocolHandler,
    ReadCursor, codes,
};

use crate::TextHandler;

const NEWLINE: u8 = b'\n';
/// 已扫描过、确认不含换行符的字节数，存放在连接属性表中。
const SCANNED_ATTR: &str = "aio.codec.line.scanned";

/// 换行分隔文本协议。
///
/// # 设计动机（Why）
/// - 一行文本可能跨越很多次读完成；每次都从行首重新找换行符，长行的解码代价会随读次数平方增长；
/// - 协议实例在所有连接间共享，续扫位置只能放在连接自己的属性表里。
///
/// # 行为概览（How）
/// - 从上次记录的位置继续查找 `\n`；找到时清除续扫位置，去掉行尾 `\r`，按 UTF-8 解析；
/// - 找不到时记录已扫描长度并返回 `Incomplete`；
/// - 行长（不含换行符）超过 `max_line`：连接已绑定本协议时报 `protocol.frame_too_large`；
///   尚未绑定时只说明“不是本协议”，返回 `Incomplete` 让链上的其它协议继续试探，
///   积压上限由内核的 `max_pending_read_bytes` 兜底。
///
/// # 契约说明（What）
/// - 续扫位置只在游标起点不变时有效：返回 `Incomplete` 时分发链会把游标恢复到行首，
///   内核下次以同一起点重新调用，满足该前提；
/// - 编码写出文本并追加 `\n`，文本自身不得包含换行符。
pub struct LineProtocol {
    max_line: usize,
    handler: Box<TextHandler>,
}

impl LineProtocol {
    pub const DEFAULT_MAX_LINE: usize = 8 * 1024;

    pub fn new(
        handler: impl Fn(&ConnectionContext, String) -> Result<Option<String>, CoreError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            max_line: Self::DEFAULT_MAX_LINE,
            handler: Box::new(handler),
        }
    }

    pub fn max_line(mut self, limit: usize) -> Self {
        self.max_line = limit;
        self
    }

    fn over_limit(&self, length: usize, ctx: &ConnectionContext) -> Result<DecodeOutcome, CoreError> {
        if ctx.protocol() != Some(self.name()) {
            return Ok(DecodeOutcome::Incomplete);
        }
        Err(CoreError::new(
            codes::PROTOCOL_FRAME_TOO_LARGE,
            format!("line of {length} bytes exceeds the {}-byte limit", self.max_line),
        ))
    }
}

impl ProtocolHandler for LineProtocol {
    fn name(&self) -> &str {
        "line"
    }

    fn decode(
        &self,
        cursor: &mut ReadCursor<'_>,
        ctx: &ConnectionContext,
    ) -> Result<DecodeOutcome, CoreError> {
        let chunk = cursor.chunk();
        let scanned = ctx
            .attr::<usize>(SCANNED_ATTR)
            .unwrap_or(0)
            .min(chunk.len());
        let Some(offset) = chunk[scanned..].iter().position(|byte| *byte == NEWLINE) else {
            ctx.set_attr(SCANNED_ATTR, chunk.len());
            if chunk.len() > self.max_line {
                return self.over_limit(chunk.len(), ctx);
            }
            return Ok(DecodeOutcome::Incomplete);
        };

        let end = scanned + offset;
        ctx.remove_attr(SCANNED_ATTR);
        if end > self.max_line {
            return self.over_limit(end, ctx);
        }
        let line = chunk[..end].strip_suffix(b"\r").unwrap_or(&chunk[..end]);
        let text = std::str::from_utf8(line)
            .map_err(|err| {
                CoreError::new(codes::PROTOCOL_DECODE, "line is not valid UTF-8").with_cause(err)
            })?
            .to_owned();
        cursor.advance(end + 1);
        Ok(DecodeOutcome::Complete(Packet::new(text)))
    }

    fn handle(&self, ctx: &ConnectionContext, packet: Packet) -> Result<Option<Packet>, CoreError> {
        let text = packet.downcast::<String>().map_err(|_| {
            CoreError::new(codes::APP_PROCESS_FAILED, "line protocol received a foreign packet")
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
            CoreError::new(codes::PROTOCOL_ENCODE, "line protocol can only encode `String`")
        })?;
        if text.as_bytes().contains(&NEWLINE) {
            tracing::debug!(len = text.len(), "rejecting multi-line payload");
            return Err(CoreError::new(
                codes::PROTOCOL_ENCODE,
                "line payload must not contain a newline",
            ));
        }
        out.put_slice(text.as_bytes())?;
        out.put_u8(NEWLINE)
    }
}
