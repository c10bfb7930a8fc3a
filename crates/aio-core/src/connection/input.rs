use std::sync::atomic::Ordering;

use aio_buffer::Lease;

use crate::connection::{CLOSED, ConnectionContext};
use crate::error::{CoreError, codes};
use crate::protocol::{Packet, ReadCursor, StateEvent};

/// 解码执行器上的事件：一段新读入的字节，或对端关闭写方向。
pub(crate) enum ReadEvent {
    Segment(Lease),
    Eof,
}

/// 处理执行器上的工作项。`Finish` 排在最后一个已解码单元之后，用于半关闭后的有序收尾。
pub(crate) enum Work {
    Unit(Packet),
    Finish,
}

impl ConnectionContext {
    /// 传输层发起读之前调用。
    pub fn before_read(&self) {
        if !self.is_invalid() {
            self.inner.chain.before_read(self);
        }
    }

    /// 传输层回报一次读完成，租约中为新读入的字节。
    ///
    /// 字节按提交顺序进入解码执行器；解码队列已满时阻塞调用方，这是输入侧的背压点。
    /// 连接不再是 `Enabled` 时返回 `connection.closed`，租约随之归还。
    pub fn read_completed(&self, segment: Lease) -> Result<(), CoreError> {
        self.ensure_enabled()?;
        if segment.remaining() == 0 {
            return Ok(());
        }
        self.submit_read(ReadEvent::Segment(segment))
    }

    /// 把一段外部字节拷入池租约后交给 [`Self::read_completed`]，按 `read_buffer_size` 切分。
    pub fn receive(&self, bytes: &[u8]) -> Result<(), CoreError> {
        let step = self.inner.config.read_buffer_size;
        for piece in bytes.chunks(step) {
            self.ensure_enabled()?;
            let mut lease = self.inner.pool.allocate(piece.len())?;
            lease.put_slice(piece)?;
            self.read_completed(lease)?;
        }
        Ok(())
    }

    /// 对端关闭了写方向。
    ///
    /// 已读入的字节仍会被解码、已解码的单元仍会被处理，之后连接广播 `InputShutdown`
    /// 并进入优雅关闭。
    pub fn input_shutdown(&self) {
        if self.is_invalid() {
            return;
        }
        if self.submit_read(ReadEvent::Eof).is_err() {
            self.close(false);
        }
    }

    /// 读失败：广播 `InputException` 后优雅关闭。
    pub fn read_failed(&self, error: CoreError) {
        if self.is_invalid() {
            return;
        }
        tracing::warn!(
            connection = self.serial(),
            code = error.code(),
            "read failed: {error}"
        );
        self.notify(StateEvent::InputException, Some(&error));
        self.close(false);
    }

    fn submit_read(&self, event: ReadEvent) -> Result<(), CoreError> {
        match self.inner.decode_runner.submit(event) {
            Ok(true) => Ok(()),
            Ok(false) | Err(_) => Err(CoreError::closed(self.serial())),
        }
    }

    pub(super) fn on_read_event(&self, event: ReadEvent) {
        if self.is_invalid() {
            return;
        }
        match event {
            ReadEvent::Segment(segment) => self.decode_segment(segment),
            ReadEvent::Eof => {
                tracing::debug!(connection = self.serial(), "input shutdown");
                self.notify(StateEvent::InputShutdown, None);
                if self.submit_work(Work::Finish).is_err() {
                    self.close(false);
                }
            }
        }
    }

    fn decode_segment(&self, segment: Lease) {
        self.inner.chain.after_read(self, segment.remaining());
        if let Err(err) = self.decode_pending(segment) {
            if err.is_closed() {
                return;
            }
            tracing::warn!(
                connection = self.serial(),
                code = err.code(),
                "decode failed: {err}"
            );
            self.notify(StateEvent::InputException, Some(&err));
            self.close(false);
        }
    }

    /// 把新字节并入累积区并循环解码，直到数据不足。
    ///
    /// 累积区在解码期间被取出锁外：协议或插件在回调中关闭连接时，`teardown` 不会与这里争锁。
    fn decode_pending(&self, segment: Lease) -> Result<(), CoreError> {
        let taken = self.inner.pending.lock().take();
        let mut pending = self.accumulate(taken, segment)?;
        let chain = &self.inner.chain;
        chain.before_decode(self, pending.remaining());

        let (consumed, outcome) = {
            let mut cursor = ReadCursor::new(pending.readable());
            let outcome = loop {
                if cursor.remaining() == 0 {
                    break Ok(());
                }
                match chain.decode(&mut cursor, self) {
                    Ok(Some(packet)) => {
                        chain.after_decode(self, &packet);
                        if let Err(err) = self.submit_work(Work::Unit(packet)) {
                            break Err(err);
                        }
                    }
                    Ok(None) => break Ok(()),
                    Err(err) => break Err(err),
                }
            };
            (cursor.position(), outcome)
        };
        pending.consume(consumed)?;
        outcome?;

        // 空累积区立即归还，下一次读直接以新租约充当累积区。
        if pending.remaining() > 0 {
            let mut slot = self.inner.pending.lock();
            if self.inner.status.load(Ordering::Acquire) != CLOSED {
                *slot = Some(pending);
            }
        }
        Ok(())
    }

    fn accumulate(&self, taken: Option<Lease>, segment: Lease) -> Result<Lease, CoreError> {
        let limit = self.inner.config.max_pending_read_bytes;
        let Some(mut pending) = taken else {
            if segment.remaining() > limit {
                return Err(frame_too_large(segment.remaining(), limit));
            }
            return Ok(segment);
        };
        let incoming = segment.readable();
        let needed = pending.remaining() + incoming.len();
        if needed > limit {
            return Err(frame_too_large(needed, limit));
        }
        if pending.remaining_mut() < incoming.len() {
            pending.compact();
        }
        if pending.remaining_mut() < incoming.len() {
            let capacity = needed.next_power_of_two().min(limit);
            let mut grown = self.inner.pool.allocate(capacity)?;
            grown.put_slice(pending.readable())?;
            pending = grown;
        }
        pending.put_slice(incoming)?;
        Ok(pending)
    }

    fn submit_work(&self, work: Work) -> Result<(), CoreError> {
        match self.inner.handle_runner.submit(work) {
            Ok(true) => Ok(()),
            Ok(false) | Err(_) => Err(CoreError::closed(self.serial())),
        }
    }

    pub(super) fn on_work(&self, work: Work) {
        if self.is_invalid() {
            return;
        }
        match work {
            Work::Unit(packet) => self.process_packet(packet),
            Work::Finish => {
                let _ = self.flush();
                self.close(false);
            }
        }
    }

    fn process_packet(&self, packet: Packet) {
        let chain = &self.inner.chain;
        if chain.before_process(self, &packet) {
            if let Some(index) = self.protocol_index() {
                match chain.protocol_at(index).handle(self, packet) {
                    Ok(Some(reply)) => {
                        if let Err(err) = self.send(reply) {
                            self.report_process_failure(err);
                        }
                    }
                    Ok(None) => {}
                    Err(err) => self.report_process_failure(err),
                }
            }
        }
        // 批次处理完再刷写，连续的小回复合并进同一个分片。
        if self.inner.handle_runner.pending() == 0 {
            if let Err(err) = self.flush() {
                if !err.is_closed() {
                    tracing::warn!(connection = self.serial(), "flush failed: {err}");
                }
            }
        }
    }

    fn report_process_failure(&self, err: CoreError) {
        if err.is_closed() {
            return;
        }
        tracing::warn!(
            connection = self.serial(),
            code = err.code(),
            "process failed: {err}"
        );
        self.notify(StateEvent::ProcessException, Some(&err));
    }
}

fn frame_too_large(needed: usize, limit: usize) -> CoreError {
    CoreError::new(
        codes::PROTOCOL_FRAME_TOO_LARGE,
        format!("{needed} undecoded bytes exceed the {limit}-byte read limit"),
    )
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::connection::{ConnectionContext, ConnectionStatus, OutputWriter};
    use crate::error::CoreError;
    use crate::protocol::{DecodeOutcome, DispatchChain, Packet, ProtocolHandler, ReadCursor};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn chain() -> Arc<DispatchChain> {
        DispatchChain::builder()
            .protocol(EchoBytes)
            .build()
            .expect("构建分发链失败")
    }

    fn wait_closed(ctx: &ConnectionContext) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while ctx.status() != ConnectionStatus::Closed && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn frames_split_across_reads_are_reassembled() {
        let pool = pool();
        let (ctx, rx, _sink) = connect(chain(), &pool);
        for byte in b"\x05hello\x02hi" {
            ctx.receive(&[*byte]).expect("读入失败");
        }
        let mut echoed = Vec::new();
        while echoed.len() < 9 {
            let chunk = rx
                .recv_timeout(Duration::from_secs(2))
                .expect("应回显全部帧");
            echoed.extend_from_slice(&chunk);
        }
        assert_eq!(echoed, b"\x05hello\x02hi");
        assert_eq!(ctx.protocol(), Some("echo-bytes"));
        ctx.close(true);
        // 最后一个分片由回报线程在 `write_completed` 中归还。
        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.used_bytes() != 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.used_bytes(), 0);
    }

    #[test]
    fn input_shutdown_processes_buffered_units_before_closing() {
        let pool = pool();
        let (ctx, rx, sink) = connect(chain(), &pool);
        ctx.receive(b"\x03abc").expect("读入失败");
        ctx.input_shutdown();
        let chunk = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("半关闭前的帧仍应被处理");
        assert_eq!(chunk, b"\x03abc");
        wait_closed(&ctx);
        assert_eq!(ctx.status(), ConnectionStatus::Closed);
        assert_eq!(sink.shutdowns.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    /// 永远等待更多字节的协议，用来把累积区撑到上限。
    struct Hoarder;

    impl ProtocolHandler for Hoarder {
        fn name(&self) -> &str {
            "hoarder"
        }

        fn decode(
            &self,
            _cursor: &mut ReadCursor<'_>,
            _ctx: &ConnectionContext,
        ) -> Result<DecodeOutcome, CoreError> {
            Ok(DecodeOutcome::Incomplete)
        }

        fn handle(&self, _ctx: &ConnectionContext, _packet: Packet) -> Result<Option<Packet>, CoreError> {
            Ok(None)
        }

        fn encode(
            &self,
            _packet: &Packet,
            _out: &mut OutputWriter<'_>,
            _ctx: &ConnectionContext,
        ) -> Result<(), CoreError> {
            Ok(())
        }
    }

    #[test]
    fn oversized_pending_input_closes_connection() {
        let pool = pool();
        let chain = DispatchChain::builder()
            .protocol(Hoarder)
            .build()
            .expect("构建分发链失败");
        let (ctx, _rx, _sink) = connect(chain, &pool);
        let block = [7u8; 64];
        for _ in 0..32 {
            if ctx.receive(&block).is_err() {
                break;
            }
        }
        wait_closed(&ctx);
        assert_eq!(ctx.status(), ConnectionStatus::Closed);
        assert_eq!(pool.used_bytes(), 0);
    }

    #[test]
    fn reads_after_close_are_rejected() {
        let pool = pool();
        let (ctx, _rx, _sink) = connect(chain(), &pool);
        ctx.close(true);
        let err = ctx.receive(b"\x01a").expect_err("关闭后读入必须失败");
        assert!(err.is_closed());
        assert_eq!(pool.used_bytes(), 0);
    }
}
