use std::fmt;
use std::sync::atomic::Ordering;

use aio_buffer::Lease;

use crate::connection::{ConnectionContext, ENABLED};
use crate::error::{CoreError, codes};
use crate::protocol::{Packet, StateEvent};

/// 一个待写出的输出分片，持有池租约直到传输层回报写完成。
pub struct OutboundChunk {
    lease: Lease,
}

impl OutboundChunk {
    pub fn bytes(&self) -> &[u8] {
        self.lease.readable()
    }

    pub fn len(&self) -> usize {
        self.lease.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.lease.remaining() == 0
    }
}

impl fmt::Debug for OutboundChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundChunk")
            .field("len", &self.len())
            .finish()
    }
}

/// 传输层的写出端。
///
/// # 契约说明（What）
/// - `write` 接收一个分片并发起异步写；同一连接任意时刻至多一个分片在途；
/// - 写完成后传输层调用 [`ConnectionContext::write_completed`]，失败时调用
///   [`ConnectionContext::write_failed`]，两者都必须**异步**回报，不得在 `write` 内部同步调用；
/// - `shutdown` 在连接进入 `Closed` 时调用一次。
pub trait OutboundSink: Send + Sync + 'static {
    fn write(&self, chunk: OutboundChunk);

    fn shutdown(&self) {}
}

/// 协议编码器使用的输出写入器。
///
/// 字节先写入暂存租约；暂存字节达到 `write_chunk_size` 时整块封装为分片送入刷写队列，
/// 刷写队列满时阻塞（输出背压点）。写入器存活期间持有连接的输出锁。
///
/// 编码失败时，尚未封装的字节被回退；若该数据单元已有字节随分片进入刷写队列，
/// 连接以 `OutputException` 立即关闭，对端不会在截断的帧之后看到下一帧。
pub struct OutputWriter<'a> {
    ctx: &'a ConnectionContext,
    staging: &'a mut Option<Lease>,
    written: usize,
    sealed: bool,
}

impl OutputWriter<'_> {
    pub fn put_slice(&mut self, mut src: &[u8]) -> Result<(), CoreError> {
        while !src.is_empty() {
            if self.staging.is_none() {
                let chunk_size = self.ctx.inner.config.write_chunk_size;
                *self.staging = Some(self.ctx.inner.pool.allocate(chunk_size)?);
            }
            let Some(lease) = self.staging.as_mut() else {
                continue;
            };
            let step = src.len().min(lease.remaining_mut());
            lease.put_slice(&src[..step])?;
            src = &src[step..];
            self.written += step;
            if lease.remaining_mut() == 0 {
                self.sealed = true;
                self.ctx.seal(self.staging)?;
            }
        }
        Ok(())
    }

    pub fn put_u8(&mut self, value: u8) -> Result<(), CoreError> {
        self.put_slice(&[value])
    }

    /// 大端序。
    pub fn put_u32(&mut self, value: u32) -> Result<(), CoreError> {
        self.put_slice(&value.to_be_bytes())
    }

    /// 本次编码已写入的字节数。
    pub fn written(&self) -> usize {
        self.written
    }
}

impl ConnectionContext {
    /// 编码并暂存一个数据单元；暂存未满时不会触发写出。
    pub fn send(&self, packet: Packet) -> Result<(), CoreError> {
        self.write_packet(packet, false)
    }

    /// 编码后立即封装暂存区并触发写出。
    pub fn send_and_flush(&self, packet: Packet) -> Result<(), CoreError> {
        self.write_packet(packet, true)
    }

    /// 封装暂存区并触发写出。
    pub fn flush(&self) -> Result<(), CoreError> {
        self.ensure_enabled()?;
        let mut staging = self.inner.staging.lock();
        self.seal(&mut staging)
    }

    pub(super) fn ensure_enabled(&self) -> Result<(), CoreError> {
        if self.inner.status.load(Ordering::Acquire) == ENABLED {
            Ok(())
        } else {
            Err(CoreError::closed(self.serial()))
        }
    }

    fn write_packet(&self, packet: Packet, flush: bool) -> Result<(), CoreError> {
        self.ensure_enabled()?;
        let index = self.protocol_index().ok_or_else(|| {
            CoreError::new(
                codes::PROTOCOL_UNBOUND,
                format!("connection #{} has no bound protocol", self.serial()),
            )
        })?;
        let chain = &self.inner.chain;
        chain.before_encode(self, &packet);

        let written = {
            let mut staging = self.inner.staging.lock();
            self.ensure_enabled()?;
            let mark = staging.as_ref().map(Lease::len);
            let mut out = OutputWriter {
                ctx: self,
                staging: &mut *staging,
                written: 0,
                sealed: false,
            };
            let encoded = chain.protocol_at(index).encode(&packet, &mut out, self);
            let (written, sealed) = (out.written, out.sealed);
            if let Err(err) = encoded {
                if !sealed {
                    match mark {
                        Some(len) => {
                            if let Some(lease) = staging.as_mut() {
                                lease.truncate(len);
                            }
                        }
                        None => drop(staging.take()),
                    }
                    return Err(err);
                }
                drop(staging);
                return Err(self.abort_partial_frame(err));
            }
            if flush {
                self.seal(&mut staging)?;
            }
            written
        };

        chain.after_encode(self, &packet, written);
        Ok(())
    }

    /// 数据单元的前半部分已经进入刷写队列而编码失败：帧边界无法恢复，只能立即关闭。
    fn abort_partial_frame(&self, err: CoreError) -> CoreError {
        if err.is_closed() {
            return err;
        }
        tracing::warn!(
            connection = self.serial(),
            code = err.code(),
            "encode failed after part of the unit was queued: {err}"
        );
        self.notify(StateEvent::OutputException, Some(&err));
        self.close(true);
        err
    }

    /// 把暂存租约封装为分片送入刷写队列。调用方必须持有输出锁。
    pub(crate) fn seal(&self, staging: &mut Option<Lease>) -> Result<(), CoreError> {
        let Some(lease) = staging.take() else {
            return Ok(());
        };
        if lease.is_empty() {
            return Ok(());
        }
        self.inner
            .flush_queue
            .offer(OutboundChunk { lease })
            .map_err(|rejected| {
                drop(rejected.into_inner());
                CoreError::closed(self.serial())
            })
    }

    /// 若没有在途写，取出下一个分片交给传输层；队列为空时检查优雅关闭能否收尾。
    pub(crate) fn pump(&self) {
        let inner = &self.inner;
        loop {
            if inner
                .writing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            match inner.flush_queue.poll() {
                Some(chunk) => {
                    let size = chunk.len();
                    inner.chain.before_write(self, size);
                    tracing::trace!(connection = self.serial(), size, "chunk handed to transport");
                    inner.sink.write(chunk);
                    return;
                }
                None => {
                    inner.writing.store(false, Ordering::Release);
                    if inner.flush_queue.is_empty() {
                        self.finish_draining();
                        return;
                    }
                }
            }
        }
    }

    /// 传输层回报一个分片写完成：运行写后插件，归还租约，交出下一个分片。
    pub fn write_completed(&self, chunk: OutboundChunk) {
        let size = chunk.len();
        drop(chunk);
        if self.inner.status.load(Ordering::Acquire) == super::CLOSED {
            return;
        }
        self.inner.chain.after_write(self, size);
        self.inner.writing.store(false, Ordering::Release);
        self.pump();
    }

    /// 传输层回报写失败：广播 `OutputException` 并立即关闭。
    pub fn write_failed(&self, chunk: OutboundChunk, error: CoreError) {
        drop(chunk);
        tracing::warn!(
            connection = self.serial(),
            code = error.code(),
            "write failed: {error}"
        );
        self.notify(StateEvent::OutputException, Some(&error));
        self.close(true);
    }
}
