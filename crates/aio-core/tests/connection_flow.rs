//! `connection_flow` 集成测试：从读完成到处理回调、再到写出的整条连接流水线。
//!
//! # 测试目标（Why）
//! - 两条连接并发灌入数据时，各自的处理顺序与输入顺序一致，总数不丢不重；
//! - 立即关闭后不会再出现处理回调，池内存全部归还；
//! - 回复按处理顺序写出，优雅关闭会先排空输出。

mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use aio_core::{ConnectionStatus, DispatchChain, Executor, KernelConfig};
use support::{U32Frames, connect, frames, pool, wait_until};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_time()
        .build()
        .expect("构建运行时失败")
}

#[test]
fn two_connections_keep_their_own_order() {
    const UNITS: u32 = 10_000;
    let rt = runtime();
    let executor: Arc<dyn Executor> = Arc::new(rt.handle().clone());
    let total = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&total);
    let chain = DispatchChain::builder()
        .protocol(U32Frames::new(move |ctx, value| {
            ctx.with_attachment(|seen: &mut Vec<u32>| seen.push(value));
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(None)
        }))
        .build()
        .expect("构建分发链失败");
    let pool = pool();

    let connections: Vec<_> = (0..2)
        .map(|_| {
            let (ctx, _rx) = connect(Arc::clone(&chain), &pool, Arc::clone(&executor));
            ctx.set_attachment(Vec::<u32>::with_capacity(UNITS as usize));
            ctx
        })
        .collect();

    let stream = frames(0..UNITS);
    std::thread::scope(|scope| {
        for ctx in &connections {
            let stream = &stream;
            scope.spawn(move || ctx.receive(stream).expect("读入失败"));
        }
    });

    assert!(
        wait_until(Duration::from_secs(20), || {
            total.load(Ordering::Relaxed) == 2 * UNITS as usize
        }),
        "只处理了 {} 个单元",
        total.load(Ordering::Relaxed)
    );
    for ctx in &connections {
        let seen = ctx.take_attachment::<Vec<u32>>().expect("附件丢失");
        assert_eq!(seen.len(), UNITS as usize);
        assert!(seen.iter().copied().eq(0..UNITS), "单连接内处理顺序被打乱");
        ctx.close(true);
    }
    assert!(wait_until(Duration::from_secs(2), || pool.used_bytes() == 0));
}

#[test]
fn immediate_close_discards_backlog() {
    let rt = runtime();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let chain = DispatchChain::builder()
        .protocol(U32Frames::new(move |_ctx, _value| {
            std::thread::sleep(Duration::from_millis(5));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }))
        .build()
        .expect("构建分发链失败");
    let pool = pool();
    let (ctx, _rx) = connect(chain, &pool, Arc::new(rt.handle().clone()));

    ctx.receive(&frames(0..50)).expect("读入失败");
    assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst) > 0));
    ctx.close(true);
    assert_eq!(ctx.status(), ConnectionStatus::Closed);

    let settled = calls.load(Ordering::SeqCst);
    assert!(settled < 50, "积压条目不应全部处理完");
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(calls.load(Ordering::SeqCst), settled, "关闭后仍有处理回调");
    assert!(wait_until(Duration::from_secs(2), || pool.used_bytes() == 0));
    assert!(ctx.receive(&frames([1])).expect_err("关闭后读入必须失败").is_closed());
}

#[test]
fn replies_are_written_in_processing_order() {
    const UNITS: u32 = 1_000;
    let rt = runtime();
    let chain = DispatchChain::builder()
        .protocol(U32Frames::new(|_ctx, value| Ok(Some(value * 2))))
        .build()
        .expect("构建分发链失败");
    let pool = pool();
    let (ctx, rx) = connect(chain, &pool, Arc::new(rt.handle().clone()));

    ctx.receive(&frames(0..UNITS)).expect("读入失败");
    let mut written = Vec::new();
    while written.len() < UNITS as usize * 4 {
        let chunk = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("回复未全部写出");
        assert!(chunk.len() <= ctx.config().write_chunk_size);
        written.extend_from_slice(&chunk);
    }
    let replies: Vec<u32> = written
        .chunks_exact(4)
        .map(|bytes| u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .collect();
    assert!(replies.iter().copied().eq((0..UNITS).map(|value| value * 2)));

    ctx.close(false);
    assert!(wait_until(Duration::from_secs(2), || {
        ctx.status() == ConnectionStatus::Closed
    }));
    assert!(wait_until(Duration::from_secs(2), || pool.used_bytes() == 0));
}

#[test]
fn toml_config_drives_connection_limits() {
    let config = KernelConfig::from_toml_str(
        r#"
        read_buffer_size = 128
        write_chunk_size = 256
        max_pending_read_bytes = 512

        [pool]
        page_size = 65536
        max_pages = 2
        "#,
    )
    .expect("配置解析失败");
    assert_eq!(config.read_buffer_size, 128);
    assert_eq!(config.write_queue_capacity, KernelConfig::default().write_queue_capacity);

    let rt = runtime();
    let chain = DispatchChain::builder()
        .protocol(U32Frames::new(|_ctx, _value| Ok(None)))
        .build()
        .expect("构建分发链失败");
    let pool = aio_core::aio_buffer::BufferPagePool::new(config.pool)
        .expect("构建内存池失败");
    let sink = Arc::new(NullSink);
    let ctx = aio_core::ConnectionBuilder::new(chain, pool, Arc::new(rt.handle().clone()), sink)
        .config(config)
        .protocol("u32")
        .build()
        .expect("构建连接失败");
    assert_eq!(ctx.protocol(), Some("u32"));
    assert_eq!(ctx.config().max_pending_read_bytes, 512);
    ctx.close(true);
}

struct NullSink;

impl aio_core::OutboundSink for NullSink {
    fn write(&self, _chunk: aio_core::OutboundChunk) {}
}
