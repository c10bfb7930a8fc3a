use aio_core::{AcceptContext, CoreError, Plugin, SocketOptions};
use socket2::SockRef;
use tokio::net::TcpStream;

use crate::error::{CONFIGURE, map_io_error};

/// 把预设的套接字选项写入每个入站连接的 [`AcceptContext`]。
///
/// # 设计动机（Why）
/// - 连接上下文创建之前只有接入过滤钩子能接触套接字，选项必须在那一刻落地；
/// - 小包请求/响应是连接内核的主要场景，未显式配置时默认开启 `TCP_NODELAY`。
///
/// # 契约说明（What）
/// - 只填写 `AcceptContext` 中仍为 `None` 的字段，排在它之前的插件写入的值保持不变；
/// - 从不拒绝连接。
#[derive(Debug, Clone, Default)]
pub struct SocketOptionPlugin {
    options: SocketOptions,
}

impl SocketOptionPlugin {
    pub fn new(options: SocketOptions) -> Self {
        Self { options }
    }

    /// 实际生效的选项：`nodelay` 未配置时为 `true`。
    pub fn effective(&self) -> SocketOptions {
        SocketOptions {
            nodelay: Some(self.options.nodelay.unwrap_or(true)),
            ..self.options.clone()
        }
    }
}

impl Plugin for SocketOptionPlugin {
    fn should_accept(&self, accept: &mut AcceptContext) -> bool {
        let preset = self.effective();
        let options = &mut accept.options;
        options.nodelay = options.nodelay.or(preset.nodelay);
        options.keepalive = options.keepalive.or(preset.keepalive);
        options.send_buffer_size = options.send_buffer_size.or(preset.send_buffer_size);
        options.recv_buffer_size = options.recv_buffer_size.or(preset.recv_buffer_size);
        options.linger = options.linger.or(preset.linger);
        true
    }
}

/// 把选项应用到套接字；`None` 字段保持系统默认。
pub(crate) fn apply(stream: &TcpStream, options: &SocketOptions) -> Result<(), CoreError> {
    if let Some(nodelay) = options.nodelay {
        stream
            .set_nodelay(nodelay)
            .map_err(|err| map_io_error(CONFIGURE, err))?;
    }
    let sock = SockRef::from(stream);
    if let Some(keepalive) = options.keepalive {
        sock.set_keepalive(keepalive)
            .map_err(|err| map_io_error(CONFIGURE, err))?;
    }
    if let Some(size) = options.send_buffer_size {
        sock.set_send_buffer_size(size)
            .map_err(|err| map_io_error(CONFIGURE, err))?;
    }
    if let Some(size) = options.recv_buffer_size {
        sock.set_recv_buffer_size(size)
            .map_err(|err| map_io_error(CONFIGURE, err))?;
    }
    if options.linger.is_some() {
        sock.set_linger(options.linger)
            .map_err(|err| map_io_error(CONFIGURE, err))?;
    }
    Ok(())
}
