use aio_buffer::PoolConfig;
use serde::Deserialize;

use crate::error::{CoreError, codes};

/// 连接内核的运行参数。
///
/// # 设计背景（Why）
/// - 读缓冲尺寸、输出分片阈值、队列容量等旋钮在服务端与客户端之间共享，集中在一个
///   可反序列化的结构里，便于从 TOML 文件加载并在启动前一次性校验；
/// - 所有字段都有默认值，调用方只需覆盖关心的项。
///
/// # 契约说明（What）
/// - `read_buffer_size`：每次读完成租借的字节数；
/// - `write_chunk_size`：输出暂存租约容量，暂存字节达到该值即封装为待刷写分片；
/// - `write_queue_capacity`：待刷写分片队列容量，队列满时 `send` 阻塞（输出背压点）；
/// - `max_wait_num`：解码/处理执行器的队列容量；
/// - `max_batch`：执行单元连续处理的条目上限，超过后让出线程；
/// - `max_pending_read_bytes`：单连接未解码字节上限，超过视为解码失败；
/// - `pool`：内存池配置。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    pub read_buffer_size: usize,
    pub write_chunk_size: usize,
    pub write_queue_capacity: usize,
    pub max_wait_num: usize,
    pub max_batch: usize,
    pub max_pending_read_bytes: usize,
    pub pool: PoolConfig,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 2048,
            write_chunk_size: 4096,
            write_queue_capacity: 16,
            max_wait_num: 1024,
            max_batch: 64,
            max_pending_read_bytes: 64 * 1024,
            pool: PoolConfig::default(),
        }
    }
}

impl KernelConfig {
    /// 从 TOML 文本加载并校验配置。
    pub fn from_toml_str(text: &str) -> Result<Self, CoreError> {
        let config: Self = toml::from_str(text).map_err(|err| {
            CoreError::new(codes::CONFIG_INVALID, "failed to parse kernel config").with_cause(err)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// 校验各尺寸非零，且所有需要整块租借的尺寸都不超过页容量。
    pub fn validate(&self) -> Result<(), CoreError> {
        self.pool.validate()?;
        let checks: [(&str, usize); 5] = [
            ("read_buffer_size", self.read_buffer_size),
            ("write_chunk_size", self.write_chunk_size),
            ("write_queue_capacity", self.write_queue_capacity),
            ("max_wait_num", self.max_wait_num),
            ("max_batch", self.max_batch),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(invalid(format!("{name} must be positive")));
            }
        }
        let page_size = self.pool.page_size;
        let leased: [(&str, usize); 3] = [
            ("read_buffer_size", self.read_buffer_size),
            ("write_chunk_size", self.write_chunk_size),
            ("max_pending_read_bytes", self.max_pending_read_bytes),
        ];
        for (name, value) in leased {
            if value > page_size {
                return Err(invalid(format!(
                    "{name} ({value}) exceeds pool page_size ({page_size})"
                )));
            }
        }
        if self.max_pending_read_bytes < self.read_buffer_size {
            return Err(invalid(
                "max_pending_read_bytes must be at least read_buffer_size".to_owned(),
            ));
        }
        Ok(())
    }
}

fn invalid(message: String) -> CoreError {
    CoreError::new(codes::CONFIG_INVALID, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = KernelConfig::from_toml_str(
            r#"
            write_chunk_size = 1024

            [pool]
            page_size = 65536
            max_pages = 4
            "#,
        )
        .expect("合法配置应能解析");
        assert_eq!(config.write_chunk_size, 1024);
        assert_eq!(config.read_buffer_size, 2048);
        assert_eq!(config.pool.page_size, 65536);
        assert_eq!(config.pool.initial_pages, 1);
    }

    #[test]
    fn rejects_sizes_larger_than_a_page() {
        let err = KernelConfig::from_toml_str(
            r#"
            max_pending_read_bytes = 131072
            [pool]
            page_size = 65536
            "#,
        )
        .expect_err("超过页容量必须失败");
        assert_eq!(err.code(), codes::CONFIG_INVALID);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = KernelConfig::from_toml_str("read_bufer_size = 1").expect_err("拼写错误必须暴露");
        assert_eq!(err.code(), codes::CONFIG_INVALID);
    }
}
