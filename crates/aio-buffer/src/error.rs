use thiserror::Error;

/// 内存池对外暴露的错误域。
///
/// - **意图 (Why)**：资源耗尽必须作为显式失败交还给调用方，而不是静默截断或退化为堆分配；
/// - **契约 (What)**：所有变体都携带排障所需的尺寸信息，`Send + Sync + 'static`，可跨线程传播。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BufferError {
    /// 所有页都没有足够的连续空闲区间，且页数已达到上限。
    #[error("buffer pool exhausted: requested {requested} bytes with {pages}/{max_pages} pages in use")]
    Exhausted {
        requested: usize,
        pages: usize,
        max_pages: usize,
    },

    /// 单次请求超过页容量，任何页都无法满足。
    #[error("requested {requested} bytes exceeds page size {page_size}")]
    RequestTooLarge { requested: usize, page_size: usize },

    /// 写入超出租约容量；租约不会自行扩容，以免脱离所属页。
    #[error("lease overflow: need {needed} bytes but only {remaining} remain")]
    Overflow { needed: usize, remaining: usize },

    /// 读游标越界。
    #[error("lease underflow: need {needed} bytes but only {remaining} are readable")]
    Underflow { needed: usize, remaining: usize },

    /// 池配置不合法。
    #[error("invalid pool config: {0}")]
    InvalidConfig(&'static str),
}
