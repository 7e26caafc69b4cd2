//! 文档处理上下文
//!
//! 封装"我正在处理第几篇文档"这一信息，只用于日志前缀

use std::fmt::Display;

/// 文档处理上下文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentCtx {
    /// 文档ID
    pub document_id: String,

    /// 本次运行中的序号（从1开始，仅用于日志显示）
    pub index: usize,
}

impl DocumentCtx {
    pub fn new(document_id: impl Into<String>, index: usize) -> Self {
        Self {
            document_id: document_id.into(),
            index,
        }
    }

    /// 单篇文本模式
    pub fn single() -> Self {
        Self::new("single", 1)
    }
}

impl Display for DocumentCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[文档 {}]", self.index)
    }
}
