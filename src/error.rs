use thiserror::Error;

use crate::store::ImageId;

/// 检索引擎的错误类型
#[derive(Debug, Error)]
pub enum Error {
    /// 索引构建的输入无效，例如没有任何描述符或树的数量为 0
    #[error("failed to build index: {0}")]
    Build(String),

    /// 构建索引时预计内存占用超过了硬上限，本次构建被放弃
    #[error("memory budget exceeded: projected {projected} bytes, available {available} bytes")]
    MemoryBudgetExceeded { projected: u64, available: u64 },

    /// 配置校验失败，当前生效的配置不受影响
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// 单个候选图片的数据损坏，只跳过该图片
    #[error("corrupt record {id}: {reason}")]
    CorruptRecord { id: ImageId, reason: String },

    /// 描述符矩阵的形状不正确
    #[error("invalid descriptors: {0}")]
    InvalidDescriptors(String),

    /// 搜索被调用方中止
    #[error("search aborted")]
    Aborted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
