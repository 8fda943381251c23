//! 错误处理模块

pub use anyhow::{anyhow, Result};
use thiserror::Error;

/// 检查点子系统错误
///
/// 只在本模块内部传播；对外暴露的检查点/恢复接口一律转换为状态值，不向调用方抛出。
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("非法记录: {0}")]
    InvalidRecord(String),
}

pub type CheckpointResult<T> = std::result::Result<T, CheckpointError>;
