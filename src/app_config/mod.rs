//! 配置管理模块

pub mod checkpoint;
pub mod db;
pub mod env;
pub mod log;

pub use checkpoint::CheckpointConfig;
pub use env::*;
