//! 检查点 / 恢复 / 关闭的结果类型
//!
//! 降级情况一律通过返回值表达，不向调用方抛错。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::time_util;

pub const REASON_WORKER_NOT_RUNNING: &str = "worker_not_running";
pub const REASON_STORE_UNAVAILABLE: &str = "store_unavailable";
pub const REASON_APPEND_LOG_FAILED: &str = "append_log_failed";

/// 单轮检查点的结果
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointOutcome {
    /// 关系库与追加日志均写入成功
    Success { run_id: String, ts: DateTime<Utc> },
    /// 关系库或追加日志至少有一边失败
    Partial {
        run_id: String,
        ts: DateTime<Utc>,
        /// 关系库写入是否全部成功
        persisted: bool,
        reason: String,
    },
    /// 没有可用的运行时，什么也没写
    Unavailable { reason: String },
}

impl CheckpointOutcome {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        CheckpointOutcome::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CheckpointOutcome::Success { .. })
    }

    /// 本轮关系库写入是否成功，与追加日志无关
    pub fn persisted(&self) -> bool {
        match self {
            CheckpointOutcome::Success { .. } => true,
            CheckpointOutcome::Partial { persisted, .. } => *persisted,
            CheckpointOutcome::Unavailable { .. } => false,
        }
    }

    pub fn run_id(&self) -> Option<&str> {
        match self {
            CheckpointOutcome::Success { run_id, .. } | CheckpointOutcome::Partial { run_id, .. } => {
                Some(run_id)
            }
            CheckpointOutcome::Unavailable { .. } => None,
        }
    }

    pub fn status(&self) -> CheckpointStatus {
        CheckpointStatus::from(self)
    }
}

/// 对外（运维接口）展示的检查点状态
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointStatus {
    pub ok: bool,
    pub persisted: bool,
    pub run_id: Option<String>,
    pub timestamp: Option<String>,
    pub reason: Option<String>,
}

impl From<&CheckpointOutcome> for CheckpointStatus {
    fn from(outcome: &CheckpointOutcome) -> Self {
        match outcome {
            CheckpointOutcome::Success { run_id, ts } => CheckpointStatus {
                ok: true,
                persisted: true,
                run_id: Some(run_id.clone()),
                timestamp: Some(time_util::to_iso(*ts)),
                reason: None,
            },
            CheckpointOutcome::Partial {
                run_id,
                ts,
                persisted,
                reason,
            } => CheckpointStatus {
                ok: true,
                persisted: *persisted,
                run_id: Some(run_id.clone()),
                timestamp: Some(time_util::to_iso(*ts)),
                reason: Some(reason.clone()),
            },
            CheckpointOutcome::Unavailable { reason } => CheckpointStatus {
                ok: false,
                persisted: false,
                run_id: None,
                timestamp: None,
                reason: Some(reason.clone()),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecoverySource {
    Store,
    AppendLog,
}

impl fmt::Display for RecoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoverySource::Store => write!(f, "store"),
            RecoverySource::AppendLog => write!(f, "append_log"),
        }
    }
}

/// 实际导入成功的部分
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoredParts {
    pub positions: usize,
    pub equity_points: usize,
    pub allocator: bool,
    pub learner: bool,
    /// 学习器模型字节是否一并恢复
    pub learner_model: bool,
    pub queue: bool,
}

impl RestoredParts {
    pub fn is_empty(&self) -> bool {
        self.positions == 0
            && self.equity_points == 0
            && !self.allocator
            && !self.learner
            && !self.queue
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    Restored {
        source: RecoverySource,
        run_id: String,
        restored: RestoredParts,
    },
    /// 库和日志里都没有可恢复的数据
    ColdStart,
    /// 组件尚未注册，已转入后台等待
    Deferred,
    /// 关闭了启动恢复
    Disabled,
}

impl RecoveryOutcome {
    pub fn is_restored(&self) -> bool {
        matches!(self, RecoveryOutcome::Restored { .. })
    }
}

/// 关闭流程每一步的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShutdownReport {
    /// 本次调用是否真正执行了关闭（重复调用为 false）
    pub performed: bool,
    pub final_checkpoint: Option<CheckpointStatus>,
    pub run_closed: bool,
    pub log_flushed: bool,
    pub timed_out: bool,
}
