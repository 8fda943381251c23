//! 检查点仓储接口
//!
//! 所有写操作都必须能被重复调用而不破坏数据：
//! 成交按 trade_id 幂等，持仓按 (run_id, symbol) 覆盖，其余快照只追加。

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::checkpoint::model::{
    AllocatorSnapshot, EquityPoint, LearnerCheckpoint, PositionState, QueueSnapshot, RunRecord,
    TradeRecord,
};

#[async_trait]
pub trait CheckpointRepository: Send + Sync {
    /// 连通性探测
    async fn ping(&self) -> Result<()>;

    /// 建表（幂等）
    async fn ensure_schema(&self) -> Result<()>;

    /// 存在未结束的运行则返回其 id，否则新建
    async fn open_or_resume_run(&self, meta: &Value) -> Result<String>;

    /// 设置结束时间，已结束的运行不再修改
    async fn close_run(&self, run_id: &str) -> Result<()>;

    /// 插入成交；trade_id 重复时返回 Ok(false)
    async fn append_trade(&self, run_id: &str, trade: &TradeRecord) -> Result<bool>;

    async fn upsert_position(
        &self,
        run_id: &str,
        symbol: &str,
        qty: f64,
        avg_price: f64,
        ts: DateTime<Utc>,
    ) -> Result<()>;

    /// 无条件追加，返回写入条数
    async fn append_pnl_points(&self, run_id: &str, points: &[EquityPoint]) -> Result<u64>;

    async fn save_allocator_snapshot(&self, run_id: &str, payload: &Value) -> Result<()>;

    async fn save_learner_checkpoint(
        &self,
        run_id: &str,
        algo: &str,
        model: &[u8],
        meta: &Value,
    ) -> Result<()>;

    async fn save_queue_snapshot(&self, run_id: &str, payload: &Value) -> Result<()>;

    /// 最近开始的一次运行（无论是否已结束）
    async fn load_latest_run(&self) -> Result<Option<RunRecord>>;

    async fn load_positions(&self, run_id: &str) -> Result<Vec<PositionState>>;

    /// 最近的 `limit` 个点，按 idx 升序返回
    async fn load_pnl_points(&self, run_id: &str, limit: usize) -> Result<Vec<EquityPoint>>;

    async fn load_allocator_latest(&self, run_id: &str) -> Result<Option<AllocatorSnapshot>>;

    async fn load_learner_latest(&self, run_id: &str) -> Result<Option<LearnerCheckpoint>>;

    async fn load_queue_latest(&self, run_id: &str) -> Result<Option<QueueSnapshot>>;
}

/// 当前使用的是哪个库
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Primary,
    Fallback,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Primary => write!(f, "primary"),
            StoreKind::Fallback => write!(f, "fallback"),
        }
    }
}

#[derive(Clone)]
struct StoreEntry {
    repo: Arc<dyn CheckpointRepository>,
    kind: StoreKind,
}

/// 可替换的仓储句柄：恢复流程连上主库或兜底库后写入，检查点每轮读取
#[derive(Clone, Default)]
pub struct StoreSlot {
    inner: Arc<RwLock<Option<StoreEntry>>>,
}

impl StoreSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_repository(repo: Arc<dyn CheckpointRepository>, kind: StoreKind) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Some(StoreEntry { repo, kind }))),
        }
    }

    pub async fn set(&self, repo: Arc<dyn CheckpointRepository>, kind: StoreKind) {
        *self.inner.write().await = Some(StoreEntry { repo, kind });
    }

    pub async fn get(&self) -> Option<Arc<dyn CheckpointRepository>> {
        self.inner.read().await.as_ref().map(|e| e.repo.clone())
    }

    pub async fn kind(&self) -> Option<StoreKind> {
        self.inner.read().await.as_ref().map(|e| e.kind)
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.read().await.is_some()
    }
}
