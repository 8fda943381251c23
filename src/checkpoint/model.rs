//! 检查点数据模型
//!
//! 运行时组件只负责导出/导入这些快照，真正的持久化记录由仓储和追加日志写入。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 一次模拟运行（session）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    /// 毫秒时间戳
    pub started_at: i64,
    /// 为空表示运行中
    pub ended_at: Option<i64>,
    pub meta: Value,
}

impl RunRecord {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// 成交记录，`trade_id` 由外部提供，插入幂等
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub trade_id: String,
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub price: f64,
    /// 毫秒时间戳
    pub ts: i64,
    #[serde(default)]
    pub fees: f64,
    #[serde(default)]
    pub slippage_bps: f64,
    #[serde(default)]
    pub raw: Value,
}

/// 某个品种的当前持仓快照（整行覆盖，不做成本合并）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    pub symbol: String,
    pub qty: f64,
    pub avg_price: f64,
    /// 毫秒时间戳
    #[serde(default)]
    pub ts: i64,
}

/// 权益曲线上的一个点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub idx: i64,
    pub ts: i64,
    pub equity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocatorSnapshot {
    pub run_id: String,
    pub ts: i64,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnerCheckpoint {
    pub run_id: String,
    pub ts: i64,
    pub algo: String,
    pub model: Vec<u8>,
    pub meta: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub run_id: String,
    pub ts: i64,
    pub payload: Value,
}

/// 模拟引擎导出的状态：持仓 + 权益曲线 + 最近成交
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    #[serde(default)]
    pub positions: Vec<PositionState>,
    #[serde(default)]
    pub equity_curve: Vec<EquityPoint>,
    #[serde(default)]
    pub trades: Vec<TradeRecord>,
}

impl EngineState {
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty() && self.equity_curve.is_empty() && self.trades.is_empty()
    }
}

/// 在线学习器状态
///
/// `model` 为 `None` 表示模型字节不可恢复（追加日志只记录元数据）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnerState {
    pub algo: String,
    pub model: Option<Vec<u8>>,
    #[serde(default)]
    pub meta: Value,
}

/// 资金分配器状态，结构由分配器自己决定
pub type AllocatorState = Value;

/// 内部工作队列状态
pub type QueueState = Value;

/// 审计事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditKind {
    Pnl,
    Position,
    Allocator,
    Learner,
    Queue,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::Pnl => "pnl",
            AuditKind::Position => "position",
            AuditKind::Allocator => "allocator",
            AuditKind::Learner => "learner",
            AuditKind::Queue => "queue",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pnl" => Some(AuditKind::Pnl),
            "position" => Some(AuditKind::Position),
            "allocator" => Some(AuditKind::Allocator),
            "learner" => Some(AuditKind::Learner),
            "queue" => Some(AuditKind::Queue),
            _ => None,
        }
    }
}

/// 追加日志中的一行：`{ts, type, run_id, payload}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// ISO-8601 UTC
    #[serde(default)]
    pub ts: String,
    #[serde(rename = "type")]
    pub kind: AuditKind,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub payload: Value,
}

impl AuditEvent {
    /// 时间戳留空，由追加日志写入时补齐
    pub fn new(kind: AuditKind, run_id: &str, payload: Value) -> Self {
        Self {
            ts: String::new(),
            kind,
            run_id: run_id.to_string(),
            payload,
        }
    }
}

/// 学习器审计元数据，刻意不包含模型字节
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnerMeta {
    pub algo: String,
    #[serde(default)]
    pub meta: Value,
    #[serde(default)]
    pub model_size: usize,
}

impl From<&LearnerState> for LearnerMeta {
    fn from(state: &LearnerState) -> Self {
        Self {
            algo: state.algo.clone(),
            meta: state.meta.clone(),
            model_size: state.model.as_ref().map(|m| m.len()).unwrap_or(0),
        }
    }
}
