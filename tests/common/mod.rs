//! 集成测试共用的假组件与内存仓储
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use rust_quant_checkpoint::app_config::CheckpointConfig;
use rust_quant_checkpoint::checkpoint::model::{
    AllocatorSnapshot, EngineState, EquityPoint, LearnerCheckpoint, LearnerState, PositionState,
    QueueSnapshot, RunRecord, TradeRecord,
};
use rust_quant_checkpoint::checkpoint::{
    AppendLog, CheckpointContext, CheckpointRepository, Checkpointable, RuntimeComponents,
    RuntimeRegistry, StoreKind, StoreSlot,
};
use rust_quant_checkpoint::time_util;

/// 可读写的假组件，导入后的状态可以直接检查
pub struct FakeComponent<S> {
    state: Mutex<Option<S>>,
    pub imports: AtomicUsize,
}

impl<S: Clone> FakeComponent<S> {
    pub fn new(state: Option<S>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            imports: AtomicUsize::new(0),
        })
    }

    pub fn state(&self) -> Option<S> {
        self.state.lock().unwrap().clone()
    }

    pub fn import_count(&self) -> usize {
        self.imports.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<S: Clone + Send + Sync + 'static> Checkpointable for FakeComponent<S> {
    type State = S;

    async fn export_state(&self) -> Result<S> {
        self.state
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("组件尚无状态"))
    }

    async fn import_state(&self, state: S) -> Result<()> {
        *self.state.lock().unwrap() = Some(state);
        self.imports.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeRuntime {
    pub engine: Arc<FakeComponent<EngineState>>,
    pub allocator: Arc<FakeComponent<Value>>,
    pub learner: Arc<FakeComponent<LearnerState>>,
    pub queue: Arc<FakeComponent<Value>>,
}

impl FakeRuntime {
    pub fn empty() -> Self {
        Self {
            engine: FakeComponent::new(None),
            allocator: FakeComponent::new(None),
            learner: FakeComponent::new(None),
            queue: FakeComponent::new(None),
        }
    }

    pub fn populated() -> Self {
        Self {
            engine: FakeComponent::new(Some(sample_engine())),
            allocator: FakeComponent::new(Some(json!({"weights": {"BTC-USDT": 0.6, "ETH-USDT": 0.4}}))),
            learner: FakeComponent::new(Some(LearnerState {
                algo: "sgd".to_string(),
                model: Some(vec![7, 7, 7, 7]),
                meta: json!({"epoch": 12}),
            })),
            queue: FakeComponent::new(Some(json!({"pending": ["rebalance"]}))),
        }
    }

    pub fn components(&self) -> RuntimeComponents {
        RuntimeComponents::new(json!({"universe": ["BTC-USDT", "ETH-USDT"]}))
            .with_engine(self.engine.clone())
            .with_allocator(self.allocator.clone())
            .with_learner(self.learner.clone())
            .with_queue(self.queue.clone())
    }
}

pub fn position(symbol: &str, qty: f64, avg_price: f64) -> PositionState {
    PositionState {
        symbol: symbol.to_string(),
        qty,
        avg_price,
        ts: time_util::now_millis(),
    }
}

pub fn equity_curve(len: i64) -> Vec<EquityPoint> {
    (0..len)
        .map(|idx| EquityPoint {
            idx,
            ts: 1_700_000_000_000 + idx * 60_000,
            equity: 10_000.0 + idx as f64,
        })
        .collect()
}

pub fn trade(trade_id: &str, symbol: &str) -> TradeRecord {
    TradeRecord {
        trade_id: trade_id.to_string(),
        symbol: symbol.to_string(),
        side: "buy".to_string(),
        qty: 1.0,
        price: 100.0,
        ts: time_util::now_millis(),
        fees: 0.1,
        slippage_bps: 2.0,
        raw: json!({"venue": "sim"}),
    }
}

pub fn sample_engine() -> EngineState {
    EngineState {
        positions: vec![position("BTC-USDT", 0.5, 42_000.0), position("ETH-USDT", 3.0, 2_500.0)],
        equity_curve: equity_curve(3),
        trades: vec![trade("t-1", "BTC-USDT"), trade("t-2", "ETH-USDT")],
    }
}

pub async fn context_in(
    dir: &std::path::Path,
    registry: RuntimeRegistry,
    store: StoreSlot,
) -> CheckpointContext {
    let log = AppendLog::open(dir.join("audit.jsonl"), 50).await.unwrap();
    CheckpointContext::new(registry, store, Arc::new(log))
}

pub fn test_config(dir: &std::path::Path) -> CheckpointConfig {
    CheckpointConfig {
        checkpoint_dir: dir.to_path_buf(),
        append_log_path: dir.join("audit.jsonl"),
        fallback_db_path: dir.join("fallback.db"),
        recovery_wait_interval: std::time::Duration::from_millis(20),
        recovery_wait_attempts: 50,
        ..Default::default()
    }
}

#[derive(Default)]
struct MemoryTables {
    runs: Vec<RunRecord>,
    trades: HashMap<String, (String, TradeRecord)>,
    positions: HashMap<(String, String), PositionState>,
    pnl_points: Vec<(String, EquityPoint)>,
    allocator: Vec<AllocatorSnapshot>,
    learner: Vec<LearnerCheckpoint>,
    queue: Vec<QueueSnapshot>,
}

/// 内存仓储，语义与关系库实现一致
#[derive(Default)]
pub struct InMemoryRepository {
    tables: Mutex<MemoryTables>,
    seq: AtomicUsize,
}

impl InMemoryRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn next_ts(&self) -> i64 {
        // 保证同一毫秒内的多次写入仍有先后
        time_util::now_millis() * 1000 + self.seq.fetch_add(1, Ordering::SeqCst) as i64
    }

    pub fn run_count(&self) -> usize {
        self.tables.lock().unwrap().runs.len()
    }

    pub fn open_runs(&self) -> usize {
        self.tables.lock().unwrap().runs.iter().filter(|r| r.is_open()).count()
    }

    pub fn trade_count(&self) -> usize {
        self.tables.lock().unwrap().trades.len()
    }

    pub fn pnl_count(&self) -> usize {
        self.tables.lock().unwrap().pnl_points.len()
    }

    pub fn snapshot_counts(&self) -> (usize, usize, usize) {
        let t = self.tables.lock().unwrap();
        (t.allocator.len(), t.learner.len(), t.queue.len())
    }

    pub fn is_empty(&self) -> bool {
        let t = self.tables.lock().unwrap();
        t.runs.is_empty()
            && t.trades.is_empty()
            && t.positions.is_empty()
            && t.pnl_points.is_empty()
            && t.allocator.is_empty()
            && t.learner.is_empty()
            && t.queue.is_empty()
    }
}

#[async_trait]
impl CheckpointRepository for InMemoryRepository {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn open_or_resume_run(&self, meta: &Value) -> Result<String> {
        let started_at = self.next_ts();
        let mut t = self.tables.lock().unwrap();
        if let Some(open) = t.runs.iter().filter(|r| r.is_open()).max_by_key(|r| r.started_at) {
            return Ok(open.id.clone());
        }
        let id = uuid::Uuid::new_v4().to_string();
        t.runs.push(RunRecord {
            id: id.clone(),
            started_at,
            ended_at: None,
            meta: meta.clone(),
        });
        Ok(id)
    }

    async fn close_run(&self, run_id: &str) -> Result<()> {
        let now = time_util::now_millis();
        let mut t = self.tables.lock().unwrap();
        if let Some(run) = t.runs.iter_mut().find(|r| r.id == run_id && r.is_open()) {
            run.ended_at = Some(now);
        }
        Ok(())
    }

    async fn append_trade(&self, run_id: &str, trade: &TradeRecord) -> Result<bool> {
        let mut t = self.tables.lock().unwrap();
        if t.trades.contains_key(&trade.trade_id) {
            return Ok(false);
        }
        t.trades
            .insert(trade.trade_id.clone(), (run_id.to_string(), trade.clone()));
        Ok(true)
    }

    async fn upsert_position(
        &self,
        run_id: &str,
        symbol: &str,
        qty: f64,
        avg_price: f64,
        ts: DateTime<Utc>,
    ) -> Result<()> {
        self.tables.lock().unwrap().positions.insert(
            (run_id.to_string(), symbol.to_string()),
            PositionState {
                symbol: symbol.to_string(),
                qty,
                avg_price,
                ts: ts.timestamp_millis(),
            },
        );
        Ok(())
    }

    async fn append_pnl_points(&self, run_id: &str, points: &[EquityPoint]) -> Result<u64> {
        let mut t = self.tables.lock().unwrap();
        for point in points {
            t.pnl_points.push((run_id.to_string(), point.clone()));
        }
        Ok(points.len() as u64)
    }

    async fn save_allocator_snapshot(&self, run_id: &str, payload: &Value) -> Result<()> {
        let ts = self.next_ts();
        self.tables.lock().unwrap().allocator.push(AllocatorSnapshot {
            run_id: run_id.to_string(),
            ts,
            payload: payload.clone(),
        });
        Ok(())
    }

    async fn save_learner_checkpoint(
        &self,
        run_id: &str,
        algo: &str,
        model: &[u8],
        meta: &Value,
    ) -> Result<()> {
        let ts = self.next_ts();
        self.tables.lock().unwrap().learner.push(LearnerCheckpoint {
            run_id: run_id.to_string(),
            ts,
            algo: algo.to_string(),
            model: model.to_vec(),
            meta: meta.clone(),
        });
        Ok(())
    }

    async fn save_queue_snapshot(&self, run_id: &str, payload: &Value) -> Result<()> {
        let ts = self.next_ts();
        self.tables.lock().unwrap().queue.push(QueueSnapshot {
            run_id: run_id.to_string(),
            ts,
            payload: payload.clone(),
        });
        Ok(())
    }

    async fn load_latest_run(&self) -> Result<Option<RunRecord>> {
        let t = self.tables.lock().unwrap();
        Ok(t.runs.iter().max_by_key(|r| r.started_at).cloned())
    }

    async fn load_positions(&self, run_id: &str) -> Result<Vec<PositionState>> {
        let t = self.tables.lock().unwrap();
        Ok(t.positions
            .iter()
            .filter(|((run, _), _)| run == run_id)
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn load_pnl_points(&self, run_id: &str, limit: usize) -> Result<Vec<EquityPoint>> {
        let t = self.tables.lock().unwrap();
        let mut points: Vec<EquityPoint> = t
            .pnl_points
            .iter()
            .filter(|(run, _)| run == run_id)
            .map(|(_, p)| p.clone())
            .collect();
        points.sort_by_key(|p| p.idx);
        let skip = points.len().saturating_sub(limit);
        Ok(points.split_off(skip))
    }

    async fn load_allocator_latest(&self, run_id: &str) -> Result<Option<AllocatorSnapshot>> {
        let t = self.tables.lock().unwrap();
        Ok(t.allocator.iter().filter(|s| s.run_id == run_id).max_by_key(|s| s.ts).cloned())
    }

    async fn load_learner_latest(&self, run_id: &str) -> Result<Option<LearnerCheckpoint>> {
        let t = self.tables.lock().unwrap();
        Ok(t.learner.iter().filter(|s| s.run_id == run_id).max_by_key(|s| s.ts).cloned())
    }

    async fn load_queue_latest(&self, run_id: &str) -> Result<Option<QueueSnapshot>> {
        let t = self.tables.lock().unwrap();
        Ok(t.queue.iter().filter(|s| s.run_id == run_id).max_by_key(|s| s.ts).cloned())
    }
}

/// 每个操作都失败的仓储，模拟关系库宕机
#[derive(Default)]
pub struct FailingRepository {
    pub calls: AtomicUsize,
}

impl FailingRepository {
    fn fail<T>(&self) -> Result<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("Can't connect to MySQL server"))
    }
}

#[async_trait]
impl CheckpointRepository for FailingRepository {
    async fn ping(&self) -> Result<()> {
        self.fail()
    }
    async fn ensure_schema(&self) -> Result<()> {
        self.fail()
    }
    async fn open_or_resume_run(&self, _meta: &Value) -> Result<String> {
        self.fail()
    }
    async fn close_run(&self, _run_id: &str) -> Result<()> {
        self.fail()
    }
    async fn append_trade(&self, _run_id: &str, _trade: &TradeRecord) -> Result<bool> {
        self.fail()
    }
    async fn upsert_position(
        &self,
        _run_id: &str,
        _symbol: &str,
        _qty: f64,
        _avg_price: f64,
        _ts: DateTime<Utc>,
    ) -> Result<()> {
        self.fail()
    }
    async fn append_pnl_points(&self, _run_id: &str, _points: &[EquityPoint]) -> Result<u64> {
        self.fail()
    }
    async fn save_allocator_snapshot(&self, _run_id: &str, _payload: &Value) -> Result<()> {
        self.fail()
    }
    async fn save_learner_checkpoint(
        &self,
        _run_id: &str,
        _algo: &str,
        _model: &[u8],
        _meta: &Value,
    ) -> Result<()> {
        self.fail()
    }
    async fn save_queue_snapshot(&self, _run_id: &str, _payload: &Value) -> Result<()> {
        self.fail()
    }
    async fn load_latest_run(&self) -> Result<Option<RunRecord>> {
        self.fail()
    }
    async fn load_positions(&self, _run_id: &str) -> Result<Vec<PositionState>> {
        self.fail()
    }
    async fn load_pnl_points(&self, _run_id: &str, _limit: usize) -> Result<Vec<EquityPoint>> {
        self.fail()
    }
    async fn load_allocator_latest(&self, _run_id: &str) -> Result<Option<AllocatorSnapshot>> {
        self.fail()
    }
    async fn load_learner_latest(&self, _run_id: &str) -> Result<Option<LearnerCheckpoint>> {
        self.fail()
    }
    async fn load_queue_latest(&self, _run_id: &str) -> Result<Option<QueueSnapshot>> {
        self.fail()
    }
}

pub fn store_with(repo: Arc<dyn CheckpointRepository>) -> StoreSlot {
    StoreSlot::with_repository(repo, StoreKind::Primary)
}
