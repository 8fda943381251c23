//! 基于 rbatis 的检查点仓储
//!
//! 同一套实现同时服务 MySQL 主库和 SQLite 兜底库，方言差异只体现在建表语句和 upsert 语法上。

use anyhow::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rbatis::RBatis;
use rbs::to_value;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::checkpoint::model::{
    AllocatorSnapshot, EquityPoint, LearnerCheckpoint, PositionState, QueueSnapshot, RunRecord,
    TradeRecord,
};
use crate::checkpoint::repository::CheckpointRepository;
use crate::time_util;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Mysql,
    Sqlite,
}

const MYSQL_SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS runs (
        id VARCHAR(64) NOT NULL PRIMARY KEY,
        started_at BIGINT NOT NULL,
        ended_at BIGINT NULL,
        meta TEXT NOT NULL,
        KEY idx_runs_started_at (started_at)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS trades (
        id VARCHAR(128) NOT NULL PRIMARY KEY,
        run_id VARCHAR(64) NOT NULL,
        symbol VARCHAR(64) NOT NULL,
        side VARCHAR(16) NOT NULL,
        qty DOUBLE NOT NULL,
        price DOUBLE NOT NULL,
        ts BIGINT NOT NULL,
        fees DOUBLE NOT NULL DEFAULT 0,
        slippage_bps DOUBLE NOT NULL DEFAULT 0,
        raw TEXT NULL,
        KEY idx_trades_run (run_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS positions (
        id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
        run_id VARCHAR(64) NOT NULL,
        symbol VARCHAR(64) NOT NULL,
        qty DOUBLE NOT NULL,
        avg_price DOUBLE NOT NULL,
        ts BIGINT NOT NULL,
        UNIQUE KEY uk_positions_run_symbol (run_id, symbol)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS pnl_points (
        id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
        run_id VARCHAR(64) NOT NULL,
        idx BIGINT NOT NULL,
        ts BIGINT NOT NULL,
        equity DOUBLE NOT NULL,
        KEY idx_pnl_points_run_idx (run_id, idx)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS allocator_snapshots (
        id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
        run_id VARCHAR(64) NOT NULL,
        ts BIGINT NOT NULL,
        payload LONGTEXT NOT NULL,
        KEY idx_allocator_run_ts (run_id, ts)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS learner_checkpoints (
        id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
        run_id VARCHAR(64) NOT NULL,
        ts BIGINT NOT NULL,
        algo VARCHAR(64) NOT NULL,
        bytes LONGTEXT NOT NULL,
        meta TEXT NOT NULL,
        KEY idx_learner_run_ts (run_id, ts)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS queue_snapshots (
        id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
        run_id VARCHAR(64) NOT NULL,
        ts BIGINT NOT NULL,
        payload LONGTEXT NOT NULL,
        KEY idx_queue_run_ts (run_id, ts)
    )"#,
];

const SQLITE_SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS runs (
        id TEXT NOT NULL PRIMARY KEY,
        started_at INTEGER NOT NULL,
        ended_at INTEGER NULL,
        meta TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs (started_at)",
    r#"CREATE TABLE IF NOT EXISTS trades (
        id TEXT NOT NULL PRIMARY KEY,
        run_id TEXT NOT NULL,
        symbol TEXT NOT NULL,
        side TEXT NOT NULL,
        qty REAL NOT NULL,
        price REAL NOT NULL,
        ts INTEGER NOT NULL,
        fees REAL NOT NULL DEFAULT 0,
        slippage_bps REAL NOT NULL DEFAULT 0,
        raw TEXT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_trades_run ON trades (run_id)",
    r#"CREATE TABLE IF NOT EXISTS positions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL,
        symbol TEXT NOT NULL,
        qty REAL NOT NULL,
        avg_price REAL NOT NULL,
        ts INTEGER NOT NULL,
        UNIQUE (run_id, symbol)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS pnl_points (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL,
        idx INTEGER NOT NULL,
        ts INTEGER NOT NULL,
        equity REAL NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_pnl_points_run_idx ON pnl_points (run_id, idx)",
    r#"CREATE TABLE IF NOT EXISTS allocator_snapshots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL,
        ts INTEGER NOT NULL,
        payload TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS learner_checkpoints (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL,
        ts INTEGER NOT NULL,
        algo TEXT NOT NULL,
        bytes TEXT NOT NULL,
        meta TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS queue_snapshots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL,
        ts INTEGER NOT NULL,
        payload TEXT NOT NULL
    )"#,
];

const MYSQL_UPSERT_POSITION: &str = "INSERT INTO positions (run_id, symbol, qty, avg_price, ts) \
     VALUES (?, ?, ?, ?, ?) \
     ON DUPLICATE KEY UPDATE qty = VALUES(qty), avg_price = VALUES(avg_price), ts = VALUES(ts)";

const SQLITE_UPSERT_POSITION: &str = "INSERT INTO positions (run_id, symbol, qty, avg_price, ts) \
     VALUES (?, ?, ?, ?, ?) \
     ON CONFLICT(run_id, symbol) DO UPDATE SET \
     qty = excluded.qty, avg_price = excluded.avg_price, ts = excluded.ts";

impl Dialect {
    fn schema(&self) -> &'static [&'static str] {
        match self {
            Dialect::Mysql => MYSQL_SCHEMA,
            Dialect::Sqlite => SQLITE_SCHEMA,
        }
    }

    fn upsert_position_sql(&self) -> &'static str {
        match self {
            Dialect::Mysql => MYSQL_UPSERT_POSITION,
            Dialect::Sqlite => SQLITE_UPSERT_POSITION,
        }
    }
}

/// 唯一键冲突（MySQL `1062 (23000)` / SQLite UNIQUE constraint failed）
pub fn is_unique_violation(message: &str) -> bool {
    let msg = message.to_ascii_lowercase();
    msg.contains("duplicate entry")
        || msg.contains("1062 (23000)")
        || msg.contains("unique constraint failed")
}

#[derive(Debug, Deserialize)]
struct RunRow {
    id: String,
    started_at: i64,
    ended_at: Option<i64>,
    meta: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct IdRow {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PositionRow {
    symbol: String,
    qty: f64,
    avg_price: f64,
    ts: i64,
}

#[derive(Debug, Deserialize)]
struct PnlRow {
    idx: i64,
    ts: i64,
    equity: f64,
}

#[derive(Debug, Deserialize)]
struct PayloadRow {
    run_id: String,
    ts: i64,
    payload: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct LearnerRow {
    run_id: String,
    ts: i64,
    algo: String,
    bytes: String,
    meta: Option<Value>,
}

/// JSON 文本列的解码结果：MySQL 驱动给出原始字符串，SQLite 驱动会直接解析成对象
fn json_column(raw: Option<Value>) -> Value {
    match raw {
        Some(Value::String(text)) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        Some(value) => value,
        None => Value::Null,
    }
}

pub struct RbatisCheckpointRepository {
    rb: RBatis,
    dialect: Dialect,
}

impl RbatisCheckpointRepository {
    pub fn new(rb: RBatis, dialect: Dialect) -> Self {
        Self { rb, dialect }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn latest_payload(&self, table: &str, run_id: &str) -> Result<Option<PayloadRow>> {
        let sql = format!(
            "SELECT run_id, ts, payload FROM {} WHERE run_id = ? ORDER BY ts DESC, id DESC LIMIT 1",
            table
        );
        let rows: Vec<PayloadRow> = self.rb.query_decode(&sql, vec![to_value!(run_id)]).await?;
        Ok(rows.into_iter().next())
    }

    async fn insert_payload(&self, table: &str, run_id: &str, payload: &Value) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (run_id, ts, payload) VALUES (?, ?, ?)",
            table
        );
        self.rb
            .exec(
                &sql,
                vec![
                    to_value!(run_id),
                    to_value!(time_util::now_millis()),
                    to_value!(serde_json::to_string(payload)?),
                ],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointRepository for RbatisCheckpointRepository {
    async fn ping(&self) -> Result<()> {
        self.rb.exec("SELECT 1", vec![]).await?;
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<()> {
        for ddl in self.dialect.schema() {
            self.rb.exec(ddl, vec![]).await?;
        }
        info!("检查点表结构已就绪: {:?}", self.dialect);
        Ok(())
    }

    async fn open_or_resume_run(&self, meta: &Value) -> Result<String> {
        let open: Vec<IdRow> = self
            .rb
            .query_decode(
                "SELECT id FROM runs WHERE ended_at IS NULL ORDER BY started_at DESC LIMIT 1",
                vec![],
            )
            .await?;
        if let Some(row) = open.into_iter().next() {
            return Ok(row.id);
        }

        let run_id = Uuid::new_v4().to_string();
        self.rb
            .exec(
                "INSERT INTO runs (id, started_at, ended_at, meta) VALUES (?, ?, NULL, ?)",
                vec![
                    to_value!(&run_id),
                    to_value!(time_util::now_millis()),
                    to_value!(serde_json::to_string(meta)?),
                ],
            )
            .await?;
        info!("新建运行: run_id={}", run_id);
        Ok(run_id)
    }

    async fn close_run(&self, run_id: &str) -> Result<()> {
        let result = self
            .rb
            .exec(
                "UPDATE runs SET ended_at = ? WHERE id = ? AND ended_at IS NULL",
                vec![to_value!(time_util::now_millis()), to_value!(run_id)],
            )
            .await?;
        if result.rows_affected == 0 {
            debug!("运行已结束或不存在, 跳过: run_id={}", run_id);
        } else {
            info!("运行已结束: run_id={}", run_id);
        }
        Ok(())
    }

    async fn append_trade(&self, run_id: &str, trade: &TradeRecord) -> Result<bool> {
        let raw = serde_json::to_string(&trade.raw)?;
        let result = self
            .rb
            .exec(
                "INSERT INTO trades (id, run_id, symbol, side, qty, price, ts, fees, slippage_bps, raw) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                vec![
                    to_value!(&trade.trade_id),
                    to_value!(run_id),
                    to_value!(&trade.symbol),
                    to_value!(&trade.side),
                    to_value!(trade.qty),
                    to_value!(trade.price),
                    to_value!(trade.ts),
                    to_value!(trade.fees),
                    to_value!(trade.slippage_bps),
                    to_value!(raw),
                ],
            )
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e.to_string()) => {
                debug!("成交已存在, 忽略: trade_id={}", trade.trade_id);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn upsert_position(
        &self,
        run_id: &str,
        symbol: &str,
        qty: f64,
        avg_price: f64,
        ts: DateTime<Utc>,
    ) -> Result<()> {
        self.rb
            .exec(
                self.dialect.upsert_position_sql(),
                vec![
                    to_value!(run_id),
                    to_value!(symbol),
                    to_value!(qty),
                    to_value!(avg_price),
                    to_value!(ts.timestamp_millis()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn append_pnl_points(&self, run_id: &str, points: &[EquityPoint]) -> Result<u64> {
        let mut written = 0;
        for point in points {
            let result = self
                .rb
                .exec(
                    "INSERT INTO pnl_points (run_id, idx, ts, equity) VALUES (?, ?, ?, ?)",
                    vec![
                        to_value!(run_id),
                        to_value!(point.idx),
                        to_value!(point.ts),
                        to_value!(point.equity),
                    ],
                )
                .await?;
            written += result.rows_affected;
        }
        Ok(written)
    }

    async fn save_allocator_snapshot(&self, run_id: &str, payload: &Value) -> Result<()> {
        self.insert_payload("allocator_snapshots", run_id, payload).await
    }

    async fn save_learner_checkpoint(
        &self,
        run_id: &str,
        algo: &str,
        model: &[u8],
        meta: &Value,
    ) -> Result<()> {
        self.rb
            .exec(
                "INSERT INTO learner_checkpoints (run_id, ts, algo, bytes, meta) VALUES (?, ?, ?, ?, ?)",
                vec![
                    to_value!(run_id),
                    to_value!(time_util::now_millis()),
                    to_value!(algo),
                    to_value!(BASE64.encode(model)),
                    to_value!(serde_json::to_string(meta)?),
                ],
            )
            .await?;
        Ok(())
    }

    async fn save_queue_snapshot(&self, run_id: &str, payload: &Value) -> Result<()> {
        self.insert_payload("queue_snapshots", run_id, payload).await
    }

    async fn load_latest_run(&self) -> Result<Option<RunRecord>> {
        let rows: Vec<RunRow> = self
            .rb
            .query_decode(
                "SELECT id, started_at, ended_at, meta FROM runs ORDER BY started_at DESC LIMIT 1",
                vec![],
            )
            .await?;
        Ok(rows.into_iter().next().map(|row| RunRecord {
            meta: json_column(row.meta),
            id: row.id,
            started_at: row.started_at,
            ended_at: row.ended_at,
        }))
    }

    async fn load_positions(&self, run_id: &str) -> Result<Vec<PositionState>> {
        let rows: Vec<PositionRow> = self
            .rb
            .query_decode(
                "SELECT symbol, qty, avg_price, ts FROM positions WHERE run_id = ? ORDER BY ts DESC, id DESC",
                vec![to_value!(run_id)],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| PositionState {
                symbol: row.symbol,
                qty: row.qty,
                avg_price: row.avg_price,
                ts: row.ts,
            })
            .collect())
    }

    async fn load_pnl_points(&self, run_id: &str, limit: usize) -> Result<Vec<EquityPoint>> {
        let rows: Vec<PnlRow> = self
            .rb
            .query_decode(
                "SELECT idx, ts, equity FROM pnl_points WHERE run_id = ? ORDER BY idx DESC, id DESC LIMIT ?",
                vec![to_value!(run_id), to_value!(limit as i64)],
            )
            .await?;
        let mut points: Vec<EquityPoint> = rows
            .into_iter()
            .map(|row| EquityPoint {
                idx: row.idx,
                ts: row.ts,
                equity: row.equity,
            })
            .collect();
        points.reverse();
        Ok(points)
    }

    async fn load_allocator_latest(&self, run_id: &str) -> Result<Option<AllocatorSnapshot>> {
        Ok(self
            .latest_payload("allocator_snapshots", run_id)
            .await?
            .map(|row| AllocatorSnapshot {
                payload: json_column(row.payload),
                run_id: row.run_id,
                ts: row.ts,
            }))
    }

    async fn load_learner_latest(&self, run_id: &str) -> Result<Option<LearnerCheckpoint>> {
        let rows: Vec<LearnerRow> = self
            .rb
            .query_decode(
                "SELECT run_id, ts, algo, bytes, meta FROM learner_checkpoints WHERE run_id = ? ORDER BY ts DESC, id DESC LIMIT 1",
                vec![to_value!(run_id)],
            )
            .await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };
        let model = match BASE64.decode(row.bytes.as_bytes()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("学习器模型字节解码失败, 按空模型处理: run_id={}, err={}", row.run_id, e);
                Vec::new()
            }
        };
        Ok(Some(LearnerCheckpoint {
            meta: json_column(row.meta),
            run_id: row.run_id,
            ts: row.ts,
            algo: row.algo,
            model,
        }))
    }

    async fn load_queue_latest(&self, run_id: &str) -> Result<Option<QueueSnapshot>> {
        Ok(self
            .latest_payload("queue_snapshots", run_id)
            .await?
            .map(|row| QueueSnapshot {
                payload: json_column(row.payload),
                run_id: row.run_id,
                ts: row.ts,
            }))
    }
}
