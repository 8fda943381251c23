//! 周期检查点
//!
//! 每一轮：从注册表拉取各组件状态，先写关系库（尽力而为），再写追加日志。
//! 两边互不依赖，关系库失败不影响追加日志。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::checkpoint::model::{
    AllocatorState, AuditEvent, AuditKind, EngineState, LearnerMeta, LearnerState, QueueState,
};
use crate::checkpoint::outcome::{
    CheckpointOutcome, REASON_APPEND_LOG_FAILED, REASON_STORE_UNAVAILABLE,
    REASON_WORKER_NOT_RUNNING,
};
use crate::checkpoint::runtime::{Checkpointable, RuntimeComponents};
use crate::checkpoint::CheckpointContext;
use crate::time_util;

/// 追加日志中 pnl 事件携带的权益曲线尾部长度
pub const PNL_EVENT_TAIL: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPhase {
    Idle,
    Collecting,
    DualWriting,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointHealth {
    pub phase: CheckpointPhase,
    pub last_success: Option<String>,
    pub last_persisted: Option<bool>,
    pub cycles: u64,
    pub run_id: Option<String>,
}

#[derive(Debug)]
struct CheckpointerState {
    phase: CheckpointPhase,
    last_success: Option<DateTime<Utc>>,
    last_persisted: Option<bool>,
    cycles: u64,
}

/// 一轮中导出到的各组件状态
#[derive(Default)]
struct Collected {
    engine: Option<EngineState>,
    allocator: Option<AllocatorState>,
    learner: Option<LearnerState>,
    queue: Option<QueueState>,
}

async fn export_slot<S: Send + 'static>(
    name: &str,
    slot: &Option<Arc<dyn Checkpointable<State = S>>>,
) -> Option<S> {
    let component = slot.as_ref()?;
    match component.export_state().await {
        Ok(state) => Some(state),
        Err(e) => {
            warn!("导出 {} 状态失败, 本轮跳过: {}", name, e);
            None
        }
    }
}

pub struct Checkpointer {
    ctx: CheckpointContext,
    cycle_lock: Mutex<()>,
    state: RwLock<CheckpointerState>,
}

impl Checkpointer {
    pub fn new(ctx: CheckpointContext) -> Self {
        Self {
            ctx,
            cycle_lock: Mutex::new(()),
            state: RwLock::new(CheckpointerState {
                phase: CheckpointPhase::Idle,
                last_success: None,
                last_persisted: None,
                cycles: 0,
            }),
        }
    }

    pub fn context(&self) -> &CheckpointContext {
        &self.ctx
    }

    /// 执行一轮检查点，多次并发调用会串行化
    pub async fn run_cycle(&self) -> CheckpointOutcome {
        let _cycle = self.cycle_lock.lock().await;

        let Some(components) = self.ctx.registry.current().await else {
            debug!("运行时未注册, 跳过检查点");
            return CheckpointOutcome::unavailable(REASON_WORKER_NOT_RUNNING);
        };

        self.set_phase(CheckpointPhase::Collecting).await;
        let collected = Self::collect(&components).await;

        self.set_phase(CheckpointPhase::DualWriting).await;
        let store_result = self.write_store(&components.run_meta, &collected).await;
        let run_id = match self.ctx.active_run.run_id().await {
            Some(id) => id,
            None => self.ctx.active_run.provisional_or_current().await,
        };
        let log_ok = self.write_log(&run_id, &collected).await;

        let ts = Utc::now();
        let outcome = match (store_result, log_ok) {
            (Ok(()), true) => CheckpointOutcome::Success { run_id, ts },
            (Ok(()), false) => CheckpointOutcome::Partial {
                run_id,
                ts,
                persisted: true,
                reason: REASON_APPEND_LOG_FAILED.to_string(),
            },
            (Err(reason), true) => CheckpointOutcome::Partial {
                run_id,
                ts,
                persisted: false,
                reason,
            },
            (Err(reason), false) => CheckpointOutcome::Partial {
                run_id,
                ts,
                persisted: false,
                reason: format!("{};{}", reason, REASON_APPEND_LOG_FAILED),
            },
        };

        let mut state = self.state.write().await;
        state.phase = CheckpointPhase::Idle;
        // 至少追加日志落地才算一次成功的检查点
        if log_ok {
            state.last_success = Some(ts);
        }
        state.last_persisted = Some(outcome.persisted());
        state.cycles += 1;
        drop(state);

        match &outcome {
            CheckpointOutcome::Success { run_id, .. } => {
                debug!("检查点完成: run_id={}", run_id)
            }
            CheckpointOutcome::Partial { run_id, reason, .. } => {
                warn!("检查点部分完成: run_id={}, reason={}", run_id, reason)
            }
            CheckpointOutcome::Unavailable { .. } => {}
        }
        outcome
    }

    pub async fn health(&self) -> CheckpointHealth {
        let run_id = self.ctx.active_run.run_id().await;
        let state = self.state.read().await;
        CheckpointHealth {
            phase: state.phase,
            last_success: state.last_success.map(time_util::to_iso),
            last_persisted: state.last_persisted,
            cycles: state.cycles,
            run_id,
        }
    }

    /// 启动周期任务，首次执行在一个周期之后
    pub fn spawn(self: &Arc<Self>, every: Duration) -> CheckpointLoopHandle {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.run_cycle().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("检查点周期任务退出");
                        break;
                    }
                }
            }
        });
        info!("检查点周期任务已启动, 间隔 {:?}", every);
        CheckpointLoopHandle {
            shutdown_tx,
            handle,
        }
    }

    async fn set_phase(&self, phase: CheckpointPhase) {
        self.state.write().await.phase = phase;
    }

    async fn collect(components: &RuntimeComponents) -> Collected {
        Collected {
            engine: export_slot("engine", &components.engine).await,
            allocator: export_slot("allocator", &components.allocator).await,
            learner: export_slot("learner", &components.learner).await,
            queue: export_slot("queue", &components.queue).await,
        }
    }

    /// 关系库写入，每一步单独捕获错误；返回失败原因
    async fn write_store(&self, meta: &Value, collected: &Collected) -> Result<(), String> {
        let Some(repo) = self.ctx.store.get().await else {
            return Err(REASON_STORE_UNAVAILABLE.to_string());
        };

        let run_id = match repo.open_or_resume_run(meta).await {
            Ok(id) => id,
            Err(e) => {
                warn!("打开运行失败: {}", e);
                return Err(REASON_STORE_UNAVAILABLE.to_string());
            }
        };
        self.ctx.active_run.adopt(&run_id).await;

        let mut failed: Vec<&'static str> = Vec::new();

        if let Some(engine) = &collected.engine {
            for position in &engine.positions {
                let ts = if position.ts > 0 {
                    time_util::millis_to_datetime(position.ts)
                } else {
                    Utc::now()
                };
                if let Err(e) = repo
                    .upsert_position(&run_id, &position.symbol, position.qty, position.avg_price, ts)
                    .await
                {
                    warn!("写入持仓失败: symbol={}, err={}", position.symbol, e);
                    push_once(&mut failed, "positions");
                }
            }

            for trade in &engine.trades {
                if let Err(e) = repo.append_trade(&run_id, trade).await {
                    warn!("写入成交失败: trade_id={}, err={}", trade.trade_id, e);
                    push_once(&mut failed, "trades");
                }
            }

            if !engine.equity_curve.is_empty() {
                if let Err(e) = repo.append_pnl_points(&run_id, &engine.equity_curve).await {
                    warn!("写入权益曲线失败: {}", e);
                    failed.push("pnl_points");
                }
            }
        }

        if let Some(payload) = &collected.allocator {
            if let Err(e) = repo.save_allocator_snapshot(&run_id, payload).await {
                warn!("写入分配器快照失败: {}", e);
                failed.push("allocator");
            }
        }

        if let Some(learner) = &collected.learner {
            let model = learner.model.as_deref().unwrap_or_default();
            if let Err(e) = repo
                .save_learner_checkpoint(&run_id, &learner.algo, model, &learner.meta)
                .await
            {
                warn!("写入学习器检查点失败: {}", e);
                failed.push("learner");
            }
        }

        if let Some(payload) = &collected.queue {
            if let Err(e) = repo.save_queue_snapshot(&run_id, payload).await {
                warn!("写入队列快照失败: {}", e);
                failed.push("queue");
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(format!("store_write_failed: {}", failed.join(",")))
        }
    }

    /// 追加日志写入；返回是否全部成功
    async fn write_log(&self, run_id: &str, collected: &Collected) -> bool {
        let mut events = Vec::new();
        if let Some(engine) = &collected.engine {
            events.push(AuditEvent::new(
                AuditKind::Position,
                run_id,
                json!({ "positions": engine.positions }),
            ));
            let tail_start = engine.equity_curve.len().saturating_sub(PNL_EVENT_TAIL);
            events.push(AuditEvent::new(
                AuditKind::Pnl,
                run_id,
                json!({ "equity_curve": &engine.equity_curve[tail_start..] }),
            ));
        }
        if let Some(payload) = &collected.allocator {
            events.push(AuditEvent::new(AuditKind::Allocator, run_id, payload.clone()));
        }
        if let Some(learner) = &collected.learner {
            events.push(AuditEvent::new(
                AuditKind::Learner,
                run_id,
                json!(LearnerMeta::from(learner)),
            ));
        }
        if let Some(payload) = &collected.queue {
            events.push(AuditEvent::new(AuditKind::Queue, run_id, payload.clone()));
        }

        if events.is_empty() {
            return true;
        }

        let mut all_ok = true;
        for event in &events {
            if let Err(e) = self.ctx.append_log.append_event(event).await {
                error!("追加日志写入失败: type={}, err={}", event.kind.as_str(), e);
                all_ok = false;
            }
        }
        if let Err(e) = self.ctx.append_log.flush().await {
            error!("追加日志 flush 失败: {}", e);
            all_ok = false;
        }
        all_ok
    }
}

fn push_once(failed: &mut Vec<&'static str>, step: &'static str) {
    if !failed.contains(&step) {
        failed.push(step);
    }
}

/// 周期任务句柄
pub struct CheckpointLoopHandle {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl CheckpointLoopHandle {
    /// 发送停止信号并等待任务退出
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.handle.await {
            warn!("检查点周期任务异常退出: {}", e);
        }
    }
}
