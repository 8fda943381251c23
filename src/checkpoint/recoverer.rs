//! 启动恢复
//!
//! 1. 连接主库（指数退避重试），失败则切到本地 SQLite 兜底库；
//! 2. 优先从关系库加载最近一次运行，没有再回放追加日志；
//! 3. 运行时组件还没注册时转入后台轮询，超时即冷启动。

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use tracing::{debug, error, info, warn};

use crate::app_config::db;
use crate::app_config::CheckpointConfig;
use crate::checkpoint::model::{EngineState, LearnerState, RunRecord};
use crate::checkpoint::outcome::{RecoveryOutcome, RecoverySource, RestoredParts};
use crate::checkpoint::rbatis_repository::{Dialect, RbatisCheckpointRepository};
use crate::checkpoint::replay_fold::ReplayFold;
use crate::checkpoint::repository::{CheckpointRepository, StoreKind};
use crate::checkpoint::runtime::{Checkpointable, RuntimeComponents};
use crate::checkpoint::CheckpointContext;

/// 退避上限
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// 待导入的各部分状态
#[derive(Default)]
struct RestorePlan {
    engine: Option<EngineState>,
    allocator: Option<Value>,
    learner: Option<LearnerState>,
    queue: Option<Value>,
}

struct PendingRecovery {
    cancel_tx: broadcast::Sender<()>,
    handle: JoinHandle<RecoveryOutcome>,
}

pub struct Recoverer {
    ctx: CheckpointContext,
    config: CheckpointConfig,
    pending: Mutex<Option<PendingRecovery>>,
}

impl Recoverer {
    pub fn new(ctx: CheckpointContext, config: CheckpointConfig) -> Self {
        Self {
            ctx,
            config,
            pending: Mutex::new(None),
        }
    }

    /// 启动流程入口
    pub async fn boot(&self) -> RecoveryOutcome {
        match self.ctx.store.get().await {
            Some(repo) => match repo.ping().await {
                Ok(()) => debug!("仓储已就绪, 跳过连接"),
                Err(e) => {
                    warn!("现有仓储不可达, 重新连接: {}", e);
                    self.connect_store().await;
                }
            },
            None => {
                self.connect_store().await;
            }
        }

        if !self.config.resume_on_boot {
            info!("RESUME_ON_BOOT 已关闭, 不恢复历史状态");
            return RecoveryOutcome::Disabled;
        }

        match self.ctx.registry.current().await {
            Some(components) => {
                Self::restore(&self.ctx, self.config.equity_tail, &components).await
            }
            None => {
                self.spawn_deferred().await;
                RecoveryOutcome::Deferred
            }
        }
    }

    /// 连接主库或兜底库并写入仓储槽；两者都失败时槽保持为空
    pub async fn connect_store(&self) -> Option<StoreKind> {
        if let Some(url) = &self.config.database_url {
            match self.connect_primary(url).await {
                Ok(repo) => {
                    self.ctx.store.set(repo, StoreKind::Primary).await;
                    return Some(StoreKind::Primary);
                }
                Err(e) => warn!("主库不可用, 切换本地兜底库: {}", e),
            }
        } else {
            info!("未配置主库, 直接使用本地兜底库");
        }

        match Self::connect_fallback(&self.config).await {
            Ok(repo) => {
                self.ctx.store.set(repo, StoreKind::Fallback).await;
                Some(StoreKind::Fallback)
            }
            Err(e) => {
                error!("兜底库也无法打开, 仅写入追加日志: {}", e);
                None
            }
        }
    }

    async fn connect_primary(&self, url: &str) -> anyhow::Result<Arc<dyn CheckpointRepository>> {
        let factor = (self.config.backoff_base.as_millis() as u64 / 2).max(1);
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(MAX_BACKOFF)
            .take(self.config.connect_attempts);
        let timeout = self.config.connect_timeout;

        let rb = Retry::spawn(strategy, || async move {
            match tokio::time::timeout(timeout, db::connect_mysql(url)).await {
                Ok(Ok(rb)) => Ok(rb),
                Ok(Err(e)) => {
                    warn!("连接主库失败, 稍后重试: {}", e);
                    Err(e)
                }
                Err(_) => {
                    warn!("连接主库超时 ({:?}), 稍后重试", timeout);
                    Err(anyhow!("连接主库超时"))
                }
            }
        })
        .await?;

        let repo = RbatisCheckpointRepository::new(rb, Dialect::Mysql);
        repo.ensure_schema().await?;
        Ok(Arc::new(repo))
    }

    /// 打开本地 SQLite 兜底库并建表
    pub async fn connect_fallback(
        config: &CheckpointConfig,
    ) -> anyhow::Result<Arc<dyn CheckpointRepository>> {
        let rb = db::connect_sqlite(&config.fallback_db_path).await?;
        let repo = RbatisCheckpointRepository::new(rb, Dialect::Sqlite);
        repo.ensure_schema().await?;
        Ok(Arc::new(repo))
    }

    async fn spawn_deferred(&self) {
        let mut pending = self.pending.lock().await;
        if pending.is_some() {
            debug!("已有等待中的恢复任务");
            return;
        }

        let (cancel_tx, mut cancel_rx) = broadcast::channel(1);
        let ctx = self.ctx.clone();
        let attempts = self.config.recovery_wait_attempts;
        let interval = self.config.recovery_wait_interval;
        let equity_tail = self.config.equity_tail;

        info!(
            "运行时组件未注册, 后台等待 (最多 {} 次, 间隔 {:?})",
            attempts, interval
        );
        let handle = tokio::spawn(async move {
            for attempt in 1..=attempts {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = cancel_rx.recv() => {
                        debug!("等待中的恢复任务已取消");
                        return RecoveryOutcome::ColdStart;
                    }
                }
                if let Some(components) = ctx.registry.current().await {
                    info!("运行时组件已注册 (第 {} 次轮询), 开始恢复", attempt);
                    return Self::restore(&ctx, equity_tail, &components).await;
                }
            }
            info!("等待运行时组件超时, 冷启动");
            RecoveryOutcome::ColdStart
        });

        *pending = Some(PendingRecovery { cancel_tx, handle });
    }

    /// 等待后台恢复任务结束；没有任务时返回 None
    pub async fn join_pending(&self) -> Option<RecoveryOutcome> {
        let pending = self.pending.lock().await.take()?;
        match pending.handle.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!("后台恢复任务异常退出: {}", e);
                Some(RecoveryOutcome::ColdStart)
            }
        }
    }

    /// 取消后台恢复任务
    pub async fn shutdown(&self) {
        let Some(pending) = self.pending.lock().await.take() else {
            return;
        };
        let _ = pending.cancel_tx.send(());
        if let Err(e) = pending.handle.await {
            warn!("后台恢复任务异常退出: {}", e);
        }
    }

    async fn restore(
        ctx: &CheckpointContext,
        equity_tail: usize,
        components: &RuntimeComponents,
    ) -> RecoveryOutcome {
        if let Some(repo) = ctx.store.get().await {
            match Self::load_from_store(repo.as_ref(), equity_tail).await {
                Ok(Some((run, plan))) => {
                    if run.is_open() {
                        ctx.active_run.adopt(&run.id).await;
                    }
                    let restored = Self::apply(components, plan).await;
                    info!(
                        "已从关系库恢复: run_id={}, 持仓 {} 个, 权益点 {} 个",
                        run.id, restored.positions, restored.equity_points
                    );
                    return RecoveryOutcome::Restored {
                        source: RecoverySource::Store,
                        run_id: run.id,
                        restored,
                    };
                }
                Ok(None) => info!("关系库中没有历史运行, 尝试回放追加日志"),
                Err(e) => warn!("从关系库加载失败, 改为回放追加日志: {}", e),
            }
        }

        let replay = match ctx.append_log.replay(None) {
            Ok(replay) => replay,
            Err(e) => {
                warn!("追加日志无法读取, 冷启动: {}", e);
                return RecoveryOutcome::ColdStart;
            }
        };
        let fold = ReplayFold::from_events(replay.events());
        if fold.is_empty() {
            info!("没有可恢复的数据, 冷启动");
            return RecoveryOutcome::ColdStart;
        }
        if fold.learner.is_some() {
            warn!("追加日志只记录学习器元数据, 模型字节无法恢复");
        }

        let run_id = fold.run_id.clone().unwrap_or_default();
        let plan = RestorePlan {
            engine: fold.engine_state(),
            allocator: fold.allocator.clone(),
            learner: fold.learner_state(),
            queue: fold.queue.clone(),
        };
        let restored = Self::apply(components, plan).await;
        info!(
            "已从追加日志恢复: run_id={}, 事件 {} 条, 持仓 {} 个",
            run_id, fold.events, restored.positions
        );
        RecoveryOutcome::Restored {
            source: RecoverySource::AppendLog,
            run_id,
            restored,
        }
    }

    async fn load_from_store(
        repo: &dyn CheckpointRepository,
        equity_tail: usize,
    ) -> anyhow::Result<Option<(RunRecord, RestorePlan)>> {
        let Some(run) = repo.load_latest_run().await? else {
            return Ok(None);
        };

        let engine = EngineState {
            positions: repo.load_positions(&run.id).await?,
            equity_curve: repo.load_pnl_points(&run.id, equity_tail).await?,
            trades: Vec::new(),
        };
        let allocator = repo.load_allocator_latest(&run.id).await?.map(|s| s.payload);
        let learner = repo
            .load_learner_latest(&run.id)
            .await?
            .map(|checkpoint| LearnerState {
                algo: checkpoint.algo,
                model: Some(checkpoint.model),
                meta: checkpoint.meta,
            });
        let queue = repo.load_queue_latest(&run.id).await?.map(|s| s.payload);

        let plan = RestorePlan {
            engine: (!engine.is_empty()).then_some(engine),
            allocator,
            learner,
            queue,
        };
        Ok(Some((run, plan)))
    }

    async fn apply(components: &RuntimeComponents, plan: RestorePlan) -> RestoredParts {
        let mut restored = RestoredParts::default();

        if let Some(engine) = plan.engine {
            let positions = engine.positions.len();
            let equity_points = engine.equity_curve.len();
            if import_slot("engine", &components.engine, engine).await {
                restored.positions = positions;
                restored.equity_points = equity_points;
            }
        }
        if let Some(allocator) = plan.allocator {
            restored.allocator = import_slot("allocator", &components.allocator, allocator).await;
        }
        if let Some(learner) = plan.learner {
            let has_model = learner.model.is_some();
            restored.learner = import_slot("learner", &components.learner, learner).await;
            restored.learner_model = restored.learner && has_model;
        }
        if let Some(queue) = plan.queue {
            restored.queue = import_slot("queue", &components.queue, queue).await;
        }
        restored
    }
}

async fn import_slot<S: Send + 'static>(
    name: &str,
    slot: &Option<Arc<dyn Checkpointable<State = S>>>,
    state: S,
) -> bool {
    let Some(component) = slot else {
        debug!("{} 未注册, 跳过导入", name);
        return false;
    };
    match component.import_state(state).await {
        Ok(()) => true,
        Err(e) => {
            warn!("导入 {} 状态失败: {}", name, e);
            false
        }
    }
}
