use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::app_config::CheckpointConfig;
use crate::checkpoint::shutdown::ShutdownConfig;
use crate::checkpoint::{
    AppendLog, CheckpointContext, CheckpointHealth, CheckpointStatus, Checkpointer, Recoverer,
    RecoveryOutcome, RuntimeRegistry, ShutdownCoordinator, ShutdownReport, StoreKind, StoreSlot,
};
use crate::error::CheckpointResult;

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub checkpoint: CheckpointHealth,
    pub store: Option<String>,
    pub runtime_registered: bool,
    pub append_log_syncs: u64,
}

/// 检查点子系统的组装入口：恢复、周期检查点、优雅关闭
pub struct CheckpointService {
    ctx: CheckpointContext,
    checkpointer: Arc<Checkpointer>,
    recoverer: Arc<Recoverer>,
    coordinator: ShutdownCoordinator,
    boot_outcome: RecoveryOutcome,
}

impl CheckpointService {
    pub async fn start(config: CheckpointConfig, registry: RuntimeRegistry) -> CheckpointResult<Self> {
        Self::start_with_store(config, registry, StoreSlot::new()).await
    }

    /// 使用外部提供的仓储槽启动；槽已填充时跳过连接
    pub async fn start_with_store(
        config: CheckpointConfig,
        registry: RuntimeRegistry,
        store: StoreSlot,
    ) -> CheckpointResult<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.checkpoint_dir).await?;
        let append_log = Arc::new(AppendLog::open(&config.append_log_path, config.fsync_every).await?);
        let ctx = CheckpointContext::new(registry, store, append_log);

        let recoverer = Arc::new(Recoverer::new(ctx.clone(), config.clone()));
        let boot_outcome = recoverer.boot().await;
        info!("启动恢复结果: {:?}", boot_outcome);

        let checkpointer = Arc::new(Checkpointer::new(ctx.clone()));
        let coordinator = ShutdownCoordinator::new(
            checkpointer.clone(),
            ShutdownConfig {
                total_timeout: config.shutdown_total_timeout,
                step_timeout: config.shutdown_step_timeout,
            },
        )
        .with_recoverer(recoverer.clone());
        coordinator
            .attach_loop(checkpointer.spawn(config.interval))
            .await;

        Ok(Self {
            ctx,
            checkpointer,
            recoverer,
            coordinator,
            boot_outcome,
        })
    }

    pub fn context(&self) -> &CheckpointContext {
        &self.ctx
    }

    pub fn boot_outcome(&self) -> &RecoveryOutcome {
        &self.boot_outcome
    }

    /// 运维触发的即时检查点
    pub async fn checkpoint_now(&self) -> CheckpointStatus {
        self.checkpointer.run_cycle().await.status()
    }

    /// 等待启动时转入后台的恢复任务
    pub async fn join_recovery(&self) -> Option<RecoveryOutcome> {
        self.recoverer.join_pending().await
    }

    pub async fn health(&self) -> ServiceHealth {
        ServiceHealth {
            checkpoint: self.checkpointer.health().await,
            store: self.ctx.store.kind().await.map(|k: StoreKind| k.to_string()),
            runtime_registered: self.ctx.registry.is_registered().await,
            append_log_syncs: self.ctx.append_log.syncs_total(),
        }
    }

    pub async fn shutdown(&self) -> ShutdownReport {
        self.coordinator.shutdown().await
    }

    /// 阻塞直到收到退出信号，然后执行关闭
    pub async fn run_until_signal(&self) -> ShutdownReport {
        let signal = ShutdownCoordinator::wait_for_shutdown_signal().await;
        info!("收到退出信号: {}", signal);
        self.shutdown().await
    }
}
