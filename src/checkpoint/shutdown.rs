//! 优雅关闭：停掉后台任务，做最后一次检查点，结束当前运行，flush 追加日志

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::checkpoint::checkpointer::{CheckpointLoopHandle, Checkpointer};
use crate::checkpoint::outcome::ShutdownReport;
use crate::checkpoint::recoverer::Recoverer;

/// 关闭配置
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// 总超时时间
    pub total_timeout: Duration,
    /// 每一步的超时时间
    pub step_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            total_timeout: Duration::from_secs(30),
            step_timeout: Duration::from_secs(10),
        }
    }
}

pub struct ShutdownCoordinator {
    checkpointer: Arc<Checkpointer>,
    recoverer: Option<Arc<Recoverer>>,
    loop_handle: Mutex<Option<CheckpointLoopHandle>>,
    is_shutting_down: AtomicBool,
    config: ShutdownConfig,
}

impl ShutdownCoordinator {
    pub fn new(checkpointer: Arc<Checkpointer>, config: ShutdownConfig) -> Self {
        Self {
            checkpointer,
            recoverer: None,
            loop_handle: Mutex::new(None),
            is_shutting_down: AtomicBool::new(false),
            config,
        }
    }

    pub fn with_recoverer(mut self, recoverer: Arc<Recoverer>) -> Self {
        self.recoverer = Some(recoverer);
        self
    }

    /// 交给协调器管理的周期任务，关闭时先停掉
    pub async fn attach_loop(&self, handle: CheckpointLoopHandle) {
        *self.loop_handle.lock().await = Some(handle);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::Acquire)
    }

    /// 执行关闭流程；重复调用直接返回 `performed = false`
    pub async fn shutdown(&self) -> ShutdownReport {
        if self
            .is_shutting_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("关闭已在进行中或已完成");
            return ShutdownReport::default();
        }

        info!("开始执行优雅关闭，总超时: {:?}", self.config.total_timeout);
        let start_time = Instant::now();
        let mut report = ShutdownReport {
            performed: true,
            ..Default::default()
        };

        let finished =
            tokio::time::timeout(self.config.total_timeout, self.execute(&mut report)).await;
        if finished.is_err() {
            error!("关闭超时 ({:?})", self.config.total_timeout);
            report.timed_out = true;
        } else {
            info!("优雅关闭完成，耗时: {:?}", start_time.elapsed());
        }
        report
    }

    async fn execute(&self, report: &mut ShutdownReport) {
        let step = self.config.step_timeout;
        let ctx = self.checkpointer.context();

        if let Some(handle) = self.loop_handle.lock().await.take() {
            if tokio::time::timeout(step, handle.shutdown()).await.is_err() {
                warn!("停止检查点周期任务超时 ({:?})", step);
                report.timed_out = true;
            }
        }

        if let Some(recoverer) = &self.recoverer {
            if tokio::time::timeout(step, recoverer.shutdown()).await.is_err() {
                warn!("取消后台恢复任务超时 ({:?})", step);
                report.timed_out = true;
            }
        }

        match tokio::time::timeout(step, self.checkpointer.run_cycle()).await {
            Ok(outcome) => {
                info!("最终检查点: {:?}", outcome);
                report.final_checkpoint = Some(outcome.status());
            }
            Err(_) => {
                error!("最终检查点超时 ({:?})", step);
                report.timed_out = true;
            }
        }

        if ctx.registry.is_registered().await {
            let run_id = match ctx.active_run.is_provisional().await {
                true => None,
                false => ctx.active_run.run_id().await,
            };
            match (ctx.store.get().await, run_id) {
                (Some(repo), Some(run_id)) => {
                    match tokio::time::timeout(step, repo.close_run(&run_id)).await {
                        Ok(Ok(())) => {
                            report.run_closed = true;
                            ctx.active_run.clear().await;
                        }
                        Ok(Err(e)) => error!("结束运行失败: run_id={}, err={}", run_id, e),
                        Err(_) => {
                            error!("结束运行超时: run_id={}", run_id);
                            report.timed_out = true;
                        }
                    }
                }
                (None, _) => warn!("仓储不可用, 运行保持未结束状态"),
                (_, None) => info!("没有已落库的运行, 无需结束"),
            }
        }

        match tokio::time::timeout(step, ctx.append_log.close()).await {
            Ok(Ok(())) => report.log_flushed = true,
            Ok(Err(e)) => error!("追加日志 flush 失败: {}", e),
            Err(_) => {
                error!("追加日志 flush 超时 ({:?})", step);
                report.timed_out = true;
            }
        }
    }

    /// 等待关闭信号
    pub async fn wait_for_shutdown_signal() -> &'static str {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            match (
                signal(SignalKind::terminate()),
                signal(SignalKind::interrupt()),
                signal(SignalKind::quit()),
            ) {
                (Ok(mut sigterm), Ok(mut sigint), Ok(mut sigquit)) => tokio::select! {
                    _ = sigterm.recv() => "SIGTERM",
                    _ = sigint.recv() => "SIGINT",
                    _ = sigquit.recv() => "SIGQUIT",
                },
                _ => {
                    warn!("注册信号处理失败, 仅监听 Ctrl-C");
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("监听 Ctrl-C 失败: {}", e);
                    }
                    "CTRL+C"
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("监听 Ctrl-C 失败: {}", e);
            }
            "CTRL+C"
        }
    }
}
