use std::path::PathBuf;
use std::time::Duration;

use crate::app_config::env::{env_is_true, env_opt, env_or_default, env_u64};
use crate::error::{CheckpointError, CheckpointResult};

/// 检查点子系统配置
///
/// 全部来自环境变量（可由 `.env` 提供），缺省值见 `Default`。
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// 快照/本地文件根目录
    pub checkpoint_dir: PathBuf,
    /// 审计追加日志路径
    pub append_log_path: PathBuf,
    /// 定时检查点间隔
    pub interval: Duration,
    /// 启动时是否恢复上一次运行状态
    pub resume_on_boot: bool,
    /// 主库不可达时使用的本地 SQLite 文件
    pub fallback_db_path: PathBuf,
    /// 主库连接串（MySQL），为空则直接使用兜底库
    pub database_url: Option<String>,
    /// 每写入 N 条记录执行一次 fsync
    pub fsync_every: u64,
    /// 主库连接重试次数（不含首次）
    pub connect_attempts: usize,
    /// 单次连接超时
    pub connect_timeout: Duration,
    /// 指数退避基数
    pub backoff_base: Duration,
    /// 等待运行时组件注册的轮询次数
    pub recovery_wait_attempts: u32,
    /// 等待运行时组件注册的轮询间隔
    pub recovery_wait_interval: Duration,
    /// 恢复时加载的权益曲线尾部长度
    pub equity_tail: usize,
    /// 关闭流程中每一步的超时
    pub shutdown_step_timeout: Duration,
    /// 关闭流程总超时
    pub shutdown_total_timeout: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        let checkpoint_dir = PathBuf::from("data/checkpoints");
        Self {
            append_log_path: checkpoint_dir.join("audit.jsonl"),
            fallback_db_path: checkpoint_dir.join("fallback.db"),
            checkpoint_dir,
            interval: Duration::from_secs(60),
            resume_on_boot: true,
            database_url: None,
            fsync_every: 50,
            connect_attempts: 4,
            connect_timeout: Duration::from_millis(2000),
            backoff_base: Duration::from_millis(200),
            recovery_wait_attempts: 30,
            recovery_wait_interval: Duration::from_millis(500),
            equity_tail: 500,
            shutdown_step_timeout: Duration::from_secs(10),
            shutdown_total_timeout: Duration::from_secs(30),
        }
    }
}

impl CheckpointConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let checkpoint_dir = PathBuf::from(env_or_default("CHECKPOINT_PATH", "data/checkpoints"));
        let append_log_path = env_opt("APPEND_LOG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| checkpoint_dir.join("audit.jsonl"));
        let fallback_db_path = env_opt("FALLBACK_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| checkpoint_dir.join("fallback.db"));

        Self {
            checkpoint_dir,
            append_log_path,
            fallback_db_path,
            interval: Duration::from_secs(env_u64("CHECKPOINT_INTERVAL_SECS", 60).max(1)),
            resume_on_boot: env_is_true("RESUME_ON_BOOT", defaults.resume_on_boot),
            database_url: env_opt("DB_HOST"),
            fsync_every: env_u64("APPEND_LOG_FSYNC_EVERY", defaults.fsync_every).max(1),
            connect_attempts: env_u64("DB_CONNECT_ATTEMPTS", defaults.connect_attempts as u64)
                as usize,
            connect_timeout: Duration::from_millis(env_u64("DB_CONNECT_TIMEOUT_MS", 2000)),
            backoff_base: Duration::from_millis(env_u64("DB_BACKOFF_BASE_MS", 200).max(1)),
            recovery_wait_attempts: env_u64(
                "RECOVERY_WAIT_ATTEMPTS",
                defaults.recovery_wait_attempts as u64,
            ) as u32,
            recovery_wait_interval: Duration::from_millis(env_u64(
                "RECOVERY_WAIT_INTERVAL_MS",
                500,
            )),
            equity_tail: env_u64("RECOVERY_EQUITY_TAIL", defaults.equity_tail as u64) as usize,
            shutdown_step_timeout: Duration::from_secs(env_u64("SHUTDOWN_STEP_TIMEOUT_SECS", 10)),
            shutdown_total_timeout: Duration::from_secs(env_u64(
                "SHUTDOWN_TOTAL_TIMEOUT_SECS",
                30,
            )),
        }
    }
}

impl CheckpointConfig {
    /// 启动前检查无法工作的组合
    pub fn validate(&self) -> CheckpointResult<()> {
        if self.interval.is_zero() {
            return Err(CheckpointError::Config("检查点间隔不能为 0".to_string()));
        }
        if self.append_log_path.as_os_str().is_empty() {
            return Err(CheckpointError::Config("APPEND_LOG_PATH 为空".to_string()));
        }
        if self.append_log_path == self.fallback_db_path {
            return Err(CheckpointError::Config(format!(
                "追加日志与兜底库不能是同一个文件: {}",
                self.append_log_path.display()
            )));
        }
        if self.equity_tail == 0 {
            return Err(CheckpointError::Config(
                "RECOVERY_EQUITY_TAIL 必须大于 0".to_string(),
            ));
        }
        Ok(())
    }
}
