use std::sync::Arc;

use anyhow::{anyhow, bail};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use serde_json::json;
use tracing::{error, info, warn};

use rust_quant_checkpoint::app_config::{db, log, CheckpointConfig};
use rust_quant_checkpoint::checkpoint::append_log::Replay;
use rust_quant_checkpoint::checkpoint::model::AuditKind;
use rust_quant_checkpoint::checkpoint::replay_fold::ReplayFold;
use rust_quant_checkpoint::checkpoint::{
    AppendLog, CheckpointRepository, Dialect, RbatisCheckpointRepository, Recoverer,
};
use rust_quant_checkpoint::time_util;

/// 检查点运维工具
#[derive(Debug, Parser)]
#[command(name = "checkpoint-admin", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 按顺序输出追加日志中的记录
    Replay {
        /// 只输出该时间（RFC3339）之后的记录
        #[arg(long)]
        since: Option<String>,
        /// 只输出某一类事件：pnl / position / allocator / learner / queue
        #[arg(long)]
        kind: Option<String>,
    },
    /// 输出回放折叠后的最新状态
    Fold,
    /// 查看关系库中最近一次运行
    Status,
    /// 结束指定运行
    CloseRun { id: String },
    /// 清空追加日志
    TruncateLog {
        #[arg(long)]
        yes: bool,
    },
}

async fn open_store(config: &CheckpointConfig) -> anyhow::Result<Arc<dyn CheckpointRepository>> {
    if let Some(url) = &config.database_url {
        match tokio::time::timeout(config.connect_timeout, db::connect_mysql(url)).await {
            Ok(Ok(rb)) => {
                let repo = RbatisCheckpointRepository::new(rb, Dialect::Mysql);
                repo.ensure_schema().await?;
                return Ok(Arc::new(repo));
            }
            Ok(Err(e)) => warn!("主库连接失败, 使用兜底库: {}", e),
            Err(_) => warn!("主库连接超时, 使用兜底库"),
        }
    }
    Recoverer::connect_fallback(config).await
}

async fn run(cli: Cli, config: CheckpointConfig) -> anyhow::Result<()> {
    match cli.command {
        Command::Replay { since, kind } => {
            let since = match since.as_deref() {
                Some(raw) => Some(
                    time_util::parse_iso(raw).ok_or_else(|| anyhow!("无法解析时间: {}", raw))?,
                ),
                None => None,
            };
            let kind = match kind.as_deref() {
                Some(raw) => {
                    Some(AuditKind::parse(raw).ok_or_else(|| anyhow!("未知事件类型: {}", raw))?)
                }
                None => None,
            };

            let mut replay = Replay::open(&config.append_log_path, since)?;
            for event in replay.by_ref() {
                let matches = match kind {
                    Some(k) => event.get("type").and_then(|v| v.as_str()) == Some(k.as_str()),
                    None => true,
                };
                if matches {
                    println!("{}", event);
                }
            }
            if replay.skipped() > 0 {
                warn!("跳过损坏记录 {} 条", replay.skipped());
            }
        }
        Command::Fold => {
            let replay = Replay::open(&config.append_log_path, None)?;
            let fold = ReplayFold::from_events(replay.events());
            println!("{}", serde_json::to_string_pretty(&fold)?);
        }
        Command::Status => {
            let repo = open_store(&config).await?;
            match repo.load_latest_run().await? {
                Some(run) => {
                    let positions = repo.load_positions(&run.id).await?;
                    let equity = repo.load_pnl_points(&run.id, config.equity_tail).await?;
                    let status = json!({
                        "run_id": run.id,
                        "open": run.is_open(),
                        "started_at": time_util::to_iso(time_util::millis_to_datetime(run.started_at)),
                        "ended_at": run.ended_at.map(|ms| time_util::to_iso(time_util::millis_to_datetime(ms))),
                        "meta": run.meta,
                        "positions": positions.len(),
                        "equity_points": equity.len(),
                        "last_equity": equity.last().map(|p| p.equity),
                    });
                    println!("{}", serde_json::to_string_pretty(&status)?);
                }
                None => println!("没有任何运行记录"),
            }
        }
        Command::CloseRun { id } => {
            let repo = open_store(&config).await?;
            repo.close_run(&id).await?;
            info!("运行已结束: {}", id);
        }
        Command::TruncateLog { yes } => {
            if !yes {
                bail!("清空追加日志需要 --yes 确认");
            }
            let log = AppendLog::open(&config.append_log_path, config.fsync_every).await?;
            log.truncate().await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    log::setup_logging()?;

    let cli = Cli::parse();
    let config = CheckpointConfig::from_env();
    if let Err(e) = run(cli, config).await {
        error!("执行失败: {}", e);
        return Err(e);
    }
    Ok(())
}
