//! 追加式审计日志（JSON Lines）
//!
//! 关系库不可用时的最后一道防线：只依赖本地文件系统。
//!
//! 每条记录一行 JSON 对象，写入后立即 flush 到操作系统；
//! 每写入 `fsync_every` 条执行一次 fsync，硬崩溃最多丢失 `fsync_every - 1` 条。

use std::fs::File;
use std::io::{self, BufRead, BufReader, Lines, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::checkpoint::model::AuditEvent;
use crate::error::{CheckpointError, CheckpointResult};
use crate::time_util;

/// 向前查找换行符时每次读取的字节数
const TAIL_SCAN_CHUNK: u64 = 4096;

/// fsync 完成后的回调
pub type SyncHook = Arc<dyn Fn() + Send + Sync>;

struct LogWriter {
    file: tokio::fs::File,
    /// 上次 fsync 之后的写入条数
    pending: u64,
}

pub struct AppendLog {
    path: PathBuf,
    writer: Mutex<LogWriter>,
    fsync_every: u64,
    syncs_total: AtomicU64,
    appends_total: AtomicU64,
    sync_hook: Option<SyncHook>,
}

impl AppendLog {
    /// 打开（或创建）日志文件，父目录不存在时一并创建
    ///
    /// 上次崩溃留下的半行会先被截掉，保证新记录从完整的行首开始。
    pub async fn open(path: impl AsRef<Path>, fsync_every: u64) -> CheckpointResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let dropped = trim_torn_tail(&path).await?;
        if dropped > 0 {
            warn!(
                "追加日志末尾有未写完的行, 已截掉 {} 字节: {}",
                dropped,
                path.display()
            );
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            writer: Mutex::new(LogWriter { file, pending: 0 }),
            fsync_every: fsync_every.max(1),
            syncs_total: AtomicU64::new(0),
            appends_total: AtomicU64::new(0),
            sync_hook: None,
        })
    }

    pub fn with_sync_hook(mut self, hook: SyncHook) -> Self {
        self.sync_hook = Some(hook);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fsync_every(&self) -> u64 {
        self.fsync_every
    }

    pub fn syncs_total(&self) -> u64 {
        self.syncs_total.load(Ordering::Acquire)
    }

    pub fn appends_total(&self) -> u64 {
        self.appends_total.load(Ordering::Acquire)
    }

    /// 追加一条记录，缺少 `ts` 时自动补上当前时间
    pub async fn append<T: Serialize + ?Sized>(&self, record: &T) -> CheckpointResult<()> {
        let mut value = serde_json::to_value(record)?;
        let obj = value.as_object_mut().ok_or_else(|| {
            CheckpointError::InvalidRecord("追加日志只接受 JSON 对象".to_string())
        })?;
        let missing_ts = match obj.get("ts") {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(_) => false,
        };
        if missing_ts {
            obj.insert("ts".to_string(), Value::String(time_util::now_iso()));
        }

        let mut line = serde_json::to_string(&value)?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer.file.write_all(line.as_bytes()).await?;
        // tokio 的 File 有内部缓冲，flush 之后才保证已交给操作系统
        writer.file.flush().await?;
        writer.pending += 1;
        self.appends_total.fetch_add(1, Ordering::AcqRel);

        if writer.pending >= self.fsync_every {
            self.sync_locked(&mut writer).await?;
        }
        Ok(())
    }

    pub async fn append_event(&self, event: &AuditEvent) -> CheckpointResult<()> {
        self.append(event).await
    }

    /// 立即 flush + fsync
    pub async fn flush(&self) -> CheckpointResult<()> {
        let mut writer = self.writer.lock().await;
        self.sync_locked(&mut writer).await?;
        Ok(())
    }

    pub async fn close(&self) -> CheckpointResult<()> {
        self.flush().await
    }

    /// 清空日志文件（外部显式截断，日志本身从不自动轮转）
    pub async fn truncate(&self) -> CheckpointResult<()> {
        let mut writer = self.writer.lock().await;
        writer.file.flush().await?;
        writer.file.set_len(0).await?;
        self.sync_locked(&mut writer).await?;
        warn!("追加日志已截断: {}", self.path.display());
        Ok(())
    }

    async fn sync_locked(&self, writer: &mut LogWriter) -> io::Result<()> {
        writer.file.flush().await?;
        writer.file.sync_data().await?;
        debug!("追加日志 fsync 完成, 本批 {} 条", writer.pending);
        writer.pending = 0;
        self.syncs_total.fetch_add(1, Ordering::AcqRel);
        if let Some(hook) = &self.sync_hook {
            hook();
        }
        Ok(())
    }

    /// 按追加顺序回放记录；每次调用都从文件头重新读取
    pub fn replay(&self, since: Option<DateTime<Utc>>) -> CheckpointResult<Replay> {
        Replay::open(&self.path, since)
    }
}

/// 把文件截断到最后一个换行符之后，返回截掉的字节数
async fn trim_torn_tail(path: &Path) -> io::Result<u64> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(0);
    }

    let mut end = len;
    let mut keep = 0;
    let mut buf = vec![0u8; TAIL_SCAN_CHUNK as usize];
    while end > 0 {
        let start = end.saturating_sub(TAIL_SCAN_CHUNK);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start)).await?;
        file.read_exact(chunk).await?;
        if let Some(pos) = chunk.iter().rposition(|b| *b == b'\n') {
            keep = start + pos as u64 + 1;
            break;
        }
        end = start;
    }

    if keep < len {
        file.set_len(keep).await?;
        file.sync_data().await?;
    }
    Ok(len - keep)
}

/// 日志回放迭代器（惰性读取）
///
/// 损坏的行（包括崩溃时写了一半的最后一行）直接跳过。
pub struct Replay {
    lines: Option<Lines<BufReader<File>>>,
    since: Option<DateTime<Utc>>,
    skipped: usize,
}

impl Replay {
    pub fn open(path: &Path, since: Option<DateTime<Utc>>) -> CheckpointResult<Self> {
        let lines = match File::open(path) {
            Ok(file) => Some(BufReader::new(file).lines()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            lines,
            since,
            skipped: 0,
        })
    }

    /// 迄今跳过的损坏行数
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// 只保留能解析为审计事件的记录
    pub fn events(self) -> impl Iterator<Item = AuditEvent> {
        self.filter_map(|value| serde_json::from_value::<AuditEvent>(value).ok())
    }

    fn accept(&self, value: &Value) -> bool {
        let Some(since) = self.since else {
            return true;
        };
        value
            .get("ts")
            .and_then(Value::as_str)
            .and_then(time_util::parse_iso)
            .map(|ts| ts >= since)
            .unwrap_or(false)
    }
}

impl Iterator for Replay {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        loop {
            let line = match self.lines.as_mut()?.next()? {
                Ok(line) => line,
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    self.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!("追加日志读取中断: {}", e);
                    self.lines = None;
                    return None;
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let value = match serde_json::from_str::<Value>(trimmed) {
                Ok(v) if v.is_object() => v,
                _ => {
                    self.skipped += 1;
                    continue;
                }
            };
            if self.accept(&value) {
                return Some(value);
            }
        }
    }
}
