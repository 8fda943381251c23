use std::fs::OpenOptions;
use std::path::Path;

use rbatis::RBatis;
use rbdc_mysql::MysqlDriver;
use rbdc_sqlite::driver::SqliteDriver;
use tracing::info;

/// 主库最大连接数
const MYSQL_MAX_OPEN_CONNS: u64 = 20;

/// 连接 MySQL 主库，`link` 会立即尝试获取一条连接
pub async fn connect_mysql(url: &str) -> anyhow::Result<RBatis> {
    let rb = RBatis::new();
    rb.link(MysqlDriver {}, url).await?;
    rb.get_pool()?.set_max_open_conns(MYSQL_MAX_OPEN_CONNS).await;
    info!("MySQL 主库连接成功");
    Ok(rb)
}

/// 打开本地 SQLite 兜底库（文件不存在时先创建）
pub async fn connect_sqlite(path: &Path) -> anyhow::Result<RBatis> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path)?;

    let rb = RBatis::new();
    rb.link(SqliteDriver {}, &format!("sqlite://{}", path.display()))
        .await?;
    // SQLite 单写者，多连接只会带来 database is locked
    rb.get_pool()?.set_max_open_conns(1).await;
    info!("SQLite 兜底库已打开: {}", path.display());
    Ok(rb)
}
