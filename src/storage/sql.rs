//! 基于关系数据库单行记录的锁存储.
//!
//! 表结构 (默认表名 `t_shedlock`), 所有列均为文本:
//!
//! ```sql
//! CREATE TABLE t_shedlock (lock_name VARCHAR(64) NOT NULL PRIMARY KEY,
//!   lock_until VARCHAR(64) NOT NULL, locked_at VARCHAR(64) NOT NULL,
//!   locked_by VARCHAR(1024) NOT NULL, token_value VARCHAR(64) NOT NULL,
//!   meta_value VARCHAR(1024) NOT NULL, locked_pid VARCHAR(64) NOT NULL)
//! ```
//!
//! 获取锁分两步: 先 INSERT, 主键冲突时再执行带条件的 UPDATE
//! (`token_value = token OR lock_until <= now`). 是否获取成功只由 UPDATE
//! 的 WHERE 条件决定.
//!
//! 字符串值以 SQL 字面量拼接 (单引号加倍转义), 不使用参数绑定, 以便同一
//! 语句可在 SQLite / MySQL / PostgreSQL 上执行, 并与已有部署的表数据兼容.
//! 空字符串写为 `(nil)`.

use crate::error::{LockError, LockResult};
use crate::storage::{
    format_timestamp, parse_timestamp, remaining_until, Lease, LockStorage, LockView,
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::OnceCell;

pub const DEFAULT_TABLE: &str = "t_shedlock";

/// 空字符串的占位值
pub const NIL_VALUE: &str = "(nil)";

const COLUMNS: &str = "lock_until, locked_at, locked_by, token_value, meta_value, locked_pid";

pub struct SqlStorage {
    pool: AnyPool,
    table: String,
    auto_create_table: bool,
    table_checked: OnceCell<()>,
}

impl SqlStorage {
    pub fn new(pool: AnyPool) -> Self {
        Self {
            pool,
            table: DEFAULT_TABLE.to_string(),
            auto_create_table: true,
            table_checked: OnceCell::new(),
        }
    }

    /// 连接数据库, 支持 sqlite: / mysql:// / postgres:// 等 URL
    pub async fn connect(database_url: &str) -> LockResult<Self> {
        sqlx::any::install_default_drivers();

        let mut options = AnyPoolOptions::new();
        if database_url.contains(":memory:") || database_url.contains("mode=memory") {
            // 内存数据库随连接关闭而消失, 只保留一个常驻连接
            options = options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = options
            .connect(database_url)
            .await
            .map_err(LockError::sql("connect"))?;
        Ok(Self::new(pool))
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        let table = table.into();
        self.table = if table.is_empty() {
            DEFAULT_TABLE.to_string()
        } else {
            table
        };
        self
    }

    /// 首次获取锁时是否尝试建表, 默认开启
    pub fn auto_create_table(mut self, enabled: bool) -> Self {
        self.auto_create_table = enabled;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub async fn ping(&self) -> LockResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(LockError::sql("ping"))?;
        Ok(())
    }

    /// 建表失败只记录日志, 表可能已经存在
    async fn ensure_table(&self) {
        if !self.auto_create_table {
            return;
        }
        self.table_checked
            .get_or_init(|| async {
                let sql = format!(
                    "CREATE TABLE {}(lock_name VARCHAR(64) NOT NULL PRIMARY KEY, \
                     lock_until VARCHAR(64) NOT NULL, locked_at VARCHAR(64) NOT NULL, \
                     locked_by VARCHAR(1024) NOT NULL, token_value VARCHAR(64) NOT NULL, \
                     meta_value VARCHAR(1024) NOT NULL, locked_pid VARCHAR(64) NOT NULL)",
                    self.table
                );
                if let Err(e) = self.execute(&sql).await {
                    log::warn!("[SQL] Auto create table {} skipped: {}", self.table, e);
                }
            })
            .await;
    }

    async fn execute(&self, sql: &str) -> Result<u64, sqlx::Error> {
        log::debug!("[SQL] query: {:?}", sql);
        let result = sqlx::query(sql).execute(&self.pool).await?;
        log::debug!("[SQL] affected: {}", result.rows_affected());
        Ok(result.rows_affected())
    }

    async fn fetch_one(&self, sql: &str) -> LockResult<Option<LockView>> {
        log::debug!("[SQL] query: {:?}", sql);
        let row = sqlx::query(sql)
            .fetch_optional(&self.pool)
            .await
            .map_err(LockError::sql("query lock"))?;
        row.as_ref().map(view_from_row).transpose()
    }

    async fn insert(&self, lease: &Lease) -> bool {
        let sql = format!(
            "INSERT INTO {} (lock_name, {}) VALUES ({}, {}, {}, {}, {}, {}, {})",
            self.table,
            COLUMNS,
            quote(&lease.key),
            quote(&format_timestamp(lease.until)),
            quote(&format_timestamp(Utc::now())),
            quote(hostname()),
            quote(&lease.token),
            quote(&lease.metadata),
            quote(pid()),
        );
        match self.execute(&sql).await {
            Ok(_) => true,
            Err(e) => {
                // 主键冲突即锁记录已存在, 交给 UPDATE 判断
                log::debug!("[SQL] insert lock {} failed: {}", lease.key, e);
                false
            }
        }
    }

    async fn update(&self, lease: &Lease) -> LockResult<bool> {
        let now = quote(&format_timestamp(Utc::now()));
        let token = quote(&lease.token);
        let sql = format!(
            "UPDATE {} SET lock_until = {}, locked_at = {}, locked_by = {}, \
             token_value = {}, meta_value = {}, locked_pid = {} \
             WHERE lock_name = {} AND (token_value = {} OR lock_until <= {})",
            self.table,
            quote(&format_timestamp(lease.until)),
            now,
            quote(hostname()),
            token,
            quote(&lease.metadata),
            quote(pid()),
            quote(&lease.key),
            token,
            now,
        );
        let affected = self
            .execute(&sql)
            .await
            .map_err(LockError::sql("update lock"))?;
        Ok(affected > 0)
    }

    /// 只按 name + token 更新 lock_until, 用于续期和释放
    async fn set_until(&self, lease: &Lease, until: &str, op: &'static str) -> LockResult<bool> {
        let sql = format!(
            "UPDATE {} SET lock_until = {} WHERE lock_name = {} AND token_value = {}",
            self.table,
            quote(until),
            quote(&lease.key),
            quote(&lease.token),
        );
        let affected = self.execute(&sql).await.map_err(LockError::sql(op))?;
        Ok(affected > 0)
    }
}

#[async_trait]
impl LockStorage for SqlStorage {
    async fn try_acquire(&self, lease: &Lease) -> LockResult<bool> {
        self.ensure_table().await;
        if self.insert(lease).await {
            return Ok(true);
        }
        self.update(lease).await
    }

    async fn view(&self, key: &str) -> LockResult<LockView> {
        let sql = format!(
            "SELECT {} FROM {} WHERE lock_name = {}",
            COLUMNS,
            self.table,
            quote(key)
        );
        Ok(self.fetch_one(&sql).await?.unwrap_or_default())
    }

    async fn ttl(&self, lease: &mut Lease) -> LockResult<Duration> {
        let sql = format!(
            "SELECT {} FROM {} WHERE lock_name = {} AND token_value = {}",
            COLUMNS,
            self.table,
            quote(&lease.key),
            quote(&lease.token)
        );
        let Some(found) = self.fetch_one(&sql).await? else {
            return Ok(Duration::ZERO);
        };
        log::debug!("[SQL] found: {}", found);

        lease.until = parse_timestamp(&found.until)?;
        Ok(remaining_until(lease.until))
    }

    async fn refresh(&self, lease: &mut Lease, ttl: Duration) -> LockResult<bool> {
        let mut extended = lease.clone();
        extended.extend(ttl);
        let until = format_timestamp(extended.until);
        if self.set_until(lease, &until, "extend lock").await? {
            *lease = extended;
            return Ok(true);
        }
        Ok(false)
    }

    async fn release(&self, lease: &Lease) -> LockResult<bool> {
        // 逻辑删除: 行保留, lock_until 改为过去时间, 任何人可立即重新获取
        let until = format_timestamp(Utc::now() - chrono::Duration::seconds(1));
        let released = self.set_until(lease, &until, "unlock").await?;
        if released {
            log::info!("[RELEASE] Released lock - key: {}", lease.key);
        }
        Ok(released)
    }

    async fn close(&self) -> LockResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

fn view_from_row(row: &AnyRow) -> LockResult<LockView> {
    let column = |name: &str| -> LockResult<String> {
        row.try_get::<String, _>(name)
            .map_err(|e| LockError::MalformedRecord(format!("column {name}: {e}")))
    };
    Ok(LockView {
        until: column("lock_until")?,
        locked_at: column("locked_at")?,
        locked_by: column("locked_by")?,
        token: column("token_value")?,
        metadata: unnil(column("meta_value")?),
        locked_pid: column("locked_pid")?,
        remaining: None,
    })
}

/// 单引号字面量, 内部单引号加倍
fn quote(value: &str) -> String {
    let value = if value.is_empty() { NIL_VALUE } else { value };
    format!("'{}'", value.replace('\'', "''"))
}

fn unnil(value: String) -> String {
    if value == NIL_VALUE {
        String::new()
    } else {
        value
    }
}

fn hostname() -> &'static str {
    static HOSTNAME: OnceLock<String> = OnceLock::new();
    HOSTNAME.get_or_init(|| match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => e.to_string(),
    })
}

fn pid() -> &'static str {
    static PID: OnceLock<String> = OnceLock::new();
    PID.get_or_init(|| std::process::id().to_string())
}
