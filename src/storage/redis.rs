//! 基于 Redis 单个 key 的锁存储.
//!
//! key 的值为 `token + metadata` (无分隔符), 过期时间即 key 的 PX 毫秒 TTL.
//! 获取、查询剩余时间、续期、释放都由 Lua 脚本原子执行, 脚本按字节比较值,
//! 与已有部署中的锁数据保持兼容.

use crate::error::{LockError, LockResult};
use crate::storage::{
    expiry_from_now, max_expiry, remaining_until, Lease, LockStorage, LockView,
};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script, Value};
use std::str::FromStr;
use std::time::Duration;

const OBTAIN_SCRIPT: &str = r#"
if redis.call("set", KEYS[1], ARGV[1], "NX", "PX", ARGV[3]) then return redis.status_reply("OK") end

local offset = tonumber(ARGV[2])
if redis.call("getrange", KEYS[1], 0, offset-1) == string.sub(ARGV[1], 1, offset) then return redis.call("set", KEYS[1], ARGV[1], "PX", ARGV[3]) end
"#;

const PTTL_SCRIPT: &str = r#"if redis.call("get", KEYS[1]) == ARGV[1] then return redis.call("pttl", KEYS[1]) else return -3 end"#;

const REFRESH_SCRIPT: &str = r#"if redis.call("get", KEYS[1]) == ARGV[1] then return redis.call("pexpire", KEYS[1], ARGV[2]) else return 0 end"#;

const RELEASE_SCRIPT: &str = r#"if redis.call("get", KEYS[1]) == ARGV[1] then return redis.call("del", KEYS[1]) else return 0 end"#;

pub struct RedisStorage {
    client: ConnectionManager,
    obtain: Script,
    pttl: Script,
    refresh: Script,
    release: Script,
}

impl RedisStorage {
    pub async fn new(
        redis_url: &str,
        username: Option<String>,
        password: Option<String>,
        db: Option<i64>,
    ) -> LockResult<Self> {
        // 构建连接信息
        let mut connection_info =
            redis::ConnectionInfo::from_str(redis_url).map_err(LockError::redis("parse url"))?;

        // URL 之外单独指定的认证信息优先
        if let Some(pwd) = password {
            connection_info.redis.password = Some(pwd);
        }
        if let Some(user) = username {
            connection_info.redis.username = Some(user);
        }
        if let Some(database) = db {
            connection_info.redis.db = database;
        }

        let client = redis::Client::open(connection_info).map_err(LockError::redis("open client"))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(LockError::redis("connect"))?;
        Ok(Self::with_connection(connection))
    }

    /// 复用调用方已有的连接
    pub fn with_connection(client: ConnectionManager) -> Self {
        Self {
            client,
            obtain: Script::new(OBTAIN_SCRIPT),
            pttl: Script::new(PTTL_SCRIPT),
            refresh: Script::new(REFRESH_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        }
    }

    pub async fn ping(&self) -> LockResult<()> {
        let mut conn = self.client.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(LockError::redis("ping"))?;
        Ok(())
    }
}

/// 存储在 key 中的值
fn encode_value(lease: &Lease) -> String {
    format!("{}{}", lease.token, lease.metadata)
}

/// PX 参数, 至少 1 毫秒, 与其他存储一样不超过最大过期时间
fn ttl_millis(ttl: Duration) -> i64 {
    let ttl = ttl.min(remaining_until(max_expiry()));
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

/// PTTL 脚本的返回值转为剩余时间, 非正数 (不存在/不属于该 token) 一律为零
fn remaining_from_reply(reply: Option<i64>) -> Duration {
    match reply {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => Duration::ZERO,
    }
}

/// obtain 脚本: SET 成功返回 OK, 值前缀不匹配时返回 nil
fn obtained_from_reply(reply: &Value) -> bool {
    !matches!(reply, Value::Nil)
}

/// refresh / release 脚本: 1 表示 token 匹配且操作生效
fn confirmed(reply: Option<i64>) -> bool {
    reply == Some(1)
}

#[async_trait]
impl LockStorage for RedisStorage {
    async fn try_acquire(&self, lease: &Lease) -> LockResult<bool> {
        let mut conn = self.client.clone();
        let reply: Value = self
            .obtain
            .key(&lease.key)
            .arg(encode_value(lease))
            .arg(lease.token.len())
            .arg(ttl_millis(lease.ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(LockError::redis("obtain lock"))?;
        Ok(obtained_from_reply(&reply))
    }

    async fn view(&self, key: &str) -> LockResult<LockView> {
        let mut conn = self.client.clone();
        let value: Option<String> = conn.get(key).await.map_err(LockError::redis("get lock"))?;
        let Some(value) = value else {
            return Ok(LockView::default());
        };
        let pttl: i64 = conn.pttl(key).await.map_err(LockError::redis("pttl lock"))?;

        // 不知道 token 长度, 无法拆分 token 与 metadata, 整个值作为 token 返回
        Ok(LockView {
            token: value,
            remaining: (pttl > 0).then(|| Duration::from_millis(pttl as u64)),
            ..LockView::default()
        })
    }

    async fn ttl(&self, lease: &mut Lease) -> LockResult<Duration> {
        let mut conn = self.client.clone();
        let reply: Option<i64> = self
            .pttl
            .key(&lease.key)
            .arg(encode_value(lease))
            .invoke_async(&mut conn)
            .await
            .map_err(LockError::redis("pttl lock"))?;

        let remaining = remaining_from_reply(reply);
        if !remaining.is_zero() {
            lease.until = expiry_from_now(remaining);
        }
        Ok(remaining)
    }

    async fn refresh(&self, lease: &mut Lease, ttl: Duration) -> LockResult<bool> {
        let mut conn = self.client.clone();
        let reply: Option<i64> = self
            .refresh
            .key(&lease.key)
            .arg(encode_value(lease))
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(LockError::redis("refresh lock"))?;

        if confirmed(reply) {
            lease.extend(ttl);
            return Ok(true);
        }
        Ok(false)
    }

    async fn release(&self, lease: &Lease) -> LockResult<bool> {
        let mut conn = self.client.clone();
        let reply: Option<i64> = self
            .release
            .key(&lease.key)
            .arg(encode_value(lease))
            .invoke_async(&mut conn)
            .await
            .map_err(LockError::redis("release lock"))?;

        if confirmed(reply) {
            log::info!("[RELEASE] Released lock - key: {}", lease.key);
            return Ok(true);
        }
        Ok(false)
    }
}
