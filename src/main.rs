use anyhow::{Context, Result};
use clap::Parser;
use dblock::{Config, LimitRetry, LinearBackoff, Lock, LockError, Locker, ObtainOptions};
use log::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // 加载配置
    let config = Config::parse();

    // 初始化日志
    let default_level = if config.debug { "debug" } else { "info" };
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_level));
    info!("Starting dblock with uri: {}, key: {}", config.uri, config.key);

    let locker = Locker::connect(&config)
        .await
        .with_context(|| format!("create lock client for {}", config.uri))?;

    let result = run(&config, &locker).await;
    if let Err(e) = locker.close().await {
        error!("Failed to close lock client: {}", e);
    }
    result
}

async fn run(config: &Config, locker: &Locker) -> Result<()> {
    if config.view {
        let view = locker.view(&config.key).await.context("view lock")?;
        if view.is_empty() {
            info!("[VIEW] No lock found - key: {}", config.key);
        } else {
            info!("[VIEW] {}", view);
        }
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    let Some(mut lock) = obtain(config, locker).await? else {
        return Ok(());
    };

    if config.release {
        match lock.release().await {
            Ok(()) => info!("[RELEASE SUCCESS] Lock released - key: {}", config.key),
            Err(LockError::LockNotHeld) => {
                info!("[RELEASE FAILED] Lock not held - key: {}", config.key)
            }
            Err(e) => return Err(e).context("release lock"),
        }
    } else if config.refresh {
        match lock.refresh(config.ttl).await {
            Ok(()) => info!(
                "[REFRESH SUCCESS] Lock refreshed - key: {}, ttl: {:?}",
                config.key, config.ttl
            ),
            Err(LockError::NotObtained) => {
                info!("[REFRESH FAILED] Lock not obtained - key: {}", config.key)
            }
            Err(e) => return Err(e).context("refresh lock"),
        }
    }
    Ok(())
}

/// 获取锁, 被他人持有时返回 None
async fn obtain(config: &Config, locker: &Locker) -> Result<Option<Lock>> {
    let mut options = ObtainOptions::new()
        .with_token(config.token.as_str())
        .with_meta(config.meta.as_str());
    if let Some(interval) = config.retry_interval {
        options = if config.retry_limit > 0 {
            options.with_retry_strategy(LimitRetry::new(
                LinearBackoff(interval),
                config.retry_limit,
            ))
        } else {
            options.with_retry_strategy(LinearBackoff(interval))
        };
    }

    let mut lock = match locker.obtain(&config.key, config.ttl, options).await {
        Ok(lock) => lock,
        Err(LockError::NotObtained) | Err(LockError::DeadlineExceeded) => {
            info!("[ACQUIRE FAILED] Lock already held - key: {}", config.key);
            return Ok(None);
        }
        Err(e) => return Err(e).context("obtain lock"),
    };

    info!(
        "[ACQUIRE SUCCESS] Lock obtained - key: {}, token: {}, meta: {}",
        lock.key(),
        lock.token(),
        lock.metadata()
    );
    let ttl = lock.ttl().await.context("query lock ttl")?;
    info!("[TTL] key: {}, ttl: {:?}", lock.key(), ttl);
    Ok(Some(lock))
}
