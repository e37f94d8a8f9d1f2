//! 各存储共用的锁语义测试场景

#![allow(dead_code)]

use dblock::{LimitRetry, LinearBackoff, LockError, Locker, ObtainOptions};
use std::time::Duration;
use tokio::time::sleep;

pub fn unique_key(prefix: &str) -> String {
    format!("{}-{}", prefix, dblock::token::random_token())
}

/// 获取, 查询剩余时间, 续期, 释放, 再由他人获取
pub async fn obtain_refresh_release(locker: &Locker) {
    let key = unique_key("scenario");
    let mut lock = locker
        .obtain(&key, Duration::from_millis(300), ObtainOptions::new().with_token("T1"))
        .await
        .unwrap();
    assert_eq!(lock.token(), "T1");

    sleep(Duration::from_millis(50)).await;
    let ttl = lock.ttl().await.unwrap();
    assert!(ttl > Duration::ZERO, "ttl: {:?}", ttl);
    assert!(ttl <= Duration::from_millis(250), "ttl: {:?}", ttl);

    lock.refresh(Duration::from_millis(300)).await.unwrap();
    let ttl = lock.ttl().await.unwrap();
    assert!(ttl > Duration::from_millis(250), "ttl: {:?}", ttl);
    assert!(ttl <= Duration::from_millis(300), "ttl: {:?}", ttl);

    lock.release().await.unwrap();

    let other = locker
        .obtain(&key, Duration::from_millis(100), ObtainOptions::new().with_token("T2"))
        .await
        .unwrap();
    assert_eq!(other.token(), "T2");
}

/// 不调用 release, 过期后其他 token 可以获取
pub async fn expiry_enables_reacquire(locker: &Locker) {
    let key = unique_key("expiry");
    let mut first = locker
        .obtain(&key, Duration::from_millis(50), ObtainOptions::new())
        .await
        .unwrap();

    let err = locker
        .obtain(&key, Duration::from_millis(50), ObtainOptions::new())
        .await
        .unwrap_err();
    assert!(err.is_not_obtained(), "{err}");

    sleep(Duration::from_millis(70)).await;
    assert_eq!(first.ttl().await.unwrap(), Duration::ZERO);

    let second = locker
        .obtain(&key, Duration::from_secs(1), ObtainOptions::new())
        .await
        .unwrap();
    assert_ne!(first.token(), second.token());
}

/// token 不匹配时续期和释放失败, 且不改变当前持有者
pub async fn token_gated_refresh_release(locker: &Locker) {
    let key = unique_key("gated");
    let mut stale = locker
        .obtain(&key, Duration::from_millis(30), ObtainOptions::new().with_meta("a"))
        .await
        .unwrap();
    sleep(Duration::from_millis(50)).await;

    let current = locker
        .obtain(&key, Duration::from_secs(5), ObtainOptions::new().with_meta("b"))
        .await
        .unwrap();
    let before = locker.view(&key).await.unwrap();

    let err = stale.refresh(Duration::from_secs(10)).await.unwrap_err();
    assert!(matches!(err, LockError::NotObtained), "{err}");
    let err = stale.release().await.unwrap_err();
    assert!(matches!(err, LockError::LockNotHeld), "{err}");
    assert_eq!(stale.ttl().await.unwrap(), Duration::ZERO);

    let after = locker.view(&key).await.unwrap();
    assert!(after.token.starts_with(current.token()));
    assert_eq!(before.token, after.token);
    assert_eq!(before.until, after.until);
}

/// 同一个 token 再次获取会成功并延长过期时间
pub async fn idempotent_reacquire(locker: &Locker) {
    let key = unique_key("reentrant");
    let first = locker
        .obtain(&key, Duration::from_millis(200), ObtainOptions::new().with_token("same"))
        .await
        .unwrap();
    let mut again = locker
        .obtain(&key, Duration::from_secs(5), ObtainOptions::new().with_token("same"))
        .await
        .unwrap();
    assert!(again.until() > first.until());

    let ttl = again.ttl().await.unwrap();
    assert!(ttl > Duration::from_secs(4), "ttl: {:?}", ttl);
    again.refresh(Duration::from_secs(5)).await.unwrap();
}

/// 并发获取同一个锁, 至多一个成功
pub async fn mutual_exclusion(locker: &Locker) {
    let key = unique_key("exclusive");
    let mut handles = Vec::new();
    for _ in 0..8 {
        let locker = locker.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            locker
                .obtain(&key, Duration::from_secs(5), ObtainOptions::new())
                .await
        }));
    }

    let mut obtained = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => obtained += 1,
            Err(e) => assert!(e.is_not_obtained(), "{e}"),
        }
    }
    assert_eq!(obtained, 1);
}

/// 持有者不释放时, 重试耗尽返回 NotObtained
pub async fn retry_exhausted(locker: &Locker) {
    let key = unique_key("retry");
    let _holder = locker
        .obtain(&key, Duration::from_secs(5), ObtainOptions::new())
        .await
        .unwrap();

    let options = ObtainOptions::new()
        .with_retry_strategy(LimitRetry::new(LinearBackoff(Duration::from_millis(100)), 3));
    let err = locker
        .obtain(&key, Duration::from_secs(1), options)
        .await
        .unwrap_err();
    assert!(err.is_not_obtained(), "{err}");
}

/// 持有者中途释放, 重试中的调用方随后获取成功
pub async fn retry_succeeds_after_release(locker: &Locker) {
    let key = unique_key("handoff");
    let holder = locker
        .obtain(&key, Duration::from_secs(5), ObtainOptions::new())
        .await
        .unwrap();

    let waiter = {
        let locker = locker.clone();
        let key = key.clone();
        tokio::spawn(async move {
            let options = ObtainOptions::new()
                .with_retry_strategy(LimitRetry::new(LinearBackoff(Duration::from_millis(100)), 3));
            locker.obtain(&key, Duration::from_secs(1), options).await
        })
    };

    sleep(Duration::from_millis(150)).await;
    holder.release().await.unwrap();

    let lock = waiter.await.unwrap().unwrap();
    assert_ne!(lock.token(), holder.token());
}

/// 连续查看返回完全相同的结果
pub async fn view_is_read_only(locker: &Locker) {
    let key = unique_key("view");
    locker
        .obtain(&key, Duration::from_secs(60), ObtainOptions::new().with_meta("m"))
        .await
        .unwrap();
    assert!(locker.view(&unique_key("missing")).await.unwrap().is_empty());

    let first = locker.view(&key).await.unwrap();
    let second = locker.view(&key).await.unwrap();
    assert!(!first.is_empty());
    assert_eq!(first.token, second.token);
    assert_eq!(first.metadata, second.metadata);
    assert_eq!(first.until, second.until);
    assert_eq!(first.locked_at, second.locked_at);
}
