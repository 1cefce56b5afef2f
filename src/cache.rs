use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use deadpool_redis::{redis, Config, Pool, PoolConfig, Runtime};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

// IP 标签：未知 / 保留地址 / 区域 0 起。区域 i 的标签为 IP_REGION0 + i。
pub const IP_UNKNOWN: u8 = 0;
pub const IP_PRIVATE: u8 = 1;
pub const IP_REGION0: u8 = 2;

/// 决策标签。0 为未决策；d >= 1 指向上游表第 d-1 项（1 即兜底上游）。
/// 区域决策与 IP 标签数值相等，互转为恒等映射。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision(pub u8);

impl Decision {
    pub const NONE: Decision = Decision(0);
    pub const FALLBACK: Decision = Decision(1);

    pub fn from_upstream_index(i: usize) -> Decision {
        Decision(i as u8 + 1)
    }

    /// 区域 IP 标签对应的区域决策；非区域标签不在此映射内。
    pub fn from_ip_tag(tag: u8) -> Decision {
        debug_assert!(tag >= IP_REGION0);
        Decision(tag)
    }

    pub fn upstream_index(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0 as usize - 1)
        }
    }

    /// 区域决策期望的 IP 标签；兜底与未决策没有期望区域。
    pub fn ip_tag(self) -> Option<u8> {
        if self.0 >= IP_REGION0 {
            Some(self.0)
        } else {
            None
        }
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// 决策缓存的能力集。get 从不失败：未命中、过期、后端出错一律 NONE。
#[async_trait]
pub trait DecisionCache: Send + Sync {
    /// 记录决策。调用方以后台任务投递，不等待完成；错误只记日志。
    async fn set(&self, name: &str, d: Decision, ttl: Duration);
    async fn get(&self, name: &str) -> Decision;
    /// 一行摘要：后端名与条目数。
    async fn info(&self) -> String;
    async fn close(&self);
}

/// 无地址时用进程内缓存；注意该后端忽略 TTL，条目随进程存亡。
pub fn new_cache(
    network: &str,
    address: Option<&str>,
    index: i64,
) -> Result<Arc<dyn DecisionCache>> {
    match address {
        None | Some("") => Ok(Arc::new(MemoryCache::new())),
        Some(addr) => Ok(Arc::new(RedisCache::new(network, addr, index)?)),
    }
}

#[derive(Default)]
pub struct MemoryCache {
    map: RwLock<FxHashMap<String, Decision>>,
}

impl MemoryCache {
    pub fn new() -> MemoryCache {
        MemoryCache::default()
    }
}

#[async_trait]
impl DecisionCache for MemoryCache {
    async fn set(&self, name: &str, d: Decision, _ttl: Duration) {
        let mut map = self.map.write().expect("decision map poisoned");
        map.insert(name.to_string(), d);
    }

    async fn get(&self, name: &str) -> Decision {
        let map = self.map.read().expect("decision map poisoned");
        map.get(name).copied().unwrap_or(Decision::NONE)
    }

    async fn info(&self) -> String {
        let map = self.map.read().expect("decision map poisoned");
        format!("map: {} entries", map.len())
    }

    async fn close(&self) {}
}

pub struct RedisCache {
    pool: Pool,
}

impl RedisCache {
    pub fn new(network: &str, address: &str, index: i64) -> Result<RedisCache> {
        let url = match network {
            "unix" => format!("redis+unix://{address}?db={index}"),
            _ => {
                // 允许 ":6379" 这种只给端口的写法
                let addr = if address.starts_with(':') {
                    format!("127.0.0.1{address}")
                } else {
                    address.to_string()
                };
                format!("redis://{addr}/{index}")
            }
        };
        let mut cfg = Config::from_url(url);
        cfg.pool = Some(PoolConfig::new(2));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .context("create redis pool")?;
        Ok(RedisCache { pool })
    }
}

#[async_trait]
impl DecisionCache for RedisCache {
    async fn set(&self, name: &str, d: Decision, ttl: Duration) {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(name = %name, error = %err, "redis checkout failed, decision not saved");
                return;
            }
        };
        let secs = ttl.as_secs().max(1);
        if let Err(err) = redis::cmd("SETEX")
            .arg(name)
            .arg(secs)
            .arg(d.0 as i64)
            .query_async::<_, ()>(&mut conn)
            .await
        {
            warn!(name = %name, error = %err, "failed to save decision");
        }
    }

    async fn get(&self, name: &str) -> Decision {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(name = %name, error = %err, "redis checkout failed");
                return Decision::NONE;
            }
        };
        match redis::cmd("GET")
            .arg(name)
            .query_async::<_, Option<i64>>(&mut conn)
            .await
        {
            Ok(Some(v)) if (0..=u8::MAX as i64).contains(&v) => Decision(v as u8),
            Ok(Some(v)) => {
                warn!(name = %name, value = v, "unexpected decision value in cache");
                Decision::NONE
            }
            Ok(None) => {
                debug!(name = %name, "cache miss");
                Decision::NONE
            }
            Err(err) => {
                warn!(name = %name, error = %err, "failed to read decision");
                Decision::NONE
            }
        }
    }

    async fn info(&self) -> String {
        let mut conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(_) => return "redis: error".to_string(),
        };
        match redis::cmd("DBSIZE").query_async::<_, i64>(&mut conn).await {
            Ok(n) => format!("redis: {n} entries"),
            Err(err) => {
                warn!(error = %err, "redis dbsize failed");
                "redis: error".to_string()
            }
        }
    }

    async fn close(&self) {
        self.pool.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_upstream_mapping() {
        assert_eq!(Decision::NONE.upstream_index(), None);
        assert_eq!(Decision::FALLBACK.upstream_index(), Some(0));
        assert_eq!(Decision::from_upstream_index(2), Decision(3));
        assert_eq!(Decision(3).upstream_index(), Some(2));
    }

    #[test]
    fn decision_ip_tag_bijection() {
        // 区域决策与区域 IP 标签数值重合
        for tag in IP_REGION0..=5 {
            let d = Decision::from_ip_tag(tag);
            assert_eq!(d.ip_tag(), Some(tag));
        }
        assert_eq!(Decision::NONE.ip_tag(), None);
        assert_eq!(Decision::FALLBACK.ip_tag(), None);
    }

    #[tokio::test]
    async fn memory_cache_round_trip() {
        let c = MemoryCache::new();
        assert_eq!(c.get("www.example.com.").await, Decision::NONE);

        c.set("www.example.com.", Decision(2), Duration::from_secs(1))
            .await;
        assert_eq!(c.get("www.example.com.").await, Decision(2));

        // 覆盖写以后写为准
        c.set("www.example.com.", Decision::FALLBACK, Duration::ZERO)
            .await;
        assert_eq!(c.get("www.example.com.").await, Decision::FALLBACK);

        assert_eq!(c.info().await, "map: 1 entries");
    }

    #[tokio::test]
    async fn memory_cache_keys_keep_case() {
        let c = MemoryCache::new();
        c.set("WWW.Example.COM.", Decision(2), Duration::ZERO).await;
        assert_eq!(c.get("WWW.Example.COM.").await, Decision(2));
        assert_eq!(c.get("www.example.com.").await, Decision::NONE);
    }
}
