//! Agent evaluation cache: keyed on `(plan_digest, game_id)`, fronting the
//! LLM call so repeated questions against a stable corpus are cheap.

use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::AppError;
use crate::models::AgentEvaluation;

#[async_trait]
pub trait AgentCache: Send + Sync {
    async fn get_many(&self, keys: &[String]) -> Vec<Option<AgentEvaluation>>;
    async fn put_many(&self, items: Vec<(String, AgentEvaluation)>);
}

pub fn cache_key(namespace: &str, plan_digest: &str, game_id: i64) -> String {
    format!("{namespace}:{plan_digest}:{game_id}")
}

struct Entry {
    value: AgentEvaluation,
    expires_at: Instant,
}

/// A bounded in-memory LRU cache with O(1) get/put, matching the
/// in-process cache contract described in `spec.md` §4.C.
pub struct InMemoryAgentCache {
    inner: Mutex<LruCache<String, Entry>>,
    ttl: Duration,
}

impl InMemoryAgentCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
            ttl,
        }
    }
}

#[async_trait]
impl AgentCache for InMemoryAgentCache {
    async fn get_many(&self, keys: &[String]) -> Vec<Option<AgentEvaluation>> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        keys.iter()
            .map(|k| {
                inner.get(k).and_then(|entry| {
                    if entry.expires_at > now {
                        Some(entry.value.clone())
                    } else {
                        None
                    }
                })
            })
            .collect()
    }

    async fn put_many(&self, items: Vec<(String, AgentEvaluation)>) {
        let mut inner = self.inner.lock().unwrap();
        let expires_at = Instant::now() + self.ttl;
        for (key, value) in items {
            inner.put(key, Entry { value, expires_at });
        }
    }
}

/// Redis-backed cache for multi-process deployments. JSON-encodes
/// [`AgentEvaluation`] values with a Redis `EX` TTL.
pub struct RedisAgentCache {
    manager: redis::aio::ConnectionManager,
    ttl_seconds: u64,
}

impl RedisAgentCache {
    pub async fn connect(redis_url: &str, ttl: Duration) -> Result<Self, AppError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))?;
        Ok(Self {
            manager,
            ttl_seconds: ttl.as_secs().max(1),
        })
    }

    pub async fn ping(&self) -> Result<(), AppError> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| AppError::UpstreamUnavailable(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl AgentCache for RedisAgentCache {
    async fn get_many(&self, keys: &[String]) -> Vec<Option<AgentEvaluation>> {
        if keys.is_empty() {
            return Vec::new();
        }
        let mut conn = self.manager.clone();
        use redis::AsyncCommands;
        let raw: Vec<Option<String>> = match conn.mget(keys).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "agent cache get_many failed");
                vec![None; keys.len()]
            }
        };
        raw.into_iter()
            .map(|opt| opt.and_then(|s| serde_json::from_str(&s).ok()))
            .collect()
    }

    async fn put_many(&self, items: Vec<(String, AgentEvaluation)>) {
        if items.is_empty() {
            return;
        }
        let mut conn = self.manager.clone();
        use redis::AsyncCommands;
        for (key, value) in items {
            let Ok(encoded) = serde_json::to_string(&SerializableEvaluation::from(&value)) else {
                continue;
            };
            let _: Result<(), _> = conn.set_ex(key, encoded, self.ttl_seconds).await;
        }
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct SerializableEvaluation {
    game_id: i64,
    score: f64,
    explanation: Option<String>,
    themes: Vec<String>,
}

impl From<&AgentEvaluation> for SerializableEvaluation {
    fn from(e: &AgentEvaluation) -> Self {
        Self {
            game_id: e.game_id,
            score: e.score,
            explanation: e.explanation.clone(),
            themes: e.themes.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(game_id: i64, score: f64) -> AgentEvaluation {
        AgentEvaluation {
            game_id,
            score,
            explanation: None,
            themes: vec![],
        }
    }

    #[tokio::test]
    async fn stores_and_retrieves() {
        let cache = InMemoryAgentCache::new(10, Duration::from_secs(60));
        cache
            .put_many(vec![("k1".to_string(), eval(1, 0.5))])
            .await;
        let got = cache.get_many(&["k1".to_string(), "missing".to_string()]).await;
        assert!(got[0].is_some());
        assert_eq!(got[0].as_ref().unwrap().score, 0.5);
        assert!(got[1].is_none());
    }

    #[tokio::test]
    async fn expires_after_ttl() {
        let cache = InMemoryAgentCache::new(10, Duration::from_millis(10));
        cache
            .put_many(vec![("k1".to_string(), eval(1, 0.5))])
            .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let got = cache.get_many(&["k1".to_string()]).await;
        assert!(got[0].is_none());
    }

    #[test]
    fn cache_key_format() {
        assert_eq!(cache_key("agent", "abc123", 7), "agent:abc123:7");
    }
}
