//! Health probes shared by the HTTP server, the embedding worker, and the
//! `chessmate health` CLI command: one probe per dependency, aggregated
//! into a single summary status.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::vector_store::VectorStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Ok,
    Degraded,
    Error,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct Probe {
    pub name: String,
    pub status: ProbeStatus,
    pub required: bool,
    pub latency_ms: Option<u64>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: ProbeStatus,
    pub probes: Vec<Probe>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == ProbeStatus::Ok
    }
}

pub struct HealthChecker {
    pub pool: Option<sqlx::PgPool>,
    pub vectors: Option<Arc<dyn VectorStore>>,
    pub cache_ping: Option<Arc<dyn Fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send>> + Send + Sync>>,
    pub embedding_probe: Option<Arc<dyn Fn() -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send>> + Send + Sync>>,
    pub probe_timeout: Duration,
}

impl HealthChecker {
    pub async fn check(&self) -> HealthReport {
        let mut probes = Vec::new();

        if let Some(pool) = &self.pool {
            probes.push(self.run_probe("relational_store", true, async {
                match tokio::time::timeout(self.probe_timeout, sqlx::query("SELECT 1").execute(pool))
                    .await
                {
                    Ok(Ok(_)) => Ok(None),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err("timed out".to_string()),
                }
            }).await);
        } else {
            probes.push(Probe {
                name: "relational_store".to_string(),
                status: ProbeStatus::Skipped,
                required: true,
                latency_ms: None,
                detail: None,
            });
        }

        if let Some(vectors) = &self.vectors {
            probes.push(
                self.run_probe("vector_store", true, async {
                    match tokio::time::timeout(self.probe_timeout, vectors.health()).await {
                        Ok(Ok(())) => Ok(None),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err("timed out".to_string()),
                    }
                })
                .await,
            );
        }

        if let Some(ping) = &self.cache_ping {
            probes.push(
                self.run_probe("agent_cache", false, async {
                    match tokio::time::timeout(self.probe_timeout, ping()).await {
                        Ok(Ok(())) => Ok(None),
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err("timed out".to_string()),
                    }
                })
                .await,
            );
        } else {
            probes.push(Probe {
                name: "agent_cache".to_string(),
                status: ProbeStatus::Skipped,
                required: false,
                latency_ms: None,
                detail: Some("redis not configured, using in-process cache".to_string()),
            });
        }

        if let Some(probe) = &self.embedding_probe {
            probes.push(
                self.run_probe("embedding_service", false, async {
                    match tokio::time::timeout(self.probe_timeout, probe()).await {
                        Ok(Ok(())) => Ok(None),
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err("timed out".to_string()),
                    }
                })
                .await,
            );
        } else {
            probes.push(Probe {
                name: "embedding_service".to_string(),
                status: ProbeStatus::Skipped,
                required: false,
                latency_ms: None,
                detail: Some("embedding provider disabled".to_string()),
            });
        }

        let status = aggregate(&probes);
        HealthReport { status, probes }
    }

    async fn run_probe<F>(&self, name: &str, required: bool, fut: F) -> Probe
    where
        F: std::future::Future<Output = Result<Option<String>, String>>,
    {
        let started = std::time::Instant::now();
        let result = fut.await;
        let latency_ms = Some(started.elapsed().as_millis() as u64);
        match result {
            Ok(detail) => Probe {
                name: name.to_string(),
                status: ProbeStatus::Ok,
                required,
                latency_ms,
                detail,
            },
            Err(e) => Probe {
                name: name.to_string(),
                status: if required {
                    ProbeStatus::Error
                } else {
                    ProbeStatus::Degraded
                },
                required,
                latency_ms,
                detail: Some(crate::sanitize::sanitize(&e)),
            },
        }
    }
}

/// A required probe in `error` makes the whole report `error`; any
/// non-ok, non-skipped probe otherwise makes it `degraded`; all
/// ok/skipped is `ok`.
fn aggregate(probes: &[Probe]) -> ProbeStatus {
    let has_required_error = probes
        .iter()
        .any(|p| p.required && p.status == ProbeStatus::Error);
    if has_required_error {
        return ProbeStatus::Error;
    }
    let has_degraded = probes
        .iter()
        .any(|p| matches!(p.status, ProbeStatus::Error | ProbeStatus::Degraded));
    if has_degraded {
        ProbeStatus::Degraded
    } else {
        ProbeStatus::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(status: ProbeStatus, required: bool) -> Probe {
        Probe {
            name: "x".to_string(),
            status,
            required,
            latency_ms: None,
            detail: None,
        }
    }

    #[test]
    fn all_ok_aggregates_to_ok() {
        let probes = vec![probe(ProbeStatus::Ok, true), probe(ProbeStatus::Skipped, false)];
        assert_eq!(aggregate(&probes), ProbeStatus::Ok);
    }

    #[test]
    fn optional_error_aggregates_to_degraded() {
        let probes = vec![probe(ProbeStatus::Ok, true), probe(ProbeStatus::Error, false)];
        assert_eq!(aggregate(&probes), ProbeStatus::Degraded);
    }

    #[test]
    fn required_error_aggregates_to_error() {
        let probes = vec![probe(ProbeStatus::Error, true), probe(ProbeStatus::Ok, false)];
        assert_eq!(aggregate(&probes), ProbeStatus::Error);
    }
}
