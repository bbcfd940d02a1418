// Pulsemeter - Pulse capture and acknowledged upload
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Collector transport abstraction
//!
//! The uploader needs one operation from the network: POST a body to a URL
//! and learn the response status. Anything that prevents a status from
//! arriving is a [`CollectorError`].

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::CollectorError;

/// Trait for the remote collector endpoint
pub trait Collector: Send + Sync {
    /// POST `body` as JSON to `url` and return the HTTP status code
    fn post(
        &self,
        url: &str,
        body: Vec<u8>,
    ) -> impl Future<Output = Result<u16, CollectorError>> + Send;
}

/// HTTP collector backed by `reqwest`
#[cfg(feature = "http")]
#[derive(Debug, Clone)]
pub struct HttpCollector {
    client: reqwest::Client,
    timeout: std::time::Duration,
}

#[cfg(feature = "http")]
impl HttpCollector {
    /// Create a collector whose requests give up after `timeout`
    pub fn new(timeout: std::time::Duration) -> Result<Self, CollectorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CollectorError::Transport(e.to_string()))?;
        Ok(Self { client, timeout })
    }
}

#[cfg(feature = "http")]
impl Collector for HttpCollector {
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<u16, CollectorError> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, crate::payload::CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CollectorError::Timeout {
                        timeout_ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    CollectorError::Transport(e.to_string())
                }
            })?;
        Ok(response.status().as_u16())
    }
}

/// Scripted reply of a [`MemoryCollector`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Answer with this status code
    Status(u16),
    /// Fail before any status arrives
    Unreachable,
}

#[derive(Debug, Default)]
struct MemoryState {
    script: VecDeque<Reply>,
    fallback: Option<Reply>,
    received: Vec<(String, Vec<u8>)>,
}

/// In-process collector for tests and dry runs
///
/// Replies come from a script, then from a fallback (201 unless changed).
/// Every request that reaches it is recorded, including failed ones.
#[derive(Debug, Clone, Default)]
pub struct MemoryCollector {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryCollector {
    /// Collector that accepts everything with 201
    pub fn new() -> Self {
        Self::default()
    }

    /// Collector that always gives the same reply
    pub fn always(reply: Reply) -> Self {
        let collector = Self::new();
        collector.state().fallback = Some(reply);
        collector
    }

    /// Queue a reply for the next request
    pub fn push_reply(&self, reply: Reply) {
        self.state().script.push_back(reply);
    }

    /// Change the reply used once the script is exhausted
    pub fn set_fallback(&self, reply: Reply) {
        self.state().fallback = Some(reply);
    }

    /// All requests so far as `(url, body)`
    pub fn received(&self) -> Vec<(String, Vec<u8>)> {
        self.state().received.clone()
    }

    /// Number of requests so far
    pub fn request_count(&self) -> usize {
        self.state().received.len()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Collector for MemoryCollector {
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<u16, CollectorError> {
        let reply = {
            let mut state = self.state();
            state.received.push((url.to_string(), body));
            state
                .script
                .pop_front()
                .or(state.fallback)
                .unwrap_or(Reply::Status(201))
        };
        match reply {
            Reply::Status(code) => Ok(code),
            Reply::Unreachable => Err(CollectorError::Transport(
                "connection refused".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_collector_default_accepts() {
        let collector = MemoryCollector::new();
        assert_eq!(collector.post("http://c/", b"[]".to_vec()).await.unwrap(), 201);
        assert_eq!(collector.request_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_collector_script_then_fallback() {
        let collector = MemoryCollector::always(Reply::Status(500));
        collector.push_reply(Reply::Unreachable);
        collector.push_reply(Reply::Status(201));

        assert!(collector.post("u", vec![]).await.is_err());
        assert_eq!(collector.post("u", vec![]).await.unwrap(), 201);
        assert_eq!(collector.post("u", vec![]).await.unwrap(), 500);
        assert_eq!(collector.request_count(), 3);
    }

    #[tokio::test]
    async fn test_memory_collector_records_bodies() {
        let collector = MemoryCollector::new();
        collector
            .post("http://collector/api", b"[1]".to_vec())
            .await
            .unwrap();
        let received = collector.received();
        assert_eq!(received[0].0, "http://collector/api");
        assert_eq!(received[0].1, b"[1]");
    }
}
