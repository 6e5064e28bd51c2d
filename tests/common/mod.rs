//! Shared fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use fetchline::transport::{Transport, TransportError, TransportErrorKind};
use fetchline::{Client, ClientBuilder, Request, Response, Result};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Step {
    Status(u16),
    Json(u16, &'static str),
    NetworkError,
}

/// In-process transport that replays a script of outcomes.
///
/// Each dispatch takes the next step; the last step repeats forever. Tracks
/// call count and peak concurrent dispatches.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Step>>,
    delay: Duration,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new(steps: Vec<Step>) -> Self {
        assert!(!steps.is_empty(), "script needs at least one step");
        Self {
            script: Mutex::new(steps.into()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn ok() -> Self {
        Self::new(vec![Step::Json(200, r#"{"ok":true}"#)])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    fn next_step(&self) -> Step {
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script[0].clone()
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn dispatch(&self, request: Request) -> Result<Response> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(request.url.to_string());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        // Decrement even if the future is dropped mid-sleep.
        struct Active<'a>(&'a AtomicUsize);
        impl Drop for Active<'_> {
            fn drop(&mut self) {
                self.0.fetch_sub(1, Ordering::SeqCst);
            }
        }
        let _active = Active(&self.active);

        let step = self.next_step();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let (status, body) = match step {
            Step::NetworkError => {
                return Err(TransportError::new(TransportErrorKind::Network, "connection reset").into())
            }
            Step::Status(s) => (s, ""),
            Step::Json(s, body) => (s, body),
        };
        Ok(Response::new(
            StatusCode::from_u16(status).unwrap(),
            HeaderMap::new(),
            request.url,
            bytes::Bytes::from_static(body.as_bytes()),
        ))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

pub fn builder(transport: Arc<ScriptedTransport>) -> ClientBuilder {
    Client::builder()
        .transport(transport)
        .base_url("https://api.example.com/")
}

pub async fn client(transport: Arc<ScriptedTransport>) -> Client {
    builder(transport).build().await.unwrap()
}

pub const TARGET: &str = "api.example.com:443";
