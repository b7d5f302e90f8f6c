//! Scripted transport and fixtures shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{Result, SessionError};
use crate::transport::{ApiRequest, ApiResponse, Transport};

#[derive(Debug, Clone)]
enum Reply {
    Json(u16, Value),
    Offline,
}

/// Transport answering from per-path scripts and recording what was sent.
#[derive(Debug, Default)]
pub struct MockTransport {
    once: Mutex<HashMap<String, VecDeque<Reply>>>,
    always: Mutex<HashMap<String, Reply>>,
    sent: Mutex<Vec<ApiRequest>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queues a one-shot reply for `path`.
    pub fn reply(&self, path: &str, status: u16, body: Value) {
        self.once
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(path.to_string())
            .or_default()
            .push_back(Reply::Json(status, body));
    }

    /// Sets the reply used for `path` once its one-shot replies run out.
    pub fn reply_always(&self, path: &str, status: u16, body: Value) {
        self.always
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string(), Reply::Json(status, body));
    }

    /// Makes every call to `path` fail at the transport level.
    pub fn go_offline(&self, path: &str) {
        self.always
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string(), Reply::Offline);
    }

    pub fn sent(&self) -> Vec<ApiRequest> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn sent_paths(&self) -> Vec<String> {
        self.sent().into_iter().map(|r| r.path).collect()
    }

    pub fn count(&self, path: &str) -> usize {
        self.sent().iter().filter(|r| r.path == path).count()
    }

    fn next_reply(&self, path: &str) -> Option<Reply> {
        let scripted = self
            .once
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(path)
            .and_then(VecDeque::pop_front);
        scripted.or_else(|| {
            self.always
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(path)
                .cloned()
        })
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        match self.next_reply(&request.path) {
            Some(Reply::Json(status, body)) => Ok(ApiResponse::new(status, body)),
            Some(Reply::Offline) => Err(SessionError::network("connection refused")),
            None => Ok(ApiResponse::new(404, json!({"message": "not mocked"}))),
        }
    }
}
