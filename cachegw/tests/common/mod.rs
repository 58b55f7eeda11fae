// (c) 2025 The cachegw authors

//! Shared fixtures for the integration tests

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cachegw::backend::{Backend, BackendFailure, ByteStream};
use cachegw::Config;

/// In-memory object store standing in for a remote backend.
#[derive(Default)]
pub struct MemoryBackend {
    objects: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    /// When present, every `get` consumes one permit before answering;
    /// tests use this to hold workers in flight.
    pub gate: Option<Arc<tokio::sync::Semaphore>>,
}

impl MemoryBackend {
    pub fn with_object(key: &[u8], value: &[u8]) -> Self {
        let backend = Self::default();
        let _ = backend
            .objects
            .lock()
            .unwrap()
            .insert(key.to_vec(), value.to_vec());
        backend
    }

    pub fn stored(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, key: &[u8]) -> Result<(ByteStream, u64), BackendFailure> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        let data = self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| BackendFailure {
                message: "object not found".into(),
                code: 404,
            })?;
        let size = data.len() as u64;
        Ok((Box::new(std::io::Cursor::new(data)) as ByteStream, size))
    }

    async fn put(
        &self,
        key: &[u8],
        value: &[u8],
        only_if_missing: bool,
    ) -> Result<bool, BackendFailure> {
        let mut objects = self.objects.lock().unwrap();
        if only_if_missing && objects.contains_key(key) {
            return Ok(false);
        }
        let _ = objects.insert(key.to_vec(), value.to_vec());
        Ok(true)
    }

    async fn remove(&self, key: &[u8]) -> Result<bool, BackendFailure> {
        match self.objects.lock().unwrap().remove(key) {
            Some(_) => Ok(true),
            None => Err(BackendFailure {
                message: "object not found".into(),
                code: 404,
            }),
        }
    }
}

/// A config pointing at `socket_path`, tuned for fast tests.
pub fn test_config(socket_path: PathBuf) -> Config {
    Config {
        socket_path,
        buffer_size: 1024,
        remote_url: "http://unused.example.com/".into(),
        attributes: Vec::new(),
        debug: false,
        inactivity_timeout: Duration::from_secs(300),
        max_parallel_clients: 8,
        operation_timeout_ms: 10_000,
    }
}
