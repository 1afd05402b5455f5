//! In-memory [`Transport`] for tests.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::{CensusError, Transport};

type Handler =
    dyn Fn(&str, &[(String, String)]) -> Result<serde_json::Value, CensusError> + Send + Sync;

/// A recorded request: `(url, query parameters)`.
pub type Call = (String, Vec<(String, String)>);

/// Answers requests with a closure and records every call.
pub struct MockTransport {
    handler: Box<Handler>,
    calls: Mutex<Vec<Call>>,
}

impl MockTransport {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str, &[(String, String)]) -> Result<serde_json::Value, CensusError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn get_json(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<serde_json::Value, CensusError> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), query.to_vec()));
        (self.handler)(url, query)
    }
}

/// Returns the value of a query parameter.
pub fn param<'a>(query: &'a [(String, String)], name: &str) -> Option<&'a str> {
    query
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

/// Returns every value of a repeated query parameter.
pub fn params<'a>(query: &'a [(String, String)], name: &str) -> Vec<&'a str> {
    query
        .iter()
        .filter(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
        .collect()
}
