//! Scripted in-memory warehouse for tests.
//!
//! Every connection handed out by a [`FakeWarehouse`] shares one state: the
//! log of executed statements, scripted failures and scripted query statuses.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::connection::{ConnectionFactory, QueryOptions, QueryResult, WarehouseConnection};
use crate::error::DriverError;

#[derive(Debug, Default)]
struct FakeState {
    statements: Vec<String>,
    failures: Vec<(String, DriverError)>,
    statuses: HashMap<String, VecDeque<String>>,
    connect_failures: VecDeque<DriverError>,
    invalid: bool,
    invalid_once: u32,
    close_failures: VecDeque<DriverError>,
}

/// Shared handle over the scripted warehouse.
#[derive(Debug, Clone, Default)]
pub struct FakeWarehouse {
    state: Arc<Mutex<FakeState>>,
    next_query_id: Arc<AtomicU32>,
    connects: Arc<AtomicU32>,
    closes: Arc<AtomicU32>,
}

impl FakeWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A connection bound to this warehouse.
    pub fn connection(&self) -> FakeConnection {
        FakeConnection {
            warehouse: self.clone(),
        }
    }

    /// Factory producing connections bound to this warehouse.
    pub fn factory(&self) -> Arc<dyn ConnectionFactory> {
        Arc::new(self.clone())
    }

    /// The next statement containing `pattern` fails with `error`. Scripting
    /// the same pattern twice fails the next two matching statements.
    pub fn fail_when(&self, pattern: impl Into<String>, error: DriverError) {
        self.state().failures.push((pattern.into(), error));
    }

    /// Statuses returned for `query_id`, in order; the last one repeats.
    pub fn script_status<I, S>(&self, query_id: &str, statuses: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state()
            .statuses
            .insert(query_id.to_string(), statuses.into_iter().map(Into::into).collect());
    }

    pub fn fail_next_connect(&self, error: DriverError) {
        self.state().connect_failures.push_back(error);
    }

    pub fn fail_next_close(&self, error: DriverError) {
        self.state().close_failures.push_back(error);
    }

    /// Every connection fails its health check from now on.
    pub fn set_invalid(&self, invalid: bool) {
        self.state().invalid = invalid;
    }

    /// The next `n` health checks fail.
    pub fn invalidate_next(&self, n: u32) {
        self.state().invalid_once = n;
    }

    pub fn statements(&self) -> Vec<String> {
        self.state().statements.clone()
    }

    pub fn statements_matching(&self, pattern: &str) -> Vec<String> {
        self.state()
            .statements
            .iter()
            .filter(|s| s.contains(pattern))
            .cloned()
            .collect()
    }

    /// Query ids handed out so far, as `q-1`, `q-2`, ...
    pub fn issued_query_ids(&self) -> u32 {
        self.next_query_id.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for FakeWarehouse {
    async fn connect(&self) -> Result<Box<dyn WarehouseConnection>, DriverError> {
        if let Some(err) = self.state().connect_failures.pop_front() {
            return Err(err);
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.connection()))
    }
}

/// One session against a [`FakeWarehouse`].
#[derive(Debug, Clone)]
pub struct FakeConnection {
    warehouse: FakeWarehouse,
}

#[async_trait]
impl WarehouseConnection for FakeConnection {
    async fn run_query(&self, sql: &str, options: QueryOptions) -> Result<QueryResult, DriverError> {
        {
            let mut state = self.warehouse.state();
            state.statements.push(sql.to_string());
            if let Some(pos) = state.failures.iter().position(|(p, _)| sql.contains(p.as_str())) {
                let (_, err) = state.failures.remove(pos);
                return Err(err);
            }
        }

        if sql.starts_with("USE ") || !options.return_query_id {
            return Ok(QueryResult::default());
        }

        let n = self.warehouse.next_query_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(QueryResult {
            query_id: Some(format!("q-{n}")),
            rows: Vec::new(),
        })
    }

    async fn is_valid(&self) -> Result<bool, DriverError> {
        let mut state = self.warehouse.state();
        if state.invalid_once > 0 {
            state.invalid_once -= 1;
            return Ok(false);
        }
        Ok(!state.invalid)
    }

    async fn close(&self) -> Result<(), DriverError> {
        if let Some(err) = self.warehouse.state().close_failures.pop_front() {
            return Err(err);
        }
        self.warehouse.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn query_status(&self, query_id: &str) -> Result<String, DriverError> {
        let mut state = self.warehouse.state();
        match state.statuses.get_mut(query_id) {
            Some(queue) if queue.len() > 1 => Ok(queue.pop_front().unwrap_or_default()),
            Some(queue) => Ok(queue.front().cloned().unwrap_or_default()),
            None => Ok("SUCCESS".to_string()),
        }
    }
}
