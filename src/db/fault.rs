//! Fault-injecting driver wrapper.
//!
//! [`FaultDriver`] forwards every call to an inner driver unless a failure
//! has been queued for that kind of call, and records the calls it sees.
//! It exercises the reconnect and transaction policies against a real
//! engine without needing a server that can be taken down on demand.

use super::{Dialect, Driver, DriverError, ErrorCode, ResultSet};
use crate::config::DbConfig;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// A queued failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Injected {
    /// Transient failure.
    Down,
    /// Transient failure reported by a read-only server.
    ReadOnly,
    /// Permanent failure.
    Fail,
}

impl Injected {
    fn into_error(self, code: ErrorCode) -> DriverError {
        match self {
            Self::Down => DriverError::down(code, "injected: database is down"),
            Self::ReadOnly => DriverError::down(
                ErrorCode::ReadOnly,
                "injected: cannot execute statement in a read-only transaction",
            ),
            Self::Fail => DriverError::fail(code, "injected: statement failed"),
        }
    }
}

/// A call seen by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// `connect`.
    Connect,
    /// `close`.
    Close,
    /// `execute` with its statement.
    Execute(String),
    /// `select` with its statement.
    Select(String),
    /// `begin`.
    Begin,
    /// `commit`.
    Commit,
    /// `rollback`.
    Rollback,
}

#[derive(Debug, Default)]
struct FaultState {
    connect: VecDeque<Injected>,
    statement: VecDeque<Injected>,
    begin: VecDeque<Injected>,
    commit: VecDeque<Injected>,
    rollback: VecDeque<Injected>,
    calls: Vec<Call>,
    connect_attempts: usize,
}

/// Recovers the state of a poisoned lock.
fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("fault state mutex was poisoned, recovering");
            poisoned.into_inner()
        },
    }
}

/// Shared control over a [`FaultDriver`] after it has been boxed.
#[derive(Debug, Clone, Default)]
pub struct FaultHandle {
    state: Arc<Mutex<FaultState>>,
}

impl FaultHandle {
    /// Fails the next `connect`.
    pub fn push_connect(&self, fault: Injected) {
        acquire_lock(&self.state).connect.push_back(fault);
    }

    /// Fails the next `execute` or `select`.
    pub fn push_statement(&self, fault: Injected) {
        acquire_lock(&self.state).statement.push_back(fault);
    }

    /// Fails the next `begin`.
    pub fn push_begin(&self, fault: Injected) {
        acquire_lock(&self.state).begin.push_back(fault);
    }

    /// Fails the next `commit`.
    pub fn push_commit(&self, fault: Injected) {
        acquire_lock(&self.state).commit.push_back(fault);
    }

    /// Fails the next `rollback`.
    pub fn push_rollback(&self, fault: Injected) {
        acquire_lock(&self.state).rollback.push_back(fault);
    }

    /// Returns the number of `connect` calls, failed ones included.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        acquire_lock(&self.state).connect_attempts
    }

    /// Returns every call seen so far.
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        acquire_lock(&self.state).calls.clone()
    }

    /// Returns `true` if `call` was seen.
    #[must_use]
    pub fn saw(&self, call: &Call) -> bool {
        acquire_lock(&self.state).calls.contains(call)
    }

    /// Forgets recorded calls.
    pub fn clear_calls(&self) {
        acquire_lock(&self.state).calls.clear();
    }
}

/// Driver wrapper that injects queued failures.
#[derive(Debug)]
pub struct FaultDriver<D> {
    inner: D,
    handle: FaultHandle,
}

impl<D: Driver> FaultDriver<D> {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            handle: FaultHandle::default(),
        }
    }

    /// Returns a handle sharing this driver's fault queues.
    #[must_use]
    pub fn handle(&self) -> FaultHandle {
        self.handle.clone()
    }

    fn take(&self, call: Call, queue: fn(&mut FaultState) -> &mut VecDeque<Injected>) -> Option<Injected> {
        let mut state = acquire_lock(&self.handle.state);
        state.calls.push(call);
        queue(&mut state).pop_front()
    }
}

impl<D: Driver> Driver for FaultDriver<D> {
    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }

    fn connect(&mut self, config: &DbConfig) -> Result<(), DriverError> {
        acquire_lock(&self.handle.state).connect_attempts += 1;
        if let Some(fault) = self.take(Call::Connect, |s| &mut s.connect) {
            return Err(fault.into_error(ErrorCode::Connect));
        }
        self.inner.connect(config)
    }

    fn close(&mut self) {
        acquire_lock(&self.handle.state).calls.push(Call::Close);
        self.inner.close();
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn execute(&mut self, sql: &str) -> Result<u64, DriverError> {
        if let Some(fault) = self.take(Call::Execute(sql.to_string()), |s| &mut s.statement) {
            return Err(fault.into_error(ErrorCode::Execute));
        }
        self.inner.execute(sql)
    }

    fn select(&mut self, sql: &str) -> Result<ResultSet, DriverError> {
        if let Some(fault) = self.take(Call::Select(sql.to_string()), |s| &mut s.statement) {
            return Err(fault.into_error(ErrorCode::Select));
        }
        self.inner.select(sql)
    }

    fn begin(&mut self) -> Result<(), DriverError> {
        if let Some(fault) = self.take(Call::Begin, |s| &mut s.begin) {
            return Err(fault.into_error(ErrorCode::Transaction));
        }
        self.inner.begin()
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        if let Some(fault) = self.take(Call::Commit, |s| &mut s.commit) {
            // A failed commit leaves the server-side transaction open.
            return Err(fault.into_error(ErrorCode::Transaction));
        }
        self.inner.commit()
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        if let Some(fault) = self.take(Call::Rollback, |s| &mut s.rollback) {
            return Err(fault.into_error(ErrorCode::Transaction));
        }
        self.inner.rollback()
    }
}
