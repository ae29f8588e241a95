//! Query loop driven by socket readiness.
//!
//! A [`Driver`] issues a query and watches the connection's socket. Inside
//! the readiness callback it reaps the result, hands it to a [`ResultSink`],
//! issues the next query and re-watches the same handle. A reply that has
//! only partly arrived is left buffered and the handle is re-watched without
//! a new query. Any failure unwatches the handle and leaves the driver idle;
//! nothing is retried.

use std::cell::RefCell;
use std::fmt;
use std::os::fd::RawFd;
use std::rc::Rc;

use sqlreap_core::error::{ConfigError, StateError, StateErrorKind};
use sqlreap_core::{Error, QueryResult, Result};
use sqlreap_mysql::{MySqlConfig, MySqlConnection};
use sqlreap_reactor::{EventLoop, Handle, Registrar};
use tracing::{debug, error, info, trace};

/// Environment variable holding the SQL text the driver repeats.
pub const QUERY_ENV: &str = "SQLREAP_QUERY";

const DEFAULT_QUERY: &str = "SELECT 1";

/// The non-blocking query surface the driver needs from a connection.
///
/// [`MySqlConnection`] is the production implementation.
pub trait QueryConnection {
    /// Send `sql` without waiting for the reply.
    #[allow(clippy::result_large_err)]
    fn query_async(&mut self, sql: &str) -> Result<()>;

    /// The descriptor that becomes readable when the reply arrives.
    #[allow(clippy::result_large_err)]
    fn socket_handle(&self) -> Result<RawFd>;

    /// Collect the reply of the query in flight.
    #[allow(clippy::result_large_err)]
    fn reap_result(&mut self) -> Result<QueryResult>;

    /// Collect the reply if all of it has arrived, `None` if not.
    ///
    /// The default waits in [`reap_result`](Self::reap_result); connections
    /// that can tell a partial reply apart should never block here.
    #[allow(clippy::result_large_err)]
    fn try_reap(&mut self) -> Result<Option<QueryResult>> {
        self.reap_result().map(Some)
    }

    fn close(&mut self);
}

impl QueryConnection for MySqlConnection {
    fn query_async(&mut self, sql: &str) -> Result<()> {
        MySqlConnection::query_async(self, sql)
    }

    fn socket_handle(&self) -> Result<RawFd> {
        MySqlConnection::socket_handle(self)
    }

    fn reap_result(&mut self) -> Result<QueryResult> {
        MySqlConnection::reap_result(self)
    }

    fn try_reap(&mut self) -> Result<Option<QueryResult>> {
        MySqlConnection::try_reap(self)
    }

    fn close(&mut self) {
        MySqlConnection::close(self);
    }
}

/// Receives every successfully reaped result.
pub trait ResultSink {
    fn on_result(&mut self, result: &QueryResult);
}

impl<F> ResultSink for F
where
    F: FnMut(&QueryResult),
{
    fn on_result(&mut self, result: &QueryResult) {
        self(result);
    }
}

/// Driver lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriverState {
    #[default]
    Idle,
    /// A query is in flight and its socket is watched.
    Polling,
}

/// What the driver issues on every round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    pub query: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            query: DEFAULT_QUERY.to_string(),
        }
    }
}

impl DriverConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the SQL text issued on every round.
    pub fn query(mut self, sql: impl Into<String>) -> Self {
        self.query = sql.into();
        self
    }

    /// Read `SQLREAP_QUERY`, falling back to `SELECT 1` when unset.
    #[allow(clippy::result_large_err)]
    pub fn from_env() -> Result<Self> {
        Self::from_query_var(std::env::var(QUERY_ENV).ok())
    }

    #[allow(clippy::result_large_err)]
    fn from_query_var(raw: Option<String>) -> Result<Self> {
        match raw {
            None => Ok(Self::default()),
            Some(sql) if sql.trim().is_empty() => Err(Error::Config(ConfigError {
                message: format!("{QUERY_ENV} is set but empty"),
                source: None,
            })),
            Some(sql) => Ok(Self::new().query(sql)),
        }
    }
}

struct Shared<C> {
    conn: C,
    sink: Box<dyn ResultSink>,
    sql: String,
    state: DriverState,
    handle: Option<Handle>,
    queries_issued: u64,
    results_reaped: u64,
    last_error: Option<Error>,
}

impl<C: QueryConnection> Shared<C> {
    #[allow(clippy::result_large_err)]
    fn issue(&mut self) -> Result<()> {
        self.conn.query_async(&self.sql)?;
        self.queries_issued += 1;
        trace!(sql = %self.sql, issued = self.queries_issued, "query issued");
        Ok(())
    }

    /// Reap, deliver, then issue the next query. Returns `false` when the
    /// reply is still incomplete and nothing was issued.
    #[allow(clippy::result_large_err)]
    fn complete_round(&mut self) -> Result<bool> {
        let Some(result) = self.conn.try_reap()? else {
            trace!("reply incomplete");
            return Ok(false);
        };
        self.results_reaped += 1;
        trace!(rows = result.len(), reaped = self.results_reaped, "result reaped");
        self.sink.on_result(&result);
        self.issue()?;
        Ok(true)
    }

    /// Give up on a query that was issued but cannot be watched.
    fn abandon(&mut self, e: Error) -> Error {
        self.conn.close();
        self.go_idle();
        e
    }

    fn go_idle(&mut self) {
        self.state = DriverState::Idle;
        self.handle = None;
    }
}

/// Repeats one query on one connection for as long as the loop runs.
///
/// The connection is shared only with the driver's own readiness callback,
/// so the driver must live on the thread that runs the loop.
pub struct Driver<C: QueryConnection + 'static> {
    inner: Rc<RefCell<Shared<C>>>,
}

impl Driver<MySqlConnection> {
    /// Connect to MySQL and build an idle driver around the connection.
    #[allow(clippy::result_large_err)]
    pub fn connect(
        mysql: MySqlConfig,
        config: DriverConfig,
        sink: impl ResultSink + 'static,
    ) -> Result<Self> {
        let conn = MySqlConnection::connect(mysql)?;
        Ok(Self::new(conn, config, sink))
    }
}

impl<C: QueryConnection + 'static> Driver<C> {
    pub fn new(conn: C, config: DriverConfig, sink: impl ResultSink + 'static) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Shared {
                conn,
                sink: Box::new(sink),
                sql: config.query,
                state: DriverState::Idle,
                handle: None,
                queries_issued: 0,
                results_reaped: 0,
                last_error: None,
            })),
        }
    }

    /// Issue the first query and watch the connection's socket.
    ///
    /// Starting a driver that is already polling is a state error. An error
    /// from the connection is returned as is and the driver stays idle. If
    /// the query went out but its socket cannot be watched, the connection
    /// is closed, since its reply would never be reaped.
    #[allow(clippy::result_large_err)]
    #[tracing::instrument(level = "debug", skip(self, event_loop))]
    pub fn start(&self, event_loop: &mut EventLoop) -> Result<()> {
        let handle = {
            let mut shared = self.inner.borrow_mut();
            if shared.state == DriverState::Polling {
                return Err(Error::State(StateError {
                    kind: StateErrorKind::QueryInFlight,
                    message: "driver is already polling".to_string(),
                }));
            }
            shared.issue()?;
            let fd = match shared.conn.socket_handle() {
                Ok(fd) => fd,
                Err(e) => return Err(shared.abandon(e)),
            };
            let handle = Handle::new(fd);
            shared.state = DriverState::Polling;
            shared.handle = Some(handle);
            handle
        };

        event_loop.watch(handle, readiness_callback(Rc::clone(&self.inner)));
        if !event_loop.is_watched(handle) {
            let refused = Error::Io(std::io::Error::other(format!(
                "event loop refused to watch {handle}"
            )));
            return Err(self.inner.borrow_mut().abandon(refused));
        }
        info!(fd = handle.raw(), "driver started");
        Ok(())
    }

    /// Unwatch the socket, close the connection and go idle.
    pub fn stop(&self, event_loop: &mut EventLoop) {
        let mut shared = self.inner.borrow_mut();
        if let Some(handle) = shared.handle {
            event_loop.unwatch(handle);
        }
        shared.conn.close();
        shared.go_idle();
        debug!(
            issued = shared.queries_issued,
            reaped = shared.results_reaped,
            "driver stopped"
        );
    }

    pub fn state(&self) -> DriverState {
        self.inner.borrow().state
    }

    pub fn is_polling(&self) -> bool {
        self.state() == DriverState::Polling
    }

    /// Total `query_async` calls that succeeded.
    pub fn queries_issued(&self) -> u64 {
        self.inner.borrow().queries_issued
    }

    pub fn results_reaped(&self) -> u64 {
        self.inner.borrow().results_reaped
    }

    /// The watched handle while polling.
    pub fn handle(&self) -> Option<Handle> {
        self.inner.borrow().handle
    }

    /// The error that last sent the driver idle, if any.
    pub fn take_error(&self) -> Option<Error> {
        self.inner.borrow_mut().last_error.take()
    }

    pub fn with_connection<R>(&self, f: impl FnOnce(&C) -> R) -> R {
        f(&self.inner.borrow().conn)
    }
}

impl<C: QueryConnection + 'static> fmt::Debug for Driver<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.inner.borrow();
        f.debug_struct("Driver")
            .field("state", &shared.state)
            .field("sql", &shared.sql)
            .field("handle", &shared.handle)
            .field("queries_issued", &shared.queries_issued)
            .field("results_reaped", &shared.results_reaped)
            .finish_non_exhaustive()
    }
}

fn readiness_callback<C>(inner: Rc<RefCell<Shared<C>>>) -> impl FnMut(&mut Registrar, Handle)
where
    C: QueryConnection + 'static,
{
    move |registrar, handle| on_ready(&inner, registrar, handle)
}

fn on_ready<C>(inner: &Rc<RefCell<Shared<C>>>, registrar: &mut Registrar, handle: Handle)
where
    C: QueryConnection + 'static,
{
    let mut shared = inner.borrow_mut();
    if shared.state != DriverState::Polling {
        registrar.unwatch(handle);
        return;
    }

    match shared.complete_round() {
        Ok(_) => {
            drop(shared);
            registrar.watch(handle, readiness_callback(Rc::clone(inner)));
        }
        Err(e) => {
            error!(
                fd = handle.raw(),
                sql = %shared.sql,
                error = %e,
                "query loop failed, going idle"
            );
            registrar.unwatch(handle);
            shared.go_idle();
            shared.last_error = Some(e);
        }
    }
}
