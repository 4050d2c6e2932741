//! The client: one connection, one FIFO of queries.
//!
//! [`Client::connect`] runs startup and authentication, then hands the
//! connection to a worker task. Queries are queued to the worker and run one
//! at a time in submission order; each caller awaits its own outcome.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use super::config::PgConfig;
use super::connection::{CancelToken, Connection, Endpoint};
use super::error::{DbError, PgError, PgResult};
use super::protocol::{BackendMessage, TransactionStatus, SCRAM_SHA_256};
use super::query::{Execution, Query, QueryResult, RowMode, Step};
use super::registry::TypeOverrides;
use super::scram::{ScramError, ScramSession};

/// Events buffered per subscriber before the oldest are dropped.
const EVENT_CAPACITY: usize = 64;

type Responder = oneshot::Sender<PgResult<Vec<QueryResult>>>;

/// Something the server said outside of a query's results.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// `NOTIFY` on a channel this session listens to.
    Notification {
        process_id: i32,
        channel: String,
        payload: String,
    },
    Notice(Box<DbError>),
    ParameterStatus {
        name: String,
        value: String,
    },
    /// An error no query was waiting for, e.g. the connection dropping
    /// while idle.
    Error(Arc<PgError>),
}

enum Command {
    Query { query: Query, responder: Responder },
    End { done: oneshot::Sender<()> },
}

/// State the worker publishes for the handle to read.
#[derive(Debug)]
struct Shared {
    queryable: AtomicBool,
    parameters: Mutex<HashMap<String, String>>,
    transaction_status: Mutex<TransactionStatus>,
}

/// Results of startup, before the worker takes over.
#[derive(Debug, Default)]
struct Startup {
    process_id: Option<i32>,
    secret_key: i32,
    parameters: HashMap<String, String>,
    status: Option<TransactionStatus>,
}

/// A connected client.
///
/// Dropping the handle ends the session as if [`Client::end`] was called.
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
    events: broadcast::Sender<ClientEvent>,
    query_timeout: Option<Duration>,
    cancel: Option<CancelToken>,
}

impl Client {
    /// Connect and authenticate.
    ///
    /// `connect_timeout` bounds the transport connect and the whole startup
    /// exchange.
    pub async fn connect(config: PgConfig) -> PgResult<Self> {
        let establish = Self::establish(&config);
        let (conn, startup) = match config.connect_timeout {
            Some(limit) => timeout(limit, establish)
                .await
                .map_err(|_| PgError::ConnectTimeout)??,
            None => establish.await?,
        };

        let shared = Arc::new(Shared {
            queryable: AtomicBool::new(true),
            parameters: Mutex::new(startup.parameters),
            transaction_status: Mutex::new(startup.status.unwrap_or(TransactionStatus::Idle)),
        });
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (commands, command_rx) = mpsc::unbounded_channel();

        let cancel = startup
            .process_id
            .map(|pid| CancelToken::new(Endpoint::from_config(&config), pid, startup.secret_key));

        let worker = Worker {
            conn,
            commands: command_rx,
            queue: VecDeque::new(),
            active: None,
            shared: shared.clone(),
            events: events.clone(),
            types: Arc::new(config.types.clone()),
            binary: config.binary,
            row_mode: config.row_mode,
            ending: false,
        };
        tokio::spawn(worker.run());

        info!(host = %config.host, database = %config.database, "Connected");
        Ok(Self {
            commands,
            shared,
            events,
            query_timeout: config.query_timeout,
            cancel,
        })
    }

    async fn establish(config: &PgConfig) -> PgResult<(Connection, Startup)> {
        let mut conn = Connection::connect(config).await?;
        let startup = authenticate(&mut conn, config).await?;
        Ok((conn, startup))
    }

    /// Run a query and return its last result.
    ///
    /// A multi-statement simple query yields one result per statement; use
    /// [`Client::query_all`] to get all of them.
    pub async fn query(&self, query: impl Into<Query>) -> PgResult<QueryResult> {
        let mut results = self.query_all(query).await?;
        Ok(results.pop().unwrap_or_default())
    }

    /// Run a query and return one result per statement.
    pub async fn query_all(&self, query: impl Into<Query>) -> PgResult<Vec<QueryResult>> {
        let query = query.into();
        query.validate()?;
        if !self.is_queryable() {
            return Err(PgError::ConnectionClosed);
        }

        let limit = query.timeout.or(self.query_timeout);
        let (responder, rx) = oneshot::channel();
        self.commands
            .send(Command::Query { query, responder })
            .map_err(|_| PgError::ConnectionClosed)?;

        let outcome = async {
            rx.await
                .unwrap_or_else(|_| Err(PgError::ConnectionTerminated(None)))
        };
        match limit {
            // Dropping the receiver on expiry lets the worker skip or discard it.
            Some(limit) => timeout(limit, outcome)
                .await
                .map_err(|_| PgError::QueryTimeout)?,
            None => outcome.await,
        }
    }

    /// Terminate the session. Queued queries fail with `ConnectionTerminated`.
    pub async fn end(&self) -> PgResult<()> {
        self.shared.queryable.store(false, Ordering::SeqCst);
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::End { done }).is_ok() {
            let _ = rx.await;
        }
        Ok(())
    }

    /// Whether new queries are accepted.
    pub fn is_queryable(&self) -> bool {
        self.shared.queryable.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        !self.is_queryable()
    }

    /// Notifications, notices and unsolicited errors.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Handle for cancelling this session's running statement from elsewhere.
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.cancel.clone()
    }

    pub fn backend_pid(&self) -> Option<i32> {
        self.cancel.as_ref().map(CancelToken::process_id)
    }

    /// Last value the server reported for a run-time parameter.
    pub fn parameter(&self, name: &str) -> Option<String> {
        self.shared.parameters.lock().get(name).cloned()
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        *self.shared.transaction_status.lock()
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("backend_pid", &self.backend_pid())
            .field("queryable", &self.is_queryable())
            .finish()
    }
}

// ============================================================================
// Authentication
// ============================================================================

/// Drive startup until the first ReadyForQuery.
async fn authenticate(conn: &mut Connection, config: &PgConfig) -> PgResult<Startup> {
    let mut startup = Startup::default();
    let mut password: Option<String> = None;
    let mut scram: Option<ScramSession> = None;

    loop {
        match conn.recv().await? {
            BackendMessage::AuthenticationOk => {
                // A SCRAM server must prove itself before it may accept us.
                if scram.as_ref().is_some_and(|session| !session.is_finished()) {
                    return Err(ScramError::MissingServerSignature.into());
                }
                debug!("Authentication succeeded");
            }
            BackendMessage::AuthenticationCleartextPassword => {
                debug!("Server requested cleartext password");
                let pw = resolve_password(&mut password, config).await?;
                conn.password(&pw);
                conn.send().await?;
            }
            BackendMessage::AuthenticationMD5Password { salt } => {
                debug!("Server requested MD5 password");
                let pw = resolve_password(&mut password, config).await?;
                conn.password(&md5_password(&config.user, &pw, &salt));
                conn.send().await?;
            }
            BackendMessage::AuthenticationSASL { mechanisms } => {
                debug!(?mechanisms, "Server requested SASL");
                // Resolve up front so a missing password fails before the exchange.
                resolve_password(&mut password, config).await?;
                let (session, first) = ScramSession::start(&mechanisms)?;
                scram = Some(session);
                conn.sasl_initial_response(SCRAM_SHA_256, first);
                conn.send().await?;
            }
            BackendMessage::AuthenticationSASLContinue { data } => {
                let session = scram.as_mut().ok_or_else(|| {
                    PgError::Protocol("SASL continue before SASL start".to_string())
                })?;
                let pw = resolve_password(&mut password, config).await?;
                let reply = session.continue_exchange(&pw, &data)?;
                conn.sasl_response(reply);
                conn.send().await?;
            }
            BackendMessage::AuthenticationSASLFinal { data } => {
                let session = scram.as_mut().ok_or_else(|| {
                    PgError::Protocol("SASL final before SASL start".to_string())
                })?;
                session.finalize(&data)?;
                debug!("Server signature verified");
            }
            BackendMessage::ParameterStatus { name, value } => {
                startup.parameters.insert(name, value);
            }
            BackendMessage::BackendKeyData {
                process_id,
                secret_key,
            } => {
                startup.process_id = Some(process_id);
                startup.secret_key = secret_key;
            }
            BackendMessage::NoticeResponse(notice) => {
                info!(severity = %notice.severity, message = %notice.message, "Notice during startup");
            }
            BackendMessage::ErrorResponse(err) => {
                return Err(PgError::Db(err));
            }
            BackendMessage::ReadyForQuery { status } => {
                startup.status = Some(status);
                return Ok(startup);
            }
            other => {
                return Err(PgError::Protocol(format!(
                    "Unexpected message during startup: {}",
                    other.name()
                )));
            }
        }
    }
}

/// Password for this attempt: the configured value or provider, else the
/// password file. Resolved at most once per attempt.
async fn resolve_password(cache: &mut Option<String>, config: &PgConfig) -> PgResult<String> {
    if let Some(pw) = cache {
        return Ok(pw.clone());
    }

    let resolved = match &config.password {
        Some(source) => source.resolve().await?,
        None => config
            .passfile
            .as_ref()
            .and_then(|file| file.lookup(&config.host, config.port, &config.database, &config.user))
            .ok_or_else(|| {
                PgError::Auth("Server requested a password but none was supplied".to_string())
            })?,
    };

    *cache = Some(resolved.clone());
    Ok(resolved)
}

/// Compute MD5 password hash.
fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    // MD5(MD5(password + user) + salt)
    let inner = format!("{}{}", password, user);
    let inner_hash = md5::compute(inner.as_bytes());

    // Hex of the inner hash, then the raw salt bytes
    let inner_hex = format!("{:x}", inner_hash);
    let mut hasher_input = inner_hex.as_bytes().to_vec();
    hasher_input.extend_from_slice(salt);

    let outer_hash = md5::compute(&hasher_input);
    format!("md5{:x}", outer_hash)
}

// ============================================================================
// Worker
// ============================================================================

/// Owns the connection; runs queries strictly one at a time.
struct Worker {
    conn: Connection,
    commands: mpsc::UnboundedReceiver<Command>,
    queue: VecDeque<(Query, Responder)>,
    active: Option<(Execution, Responder)>,
    shared: Arc<Shared>,
    events: broadcast::Sender<ClientEvent>,
    types: Arc<TypeOverrides>,
    binary: bool,
    row_mode: RowMode,
    ending: bool,
}

impl Worker {
    async fn run(mut self) {
        let mut end_waiters = Vec::new();

        loop {
            if let Err(e) = self.pulse_queue().await {
                self.fail_all(e);
                break;
            }

            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Query { query, responder }) => {
                        self.queue.push_back((query, responder));
                    }
                    Some(Command::End { done }) => {
                        end_waiters.push(done);
                        self.ending = true;
                        break;
                    }
                    None => {
                        // Every handle is gone.
                        self.ending = true;
                        break;
                    }
                },
                msg = self.conn.recv() => {
                    let result = match msg {
                        Ok(msg) => self.handle_message(msg).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        self.fail_all(e);
                        break;
                    }
                }
            }
        }

        self.shared.queryable.store(false, Ordering::SeqCst);
        if self.ending {
            debug!("Ending connection");
            if let Err(e) = self.conn.terminate().await {
                debug!(error = %e, "Terminate failed");
            }
            self.fail_pending(|| PgError::ConnectionTerminated(None));
        }
        for done in end_waiters {
            let _ = done.send(());
        }
    }

    /// Start the next query unless one is running.
    ///
    /// Queued queries whose caller already gave up are skipped.
    async fn pulse_queue(&mut self) -> PgResult<()> {
        while self.active.is_none() {
            let Some((query, responder)) = self.queue.pop_front() else {
                return Ok(());
            };
            if responder.is_closed() {
                trace!("Skipping query abandoned while queued");
                continue;
            }

            let mut execution = Execution::new(query, &self.types, self.binary, self.row_mode);
            match execution.start(&mut self.conn) {
                Ok(()) => {
                    self.active = Some((execution, responder));
                    self.conn.send().await?;
                }
                // Rejected before anything was buffered.
                Err(e) => {
                    let _ = responder.send(Err(e));
                }
            }
        }
        Ok(())
    }

    async fn handle_message(&mut self, msg: BackendMessage) -> PgResult<()> {
        match msg {
            BackendMessage::NoticeResponse(notice) => {
                info!(severity = %notice.severity, message = %notice.message, "Notice");
                let _ = self.events.send(ClientEvent::Notice(notice));
                return Ok(());
            }
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => {
                debug!(%channel, "Notification");
                let _ = self.events.send(ClientEvent::Notification {
                    process_id,
                    channel,
                    payload,
                });
                return Ok(());
            }
            BackendMessage::ParameterStatus { name, value } => {
                self.shared
                    .parameters
                    .lock()
                    .insert(name.clone(), value.clone());
                let _ = self.events.send(ClientEvent::ParameterStatus { name, value });
                return Ok(());
            }
            BackendMessage::ReadyForQuery { status } => {
                *self.shared.transaction_status.lock() = status;
            }
            _ => {}
        }

        let Some((execution, _)) = self.active.as_mut() else {
            if let BackendMessage::ErrorResponse(err) = msg {
                warn!(code = %err.code, message = %err.message, "Error with no active query");
                let _ = self
                    .events
                    .send(ClientEvent::Error(Arc::new(PgError::Db(err))));
            } else {
                trace!(message = msg.name(), "Ignoring message with no active query");
            }
            return Ok(());
        };

        if let Step::Done(result) = execution.handle(msg, &mut self.conn) {
            if let Some((_, responder)) = self.active.take() {
                // The caller may have timed out; the result is discarded then.
                let _ = responder.send(result);
            }
        }
        self.conn.send().await
    }

    /// The connection is unusable: report and fail everything.
    fn fail_all(&mut self, err: PgError) {
        self.shared.queryable.store(false, Ordering::SeqCst);
        error!(error = %err, "Connection error");

        let reason = err.to_string();
        let err = Arc::new(err);
        if let Some((mut execution, responder)) = self.active.take() {
            let _ = responder.send(execution.fail(err.duplicate()));
        }
        let _ = self.events.send(ClientEvent::Error(err));
        self.fail_pending(|| PgError::ConnectionTerminated(Some(reason.clone())));
    }

    fn fail_pending(&mut self, make_err: impl Fn() -> PgError) {
        if let Some((mut execution, responder)) = self.active.take() {
            let _ = responder.send(execution.fail(make_err()));
        }
        for (_, responder) in self.queue.drain(..) {
            let _ = responder.send(Err(make_err()));
        }
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                Command::Query { responder, .. } => {
                    let _ = responder.send(Err(make_err()));
                }
                Command::End { done } => {
                    let _ = done.send(());
                }
            }
        }
    }
}
