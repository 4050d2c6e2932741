//! A single protocol connection.
//!
//! This module provides:
//! - `Connector`: the transport seam (TCP by default, anything async in tests)
//! - TLS upgrade through the SSLRequest exchange
//! - `Connection`: buffered frontend sends plus an in-order mailbox of
//!   decoded backend messages fed by a reader task
//! - `CancelToken`: the out-of-band cancel request

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

use super::buffer::MessageWriter;
use super::config::{PgConfig, SslMode};
use super::error::{PgError, PgResult};
use super::protocol::*;
use super::statement::PreparedStatements;
use super::types::Oid;

/// Size of one socket read.
const READ_CHUNK: usize = 16 * 1024;

// ============================================================================
// Transport
// ============================================================================

/// Any bidirectional byte stream the protocol can run over.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxStream = Box<dyn Stream>;

pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = io::Result<BoxStream>> + Send + 'a>>;

/// Opens the raw byte stream to a server.
pub trait Connector: fmt::Debug + Send + Sync + 'static {
    fn connect<'a>(&'a self, host: &'a str, port: u16) -> ConnectFuture<'a>;
}

/// Plain TCP with Nagle disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, host: &'a str, port: u16) -> ConnectFuture<'a> {
        Box::pin(async move {
            let stream = TcpStream::connect((host, port)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxStream)
        })
    }
}

/// Where and how to open a transport; shared by connections and cancel requests.
#[derive(Debug, Clone)]
pub(crate) struct Endpoint {
    host: String,
    port: u16,
    ssl_mode: SslMode,
    tls_config: Option<Arc<ClientConfig>>,
    connector: Arc<dyn Connector>,
}

impl Endpoint {
    pub(crate) fn from_config(config: &PgConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            ssl_mode: config.ssl_mode,
            tls_config: config.tls_config.clone(),
            connector: config.connector.clone(),
        }
    }

    /// Connect, upgrading to TLS when required.
    async fn open(&self) -> PgResult<BoxStream> {
        debug!(host = %self.host, port = self.port, "Opening transport");
        let stream = self.connector.connect(&self.host, self.port).await?;

        match self.ssl_mode {
            SslMode::Disable => Ok(stream),
            SslMode::Require => negotiate_tls(stream, &self.host, self.tls_config.clone()).await,
        }
    }
}

/// Ask for TLS with an SSLRequest and run the handshake if the server agrees.
async fn negotiate_tls(
    mut stream: BoxStream,
    host: &str,
    tls_config: Option<Arc<ClientConfig>>,
) -> PgResult<BoxStream> {
    stream.write_all(&SslRequest.to_bytes()).await?;
    stream.flush().await?;

    let mut answer = [0u8; 1];
    stream.read_exact(&mut answer).await?;

    match answer[0] {
        b'S' => {
            let config = match tls_config {
                Some(config) => config,
                None => default_tls_config()?,
            };
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|e| PgError::Tls(format!("Invalid server name '{}': {}", host, e)))?;

            let tls = TlsConnector::from(config)
                .connect(server_name, stream)
                .await
                .map_err(|e| PgError::Tls(e.to_string()))?;
            debug!(host, "TLS established");
            Ok(Box::new(tls))
        }
        b'N' => Err(PgError::Tls(
            "The server does not support SSL connections".to_string(),
        )),
        other => Err(PgError::Tls(format!(
            "There was an error establishing an SSL connection (unexpected reply {:#04x})",
            other
        ))),
    }
}

/// Trust the bundled Mozilla roots.
fn default_tls_config() -> PgResult<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| PgError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

// ============================================================================
// Connection
// ============================================================================

/// One protocol connection.
///
/// Sends are buffered in a [`MessageWriter`] and go out together on
/// [`Connection::send`], so a whole Parse/Bind/Describe/Execute/Sync
/// pipeline is a single write. Incoming bytes are parsed by a reader task
/// and arrive on [`Connection::recv`] in the order the server sent them.
pub struct Connection {
    writer: WriteHalf<BoxStream>,
    out: MessageWriter,
    messages: mpsc::UnboundedReceiver<PgResult<BackendMessage>>,
    reader: JoinHandle<()>,
    statements: PreparedStatements,
    closed: bool,
}

impl Connection {
    /// Open the transport (TLS if configured) and send the startup message.
    ///
    /// Authentication is left to the caller, which reads the server's
    /// challenges from [`Connection::recv`].
    pub async fn connect(config: &PgConfig) -> PgResult<Self> {
        let stream = Endpoint::from_config(config).open().await?;
        let mut conn = Self::from_stream(stream, config.statement_cache_capacity);

        let startup = StartupMessage {
            user: config.user.clone(),
            database: Some(config.database.clone()),
            options: config.startup_options(),
        };
        conn.writer.write_all(&startup.to_bytes()).await?;
        conn.writer.flush().await?;

        debug!(user = %config.user, database = %config.database, "Startup sent");
        Ok(conn)
    }

    /// Wrap an already-open stream.
    pub fn from_stream(stream: BoxStream, statement_cache_capacity: usize) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(read_half, tx));

        Self {
            writer: write_half,
            out: MessageWriter::new(),
            messages: rx,
            reader,
            statements: PreparedStatements::new(statement_cache_capacity),
            closed: false,
        }
    }

    /// Next backend message, in arrival order.
    ///
    /// Once the stream ends every call returns `ConnectionTerminated`.
    pub async fn recv(&mut self) -> PgResult<BackendMessage> {
        match self.messages.recv().await {
            Some(msg) => msg,
            None => Err(PgError::ConnectionTerminated(None)),
        }
    }

    /// Named statements already parsed on this connection.
    pub fn statements(&self) -> &PreparedStatements {
        &self.statements
    }

    pub fn statements_mut(&mut self) -> &mut PreparedStatements {
        &mut self.statements
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    // ------------------------------------------------------------------------
    // Buffered sends
    // ------------------------------------------------------------------------

    fn push<M: FrontendMessage>(&mut self, msg: &M) -> &mut Self {
        msg.encode(&mut self.out);
        self
    }

    pub fn password(&mut self, password: &str) -> &mut Self {
        self.push(&PasswordMessage {
            password: password.to_string(),
        })
    }

    pub fn sasl_initial_response(&mut self, mechanism: &str, data: Vec<u8>) -> &mut Self {
        self.push(&SaslInitialResponseMessage {
            mechanism: mechanism.to_string(),
            data,
        })
    }

    pub fn sasl_response(&mut self, data: Vec<u8>) -> &mut Self {
        self.push(&SaslResponseMessage { data })
    }

    /// Simple query.
    pub fn query(&mut self, text: &str) -> &mut Self {
        self.push(&QueryMessage {
            query: text.to_string(),
        })
    }

    pub fn parse(&mut self, name: &str, text: &str, param_types: Vec<Oid>) -> &mut Self {
        self.push(&ParseMessage {
            name: name.to_string(),
            query: text.to_string(),
            param_types,
        })
    }

    pub fn bind(&mut self, bind: &BindMessage) -> &mut Self {
        self.push(bind)
    }

    /// `kind` is `b'S'` for a statement or `b'P'` for a portal.
    pub fn describe(&mut self, kind: u8, name: &str) -> &mut Self {
        self.push(&DescribeMessage {
            kind,
            name: name.to_string(),
        })
    }

    /// `max_rows` of 0 fetches everything.
    pub fn execute(&mut self, portal: &str, max_rows: i32) -> &mut Self {
        self.push(&ExecuteMessage {
            portal: portal.to_string(),
            max_rows,
        })
    }

    pub fn close(&mut self, kind: u8, name: &str) -> &mut Self {
        self.push(&CloseMessage {
            kind,
            name: name.to_string(),
        })
    }

    /// The protocol Flush message: ask the server to send what it has.
    pub fn flush(&mut self) -> &mut Self {
        self.push(&FlushMessage)
    }

    pub fn sync(&mut self) -> &mut Self {
        self.push(&SyncMessage)
    }

    pub fn copy_data(&mut self, data: Bytes) -> &mut Self {
        self.push(&CopyDataMessage { data })
    }

    pub fn copy_done(&mut self) -> &mut Self {
        self.push(&CopyDoneMessage)
    }

    pub fn copy_fail(&mut self, message: &str) -> &mut Self {
        self.push(&CopyFailMessage {
            message: message.to_string(),
        })
    }

    /// Write every buffered message to the socket.
    pub async fn send(&mut self) -> PgResult<()> {
        if self.closed {
            return Err(PgError::ConnectionClosed);
        }
        let bytes = self.out.flush();
        if bytes.is_empty() {
            return Ok(());
        }
        trace!(len = bytes.len(), "Writing");
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Send Terminate and close our side of the stream.
    pub async fn terminate(&mut self) -> PgResult<()> {
        if self.closed {
            return Ok(());
        }
        self.push(&TerminateMessage);
        let result = self.send().await;
        self.closed = true;
        // The peer may already be gone; shutting down is best effort.
        let _ = self.writer.shutdown().await;
        result
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("statements", &self.statements.len())
            .field("closed", &self.closed)
            .finish()
    }
}

/// Parse frames off the read half until the stream ends or fails.
async fn read_loop(
    mut reader: ReadHalf<BoxStream>,
    tx: mpsc::UnboundedSender<PgResult<BackendMessage>>,
) {
    let mut parser = Parser::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        loop {
            match parser.next_message() {
                Ok(Some(msg)) => {
                    trace!(message = msg.name(), "Received");
                    if tx.send(Ok(msg)).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Undecodable message from server");
                    let _ = tx.send(Err(e));
                    return;
                }
            }
        }

        match reader.read(&mut chunk).await {
            Ok(0) => {
                debug!("Server closed the connection");
                let _ = tx.send(Err(PgError::ConnectionTerminated(None)));
                return;
            }
            Ok(n) => parser.feed(&chunk[..n]),
            Err(e) => {
                let _ = tx.send(Err(PgError::Io(e)));
                return;
            }
        }
    }
}

// ============================================================================
// Cancel Request
// ============================================================================

/// Asks the server to abort whatever a backend is running.
///
/// Cancellation travels on a fresh connection to the same server and carries
/// the process id and secret key from the target's BackendKeyData. The server
/// answers nothing; a successful `cancel` only means the request was sent.
#[derive(Debug, Clone)]
pub struct CancelToken {
    endpoint: Endpoint,
    process_id: i32,
    secret_key: i32,
}

impl CancelToken {
    pub(crate) fn new(endpoint: Endpoint, process_id: i32, secret_key: i32) -> Self {
        Self {
            endpoint,
            process_id,
            secret_key,
        }
    }

    pub fn process_id(&self) -> i32 {
        self.process_id
    }

    pub async fn cancel(&self) -> PgResult<()> {
        let mut stream = self.endpoint.open().await?;
        let request = CancelRequest {
            process_id: self.process_id,
            secret_key: self.secret_key,
        };
        stream.write_all(&request.to_bytes()).await?;
        stream.flush().await?;
        let _ = stream.shutdown().await;

        debug!(process_id = self.process_id, "Cancel request sent");
        Ok(())
    }
}
