//! PostgreSQL wire protocol message encoding and decoding.
//!
//! This module implements the PostgreSQL v3 protocol messages.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use std::collections::HashMap;

use bytes::{Buf, Bytes};
use smallvec::SmallVec;

use super::buffer::{Frame, MessageReader, MessageWriter};
use super::error::{DbError, PgError, PgResult};
use super::types::{Oid, PgValue};

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// SSLRequest magic number
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// CancelRequest magic number
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// The only SASL mechanism this client speaks.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i16)]
pub enum Format {
    #[default]
    Text = 0,
    Binary = 1,
}

impl Format {
    fn from_code(code: i16) -> Self {
        if code == 0 {
            Format::Text
        } else {
            Format::Binary
        }
    }
}

/// Transaction status indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'I' => TransactionStatus::Idle,
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Trait for encoding tagged frontend messages.
///
/// Implementations append one framed message to the writer, so several
/// messages can be pipelined before a single flush.
pub trait FrontendMessage {
    fn encode(&self, w: &mut MessageWriter);
}

/// Startup message sent at connection start
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

impl StartupMessage {
    pub fn to_bytes(&self) -> Bytes {
        let mut w = MessageWriter::new();

        // Protocol version
        w.add_i32(PROTOCOL_VERSION);

        // Parameters
        w.add_cstring("user").add_cstring(&self.user);

        if let Some(ref db) = self.database {
            w.add_cstring("database").add_cstring(db);
        }

        for (key, value) in &self.options {
            w.add_cstring(key).add_cstring(value);
        }

        // Terminator
        w.add_bytes(&[0]);

        w.frame_untagged()
    }
}

/// Asks the server to switch to TLS before startup.
#[derive(Debug, Clone, Copy)]
pub struct SslRequest;

impl SslRequest {
    pub fn to_bytes(&self) -> Bytes {
        MessageWriter::new().add_i32(SSL_REQUEST_CODE).frame_untagged()
    }
}

/// Sent on a separate connection to abort the running statement of a backend.
#[derive(Debug, Clone, Copy)]
pub struct CancelRequest {
    pub process_id: i32,
    pub secret_key: i32,
}

impl CancelRequest {
    pub fn to_bytes(&self) -> Bytes {
        MessageWriter::new()
            .add_i32(CANCEL_REQUEST_CODE)
            .add_i32(self.process_id)
            .add_i32(self.secret_key)
            .frame_untagged()
    }
}

/// Password message (for MD5 or plaintext auth)
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn encode(&self, w: &mut MessageWriter) {
        w.add_cstring(&self.password).add_header(b'p');
    }
}

/// Simple query message ('Q')
#[derive(Debug, Clone)]
pub struct QueryMessage {
    pub query: String,
}

impl FrontendMessage for QueryMessage {
    fn encode(&self, w: &mut MessageWriter) {
        w.add_cstring(&self.query).add_header(b'Q');
    }
}

/// Parse message ('P') - Creates a prepared statement
#[derive(Debug, Clone)]
pub struct ParseMessage {
    pub name: String,
    pub query: String,
    pub param_types: Vec<Oid>,
}

impl FrontendMessage for ParseMessage {
    fn encode(&self, w: &mut MessageWriter) {
        w.add_cstring(&self.name).add_cstring(&self.query);

        w.add_i16(self.param_types.len() as i16);
        for oid in &self.param_types {
            w.add_i32(oid.as_i32());
        }

        w.add_header(b'P');
    }
}

/// Bind message ('B') - Binds parameters to a prepared statement
#[derive(Debug, Clone)]
pub struct BindMessage {
    pub portal: String,
    pub statement: String,
    pub param_formats: Vec<Format>,
    pub params: Vec<PgValue>,
    pub result_formats: Vec<Format>,
}

impl BindMessage {
    /// Bind `params`, each in the wire format it encodes best in.
    pub fn new(portal: &str, statement: &str, params: &[PgValue], result_format: Format) -> Self {
        Self {
            portal: portal.to_string(),
            statement: statement.to_string(),
            param_formats: params.iter().map(PgValue::param_format).collect(),
            params: params.to_vec(),
            result_formats: vec![result_format],
        }
    }
}

impl FrontendMessage for BindMessage {
    fn encode(&self, w: &mut MessageWriter) {
        w.add_cstring(&self.portal).add_cstring(&self.statement);

        w.add_i16(self.param_formats.len() as i16);
        for fmt in &self.param_formats {
            w.add_i16(*fmt as i16);
        }

        w.add_i16(self.params.len() as i16);
        for (i, param) in self.params.iter().enumerate() {
            let format = self.param_formats.get(i).copied().unwrap_or_default();
            match param.encode_param(format) {
                None => {
                    w.add_i32(-1);
                }
                Some(encoded) => {
                    w.add_i32(encoded.len() as i32).add_bytes(&encoded);
                }
            }
        }

        w.add_i16(self.result_formats.len() as i16);
        for fmt in &self.result_formats {
            w.add_i16(*fmt as i16);
        }

        w.add_header(b'B');
    }
}

/// Execute message ('E') - Executes a bound portal
#[derive(Debug, Clone)]
pub struct ExecuteMessage {
    pub portal: String,
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage {
    fn encode(&self, w: &mut MessageWriter) {
        w.add_cstring(&self.portal)
            .add_i32(self.max_rows)
            .add_header(b'E');
    }
}

/// Describe message ('D') - Request description of statement or portal
#[derive(Debug, Clone)]
pub struct DescribeMessage {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: String,
}

impl FrontendMessage for DescribeMessage {
    fn encode(&self, w: &mut MessageWriter) {
        w.add_bytes(&[self.kind])
            .add_cstring(&self.name)
            .add_header(b'D');
    }
}

/// Close message ('C') - Close a prepared statement or portal
#[derive(Debug, Clone)]
pub struct CloseMessage {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: String,
}

impl FrontendMessage for CloseMessage {
    fn encode(&self, w: &mut MessageWriter) {
        w.add_bytes(&[self.kind])
            .add_cstring(&self.name)
            .add_header(b'C');
    }
}

/// Sync message ('S') - Marks end of an extended query
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode(&self, w: &mut MessageWriter) {
        w.add_header(b'S');
    }
}

/// Flush message ('H') - Request server to flush output buffer
#[derive(Debug, Clone, Copy)]
pub struct FlushMessage;

impl FrontendMessage for FlushMessage {
    fn encode(&self, w: &mut MessageWriter) {
        w.add_header(b'H');
    }
}

/// Terminate message ('X') - Close the connection
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode(&self, w: &mut MessageWriter) {
        w.add_header(b'X');
    }
}

/// SASL Initial Response message ('p') - First SCRAM message
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage {
    /// SASL mechanism name (e.g., "SCRAM-SHA-256")
    pub mechanism: String,
    /// Initial client response data
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslInitialResponseMessage {
    fn encode(&self, w: &mut MessageWriter) {
        w.add_cstring(&self.mechanism)
            .add_i32(self.data.len() as i32)
            .add_bytes(&self.data)
            .add_header(b'p');
    }
}

/// SASL Response message ('p') - Subsequent SCRAM messages
#[derive(Debug, Clone)]
pub struct SaslResponseMessage {
    /// SASL response data
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslResponseMessage {
    fn encode(&self, w: &mut MessageWriter) {
        w.add_bytes(&self.data).add_header(b'p');
    }
}

/// CopyData message ('d')
#[derive(Debug, Clone)]
pub struct CopyDataMessage {
    pub data: Bytes,
}

impl FrontendMessage for CopyDataMessage {
    fn encode(&self, w: &mut MessageWriter) {
        w.add_bytes(&self.data).add_header(b'd');
    }
}

/// CopyDone message ('c')
#[derive(Debug, Clone, Copy)]
pub struct CopyDoneMessage;

impl FrontendMessage for CopyDoneMessage {
    fn encode(&self, w: &mut MessageWriter) {
        w.add_header(b'c');
    }
}

/// CopyFail message ('f')
#[derive(Debug, Clone)]
pub struct CopyFailMessage {
    pub message: String,
}

impl FrontendMessage for CopyFailMessage {
    fn encode(&self, w: &mut MessageWriter) {
        w.add_cstring(&self.message).add_header(b'f');
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Field description in a RowDescription message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// One column of a DataRow, shaped by the current row-format mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawValue {
    Text(String),
    Binary(Bytes),
}

/// DataRow columns; most rows fit inline.
pub type RawRow = SmallVec<[Option<RawValue>; 16]>;

/// Backend message types
#[derive(Debug, Clone)]
pub enum BackendMessage {
    // Authentication
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password {
        salt: [u8; 4],
    },
    AuthenticationSASL {
        mechanisms: Vec<String>,
    },
    AuthenticationSASLContinue {
        data: Bytes,
    },
    AuthenticationSASLFinal {
        data: Bytes,
    },

    // Query responses
    RowDescription {
        fields: Vec<FieldDescription>,
    },
    DataRow {
        values: RawRow,
    },
    CommandComplete {
        tag: String,
    },
    EmptyQueryResponse,

    // Extended query protocol
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,

    // Status
    ReadyForQuery {
        status: TransactionStatus,
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },

    // Errors and notices
    ErrorResponse(Box<DbError>),
    NoticeResponse(Box<DbError>),

    // COPY
    CopyInResponse {
        binary: bool,
        column_formats: Vec<Format>,
    },
    CopyOutResponse {
        binary: bool,
        column_formats: Vec<Format>,
    },
    CopyBothResponse {
        binary: bool,
        column_formats: Vec<Format>,
    },
    CopyData {
        data: Bytes,
    },
    CopyDone,

    // Other
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
    ParameterDescription {
        type_oids: Vec<Oid>,
    },
}

impl BackendMessage {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            BackendMessage::AuthenticationOk => "authenticationOk",
            BackendMessage::AuthenticationCleartextPassword => "authenticationCleartextPassword",
            BackendMessage::AuthenticationMD5Password { .. } => "authenticationMD5Password",
            BackendMessage::AuthenticationSASL { .. } => "authenticationSASL",
            BackendMessage::AuthenticationSASLContinue { .. } => "authenticationSASLContinue",
            BackendMessage::AuthenticationSASLFinal { .. } => "authenticationSASLFinal",
            BackendMessage::RowDescription { .. } => "rowDescription",
            BackendMessage::DataRow { .. } => "dataRow",
            BackendMessage::CommandComplete { .. } => "commandComplete",
            BackendMessage::EmptyQueryResponse => "emptyQuery",
            BackendMessage::ParseComplete => "parseComplete",
            BackendMessage::BindComplete => "bindComplete",
            BackendMessage::CloseComplete => "closeComplete",
            BackendMessage::NoData => "noData",
            BackendMessage::PortalSuspended => "portalSuspended",
            BackendMessage::ReadyForQuery { .. } => "readyForQuery",
            BackendMessage::ParameterStatus { .. } => "parameterStatus",
            BackendMessage::BackendKeyData { .. } => "backendKeyData",
            BackendMessage::ErrorResponse(_) => "error",
            BackendMessage::NoticeResponse(_) => "notice",
            BackendMessage::CopyInResponse { .. } => "copyInResponse",
            BackendMessage::CopyOutResponse { .. } => "copyOutResponse",
            BackendMessage::CopyBothResponse { .. } => "copyBothResponse",
            BackendMessage::CopyData { .. } => "copyData",
            BackendMessage::CopyDone => "copyDone",
            BackendMessage::NotificationResponse { .. } => "notification",
            BackendMessage::ParameterDescription { .. } => "parameterDescription",
        }
    }
}

// ============================================================================
// Parser
// ============================================================================

/// Turns incoming bytes into backend messages.
///
/// Holds the row-format mode: each RowDescription field sets it, and it stays
/// in effect for the DataRows that follow until the next RowDescription.
#[derive(Debug, Default)]
pub struct Parser {
    reader: MessageReader,
    mode: Format,
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current row-format mode.
    pub fn mode(&self) -> Format {
        self.mode
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.reader.feed(chunk);
    }

    /// Buffer to read socket data into directly.
    pub fn buffer_mut(&mut self) -> &mut bytes::BytesMut {
        self.reader.buffer_mut()
    }

    /// Next complete message, or `None` until more bytes arrive.
    pub fn next_message(&mut self) -> PgResult<Option<BackendMessage>> {
        match self.reader.read()? {
            Some(frame) => self.parse(frame).map(Some),
            None => Ok(None),
        }
    }

    /// Decode one frame.
    pub fn parse(&mut self, frame: Frame) -> PgResult<BackendMessage> {
        let body = frame.body;

        match frame.tag {
            b'R' => decode_auth(body),
            b'S' => decode_parameter_status(body),
            b'K' => decode_backend_key_data(body),
            b'C' => decode_command_complete(body),
            b'Z' => decode_ready_for_query(body),
            b'T' => self.decode_row_description(body),
            b'D' => self.decode_data_row(body),
            b'E' => Ok(BackendMessage::ErrorResponse(Box::new(decode_fields(body)?))),
            b'N' => Ok(BackendMessage::NoticeResponse(Box::new(decode_fields(body)?))),
            b'1' => Ok(BackendMessage::ParseComplete),
            b'2' => Ok(BackendMessage::BindComplete),
            b'3' => Ok(BackendMessage::CloseComplete),
            b'A' => decode_notification_response(body),
            b'n' => Ok(BackendMessage::NoData),
            b'I' => Ok(BackendMessage::EmptyQueryResponse),
            b's' => Ok(BackendMessage::PortalSuspended),
            b't' => decode_parameter_description(body),
            b'G' => {
                let (binary, column_formats) = decode_copy_response(body)?;
                Ok(BackendMessage::CopyInResponse { binary, column_formats })
            }
            b'H' => {
                let (binary, column_formats) = decode_copy_response(body)?;
                Ok(BackendMessage::CopyOutResponse { binary, column_formats })
            }
            b'W' => {
                let (binary, column_formats) = decode_copy_response(body)?;
                Ok(BackendMessage::CopyBothResponse { binary, column_formats })
            }
            b'd' => Ok(BackendMessage::CopyData { data: body }),
            b'c' => Ok(BackendMessage::CopyDone),
            tag => Err(PgError::Protocol(format!(
                "Unknown message type: {}",
                tag as char
            ))),
        }
    }

    fn decode_row_description(&mut self, mut body: Bytes) -> PgResult<BackendMessage> {
        let num_fields = get_i16(&mut body)?.max(0) as usize;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            let name = read_cstring(&mut body)?;
            let table_oid = get_i32(&mut body)?;
            let column_attr = get_i16(&mut body)?;
            let type_oid = Oid::from_i32(get_i32(&mut body)?);
            let type_size = get_i16(&mut body)?;
            let type_modifier = get_i32(&mut body)?;
            let format = Format::from_code(get_i16(&mut body)?);

            self.mode = format;

            fields.push(FieldDescription {
                name,
                table_oid,
                column_attr,
                type_oid,
                type_size,
                type_modifier,
                format,
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(&mut self, mut body: Bytes) -> PgResult<BackendMessage> {
        let num_cols = get_i16(&mut body)?.max(0) as usize;
        let mut values = RawRow::with_capacity(num_cols);

        for _ in 0..num_cols {
            let len = get_i32(&mut body)?;
            if len < 0 {
                values.push(None);
                continue;
            }

            let len = len as usize;
            if body.remaining() < len {
                return Err(PgError::Protocol("DataRow column exceeds message".to_string()));
            }
            let data = body.split_to(len);
            let value = match self.mode {
                Format::Binary => RawValue::Binary(data),
                Format::Text => RawValue::Text(utf8_lossy(&data)),
            };
            values.push(Some(value));
        }

        Ok(BackendMessage::DataRow { values })
    }
}

fn decode_auth(mut body: Bytes) -> PgResult<BackendMessage> {
    let auth_type = get_i32(&mut body)?;

    match auth_type {
        0 => Ok(BackendMessage::AuthenticationOk),
        3 => Ok(BackendMessage::AuthenticationCleartextPassword),
        5 => {
            if body.remaining() < 4 {
                return Err(PgError::Protocol("MD5 salt missing".to_string()));
            }
            let mut salt = [0u8; 4];
            body.copy_to_slice(&mut salt);
            Ok(BackendMessage::AuthenticationMD5Password { salt })
        }
        10 => {
            // SASL
            let mut mechanisms = Vec::new();
            while body.remaining() > 0 {
                let mech = read_cstring(&mut body)?;
                if mech.is_empty() {
                    break;
                }
                mechanisms.push(mech);
            }
            Ok(BackendMessage::AuthenticationSASL { mechanisms })
        }
        11 => Ok(BackendMessage::AuthenticationSASLContinue { data: body }),
        12 => Ok(BackendMessage::AuthenticationSASLFinal { data: body }),
        _ => Err(PgError::Protocol(format!(
            "Unknown authentication type: {}",
            auth_type
        ))),
    }
}

fn decode_command_complete(mut body: Bytes) -> PgResult<BackendMessage> {
    let tag = read_cstring(&mut body)?;
    Ok(BackendMessage::CommandComplete { tag })
}

fn decode_ready_for_query(body: Bytes) -> PgResult<BackendMessage> {
    let status = body
        .first()
        .copied()
        .map(TransactionStatus::from)
        .ok_or_else(|| PgError::Protocol("ReadyForQuery without status".to_string()))?;
    Ok(BackendMessage::ReadyForQuery { status })
}

fn decode_parameter_status(mut body: Bytes) -> PgResult<BackendMessage> {
    let name = read_cstring(&mut body)?;
    let value = read_cstring(&mut body)?;
    Ok(BackendMessage::ParameterStatus { name, value })
}

fn decode_backend_key_data(mut body: Bytes) -> PgResult<BackendMessage> {
    let process_id = get_i32(&mut body)?;
    let secret_key = get_i32(&mut body)?;
    Ok(BackendMessage::BackendKeyData {
        process_id,
        secret_key,
    })
}

fn decode_parameter_description(mut body: Bytes) -> PgResult<BackendMessage> {
    let num_params = get_i16(&mut body)?.max(0) as usize;
    let mut type_oids = Vec::with_capacity(num_params);

    for _ in 0..num_params {
        type_oids.push(Oid::from_i32(get_i32(&mut body)?));
    }

    Ok(BackendMessage::ParameterDescription { type_oids })
}

fn decode_notification_response(mut body: Bytes) -> PgResult<BackendMessage> {
    let process_id = get_i32(&mut body)?;
    let channel = read_cstring(&mut body)?;
    let payload = read_cstring(&mut body)?;

    Ok(BackendMessage::NotificationResponse {
        process_id,
        channel,
        payload,
    })
}

fn decode_copy_response(mut body: Bytes) -> PgResult<(bool, Vec<Format>)> {
    if body.remaining() < 1 {
        return Err(PgError::Protocol("Copy response without format".to_string()));
    }
    let binary = body.get_i8() != 0;
    let count = get_i16(&mut body)?.max(0) as usize;
    let mut column_formats = Vec::with_capacity(count);
    for _ in 0..count {
        column_formats.push(Format::from_code(get_i16(&mut body)?));
    }
    Ok((binary, column_formats))
}

fn decode_fields(mut body: Bytes) -> PgResult<DbError> {
    let mut fields = HashMap::new();

    while body.remaining() > 0 {
        let field_type = body.get_u8();
        if field_type == 0 {
            break;
        }
        let value = read_cstring(&mut body)?;
        fields.insert(field_type, value);
    }

    Ok(DbError::from_fields(fields))
}

// ============================================================================
// Helper Functions
// ============================================================================

fn get_i16(buf: &mut Bytes) -> PgResult<i16> {
    if buf.remaining() < 2 {
        return Err(PgError::Protocol("Unexpected end of message".to_string()));
    }
    Ok(buf.get_i16())
}

fn get_i32(buf: &mut Bytes) -> PgResult<i32> {
    if buf.remaining() < 4 {
        return Err(PgError::Protocol("Unexpected end of message".to_string()));
    }
    Ok(buf.get_i32())
}

/// Tries direct UTF-8 first, falls back to lossy only if invalid.
fn utf8_lossy(data: &[u8]) -> String {
    std::str::from_utf8(data)
        .map(|s| s.to_owned())
        .unwrap_or_else(|_| String::from_utf8_lossy(data).into_owned())
}

/// Read a null-terminated string from the buffer.
fn read_cstring(buf: &mut Bytes) -> PgResult<String> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| PgError::Protocol("Missing null terminator in string".to_string()))?;

    let s = utf8_lossy(&buf[..end]);
    buf.advance(end + 1); // Skip the null terminator
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_of(tag: u8, body: &[u8]) -> Frame {
        Frame {
            tag,
            body: Bytes::copy_from_slice(body),
        }
    }

    #[test]
    fn test_startup_message_structure() {
        let msg = StartupMessage {
            user: "test".to_string(),
            database: Some("testdb".to_string()),
            options: vec![],
        };

        let encoded = msg.to_bytes();

        // Length should be at least 4 (length) + 4 (version) + some params
        assert!(encoded.len() >= 8);

        // Check length field
        let len = i32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(len as usize, encoded.len());
        assert_eq!(*encoded.last().unwrap(), 0);
    }

    #[test]
    fn test_query_message_structure() {
        let mut w = MessageWriter::new();
        QueryMessage {
            query: "SELECT 1".to_string(),
        }
        .encode(&mut w);
        let encoded = w.flush();

        assert_eq!(encoded[0], b'Q');

        let len = i32::from_be_bytes([encoded[1], encoded[2], encoded[3], encoded[4]]);
        assert_eq!(len as usize, encoded.len() - 1); // -1 for message type
    }

    #[test]
    fn test_ssl_and_cancel_requests() {
        assert_eq!(
            &SslRequest.to_bytes()[..],
            &[0, 0, 0, 8, 0x04, 0xd2, 0x16, 0x2f]
        );

        let cancel = CancelRequest {
            process_id: 7,
            secret_key: -1,
        }
        .to_bytes();
        assert_eq!(cancel.len(), 16);
        assert_eq!(&cancel[..8], &[0, 0, 0, 16, 0x04, 0xd2, 0x16, 0x2e]);
        assert_eq!(&cancel[8..12], &7i32.to_be_bytes());
        assert_eq!(&cancel[12..], &[0xff; 4]);
    }

    #[test]
    fn test_unknown_auth_code_is_fatal() {
        let mut parser = Parser::new();
        let err = parser
            .parse(frame_of(b'R', &7i32.to_be_bytes()))
            .unwrap_err();
        assert!(matches!(err, PgError::Protocol(_)));
    }

    #[test]
    fn test_sasl_mechanisms() {
        let mut body = 10i32.to_be_bytes().to_vec();
        body.extend_from_slice(b"SCRAM-SHA-256-PLUS\0SCRAM-SHA-256\0\0");
        let msg = Parser::new().parse(frame_of(b'R', &body)).unwrap();
        match msg {
            BackendMessage::AuthenticationSASL { mechanisms } => {
                assert_eq!(mechanisms, vec!["SCRAM-SHA-256-PLUS", "SCRAM-SHA-256"]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_copy_response() {
        let body = [0u8, 0, 2, 0, 0, 0, 0];
        let msg = Parser::new().parse(frame_of(b'G', &body)).unwrap();
        match msg {
            BackendMessage::CopyInResponse {
                binary,
                column_formats,
            } => {
                assert!(!binary);
                assert_eq!(column_formats, vec![Format::Text, Format::Text]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_truncated_message_is_error() {
        let err = Parser::new().parse(frame_of(b'K', &[0, 0, 0])).unwrap_err();
        assert!(matches!(err, PgError::Protocol(_)));
    }
}
