//! Queries, their results, and the per-query protocol state machine.
//!
//! A query runs either as a single simple-protocol `Q` message or as an
//! extended-protocol pipeline (Parse/Bind/Describe/Execute/Sync). The choice
//! is made by [`Query::requires_preparation`].

use std::ops::Index;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, trace};

use super::connection::Connection;
use super::error::{PgError, PgResult};
use super::protocol::{BackendMessage, BindMessage, FieldDescription, Format, RawRow};
use super::registry::TypeOverrides;
use super::statement::Preparation;
use super::types::{Oid, PgValue};

/// Largest CopyData payload sent in one message.
const COPY_CHUNK: usize = 64 * 1024;

static COMMAND_TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z]+)(?: (\d+))?(?: (\d+))?").expect("valid command tag regex")
});

// ============================================================================
// Query
// ============================================================================

/// Shape of returned rows when rendered (see [`Row::to_json`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowMode {
    /// Column name to value; a later duplicate name wins.
    #[default]
    Object,
    /// Values by position.
    Array,
}

/// A query to submit to a client.
///
/// Plain strings convert into queries, so `client.query("SELECT 1")` works;
/// the builder methods cover everything else.
///
/// ```
/// use pglink::pg::Query;
///
/// let q = Query::new("INSERT INTO t VALUES ($1)").name("insert_t").param(7i32);
/// assert!(q.requires_preparation());
/// assert!(!Query::new("SELECT 1").requires_preparation());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub(crate) text: String,
    pub(crate) name: Option<String>,
    pub(crate) values: Option<Vec<PgValue>>,
    pub(crate) param_types: Vec<Oid>,
    pub(crate) rows: Option<i32>,
    pub(crate) portal: String,
    pub(crate) binary: Option<bool>,
    pub(crate) row_mode: Option<RowMode>,
    pub(crate) types: Option<TypeOverrides>,
    pub(crate) extended: bool,
    pub(crate) copy_in: Option<Bytes>,
    pub(crate) timeout: Option<Duration>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Prepare under a server-side name and reuse it on later submissions.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn values(mut self, values: Vec<PgValue>) -> Self {
        self.values = Some(values);
        self
    }

    /// Append one bound parameter.
    pub fn param(mut self, value: impl Into<PgValue>) -> Self {
        self.values.get_or_insert_with(Vec::new).push(value.into());
        self
    }

    /// Declare parameter types instead of inferring them from the values.
    pub fn param_types(mut self, types: Vec<Oid>) -> Self {
        self.param_types = types;
        self
    }

    /// Fetch in batches of `rows` through a portal.
    pub fn rows(mut self, rows: i32) -> Self {
        self.rows = Some(rows);
        self
    }

    pub fn portal(mut self, portal: impl Into<String>) -> Self {
        self.portal = portal.into();
        self
    }

    /// Ask for binary result columns (extended protocol only).
    pub fn binary(mut self, binary: bool) -> Self {
        self.binary = Some(binary);
        self
    }

    pub fn row_mode(mut self, mode: RowMode) -> Self {
        self.row_mode = Some(mode);
        self
    }

    /// Decoders for this query only.
    pub fn types(mut self, types: TypeOverrides) -> Self {
        self.types = Some(types);
        self
    }

    /// Use the extended protocol even without parameters.
    pub fn extended(mut self) -> Self {
        self.extended = true;
        self
    }

    /// Data to feed a `COPY ... FROM STDIN`.
    pub fn copy_in(mut self, data: impl Into<Bytes>) -> Self {
        self.copy_in = Some(data.into());
        self
    }

    /// Overrides the client's query timeout for this query.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether this query needs Parse/Bind/Execute instead of a simple `Q`.
    pub fn requires_preparation(&self) -> bool {
        if self.extended || self.name.is_some() || self.rows.is_some() {
            return true;
        }
        if self.text.is_empty() {
            return false;
        }
        self.values.as_ref().is_some_and(|v| !v.is_empty())
    }

    /// Reject what can never be put on the wire.
    pub(crate) fn validate(&self) -> PgResult<()> {
        if self.text.contains('\0') {
            return Err(PgError::InvalidQuery(
                "Query text must not contain NUL bytes".to_string(),
            ));
        }
        if self.name.as_deref().is_some_and(|n| n.contains('\0')) || self.portal.contains('\0') {
            return Err(PgError::InvalidQuery(
                "Statement and portal names must not contain NUL bytes".to_string(),
            ));
        }
        if matches!(self.rows, Some(n) if n <= 0) {
            return Err(PgError::InvalidQuery(
                "Row limit must be positive".to_string(),
            ));
        }
        if self.values.as_ref().is_some_and(|v| v.len() > i16::MAX as usize) {
            return Err(PgError::InvalidQuery(format!(
                "Too many parameters (max {})",
                i16::MAX
            )));
        }
        Ok(())
    }
}

impl From<&str> for Query {
    fn from(text: &str) -> Self {
        Query::new(text)
    }
}

impl From<String> for Query {
    fn from(text: String) -> Self {
        Query::new(text)
    }
}

impl From<&String> for Query {
    fn from(text: &String) -> Self {
        Query::new(text.as_str())
    }
}

impl<S: Into<String>> From<(S, Vec<PgValue>)> for Query {
    fn from((text, values): (S, Vec<PgValue>)) -> Self {
        Query::new(text).values(values)
    }
}

// ============================================================================
// Results
// ============================================================================

/// One result row.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<Vec<FieldDescription>>,
    values: Vec<PgValue>,
    mode: RowMode,
}

impl Row {
    /// Value of the column called `name`. With duplicate names the last
    /// column wins, as it would in an object.
    pub fn get(&self, name: &str) -> Option<&PgValue> {
        self.columns
            .iter()
            .rposition(|c| c.name == name)
            .and_then(|i| self.values.get(i))
    }

    pub fn get_index(&self, idx: usize) -> Option<&PgValue> {
        self.values.get(idx)
    }

    pub fn columns(&self) -> &[FieldDescription] {
        &self.columns
    }

    pub fn values(&self) -> &[PgValue] {
        &self.values
    }

    pub fn into_values(self) -> Vec<PgValue> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mode(&self) -> RowMode {
        self.mode
    }

    /// Render as a JSON object or array, depending on the row mode.
    pub fn to_json(&self) -> serde_json::Value {
        match self.mode {
            RowMode::Array => {
                serde_json::Value::Array(self.values.iter().map(Into::into).collect())
            }
            RowMode::Object => {
                let mut map = serde_json::Map::with_capacity(self.values.len());
                for (column, value) in self.columns.iter().zip(&self.values) {
                    map.insert(column.name.clone(), value.into());
                }
                serde_json::Value::Object(map)
            }
        }
    }
}

impl Index<usize> for Row {
    type Output = PgValue;

    fn index(&self, idx: usize) -> &PgValue {
        &self.values[idx]
    }
}

/// Outcome of one statement.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    /// First word of the command tag (`SELECT`, `INSERT`, ...)
    pub command: String,
    /// Rows affected or returned, when the tag carries a count
    pub row_count: Option<u64>,
    /// Oid from an `INSERT` tag
    pub oid: Option<u32>,
    pub fields: Arc<Vec<FieldDescription>>,
    pub rows: Vec<Row>,
    /// Payloads of a `COPY ... TO STDOUT`
    pub copy_data: Vec<Bytes>,
}

impl QueryResult {
    /// Parse a CommandComplete tag such as `INSERT 0 5` or `SELECT 3`.
    pub fn add_command_complete(&mut self, tag: &str) {
        let Some(caps) = COMMAND_TAG_RE.captures(tag) else {
            self.command = tag.to_string();
            return;
        };
        self.command = caps[1].to_string();

        let second = caps.get(2).and_then(|m| m.as_str().parse::<u64>().ok());
        match caps.get(3).and_then(|m| m.as_str().parse::<u64>().ok()) {
            Some(count) => {
                self.oid = second.and_then(|oid| u32::try_from(oid).ok());
                self.row_count = Some(count);
            }
            None => self.row_count = second,
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.command.is_empty()
    }
}

// ============================================================================
// Execution
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueryState {
    New,
    Running,
    Done,
}

/// What the client should do after a message was handled.
#[derive(Debug)]
pub(crate) enum Step {
    Continue,
    Done(PgResult<Vec<QueryResult>>),
}

/// A query on the wire.
///
/// Responses are folded into results until ReadyForQuery, which is the only
/// point where the outcome is delivered. A decode error wins over a backend
/// error, and either wins over the rows.
#[derive(Debug)]
pub(crate) struct Execution {
    query: Query,
    types: Arc<TypeOverrides>,
    binary: bool,
    row_mode: RowMode,
    state: QueryState,
    results: Vec<QueryResult>,
    error: Option<PgError>,
    decode_error: Option<PgError>,
    parse_pending: bool,
}

impl Execution {
    pub(crate) fn new(
        mut query: Query,
        types: &Arc<TypeOverrides>,
        binary: bool,
        row_mode: RowMode,
    ) -> Self {
        let types = match query.types.take() {
            Some(overrides) => Arc::new(overrides),
            None => types.clone(),
        };
        Self {
            binary: query.binary.unwrap_or(binary),
            row_mode: query.row_mode.unwrap_or(row_mode),
            query,
            types,
            state: QueryState::New,
            results: vec![QueryResult::default()],
            error: None,
            decode_error: None,
            parse_pending: false,
        }
    }

    pub(crate) fn state(&self) -> QueryState {
        self.state
    }

    /// Buffer this query's messages on `conn`; the caller sends them.
    ///
    /// A name reused with different text fails here, before anything is
    /// buffered.
    pub(crate) fn start(&mut self, conn: &mut Connection) -> PgResult<()> {
        if !self.query.requires_preparation() {
            debug!(query = %self.query.text, "Simple query");
            conn.query(&self.query.text);
            self.state = QueryState::Running;
            return Ok(());
        }

        let needs_parse = match &self.query.name {
            Some(name) => match conn.statements_mut().prepare(name, &self.query.text)? {
                Preparation::Reuse => false,
                Preparation::Parse { evicted } => {
                    if let Some(evicted) = evicted {
                        debug!(statement = %evicted, "Closing evicted statement");
                        conn.close(b'S', &evicted);
                    }
                    true
                }
            },
            None => true,
        };

        let statement = self.query.name.as_deref().unwrap_or("");
        let values = self.query.values.as_deref().unwrap_or(&[]);

        if needs_parse {
            let param_types = if self.query.param_types.is_empty() {
                values.iter().map(PgValue::type_oid).collect()
            } else {
                self.query.param_types.clone()
            };
            conn.parse(statement, &self.query.text, param_types);
            self.parse_pending = true;
        }
        debug!(
            query = %self.query.text,
            statement,
            reused = !needs_parse,
            "Extended query"
        );

        let result_format = if self.binary {
            Format::Binary
        } else {
            Format::Text
        };
        let portal = self.query.portal.as_str();
        conn.bind(&BindMessage::new(portal, statement, values, result_format))
            .describe(b'P', portal)
            .execute(portal, self.query.rows.unwrap_or(0));

        // Batched fetches sync once the portal is exhausted.
        if self.query.rows.is_some() {
            conn.flush();
        } else {
            conn.sync();
        }

        self.state = QueryState::Running;
        Ok(())
    }

    /// Fold one backend message into the query, buffering any reply on `conn`.
    pub(crate) fn handle(&mut self, msg: BackendMessage, conn: &mut Connection) -> Step {
        match msg {
            BackendMessage::RowDescription { fields } => {
                self.check_for_multirow();
                self.current().fields = Arc::new(fields);
            }
            BackendMessage::DataRow { values } => self.handle_data_row(values),
            BackendMessage::CommandComplete { tag } => {
                self.check_for_multirow();
                self.current().add_command_complete(&tag);
                if self.query.rows.is_some() {
                    conn.sync();
                }
            }
            BackendMessage::EmptyQueryResponse => {
                if self.query.rows.is_some() {
                    conn.sync();
                }
            }
            BackendMessage::PortalSuspended => {
                trace!(portal = %self.query.portal, "Fetching next batch");
                conn.execute(&self.query.portal, self.query.rows.unwrap_or(0))
                    .flush();
            }
            BackendMessage::ParseComplete => self.parse_pending = false,
            BackendMessage::ErrorResponse(db) => self.handle_error(PgError::Db(db), conn),
            BackendMessage::CopyInResponse { .. } => self.handle_copy_in(conn),
            BackendMessage::CopyBothResponse { .. } => {
                conn.copy_fail("COPY BOTH is not supported");
            }
            BackendMessage::CopyData { data } => self.current().copy_data.push(data),
            BackendMessage::ReadyForQuery { .. } => return Step::Done(self.finish()),
            _ => {}
        }
        Step::Continue
    }

    /// Deliver the outcome now because the connection died. An error
    /// already recorded (a decode error, or a FATAL from the backend) is
    /// more useful than `err`.
    pub(crate) fn fail(&mut self, err: PgError) -> PgResult<Vec<QueryResult>> {
        self.state = QueryState::Done;
        Err(self
            .decode_error
            .take()
            .or_else(|| self.error.take())
            .unwrap_or(err))
    }

    fn current(&mut self) -> &mut QueryResult {
        if self.results.is_empty() {
            self.results.push(QueryResult::default());
        }
        let last = self.results.len() - 1;
        &mut self.results[last]
    }

    /// A new RowDescription or CommandComplete after a completed statement
    /// belongs to the next statement of a multi-statement query.
    fn check_for_multirow(&mut self) {
        if self.current().is_complete() {
            self.results.push(QueryResult::default());
        }
    }

    fn handle_data_row(&mut self, raw: RawRow) {
        if self.decode_error.is_some() {
            return;
        }

        let columns = self.current().fields.clone();
        let mut values = Vec::with_capacity(raw.len());

        for (i, raw) in raw.iter().enumerate() {
            let value = match raw {
                None => PgValue::Null,
                Some(raw) => {
                    let oid = columns.get(i).map_or(Oid::UNSPECIFIED, |f| f.type_oid);
                    match self.types.decode(oid, raw) {
                        Ok(v) => v,
                        Err(e) => {
                            self.decode_error = Some(e);
                            return;
                        }
                    }
                }
            };
            values.push(value);
        }

        let row = Row {
            columns,
            values,
            mode: self.row_mode,
        };
        self.current().rows.push(row);
    }

    fn handle_error(&mut self, err: PgError, conn: &mut Connection) {
        if self.parse_pending {
            self.parse_pending = false;
            if let Some(name) = &self.query.name {
                conn.statements_mut().remove(name);
            }
        }
        // Nothing after a batched Execute synced; the server waits for one.
        if self.query.rows.is_some() {
            conn.sync();
        }
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn handle_copy_in(&mut self, conn: &mut Connection) {
        match &self.query.copy_in {
            Some(data) => {
                let mut offset = 0;
                while offset < data.len() {
                    let end = (offset + COPY_CHUNK).min(data.len());
                    conn.copy_data(data.slice(offset..end));
                    offset = end;
                }
                conn.copy_done();
            }
            None => {
                conn.copy_fail("No source stream defined");
            }
        }
    }

    fn finish(&mut self) -> PgResult<Vec<QueryResult>> {
        self.state = QueryState::Done;
        if let Some(err) = self.decode_error.take() {
            return Err(err);
        }
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        Ok(std::mem::take(&mut self.results))
    }
}
