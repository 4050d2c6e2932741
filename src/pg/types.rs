//! PostgreSQL type identifiers, values and parameter encoding.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};

use super::protocol::Format;

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifiers (OIDs).
///
/// These are the built-in type OIDs from PostgreSQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid(pub i32);

impl Oid {
    /// Let the server infer the type.
    pub const UNSPECIFIED: Oid = Oid(0);

    // Boolean types
    pub const BOOL: Oid = Oid(16);

    // Binary data
    pub const BYTEA: Oid = Oid(17);

    // Character types
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);

    // Integer types
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);

    // Text types
    pub const TEXT: Oid = Oid(25);

    // OID type
    pub const OID_TYPE: Oid = Oid(26);

    // Floating point types
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);

    // Money
    pub const MONEY: Oid = Oid(790);

    // String types
    pub const VARCHAR: Oid = Oid(1043);
    pub const BPCHAR: Oid = Oid(1042);

    // Date/time types
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const INTERVAL: Oid = Oid(1186);
    pub const TIMETZ: Oid = Oid(1266);

    // Network types
    pub const INET: Oid = Oid(869);
    pub const CIDR: Oid = Oid(650);
    pub const MACADDR: Oid = Oid(829);

    // UUID
    pub const UUID: Oid = Oid(2950);

    // JSON types
    pub const JSON: Oid = Oid(114);
    pub const JSONB: Oid = Oid(3802);

    // Numeric
    pub const NUMERIC: Oid = Oid(1700);

    // Array types
    pub const BOOL_ARRAY: Oid = Oid(1000);
    pub const BYTEA_ARRAY: Oid = Oid(1001);
    pub const CHAR_ARRAY: Oid = Oid(1002);
    pub const INT2_ARRAY: Oid = Oid(1005);
    pub const INT4_ARRAY: Oid = Oid(1007);
    pub const TEXT_ARRAY: Oid = Oid(1009);
    pub const BPCHAR_ARRAY: Oid = Oid(1014);
    pub const VARCHAR_ARRAY: Oid = Oid(1015);
    pub const INT8_ARRAY: Oid = Oid(1016);
    pub const FLOAT4_ARRAY: Oid = Oid(1021);
    pub const FLOAT8_ARRAY: Oid = Oid(1022);
    pub const OID_ARRAY: Oid = Oid(1028);
    pub const TIMESTAMP_ARRAY: Oid = Oid(1115);
    pub const DATE_ARRAY: Oid = Oid(1182);
    pub const TIME_ARRAY: Oid = Oid(1183);
    pub const TIMESTAMPTZ_ARRAY: Oid = Oid(1185);
    pub const INTERVAL_ARRAY: Oid = Oid(1187);
    pub const NUMERIC_ARRAY: Oid = Oid(1231);
    pub const JSON_ARRAY: Oid = Oid(199);
    pub const UUID_ARRAY: Oid = Oid(2951);
    pub const JSONB_ARRAY: Oid = Oid(3807);

    /// Create from raw i32 value
    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    /// Get the raw i32 value
    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// Check if this is a text-like type
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME
        )
    }

    /// Check if this is an integer type
    pub fn is_integer(self) -> bool {
        matches!(self, Oid::INT2 | Oid::INT4 | Oid::INT8)
    }

    /// Check if this is a floating point type
    pub fn is_float(self) -> bool {
        matches!(self, Oid::FLOAT4 | Oid::FLOAT8)
    }

    /// Element type of a built-in array type.
    pub fn array_element(self) -> Option<Oid> {
        ARRAY_TYPES
            .iter()
            .find(|(array, _)| *array == self)
            .map(|(_, elem)| *elem)
    }

    /// Array type whose elements are of this type.
    pub fn array_of(self) -> Option<Oid> {
        ARRAY_TYPES
            .iter()
            .find(|(_, elem)| *elem == self)
            .map(|(array, _)| *array)
    }
}

/// `(array oid, element oid)` for every built-in array decoder.
pub(crate) const ARRAY_TYPES: &[(Oid, Oid)] = &[
    (Oid::BOOL_ARRAY, Oid::BOOL),
    (Oid::BYTEA_ARRAY, Oid::BYTEA),
    (Oid::CHAR_ARRAY, Oid::CHAR),
    (Oid::INT2_ARRAY, Oid::INT2),
    (Oid::INT4_ARRAY, Oid::INT4),
    (Oid::TEXT_ARRAY, Oid::TEXT),
    (Oid::BPCHAR_ARRAY, Oid::BPCHAR),
    (Oid::VARCHAR_ARRAY, Oid::VARCHAR),
    (Oid::INT8_ARRAY, Oid::INT8),
    (Oid::FLOAT4_ARRAY, Oid::FLOAT4),
    (Oid::FLOAT8_ARRAY, Oid::FLOAT8),
    (Oid::OID_ARRAY, Oid::OID_TYPE),
    (Oid::TIMESTAMP_ARRAY, Oid::TIMESTAMP),
    (Oid::DATE_ARRAY, Oid::DATE),
    (Oid::TIME_ARRAY, Oid::TIME),
    (Oid::TIMESTAMPTZ_ARRAY, Oid::TIMESTAMPTZ),
    (Oid::INTERVAL_ARRAY, Oid::INTERVAL),
    (Oid::NUMERIC_ARRAY, Oid::NUMERIC),
    (Oid::JSON_ARRAY, Oid::JSON),
    (Oid::UUID_ARRAY, Oid::UUID),
    (Oid::JSONB_ARRAY, Oid::JSONB),
];

// ============================================================================
// Time Helpers
// ============================================================================

/// Microseconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
pub const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

/// Days between the Unix epoch and the PostgreSQL epoch.
pub const PG_EPOCH_OFFSET_DAYS: i32 = 10_957;

fn pg_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2000, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

/// Timestamp from microseconds since 2000-01-01; `None` for infinities.
pub fn micros_to_naive(micros: i64) -> Option<NaiveDateTime> {
    if micros == i64::MAX || micros == i64::MIN {
        return None;
    }
    pg_epoch().checked_add_signed(Duration::microseconds(micros))
}

/// Microseconds since 2000-01-01.
pub fn naive_to_micros(dt: NaiveDateTime) -> Option<i64> {
    dt.signed_duration_since(pg_epoch()).num_microseconds()
}

/// Date from days since 2000-01-01; `None` for infinities.
pub fn days_to_date(days: i32) -> Option<NaiveDate> {
    if days == i32::MAX || days == i32::MIN {
        return None;
    }
    pg_epoch()
        .date()
        .checked_add_signed(Duration::days(days as i64))
}

/// Days since 2000-01-01.
pub fn date_to_days(date: NaiveDate) -> i32 {
    date.signed_duration_since(pg_epoch().date()).num_days() as i32
}

// ============================================================================
// PostgreSQL Values
// ============================================================================

/// A PostgreSQL value with type information.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    /// Arbitrary precision, kept in its canonical text form.
    Numeric(String),
    Text(String),
    Bytea(Vec<u8>),
    Uuid(uuid::Uuid),
    /// Microseconds since 2000-01-01; `i64::MAX`/`i64::MIN` are +/-infinity.
    Timestamp(i64),
    /// Microseconds since 2000-01-01 UTC.
    TimestampTz(i64),
    /// Days since 2000-01-01; `i32::MAX`/`i32::MIN` are +/-infinity.
    Date(i32),
    /// Microseconds since midnight.
    Time(i64),
    Interval {
        months: i32,
        days: i32,
        micros: i64,
    },
    Json(serde_json::Value),
    Array(Vec<PgValue>),
    // For types we don't handle specially - store raw bytes
    Raw {
        oid: Oid,
        data: Vec<u8>,
    },
}

impl PgValue {
    /// Check if this value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    /// Build an array parameter.
    pub fn array<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<PgValue>,
    {
        PgValue::Array(items.into_iter().map(Into::into).collect())
    }

    /// Get the OID for this value's type
    pub fn type_oid(&self) -> Oid {
        match self {
            PgValue::Null => Oid::UNSPECIFIED,
            PgValue::Bool(_) => Oid::BOOL,
            PgValue::Int2(_) => Oid::INT2,
            PgValue::Int4(_) => Oid::INT4,
            PgValue::Int8(_) => Oid::INT8,
            PgValue::Float4(_) => Oid::FLOAT4,
            PgValue::Float8(_) => Oid::FLOAT8,
            PgValue::Numeric(_) => Oid::NUMERIC,
            PgValue::Text(_) => Oid::TEXT,
            PgValue::Bytea(_) => Oid::BYTEA,
            PgValue::Uuid(_) => Oid::UUID,
            PgValue::Timestamp(_) => Oid::TIMESTAMP,
            PgValue::TimestampTz(_) => Oid::TIMESTAMPTZ,
            PgValue::Date(_) => Oid::DATE,
            PgValue::Time(_) => Oid::TIME,
            PgValue::Interval { .. } => Oid::INTERVAL,
            PgValue::Json(_) => Oid::JSON,
            PgValue::Array(items) => items
                .iter()
                .find(|v| !v.is_null())
                .and_then(|v| v.type_oid().array_of())
                .unwrap_or(Oid::UNSPECIFIED),
            PgValue::Raw { oid, .. } => *oid,
        }
    }

    /// Wire format this value is sent in as a bind parameter.
    ///
    /// Scalars go binary; numerics and arrays go as text literals the
    /// server parses for us.
    pub fn param_format(&self) -> Format {
        match self {
            PgValue::Null | PgValue::Numeric(_) | PgValue::Array(_) => Format::Text,
            _ => Format::Binary,
        }
    }

    /// Encode as a bind parameter in `format`; `None` is SQL NULL.
    pub fn encode_param(&self, format: Format) -> Option<Vec<u8>> {
        if self.is_null() {
            return None;
        }
        match format {
            Format::Binary => Some(self.encode_binary()),
            Format::Text => self.to_text().map(String::into_bytes),
        }
    }

    /// Encode this value to binary format.
    pub fn encode_binary(&self) -> Vec<u8> {
        match self {
            PgValue::Null => vec![],
            PgValue::Bool(v) => vec![if *v { 1 } else { 0 }],
            PgValue::Int2(v) => v.to_be_bytes().to_vec(),
            PgValue::Int4(v) => v.to_be_bytes().to_vec(),
            PgValue::Int8(v) => v.to_be_bytes().to_vec(),
            PgValue::Float4(v) => v.to_be_bytes().to_vec(),
            PgValue::Float8(v) => v.to_be_bytes().to_vec(),
            PgValue::Numeric(v) => v.as_bytes().to_vec(),
            PgValue::Text(v) => v.as_bytes().to_vec(),
            PgValue::Bytea(v) => v.clone(),
            PgValue::Uuid(v) => v.as_bytes().to_vec(),
            PgValue::Timestamp(v) | PgValue::TimestampTz(v) => v.to_be_bytes().to_vec(),
            PgValue::Date(v) => v.to_be_bytes().to_vec(),
            PgValue::Time(v) => v.to_be_bytes().to_vec(),
            PgValue::Interval {
                months,
                days,
                micros,
            } => {
                let mut out = Vec::with_capacity(16);
                out.extend_from_slice(&micros.to_be_bytes());
                out.extend_from_slice(&days.to_be_bytes());
                out.extend_from_slice(&months.to_be_bytes());
                out
            }
            PgValue::Json(v) => v.to_string().into_bytes(),
            PgValue::Array(_) => self.to_text().unwrap_or_default().into_bytes(),
            PgValue::Raw { data, .. } => data.clone(),
        }
    }

    /// Text representation as PostgreSQL would print it; `None` for NULL.
    pub fn to_text(&self) -> Option<String> {
        let text = match self {
            PgValue::Null => return None,
            PgValue::Bool(v) => if *v { "t" } else { "f" }.to_string(),
            PgValue::Int2(v) => v.to_string(),
            PgValue::Int4(v) => v.to_string(),
            PgValue::Int8(v) => v.to_string(),
            PgValue::Float4(v) => format_float(*v),
            PgValue::Float8(v) => format_float(*v),
            PgValue::Numeric(v) | PgValue::Text(v) => v.clone(),
            PgValue::Bytea(v) => {
                let mut s = String::with_capacity(2 + v.len() * 2);
                s.push_str("\\x");
                for b in v {
                    s.push_str(&format!("{:02x}", b));
                }
                s
            }
            PgValue::Uuid(v) => v.hyphenated().to_string(),
            PgValue::Timestamp(v) => format_timestamp(*v, false),
            PgValue::TimestampTz(v) => format_timestamp(*v, true),
            PgValue::Date(v) => format_date(*v),
            PgValue::Time(v) => format_time(*v),
            PgValue::Interval {
                months,
                days,
                micros,
            } => format_interval(*months, *days, *micros),
            PgValue::Json(v) => v.to_string(),
            PgValue::Array(items) => array_literal(items),
            PgValue::Raw { data, .. } => String::from_utf8_lossy(data).into_owned(),
        };
        Some(text)
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PgValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Any integer width widened to i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PgValue::Int2(v) => Some(*v as i64),
            PgValue::Int4(v) => Some(*v as i64),
            PgValue::Int8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PgValue::Float4(v) => Some(*v as f64),
            PgValue::Float8(v) => Some(*v),
            _ => None,
        }
    }

    /// Text and numeric values as a string slice.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PgValue::Text(v) | PgValue::Numeric(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            PgValue::Bytea(v) => Some(v),
            PgValue::Raw { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<uuid::Uuid> {
        match self {
            PgValue::Uuid(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            PgValue::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[PgValue]> {
        match self {
            PgValue::Array(v) => Some(v),
            _ => None,
        }
    }

    /// Timestamps without zone; `None` for infinities.
    pub fn as_naive_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            PgValue::Timestamp(v) | PgValue::TimestampTz(v) => micros_to_naive(*v),
            _ => None,
        }
    }

    /// Timestamps as UTC instants; `None` for infinities.
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        self.as_naive_datetime().map(|dt| dt.and_utc())
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            PgValue::Date(v) => days_to_date(*v),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<NaiveTime> {
        match self {
            PgValue::Time(v) => {
                let secs = (*v / 1_000_000) as u32;
                let nanos = ((*v % 1_000_000) * 1_000) as u32;
                NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
            }
            _ => None,
        }
    }
}

// ============================================================================
// Conversions
// ============================================================================

macro_rules! impl_from {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$t> for PgValue {
                fn from(v: $t) -> Self {
                    PgValue::$variant(v.into())
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i16 => Int2,
    i32 => Int4,
    i64 => Int8,
    f32 => Float4,
    f64 => Float8,
    String => Text,
    &str => Text,
    Vec<u8> => Bytea,
    &[u8] => Bytea,
    uuid::Uuid => Uuid,
    serde_json::Value => Json,
}

impl From<NaiveDateTime> for PgValue {
    fn from(v: NaiveDateTime) -> Self {
        naive_to_micros(v).map_or(PgValue::Null, PgValue::Timestamp)
    }
}

impl From<DateTime<Utc>> for PgValue {
    fn from(v: DateTime<Utc>) -> Self {
        naive_to_micros(v.naive_utc()).map_or(PgValue::Null, PgValue::TimestampTz)
    }
}

impl From<NaiveDate> for PgValue {
    fn from(v: NaiveDate) -> Self {
        PgValue::Date(date_to_days(v))
    }
}

impl From<NaiveTime> for PgValue {
    fn from(v: NaiveTime) -> Self {
        let midnight = NaiveTime::from_hms_opt(0, 0, 0).unwrap_or_default();
        let micros = v.signed_duration_since(midnight).num_microseconds();
        micros.map_or(PgValue::Null, PgValue::Time)
    }
}

impl<T: Into<PgValue>> From<Option<T>> for PgValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(PgValue::Null, Into::into)
    }
}

/// Numbers and booleans map natively; everything else uses its text form.
impl From<&PgValue> for serde_json::Value {
    fn from(v: &PgValue) -> Self {
        use serde_json::Value;

        match v {
            PgValue::Null => Value::Null,
            PgValue::Bool(b) => Value::Bool(*b),
            PgValue::Int2(i) => Value::from(*i),
            PgValue::Int4(i) => Value::from(*i),
            PgValue::Int8(i) => Value::from(*i),
            PgValue::Float4(f) => Value::from(*f as f64),
            PgValue::Float8(f) => Value::from(*f),
            PgValue::Json(j) => j.clone(),
            PgValue::Array(items) => Value::Array(items.iter().map(Value::from).collect()),
            other => other.to_text().map_or(Value::Null, Value::String),
        }
    }
}

// ============================================================================
// Text Formatting
// ============================================================================

/// Shortest digits that round-trip at the value's own width.
fn format_float<F: Copy + Into<f64> + std::fmt::Display>(v: F) -> String {
    let wide: f64 = v.into();
    if wide.is_nan() {
        "NaN".to_string()
    } else if wide.is_infinite() {
        (if wide > 0.0 { "Infinity" } else { "-Infinity" }).to_string()
    } else {
        v.to_string()
    }
}

fn format_year(year: i32) -> (i32, &'static str) {
    if year <= 0 {
        (1 - year, " BC")
    } else {
        (year, "")
    }
}

fn format_timestamp(micros: i64, with_tz: bool) -> String {
    match micros {
        i64::MAX => return "infinity".to_string(),
        i64::MIN => return "-infinity".to_string(),
        _ => {}
    }
    let Some(dt) = micros_to_naive(micros) else {
        return micros.to_string();
    };
    let (year, era) = format_year(chrono::Datelike::year(&dt));
    let mut out = format!("{:04}-{}", year, dt.format("%m-%d %H:%M:%S%.6f"));
    if with_tz {
        out.push_str("+00");
    }
    out.push_str(era);
    out
}

fn format_date(days: i32) -> String {
    match days {
        i32::MAX => return "infinity".to_string(),
        i32::MIN => return "-infinity".to_string(),
        _ => {}
    }
    match days_to_date(days) {
        Some(date) => {
            let (year, era) = format_year(chrono::Datelike::year(&date));
            format!("{:04}-{}{}", year, date.format("%m-%d"), era)
        }
        None => days.to_string(),
    }
}

fn format_time(micros: i64) -> String {
    let secs = micros / 1_000_000;
    let frac = micros % 1_000_000;
    format!(
        "{:02}:{:02}:{:02}.{:06}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60,
        frac
    )
}

fn format_interval(months: i32, days: i32, micros: i64) -> String {
    format!("{} mons {} days {} microseconds", months, days, micros)
}

/// `{a,"b c",NULL}` literal with quoting for anything ambiguous.
fn array_literal(items: &[PgValue]) -> String {
    let mut out = String::from("{");
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        match item {
            PgValue::Null => out.push_str("NULL"),
            PgValue::Array(inner) => out.push_str(&array_literal(inner)),
            other => {
                let text = other.to_text().unwrap_or_default();
                out.push('"');
                for c in text.chars() {
                    if c == '"' || c == '\\' {
                        out.push('\\');
                    }
                    out.push(c);
                }
                out.push('"');
            }
        }
    }
    out.push('}');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oid_classification() {
        assert!(Oid::TEXT.is_text_like());
        assert!(Oid::VARCHAR.is_text_like());
        assert!(!Oid::INT4.is_text_like());

        assert!(Oid::INT4.is_integer());
        assert!(Oid::INT8.is_integer());
        assert!(!Oid::FLOAT8.is_integer());

        assert!(Oid::FLOAT4.is_float());
        assert!(Oid::FLOAT8.is_float());
        assert!(!Oid::INT4.is_float());
    }

    #[test]
    fn test_array_oids() {
        assert_eq!(Oid::INT4_ARRAY.array_element(), Some(Oid::INT4));
        assert_eq!(Oid::TEXT.array_of(), Some(Oid::TEXT_ARRAY));
        assert_eq!(Oid::INT4.array_element(), None);

        assert_eq!(PgValue::array([1i32, 2]).type_oid(), Oid::INT4_ARRAY);
        assert_eq!(
            PgValue::Array(vec![PgValue::Null]).type_oid(),
            Oid::UNSPECIFIED
        );
    }

    #[test]
    fn test_param_encoding() {
        assert_eq!(PgValue::Null.encode_param(Format::Text), None);
        assert_eq!(PgValue::Null.type_oid(), Oid::UNSPECIFIED);

        let v = PgValue::Int4(7);
        assert_eq!(v.param_format(), Format::Binary);
        assert_eq!(v.encode_param(Format::Binary), Some(vec![0, 0, 0, 7]));

        let n = PgValue::Numeric("12.50".into());
        assert_eq!(n.param_format(), Format::Text);
        assert_eq!(n.encode_param(Format::Text), Some(b"12.50".to_vec()));
    }

    #[test]
    fn test_float_text() {
        assert_eq!(PgValue::Float4(0.1).to_text().as_deref(), Some("0.1"));
        assert_eq!(PgValue::Float4(f32::NAN).to_text().as_deref(), Some("NaN"));
        assert_eq!(
            PgValue::Float4(f32::NEG_INFINITY).to_text().as_deref(),
            Some("-Infinity")
        );
        assert_eq!(PgValue::Float8(0.1).to_text().as_deref(), Some("0.1"));
        assert_eq!(
            PgValue::Array(vec![PgValue::Float4(1.5), PgValue::Float4(0.1)])
                .to_text()
                .as_deref(),
            Some(r#"{"1.5","0.1"}"#)
        );
    }

    #[test]
    fn test_array_literal() {
        let v = PgValue::Array(vec![
            PgValue::Text("a".into()),
            PgValue::Null,
            PgValue::Text("say \"hi\"".into()),
            PgValue::Array(vec![PgValue::Int4(1)]),
        ]);
        assert_eq!(
            v.to_text().unwrap(),
            r#"{"a",NULL,"say \"hi\"",{"1"}}"#
        );
    }

    #[test]
    fn test_timestamp_helpers() {
        let dt = NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let v = PgValue::from(dt);
        assert_eq!(v, PgValue::Timestamp(757_382_400_000_000));
        assert_eq!(v.as_naive_datetime(), Some(dt));
        assert_eq!(v.to_text().unwrap(), "2024-01-01 00:00:00.000000");

        assert_eq!(PgValue::Timestamp(i64::MAX).as_naive_datetime(), None);
        assert_eq!(PgValue::Timestamp(i64::MIN).to_text().unwrap(), "-infinity");

        let date = NaiveDate::from_ymd_opt(1999, 12, 31).unwrap();
        assert_eq!(PgValue::from(date), PgValue::Date(-1));
        assert_eq!(PgValue::Date(-1).as_date(), Some(date));
    }

    #[test]
    fn test_bytea_text() {
        assert_eq!(
            PgValue::Bytea(vec![0xde, 0xad]).to_text().unwrap(),
            "\\xdead"
        );
    }
}
