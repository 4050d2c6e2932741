//! Type registry: `(type oid, format)` to decoder.
//!
//! The built-in tables are seeded once per process and never mutated.
//! Consumers customise decoding through [`TypeOverrides`], which a client
//! holds and consults before the built-ins.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;

use super::decode::{binary, text};
use super::error::PgResult;
use super::protocol::{Format, RawValue};
use super::types::{Oid, PgValue, ARRAY_TYPES};

/// Decodes one text-format column value.
pub type TextDecoder = Arc<dyn Fn(&str) -> PgResult<PgValue> + Send + Sync>;

/// Decodes one binary-format column value.
pub type BinaryDecoder = Arc<dyn Fn(&[u8]) -> PgResult<PgValue> + Send + Sync>;

/// Two independent decoder tables, one per wire format.
#[derive(Clone, Default)]
pub struct TypeRegistry {
    text: HashMap<Oid, TextDecoder>,
    binary: HashMap<Oid, BinaryDecoder>,
}

static BUILTIN: Lazy<TypeRegistry> = Lazy::new(TypeRegistry::with_builtins);

impl TypeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide built-in decoders.
    pub fn builtin() -> &'static TypeRegistry {
        &BUILTIN
    }

    fn with_builtins() -> Self {
        let mut reg = Self::new();

        reg.set_text(Oid::BOOL, text::bool);
        reg.set_text(Oid::INT2, text::int2);
        reg.set_text(Oid::INT4, text::int4);
        reg.set_text(Oid::INT8, text::int8);
        reg.set_text(Oid::OID_TYPE, text::oid);
        reg.set_text(Oid::FLOAT4, text::float4);
        reg.set_text(Oid::FLOAT8, text::float8);
        reg.set_text(Oid::NUMERIC, text::numeric);
        reg.set_text(Oid::BYTEA, text::bytea);
        reg.set_text(Oid::UUID, text::uuid);
        reg.set_text(Oid::JSON, text::json);
        reg.set_text(Oid::JSONB, text::json);
        reg.set_text(Oid::TIMESTAMP, text::timestamp);
        reg.set_text(Oid::TIMESTAMPTZ, text::timestamptz);
        reg.set_text(Oid::DATE, text::date);
        reg.set_text(Oid::TIME, text::time);
        reg.set_text(Oid::TIMETZ, text::time);
        reg.set_text(Oid::INTERVAL, text::interval);
        for oid in [Oid::TEXT, Oid::VARCHAR, Oid::BPCHAR, Oid::CHAR, Oid::NAME] {
            reg.set_text(oid, text::text);
        }

        reg.set_binary(Oid::BOOL, binary::bool);
        reg.set_binary(Oid::INT2, binary::int2);
        reg.set_binary(Oid::INT4, binary::int4);
        reg.set_binary(Oid::INT8, binary::int8);
        reg.set_binary(Oid::OID_TYPE, binary::oid);
        reg.set_binary(Oid::FLOAT4, binary::float4);
        reg.set_binary(Oid::FLOAT8, binary::float8);
        reg.set_binary(Oid::NUMERIC, binary::numeric);
        reg.set_binary(Oid::BYTEA, binary::bytea);
        reg.set_binary(Oid::UUID, binary::uuid);
        reg.set_binary(Oid::JSON, binary::json);
        reg.set_binary(Oid::JSONB, binary::jsonb);
        reg.set_binary(Oid::TIMESTAMP, binary::timestamp);
        reg.set_binary(Oid::TIMESTAMPTZ, binary::timestamptz);
        reg.set_binary(Oid::DATE, binary::date);
        reg.set_binary(Oid::TIME, binary::time);
        reg.set_binary(Oid::TIMETZ, binary::time);
        reg.set_binary(Oid::INTERVAL, binary::interval);
        for oid in [Oid::TEXT, Oid::VARCHAR, Oid::BPCHAR, Oid::CHAR, Oid::NAME] {
            reg.set_binary(oid, binary::text);
        }

        // Arrays wrap their element decoder; elements without one stay text.
        for &(array, elem) in ARRAY_TYPES {
            let elem_text: TextDecoder = match reg.text.get(&elem) {
                Some(decode) => decode.clone(),
                None => Arc::new(text::text),
            };
            reg.text.insert(
                array,
                Arc::new(move |s: &str| text::array(s, &*elem_text)),
            );

            let elem_binary: BinaryDecoder = match reg.binary.get(&elem) {
                Some(decode) => decode.clone(),
                None => Arc::new(binary::text),
            };
            reg.binary.insert(
                array,
                Arc::new(move |data: &[u8]| binary::array(data, &*elem_binary)),
            );
        }

        reg
    }

    /// Register a text-format decoder, replacing any previous one.
    pub fn set_text<F>(&mut self, oid: Oid, f: F) -> &mut Self
    where
        F: Fn(&str) -> PgResult<PgValue> + Send + Sync + 'static,
    {
        self.text.insert(oid, Arc::new(f));
        self
    }

    /// Register a binary-format decoder, replacing any previous one.
    pub fn set_binary<F>(&mut self, oid: Oid, f: F) -> &mut Self
    where
        F: Fn(&[u8]) -> PgResult<PgValue> + Send + Sync + 'static,
    {
        self.binary.insert(oid, Arc::new(f));
        self
    }

    pub fn text_decoder(&self, oid: Oid) -> Option<&TextDecoder> {
        self.text.get(&oid)
    }

    pub fn binary_decoder(&self, oid: Oid) -> Option<&BinaryDecoder> {
        self.binary.get(&oid)
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.binary.is_empty()
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut text: Vec<_> = self.text.keys().map(|o| o.0).collect();
        let mut binary: Vec<_> = self.binary.keys().map(|o| o.0).collect();
        text.sort_unstable();
        binary.sort_unstable();
        f.debug_struct("TypeRegistry")
            .field("text", &text)
            .field("binary", &binary)
            .finish()
    }
}

/// Per-client (or per-query) decoder overrides.
///
/// Lookup order is override, then built-in, then fallback: text values stay
/// strings and binary values stay raw bytes.
///
/// ```
/// use pglink::pg::{Oid, PgValue, TypeOverrides};
///
/// let mut types = TypeOverrides::new();
/// // Read int8 columns as text instead of native integers.
/// types.set_text_parser(Oid::INT8, |s| Ok(PgValue::Text(s.to_string())));
///
/// assert_eq!(types.decode_text(Oid::INT8, "42").unwrap(), PgValue::Text("42".into()));
/// assert_eq!(types.decode_text(Oid::INT4, "42").unwrap(), PgValue::Int4(42));
/// ```
#[derive(Debug, Clone, Default)]
pub struct TypeOverrides {
    overrides: TypeRegistry,
}

impl TypeOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_text_parser<F>(&mut self, oid: Oid, f: F) -> &mut Self
    where
        F: Fn(&str) -> PgResult<PgValue> + Send + Sync + 'static,
    {
        self.overrides.set_text(oid, f);
        self
    }

    pub fn set_binary_parser<F>(&mut self, oid: Oid, f: F) -> &mut Self
    where
        F: Fn(&[u8]) -> PgResult<PgValue> + Send + Sync + 'static,
    {
        self.overrides.set_binary(oid, f);
        self
    }

    /// The decoder in effect for `(oid, format)`, if any.
    pub fn has_parser(&self, oid: Oid, format: Format) -> bool {
        match format {
            Format::Text => self
                .overrides
                .text_decoder(oid)
                .or_else(|| BUILTIN.text_decoder(oid))
                .is_some(),
            Format::Binary => self
                .overrides
                .binary_decoder(oid)
                .or_else(|| BUILTIN.binary_decoder(oid))
                .is_some(),
        }
    }

    pub fn decode_text(&self, oid: Oid, s: &str) -> PgResult<PgValue> {
        match self
            .overrides
            .text_decoder(oid)
            .or_else(|| BUILTIN.text_decoder(oid))
        {
            Some(decode) => decode(s),
            None => Ok(PgValue::Text(s.to_string())),
        }
    }

    pub fn decode_binary(&self, oid: Oid, data: &[u8]) -> PgResult<PgValue> {
        match self
            .overrides
            .binary_decoder(oid)
            .or_else(|| BUILTIN.binary_decoder(oid))
        {
            Some(decode) => decode(data),
            None => Ok(PgValue::Raw {
                oid,
                data: data.to_vec(),
            }),
        }
    }

    /// Decode a column in whichever format it arrived.
    pub fn decode(&self, oid: Oid, raw: &RawValue) -> PgResult<PgValue> {
        match raw {
            RawValue::Text(s) => self.decode_text(oid, s),
            RawValue::Binary(b) => self.decode_binary(oid, b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_builtin_covers_arrays() {
        let reg = TypeRegistry::builtin();
        for &(array, _) in ARRAY_TYPES {
            assert!(reg.text_decoder(array).is_some(), "{:?}", array);
            assert!(reg.binary_decoder(array).is_some(), "{:?}", array);
        }
    }

    #[test]
    fn test_fallbacks() {
        let types = TypeOverrides::new();
        let unknown = Oid(424242);
        assert_eq!(
            types.decode_text(unknown, "(1,2)").unwrap(),
            PgValue::Text("(1,2)".into())
        );
        assert_eq!(
            types.decode_binary(unknown, &[1, 2]).unwrap(),
            PgValue::Raw {
                oid: unknown,
                data: vec![1, 2]
            }
        );
        assert!(!types.has_parser(unknown, Format::Text));
    }

    #[test]
    fn test_override_wins_per_format() {
        let mut types = TypeOverrides::new();
        types.set_binary_parser(Oid::INT8, |data| {
            let v = i64::from_be_bytes(data.try_into().map_err(|_| {
                crate::pg::PgError::Type("bad int8".to_string())
            })?);
            Ok(PgValue::Float8(v as f64))
        });

        let raw = RawValue::Binary(Bytes::from_static(&[0, 0, 0, 0, 0, 0, 0, 9]));
        assert_eq!(types.decode(Oid::INT8, &raw).unwrap(), PgValue::Float8(9.0));

        // The text table is untouched.
        let raw = RawValue::Text("9".to_string());
        assert_eq!(types.decode(Oid::INT8, &raw).unwrap(), PgValue::Int8(9));

        // Built-ins are shared and unaffected by overrides.
        assert_eq!(
            TypeOverrides::new()
                .decode_binary(Oid::INT8, &9i64.to_be_bytes())
                .unwrap(),
            PgValue::Int8(9)
        );
    }

    #[test]
    fn test_text_array_of_timestamps() {
        let types = TypeOverrides::new();
        let v = types
            .decode_text(
                Oid::TIMESTAMPTZ_ARRAY,
                r#"{"2024-01-01 00:00:00+00",NULL}"#,
            )
            .unwrap();
        assert_eq!(
            v,
            PgValue::Array(vec![
                PgValue::TimestampTz(757_382_400_000_000),
                PgValue::Null
            ])
        );
    }
}
