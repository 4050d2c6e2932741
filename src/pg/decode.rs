//! Built-in value decoders for both wire formats.
//!
//! Every decoder for a given type yields the same [`PgValue`] whichever format
//! the server chose, so callers never need to care how a column was sent.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

use super::error::{PgError, PgResult};
use super::types::{date_to_days, naive_to_micros, PgValue};

/// Nested array literal before element decoding.
#[derive(Debug, Clone, PartialEq)]
enum ArrayItem {
    Elem(Option<String>),
    Nested(Vec<ArrayItem>),
}

fn type_err(what: &str, input: impl std::fmt::Debug) -> PgError {
    PgError::Type(format!("Invalid {}: {:?}", what, input))
}

/// Text-format decoders.
pub mod text {
    use super::*;

    static TIMESTAMP_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(
            r"^(\d{4,})-(\d{2})-(\d{2})[ T](\d{2}):(\d{2}):(\d{2})(\.\d{1,6})?(?:(Z)|([+-])(\d{2})(?::?(\d{2}))?(?::?(\d{2}))?)?( BC)?$",
        )
        .expect("valid timestamp regex")
    });

    static DATE_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^(\d{4,})-(\d{2})-(\d{2})( BC)?$").expect("valid date regex")
    });

    static TIME_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^(\d{2}):(\d{2}):(\d{2})(\.\d{1,6})?").expect("valid time regex")
    });

    static INTERVAL_UNIT_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"([+-]?\d+) (year|mon|day)s?").expect("valid interval regex")
    });

    static INTERVAL_TIME_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"([+-])?(\d+):(\d{2}):(\d{2})(\.\d{1,6})?").expect("valid interval regex")
    });

    pub fn bool(s: &str) -> PgResult<PgValue> {
        match s {
            "t" | "true" | "TRUE" | "y" | "yes" | "on" | "1" => Ok(PgValue::Bool(true)),
            "f" | "false" | "FALSE" | "n" | "no" | "off" | "0" => Ok(PgValue::Bool(false)),
            _ => Err(type_err("BOOL", s)),
        }
    }

    pub fn int2(s: &str) -> PgResult<PgValue> {
        s.parse().map(PgValue::Int2).map_err(|_| type_err("INT2", s))
    }

    pub fn int4(s: &str) -> PgResult<PgValue> {
        s.parse().map(PgValue::Int4).map_err(|_| type_err("INT4", s))
    }

    pub fn int8(s: &str) -> PgResult<PgValue> {
        s.parse().map(PgValue::Int8).map_err(|_| type_err("INT8", s))
    }

    /// OIDs are unsigned 32-bit, widened so they always fit.
    pub fn oid(s: &str) -> PgResult<PgValue> {
        s.parse::<u32>()
            .map(|v| PgValue::Int8(v as i64))
            .map_err(|_| type_err("OID", s))
    }

    pub fn float4(s: &str) -> PgResult<PgValue> {
        s.parse().map(PgValue::Float4).map_err(|_| type_err("FLOAT4", s))
    }

    pub fn float8(s: &str) -> PgResult<PgValue> {
        s.parse().map(PgValue::Float8).map_err(|_| type_err("FLOAT8", s))
    }

    pub fn numeric(s: &str) -> PgResult<PgValue> {
        Ok(PgValue::Numeric(s.to_string()))
    }

    pub fn text(s: &str) -> PgResult<PgValue> {
        Ok(PgValue::Text(s.to_string()))
    }

    pub fn uuid(s: &str) -> PgResult<PgValue> {
        uuid::Uuid::parse_str(s)
            .map(PgValue::Uuid)
            .map_err(|_| type_err("UUID", s))
    }

    pub fn json(s: &str) -> PgResult<PgValue> {
        serde_json::from_str(s)
            .map(PgValue::Json)
            .map_err(|e| PgError::Type(format!("Invalid JSON: {}", e)))
    }

    /// `\x` hex form, or the legacy escape form with `\ooo` octets.
    pub fn bytea(s: &str) -> PgResult<PgValue> {
        if let Some(hex) = s.strip_prefix("\\x") {
            if hex.len() % 2 != 0 {
                return Err(type_err("BYTEA", s));
            }
            let mut out = Vec::with_capacity(hex.len() / 2);
            for pair in hex.as_bytes().chunks(2) {
                let pair = std::str::from_utf8(pair).map_err(|_| type_err("BYTEA", s))?;
                out.push(u8::from_str_radix(pair, 16).map_err(|_| type_err("BYTEA", s))?);
            }
            return Ok(PgValue::Bytea(out));
        }

        let bytes = s.as_bytes();
        let mut out = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] != b'\\' {
                out.push(bytes[i]);
                i += 1;
            } else if bytes.get(i + 1) == Some(&b'\\') {
                out.push(b'\\');
                i += 2;
            } else {
                let octal = s.get(i + 1..i + 4).ok_or_else(|| type_err("BYTEA", s))?;
                out.push(u8::from_str_radix(octal, 8).map_err(|_| type_err("BYTEA", s))?);
                i += 4;
            }
        }
        Ok(PgValue::Bytea(out))
    }

    fn year(digits: &str, bc: bool) -> Option<i32> {
        let y: i32 = digits.parse().ok()?;
        Some(if bc { 1 - y } else { y })
    }

    fn micros_fraction(frac: Option<regex::Match<'_>>) -> u32 {
        frac.map(|m| {
            let digits = &m.as_str()[1..];
            let padded = format!("{:0<6}", digits);
            padded.parse().unwrap_or(0)
        })
        .unwrap_or(0)
    }

    fn timestamp_micros(s: &str, with_tz: bool) -> PgResult<i64> {
        match s {
            "infinity" => return Ok(i64::MAX),
            "-infinity" => return Ok(i64::MIN),
            _ => {}
        }

        let caps = TIMESTAMP_RE
            .captures(s)
            .ok_or_else(|| type_err("TIMESTAMP", s))?;
        let num = |i: usize| -> u32 {
            caps.get(i)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0)
        };

        let year = year(&caps[1], caps.get(13).is_some()).ok_or_else(|| type_err("TIMESTAMP", s))?;
        let dt = NaiveDate::from_ymd_opt(year, num(2), num(3))
            .and_then(|d| d.and_hms_micro_opt(num(4), num(5), num(6), micros_fraction(caps.get(7))))
            .ok_or_else(|| type_err("TIMESTAMP", s))?;
        let mut micros = naive_to_micros(dt).ok_or_else(|| type_err("TIMESTAMP", s))?;

        if with_tz {
            if let Some(sign) = caps.get(9) {
                let offset = (num(10) as i64 * 3600 + num(11) as i64 * 60 + num(12) as i64)
                    * 1_000_000;
                micros -= if sign.as_str() == "-" { -offset } else { offset };
            }
        }
        Ok(micros)
    }

    pub fn timestamp(s: &str) -> PgResult<PgValue> {
        timestamp_micros(s, false).map(PgValue::Timestamp)
    }

    /// Normalized to UTC using the offset the server printed.
    pub fn timestamptz(s: &str) -> PgResult<PgValue> {
        timestamp_micros(s, true).map(PgValue::TimestampTz)
    }

    pub fn date(s: &str) -> PgResult<PgValue> {
        match s {
            "infinity" => return Ok(PgValue::Date(i32::MAX)),
            "-infinity" => return Ok(PgValue::Date(i32::MIN)),
            _ => {}
        }
        let caps = DATE_RE.captures(s).ok_or_else(|| type_err("DATE", s))?;
        let year = year(&caps[1], caps.get(4).is_some()).ok_or_else(|| type_err("DATE", s))?;
        let month = caps[2].parse().map_err(|_| type_err("DATE", s))?;
        let day = caps[3].parse().map_err(|_| type_err("DATE", s))?;
        let date = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| type_err("DATE", s))?;
        Ok(PgValue::Date(date_to_days(date)))
    }

    /// Time of day; a trailing zone offset (timetz) is dropped.
    pub fn time(s: &str) -> PgResult<PgValue> {
        let caps = TIME_RE.captures(s).ok_or_else(|| type_err("TIME", s))?;
        let h: i64 = caps[1].parse().map_err(|_| type_err("TIME", s))?;
        let m: i64 = caps[2].parse().map_err(|_| type_err("TIME", s))?;
        let sec: i64 = caps[3].parse().map_err(|_| type_err("TIME", s))?;
        let frac = micros_fraction(caps.get(4)) as i64;
        Ok(PgValue::Time(((h * 60 + m) * 60 + sec) * 1_000_000 + frac))
    }

    /// `postgres` interval style, e.g. `1 year 2 mons -3 days 04:05:06.5`.
    pub fn interval(s: &str) -> PgResult<PgValue> {
        let mut months = 0i32;
        let mut days = 0i32;
        let mut micros = 0i64;
        let mut matched = false;

        for caps in INTERVAL_UNIT_RE.captures_iter(s) {
            matched = true;
            let n: i32 = caps[1].parse().map_err(|_| type_err("INTERVAL", s))?;
            let (field, n) = match &caps[2] {
                "year" => (&mut months, n.checked_mul(12)),
                "mon" => (&mut months, Some(n)),
                _ => (&mut days, Some(n)),
            };
            *field = n
                .and_then(|n| field.checked_add(n))
                .ok_or_else(|| type_err("INTERVAL", s))?;
        }

        if let Some(caps) = INTERVAL_TIME_RE.captures(s) {
            matched = true;
            let h: i64 = caps[2].parse().map_err(|_| type_err("INTERVAL", s))?;
            let m: i64 = caps[3].parse().map_err(|_| type_err("INTERVAL", s))?;
            let sec: i64 = caps[4].parse().map_err(|_| type_err("INTERVAL", s))?;
            let total = h
                .checked_mul(3_600_000_000)
                .and_then(|t| t.checked_add((m * 60 + sec) * 1_000_000))
                .and_then(|t| t.checked_add(micros_fraction(caps.get(5)) as i64))
                .ok_or_else(|| type_err("INTERVAL", s))?;
            micros = if caps.get(1).map(|m| m.as_str()) == Some("-") {
                -total
            } else {
                total
            };
        }

        if !matched {
            return Err(type_err("INTERVAL", s));
        }
        Ok(PgValue::Interval {
            months,
            days,
            micros,
        })
    }

    /// Brace-delimited array literal, each element run through `elem`.
    pub fn array(s: &str, elem: &dyn Fn(&str) -> PgResult<PgValue>) -> PgResult<PgValue> {
        let items = parse_array_literal(s)?;
        to_value(items, elem)
    }

    fn to_value(
        items: Vec<ArrayItem>,
        elem: &dyn Fn(&str) -> PgResult<PgValue>,
    ) -> PgResult<PgValue> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            out.push(match item {
                ArrayItem::Elem(None) => PgValue::Null,
                ArrayItem::Elem(Some(s)) => elem(&s)?,
                ArrayItem::Nested(inner) => to_value(inner, elem)?,
            });
        }
        Ok(PgValue::Array(out))
    }

    fn parse_array_literal(s: &str) -> PgResult<Vec<ArrayItem>> {
        // Optional dimension decoration: `[1:3]={...}`
        let body = match s.find('=') {
            Some(eq) if s.starts_with('[') => &s[eq + 1..],
            _ => s,
        };

        let chars: Vec<char> = body.chars().collect();
        let mut pos = 0;
        let items = parse_level(&chars, &mut pos).map_err(|_| type_err("array literal", s))?;
        if pos != chars.len() {
            return Err(type_err("array literal", s));
        }
        Ok(items)
    }

    fn parse_level(chars: &[char], pos: &mut usize) -> Result<Vec<ArrayItem>, ()> {
        if chars.get(*pos) != Some(&'{') {
            return Err(());
        }
        *pos += 1;

        let mut items = Vec::new();
        skip_ws(chars, pos);
        if chars.get(*pos) == Some(&'}') {
            *pos += 1;
            return Ok(items);
        }

        loop {
            skip_ws(chars, pos);
            match chars.get(*pos) {
                Some('{') => items.push(ArrayItem::Nested(parse_level(chars, pos)?)),
                Some('"') => {
                    *pos += 1;
                    let mut value = String::new();
                    loop {
                        match chars.get(*pos) {
                            Some('\\') => {
                                value.push(*chars.get(*pos + 1).ok_or(())?);
                                *pos += 2;
                            }
                            Some('"') => {
                                *pos += 1;
                                break;
                            }
                            Some(c) => {
                                value.push(*c);
                                *pos += 1;
                            }
                            None => return Err(()),
                        }
                    }
                    items.push(ArrayItem::Elem(Some(value)));
                }
                Some(_) => {
                    let mut value = String::new();
                    while let Some(&c) = chars.get(*pos) {
                        if c == ',' || c == '}' {
                            break;
                        }
                        if c == '\\' {
                            value.push(*chars.get(*pos + 1).ok_or(())?);
                            *pos += 2;
                            continue;
                        }
                        value.push(c);
                        *pos += 1;
                    }
                    let value = value.trim();
                    if value.eq_ignore_ascii_case("NULL") {
                        items.push(ArrayItem::Elem(None));
                    } else {
                        items.push(ArrayItem::Elem(Some(value.to_string())));
                    }
                }
                None => return Err(()),
            }

            skip_ws(chars, pos);
            match chars.get(*pos) {
                Some(',') => *pos += 1,
                Some('}') => {
                    *pos += 1;
                    return Ok(items);
                }
                _ => return Err(()),
            }
        }
    }

    fn skip_ws(chars: &[char], pos: &mut usize) {
        while chars.get(*pos).is_some_and(|c| c.is_whitespace()) {
            *pos += 1;
        }
    }
}

/// Binary-format decoders.
pub mod binary {
    use super::*;

    fn fixed<const N: usize>(data: &[u8], what: &str) -> PgResult<[u8; N]> {
        data.try_into()
            .map_err(|_| PgError::Type(format!("Invalid {} length: {}", what, data.len())))
    }

    fn utf8(data: &[u8], what: &str) -> PgResult<String> {
        std::str::from_utf8(data)
            .map(str::to_owned)
            .map_err(|e| PgError::Type(format!("Invalid UTF-8 in {}: {}", what, e)))
    }

    pub fn bool(data: &[u8]) -> PgResult<PgValue> {
        Ok(PgValue::Bool(fixed::<1>(data, "BOOL")?[0] != 0))
    }

    pub fn int2(data: &[u8]) -> PgResult<PgValue> {
        Ok(PgValue::Int2(i16::from_be_bytes(fixed(data, "INT2")?)))
    }

    pub fn int4(data: &[u8]) -> PgResult<PgValue> {
        Ok(PgValue::Int4(i32::from_be_bytes(fixed(data, "INT4")?)))
    }

    pub fn int8(data: &[u8]) -> PgResult<PgValue> {
        Ok(PgValue::Int8(i64::from_be_bytes(fixed(data, "INT8")?)))
    }

    pub fn oid(data: &[u8]) -> PgResult<PgValue> {
        Ok(PgValue::Int8(u32::from_be_bytes(fixed(data, "OID")?) as i64))
    }

    pub fn float4(data: &[u8]) -> PgResult<PgValue> {
        Ok(PgValue::Float4(f32::from_be_bytes(fixed(data, "FLOAT4")?)))
    }

    pub fn float8(data: &[u8]) -> PgResult<PgValue> {
        Ok(PgValue::Float8(f64::from_be_bytes(fixed(data, "FLOAT8")?)))
    }

    pub fn text(data: &[u8]) -> PgResult<PgValue> {
        utf8(data, "TEXT").map(PgValue::Text)
    }

    pub fn bytea(data: &[u8]) -> PgResult<PgValue> {
        Ok(PgValue::Bytea(data.to_vec()))
    }

    pub fn uuid(data: &[u8]) -> PgResult<PgValue> {
        Ok(PgValue::Uuid(uuid::Uuid::from_bytes(fixed(data, "UUID")?)))
    }

    pub fn timestamp(data: &[u8]) -> PgResult<PgValue> {
        Ok(PgValue::Timestamp(i64::from_be_bytes(fixed(data, "TIMESTAMP")?)))
    }

    pub fn timestamptz(data: &[u8]) -> PgResult<PgValue> {
        Ok(PgValue::TimestampTz(i64::from_be_bytes(fixed(data, "TIMESTAMPTZ")?)))
    }

    pub fn date(data: &[u8]) -> PgResult<PgValue> {
        Ok(PgValue::Date(i32::from_be_bytes(fixed(data, "DATE")?)))
    }

    /// TIME is 8 bytes; TIMETZ appends a 4-byte zone that is dropped.
    pub fn time(data: &[u8]) -> PgResult<PgValue> {
        if data.len() < 8 {
            return Err(PgError::Type(format!("Invalid TIME length: {}", data.len())));
        }
        Ok(PgValue::Time(i64::from_be_bytes(fixed(&data[..8], "TIME")?)))
    }

    pub fn interval(data: &[u8]) -> PgResult<PgValue> {
        let raw: [u8; 16] = fixed(data, "INTERVAL")?;
        let micros = i64::from_be_bytes(fixed(&raw[..8], "INTERVAL")?);
        let days = i32::from_be_bytes(fixed(&raw[8..12], "INTERVAL")?);
        let months = i32::from_be_bytes(fixed(&raw[12..], "INTERVAL")?);
        Ok(PgValue::Interval {
            months,
            days,
            micros,
        })
    }

    pub fn json(data: &[u8]) -> PgResult<PgValue> {
        serde_json::from_slice(data)
            .map(PgValue::Json)
            .map_err(|e| PgError::Type(format!("Invalid JSON: {}", e)))
    }

    /// JSONB carries a leading version byte before the JSON text.
    pub fn jsonb(data: &[u8]) -> PgResult<PgValue> {
        match data.split_first() {
            Some((1, rest)) => json(rest),
            Some((v, _)) => Err(PgError::Type(format!("Unsupported JSONB version: {}", v))),
            None => Err(PgError::Type("Empty JSONB value".to_string())),
        }
    }

    const NUMERIC_POS: u16 = 0x0000;
    const NUMERIC_NEG: u16 = 0x4000;
    const NUMERIC_NAN: u16 = 0xC000;
    const NUMERIC_PINF: u16 = 0xD000;
    const NUMERIC_NINF: u16 = 0xF000;

    /// Base-10000 digit groups with weight, sign and display scale.
    pub fn numeric(data: &[u8]) -> PgResult<PgValue> {
        if data.len() < 8 {
            return Err(PgError::Type(format!("Invalid NUMERIC length: {}", data.len())));
        }
        let ndigits = i16::from_be_bytes([data[0], data[1]]).max(0) as usize;
        let weight = i16::from_be_bytes([data[2], data[3]]) as i32;
        let sign = u16::from_be_bytes([data[4], data[5]]);
        let dscale = i16::from_be_bytes([data[6], data[7]]).max(0) as usize;

        match sign {
            NUMERIC_NAN => return Ok(PgValue::Numeric("NaN".to_string())),
            NUMERIC_PINF => return Ok(PgValue::Numeric("Infinity".to_string())),
            NUMERIC_NINF => return Ok(PgValue::Numeric("-Infinity".to_string())),
            NUMERIC_POS | NUMERIC_NEG => {}
            _ => return Err(PgError::Type(format!("Invalid NUMERIC sign: {:#x}", sign))),
        }

        if data.len() != 8 + ndigits * 2 {
            return Err(PgError::Type("NUMERIC digit count mismatch".to_string()));
        }
        let digits: Vec<i32> = data[8..]
            .chunks_exact(2)
            .map(|d| i16::from_be_bytes([d[0], d[1]]) as i32)
            .collect();
        let group = |i: i32| -> i32 {
            if i < 0 {
                0
            } else {
                digits.get(i as usize).copied().unwrap_or(0)
            }
        };

        let mut out = String::new();
        if sign == NUMERIC_NEG {
            out.push('-');
        }

        if weight < 0 {
            out.push('0');
        } else {
            for i in 0..=weight {
                if i == 0 {
                    out.push_str(&group(i).to_string());
                } else {
                    out.push_str(&format!("{:04}", group(i)));
                }
            }
        }

        if dscale > 0 {
            let mut frac = String::with_capacity(dscale + 4);
            let mut i = weight + 1;
            while frac.len() < dscale {
                frac.push_str(&format!("{:04}", group(i)));
                i += 1;
            }
            frac.truncate(dscale);
            out.push('.');
            out.push_str(&frac);
        }

        Ok(PgValue::Numeric(out))
    }

    struct Cursor<'a> {
        data: &'a [u8],
        pos: usize,
    }

    impl<'a> Cursor<'a> {
        fn take(&mut self, n: usize) -> PgResult<&'a [u8]> {
            let bytes = self
                .pos
                .checked_add(n)
                .and_then(|end| self.data.get(self.pos..end))
                .ok_or_else(|| PgError::Type("Truncated array".to_string()))?;
            self.pos += n;
            Ok(bytes)
        }

        fn i32(&mut self) -> PgResult<i32> {
            let b = self.take(4)?;
            Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        }
    }

    /// Array header, dimensions, then length-prefixed elements in row-major
    /// order, regrouped into nested arrays per dimension.
    pub fn array(data: &[u8], elem: &dyn Fn(&[u8]) -> PgResult<PgValue>) -> PgResult<PgValue> {
        let mut cur = Cursor { data, pos: 0 };

        let ndim = cur.i32()?;
        let _has_nulls = cur.i32()?;
        let _elem_oid = cur.i32()?;
        if ndim < 0 {
            return Err(PgError::Type(format!("Invalid array dimensions: {}", ndim)));
        }

        // Each dimension takes 8 bytes and each element at least 4, so the
        // input length bounds both allocations.
        let mut dims = Vec::with_capacity((ndim as usize).min(data.len() / 8));
        for _ in 0..ndim {
            let len = cur.i32()?;
            let _lower_bound = cur.i32()?;
            dims.push(len.max(0) as usize);
        }

        let total = if dims.is_empty() {
            0
        } else {
            dims.iter()
                .try_fold(1usize, |acc, &len| acc.checked_mul(len))
                .ok_or_else(|| PgError::Type(format!("Array dimensions overflow: {:?}", dims)))?
        };
        let mut flat = Vec::with_capacity(total.min((data.len() - cur.pos) / 4));
        for _ in 0..total {
            let len = cur.i32()?;
            if len < 0 {
                flat.push(PgValue::Null);
            } else {
                flat.push(elem(cur.take(len as usize)?)?);
            }
        }

        Ok(nest(&mut flat.into_iter(), &dims))
    }

    fn nest(items: &mut impl Iterator<Item = PgValue>, dims: &[usize]) -> PgValue {
        match dims.split_first() {
            None => PgValue::Array(Vec::new()),
            Some((&len, [])) => PgValue::Array(items.take(len).collect()),
            Some((&len, rest)) => PgValue::Array((0..len).map(|_| nest(items, rest)).collect()),
        }
    }
}
