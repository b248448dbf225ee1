//! Binary column decoding for the PostgreSQL backend
//!
//! Result columns arrive in the binary wire format. Types with a native
//! [`Value`] variant go through the driver's `FromSql` impls. Intervals,
//! network and MAC addresses, money, enums, arrays and numerics outside the
//! `Decimal` range are rendered to the text the server itself would print
//! and kept as [`Value::Literal`]. Any other type is a decode error, never
//! a silent NULL.

use bytes::Buf;
use rust_decimal::Decimal;
use std::error::Error as StdError;
use std::fmt::Write as _;
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio_postgres::types::{FromSql, Kind, Type};

use crate::error::{Error, Result};
use crate::types::Value;

/// `sign` word of a binary NUMERIC
const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Address families used by the inet/cidr send functions
const PGSQL_AF_INET: u8 = 2;
const PGSQL_AF_INET6: u8 = 3;

const USECS_PER_SEC: u64 = 1_000_000;
const USECS_PER_MINUTE: u64 = 60 * USECS_PER_SEC;
const USECS_PER_HOUR: u64 = 60 * USECS_PER_MINUTE;

/// Column bytes borrowed from a driver row, whatever the column type
pub(crate) struct RawColumn<'a>(pub(crate) &'a [u8]);

impl<'a> FromSql<'a> for RawColumn<'a> {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn StdError + Sync + Send>> {
        Ok(Self(raw))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// Decode one binary column value; `None` is SQL NULL.
pub fn decode_value(ty: &Type, raw: Option<&[u8]>) -> Result<Value> {
    let Some(raw) = raw else {
        return Ok(Value::Null);
    };

    match *ty {
        Type::BOOL => native(ty, raw, Value::Bool),
        Type::INT2 => native(ty, raw, Value::Int16),
        Type::INT4 => native(ty, raw, Value::Int32),
        Type::INT8 => native(ty, raw, Value::Int64),
        Type::OID => native(ty, raw, |v: u32| Value::Int64(i64::from(v))),
        Type::FLOAT4 => native(ty, raw, Value::Float32),
        Type::FLOAT8 => native(ty, raw, Value::Float64),
        Type::NUMERIC => {
            let text = numeric_text(raw)?;
            Ok(match Decimal::from_str_exact(&text) {
                Ok(d) => Value::Decimal(d),
                Err(_) => Value::Literal(text),
            })
        }
        Type::VARCHAR | Type::TEXT | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            native(ty, raw, Value::String)
        }
        Type::BYTEA => native(ty, raw, Value::Bytes),
        Type::DATE => match infinity_i32(raw) {
            Some(text) => Ok(Value::Literal(text.to_string())),
            None => native(ty, raw, Value::Date),
        },
        Type::TIME => native(ty, raw, Value::Time),
        Type::TIMESTAMP => match infinity_i64(raw) {
            Some(text) => Ok(Value::Literal(text.to_string())),
            None => native(ty, raw, Value::DateTime),
        },
        Type::TIMESTAMPTZ => match infinity_i64(raw) {
            Some(text) => Ok(Value::Literal(text.to_string())),
            None => native(ty, raw, Value::DateTimeTz),
        },
        Type::UUID => native(ty, raw, Value::Uuid),
        Type::JSON | Type::JSONB => native(ty, raw, Value::Json),
        Type::INTERVAL => interval_text(raw).map(Value::Literal),
        Type::INET | Type::CIDR => inet_text(raw, *ty == Type::CIDR).map(Value::Literal),
        Type::MACADDR | Type::MACADDR8 => Ok(Value::Literal(mac_text(raw))),
        Type::MONEY => money_text(raw).map(Value::Literal),
        Type::XML => utf8(ty, raw).map(Value::Literal),
        _ => match ty.kind() {
            Kind::Enum(_) => utf8(ty, raw).map(Value::Literal),
            Kind::Domain(base) => decode_value(base, Some(raw)),
            Kind::Array(member) => array_text(member, raw).map(Value::Literal),
            _ if <String as FromSql<'_>>::accepts(ty) => native(ty, raw, Value::String),
            _ => Err(Error::type_conversion(format!(
                "no decoder for column type {}",
                ty.name()
            ))),
        },
    }
}

fn native<'a, T, F>(ty: &Type, raw: &'a [u8], wrap: F) -> Result<Value>
where
    T: FromSql<'a>,
    F: FnOnce(T) -> Value,
{
    T::from_sql(ty, raw)
        .map(wrap)
        .map_err(|e| Error::type_conversion(format!("cannot decode {} value: {}", ty.name(), e)))
}

fn utf8(ty: &Type, raw: &[u8]) -> Result<String> {
    std::str::from_utf8(raw)
        .map(str::to_owned)
        .map_err(|e| Error::type_conversion(format!("{} value is not UTF-8: {}", ty.name(), e)))
}

fn need(buf: &[u8], len: usize, what: &str) -> Result<()> {
    if buf.remaining() < len {
        return Err(Error::type_conversion(format!("truncated {} value", what)));
    }
    Ok(())
}

fn infinity_i32(raw: &[u8]) -> Option<&'static str> {
    match raw {
        [0x7f, 0xff, 0xff, 0xff] => Some("infinity"),
        [0x80, 0x00, 0x00, 0x00] => Some("-infinity"),
        _ => None,
    }
}

fn infinity_i64(raw: &[u8]) -> Option<&'static str> {
    match raw {
        [0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff] => Some("infinity"),
        [0x80, 0, 0, 0, 0, 0, 0, 0] => Some("-infinity"),
        _ => None,
    }
}

/// Exact decimal text of a binary NUMERIC (base-10000 digit groups)
fn numeric_text(mut buf: &[u8]) -> Result<String> {
    need(buf, 8, "numeric")?;
    let ndigits = usize::from(buf.get_u16());
    let weight = i32::from(buf.get_i16());
    let sign = buf.get_u16();
    let dscale = usize::from(buf.get_u16());

    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        NUMERIC_POS | NUMERIC_NEG => {}
        other => {
            return Err(Error::type_conversion(format!(
                "invalid numeric sign 0x{:04x}",
                other
            )))
        }
    }

    need(buf, ndigits * 2, "numeric")?;
    let digits: Vec<u16> = (0..ndigits).map(|_| buf.get_u16()).collect();
    let group = |idx: i32| -> u16 {
        usize::try_from(idx)
            .ok()
            .and_then(|i| digits.get(i).copied())
            .unwrap_or(0)
    };

    let mut text = String::new();
    if sign == NUMERIC_NEG {
        text.push('-');
    }
    if weight < 0 {
        text.push('0');
    } else {
        for idx in 0..=weight {
            if idx == 0 {
                let _ = write!(text, "{}", group(idx));
            } else {
                let _ = write!(text, "{:04}", group(idx));
            }
        }
    }

    if dscale > 0 {
        let mut frac = String::with_capacity(dscale + 4);
        let mut idx = weight + 1;
        while frac.len() < dscale {
            let _ = write!(frac, "{:04}", group(idx));
            idx += 1;
        }
        frac.truncate(dscale);
        text.push('.');
        text.push_str(&frac);
    }
    Ok(text)
}

/// Interval in the server's default `postgres` output style
fn interval_text(mut buf: &[u8]) -> Result<String> {
    need(buf, 16, "interval")?;
    let micros = buf.get_i64();
    let days = buf.get_i32();
    let months = buf.get_i32();

    let mut parts = Vec::new();
    let unit = |n: i32, singular: &str, plural: &str| {
        format!("{} {}", n, if n == 1 { singular } else { plural })
    };
    let (years, months) = (months / 12, months % 12);
    if years != 0 {
        parts.push(unit(years, "year", "years"));
    }
    if months != 0 {
        parts.push(unit(months, "mon", "mons"));
    }
    if days != 0 {
        parts.push(unit(days, "day", "days"));
    }
    if micros != 0 || parts.is_empty() {
        let abs = micros.unsigned_abs();
        let mut clock = format!(
            "{}{:02}:{:02}:{:02}",
            if micros < 0 { "-" } else { "" },
            abs / USECS_PER_HOUR,
            abs % USECS_PER_HOUR / USECS_PER_MINUTE,
            abs % USECS_PER_MINUTE / USECS_PER_SEC,
        );
        let frac = abs % USECS_PER_SEC;
        if frac != 0 {
            let digits = format!("{:06}", frac);
            clock.push('.');
            clock.push_str(digits.trim_end_matches('0'));
        }
        parts.push(clock);
    }
    Ok(parts.join(" "))
}

fn inet_text(mut buf: &[u8], is_cidr_type: bool) -> Result<String> {
    need(buf, 4, "inet")?;
    let family = buf.get_u8();
    let bits = buf.get_u8();
    let _is_cidr = buf.get_u8();
    let len = usize::from(buf.get_u8());
    need(buf, len, "inet")?;

    let (addr, max_bits) = match (family, len) {
        (PGSQL_AF_INET, 4) => {
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            (Ipv4Addr::from(octets).to_string(), 32)
        }
        (PGSQL_AF_INET6, 16) => {
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            (Ipv6Addr::from(octets).to_string(), 128)
        }
        _ => {
            return Err(Error::type_conversion(format!(
                "unsupported inet family {} with {} address bytes",
                family, len
            )))
        }
    };

    if is_cidr_type || bits != max_bits {
        Ok(format!("{}/{}", addr, bits))
    } else {
        Ok(addr)
    }
}

fn mac_text(raw: &[u8]) -> String {
    raw.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Money as a plain two-decimal amount, independent of `lc_monetary`
fn money_text(mut buf: &[u8]) -> Result<String> {
    need(buf, 8, "money")?;
    let cents = buf.get_i64();
    let abs = cents.unsigned_abs();
    Ok(format!(
        "{}{}.{:02}",
        if cents < 0 { "-" } else { "" },
        abs / 100,
        abs % 100
    ))
}

/// Array in the server's `{...}` text form, with `[lb:ub]=` dimension
/// decoration when a lower bound is not 1
fn array_text(member: &Type, mut buf: &[u8]) -> Result<String> {
    need(buf, 12, "array")?;
    let ndim = buf.get_i32();
    let _has_nulls = buf.get_i32();
    let _element_oid = buf.get_u32();

    let ndim = usize::try_from(ndim)
        .map_err(|_| Error::type_conversion(format!("invalid array dimension count {}", ndim)))?;
    if ndim == 0 {
        return Ok("{}".to_string());
    }

    need(buf, ndim * 8, "array")?;
    let mut dims = Vec::with_capacity(ndim);
    for _ in 0..ndim {
        let len = buf.get_i32();
        let lower = buf.get_i32();
        let len = usize::try_from(len)
            .map_err(|_| Error::type_conversion(format!("invalid array length {}", len)))?;
        dims.push((len, lower));
    }

    let mut text = String::new();
    if dims.iter().any(|&(_, lower)| lower != 1) {
        for &(len, lower) in &dims {
            let upper = i64::from(lower) + len as i64 - 1;
            let _ = write!(text, "[{}:{}]", lower, upper);
        }
        text.push('=');
    }
    write_array_level(member, &mut buf, &dims, &mut text)?;
    Ok(text)
}

fn write_array_level(
    member: &Type,
    buf: &mut &[u8],
    dims: &[(usize, i32)],
    out: &mut String,
) -> Result<()> {
    let Some((&(len, _), inner)) = dims.split_first() else {
        return Ok(());
    };
    out.push('{');
    for i in 0..len {
        if i > 0 {
            out.push(',');
        }
        if inner.is_empty() {
            out.push_str(&array_element(member, buf)?);
        } else {
            write_array_level(member, buf, inner, out)?;
        }
    }
    out.push('}');
    Ok(())
}

fn array_element(member: &Type, buf: &mut &[u8]) -> Result<String> {
    need(*buf, 4, "array element")?;
    let len = buf.get_i32();
    if len < 0 {
        return Ok("NULL".to_string());
    }
    let len = len as usize;
    need(*buf, len, "array element")?;
    let slice: &[u8] = *buf;
    let (raw, rest) = slice.split_at(len);
    *buf = rest;

    let text = element_text(&decode_value(member, Some(raw))?);
    Ok(quote_array_element(&text))
}

/// Text of a non-null value as it appears inside an array literal
fn element_text(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "t" } else { "f" }.to_string(),
        Value::Int16(n) => n.to_string(),
        Value::Int32(n) => n.to_string(),
        Value::Int64(n) => n.to_string(),
        Value::Float32(n) => n.to_string(),
        Value::Float64(n) => n.to_string(),
        Value::Decimal(d) => d.to_string(),
        Value::String(s) | Value::Literal(s) => s.clone(),
        Value::Bytes(b) => {
            let hex: String = b.iter().map(|byte| format!("{:02x}", byte)).collect();
            format!("\\x{}", hex)
        }
        Value::Date(d) => d.to_string(),
        Value::Time(t) => t.to_string(),
        Value::DateTime(dt) => dt.to_string(),
        Value::DateTimeTz(dt) => dt.to_rfc3339(),
        Value::Uuid(u) => u.to_string(),
        Value::Json(j) => j.to_string(),
    }
}

fn quote_array_element(text: &str) -> String {
    let needs_quotes = text.is_empty()
        || text.eq_ignore_ascii_case("NULL")
        || text
            .chars()
            .any(|c| matches!(c, '{' | '}' | ',' | '"' | '\\') || c.is_whitespace());
    if !needs_quotes {
        return text.to_string();
    }
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('"');
    for c in text.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};
    use tokio_postgres::types::ToSql;

    fn encode<T: ToSql>(value: T, ty: &Type) -> Vec<u8> {
        let mut buf = BytesMut::new();
        value.to_sql(ty, &mut buf).unwrap();
        buf.to_vec()
    }

    fn numeric(weight: i16, sign: u16, dscale: u16, digits: &[u16]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u16(digits.len() as u16);
        buf.put_i16(weight);
        buf.put_u16(sign);
        buf.put_u16(dscale);
        for d in digits {
            buf.put_u16(*d);
        }
        buf.to_vec()
    }

    fn interval(micros: i64, days: i32, months: i32) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_i64(micros);
        buf.put_i32(days);
        buf.put_i32(months);
        buf.to_vec()
    }

    fn text_array(dims: &[(i32, i32)], elements: &[Option<&str>]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_i32(dims.len() as i32);
        buf.put_i32(i32::from(elements.iter().any(Option::is_none)));
        buf.put_u32(Type::TEXT.oid());
        for (len, lower) in dims {
            buf.put_i32(*len);
            buf.put_i32(*lower);
        }
        for e in elements {
            match e {
                Some(s) => {
                    buf.put_i32(s.len() as i32);
                    buf.put_slice(s.as_bytes());
                }
                None => buf.put_i32(-1),
            }
        }
        buf.to_vec()
    }

    #[test]
    fn test_null_is_null_for_any_type() {
        assert_eq!(decode_value(&Type::INTERVAL, None).unwrap(), Value::Null);
        assert_eq!(decode_value(&Type::INT4, None).unwrap(), Value::Null);
    }

    #[test]
    fn test_native_types_round_trip_driver_encoding() {
        let cases = [
            (Type::INT4, encode(42i32, &Type::INT4), Value::Int32(42)),
            (Type::INT8, encode(-7i64, &Type::INT8), Value::Int64(-7)),
            (Type::BOOL, encode(true, &Type::BOOL), Value::Bool(true)),
            (
                Type::TEXT,
                encode("héllo", &Type::TEXT),
                Value::String("héllo".into()),
            ),
            (
                Type::JSONB,
                encode(serde_json::json!({"a": 1}), &Type::JSONB),
                Value::Json(serde_json::json!({"a": 1})),
            ),
        ];
        for (ty, raw, expected) in cases {
            assert_eq!(decode_value(&ty, Some(&raw[..])).unwrap(), expected, "{}", ty);
        }
    }

    #[test]
    fn test_numeric_in_decimal_range() {
        // 12345.678
        let raw = numeric(1, NUMERIC_POS, 3, &[1, 2345, 6780]);
        assert_eq!(
            decode_value(&Type::NUMERIC, Some(&raw[..])).unwrap(),
            Value::Decimal("12345.678".parse().unwrap())
        );

        // -0.05
        let raw = numeric(-1, NUMERIC_NEG, 2, &[500]);
        assert_eq!(
            decode_value(&Type::NUMERIC, Some(&raw[..])).unwrap(),
            Value::Decimal("-0.05".parse().unwrap())
        );
    }

    #[test]
    fn test_numeric_beyond_decimal_is_exact_text() {
        // 33 significant digits
        let raw = numeric(
            8,
            NUMERIC_POS,
            0,
            &[1, 2345, 6789, 123, 4567, 8901, 2345, 6789, 123],
        );
        assert_eq!(
            decode_value(&Type::NUMERIC, Some(&raw[..])).unwrap(),
            Value::Literal("123456789012345678901234567890123".into())
        );

        let raw = numeric(0, NUMERIC_NAN, 0, &[]);
        assert_eq!(
            decode_value(&Type::NUMERIC, Some(&raw[..])).unwrap(),
            Value::Literal("NaN".into())
        );
    }

    #[test]
    fn test_numeric_leading_fraction_groups() {
        // 0.00000012 has weight -2
        let raw = numeric(-2, NUMERIC_POS, 8, &[12]);
        assert_eq!(numeric_text(&raw).unwrap(), "0.00000012");
    }

    #[test]
    fn test_interval_text() {
        let day = 24 * USECS_PER_HOUR as i64;
        assert_eq!(interval_text(&interval(0, 2, 0)).unwrap(), "2 days");
        assert_eq!(
            interval_text(&interval(4 * USECS_PER_HOUR as i64 + 500_000, 1, 14)).unwrap(),
            "1 year 2 mons 1 day 04:00:00.5"
        );
        assert_eq!(interval_text(&interval(-day, 0, 0)).unwrap(), "-24:00:00");
        assert_eq!(interval_text(&interval(0, 0, 0)).unwrap(), "00:00:00");
        assert_eq!(
            decode_value(&Type::INTERVAL, Some(&interval(0, 2, 0)[..])).unwrap(),
            Value::Literal("2 days".into())
        );
    }

    #[test]
    fn test_inet_and_cidr_text() {
        let host = [PGSQL_AF_INET, 32, 0, 4, 10, 0, 0, 1];
        assert_eq!(
            decode_value(&Type::INET, Some(&host[..])).unwrap(),
            Value::Literal("10.0.0.1".into())
        );

        let net = [PGSQL_AF_INET, 24, 1, 4, 192, 168, 1, 0];
        assert_eq!(inet_text(&net, true).unwrap(), "192.168.1.0/24");

        let mut v6 = vec![PGSQL_AF_INET6, 64, 0, 16];
        v6.extend_from_slice(&Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1).octets());
        assert_eq!(inet_text(&v6, false).unwrap(), "fe80::1/64");
    }

    #[test]
    fn test_money_and_mac_text() {
        assert_eq!(money_text(&encode(-12345i64, &Type::INT8)).unwrap(), "-123.45");
        assert_eq!(
            decode_value(&Type::MACADDR, Some(&[8u8, 0, 0x2b, 1, 2, 3][..])).unwrap(),
            Value::Literal("08:00:2b:01:02:03".into())
        );
    }

    #[test]
    fn test_array_text() {
        let raw = text_array(&[(2, 1)], &[Some("a"), Some("b")]);
        let array_type = Type::TEXT_ARRAY;
        assert_eq!(
            decode_value(&array_type, Some(&raw[..])).unwrap(),
            Value::Literal("{a,b}".into())
        );

        let raw = text_array(&[(3, 1)], &[Some("x y"), None, Some("say \"hi\"")]);
        assert_eq!(
            array_text(&Type::TEXT, &raw).unwrap(),
            r#"{"x y",NULL,"say \"hi\""}"#
        );

        let raw = text_array(&[(2, 1), (2, 1)], &[Some("1"), Some("2"), Some("3"), Some("4")]);
        assert_eq!(array_text(&Type::TEXT, &raw).unwrap(), "{{1,2},{3,4}}");

        let raw = text_array(&[(1, 0)], &[Some("z")]);
        assert_eq!(array_text(&Type::TEXT, &raw).unwrap(), "[0:0]={z}");
    }

    #[test]
    fn test_infinite_timestamps() {
        let raw = encode(i64::MAX, &Type::INT8);
        assert_eq!(
            decode_value(&Type::TIMESTAMPTZ, Some(&raw[..])).unwrap(),
            Value::Literal("infinity".into())
        );
    }

    #[test]
    fn test_unknown_type_is_an_error() {
        let err = decode_value(&Type::POINT, Some(&[0u8; 16][..])).unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::TypeConversion);
        assert!(err.to_string().contains("point"));
    }

    #[test]
    fn test_truncated_value_is_an_error() {
        assert!(decode_value(&Type::INTERVAL, Some(&[0u8, 1][..])).is_err());
        assert!(decode_value(&Type::NUMERIC, Some(&[0u8, 2, 0, 0, 0, 0, 0, 0, 0, 1][..])).is_err());
    }
}
