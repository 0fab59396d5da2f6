//! Per-field type coercion.
//!
//! Every mappable field type implements [`Coerce`]. A coercion either yields a
//! value, yields nothing (the raw value was null), or fails with a
//! [`CoercionFailure`] that the materializer wraps into `DbError::Coercion`.
//!
//! Resolution order for a raw value:
//! 1. storage null or JSON null yields nothing
//! 2. enums (see [`coerce_enum`]) match by name or discriminant
//! 3. booleans accept "1"/"true" strings and numeric truthiness
//! 4. date/time, UUID, time-span and byte targets accept their native form or
//!    a textual encoding (time spans also take a tick count)
//! 5. numerics and decimals convert with range checks
//! 6. strings take the value's textual form
//! 7. anything else goes through serde via [`Json`]

use crate::models::DbValue;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// Why a raw value could not be converted to a target type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoercionFailure {
    pub target: String,
    pub reason: String,
}

impl CoercionFailure {
    pub fn new(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            reason: reason.into(),
        }
    }
}

/// Conversion from a raw database value to a field type.
pub trait Coerce: Sized {
    /// Whether a storage null may be assigned to a field of this type.
    const NULLABLE: bool = false;

    /// Convert `raw`. `Ok(None)` means the conversion produced null.
    fn coerce(raw: &DbValue) -> Result<Option<Self>, CoercionFailure>;
}

impl<T: Coerce> Coerce for Option<T> {
    const NULLABLE: bool = true;

    fn coerce(raw: &DbValue) -> Result<Option<Self>, CoercionFailure> {
        Ok(Some(T::coerce(raw)?))
    }
}

/// Unwrap a JSON scalar into the matching raw variant.
///
/// Returns `None` for objects and arrays, which have no scalar form.
fn json_leaf(value: &JsonValue) -> Option<DbValue> {
    match DbValue::from_json(value.clone()) {
        DbValue::Json(_) => None,
        leaf => Some(leaf),
    }
}

fn unsupported(target: &str, raw: &DbValue) -> CoercionFailure {
    CoercionFailure::new(
        target,
        format!("no conversion from {} value", raw.type_name()),
    )
}

// =============================================================================
// Enums
// =============================================================================

/// Resolve an enum variant from a name or a discriminant.
///
/// Names match case-insensitively. Integers (raw, textual or JSON) select
/// the variant with that discriminant.
pub fn coerce_enum<E: Copy>(
    raw: &DbValue,
    variants: &[(&'static str, i64, E)],
    target: &str,
) -> Result<Option<E>, CoercionFailure> {
    let by_discriminant = |d: i64| {
        variants
            .iter()
            .find(|(_, disc, _)| *disc == d)
            .map(|(_, _, v)| Some(*v))
            .ok_or_else(|| CoercionFailure::new(target, format!("no variant with value {d}")))
    };

    match raw {
        DbValue::Null => Ok(None),
        DbValue::Int(i) => by_discriminant(*i),
        DbValue::Text(s) | DbValue::Decimal(s) => {
            let name = s.trim();
            if let Some((_, _, v)) = variants
                .iter()
                .find(|(n, _, _)| n.eq_ignore_ascii_case(name))
            {
                return Ok(Some(*v));
            }
            match name.parse::<i64>() {
                Ok(d) => by_discriminant(d),
                Err(_) => Err(CoercionFailure::new(
                    target,
                    format!("no variant named '{name}'"),
                )),
            }
        }
        DbValue::Json(JsonValue::Null) => Ok(None),
        DbValue::Json(v @ (JsonValue::String(_) | JsonValue::Number(_))) => match json_leaf(v) {
            Some(leaf) => coerce_enum(&leaf, variants, target),
            None => Err(unsupported(target, raw)),
        },
        other => Err(unsupported(target, other)),
    }
}

// =============================================================================
// Booleans
// =============================================================================

impl Coerce for bool {
    fn coerce(raw: &DbValue) -> Result<Option<Self>, CoercionFailure> {
        match raw {
            DbValue::Null => Ok(None),
            DbValue::Bool(b) => Ok(Some(*b)),
            DbValue::Text(s) => Ok(Some(s == "1" || s.eq_ignore_ascii_case("true"))),
            DbValue::Int(i) => Ok(Some(*i != 0)),
            DbValue::Float(f) => Ok(Some(*f != 0.0)),
            DbValue::Decimal(s) => s
                .trim()
                .parse::<f64>()
                .map(|f| Some(f != 0.0))
                .map_err(|e| CoercionFailure::new("bool", e.to_string())),
            DbValue::Json(v) => match json_leaf(v) {
                Some(leaf) => bool::coerce(&leaf),
                None => Err(unsupported("bool", raw)),
            },
            other => Err(unsupported("bool", other)),
        }
    }
}

// =============================================================================
// Numerics
// =============================================================================

/// Widen a raw value to an integer, rejecting fractional input.
fn integral(raw: &DbValue, target: &str) -> Result<Option<i128>, CoercionFailure> {
    let from_float = |f: f64| {
        if f.is_finite() && f.fract() == 0.0 && f.abs() < 1.7e38 {
            Ok(Some(f as i128))
        } else {
            Err(CoercionFailure::new(target, "not an integral value"))
        }
    };

    match raw {
        DbValue::Null => Ok(None),
        DbValue::Bool(b) => Ok(Some(i128::from(*b))),
        DbValue::Int(i) => Ok(Some(i128::from(*i))),
        DbValue::Float(f) => from_float(*f),
        DbValue::Text(s) | DbValue::Decimal(s) => {
            let s = s.trim();
            match s.parse::<i128>() {
                Ok(v) => Ok(Some(v)),
                Err(_) => match s.parse::<f64>() {
                    Ok(f) => from_float(f),
                    Err(_) => Err(CoercionFailure::new(target, "not a number")),
                },
            }
        }
        DbValue::Json(v) => match json_leaf(v) {
            Some(leaf) => integral(&leaf, target),
            None => Err(unsupported(target, raw)),
        },
        other => Err(unsupported(target, other)),
    }
}

macro_rules! impl_coerce_int {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl Coerce for $ty {
                fn coerce(raw: &DbValue) -> Result<Option<Self>, CoercionFailure> {
                    let target = stringify!($ty);
                    match integral(raw, target)? {
                        Some(wide) => <$ty>::try_from(wide)
                            .map(Some)
                            .map_err(|_| CoercionFailure::new(target, "value out of range")),
                        None => Ok(None),
                    }
                }
            }
        )+
    };
}

impl_coerce_int!(i8, i16, i32, i64, u8, u16, u32, u64);

impl Coerce for f64 {
    fn coerce(raw: &DbValue) -> Result<Option<Self>, CoercionFailure> {
        match raw {
            DbValue::Null => Ok(None),
            DbValue::Bool(b) => Ok(Some(if *b { 1.0 } else { 0.0 })),
            DbValue::Int(i) => Ok(Some(*i as f64)),
            DbValue::Float(f) => Ok(Some(*f)),
            DbValue::Text(s) | DbValue::Decimal(s) => s
                .trim()
                .parse::<f64>()
                .map(Some)
                .map_err(|_| CoercionFailure::new("f64", "not a number")),
            DbValue::Json(v) => match json_leaf(v) {
                Some(leaf) => f64::coerce(&leaf),
                None => Err(unsupported("f64", raw)),
            },
            other => Err(unsupported("f64", other)),
        }
    }
}

impl Coerce for f32 {
    fn coerce(raw: &DbValue) -> Result<Option<Self>, CoercionFailure> {
        match f64::coerce(raw) {
            Ok(Some(v)) if v.is_finite() && v.abs() > f64::from(f32::MAX) => {
                Err(CoercionFailure::new("f32", "value out of range"))
            }
            Ok(v) => Ok(v.map(|v| v as f32)),
            Err(e) => Err(CoercionFailure::new("f32", e.reason)),
        }
    }
}

/// Parse decimal text, plain or in scientific notation.
fn parse_decimal(s: &str) -> Result<Decimal, CoercionFailure> {
    let s = s.trim();
    s.parse::<Decimal>()
        .or_else(|_| Decimal::from_scientific(s))
        .map_err(|e| CoercionFailure::new("Decimal", e.to_string()))
}

impl Coerce for Decimal {
    fn coerce(raw: &DbValue) -> Result<Option<Self>, CoercionFailure> {
        match raw {
            DbValue::Null => Ok(None),
            DbValue::Bool(b) => Ok(Some(Decimal::from(u8::from(*b)))),
            DbValue::Int(i) => Ok(Some(Decimal::from(*i))),
            // the shortest text form keeps 0.1 as 0.1
            DbValue::Float(f) if f.is_finite() => parse_decimal(&f.to_string()).map(Some),
            DbValue::Float(_) => Err(CoercionFailure::new("Decimal", "not a finite number")),
            DbValue::Text(s) | DbValue::Decimal(s) => parse_decimal(s).map(Some),
            DbValue::Json(v) => match json_leaf(v) {
                Some(leaf) => Decimal::coerce(&leaf),
                None => Err(unsupported("Decimal", raw)),
            },
            other => Err(unsupported("Decimal", other)),
        }
    }
}

// =============================================================================
// Strings and raw passthrough
// =============================================================================

impl Coerce for String {
    fn coerce(raw: &DbValue) -> Result<Option<Self>, CoercionFailure> {
        match raw {
            DbValue::Null | DbValue::Json(JsonValue::Null) => Ok(None),
            other => Ok(Some(other.to_string())),
        }
    }
}

impl Coerce for DbValue {
    fn coerce(raw: &DbValue) -> Result<Option<Self>, CoercionFailure> {
        Ok((!raw.is_null()).then(|| raw.clone()))
    }
}

impl Coerce for JsonValue {
    fn coerce(raw: &DbValue) -> Result<Option<Self>, CoercionFailure> {
        match raw {
            DbValue::Null => Ok(None),
            DbValue::Text(s) => Ok(Some(
                serde_json::from_str(s).unwrap_or_else(|_| JsonValue::String(s.clone())),
            )),
            other => Ok(Some(other.to_json())),
        }
    }
}

// =============================================================================
// GUIDs and bytes
// =============================================================================

impl Coerce for Uuid {
    fn coerce(raw: &DbValue) -> Result<Option<Self>, CoercionFailure> {
        match raw {
            DbValue::Null => Ok(None),
            DbValue::Uuid(u) => Ok(Some(*u)),
            DbValue::Text(s) => Uuid::parse_str(s.trim())
                .map(Some)
                .map_err(|e| CoercionFailure::new("Uuid", e.to_string())),
            // 16-byte GUID layout: first three groups little-endian
            DbValue::Bytes(b) => <[u8; 16]>::try_from(b.as_slice())
                .map(|bytes| Some(Uuid::from_bytes_le(bytes)))
                .map_err(|_| {
                    CoercionFailure::new("Uuid", format!("expected 16 bytes, got {}", b.len()))
                }),
            DbValue::Json(JsonValue::String(s)) => Uuid::coerce(&DbValue::Text(s.clone())),
            other => Err(unsupported("Uuid", other)),
        }
    }
}

impl Coerce for Vec<u8> {
    fn coerce(raw: &DbValue) -> Result<Option<Self>, CoercionFailure> {
        match raw {
            DbValue::Null => Ok(None),
            DbValue::Bytes(b) => Ok(Some(b.clone())),
            DbValue::Text(s) | DbValue::Json(JsonValue::String(s)) => STANDARD
                .decode(s.trim())
                .map(Some)
                .map_err(|e| CoercionFailure::new("Vec<u8>", format!("invalid base64: {e}"))),
            other => Err(unsupported("Vec<u8>", other)),
        }
    }
}

// =============================================================================
// Date and time
// =============================================================================

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y%m%d"];

const TIME_FORMATS: &[&str] = &["%H:%M:%S%.f", "%H:%M"];

/// Parse a timestamp from text. Offsets are normalized to UTC.
fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .or_else(|| parse_date(s).map(|d| d.and_time(NaiveTime::MIN)))
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    DATE_FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(s, f).ok())
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    TIME_FORMATS
        .iter()
        .find_map(|f| NaiveTime::parse_from_str(s, f).ok())
}

/// Text of a textual raw value, including JSON strings.
fn text_of(raw: &DbValue) -> Option<&str> {
    match raw {
        DbValue::Text(s) | DbValue::Json(JsonValue::String(s)) => Some(s),
        _ => None,
    }
}

impl Coerce for NaiveDateTime {
    fn coerce(raw: &DbValue) -> Result<Option<Self>, CoercionFailure> {
        match raw {
            DbValue::Null => Ok(None),
            DbValue::Timestamp(v) => Ok(Some(*v)),
            DbValue::TimestampTz(v) => Ok(Some(v.naive_utc())),
            DbValue::Date(d) => Ok(Some(d.and_time(NaiveTime::MIN))),
            other => match text_of(other) {
                Some(s) => parse_datetime(s)
                    .map(Some)
                    .ok_or_else(|| CoercionFailure::new("NaiveDateTime", "unrecognized format")),
                None => Err(unsupported("NaiveDateTime", other)),
            },
        }
    }
}

impl Coerce for DateTime<Utc> {
    fn coerce(raw: &DbValue) -> Result<Option<Self>, CoercionFailure> {
        match raw {
            DbValue::TimestampTz(v) => Ok(Some(*v)),
            other => NaiveDateTime::coerce(other)
                .map(|v| v.map(|naive| naive.and_utc()))
                .map_err(|e| CoercionFailure::new("DateTime<Utc>", e.reason)),
        }
    }
}

impl Coerce for NaiveDate {
    fn coerce(raw: &DbValue) -> Result<Option<Self>, CoercionFailure> {
        match raw {
            DbValue::Null => Ok(None),
            DbValue::Date(d) => Ok(Some(*d)),
            DbValue::Timestamp(v) => Ok(Some(v.date())),
            DbValue::TimestampTz(v) => Ok(Some(v.date_naive())),
            other => match text_of(other) {
                Some(s) => parse_date(s)
                    .or_else(|| parse_datetime(s).map(|dt| dt.date()))
                    .map(Some)
                    .ok_or_else(|| CoercionFailure::new("NaiveDate", "unrecognized format")),
                None => Err(unsupported("NaiveDate", other)),
            },
        }
    }
}

impl Coerce for NaiveTime {
    fn coerce(raw: &DbValue) -> Result<Option<Self>, CoercionFailure> {
        match raw {
            DbValue::Null => Ok(None),
            DbValue::Time(t) => Ok(Some(*t)),
            DbValue::Timestamp(v) => Ok(Some(v.time())),
            other => match text_of(other) {
                Some(s) => parse_time(s)
                    .map(Some)
                    .ok_or_else(|| CoercionFailure::new("NaiveTime", "unrecognized format")),
                None => Err(unsupported("NaiveTime", other)),
            },
        }
    }
}

/// Length of one tick, the unit of integral time spans.
const NANOS_PER_TICK: i64 = 100;

/// Parse a time span of the form `[-][d.]hh:mm:ss[.fffffff]`.
pub fn parse_time_span(s: &str) -> Option<TimeDelta> {
    let s = s.trim();
    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };

    let mut parts = body.split(':');
    let (head, minutes, seconds) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let (days, hours) = match head.split_once('.') {
        Some((d, h)) => (d.parse::<i64>().ok()?, h.parse::<i64>().ok()?),
        None => (0, head.parse::<i64>().ok()?),
    };
    let minutes = minutes.parse::<i64>().ok()?;
    let (secs, fraction) = seconds.split_once('.').unwrap_or((seconds, ""));
    let secs = secs.parse::<i64>().ok()?;

    if !(0..24).contains(&hours) || !(0..60).contains(&minutes) || !(0..60).contains(&secs) {
        return None;
    }
    if fraction.len() > 7 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let nanos = if fraction.is_empty() {
        0
    } else {
        format!("{fraction:0<9}").parse::<i64>().ok()?
    };

    let total = TimeDelta::try_days(days)?
        + TimeDelta::try_hours(hours)?
        + TimeDelta::try_minutes(minutes)?
        + TimeDelta::try_seconds(secs)?
        + TimeDelta::nanoseconds(nanos);
    Some(if negative { -total } else { total })
}

fn from_ticks(ticks: i128) -> Result<TimeDelta, CoercionFailure> {
    i64::try_from(ticks)
        .ok()
        .and_then(|t| t.checked_mul(NANOS_PER_TICK))
        .map(TimeDelta::nanoseconds)
        .ok_or_else(|| CoercionFailure::new("TimeDelta", "tick count out of range"))
}

impl Coerce for TimeDelta {
    fn coerce(raw: &DbValue) -> Result<Option<Self>, CoercionFailure> {
        match raw {
            DbValue::Null => Ok(None),
            DbValue::Int(_) | DbValue::Float(_) | DbValue::Decimal(_) => {
                integral(raw, "TimeDelta")?.map(from_ticks).transpose()
            }
            DbValue::Time(t) => Ok(Some(t.signed_duration_since(NaiveTime::MIN))),
            DbValue::Text(s) => match parse_time_span(s) {
                Some(span) => Ok(Some(span)),
                None => match s.trim().parse::<i64>() {
                    Ok(ticks) => from_ticks(ticks.into()).map(Some),
                    Err(_) => Err(CoercionFailure::new(
                        "TimeDelta",
                        "expected [-][d.]hh:mm:ss[.fffffff] or a tick count",
                    )),
                },
            },
            DbValue::Json(v) => match json_leaf(v) {
                Some(leaf) => TimeDelta::coerce(&leaf),
                None => Err(unsupported("TimeDelta", raw)),
            },
            other => Err(unsupported("TimeDelta", other)),
        }
    }
}

// =============================================================================
// Serde fallback
// =============================================================================

/// Field wrapper that converts through serde.
///
/// Text is parsed as JSON first; if that fails it is treated as a JSON string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Json<T>(pub T);

impl<T: DeserializeOwned> Coerce for Json<T> {
    fn coerce(raw: &DbValue) -> Result<Option<Self>, CoercionFailure> {
        let value = match raw {
            DbValue::Null => return Ok(None),
            DbValue::Text(s) => {
                serde_json::from_str(s).unwrap_or_else(|_| JsonValue::String(s.clone()))
            }
            other => other.to_json(),
        };
        serde_json::from_value(value)
            .map(|v| Some(Json(v)))
            .map_err(|e| CoercionFailure::new(std::any::type_name::<T>(), e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Color {
        Red,
        Green,
    }

    const COLORS: &[(&str, i64, Color)] = &[("Red", 1, Color::Red), ("Green", 2, Color::Green)];

    #[test]
    fn test_enum_from_name_case_insensitive() {
        let v = coerce_enum(&DbValue::from("green"), COLORS, "Color").unwrap();
        assert_eq!(v, Some(Color::Green));
    }

    #[test]
    fn test_enum_from_discriminant_and_json() {
        assert_eq!(
            coerce_enum(&DbValue::Int(1), COLORS, "Color").unwrap(),
            Some(Color::Red)
        );
        assert_eq!(
            coerce_enum(&DbValue::Json(json!("RED")), COLORS, "Color").unwrap(),
            Some(Color::Red)
        );
        assert_eq!(
            coerce_enum(&DbValue::Json(json!(2)), COLORS, "Color").unwrap(),
            Some(Color::Green)
        );
    }

    #[test]
    fn test_enum_unknown_name_fails() {
        let err = coerce_enum(&DbValue::from("Blue"), COLORS, "Color").unwrap_err();
        assert!(err.reason.contains("Blue"));
        assert!(coerce_enum(&DbValue::Int(9), COLORS, "Color").is_err());
    }

    #[test]
    fn test_bool_rules() {
        assert_eq!(bool::coerce(&DbValue::from("1")).unwrap(), Some(true));
        assert_eq!(bool::coerce(&DbValue::from("TRUE")).unwrap(), Some(true));
        assert_eq!(bool::coerce(&DbValue::from("yes")).unwrap(), Some(false));
        assert_eq!(bool::coerce(&DbValue::Int(0)).unwrap(), Some(false));
        assert_eq!(bool::coerce(&DbValue::Int(5)).unwrap(), Some(true));
        assert_eq!(bool::coerce(&DbValue::Null).unwrap(), None);
    }

    #[test]
    fn test_integer_narrowing() {
        assert_eq!(i32::coerce(&DbValue::Int(42)).unwrap(), Some(42));
        assert_eq!(u8::coerce(&DbValue::from("200")).unwrap(), Some(200));
        assert_eq!(i64::coerce(&DbValue::Float(3.0)).unwrap(), Some(3));
        assert_eq!(i16::coerce(&DbValue::Decimal("12.00".into())).unwrap(), Some(12));

        let err = u8::coerce(&DbValue::Int(300)).unwrap_err();
        assert_eq!(err.reason, "value out of range");
        assert!(i32::coerce(&DbValue::Float(1.5)).is_err());
        assert!(i32::coerce(&DbValue::from("abc")).is_err());
        assert!(u32::coerce(&DbValue::Int(-1)).is_err());
    }

    #[test]
    fn test_float_conversion() {
        assert_eq!(f64::coerce(&DbValue::Int(2)).unwrap(), Some(2.0));
        assert_eq!(f64::coerce(&DbValue::Decimal("1.25".into())).unwrap(), Some(1.25));
        assert_eq!(f32::coerce(&DbValue::Float(0.5)).unwrap(), Some(0.5));
        assert!(f32::coerce(&DbValue::Float(1e300)).is_err());
    }

    #[test]
    fn test_string_uses_text_form() {
        assert_eq!(String::coerce(&DbValue::Int(7)).unwrap(), Some("7".to_string()));
        assert_eq!(
            String::coerce(&DbValue::Json(json!("x"))).unwrap(),
            Some("x".to_string())
        );
        assert_eq!(String::coerce(&DbValue::Null).unwrap(), None);
    }

    #[test]
    fn test_uuid_from_text_and_mixed_endian_bytes() {
        let text = "00112233-4455-6677-8899-aabbccddeeff";
        let expected = Uuid::parse_str(text).unwrap();
        assert_eq!(Uuid::coerce(&DbValue::from(text)).unwrap(), Some(expected));

        let bytes = vec![
            0x33, 0x22, 0x11, 0x00, 0x55, 0x44, 0x77, 0x66, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
            0xee, 0xff,
        ];
        assert_eq!(Uuid::coerce(&DbValue::Bytes(bytes)).unwrap(), Some(expected));
        assert!(Uuid::coerce(&DbValue::Bytes(vec![1, 2, 3])).is_err());
        assert!(Uuid::coerce(&DbValue::Int(1)).is_err());
    }

    #[test]
    fn test_bytes_from_base64() {
        assert_eq!(
            Vec::<u8>::coerce(&DbValue::from("aGVsbG8=")).unwrap(),
            Some(b"hello".to_vec())
        );
        assert!(Vec::<u8>::coerce(&DbValue::from("not base64!")).is_err());
    }

    #[test]
    fn test_datetime_from_text_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap();
        for text in [
            "2024-03-01 10:30:00",
            "2024-03-01T10:30:00",
            "2024-03-01T10:30:00Z",
            "2024-03-01T12:30:00+02:00",
        ] {
            assert_eq!(
                NaiveDateTime::coerce(&DbValue::from(text)).unwrap(),
                Some(expected),
                "{text}"
            );
        }
        assert!(NaiveDateTime::coerce(&DbValue::from("yesterday")).is_err());
        assert!(NaiveDateTime::coerce(&DbValue::Int(5)).is_err());
    }

    #[test]
    fn test_datetime_utc_from_naive() {
        let naive = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        let v = DateTime::<Utc>::coerce(&DbValue::Timestamp(naive)).unwrap();
        assert_eq!(v, Some(naive.and_utc()));
    }

    #[test]
    fn test_date_and_time_from_text() {
        assert_eq!(
            NaiveDate::coerce(&DbValue::from("2024-02-29")).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 29)
        );
        assert_eq!(
            NaiveTime::coerce(&DbValue::from("08:15:30.5")).unwrap(),
            NaiveTime::from_hms_milli_opt(8, 15, 30, 500)
        );
    }

    #[test]
    fn test_time_span_from_ticks() {
        let v = TimeDelta::coerce(&DbValue::Int(10_000_000)).unwrap();
        assert_eq!(v, Some(TimeDelta::seconds(1)));
    }

    #[test]
    fn test_time_span_from_numeric_tick_counts() {
        let second = Some(TimeDelta::seconds(1));
        for raw in [
            DbValue::Json(json!(10_000_000)),
            DbValue::Float(1e7),
            DbValue::Decimal("10000000".into()),
            DbValue::Decimal("10000000.000".into()),
            DbValue::from("10000000"),
        ] {
            assert_eq!(TimeDelta::coerce(&raw).unwrap(), second, "{raw:?}");
        }
        assert_eq!(
            TimeDelta::coerce(&DbValue::Json(json!("00:00:01"))).unwrap(),
            second
        );
        assert!(TimeDelta::coerce(&DbValue::Float(1.5)).is_err());
        assert!(TimeDelta::coerce(&DbValue::Decimal("2.5".into())).is_err());
        assert!(TimeDelta::coerce(&DbValue::Int(i64::MAX)).is_err());
    }

    #[test]
    fn test_decimal_targets() {
        let exact = |s: &str| s.parse::<Decimal>().unwrap();
        assert_eq!(Decimal::coerce(&DbValue::Int(-42)).unwrap(), Some(exact("-42")));
        assert_eq!(Decimal::coerce(&DbValue::Float(0.1)).unwrap(), Some(exact("0.1")));
        assert_eq!(
            Decimal::coerce(&DbValue::Decimal("12345.678900".into())).unwrap(),
            Some(exact("12345.678900"))
        );
        assert_eq!(Decimal::coerce(&DbValue::from(" 1.5e3 ")).unwrap(), Some(exact("1500")));
        assert_eq!(Decimal::coerce(&DbValue::Json(json!(2.25))).unwrap(), Some(exact("2.25")));
        assert_eq!(Decimal::coerce(&DbValue::Bool(true)).unwrap(), Some(Decimal::ONE));
        assert_eq!(Decimal::coerce(&DbValue::Null).unwrap(), None);

        let err = Decimal::coerce(&DbValue::from("twelve")).unwrap_err();
        assert_eq!(err.target, "Decimal");
        assert!(Decimal::coerce(&DbValue::Float(f64::NAN)).is_err());
        assert!(Decimal::coerce(&DbValue::Float(1e300)).is_err());
        assert!(Decimal::coerce(&DbValue::Bytes(vec![1])).is_err());
    }

    /// Coerce `value`'s raw form back through its JSON and display encodings.
    fn assert_round_trip<T>(value: T)
    where
        T: Coerce + Into<DbValue> + Clone + PartialEq + std::fmt::Debug,
    {
        let raw: DbValue = value.clone().into();
        for encoded in [
            raw.clone(),
            DbValue::Json(raw.to_json()),
            DbValue::Text(raw.to_string()),
        ] {
            assert_eq!(
                T::coerce(&encoded).unwrap(),
                Some(value.clone()),
                "{encoded:?}"
            );
        }
    }

    #[test]
    fn test_encoded_values_coerce_back() {
        let stamp = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_nano_opt(10, 30, 5, 123_456_789)
            .unwrap();

        assert_round_trip(true);
        assert_round_trip(false);
        assert_round_trip(i64::MIN);
        assert_round_trip(-7_i32);
        assert_round_trip(200_u8);
        assert_round_trip(0.1_f64);
        assert_round_trip(-2.5e-8_f64);
        assert_round_trip(0.25_f32);
        assert_round_trip("12345.6789".parse::<Decimal>().unwrap());
        assert_round_trip("-0.000001".parse::<Decimal>().unwrap());
        assert_round_trip("héllo, wörld".to_string());
        assert_round_trip(Uuid::parse_str("00112233-4455-6677-8899-aabbccddeeff").unwrap());
        assert_round_trip(vec![0_u8, 1, 254, 255]);
        assert_round_trip(stamp);
        assert_round_trip(stamp.and_utc());
        assert_round_trip(stamp.date());
        assert_round_trip(stamp.time());
    }

    #[test]
    fn test_encoded_uuid_bytes_and_ticks_coerce_back() {
        let id = Uuid::parse_str("00112233-4455-6677-8899-aabbccddeeff").unwrap();
        let raw = DbValue::Bytes(id.to_bytes_le().to_vec());
        assert_eq!(Uuid::coerce(&raw).unwrap(), Some(id));

        for span in [
            TimeDelta::zero(),
            TimeDelta::milliseconds(1500),
            -TimeDelta::days(3) - TimeDelta::nanoseconds(700),
        ] {
            let ticks = DbValue::Int(span.num_nanoseconds().unwrap() / NANOS_PER_TICK);
            for encoded in [
                ticks.clone(),
                DbValue::Json(ticks.to_json()),
                DbValue::Text(ticks.to_string()),
            ] {
                assert_eq!(TimeDelta::coerce(&encoded).unwrap(), Some(span), "{encoded:?}");
            }
        }
    }

    #[test]
    fn test_encoded_enum_coerces_back() {
        for (name, disc, variant) in COLORS {
            for raw in [DbValue::from(*name), DbValue::Int(*disc)] {
                for encoded in [
                    DbValue::Json(raw.to_json()),
                    DbValue::Text(raw.to_string()),
                ] {
                    assert_eq!(
                        coerce_enum(&encoded, COLORS, "Color").unwrap(),
                        Some(*variant),
                        "{encoded:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_time_span_from_text() {
        assert_eq!(
            parse_time_span("01:02:03"),
            Some(TimeDelta::seconds(3723))
        );
        assert_eq!(
            parse_time_span("2.00:00:01.5"),
            Some(TimeDelta::seconds(2 * 86_400 + 1) + TimeDelta::milliseconds(500))
        );
        assert_eq!(parse_time_span("-00:00:10"), Some(TimeDelta::seconds(-10)));
        assert_eq!(parse_time_span("25:00:00"), None);
        assert_eq!(parse_time_span("1:2"), None);
        assert_eq!(parse_time_span("00:00:00.12345678"), None);
    }

    #[test]
    fn test_time_span_unsupported_encoding() {
        let err = TimeDelta::coerce(&DbValue::from("soon")).unwrap_err();
        assert_eq!(err.target, "TimeDelta");
        assert!(TimeDelta::coerce(&DbValue::Bool(true)).is_err());
    }

    #[test]
    fn test_option_marks_nullable() {
        const { assert!(<Option<i32> as Coerce>::NULLABLE) };
        const { assert!(!<i32 as Coerce>::NULLABLE) };
        assert_eq!(Option::<i32>::coerce(&DbValue::Null).unwrap(), Some(None));
        assert_eq!(Option::<i32>::coerce(&DbValue::Int(3)).unwrap(), Some(Some(3)));
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Address {
        city: String,
    }

    #[test]
    fn test_serde_fallback() {
        let raw = DbValue::Json(json!({"city": "Oslo"}));
        let v = Json::<Address>::coerce(&raw).unwrap();
        assert_eq!(
            v,
            Some(Json(Address {
                city: "Oslo".to_string()
            }))
        );

        let raw = DbValue::from(r#"{"city": "Bergen"}"#);
        let v = Json::<Address>::coerce(&raw).unwrap();
        assert_eq!(v.map(|j| j.0.city), Some("Bergen".to_string()));

        assert!(Json::<Address>::coerce(&DbValue::Int(1)).is_err());
    }
}
