//! Parser for the sensor payloads published on the broker.
//!
//! Devices publish loosely structured fragments rather than JSON:
//!
//! ```text
//! "sensor":"T1", "value": 23.5}
//! "sensor":"T1", "value": 23,5}
//! ```
//!
//! The first field carries the quoted sensor name and the second the reading.
//! The value may end with a stray closing brace and may use a decimal comma.
//! Any fields after the value are ignored.

use crate::errors::MalformedPayload;

/// Decimal places kept in a parsed value.
pub const VALUE_PRECISION: i32 = 6;

/// A single sensor reading decoded from one message.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    sensor_name: String,
    value: f64,
}

impl Reading {
    /// Sensor that produced the reading.
    pub fn sensor_name(&self) -> &str {
        &self.sensor_name
    }

    /// Reading value, rounded to [`VALUE_PRECISION`] decimals.
    pub fn value(&self) -> f64 {
        self.value
    }
}

/// Decode a raw message body into a [`Reading`].
pub fn parse(raw: &[u8]) -> Result<Reading, MalformedPayload> {
    let text =
        std::str::from_utf8(raw).map_err(|e| MalformedPayload::InvalidUtf8(e.to_string()))?;

    let fields: Vec<&str> = text.split(',').collect();
    if fields.len() < 2 {
        return Err(MalformedPayload::MissingField {
            expected: 2,
            found: fields.len(),
        });
    }

    let sensor_name = parse_sensor_name(fields[0])?;
    let value = parse_value(fields[1], fields.get(2).copied())?;

    Ok(Reading {
        sensor_name,
        value: round_to_precision(value),
    })
}

/// Text after the first `:` of a field, trimmed.
fn field_value(field: &str) -> Result<&str, MalformedPayload> {
    field
        .split_once(':')
        .map(|(_, value)| value.trim())
        .ok_or_else(|| MalformedPayload::MissingSeparator(field.trim().to_string()))
}

fn parse_sensor_name(field: &str) -> Result<String, MalformedPayload> {
    let raw = field_value(field)?;
    let name = raw
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .ok_or_else(|| MalformedPayload::UnquotedSensorName(raw.to_string()))?;

    if name.is_empty() {
        return Err(MalformedPayload::EmptySensorName);
    }
    Ok(name.to_string())
}

fn parse_value(field: &str, next: Option<&str>) -> Result<f64, MalformedPayload> {
    let mut fragment = field_value(field)?.to_string();

    // A decimal comma splits the value across two fields: `"value": 23` + `5}`.
    if let Some(next) = next {
        if is_integer_part(&fragment) && is_fraction_part(next) {
            fragment.push(',');
            fragment.push_str(next.trim());
        }
    }

    let cleaned = fragment.trim_end_matches('}').trim().replace(',', ".");
    let value: f64 = cleaned
        .parse()
        .map_err(|_| MalformedPayload::InvalidValue(cleaned.clone()))?;

    if !value.is_finite() {
        return Err(MalformedPayload::NonFiniteValue(cleaned));
    }
    Ok(value)
}

fn is_integer_part(fragment: &str) -> bool {
    let digits = fragment
        .strip_prefix('-')
        .or_else(|| fragment.strip_prefix('+'))
        .unwrap_or(fragment);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn is_fraction_part(field: &str) -> bool {
    let field = field.trim_start();
    field.starts_with(|c: char| c.is_ascii_digit()) && !field.contains(':')
}

fn round_to_precision(value: f64) -> f64 {
    let scale = 10f64.powi(VALUE_PRECISION);
    let scaled = (value * scale).round();
    if scaled.is_finite() {
        scaled / scale
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_decimal_comma() {
        let reading = parse(br#""sensor":"T1", "value": 23,5}"#).unwrap();
        assert_eq!(reading.sensor_name(), "T1");
        assert_eq!(reading.value(), 23.5);
    }

    #[test]
    fn test_decimal_point() {
        let reading = parse(br#""sensor":"T1", "value": 23.5}"#).unwrap();
        assert_eq!(reading.sensor_name(), "T1");
        assert_eq!(reading.value(), 23.5);
    }

    #[test]
    fn test_non_numeric_value() {
        let err = parse(br#""sensor":"T2", "value": abc}"#).unwrap_err();
        assert_eq!(err, MalformedPayload::InvalidValue("abc".to_string()));
    }

    #[test]
    fn test_missing_second_field() {
        let err = parse(br#""sensor":"T3"}"#).unwrap_err();
        assert_eq!(
            err,
            MalformedPayload::MissingField {
                expected: 2,
                found: 1
            }
        );
    }

    #[test]
    fn test_integer_value_with_brace_and_whitespace() {
        let reading = parse(b"\"sensor\":\"T4\", \"value\": 17 } ").unwrap();
        assert_eq!(reading.value(), 17.0);
    }

    #[test]
    fn test_negative_decimal_comma() {
        let reading = parse(br#""sensor":"T5", "value": -3,25}"#).unwrap();
        assert_eq!(reading.value(), -3.25);
    }

    #[test]
    fn test_rounds_to_six_decimals() {
        let reading = parse(br#""sensor":"T6", "value": 1.23456789}"#).unwrap();
        assert_eq!(reading.value(), 1.234568);
    }

    #[test]
    fn test_extra_fields_ignored() {
        let reading = parse(br#"{"sensor":"T7", "value": 4.5, "unit": "C"}"#).unwrap();
        assert_eq!(reading.sensor_name(), "T7");
        assert_eq!(reading.value(), 4.5);
    }

    #[test]
    fn test_decimal_comma_followed_by_extra_field() {
        let reading = parse(br#""sensor":"T8", "value": 4,5, "unit": "C"}"#).unwrap();
        assert_eq!(reading.value(), 4.5);
    }

    #[test]
    fn test_unquoted_sensor_name() {
        let err = parse(br#""sensor":T9, "value": 1}"#).unwrap_err();
        assert_eq!(err, MalformedPayload::UnquotedSensorName("T9".to_string()));
    }

    #[test]
    fn test_empty_sensor_name() {
        let err = parse(br#""sensor":"", "value": 1}"#).unwrap_err();
        assert_eq!(err, MalformedPayload::EmptySensorName);
    }

    #[test]
    fn test_sensor_name_charset_not_validated() {
        let reading = parse(r#""sensor":"línea 3/A:b", "value": 1}"#.as_bytes()).unwrap();
        assert_eq!(reading.sensor_name(), "línea 3/A:b");
    }

    #[test]
    fn test_missing_separator() {
        let err = parse(br#""sensor":"T1", 23.5}"#).unwrap_err();
        assert!(matches!(err, MalformedPayload::MissingSeparator(_)));
    }

    #[test]
    fn test_invalid_utf8() {
        let err = parse(&[0x22, 0xff, 0xfe, 0x2c, 0x31]).unwrap_err();
        assert!(matches!(err, MalformedPayload::InvalidUtf8(_)));
    }

    #[test]
    fn test_non_finite_value() {
        let err = parse(br#""sensor":"T1", "value": inf}"#).unwrap_err();
        assert!(matches!(err, MalformedPayload::NonFiniteValue(_)));
    }

    proptest! {
        #[test]
        fn prop_separator_style_does_not_change_value(
            whole in -100_000i64..100_000,
            fraction in "[0-9]{1,9}",
        ) {
            let dot = format!("\"sensor\":\"S\", \"value\": {}.{}}}", whole, fraction);
            let comma = format!("\"sensor\":\"S\", \"value\": {},{}}}", whole, fraction);
            let expected = round_to_precision(format!("{}.{}", whole, fraction).parse::<f64>().unwrap());

            prop_assert_eq!(parse(dot.as_bytes()).unwrap().value(), expected);
            prop_assert_eq!(parse(comma.as_bytes()).unwrap().value(), expected);
        }

        #[test]
        fn prop_value_without_second_field_is_rejected(name in "[A-Za-z0-9]{1,12}") {
            let payload = format!("\"sensor\":\"{}\"}}", name);
            let is_missing_field = matches!(
                parse(payload.as_bytes()),
                Err(MalformedPayload::MissingField { .. })
            );
            prop_assert!(is_missing_field);
        }
    }
}
