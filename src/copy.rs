//! COPY text-format encoding for bulk loads.
//!
//! Rows are encoded into one buffer and sent as a single CopyData stream:
//! tab-separated columns, newline-terminated rows, `\N` for NULL.

use bytes::BytesMut;

use crate::coerce::DriverValue;

/// Escape text for COPY text format.
fn encode_text(buf: &mut BytesMut, text: &str) {
    for c in text.bytes() {
        match c {
            b'\\' => buf.extend_from_slice(b"\\\\"),
            b'\t' => buf.extend_from_slice(b"\\t"),
            b'\n' => buf.extend_from_slice(b"\\n"),
            b'\r' => buf.extend_from_slice(b"\\r"),
            _ => buf.extend_from_slice(&[c]),
        }
    }
}

/// Encode one value in COPY text format.
pub fn encode_copy_value(buf: &mut BytesMut, value: &DriverValue) {
    match value {
        DriverValue::Null => buf.extend_from_slice(b"\\N"),

        DriverValue::Bool(b) => buf.extend_from_slice(if *b { b"t" } else { b"f" }),

        DriverValue::Int(n) => {
            let mut tmp = itoa::Buffer::new();
            buf.extend_from_slice(tmp.format(*n).as_bytes());
        }

        DriverValue::Float(n) => {
            if n.is_nan() {
                buf.extend_from_slice(b"NaN");
            } else if n.is_infinite() {
                buf.extend_from_slice(if *n > 0.0 { &b"Infinity"[..] } else { &b"-Infinity"[..] });
            } else {
                let mut tmp = ryu::Buffer::new();
                buf.extend_from_slice(tmp.format_finite(*n).as_bytes());
            }
        }

        DriverValue::Text(s) => encode_text(buf, s),

        DriverValue::Bytes(bytes) => {
            // bytea hex format; the backslash itself needs escaping in COPY
            buf.extend_from_slice(b"\\\\x");
            for byte in bytes {
                let hi = byte >> 4;
                let lo = byte & 0x0f;
                buf.extend_from_slice(&[
                    if hi < 10 { b'0' + hi } else { b'a' + hi - 10 },
                    if lo < 10 { b'0' + lo } else { b'a' + lo - 10 },
                ]);
            }
        }

        DriverValue::Timestamp(ts) => buf.extend_from_slice(ts.to_rfc3339().as_bytes()),

        DriverValue::LocalTimestamp(ts) => {
            buf.extend_from_slice(ts.format("%Y-%m-%d %H:%M:%S%.f").to_string().as_bytes())
        }

        DriverValue::Date(d) => buf.extend_from_slice(d.format("%Y-%m-%d").to_string().as_bytes()),
    }
}

/// Encode a batch of rows into a single COPY data buffer.
pub fn encode_copy_batch(rows: &[Vec<DriverValue>]) -> BytesMut {
    let width = rows.first().map_or(1, Vec::len);
    let mut buf = BytesMut::with_capacity(rows.len() * width * 16);

    for row in rows {
        for (i, val) in row.iter().enumerate() {
            if i > 0 {
                buf.extend_from_slice(b"\t");
            }
            encode_copy_value(&mut buf, val);
        }
        buf.extend_from_slice(b"\n");
    }

    buf
}

/// Quote an identifier, splitting on `.` for schema-qualified names.
pub fn quote_identifier(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

/// `COPY "table" ("a", "b") FROM STDIN`
pub fn copy_statement(table: &str, columns: Option<&[&str]>) -> String {
    match columns {
        Some(cols) if !cols.is_empty() => {
            let cols: Vec<String> = cols.iter().map(|c| quote_identifier(c)).collect();
            format!("COPY {} ({}) FROM STDIN", quote_identifier(table), cols.join(", "))
        }
        _ => format!("COPY {} FROM STDIN", quote_identifier(table)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_encode_int() {
        let mut buf = BytesMut::new();
        encode_copy_value(&mut buf, &DriverValue::Int(12345));
        assert_eq!(&buf[..], b"12345");
    }

    #[test]
    fn test_encode_float() {
        let mut buf = BytesMut::new();
        encode_copy_value(&mut buf, &DriverValue::Float(3.5));
        assert_eq!(&buf[..], b"3.5");

        let mut buf = BytesMut::new();
        encode_copy_value(&mut buf, &DriverValue::Float(f64::NEG_INFINITY));
        assert_eq!(&buf[..], b"-Infinity");
    }

    #[test]
    fn test_encode_string_escaping() {
        let mut buf = BytesMut::new();
        encode_copy_value(&mut buf, &DriverValue::Text("hello\tworld\n\\".to_string()));
        assert_eq!(&buf[..], b"hello\\tworld\\n\\\\");
    }

    #[test]
    fn test_encode_null_and_bool() {
        let mut buf = BytesMut::new();
        encode_copy_value(&mut buf, &DriverValue::Null);
        encode_copy_value(&mut buf, &DriverValue::Bool(false));
        assert_eq!(&buf[..], b"\\Nf");
    }

    #[test]
    fn test_encode_bytes_and_date() {
        let mut buf = BytesMut::new();
        encode_copy_value(&mut buf, &DriverValue::Bytes(vec![0xde, 0xad]));
        assert_eq!(&buf[..], b"\\\\xdead");

        let mut buf = BytesMut::new();
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        encode_copy_value(&mut buf, &DriverValue::Date(date));
        assert_eq!(&buf[..], b"2024-02-29");
    }

    #[test]
    fn test_encode_batch() {
        let rows = vec![
            vec![DriverValue::Int(1), DriverValue::Text("foo".to_string())],
            vec![DriverValue::Int(2), DriverValue::Null],
        ];
        let buf = encode_copy_batch(&rows);
        assert_eq!(&buf[..], b"1\tfoo\n2\t\\N\n");
    }

    #[test]
    fn test_copy_statement() {
        assert_eq!(
            copy_statement("public.users", Some(&["id", "na\"me"][..])),
            r#"COPY "public"."users" ("id", "na""me") FROM STDIN"#
        );
        assert_eq!(copy_statement("users", None), r#"COPY "users" FROM STDIN"#);
    }
}
