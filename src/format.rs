use crate::config::LoadFormat;
use crate::error::SinkError;
use crate::record::Record;
use serde_json::Value;
use std::borrow::Cow;

/// Line separator between rows of a payload, for both formats.
pub const ROW_DELIMITER: u8 = b'\n';

/// CSV representation of a SQL NULL understood by stream load.
pub const CSV_NULL: &str = "\\N";

/// Quote wrapped around CSV fields that contain the separator, a quote or
/// a line break. Sent as the `enclose` load option.
pub const CSV_ENCLOSE: &str = "\"";

/// A quote inside an enclosed field is written twice. Sent as the
/// `escape` load option.
pub const CSV_ESCAPE: &str = "\"";

/// Byte form of a CSV column separator.
///
/// Accepts a single byte (`,`, `\t`, `\x01`) or the `\xHH` hex notation
/// used in load options. Multi-byte separators are not supported.
pub fn csv_delimiter(separator: &str) -> Option<u8> {
    match separator.as_bytes() {
        [byte] => Some(*byte),
        [b'\\', b'x' | b'X', hex @ ..] if hex.len() == 2 => {
            std::str::from_utf8(hex).ok().and_then(|h| u8::from_str_radix(h, 16).ok())
        }
        _ => None,
    }
}

/// Renders records into the row form the endpoint expects.
///
/// CSV rows go through a `csv` writer so values holding the separator, a
/// quote or a newline are enclosed and stay one field of one row. JSON
/// rows are one object per line. Payloads are rows joined by
/// [`ROW_DELIMITER`].
#[derive(Debug, Clone)]
pub struct RowSerializer {
    format: LoadFormat,
    column_separator: String,
    delimiter: Option<u8>,
}

impl RowSerializer {
    pub fn new(format: LoadFormat, column_separator: impl Into<String>) -> Self {
        let column_separator = column_separator.into();
        RowSerializer {
            format,
            delimiter: csv_delimiter(&column_separator),
            column_separator,
        }
    }

    pub fn format(&self) -> LoadFormat {
        self.format
    }

    pub fn column_separator(&self) -> &str {
        &self.column_separator
    }

    /// Serialize one record into a single row, without delimiter.
    pub fn serialize_row(&self, record: &Record) -> Result<Vec<u8>, SinkError> {
        match self.format {
            LoadFormat::Csv => self.csv_row(record),
            LoadFormat::Json => {
                serde_json::to_vec(record).map_err(|e| SinkError::Serialization(e.to_string()))
            }
        }
    }

    fn csv_row(&self, record: &Record) -> Result<Vec<u8>, SinkError> {
        let delimiter = self.delimiter.ok_or_else(|| {
            SinkError::Serialization(format!(
                "unsupported CSV column separator `{}`",
                self.column_separator
            ))
        })?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .delimiter(delimiter)
            .quote_style(csv::QuoteStyle::Necessary)
            .double_quote(true)
            .terminator(csv::Terminator::Any(ROW_DELIMITER))
            .from_writer(Vec::with_capacity(64));

        for value in record.values() {
            writer.write_field(csv_field(value)?.as_bytes()).map_err(csv_error)?;
        }
        writer.write_record(None::<&[u8]>).map_err(csv_error)?;

        let mut row = writer
            .into_inner()
            .map_err(|e| SinkError::Serialization(e.to_string()))?;
        if row.last() == Some(&ROW_DELIMITER) {
            row.pop();
        }
        Ok(row)
    }

    /// Join already serialized rows into one payload.
    pub fn encode_rows<B: AsRef<[u8]>>(rows: &[B]) -> Vec<u8> {
        let total: usize = rows.iter().map(|r| r.as_ref().len() + 1).sum();
        let mut payload = Vec::with_capacity(total);
        for (i, row) in rows.iter().enumerate() {
            if i > 0 {
                payload.push(ROW_DELIMITER);
            }
            payload.extend_from_slice(row.as_ref());
        }
        payload
    }

    /// Serialize a whole record set into one payload.
    pub fn serialize_batch(&self, records: &[Record]) -> Result<Vec<u8>, SinkError> {
        let rows = records
            .iter()
            .map(|r| self.serialize_row(r))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::encode_rows(&rows))
    }
}

fn csv_field(value: &Value) -> Result<Cow<'_, str>, SinkError> {
    Ok(match value {
        Value::Null => Cow::Borrowed(CSV_NULL),
        Value::String(s) => Cow::Borrowed(s.as_str()),
        Value::Bool(b) => Cow::Borrowed(if *b { "true" } else { "false" }),
        Value::Number(n) => Cow::Owned(n.to_string()),
        nested => Cow::Owned(
            serde_json::to_string(nested).map_err(|e| SinkError::Serialization(e.to_string()))?,
        ),
    })
}

fn csv_error(e: csv::Error) -> SinkError {
    SinkError::Serialization(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn records() -> Vec<Record> {
        vec![
            Record::new().with("id", 1).with("name", "alice").with("score", 9.5),
            Record::new().with("id", 2).with("name", "bob").with("score", 7),
            Record::new().with("id", 3).with("name", "carol").with("score", Value::Null),
        ]
    }

    #[test]
    fn test_csv_round_trip() {
        let serializer = RowSerializer::new(LoadFormat::Csv, ",");
        let payload = serializer.serialize_batch(&records()).unwrap();
        let text = String::from_utf8(payload).unwrap();

        let parsed: Vec<Vec<&str>> = text.lines().map(|l| l.split(',').collect()).collect();
        assert_eq!(
            parsed,
            vec![
                vec!["1", "alice", "9.5"],
                vec!["2", "bob", "7"],
                vec!["3", "carol", CSV_NULL],
            ]
        );
    }

    #[test]
    fn test_csv_custom_separator() {
        let serializer = RowSerializer::new(LoadFormat::Csv, "\x01");
        let row = serializer
            .serialize_row(&Record::new().with("a", true).with("b", json!({"k": [1, 2]})))
            .unwrap();
        // Nested JSON carries quotes, so it is enclosed with doubled quotes.
        assert_eq!(String::from_utf8(row).unwrap(), "true\x01\"{\"\"k\"\":[1,2]}\"");
    }

    #[test]
    fn test_csv_values_with_separator_quote_and_newline_survive() {
        let serializer = RowSerializer::new(LoadFormat::Csv, ",");
        let input = vec![
            Record::new().with("id", 1).with("name", "Smith, John"),
            Record::new().with("id", 2).with("name", "line1\nline2"),
            Record::new().with("id", 3).with("name", "say \"hi\""),
        ];
        let payload = serializer.serialize_batch(&input).unwrap();

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(payload.as_slice());
        let parsed: Vec<Vec<String>> = reader
            .records()
            .map(|r| r.unwrap().iter().map(str::to_string).collect())
            .collect();
        assert_eq!(
            parsed,
            vec![
                vec!["1".to_string(), "Smith, John".to_string()],
                vec!["2".to_string(), "line1\nline2".to_string()],
                vec!["3".to_string(), "say \"hi\"".to_string()],
            ]
        );
    }

    #[test]
    fn test_plain_values_are_not_quoted() {
        let serializer = RowSerializer::new(LoadFormat::Csv, "\t");
        let row = serializer
            .serialize_row(&Record::new().with("a", "x,y").with("b", Value::Null))
            .unwrap();
        assert_eq!(String::from_utf8(row).unwrap(), "x,y\t\\N");
    }

    #[test]
    fn test_csv_delimiter_forms() {
        assert_eq!(csv_delimiter(","), Some(b','));
        assert_eq!(csv_delimiter("\x01"), Some(1));
        assert_eq!(csv_delimiter("\\x01"), Some(1));
        assert_eq!(csv_delimiter("\\xZZ"), None);
        assert_eq!(csv_delimiter("||"), None);
        assert_eq!(csv_delimiter(""), None);
    }

    #[test]
    fn test_multi_byte_separator_is_a_serialization_error() {
        let serializer = RowSerializer::new(LoadFormat::Csv, "||");
        assert!(matches!(
            serializer.serialize_row(&Record::new().with("a", 1)),
            Err(SinkError::Serialization(_))
        ));
    }

    #[test]
    fn test_json_one_object_per_line() {
        let serializer = RowSerializer::new(LoadFormat::Json, "ignored");
        let input = records();
        let payload = serializer.serialize_batch(&input).unwrap();
        let text = String::from_utf8(payload).unwrap();

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), input.len());
        for (line, record) in lines.iter().zip(&input) {
            let value: Value = serde_json::from_str(line).unwrap();
            assert!(value.is_object());
            assert_eq!(value.get("name"), record.get("name"));
        }
    }

    #[test]
    fn test_encode_rows_has_no_trailing_delimiter() {
        assert_eq!(RowSerializer::encode_rows(&[b"a".to_vec(), b"b".to_vec()]), b"a\nb".to_vec());
        assert!(RowSerializer::encode_rows::<Vec<u8>>(&[]).is_empty());
    }
}
