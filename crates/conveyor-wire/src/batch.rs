// Batch body codec.
// Rows are separated by '\n' and fields by ';'. Each field is `key=value`;
// '\\', '\n', ';' and '=' inside keys or values are escaped with a backslash.
use crate::{Error, Result};
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};

pub type Row = BTreeMap<String, String>;
pub type Columns = BTreeSet<String>;

/// Rows of named fields carried by a BATCH message.
///
/// ```
/// use conveyor_wire::batch::{Batch, Columns, Row};
///
/// let row: Row = [("movieId", "7"), ("rating", "4.5")]
///     .into_iter()
///     .map(|(k, v)| (k.to_string(), v.to_string()))
///     .collect();
/// let select: Columns = ["movieId".to_string()].into_iter().collect();
/// let body = Batch::new(vec![row]).encode(&select);
/// let decoded = Batch::decode(&body).expect("decode");
/// assert_eq!(decoded.rows[0].get("movieId").map(String::as_str), Some("7"));
/// assert!(decoded.rows[0].get("rating").is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub rows: Vec<Row>,
}

impl Batch {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Encodes the rows keeping only `select` columns; an empty selection keeps all.
    /// Rows left without fields are skipped.
    pub fn encode(&self, select: &Columns) -> Bytes {
        let mut out = String::new();
        for row in &self.rows {
            let mut fields = row
                .iter()
                .filter(|(key, _)| select.is_empty() || select.contains(*key))
                .peekable();
            if fields.peek().is_none() {
                continue;
            }
            if !out.is_empty() {
                out.push('\n');
            }
            let mut first = true;
            for (key, value) in fields {
                if !first {
                    out.push(';');
                }
                first = false;
                escape_into(&mut out, key);
                out.push('=');
                escape_into(&mut out, value);
            }
        }
        Bytes::from(out)
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(body)
            .map_err(|err| Error::Batch(format!("body is not utf-8: {err}")))?;
        let mut parser = RowParser::default();
        let mut chars = text.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    let escaped = match chars.next() {
                        Some('n') => '\n',
                        Some(c @ ('\\' | ';' | '=')) => c,
                        Some(other) => {
                            return Err(Error::Batch(format!("unknown escape \\{other}")));
                        }
                        None => return Err(Error::Batch("dangling escape".to_string())),
                    };
                    parser.token.push(escaped);
                }
                '=' => parser.end_key()?,
                ';' => parser.end_field()?,
                '\n' => parser.end_row()?,
                other => parser.token.push(other),
            }
        }
        parser.end_row()?;
        Ok(Self { rows: parser.rows })
    }
}

fn escape_into(out: &mut String, raw: &str) {
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            ';' => out.push_str("\\;"),
            '=' => out.push_str("\\="),
            other => out.push(other),
        }
    }
}

#[derive(Default)]
struct RowParser {
    rows: Vec<Row>,
    row: Row,
    key: Option<String>,
    token: String,
}

impl RowParser {
    fn end_key(&mut self) -> Result<()> {
        if self.key.is_some() {
            return Err(Error::Batch("unexpected '=' in value".to_string()));
        }
        self.key = Some(std::mem::take(&mut self.token));
        Ok(())
    }

    fn end_field(&mut self) -> Result<()> {
        match self.key.take() {
            Some(key) => {
                self.row.insert(key, std::mem::take(&mut self.token));
                Ok(())
            }
            None if self.token.is_empty() => Ok(()),
            None => Err(Error::Batch(format!("field without value: {}", self.token))),
        }
    }

    fn end_row(&mut self) -> Result<()> {
        self.end_field()?;
        if !self.row.is_empty() {
            self.rows.push(std::mem::take(&mut self.row));
        }
        Ok(())
    }
}
