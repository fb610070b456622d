//! Format-keyed encoders.
//!
//! An encoder turns the header, batches of rows and the footer of a result
//! into byte chunks. Encoders keep no reference to the rows they were given.

use quarry_db::{ColumnInfo, DbValue, Row};

use super::{Info, Link, StreamError, TableMeta};

pub trait Encoder: Send {
    fn header(&mut self, meta: &TableMeta) -> Result<Vec<u8>, StreamError>;

    fn rows(&mut self, rows: &[Row]) -> Result<Vec<u8>, StreamError>;

    fn footer(&mut self) -> Result<Vec<u8>, StreamError>;
}

/// Encoder for a download format key.
pub fn encoder_for(format_key: &str) -> Option<Box<dyn Encoder>> {
    match format_key {
        "csv" => Some(Box::new(CsvEncoder)),
        "votable" => Some(Box::new(VoTableEncoder)),
        _ => None,
    }
}

// ============================================================================
// CSV
// ============================================================================

/// RFC 4180 CSV with a header line; NULL is an empty field.
pub struct CsvEncoder;

fn write_csv<I, S>(records: I) -> Result<Vec<u8>, StreamError>
where
    I: IntoIterator<Item = Vec<S>>,
    S: AsRef<[u8]>,
{
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    for record in records {
        writer
            .write_record(&record)
            .map_err(|e| StreamError::Encoding(e.to_string()))?;
    }
    writer
        .into_inner()
        .map_err(|e| StreamError::Encoding(e.to_string()))
}

impl Encoder for CsvEncoder {
    fn header(&mut self, meta: &TableMeta) -> Result<Vec<u8>, StreamError> {
        let names: Vec<&str> = meta.columns.iter().map(|c| c.name.as_str()).collect();
        write_csv(std::iter::once(names))
    }

    fn rows(&mut self, rows: &[Row]) -> Result<Vec<u8>, StreamError> {
        write_csv(rows.iter().map(|row| {
            row.iter()
                .map(|v| v.to_text().unwrap_or_default())
                .collect::<Vec<String>>()
        }))
    }

    fn footer(&mut self) -> Result<Vec<u8>, StreamError> {
        Ok(Vec::new())
    }
}

// ============================================================================
// VOTable (TABLEDATA serialization)
// ============================================================================

pub struct VoTableEncoder;

pub(crate) fn escape_xml(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn info_element(info: &Info) -> String {
    format!(
        "    <INFO name=\"{}\" value=\"{}\"/>\n",
        escape_xml(&info.name),
        escape_xml(&info.value)
    )
}

fn link_element(link: &Link) -> String {
    format!(
        "    <LINK content-role=\"{}\" title=\"{}\" href=\"{}\"/>\n",
        escape_xml(&link.content_role),
        escape_xml(&link.title),
        escape_xml(&link.href)
    )
}

fn field_element(column: &ColumnInfo) -> String {
    let mut attrs = format!(
        "name=\"{}\" datatype=\"{}\"",
        escape_xml(&column.name),
        escape_xml(&column.datatype)
    );
    match column.arraysize {
        Some(size) => attrs.push_str(&format!(" arraysize=\"{}\"", size)),
        None if column.datatype == "char" || column.datatype == "unicodeChar" => {
            attrs.push_str(" arraysize=\"*\"")
        }
        None => {}
    }
    if let Some(unit) = &column.unit {
        attrs.push_str(&format!(" unit=\"{}\"", escape_xml(unit)));
    }
    if let Some(ucd) = &column.ucd {
        attrs.push_str(&format!(" ucd=\"{}\"", escape_xml(ucd)));
    }

    match &column.description {
        Some(description) => format!(
            "      <FIELD {}>\n        <DESCRIPTION>{}</DESCRIPTION>\n      </FIELD>\n",
            attrs,
            escape_xml(description)
        ),
        None => format!("      <FIELD {}/>\n", attrs),
    }
}

fn cell(value: &DbValue) -> String {
    match value {
        DbValue::Null => "<TD/>".to_string(),
        value => format!("<TD>{}</TD>", escape_xml(&value.to_string())),
    }
}

impl Encoder for VoTableEncoder {
    fn header(&mut self, meta: &TableMeta) -> Result<Vec<u8>, StreamError> {
        let mut out = String::from(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <VOTABLE version=\"1.3\" xmlns=\"http://www.ivoa.net/xml/VOTable/v1.3\">\n  \
             <RESOURCE type=\"results\">\n",
        );
        for info in &meta.infos {
            out.push_str(&info_element(info));
        }
        for link in &meta.links {
            out.push_str(&link_element(link));
        }
        out.push_str(&format!(
            "    <TABLE name=\"{}\">\n",
            escape_xml(&meta.table_name)
        ));
        for column in &meta.columns {
            out.push_str(&field_element(column));
        }
        out.push_str("      <DATA>\n        <TABLEDATA>\n");
        Ok(out.into_bytes())
    }

    fn rows(&mut self, rows: &[Row]) -> Result<Vec<u8>, StreamError> {
        let mut out = String::new();
        for row in rows {
            out.push_str("          <TR>");
            for value in row {
                out.push_str(&cell(value));
            }
            out.push_str("</TR>\n");
        }
        Ok(out.into_bytes())
    }

    fn footer(&mut self) -> Result<Vec<u8>, StreamError> {
        Ok(b"        </TABLEDATA>\n      </DATA>\n    </TABLE>\n  </RESOURCE>\n</VOTABLE>\n".to_vec())
    }
}
