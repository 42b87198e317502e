use std::io::{Cursor, Read};
use std::path::Path;

use serde_json::Value;
use tracing::{debug, warn};

use mbc_types::Attributes;

use crate::error::{ImportError, ImportResult};

/// One data row of a CSV document: its cells keyed by header, or why the
/// record could not be read.
pub type CsvRow = Result<Attributes, String>;

/// Parse a CSV document with a header row.
///
/// Cells are kept as strings; interpreting them is the import strategy's
/// job. A record that cannot be read, or whose field count differs from the
/// header's, becomes an `Err` in its place so the remaining rows still
/// import. Only an unusable header fails the whole document.
pub fn parse_csv(content: &str) -> ImportResult<Vec<CsvRow>> {
    let content = content.trim_start_matches('\u{feff}');
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    if headers.iter().any(String::is_empty) {
        return Err(ImportError::Csv("header row contains an empty column name".into()));
    }

    let mut rows = Vec::new();
    let mut malformed = 0;
    for record in reader.records() {
        let row = match record {
            Ok(record) if record.len() == headers.len() => Ok(headers
                .iter()
                .zip(record.iter())
                .map(|(h, v)| (h.clone(), Value::String(v.to_string())))
                .collect()),
            Ok(record) => Err(format!(
                "record has {} field(s), header has {}",
                record.len(),
                headers.len()
            )),
            Err(e) => Err(e.to_string()),
        };
        if row.is_err() {
            malformed += 1;
        }
        rows.push(row);
    }
    debug!(rows = rows.len(), malformed, columns = headers.len(), "csv parsed");
    Ok(rows)
}

/// Why one archive entry could not be read.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EntryError {
    #[error("larger than the {limit} byte limit when uncompressed")]
    TooLarge { limit: u64 },

    #[error("not valid UTF-8: {0}")]
    NotUtf8(String),

    #[error("unreadable: {0}")]
    Unreadable(String),
}

/// One CSV file read from an archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Path inside the archive.
    pub name: String,
    /// File name without directories or extension.
    pub stem: String,
    pub content: Result<String, EntryError>,
}

/// Read every `.csv` file of a ZIP archive, in archive order. Directories,
/// other files, and macOS resource forks are skipped.
///
/// An entry that is too large, undecodable or not UTF-8 is returned with its
/// error; only an unreadable archive fails the call.
pub fn read_archive(bytes: &[u8], max_entry_bytes: u64) -> ImportResult<Vec<ArchiveEntry>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let mut entries = Vec::new();

    for index in 0..archive.len() {
        let mut file = archive.by_index(index)?;
        let name = file.name().to_string();
        if file.is_dir() || name.starts_with("__MACOSX/") {
            continue;
        }
        let path = Path::new(&name);
        let is_csv = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("csv"));
        if !is_csv {
            debug!(entry = %name, "skipping non-csv archive entry");
            continue;
        }
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();

        let content = read_entry(&mut file, max_entry_bytes);
        if let Err(e) = &content {
            warn!(entry = %name, error = %e, "archive entry unreadable");
        }
        entries.push(ArchiveEntry { name, stem, content });
    }
    Ok(entries)
}

/// Read at most `limit` bytes, whatever size the entry header declares.
fn read_entry(file: &mut impl Read, limit: u64) -> Result<String, EntryError> {
    let mut buf = Vec::new();
    file.take(limit.saturating_add(1))
        .read_to_end(&mut buf)
        .map_err(|e| EntryError::Unreadable(e.to_string()))?;
    if buf.len() as u64 > limit {
        return Err(EntryError::TooLarge { limit });
    }
    String::from_utf8(buf).map_err(|e| EntryError::NotUtf8(e.utf8_error().to_string()))
}

#[cfg(test)]
pub(crate) fn build_archive(files: &[(&str, &str)]) -> Vec<u8> {
    let files: Vec<(&str, &[u8])> = files.iter().map(|(n, c)| (*n, c.as_bytes())).collect();
    build_archive_bytes(&files)
}

#[cfg(test)]
pub(crate) fn build_archive_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    use std::io::Write;

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::FileOptions::default();
    for (name, content) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}
