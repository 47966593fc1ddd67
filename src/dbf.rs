use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use encoding_rs::Encoding;
use polars::prelude::*;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::debug;
use ::zip::result::ZipError;
use ::zip::ZipArchive;

use crate::error::PipelineError;

const FIELD_DESCRIPTOR_LEN: usize = 32;
const HEADER_TERMINATOR: u8 = 0x0d;
const RECORD_DELETED: u8 = 0x2a;

/// One column of a DBF attribute table.
#[derive(Debug, Clone)]
pub struct DbfField {
    pub name: String,
    pub field_type: u8,
    pub length: usize,
}

impl DbfField {
    fn is_numeric(&self) -> bool {
        matches!(self.field_type, b'N' | b'F')
    }
}

/// A fully materialized DBF table. Character fields are decoded with the
/// encoding the caller supplies (the source grids carry cp949 region names).
#[derive(Debug)]
pub struct DbfTable {
    pub fields: Vec<DbfField>,
    text_columns: Vec<Option<Vec<String>>>,
    numeric_columns: Vec<Option<Vec<Option<f64>>>>,
    pub record_count: usize,
}

/// Resolve a configured encoding label. "cp949" is not a WHATWG label, so it
/// is mapped onto encoding_rs's EUC-KR (which implements windows-949).
pub fn encoding_for_label(label: &str) -> Option<&'static Encoding> {
    match label.to_ascii_lowercase().as_str() {
        "cp949" | "949" | "uhc" => Some(encoding_rs::EUC_KR),
        other => Encoding::for_label(other.as_bytes()),
    }
}

/// Read the named entry of a zip archive fully into memory.
pub fn extract_zip_entry(archive_path: &Path, entry: &str) -> Result<Vec<u8>> {
    let file = File::open(archive_path)
        .with_context(|| format!("Failed to open archive: {:?}", archive_path))?;
    let mut archive = ZipArchive::new(file)
        .with_context(|| format!("Failed to read archive: {:?}", archive_path))?;
    let mut entry_file = match archive.by_name(entry) {
        Ok(f) => f,
        Err(ZipError::FileNotFound) => {
            return Err(PipelineError::MissingArchiveEntry {
                archive: archive_path.to_path_buf(),
                entry: entry.to_string(),
            }
            .into())
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to open entry '{}'", entry)),
    };
    let mut buf = Vec::with_capacity(entry_file.size() as usize);
    entry_file
        .read_to_end(&mut buf)
        .with_context(|| format!("Failed to read entry '{}' from {:?}", entry, archive_path))?;
    Ok(buf)
}

/// Parse a dBASE III attribute table.
pub fn read_dbf<R: Read + Seek>(mut reader: R, encoding: &'static Encoding) -> Result<DbfTable> {
    let _version = reader.read_u8()?;
    let mut _last_update = [0u8; 3];
    reader.read_exact(&mut _last_update)?;
    let record_count = reader.read_u32::<LittleEndian>()? as usize;
    let header_len = reader.read_u16::<LittleEndian>()? as usize;
    let record_len = reader.read_u16::<LittleEndian>()? as usize;
    let mut _reserved = [0u8; 20];
    reader.read_exact(&mut _reserved)?;

    let mut fields = Vec::new();
    loop {
        let first = reader.read_u8()?;
        if first == HEADER_TERMINATOR {
            break;
        }
        let mut descriptor = [0u8; FIELD_DESCRIPTOR_LEN - 1];
        reader.read_exact(&mut descriptor)?;
        let mut name_bytes = vec![first];
        name_bytes.extend(descriptor[..10].iter().take_while(|&&b| b != 0));
        // Field names are plain ASCII in practice.
        let name = String::from_utf8_lossy(&name_bytes)
            .trim_end_matches('\0')
            .to_string();
        let field_type = descriptor[10];
        let length = descriptor[15] as usize;
        fields.push(DbfField {
            name,
            field_type,
            length,
        });
    }

    let fields_len: usize = fields.iter().map(|f| f.length).sum();
    if fields_len + 1 != record_len {
        return Err(PipelineError::Dbf(format!(
            "field lengths sum to {} but record length is {}",
            fields_len + 1,
            record_len
        ))
        .into());
    }

    // The header may carry vendor bytes past the descriptors.
    reader.seek(SeekFrom::Start(header_len as u64))?;

    let mut text_columns: Vec<Option<Vec<String>>> = fields
        .iter()
        .map(|f| if f.is_numeric() { None } else { Some(Vec::with_capacity(record_count)) })
        .collect();
    let mut numeric_columns: Vec<Option<Vec<Option<f64>>>> = fields
        .iter()
        .map(|f| if f.is_numeric() { Some(Vec::with_capacity(record_count)) } else { None })
        .collect();

    let mut record = vec![0u8; record_len];
    let mut kept = 0usize;
    for _ in 0..record_count {
        reader
            .read_exact(&mut record)
            .map_err(|e| PipelineError::Dbf(format!("truncated record section: {}", e)))?;
        if record[0] == RECORD_DELETED {
            continue;
        }
        kept += 1;
        let mut offset = 1;
        for (idx, field) in fields.iter().enumerate() {
            let raw = &record[offset..offset + field.length];
            offset += field.length;
            if field.is_numeric() {
                let text = String::from_utf8_lossy(raw);
                let trimmed = text.trim();
                let value = if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.parse::<f64>().map_err(|_| {
                        PipelineError::Dbf(format!(
                            "field '{}' holds non-numeric value '{}'",
                            field.name, trimmed
                        ))
                    })?)
                };
                if let Some(col) = &mut numeric_columns[idx] {
                    col.push(value);
                }
            } else {
                let (decoded, _, _) = encoding.decode(raw);
                if let Some(col) = &mut text_columns[idx] {
                    col.push(decoded.trim().to_string());
                }
            }
        }
    }
    debug!("DBF: {} fields, {} live records", fields.len(), kept);

    Ok(DbfTable {
        fields,
        text_columns,
        numeric_columns,
        record_count: kept,
    })
}

impl DbfTable {
    /// Column-oriented extraction into a polars DataFrame: N/F fields become
    /// Float64 columns, everything else String.
    pub fn to_dataframe(&self) -> Result<DataFrame> {
        let mut columns: Vec<Column> = Vec::with_capacity(self.fields.len());
        for (idx, field) in self.fields.iter().enumerate() {
            if let Some(values) = &self.numeric_columns[idx] {
                columns.push(Series::new(field.name.as_str().into(), values.clone()).into());
            } else if let Some(values) = &self.text_columns[idx] {
                columns.push(Series::new(field.name.as_str().into(), values.clone()).into());
            }
        }
        DataFrame::new(columns).context("Failed to assemble DataFrame from DBF table")
    }
}

/// Extract a DBF entry from a zip archive and read it in one step.
pub fn read_dbf_from_archive(
    archive_path: &Path,
    entry: &str,
    encoding: &'static Encoding,
) -> Result<DataFrame> {
    let bytes = extract_zip_entry(archive_path, entry)?;
    let table = read_dbf(std::io::Cursor::new(bytes), encoding)?;
    table.to_dataframe()
}

/// Test-only builders for DBF payloads and archives, shared with the ETL
/// end-to-end tests.
#[cfg(test)]
pub(crate) mod fixtures {
    use std::io::Write;
    use std::path::Path;
    use zip::write::FileOptions;
    use zip::CompressionMethod;

    /// Hand-build a minimal dBASE III table with the given
    /// (name, type, length) fields and pre-rendered fixed-width rows.
    pub fn build_dbf(fields: &[(&str, u8, usize)], rows: &[Vec<String>]) -> Vec<u8> {
        let record_len: usize = 1 + fields.iter().map(|f| f.2).sum::<usize>();
        let header_len = 32 + 32 * fields.len() + 1;
        let mut out = Vec::new();
        out.push(0x03u8);
        out.extend([24u8, 1, 1]); // last update, unused
        out.extend((rows.len() as u32).to_le_bytes());
        out.extend((header_len as u16).to_le_bytes());
        out.extend((record_len as u16).to_le_bytes());
        out.extend([0u8; 20]);
        for (name, ftype, len) in fields {
            let mut descriptor = [0u8; 32];
            descriptor[..name.len()].copy_from_slice(name.as_bytes());
            descriptor[11] = *ftype;
            descriptor[16] = *len as u8;
            out.extend(descriptor);
        }
        out.push(0x0d);
        for row in rows {
            out.push(0x20);
            for ((_, _, len), value) in fields.iter().zip(row) {
                let mut cell = value.clone().into_bytes();
                cell.resize(*len, b' ');
                out.extend(cell);
            }
        }
        out.push(0x1a);
        out
    }

    /// Write `payload` into a single-entry zip archive at `path`.
    pub fn write_archive(path: &Path, entry: &str, payload: &[u8]) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = FileOptions::default().compression_method(CompressionMethod::Stored);
        zip.start_file(entry, options).unwrap();
        zip.write_all(payload).unwrap();
        zip.finish().unwrap();
    }
}
