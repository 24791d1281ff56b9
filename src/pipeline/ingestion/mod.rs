// Pipeline ingestion: reading decrypted export files into raw tables

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::domain::{RawRecord, RawTable};
use crate::error::{PipelineError, Result};
use crate::metrics::IngestMetrics;
use crate::pipeline::processing::mapping::MappingSpec;

/// File extensions picked up when an input argument is a directory.
pub const INPUT_EXTENSIONS: &[&str] = &["csv", "tsv", "txt"];

pub fn content_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Decodes export bytes to text. UTF-16 is recognised by its byte order mark;
/// everything else must be UTF-8 (a leading BOM is dropped).
pub fn decode(bytes: &[u8]) -> Result<String> {
    let invalid = |what: String| PipelineError::Io(io::Error::new(io::ErrorKind::InvalidData, what));

    let utf16 = |body: &[u8], from_bytes: fn([u8; 2]) -> u16| -> Result<String> {
        if body.len() % 2 != 0 {
            return Err(invalid("UTF-16 input has an odd number of bytes".to_string()));
        }
        let units: Vec<u16> = body.chunks_exact(2).map(|c| from_bytes([c[0], c[1]])).collect();
        String::from_utf16(&units).map_err(|e| invalid(format!("invalid UTF-16: {}", e)))
    };

    match bytes {
        [0xFF, 0xFE, rest @ ..] => utf16(rest, u16::from_le_bytes),
        [0xFE, 0xFF, rest @ ..] => utf16(rest, u16::from_be_bytes),
        [0xEF, 0xBB, 0xBF, rest @ ..] => String::from_utf8(rest.to_vec())
            .map_err(|e| invalid(format!("invalid UTF-8: {}", e))),
        _ => String::from_utf8(bytes.to_vec()).map_err(|e| invalid(format!("invalid UTF-8: {}", e))),
    }
}

/// Splits decoded text into a header row and data rows. `preamble` rows
/// before the header (export warnings, titles) are discarded.
pub fn parse_table(source: &str, text: &str, delimiter: char, preamble: usize) -> Result<RawTable> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter as u8)
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut records = reader.records().skip(preamble);
    let headers: Vec<String> = match records.next() {
        Some(row) => row?.iter().map(str::to_string).collect(),
        None => return Err(PipelineError::EmptyInput(source.to_string())),
    };

    let mut rows = Vec::new();
    for row in records {
        let row = row?;
        let line = row.position().map(|p| p.line() as usize).unwrap_or(0);
        rows.push(RawRecord {
            line,
            cells: row.iter().map(str::to_string).collect(),
        });
    }

    Ok(RawTable {
        source: source.to_string(),
        headers,
        rows,
        digest: String::new(),
    })
}

/// Reads one input file under a marketplace's format settings.
pub fn read_table(path: &Path, spec: &MappingSpec) -> Result<RawTable> {
    let started = Instant::now();
    let bytes = fs::read(path)?;
    let source = path.display().to_string();
    let text = decode(&bytes)?;
    let mut table = parse_table(&source, &text, spec.delimiter, spec.header_row)?;
    table.digest = content_digest(&bytes);

    debug!(source = %source, digest = %table.digest, "Decoded input file");
    IngestMetrics::record_file(bytes.len(), table.rows.len(), started.elapsed().as_secs_f64());
    Ok(table)
}

/// Expands directories into their export files sorted by name; files are kept
/// in the order given.
pub fn expand_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut found: Vec<PathBuf> = fs::read_dir(input)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && has_input_extension(p))
                .collect();
            found.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
            info!(dir = %input.display(), files = found.len(), "Expanded input directory");
            files.extend(found);
        } else {
            files.push(input.clone());
        }
    }
    Ok(files)
}

fn has_input_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| INPUT_EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf16le_with_bom(text: &str) -> Vec<u8> {
        let mut bytes = vec![0xFF, 0xFE];
        for unit in text.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn test_decode_utf16_and_bom() {
        let text = "訂單編號\t數量\n20240107000001\t2\n";
        assert_eq!(decode(&utf16le_with_bom(text)).unwrap(), text);

        let mut utf8 = vec![0xEF, 0xBB, 0xBF];
        utf8.extend_from_slice("a,b\n".as_bytes());
        assert_eq!(decode(&utf8).unwrap(), "a,b\n");

        assert!(decode(&[0xC3, 0x28]).is_err());
    }

    #[test]
    fn test_parse_table_skips_preamble_and_tracks_lines() {
        let text = "※ 此檔案僅供內部使用\n訂單編號\t數量\n20240107000001\t2\n\n20240107000002\t1\t extra\n";
        let table = parse_table("f.tsv", text, '\t', 1).unwrap();
        assert_eq!(table.headers, vec!["訂單編號", "數量"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].line, 3);
        assert_eq!(table.rows[1].cells[2], " extra");
        assert!(table.rows[1].cells.get(7).is_none());
    }

    #[test]
    fn test_parse_table_without_header_is_error() {
        assert!(matches!(
            parse_table("empty.csv", "", ',', 0),
            Err(PipelineError::EmptyInput(_))
        ));
    }

    #[test]
    fn test_expand_inputs_sorts_directory_entries() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.csv", "a.tsv", "notes.md", "c.TXT"] {
            fs::write(dir.path().join(name), "x\n").unwrap();
        }
        let explicit = dir.path().join("b.csv");
        let files = expand_inputs(&[explicit.clone(), dir.path().to_path_buf()]).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["b.csv", "a.tsv", "b.csv", "c.TXT"]);
    }

    #[test]
    fn test_digest_is_content_based() {
        assert_eq!(content_digest(b"abc"), content_digest(b"abc"));
        assert_ne!(content_digest(b"abc"), content_digest(b"abd"));
        assert_eq!(content_digest(b"").len(), 64);
    }
}
