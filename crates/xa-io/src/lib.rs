//! Saving and loading arrays.
//!
//! The native layout is a directory of JSON-lines part files (one per
//! partition) beside a `_META` descriptor carrying the dtype, finished off
//! with an empty `_SUCCESS` marker. Plain-text and CSV layouts are offered
//! for interchange; both lose the dtype and partitioning.

#![forbid(unsafe_code)]

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use xa_array::{ArrayError, XArray};
use xa_types::{DType, Value, render_value};

const META_FILE: &str = "_META";
const SUCCESS_FILE: &str = "_SUCCESS";

/// On-disk layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveFormat {
    /// Directory of JSON-lines part files plus metadata. Lossless.
    Binary,
    /// Directory of plain-text part files; elements render as text.
    Text,
    /// Single flat CSV file; flat element types only.
    Csv,
}

#[derive(Debug, Error)]
pub enum IoError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Array(#[from] ArrayError),
    #[error("{path:?} does not hold a saved array (no _META descriptor)")]
    MissingMeta { path: PathBuf },
    #[error("csv output supports flat element types, not {dtype}")]
    CsvDType { dtype: DType },
}

#[derive(Debug, Serialize, Deserialize)]
struct Meta {
    dtype: DType,
    num_partitions: usize,
}

/// Choose a layout from the path's extension: `.txt` is text, `.csv` is
/// csv, anything else is the native binary directory.
#[must_use]
pub fn sniff_format(path: &Path) -> SaveFormat {
    match path.extension().and_then(|e| e.to_str()) {
        Some("txt") => SaveFormat::Text,
        Some("csv") => SaveFormat::Csv,
        _ => SaveFormat::Binary,
    }
}

/// Write `array` to `path`, sniffing the layout from the extension when
/// `format` is absent. Completed directory layouts carry an empty
/// `_SUCCESS` marker.
pub fn save(array: &XArray, path: &Path, format: Option<SaveFormat>) -> Result<(), IoError> {
    let format = format.unwrap_or_else(|| sniff_format(path));
    debug!("saving {} array to {:?} as {:?}", array.dtype(), path, format);
    match format {
        SaveFormat::Binary => save_binary(array, path),
        SaveFormat::Text => save_text(array, path),
        SaveFormat::Csv => save_csv(array, path),
    }
}

fn part_name(i: usize) -> String {
    format!("part-{i:05}")
}

fn write_success(dir: &Path) -> Result<(), IoError> {
    File::create(dir.join(SUCCESS_FILE))?;
    Ok(())
}

fn save_binary(array: &XArray, dir: &Path) -> Result<(), IoError> {
    let partitions = array.handle().partitions().map_err(ArrayError::from)?;
    fs::create_dir_all(dir)?;
    for (i, part) in partitions.iter().enumerate() {
        let mut out = BufWriter::new(File::create(dir.join(part_name(i)))?);
        for v in part {
            serde_json::to_writer(&mut out, v)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
    }
    let meta = Meta {
        dtype: array.dtype(),
        num_partitions: partitions.len(),
    };
    serde_json::to_writer(File::create(dir.join(META_FILE))?, &meta)?;
    write_success(dir)
}

fn save_text(array: &XArray, dir: &Path) -> Result<(), IoError> {
    let partitions = array.handle().partitions().map_err(ArrayError::from)?;
    fs::create_dir_all(dir)?;
    for (i, part) in partitions.iter().enumerate() {
        let mut out = BufWriter::new(File::create(dir.join(part_name(i)))?);
        for v in part {
            writeln!(out, "{}", render_value(v))?;
        }
        out.flush()?;
    }
    write_success(dir)
}

fn save_csv(array: &XArray, path: &Path) -> Result<(), IoError> {
    if matches!(array.dtype(), DType::List | DType::Dict) {
        return Err(IoError::CsvDType {
            dtype: array.dtype(),
        });
    }
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_path(path)?;
    for v in array.collect()? {
        writer.write_record([render_value(&v)])?;
    }
    writer.flush()?;
    Ok(())
}

/// Read an array back. Directories holding a `_META` descriptor reload
/// losslessly; other directories and `.txt` files load as text (string
/// elements); `.csv` files load with scalar parsing.
pub fn load(path: &Path) -> Result<XArray, IoError> {
    if path.is_dir() {
        if path.join(META_FILE).is_file() {
            return load_binary(path);
        }
        return load_text_dir(path);
    }
    match sniff_format(path) {
        SaveFormat::Csv => load_csv(path),
        _ => load_text_file(path),
    }
}

fn part_files(dir: &Path) -> Result<Vec<PathBuf>, IoError> {
    let mut parts: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("part-"))
        })
        .collect();
    parts.sort();
    Ok(parts)
}

fn load_binary(dir: &Path) -> Result<XArray, IoError> {
    let meta: Meta = serde_json::from_reader(File::open(dir.join(META_FILE))?)?;
    let mut partitions = Vec::with_capacity(meta.num_partitions);
    for part in part_files(dir)? {
        let reader = BufReader::new(File::open(part)?);
        let mut values = Vec::new();
        for line in reader.lines() {
            values.push(serde_json::from_str::<Value>(&line?)?);
        }
        partitions.push(values);
    }
    Ok(XArray::from_partitions(partitions, meta.dtype))
}

fn load_text_dir(dir: &Path) -> Result<XArray, IoError> {
    let mut partitions = Vec::new();
    for part in part_files(dir)? {
        let reader = BufReader::new(File::open(part)?);
        let mut values = Vec::new();
        for line in reader.lines() {
            values.push(Value::Str(line?));
        }
        partitions.push(values);
    }
    if partitions.is_empty() {
        return Err(IoError::MissingMeta {
            path: dir.to_path_buf(),
        });
    }
    Ok(XArray::from_partitions(partitions, DType::Str))
}

fn load_text_file(path: &Path) -> Result<XArray, IoError> {
    let reader = BufReader::new(File::open(path)?);
    let values: Vec<Value> = reader
        .lines()
        .map(|l| l.map(Value::Str))
        .collect::<Result<_, _>>()?;
    Ok(XArray::from_partitions(vec![values], DType::Str))
}

// Scalar inference for csv fields: int, then float, then bool, falling back
// to text; empty fields are missing.
fn parse_scalar(field: &str) -> Value {
    if field.is_empty() {
        return Value::Undefined;
    }
    if let Ok(i) = field.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = field.parse::<f64>() {
        return Value::Float(f);
    }
    match field {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::Str(field.to_owned()),
    }
}

fn load_csv(path: &Path) -> Result<XArray, IoError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    let mut values = Vec::new();
    for record in reader.records() {
        let record = record?;
        values.push(parse_scalar(record.get(0).unwrap_or_default()));
    }
    Ok(XArray::from_values(values, None, false)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use xa_types::Value;

    fn ints(values: &[i64]) -> XArray {
        XArray::from_vec(values.iter().copied().map(Value::Int).collect()).unwrap()
    }

    #[test]
    fn binary_roundtrip_preserves_dtype_and_order() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("saved");
        let a = XArray::from_vec(vec![
            Value::Int(1),
            Value::Undefined,
            Value::Int(3),
            Value::Int(4),
            Value::Int(5),
        ])
        .unwrap();
        save(&a, &target, None).unwrap();
        assert!(target.join("_SUCCESS").is_file());
        assert!(target.join("_META").is_file());
        let back = load(&target).unwrap();
        assert_eq!(back.dtype(), DType::Int);
        assert_eq!(back.collect().unwrap(), a.collect().unwrap());
    }

    #[test]
    fn binary_roundtrip_handles_containers() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("lists");
        let a = XArray::from_vec(vec![
            Value::List(vec![Value::Int(1), Value::from("x")]),
            Value::List(vec![]),
        ])
        .unwrap();
        save(&a, &target, None).unwrap();
        let back = load(&target).unwrap();
        assert_eq!(back.dtype(), DType::List);
        assert_eq!(back.collect().unwrap(), a.collect().unwrap());
    }

    #[test]
    fn text_save_renders_lines_and_loads_as_strings() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("out.txt");
        save(&ints(&[1, 2, 3]), &target, None).unwrap();
        assert!(target.join("_SUCCESS").is_file());
        let back = load(&target).unwrap();
        assert_eq!(back.dtype(), DType::Str);
        assert_eq!(
            back.collect().unwrap(),
            vec![Value::from("1"), Value::from("2"), Value::from("3")]
        );
    }

    #[test]
    fn csv_roundtrip_reparses_scalars() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("out.csv");
        save(&ints(&[1, 2, 3]), &target, None).unwrap();
        let back = load(&target).unwrap();
        assert_eq!(back.dtype(), DType::Int);
        assert_eq!(
            back.collect().unwrap(),
            vec![Value::Int(1), Value::Int(2), Value::Int(3)]
        );
    }

    #[test]
    fn csv_rejects_container_dtypes() {
        let dir = TempDir::new().unwrap();
        let a = XArray::from_vec(vec![Value::List(vec![Value::Int(1)])]).unwrap();
        let err = save(&a, &dir.path().join("bad.csv"), None).unwrap_err();
        assert!(matches!(err, IoError::CsvDType { .. }));
    }

    #[test]
    fn explicit_format_overrides_the_extension() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("plain");
        save(&ints(&[7]), &target, Some(SaveFormat::Text)).unwrap();
        let back = load(&target).unwrap();
        assert_eq!(back.dtype(), DType::Str);
        assert_eq!(back.collect().unwrap(), vec![Value::from("7")]);
    }

    #[test]
    fn loading_an_empty_directory_fails() {
        let dir = TempDir::new().unwrap();
        let err = load(dir.path()).unwrap_err();
        assert!(matches!(err, IoError::MissingMeta { .. }));
    }
}
