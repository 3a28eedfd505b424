use crate::model::Record;
use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::Deserialize;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    #[default]
    Csv,
    Json,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Debug, Clone)]
pub struct Exporter {
    output_dir: PathBuf,
}

impl Exporter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)
            .with_context(|| format!("failed to create output dir {}", output_dir.display()))?;
        Ok(Self { output_dir })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Writes `records` to `<output_dir>/<filename>.<ext>`. Returns `None`
    /// without touching the filesystem when there is nothing to write.
    pub fn export(
        &self,
        records: &[Record],
        filename: &str,
        format: ExportFormat,
    ) -> Result<Option<PathBuf>> {
        if records.is_empty() {
            warn!("no data to export");
            return Ok(None);
        }

        let path = self
            .output_dir
            .join(format!("{filename}.{}", format.extension()));
        match format {
            ExportFormat::Csv => write_csv(records, &path)?,
            ExportFormat::Json => write_json(records, &path)?,
        }

        info!(records = records.len(), file = %path.display(), %format, "exported records");
        Ok(Some(path))
    }
}

/// Writes CSV straight to `path`; does nothing for empty input.
pub fn export_csv(records: &[Record], path: &Path) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output dir {}", parent.display()))?;
    }
    write_csv(records, path)
}

/// Union of field names across all records, first-seen order.
pub fn csv_header(records: &[Record]) -> Vec<&str> {
    let mut header: Vec<&str> = Vec::new();
    for record in records {
        for name in record.names() {
            if !header.contains(&name) {
                header.push(name);
            }
        }
    }
    header
}

fn write_csv(records: &[Record], path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create csv file {}", path.display()))?;
    let header = csv_header(records);
    writer.write_record(&header)?;
    for record in records {
        writer.write_record(header.iter().map(|name| record.get(name).unwrap_or("")))?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to write csv file {}", path.display()))?;
    Ok(())
}

fn write_json(records: &[Record], path: &Path) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create json file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, records)?;
    writer.write_all(b"\n")?;
    writer
        .flush()
        .with_context(|| format!("failed to write json file {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Vec<Record> {
        vec![
            [("name", Some("Test1")), ("value", Some("100"))]
                .into_iter()
                .collect(),
            [("name", Some("Test, \"two\"")), ("value", None), ("note", Some("late"))]
                .into_iter()
                .collect(),
        ]
    }

    #[test]
    fn csv_has_union_header_and_blank_missing_cells() -> Result<()> {
        let dir = tempdir()?;
        let exporter = Exporter::new(dir.path().join("nested/out"))?;
        let path = exporter
            .export(&sample(), "test", ExportFormat::Csv)?
            .expect("file written");

        assert!(path.ends_with("test.csv"));
        let text = std::fs::read_to_string(&path)?;
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "name,value,note");
        assert_eq!(lines[1], "Test1,100,");
        assert_eq!(lines[2], "\"Test, \"\"two\"\"\",,late");
        Ok(())
    }

    #[test]
    fn json_preserves_order_nulls_and_unicode() -> Result<()> {
        let dir = tempdir()?;
        let exporter = Exporter::new(dir.path())?;
        let records = vec![
            [("title", Some("Crème brûlée")), ("price", None::<&str>)]
                .into_iter()
                .collect::<Record>(),
        ];
        let path = exporter
            .export(&records, "desserts", ExportFormat::Json)?
            .expect("file written");

        let text = std::fs::read_to_string(&path)?;
        assert!(text.contains("Crème brûlée"));
        assert!(text.find("\"title\"") < text.find("\"price\""));

        let parsed: serde_json::Value = serde_json::from_str(&text)?;
        assert_eq!(parsed[0]["price"], serde_json::Value::Null);
        Ok(())
    }

    #[test]
    fn empty_input_writes_nothing() -> Result<()> {
        let dir = tempdir()?;
        let exporter = Exporter::new(dir.path())?;
        assert!(exporter.export(&[], "empty", ExportFormat::Csv)?.is_none());
        assert!(!dir.path().join("empty.csv").exists());

        export_csv(&[], &dir.path().join("legacy.csv"))?;
        assert!(!dir.path().join("legacy.csv").exists());
        Ok(())
    }

    #[test]
    fn format_names() {
        assert_eq!(ExportFormat::Csv.to_string(), "csv");
        assert_eq!(ExportFormat::Json.extension(), "json");
        let parsed: ExportFormat = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(parsed, ExportFormat::Json);
    }
}
