use anyhow::{Context, Result};
use serde_json::Value;
use std::fmt::Write;
use std::str::FromStr;

use crate::tasks::task::ResultRecord;

/// Output format of a result export
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Jsonl,
    Csv,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Jsonl => "jsonl",
            Self::Csv => "csv",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "jsonl" | "ndjson" => Ok(Self::Jsonl),
            "csv" => Ok(Self::Csv),
            other => anyhow::bail!("Unsupported export format: {}", other),
        }
    }
}

/// Render `records` in the requested format
pub fn render(records: &[ResultRecord], format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Json => serde_json::to_string_pretty(records).context("Failed to serialize results"),
        ExportFormat::Jsonl => {
            let mut out = String::new();
            for record in records {
                out.push_str(&serde_json::to_string(record).context("Failed to serialize result")?);
                out.push('\n');
            }
            Ok(out)
        }
        ExportFormat::Csv => Ok(render_csv(records)),
    }
}

/// Flatten the top-level fields of each payload into columns
fn render_csv(records: &[ResultRecord]) -> String {
    let mut columns: Vec<String> = Vec::new();
    for record in records {
        if let Value::Object(map) = &record.data {
            for key in map.keys() {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }
    }

    let mut out = String::new();
    let mut header = vec!["task_id".to_string(), "keyword".into(), "page".into(), "extracted_at".into()];
    header.extend(columns.iter().cloned());
    push_row(&mut out, &header);

    for record in records {
        let mut row = vec![
            record.task_id.to_string(),
            record.keyword.clone(),
            record.page.to_string(),
            record.extracted_at.to_rfc3339(),
        ];
        for column in &columns {
            let cell = match record.data.get(column) {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            };
            row.push(cell);
        }
        push_row(&mut out, &row);
    }

    out
}

fn push_row(out: &mut String, cells: &[String]) {
    let line = cells.iter().map(|c| escape(c)).collect::<Vec<_>>().join(",");
    let _ = writeln!(out, "{}", line);
}

fn escape(cell: &str) -> String {
    if cell.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}
