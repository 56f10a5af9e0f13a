//! Human output of the REST client commands: tables, JSON or raw bodies.

use crate::export::write_objects_csv;
use anyhow::Result;
use clap::ValueEnum;
use serde_json::Value;
use std::io::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Json,
    Raw,
    Csv,
}

#[derive(Debug, Clone, Default)]
pub struct RenderOpts {
    pub columns: Option<Vec<String>>,
    pub sort_by: Option<String>,
    pub filter: Option<String>,
}

pub fn render_value<W: Write>(
    json: &Value,
    format: OutputFormat,
    opts: &RenderOpts,
    columns: Option<&[&str]>,
    out: &mut W,
) -> Result<()> {
    match format {
        OutputFormat::Raw | OutputFormat::Json => {
            writeln!(out, "{}", serde_json::to_string(json)?)?;
        }
        OutputFormat::Csv => match rows(json) {
            Some(items) => write_objects_csv(items, &mut *out)?,
            None => writeln!(out, "{}", serde_json::to_string(json)?)?,
        },
        OutputFormat::Pretty => {
            if !print_table(json, columns, opts, out)? {
                writeln!(out, "{}", serde_json::to_string_pretty(json)?)?;
            }
        }
    }
    Ok(())
}

fn rows(json: &Value) -> Option<&Vec<Value>> {
    match json {
        Value::Array(arr) => Some(arr),
        Value::Object(map) => match map.get("data") {
            Some(Value::Array(arr)) => Some(arr),
            _ => None,
        },
        _ => None,
    }
}

fn has_value(rows: &[Value], key: &str) -> bool {
    rows.iter()
        .any(|row| row.get(key).is_some_and(is_non_empty))
}

/// Returns false when `json` has no tabular shape.
pub fn print_table<W: Write>(
    json: &Value,
    columns_hint: Option<&[&str]>,
    opts: &RenderOpts,
    out: &mut W,
) -> Result<bool> {
    let Some(rows) = rows(json) else {
        return Ok(false);
    };
    if rows.is_empty() {
        writeln!(out, "No resources found.")?;
        return Ok(true);
    }
    let Some(Value::Object(first)) = rows.first() else {
        return Ok(false);
    };

    let mut columns: Vec<String> = Vec::new();
    if let Some(wanted) = &opts.columns {
        columns.extend(wanted.iter().filter(|k| has_value(rows, k)).cloned());
    }
    if columns.is_empty()
        && let Some(hint) = columns_hint
    {
        columns.extend(
            hint.iter()
                .filter(|k| has_value(rows, k))
                .map(|k| k.to_string()),
        );
    }
    if columns.is_empty() {
        // Up to 8 fields of the first object that carry a value somewhere.
        for key in first.keys() {
            if has_value(rows, key) {
                columns.push(key.clone());
            }
            if columns.len() >= 8 {
                break;
            }
        }
    }
    if columns.is_empty() {
        return Ok(false);
    }

    let mut widths: Vec<usize> = columns.iter().map(|c| c.len()).collect();
    let needle = opts.filter.as_ref().map(|f| f.to_ascii_lowercase());
    let mut table: Vec<Vec<String>> = Vec::new();

    for row in rows {
        let Value::Object(map) = row else {
            continue;
        };
        let cells: Vec<String> = columns
            .iter()
            .map(|col| value_to_str(map.get(col).unwrap_or(&Value::Null)))
            .collect();
        if let Some(needle) = &needle
            && !cells
                .iter()
                .any(|cell| cell.to_ascii_lowercase().contains(needle))
        {
            continue;
        }
        for (idx, cell) in cells.iter().enumerate() {
            widths[idx] = widths[idx].max(cell.chars().count());
        }
        table.push(cells);
    }

    if table.is_empty() {
        writeln!(out, "No resources found.")?;
        return Ok(true);
    }

    if let Some(sort) = &opts.sort_by
        && let Some(idx) = columns.iter().position(|c| c == sort)
    {
        table.sort_by(|a, b| a[idx].cmp(&b[idx]));
    }

    write_row(out, &columns, &widths)?;
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    write_row(out, &rule, &widths)?;
    for row in &table {
        write_row(out, row, &widths)?;
    }
    Ok(true)
}

fn write_row<W: Write>(out: &mut W, cells: &[String], widths: &[usize]) -> Result<()> {
    let line: Vec<String> = cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{cell:width$}"))
        .collect();
    writeln!(out, "{}", line.join("  ").trim_end())?;
    Ok(())
}

pub fn value_to_str(value: &Value) -> String {
    match value {
        Value::Null => "".into(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn is_non_empty(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(_) | Value::Number(_) => true,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(arr) => !arr.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
