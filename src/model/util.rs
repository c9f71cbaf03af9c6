//! Utility functions for the model module: CSV delimiters, number formatting for the messages shown to residents and date helpers.

use chrono::{DateTime, Utc};
use std::path::Path;

pub fn get_delimiter(filepath: &Path) -> Result<u8, anyhow::Error> {
    let suffix = match filepath.extension().and_then(|s| s.to_str()) {
        Some(suffix) => suffix.to_lowercase(),
        None => return Err(anyhow::anyhow!("File has no extension: {}", filepath.display())),
    };

    if suffix == "csv" {
        Ok(b',')
    } else if suffix == "tsv" {
        Ok(b'\t')
    } else if suffix == "txt" {
        Ok(b' ')
    } else {
        Err(anyhow::anyhow!("Unsupported file type: {}", suffix))
    }
}

/// Formats an amount the way it appears in messages: `2000` rather than `2000.0`, `1999.5` as is.
pub fn format_amount(amount: f64) -> String {
    if amount.fract() == 0.0 && amount.abs() < 1e15 {
        format!("{}", amount as i64)
    } else {
        format!("{}", amount)
    }
}

pub fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

/// Whole days elapsed since `since`.
pub fn age_days(since: &DateTime<Utc>, now: &DateTime<Utc>) -> i64 {
    (*now - *since).num_days()
}

pub fn format_date(date: &DateTime<Utc>) -> String {
    date.format("%Y-%m-%d").to_string()
}
