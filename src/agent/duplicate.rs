//! Duplicate detection on a CSV export of bills.
//!
//! Two rows are duplicates when they share the resident name, amount, status, date and comments, compared case-insensitively after trimming. Only the bill id may differ.

use crate::model::util::{get_delimiter, round_to};
use itertools::Itertools;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const ANALYSIS_TYPE: &str = "billing_duplicate_detection";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BillRow {
    #[serde(rename = "Bill ID")]
    pub bill_id: String,
    #[serde(rename = "Resident Name")]
    pub resident_name: String,
    #[serde(rename = "Amount")]
    pub amount: f64,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Date")]
    pub date: String,
    #[serde(rename = "Comments", default)]
    pub comments: Option<String>,
}

impl BillRow {
    fn key(&self) -> (String, i64, String, String, String) {
        (
            self.resident_name.trim().to_lowercase(),
            (self.amount * 100.0).round() as i64,
            self.status.trim().to_lowercase(),
            self.date.trim().to_lowercase(),
            self.comments.as_deref().unwrap_or("").trim().to_lowercase(),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DuplicateDetail {
    pub resident_name: String,
    pub amount: i64,
    pub status: String,
    pub date: String,
    pub comments: String,
    pub bill_ids: Vec<String>,
    pub count: u64,
}

/// The report printed by the billing agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DuplicateReport {
    pub analysis_type: String,
    pub csv_file: String,
    pub total_records: u64,
    pub duplicate_records: u64,
    pub duplicate_percentage: f64,
    pub raw_output: String,
    pub duplicate_details: Vec<DuplicateDetail>,
}

/// Groups of at least two rows, ordered by resident, amount, status, date and comments.
pub fn find_duplicates(rows: &[BillRow]) -> Vec<DuplicateDetail> {
    rows.iter()
        .into_group_map_by(|row| row.key())
        .into_iter()
        .filter(|(_, group)| group.len() > 1)
        .sorted_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, group)| {
            let first = group[0];
            DuplicateDetail {
                resident_name: first.resident_name.trim().to_string(),
                amount: first.amount.round() as i64,
                status: first.status.trim().to_string(),
                date: first.date.trim().to_string(),
                comments: first.comments.as_deref().unwrap_or("").trim().to_string(),
                bill_ids: group.iter().map(|row| row.bill_id.clone()).collect(),
                count: group.len() as u64,
            }
        })
        .collect()
}

pub fn build_report(csv_file: &str, rows: &[BillRow]) -> DuplicateReport {
    let details = find_duplicates(rows);
    let duplicate_records = details.iter().map(|d| d.count).sum::<u64>();
    let total_records = rows.len() as u64;
    let percentage = if total_records == 0 {
        0.0
    } else {
        round_to(duplicate_records as f64 / total_records as f64 * 100.0, 2)
    };

    let raw_output = if details.is_empty() {
        "No duplicate entries found based on Resident Name, Amount, Status, Date, and Comments."
            .to_string()
    } else {
        format!("Duplicate entries found ({} rows)", duplicate_records)
    };

    DuplicateReport {
        analysis_type: ANALYSIS_TYPE.to_string(),
        csv_file: csv_file.to_string(),
        total_records,
        duplicate_records,
        duplicate_percentage: percentage,
        raw_output,
        duplicate_details: details,
    }
}

pub fn read_bill_rows(filepath: &Path) -> Result<Vec<BillRow>, anyhow::Error> {
    let delimiter = get_delimiter(filepath)?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .from_path(filepath)?;

    let mut rows = Vec::new();
    for result in reader.deserialize::<BillRow>() {
        let row: BillRow = result?;
        rows.push(row);
    }

    debug!("Read {} bills from {}.", rows.len(), filepath.display());
    Ok(rows)
}

pub fn detect_duplicates(filepath: &Path) -> Result<DuplicateReport, anyhow::Error> {
    if !filepath.exists() {
        return Err(anyhow::anyhow!("File {} not found", filepath.display()));
    }

    let rows = read_bill_rows(filepath)?;
    let report = build_report(&filepath.display().to_string(), &rows);
    info!(
        "{} of {} bills in {} are duplicates.",
        report.duplicate_records,
        report.total_records,
        filepath.display()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    const SAMPLE: &str = "Bill ID,Resident Name,Amount,Status,Date,Comments
BILL089,Neha Patel,2000,Paid,2025-07-11,
BILL099,Neha Patel ,2000,paid,2025-07-11,
BILL002,Raj Verma,1200,Disputed,2025-07-16,Dispute over water charges
BILL014,Raj Verma,1200,Disputed,2025-07-16,dispute over water charges
BILL022,Raj Verma,1200,Disputed,2025-07-16,Dispute over water charges
BILL010,Vikram Iyer,1500,Pending,2025-07-16,
BILL011,Vikram Iyer,1800,Pending,2025-07-16,
";

    #[test]
    fn test_detect_duplicates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bills.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let report = detect_duplicates(&path).unwrap();
        assert_eq!(report.analysis_type, "billing_duplicate_detection");
        assert_eq!(report.total_records, 7);
        assert_eq!(report.duplicate_records, 5);
        assert_eq!(report.duplicate_percentage, 71.43);
        assert_eq!(report.duplicate_details.len(), 2);

        let neha = &report.duplicate_details[0];
        assert_eq!(neha.resident_name, "Neha Patel");
        assert_eq!(neha.amount, 2000);
        assert_eq!(neha.bill_ids, vec!["BILL089", "BILL099"]);
        assert_eq!(neha.comments, "");

        let raj = &report.duplicate_details[1];
        assert_eq!(raj.count, 3);
        assert_eq!(raj.comments, "Dispute over water charges");
        assert_eq!(report.raw_output, "Duplicate entries found (5 rows)");
    }

    #[test]
    fn test_no_duplicates() {
        let report = build_report("empty.csv", &[]);
        assert_eq!(report.total_records, 0);
        assert_eq!(report.duplicate_percentage, 0.0);
        assert!(report.duplicate_details.is_empty());
        assert!(report.raw_output.starts_with("No duplicate entries found"));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        assert!(detect_duplicates(&dir.path().join("missing.csv")).is_err());
    }
}
