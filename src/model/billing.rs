//! Billing insights for admins: duplicate bills raised through resident complaints, plus the anomaly and recommendation catalog produced by the last offline analysis.

use super::core::{BillType, DisputeStatus, DUPLICATE_REGEX};
use super::util::{format_date, round_to};
use anyhow::Ok as AnyOk;
use chrono::{DateTime, Utc};
use poem_openapi::Object;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Bill count of the baseline analysis, used as the denominator of the dispute rate.
pub const BASELINE_TOTAL_BILLS: u64 = 50;
pub const AVERAGE_RESOLUTION_TIME: &str = "3.2 days";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Object)]
#[oai(rename_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub struct DuplicateBill {
    pub id: u64,
    pub resident_name: String,
    pub bill_ids: Vec<String>,
    pub amount: f64,
    pub status: String,
    pub date: String,
    pub comments: String,
    pub duplicate_type: String,
    pub ai_analysis: String,
    pub recommended_action: String,
    pub severity: String,
    #[oai(skip_serializing_if_is_none)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispute_id: Option<Uuid>,
    #[oai(skip_serializing_if_is_none)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resident_email: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Object)]
#[oai(rename_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub struct BillingAnomaly {
    pub id: u64,
    #[oai(rename = "type")]
    #[serde(rename = "type")]
    pub kind: String,
    pub resident_name: String,
    #[oai(skip_serializing_if_is_none)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bill_id: Option<String>,
    #[oai(skip_serializing_if_is_none)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[oai(skip_serializing_if_is_none)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_range: Option<String>,
    #[oai(skip_serializing_if_is_none)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispute_count: Option<u64>,
    #[oai(skip_serializing_if_is_none)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bills: Option<u64>,
    #[oai(skip_serializing_if_is_none)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispute_rate: Option<String>,
    #[oai(skip_serializing_if_is_none)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    pub ai_analysis: String,
    pub recommended_action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Object)]
#[oai(rename_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub id: u64,
    pub category: String,
    pub title: String,
    pub description: String,
    pub priority: String,
    pub estimated_impact: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Object)]
#[oai(rename_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub struct BillingSummary {
    pub total_bills: u64,
    pub duplicate_bills: u64,
    pub duplicate_amount: f64,
    pub potential_savings: f64,
    pub dispute_rate: String,
    pub average_resolution_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Object)]
#[oai(rename_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub struct BillingAnalysis {
    pub duplicate_bills: Vec<DuplicateBill>,
    pub billing_anomalies: Vec<BillingAnomaly>,
    pub ai_recommendations: Vec<Recommendation>,
    pub summary: BillingSummary,
    /// The report of the billing agent, only present after a run.
    #[oai(skip_serializing_if_is_none)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_analysis: Option<serde_json::Value>,
    #[oai(skip_serializing_if_is_none)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct AnalysisResponse {
    pub success: bool,
    #[oai(skip_serializing_if_is_none)]
    pub message: Option<String>,
    pub data: BillingAnalysis,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct DuplicateList {
    pub success: bool,
    pub data: Vec<DuplicateBill>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct AnomalyList {
    pub success: bool,
    pub data: Vec<BillingAnomaly>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct RecommendationList {
    pub success: bool,
    pub data: Vec<Recommendation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[oai(rename_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub struct ResolveDuplicateRequest {
    pub action: String,
    pub bill_id_to_remove: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[oai(rename_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub struct ResolvedDuplicate {
    pub duplicate_id: u64,
    pub action: String,
    #[oai(skip_serializing_if_is_none)]
    pub bill_id_to_remove: Option<String>,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct ResolveDuplicateResponse {
    pub success: bool,
    pub message: String,
    pub data: ResolvedDuplicate,
}

/// A maintenance bill with an open dispute that mentions a duplicate or double payment.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ComplaintRow {
    pub bill_id: Uuid,
    pub amount: f64,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub resident_name: String,
    pub resident_email: String,
    pub dispute_id: Uuid,
    pub dispute_reason: String,
    pub dispute_description: String,
}

impl ComplaintRow {
    pub fn is_duplicate_complaint(&self) -> bool {
        DUPLICATE_REGEX.is_match(&self.dispute_reason)
            || DUPLICATE_REGEX.is_match(&self.dispute_description)
    }
}

fn duplicate(
    id: u64,
    resident_name: &str,
    bill_ids: &[&str],
    amount: f64,
    status: &str,
    date: &str,
    comments: &str,
    duplicate_type: &str,
    ai_analysis: &str,
    recommended_action: &str,
    severity: &str,
) -> DuplicateBill {
    DuplicateBill {
        id,
        resident_name: resident_name.to_string(),
        bill_ids: bill_ids.iter().map(|b| b.to_string()).collect(),
        amount,
        status: status.to_string(),
        date: date.to_string(),
        comments: comments.to_string(),
        duplicate_type: duplicate_type.to_string(),
        ai_analysis: ai_analysis.to_string(),
        recommended_action: recommended_action.to_string(),
        severity: severity.to_string(),
        dispute_id: None,
        resident_email: None,
    }
}

/// Duplicates found by the baseline analysis of the billing export.
pub fn known_duplicates() -> Vec<DuplicateBill> {
    vec![
        duplicate(
            1,
            "Neha Patel",
            &["BILL099", "BILL089"],
            2000.0,
            "Paid",
            "2025-07-11",
            "",
            "exact_match",
            "Identical bills found for same resident, amount, and date",
            "Remove duplicate BILL089",
            "high",
        ),
        duplicate(
            2,
            "Raj Verma",
            &["BILL002", "BILL014", "BILL022", "BILL028"],
            1200.0,
            "Disputed",
            "2025-07-16",
            "Dispute over water charges",
            "similar_pattern",
            "Multiple disputed bills with same amount and comments pattern",
            "Investigate billing accuracy for water charges",
            "medium",
        ),
        duplicate(
            3,
            "Sneha Rao",
            &["BILL007", "BILL029"],
            1200.0,
            "Paid",
            "2025-07-16",
            "",
            "exact_match",
            "Identical bills found for same resident and date",
            "Verify if both payments were actually made",
            "medium",
        ),
    ]
}

pub fn known_anomalies() -> Vec<BillingAnomaly> {
    vec![
        BillingAnomaly {
            id: 1,
            kind: "unusual_amount".to_string(),
            resident_name: "Vikram Iyer".to_string(),
            bill_id: Some("BILL010".to_string()),
            amount: Some(1500.0),
            expected_range: Some("1800-2000".to_string()),
            ai_analysis: "Amount significantly lower than typical maintenance charges".to_string(),
            recommended_action: "Review billing calculation".to_string(),
            ..Default::default()
        },
        BillingAnomaly {
            id: 2,
            kind: "frequent_disputes".to_string(),
            resident_name: "Raj Verma".to_string(),
            dispute_count: Some(4),
            total_bills: Some(8),
            dispute_rate: Some("50%".to_string()),
            ai_analysis: "Unusually high dispute rate indicates potential billing issues".to_string(),
            recommended_action: "Audit billing process for this resident".to_string(),
            ..Default::default()
        },
        BillingAnomaly {
            id: 3,
            kind: "payment_pattern".to_string(),
            resident_name: "Pooja Nair".to_string(),
            pattern: Some("Consistent late payments".to_string()),
            ai_analysis: "Resident shows pattern of delayed payments".to_string(),
            recommended_action: "Implement payment reminders".to_string(),
            ..Default::default()
        },
    ]
}

pub fn known_recommendations() -> Vec<Recommendation> {
    [
        (
            "billing_optimization",
            "Implement Automated Duplicate Detection",
            "Set up real-time duplicate detection to prevent future billing errors",
            "high",
            "Reduce billing errors by 85%",
        ),
        (
            "process_improvement",
            "Standardize Billing Comments",
            "Create standardized comment templates to reduce ambiguity",
            "medium",
            "Improve billing accuracy by 60%",
        ),
        (
            "customer_service",
            "Proactive Dispute Resolution",
            "Implement early warning system for potential disputes",
            "medium",
            "Reduce dispute rate by 40%",
        ),
    ]
    .iter()
    .enumerate()
    .map(|(i, (category, title, description, priority, impact))| Recommendation {
        id: i as u64 + 1,
        category: category.to_string(),
        title: title.to_string(),
        description: description.to_string(),
        priority: priority.to_string(),
        estimated_impact: impact.to_string(),
    })
    .collect()
}

pub fn find_known_duplicate(id: u64) -> Option<DuplicateBill> {
    known_duplicates().into_iter().find(|d| d.id == id)
}

/// Numbers the complaints in the order they were billed.
pub fn complaint_duplicates(rows: &[ComplaintRow]) -> Vec<DuplicateBill> {
    rows.iter()
        .filter(|row| row.is_duplicate_complaint())
        .enumerate()
        .map(|(i, row)| DuplicateBill {
            id: i as u64 + 1,
            resident_name: row.resident_name.clone(),
            bill_ids: vec![row.bill_id.to_string()],
            amount: row.amount,
            status: row.status.clone(),
            date: format_date(&row.created_at),
            comments: row.dispute_description.clone(),
            duplicate_type: "resident_complaint".to_string(),
            ai_analysis: format!(
                "Resident {} reported duplicate/double maintenance payment",
                row.resident_name
            ),
            recommended_action: "Investigate and resolve the duplicate payment complaint"
                .to_string(),
            severity: "high".to_string(),
            dispute_id: Some(row.dispute_id),
            resident_email: Some(row.resident_email.clone()),
        })
        .collect()
}

pub fn summarize(duplicates: &[DuplicateBill]) -> BillingSummary {
    let amount = duplicates.iter().map(|d| d.amount).sum::<f64>();
    let rate = duplicates.len() as f64 / BASELINE_TOTAL_BILLS as f64 * 100.0;
    BillingSummary {
        total_bills: BASELINE_TOTAL_BILLS,
        duplicate_bills: duplicates.len() as u64,
        duplicate_amount: amount,
        potential_savings: amount,
        dispute_rate: format!("{:.1}%", round_to(rate, 1)),
        average_resolution_time: AVERAGE_RESOLUTION_TIME.to_string(),
    }
}

impl BillingAnalysis {
    pub fn new(duplicates: Vec<DuplicateBill>) -> Self {
        BillingAnalysis {
            summary: summarize(&duplicates),
            duplicate_bills: duplicates,
            billing_anomalies: known_anomalies(),
            ai_recommendations: known_recommendations(),
            agent_analysis: None,
            last_updated: None,
        }
    }

    pub fn with_agent_analysis(mut self, report: serde_json::Value, now: DateTime<Utc>) -> Self {
        self.agent_analysis = Some(report);
        self.last_updated = Some(now);
        self
    }

    /// Reads the open duplicate complaints from the database.
    pub async fn from_complaints(pool: &sqlx::PgPool) -> Result<BillingAnalysis, anyhow::Error> {
        let mut rows = sqlx::query_as::<_, ComplaintRow>(
            "SELECT DISTINCT ON (b.id) b.id AS bill_id, b.amount, b.status, b.created_at, u.name AS resident_name, u.email AS resident_email, d.id AS dispute_id, d.reason AS dispute_reason, d.description AS dispute_description FROM societyhub_bill b JOIN societyhub_user u ON u.id = b.resident_id JOIN societyhub_bill_dispute d ON d.bill_id = b.id WHERE b.bill_type = $1 AND d.status = $2 AND (d.reason ~* 'duplicate|double' OR d.description ~* 'duplicate|double') ORDER BY b.id, d.raised_at",
        )
        .bind(BillType::Maintenance.as_str())
        .bind(DisputeStatus::Pending.as_str())
        .fetch_all(pool)
        .await?;

        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        AnyOk(BillingAnalysis::new(complaint_duplicates(&rows)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(name: &str, amount: f64, reason: &str, description: &str) -> ComplaintRow {
        ComplaintRow {
            bill_id: Uuid::new_v4(),
            amount,
            status: "disputed".to_string(),
            created_at: Utc.with_ymd_and_hms(2025, 7, 16, 9, 0, 0).unwrap(),
            resident_name: name.to_string(),
            resident_email: format!("{}@example.com", name.to_lowercase().replace(' ', ".")),
            dispute_id: Uuid::new_v4(),
            dispute_reason: reason.to_string(),
            dispute_description: description.to_string(),
        }
    }

    #[test]
    fn test_known_catalog() {
        let duplicates = known_duplicates();
        assert_eq!(duplicates.len(), 3);
        assert_eq!(duplicates[1].bill_ids.len(), 4);
        assert_eq!(find_known_duplicate(3).unwrap().resident_name, "Sneha Rao");
        assert!(find_known_duplicate(4).is_none());
        assert!(find_known_duplicate(0).is_none());

        let anomalies = serde_json::to_value(known_anomalies()).unwrap();
        assert_eq!(anomalies[0]["expectedRange"], "1800-2000");
        assert_eq!(anomalies[1]["disputeRate"], "50%");
        assert!(anomalies[2].get("billId").is_none());

        assert_eq!(known_recommendations()[0].estimated_impact, "Reduce billing errors by 85%");
    }

    #[test]
    fn test_complaint_duplicates() {
        let rows = vec![
            row("Neha Patel", 2000.0, "Paid Twice", "I paid this twice, double charged"),
            row("Raj Verma", 1200.0, "Already Paid", "Paid by cheque last week"),
            row("Sneha Rao", 1800.0, "Duplicate bill", "Same bill issued again"),
        ];

        let duplicates = complaint_duplicates(&rows);
        assert_eq!(duplicates.len(), 2);
        assert_eq!(duplicates[0].id, 1);
        assert_eq!(duplicates[1].id, 2);
        assert_eq!(duplicates[0].date, "2025-07-16");
        assert_eq!(duplicates[0].comments, "I paid this twice, double charged");
        assert_eq!(
            duplicates[1].ai_analysis,
            "Resident Sneha Rao reported duplicate/double maintenance payment"
        );

        let summary = summarize(&duplicates);
        assert_eq!(summary.duplicate_bills, 2);
        assert_eq!(summary.duplicate_amount, 3800.0);
        assert_eq!(summary.potential_savings, 3800.0);
        assert_eq!(summary.dispute_rate, "4.0%");
        assert_eq!(summary.total_bills, 50);
    }

    #[test]
    fn test_analysis_wire_format() {
        let analysis = BillingAnalysis::new(vec![]);
        let value = serde_json::to_value(&analysis).unwrap();
        assert_eq!(value["summary"]["disputeRate"], "0.0%");
        assert_eq!(value["summary"]["averageResolutionTime"], "3.2 days");
        assert_eq!(value["billingAnomalies"].as_array().unwrap().len(), 3);
        assert!(value.get("agentAnalysis").is_none());

        let analysis = analysis.with_agent_analysis(serde_json::json!({"total_records": 3}), Utc::now());
        assert_eq!(analysis.agent_analysis.unwrap()["total_records"], 3);
        assert!(analysis.last_updated.is_some());
    }
}
