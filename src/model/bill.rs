//! Bills issued to residents, together with their disputes and payment proofs.

use super::core::{
    validate_bill_type, validate_dispute_kind, validate_not_blank, validate_payment_method,
    validate_proof_type, BillStatus, BillType, DisputeKind, DisputeStatus, Role, ServiceError,
    DEFAULT_CURRENCY,
};
use super::user::User;
use anyhow::Ok as AnyOk;
use chrono::{DateTime, Utc};
use log::{debug, info};
use poem_openapi::Object;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

/// Share of the amount charged once when a bill becomes overdue.
pub const LATE_FEE_RATE: f64 = 0.05;

const MILLIS_PER_DAY: f64 = 24.0 * 60.0 * 60.0 * 1000.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Object, sqlx::FromRow)]
pub struct Bill {
    #[oai(read_only)]
    pub id: Uuid,
    pub resident_id: Uuid,
    pub bill_type: String,
    pub amount: f64,
    pub currency: String,
    pub due_date: DateTime<Utc>,
    pub status: String,
    pub description: String,
    #[oai(skip_serializing_if_is_none)]
    pub period_start: Option<DateTime<Utc>>,
    #[oai(skip_serializing_if_is_none)]
    pub period_end: Option<DateTime<Utc>>,
    #[oai(skip_serializing_if_is_none)]
    pub payment_method: Option<String>,
    #[oai(skip_serializing_if_is_none)]
    pub transaction_id: Option<String>,
    #[oai(skip_serializing_if_is_none)]
    pub paid_at: Option<DateTime<Utc>>,
    #[oai(skip_serializing_if_is_none)]
    pub paid_amount: Option<f64>,
    pub late_fee_amount: f64,
    #[oai(skip_serializing_if_is_none)]
    pub late_fee_applied_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    #[oai(skip_serializing_if_is_none)]
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Object, sqlx::FromRow)]
pub struct BillDispute {
    pub id: Uuid,
    pub bill_id: Uuid,
    pub reason: String,
    pub description: String,
    /// Payment details the resident attached to the dispute.
    #[oai(skip_serializing_if_is_none)]
    pub evidence: Option<serde_json::Value>,
    pub raised_by: Uuid,
    pub raised_at: DateTime<Utc>,
    pub status: String,
    #[oai(skip_serializing_if_is_none)]
    pub resolution: Option<String>,
    #[oai(skip_serializing_if_is_none)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[oai(skip_serializing_if_is_none)]
    pub resolved_by: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Object, sqlx::FromRow)]
pub struct BillProof {
    pub id: Uuid,
    pub bill_id: Uuid,
    #[oai(skip_serializing_if_is_none)]
    pub proof_type: Option<String>,
    #[oai(skip_serializing_if_is_none)]
    pub url: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Object)]
pub struct BillDetail {
    #[oai(flatten)]
    #[serde(flatten)]
    pub bill: Bill,
    pub disputes: Vec<BillDispute>,
    pub proofs: Vec<BillProof>,
    pub is_overdue: bool,
    pub days_until_due: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct BillActionResponse {
    pub message: String,
    pub bill: BillDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object, Validate)]
pub struct NewBill {
    pub resident_id: Uuid,

    #[validate(custom = "validate_bill_type")]
    pub bill_type: String,

    #[validate(range(min = 0.0, message = "Amount cannot be negative"))]
    pub amount: f64,

    #[validate(length(min = 1, max = 8, message = "Currency must be between 1 and 8 characters"))]
    pub currency: Option<String>,

    pub due_date: DateTime<Utc>,

    #[validate(custom = "validate_not_blank")]
    pub description: String,

    pub period_start: Option<DateTime<Utc>>,

    pub period_end: Option<DateTime<Utc>>,

    pub tags: Option<Vec<String>>,

    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object, Validate)]
pub struct DisputeRequest {
    /// already-paid, paid-twice or wrong-split.
    #[oai(rename = "type")]
    #[serde(rename = "type")]
    #[validate(custom = "validate_dispute_kind")]
    pub kind: String,

    #[validate(custom = "validate_not_blank")]
    pub description: String,

    pub transaction_id: Option<String>,

    pub payment_date: Option<String>,

    pub payment_method: Option<String>,

    pub double_payment_details: Option<serde_json::Value>,

    pub wrong_split_details: Option<serde_json::Value>,
}

impl DisputeRequest {
    /// The optional payment details, `None` when the resident didn't attach any.
    pub fn evidence(&self) -> Option<serde_json::Value> {
        let mut evidence = serde_json::Map::new();
        if let Some(v) = &self.transaction_id {
            evidence.insert("transaction_id".to_string(), json!(v));
        }
        if let Some(v) = &self.payment_date {
            evidence.insert("payment_date".to_string(), json!(v));
        }
        if let Some(v) = &self.payment_method {
            evidence.insert("payment_method".to_string(), json!(v));
        }
        if let Some(v) = &self.double_payment_details {
            evidence.insert("double_payment_details".to_string(), v.clone());
        }
        if let Some(v) = &self.wrong_split_details {
            evidence.insert("wrong_split_details".to_string(), v.clone());
        }

        if evidence.is_empty() {
            None
        } else {
            Some(serde_json::Value::Object(evidence))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Object, Validate)]
pub struct ProofRequest {
    #[validate(custom = "validate_proof_type")]
    pub proof_type: Option<String>,

    #[validate(custom = "validate_not_blank")]
    pub proof_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object, Validate)]
pub struct PaymentRequest {
    #[validate(custom = "validate_payment_method")]
    pub payment_method: String,

    #[validate(custom = "validate_not_blank")]
    pub transaction_id: String,

    #[validate(range(min = 0.0, message = "Paid amount cannot be negative"))]
    pub paid_amount: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object, Validate)]
pub struct ResolveDisputeRequest {
    #[validate(custom = "validate_not_blank")]
    pub resolution: String,

    /// resolved (default) or rejected.
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct OverdueReport {
    pub updated: u64,
    pub bills: Vec<Bill>,
}

/// A bill is overdue while it is still pending after its due date.
pub fn is_overdue(status: &str, due_date: &DateTime<Utc>, now: &DateTime<Utc>) -> bool {
    status == BillStatus::Pending.as_str() && now > due_date
}

/// Whole days left until the due date, rounded up. Negative once the bill is late.
pub fn days_until_due(due_date: &DateTime<Utc>, now: &DateTime<Utc>) -> i64 {
    let millis = (*due_date - *now).num_milliseconds() as f64;
    (millis / MILLIS_PER_DAY).ceil() as i64
}

pub fn late_fee(amount: f64) -> f64 {
    amount * LATE_FEE_RATE
}

fn check_payload<T: Validate>(payload: &T, what: &str) -> Result<(), anyhow::Error> {
    match payload.validate() {
        Ok(_) => Ok(()),
        Err(e) => Err(ServiceError::bad_request(&format!("Invalid {}: {}", what, e))),
    }
}

impl Bill {
    pub fn into_detail(
        self,
        disputes: Vec<BillDispute>,
        proofs: Vec<BillProof>,
        now: &DateTime<Utc>,
    ) -> BillDetail {
        BillDetail {
            is_overdue: is_overdue(&self.status, &self.due_date, now),
            days_until_due: days_until_due(&self.due_date, now),
            bill: self,
            disputes,
            proofs,
        }
    }

    /// Loads the disputes and proofs of all bills in two queries.
    pub async fn with_details(
        pool: &sqlx::PgPool,
        bills: Vec<Bill>,
    ) -> Result<Vec<BillDetail>, anyhow::Error> {
        let ids = bills.iter().map(|b| b.id).collect::<Vec<Uuid>>();
        if ids.is_empty() {
            return AnyOk(vec![]);
        }

        let disputes = sqlx::query_as::<_, BillDispute>(
            "SELECT * FROM societyhub_bill_dispute WHERE bill_id = ANY($1) ORDER BY raised_at",
        )
        .bind(&ids)
        .fetch_all(pool)
        .await?;

        let proofs = sqlx::query_as::<_, BillProof>(
            "SELECT * FROM societyhub_bill_proof WHERE bill_id = ANY($1) ORDER BY uploaded_at",
        )
        .bind(&ids)
        .fetch_all(pool)
        .await?;

        let mut disputes_by_bill: HashMap<Uuid, Vec<BillDispute>> = HashMap::new();
        for dispute in disputes {
            disputes_by_bill.entry(dispute.bill_id).or_default().push(dispute);
        }
        let mut proofs_by_bill: HashMap<Uuid, Vec<BillProof>> = HashMap::new();
        for proof in proofs {
            proofs_by_bill.entry(proof.bill_id).or_default().push(proof);
        }

        let now = Utc::now();
        let details = bills
            .into_iter()
            .map(|bill| {
                let disputes = disputes_by_bill.remove(&bill.id).unwrap_or_default();
                let proofs = proofs_by_bill.remove(&bill.id).unwrap_or_default();
                bill.into_detail(disputes, proofs, &now)
            })
            .collect();

        AnyOk(details)
    }

    /// All bills of a resident, newest first.
    pub async fn get_records_by_resident(
        pool: &sqlx::PgPool,
        resident_id: &Uuid,
    ) -> Result<Vec<BillDetail>, anyhow::Error> {
        let bills = sqlx::query_as::<_, Bill>(
            "SELECT * FROM societyhub_bill WHERE resident_id = $1 ORDER BY created_at DESC",
        )
        .bind(resident_id)
        .fetch_all(pool)
        .await?;

        Bill::with_details(pool, bills).await
    }

    /// The bill when it belongs to the resident, a not found error otherwise.
    pub async fn get_owned(
        pool: &sqlx::PgPool,
        id: &Uuid,
        resident_id: &Uuid,
    ) -> Result<Bill, anyhow::Error> {
        let bill = sqlx::query_as::<_, Bill>(
            "SELECT * FROM societyhub_bill WHERE id = $1 AND resident_id = $2",
        )
        .bind(id)
        .bind(resident_id)
        .fetch_optional(pool)
        .await?;

        match bill {
            Some(bill) => AnyOk(bill),
            None => Err(ServiceError::not_found("Bill not found")),
        }
    }

    pub async fn get_detail(pool: &sqlx::PgPool, bill: Bill) -> Result<BillDetail, anyhow::Error> {
        let mut details = Bill::with_details(pool, vec![bill]).await?;
        match details.pop() {
            Some(detail) => AnyOk(detail),
            None => Err(ServiceError::not_found("Bill not found")),
        }
    }

    pub async fn get_owned_detail(
        pool: &sqlx::PgPool,
        id: &Uuid,
        resident_id: &Uuid,
    ) -> Result<BillDetail, anyhow::Error> {
        let bill = Bill::get_owned(pool, id, resident_id).await?;
        Bill::get_detail(pool, bill).await
    }

    /// Issues a new bill to a resident.
    pub async fn create(pool: &sqlx::PgPool, new_bill: &NewBill) -> Result<BillDetail, anyhow::Error> {
        check_payload(new_bill, "bill")?;

        let resident = match User::get_by_id(pool, &new_bill.resident_id).await? {
            Some(user) => user,
            None => return Err(ServiceError::not_found("Resident not found")),
        };
        if resident.role() != Some(Role::Resident) {
            return Err(ServiceError::bad_request("Bills can only be issued to residents"));
        }

        let bill_type = BillType::from_str(&new_bill.bill_type)?;
        let bill = sqlx::query_as::<_, Bill>(
            "INSERT INTO societyhub_bill (id, resident_id, bill_type, amount, currency, due_date, status, description, period_start, period_end, tags, notes) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(resident.id)
        .bind(bill_type.as_str())
        .bind(new_bill.amount)
        .bind(new_bill.currency.clone().unwrap_or(DEFAULT_CURRENCY.to_string()))
        .bind(new_bill.due_date)
        .bind(BillStatus::Pending.as_str())
        .bind(new_bill.description.trim())
        .bind(new_bill.period_start)
        .bind(new_bill.period_end)
        .bind(new_bill.tags.clone().unwrap_or_default())
        .bind(&new_bill.notes)
        .fetch_one(pool)
        .await?;

        info!("Issued {} bill {} to {}.", bill.bill_type, bill.id, resident.email);
        Bill::get_detail(pool, bill).await
    }

    /// Appends a pending dispute and marks the bill as disputed.
    pub async fn raise_dispute(
        pool: &sqlx::PgPool,
        id: &Uuid,
        resident_id: &Uuid,
        request: &DisputeRequest,
    ) -> Result<BillDetail, anyhow::Error> {
        check_payload(request, "dispute")?;
        let kind = DisputeKind::from_str(&request.kind)?;
        let bill = Bill::get_owned(pool, id, resident_id).await?;

        let mut tx = pool.begin().await?;
        sqlx::query(
            "INSERT INTO societyhub_bill_dispute (id, bill_id, reason, description, evidence, raised_by, status) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(Uuid::new_v4())
        .bind(bill.id)
        .bind(kind.reason())
        .bind(request.description.trim())
        .bind(request.evidence())
        .bind(resident_id)
        .bind(DisputeStatus::Pending.as_str())
        .execute(&mut tx)
        .await?;

        let bill = sqlx::query_as::<_, Bill>(
            "UPDATE societyhub_bill SET status = $1, updated_at = NOW() WHERE id = $2 RETURNING *",
        )
        .bind(BillStatus::Disputed.as_str())
        .bind(bill.id)
        .fetch_one(&mut tx)
        .await?;
        tx.commit().await?;

        debug!("Dispute ({}) raised on bill {}.", kind.reason(), bill.id);
        Bill::get_detail(pool, bill).await
    }

    pub async fn add_proof(
        pool: &sqlx::PgPool,
        id: &Uuid,
        resident_id: &Uuid,
        request: &ProofRequest,
    ) -> Result<BillDetail, anyhow::Error> {
        check_payload(request, "payment proof")?;
        let bill = Bill::get_owned(pool, id, resident_id).await?;

        sqlx::query(
            "INSERT INTO societyhub_bill_proof (id, bill_id, proof_type, url) VALUES ($1, $2, $3, $4)",
        )
        .bind(Uuid::new_v4())
        .bind(bill.id)
        .bind(&request.proof_type)
        .bind(request.proof_url.trim())
        .execute(pool)
        .await?;

        Bill::get_detail(pool, bill).await
    }

    /// Records the payment. The paid amount defaults to the amount of the bill.
    pub async fn pay(
        pool: &sqlx::PgPool,
        id: &Uuid,
        resident_id: &Uuid,
        request: &PaymentRequest,
    ) -> Result<BillDetail, anyhow::Error> {
        check_payload(request, "payment")?;
        let bill = Bill::get_owned(pool, id, resident_id).await?;

        let bill = sqlx::query_as::<_, Bill>(
            "UPDATE societyhub_bill SET status = $1, payment_method = $2, transaction_id = $3, paid_amount = $4, paid_at = NOW(), updated_at = NOW() WHERE id = $5 RETURNING *",
        )
        .bind(BillStatus::Paid.as_str())
        .bind(&request.payment_method)
        .bind(request.transaction_id.trim())
        .bind(request.paid_amount.unwrap_or(bill.amount))
        .bind(bill.id)
        .fetch_one(pool)
        .await?;

        info!("Bill {} paid with {}.", bill.id, request.payment_method);
        Bill::get_detail(pool, bill).await
    }

    /// Closes a dispute. The bill goes back to pending once no dispute is left open.
    pub async fn resolve_dispute(
        pool: &sqlx::PgPool,
        id: &Uuid,
        dispute_id: &Uuid,
        resolved_by: &Uuid,
        request: &ResolveDisputeRequest,
    ) -> Result<BillDetail, anyhow::Error> {
        check_payload(request, "resolution")?;
        let status = match &request.status {
            Some(s) => DisputeStatus::from_str(s)
                .map_err(|e| ServiceError::bad_request(&e.to_string()))?,
            None => DisputeStatus::Resolved,
        };
        if status == DisputeStatus::Pending {
            return Err(ServiceError::bad_request(
                "A dispute can only be resolved or rejected",
            ));
        }

        let mut tx = pool.begin().await?;
        let dispute = sqlx::query_as::<_, BillDispute>(
            "SELECT * FROM societyhub_bill_dispute WHERE id = $1 AND bill_id = $2 FOR UPDATE",
        )
        .bind(dispute_id)
        .bind(id)
        .fetch_optional(&mut tx)
        .await?;

        match dispute {
            None => return Err(ServiceError::not_found("Dispute not found")),
            Some(d) if d.status != DisputeStatus::Pending.as_str() => {
                return Err(ServiceError::bad_request("Dispute is already closed"))
            }
            Some(_) => {}
        }

        sqlx::query(
            "UPDATE societyhub_bill_dispute SET status = $1, resolution = $2, resolved_at = NOW(), resolved_by = $3 WHERE id = $4",
        )
        .bind(status.as_str())
        .bind(request.resolution.trim())
        .bind(resolved_by)
        .bind(dispute_id)
        .execute(&mut tx)
        .await?;

        let open = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM societyhub_bill_dispute WHERE bill_id = $1 AND status = $2",
        )
        .bind(id)
        .bind(DisputeStatus::Pending.as_str())
        .fetch_one(&mut tx)
        .await?;

        let bill = if open == 0 {
            sqlx::query_as::<_, Bill>(
                "UPDATE societyhub_bill SET status = $1, updated_at = NOW() WHERE id = $2 AND status = $3 RETURNING *",
            )
            .bind(BillStatus::Pending.as_str())
            .bind(id)
            .bind(BillStatus::Disputed.as_str())
            .fetch_optional(&mut tx)
            .await?
        } else {
            None
        };

        let bill = match bill {
            Some(bill) => bill,
            None => {
                sqlx::query_as::<_, Bill>("SELECT * FROM societyhub_bill WHERE id = $1")
                    .bind(id)
                    .fetch_one(&mut tx)
                    .await?
            }
        };
        tx.commit().await?;

        Bill::get_detail(pool, bill).await
    }

    /// Moves every pending bill past its due date to overdue. The late fee is only charged the first time.
    pub async fn mark_overdue(pool: &sqlx::PgPool) -> Result<OverdueReport, anyhow::Error> {
        let bills = sqlx::query_as::<_, Bill>(
            "UPDATE societyhub_bill SET status = $1, late_fee_amount = CASE WHEN late_fee_applied_at IS NULL THEN amount * $2 ELSE late_fee_amount END, late_fee_applied_at = COALESCE(late_fee_applied_at, NOW()), updated_at = NOW() WHERE status = $3 AND due_date < NOW() RETURNING *",
        )
        .bind(BillStatus::Overdue.as_str())
        .bind(LATE_FEE_RATE)
        .bind(BillStatus::Pending.as_str())
        .fetch_all(pool)
        .await?;

        info!("{} bills are now overdue.", bills.len());
        AnyOk(OverdueReport {
            updated: bills.len() as u64,
            bills,
        })
    }

    /// Bills of a resident which still have to be paid, earliest due date first.
    pub async fn get_unpaid_by_resident(
        pool: &sqlx::PgPool,
        resident_id: &Uuid,
    ) -> Result<Vec<Bill>, anyhow::Error> {
        let bills = sqlx::query_as::<_, Bill>(
            "SELECT * FROM societyhub_bill WHERE resident_id = $1 AND status = ANY($2) ORDER BY due_date",
        )
        .bind(resident_id)
        .bind(vec![
            BillStatus::Pending.to_string(),
            BillStatus::Overdue.to_string(),
        ])
        .fetch_all(pool)
        .await?;

        AnyOk(bills)
    }

    /// Disputed bills of a resident which were paid twice, or whose dispute mentions a duplicate or double charge.
    pub async fn get_duplicate_disputed_by_resident(
        pool: &sqlx::PgPool,
        resident_id: &Uuid,
    ) -> Result<Vec<Bill>, anyhow::Error> {
        let bills = sqlx::query_as::<_, Bill>(
            "SELECT b.* FROM societyhub_bill b WHERE b.resident_id = $1 AND b.status = $2 AND EXISTS (SELECT 1 FROM societyhub_bill_dispute d WHERE d.bill_id = b.id AND (d.reason = $3 OR d.reason ~* 'duplicate|double' OR d.description ~* 'duplicate|double')) ORDER BY b.created_at DESC",
        )
        .bind(resident_id)
        .bind(BillStatus::Disputed.as_str())
        .bind(DisputeKind::PaidTwice.reason())
        .fetch_all(pool)
        .await?;

        AnyOk(bills)
    }
}
