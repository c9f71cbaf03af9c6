//! Notifications are not stored. They are derived from the issues and bills of the user every time they are requested.

use super::bill::{days_until_due, Bill};
use super::core::{IssueStatus, Role};
use super::issue::Issue;
use super::user::{User, UserBrief};
use super::util::format_amount;
use anyhow::Ok as AnyOk;
use chrono::{DateTime, Utc};
use log::debug;
use poem_openapi::Object;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

pub const UNREAD: &str = "unread";

/// Bills due within this many days get a reminder.
const REMINDER_WINDOW_DAYS: i64 = 7;
const URGENT_REMINDER_DAYS: i64 = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Object)]
pub struct Notification {
    pub id: String,
    #[oai(rename = "type")]
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub priority: String,
    pub status: String,
    /// The issue or bill the notification is about.
    pub reference_id: String,
    #[oai(skip_serializing_if_is_none)]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct NotificationList {
    pub success: bool,
    pub notifications: Vec<Notification>,
    pub count: u64,
    pub unread_count: u64,
}

impl NotificationList {
    /// Newest first.
    pub fn new(mut notifications: Vec<Notification>) -> Self {
        notifications.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let unread_count = notifications.iter().filter(|n| n.status == UNREAD).count() as u64;
        NotificationList {
            success: true,
            count: notifications.len() as u64,
            unread_count,
            notifications,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[oai(rename_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub struct MarkReadRequest {
    pub notification_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct Acknowledgement {
    pub success: bool,
    pub message: String,
}

impl Acknowledgement {
    pub fn new(message: &str) -> Self {
        Acknowledgement {
            success: true,
            message: message.to_string(),
        }
    }
}

fn notification(
    id: String,
    kind: &str,
    title: String,
    message: String,
    timestamp: DateTime<Utc>,
    priority: &str,
    reference_id: String,
    details: Option<serde_json::Value>,
) -> Notification {
    Notification {
        id,
        kind: kind.to_string(),
        title,
        message,
        timestamp,
        priority: priority.to_string(),
        status: UNREAD.to_string(),
        reference_id,
        details,
    }
}

pub fn assignment_notice(issue: &Issue, technician: &UserBrief) -> Notification {
    notification(
        format!("assignment_{}", issue.id),
        "technician_assignment",
        format!("AI Assignment: {}", technician.name),
        format!(
            "{} has been assigned to your {} issue. They specialize in {} and charge ₹{}/hour.",
            technician.name,
            issue.category,
            technician.skills.join(", "),
            format_amount(technician.hourly_rate)
        ),
        issue.updated_at,
        &issue.priority,
        issue.id.to_string(),
        Some(json!({
            "technician": {
                "name": technician.name,
                "skills": technician.skills,
                "hourlyRate": technician.hourly_rate,
                "phone": technician.phone,
                "email": technician.email,
            },
            "issue": {
                "title": issue.title,
                "description": issue.description,
                "category": issue.category,
                "status": issue.status,
            }
        })),
    )
}

pub fn progress_notice(issue: &Issue) -> Notification {
    notification(
        format!("progress_{}", issue.id),
        "issue_update",
        "Issue Update".to_string(),
        format!("Your {} issue is now in progress.", issue.category),
        issue.updated_at,
        "medium",
        issue.id.to_string(),
        None,
    )
}

pub fn resolved_notice(issue: &Issue) -> Notification {
    notification(
        format!("resolved_{}", issue.id),
        "issue_update",
        "Issue Resolved".to_string(),
        format!("Your {} issue has been resolved successfully.", issue.category),
        issue.updated_at,
        "medium",
        issue.id.to_string(),
        None,
    )
}

/// A reminder for an unpaid bill due within a week, `None` for bills due later.
pub fn bill_reminder(bill: &Bill, now: &DateTime<Utc>) -> Option<Notification> {
    let days = days_until_due(&bill.due_date, now);
    if days > REMINDER_WINDOW_DAYS {
        return None;
    }

    Some(notification(
        format!("bill_{}", bill.id),
        "bill_reminder",
        "Bill Reminder".to_string(),
        format!(
            "Your {} bill of ₹{} is due in {} day{}. Please pay to avoid late fees.",
            bill.bill_type,
            format_amount(bill.amount),
            days,
            if days != 1 { "s" } else { "" }
        ),
        *now,
        if days <= URGENT_REMINDER_DAYS { "high" } else { "medium" },
        bill.id.to_string(),
        Some(json!({
            "bill": {
                "id": bill.id,
                "billType": bill.bill_type,
                "amount": bill.amount,
                "dueDate": bill.due_date,
                "status": bill.status,
            }
        })),
    ))
}

pub fn duplicate_alert(bill: &Bill) -> Notification {
    notification(
        format!("duplicate_{}", bill.id),
        "ai_analysis",
        "AI Duplicate Bill Alert".to_string(),
        format!(
            "AI analysis detected a potential duplicate {} bill of ₹{}. This has been flagged for review.",
            bill.bill_type,
            format_amount(bill.amount)
        ),
        bill.updated_at,
        "high",
        bill.id.to_string(),
        Some(json!({
            "aiAnalysis": {
                "type": "duplicate_detection",
                "confidence": "high",
                "billType": bill.bill_type,
                "amount": bill.amount,
            }
        })),
    )
}

pub fn security_alert(now: &DateTime<Utc>) -> Notification {
    notification(
        "security_1".to_string(),
        "security_alert",
        "Security Alert".to_string(),
        "Unusual activity detected in your building. Security team has been notified.".to_string(),
        *now,
        "urgent",
        "security_alert_1".to_string(),
        None,
    )
}

pub fn technician_notice(issue: &Issue, reporter: &UserBrief) -> Notification {
    notification(
        format!("tech_assignment_{}", issue.id),
        "technician_assignment",
        "New Assignment".to_string(),
        format!(
            "You have been assigned to a {} issue by {} ({}).",
            issue.category,
            reporter.name,
            reporter.flat_number.clone().unwrap_or_default()
        ),
        issue.updated_at,
        &issue.priority,
        issue.id.to_string(),
        Some(json!({
            "issue": {
                "title": issue.title,
                "description": issue.description,
                "category": issue.category,
                "priority": issue.priority,
                "status": issue.status,
                "resident": {
                    "name": reporter.name,
                    "flatNumber": reporter.flat_number,
                    "building": reporter.building,
                }
            }
        })),
    )
}

/// The notices a resident gets for their own issues.
pub fn issue_notices(issues: &[Issue], people: &HashMap<Uuid, UserBrief>) -> Vec<Notification> {
    let mut notifications = vec![];
    for issue in issues {
        if let Some(technician) = issue.assigned_to.and_then(|id| people.get(&id)) {
            notifications.push(assignment_notice(issue, technician));
        }
        if issue.status == IssueStatus::InProgress.as_str() {
            notifications.push(progress_notice(issue));
        }
        if issue.status == IssueStatus::Resolved.as_str() {
            notifications.push(resolved_notice(issue));
        }
    }
    notifications
}

async fn people_by_id(
    pool: &sqlx::PgPool,
    ids: Vec<Uuid>,
) -> Result<HashMap<Uuid, UserBrief>, anyhow::Error> {
    let people = UserBrief::get_by_ids(pool, &ids)
        .await?
        .into_iter()
        .map(|u| (u.id, u))
        .collect();
    AnyOk(people)
}

/// Derives the notifications of the user from the current state of their issues and bills.
pub async fn collect(pool: &sqlx::PgPool, user: &User) -> Result<NotificationList, anyhow::Error> {
    let now = Utc::now();
    let mut notifications = vec![];

    match user.role() {
        Some(Role::Resident) => {
            let issues = Issue::get_reported_by(pool, &user.id).await?;
            let people = people_by_id(pool, issues.iter().filter_map(|i| i.assigned_to).collect())
                .await?;
            notifications.extend(issue_notices(&issues, &people));

            for bill in Bill::get_unpaid_by_resident(pool, &user.id).await? {
                notifications.extend(bill_reminder(&bill, &now));
            }

            for bill in Bill::get_duplicate_disputed_by_resident(pool, &user.id).await? {
                notifications.push(duplicate_alert(&bill));
            }

            notifications.push(security_alert(&now));
        }
        Some(Role::Technician) => {
            let issues = Issue::get_active_assignments(pool, &user.id).await?;
            let people = people_by_id(pool, issues.iter().map(|i| i.reported_by).collect()).await?;
            for issue in &issues {
                if let Some(reporter) = people.get(&issue.reported_by) {
                    notifications.push(technician_notice(issue, reporter));
                }
            }
        }
        _ => {}
    }

    debug!("{} notifications for {}.", notifications.len(), user.email);
    AnyOk(NotificationList::new(notifications))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn bill(amount: f64, due_in: Duration, now: &DateTime<Utc>) -> Bill {
        Bill {
            id: Uuid::new_v4(),
            resident_id: Uuid::new_v4(),
            bill_type: "maintenance".to_string(),
            amount,
            currency: "INR".to_string(),
            due_date: *now + due_in,
            status: "pending".to_string(),
            description: "Monthly maintenance".to_string(),
            period_start: None,
            period_end: None,
            payment_method: None,
            transaction_id: None,
            paid_at: None,
            paid_amount: None,
            late_fee_amount: 0.0,
            late_fee_applied_at: None,
            tags: vec![],
            notes: None,
            created_at: *now,
            updated_at: *now,
        }
    }

    fn technician() -> UserBrief {
        UserBrief {
            id: Uuid::new_v4(),
            name: "Rajesh Kumar".to_string(),
            email: "rajesh.plumber@societyhub.com".to_string(),
            phone: "+91 98765 43210".to_string(),
            flat_number: None,
            building: None,
            skills: vec!["plumbing".to_string()],
            hourly_rate: 800.0,
            availability: "available".to_string(),
        }
    }

    fn issue(status: &str, assigned_to: Option<Uuid>) -> Issue {
        let now = Utc::now();
        Issue {
            id: Uuid::new_v4(),
            title: "Water leak in kitchen sink".to_string(),
            description: "Water is dripping under the kitchen sink.".to_string(),
            category: "plumbing".to_string(),
            priority: "high".to_string(),
            status: status.to_string(),
            reported_by: Uuid::new_v4(),
            assigned_to,
            location_flat_number: None,
            location_building: None,
            location_area: None,
            ai_category: None,
            ai_priority: None,
            ai_estimated_time: None,
            ai_confidence: None,
            estimated_completion: None,
            actual_completion: None,
            cost_estimated: None,
            cost_actual: None,
            cost_currency: "INR".to_string(),
            rating_score: None,
            rating_feedback: None,
            rating_submitted_at: None,
            tags: vec![],
            is_emergency: false,
            emergency_type: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_bill_reminder() {
        let now = Utc::now();
        let soon = bill_reminder(&bill(2000.0, Duration::days(1), &now), &now).unwrap();
        assert_eq!(
            soon.message,
            "Your maintenance bill of ₹2000 is due in 1 day. Please pay to avoid late fees."
        );
        assert_eq!(soon.priority, "high");
        assert!(soon.id.starts_with("bill_"));

        let later = bill_reminder(&bill(1200.0, Duration::days(5), &now), &now).unwrap();
        assert!(later.message.contains("due in 5 days"));
        assert_eq!(later.priority, "medium");

        assert!(bill_reminder(&bill(1200.0, Duration::days(10), &now), &now).is_none());

        let late = bill_reminder(&bill(1200.0, Duration::days(-2), &now), &now).unwrap();
        assert!(late.message.contains("due in -2 days"));
        assert_eq!(late.priority, "high");
    }

    #[test]
    fn test_issue_notices() {
        let plumber = technician();
        let people = HashMap::from([(plumber.id, plumber.clone())]);
        let issues = vec![
            issue("in-progress", Some(plumber.id)),
            issue("resolved", None),
            issue("pending", None),
        ];

        let notices = issue_notices(&issues, &people);
        assert_eq!(notices.len(), 3);
        assert_eq!(notices[0].title, "AI Assignment: Rajesh Kumar");
        assert_eq!(
            notices[0].message,
            "Rajesh Kumar has been assigned to your plumbing issue. They specialize in plumbing and charge ₹800/hour."
        );
        assert_eq!(notices[0].priority, "high");
        assert_eq!(notices[1].message, "Your plumbing issue is now in progress.");
        assert_eq!(notices[2].title, "Issue Resolved");
    }

    #[test]
    fn test_notification_list() {
        let now = Utc::now();
        let older = duplicate_alert(&bill(2000.0, Duration::days(3), &(now - Duration::days(2))));
        let newer = security_alert(&now);

        let list = NotificationList::new(vec![older, newer]);
        assert!(list.success);
        assert_eq!(list.count, 2);
        assert_eq!(list.unread_count, 2);
        assert_eq!(list.notifications[0].id, "security_1");
        assert_eq!(list.notifications[1].kind, "ai_analysis");
        assert_eq!(
            list.notifications[1].message,
            "AI analysis detected a potential duplicate maintenance bill of ₹2000. This has been flagged for review."
        );
    }

    #[test]
    fn test_technician_notice() {
        let mut reporter = technician();
        reporter.name = "Neha Patel".to_string();
        reporter.flat_number = Some("A-501".to_string());
        let notice = technician_notice(&issue("assigned", None), &reporter);
        assert_eq!(
            notice.message,
            "You have been assigned to a plumbing issue by Neha Patel (A-501)."
        );
        assert_eq!(notice.title, "New Assignment");
    }
}
