//! Maintenance issues reported by residents, with their timeline, photos and rating.

use super::core::{
    total_pages, validate_category, validate_emergency_type, validate_issue_status,
    validate_not_blank, validate_priority, IssueCategory, IssueStatus, Priority, Role,
    ServiceError, TimelineStatus, DEFAULT_CURRENCY,
};
use super::user::{User, UserBrief};
use super::util::age_days;
use crate::query_builder::sql_builder::{
    bind_query_as, bind_query_scalar, make_pagination_clause, ComposeQueryItem, QueryItem, Value,
};
use anyhow::Ok as AnyOk;
use chrono::{DateTime, Utc};
use log::{debug, info};
use poem_openapi::Object;
use serde::{Deserialize, Serialize};
use sqlx::{Postgres, Transaction};
use std::borrow::Cow;
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;
use validator::{Validate, ValidationError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Object, sqlx::FromRow)]
pub struct Issue {
    #[oai(read_only)]
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub category: String,
    pub priority: String,
    pub status: String,
    pub reported_by: Uuid,
    #[oai(skip_serializing_if_is_none)]
    pub assigned_to: Option<Uuid>,
    #[oai(skip_serializing_if_is_none)]
    pub location_flat_number: Option<String>,
    #[oai(skip_serializing_if_is_none)]
    pub location_building: Option<String>,
    #[oai(skip_serializing_if_is_none)]
    pub location_area: Option<String>,
    #[oai(skip_serializing_if_is_none)]
    pub ai_category: Option<String>,
    #[oai(skip_serializing_if_is_none)]
    pub ai_priority: Option<String>,
    #[oai(skip_serializing_if_is_none)]
    pub ai_estimated_time: Option<String>,
    #[oai(skip_serializing_if_is_none)]
    pub ai_confidence: Option<f64>,
    #[oai(skip_serializing_if_is_none)]
    pub estimated_completion: Option<DateTime<Utc>>,
    #[oai(skip_serializing_if_is_none)]
    pub actual_completion: Option<DateTime<Utc>>,
    #[oai(skip_serializing_if_is_none)]
    pub cost_estimated: Option<f64>,
    #[oai(skip_serializing_if_is_none)]
    pub cost_actual: Option<f64>,
    pub cost_currency: String,
    #[oai(skip_serializing_if_is_none)]
    pub rating_score: Option<i32>,
    #[oai(skip_serializing_if_is_none)]
    pub rating_feedback: Option<String>,
    #[oai(skip_serializing_if_is_none)]
    pub rating_submitted_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub is_emergency: bool,
    #[oai(skip_serializing_if_is_none)]
    pub emergency_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Object, sqlx::FromRow)]
pub struct TimelineEntry {
    pub id: Uuid,
    pub issue_id: Uuid,
    pub status: String,
    pub message: String,
    #[oai(skip_serializing_if_is_none)]
    pub updated_by: Option<Uuid>,
    #[oai(skip_serializing_if_is_none)]
    pub updated_by_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Object, sqlx::FromRow)]
pub struct IssuePhoto {
    pub id: Uuid,
    pub issue_id: Uuid,
    pub url: String,
    #[oai(skip_serializing_if_is_none)]
    pub caption: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

/// An issue with its reporter, assignee, timeline and photos.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Object)]
pub struct IssueDetail {
    #[oai(flatten)]
    #[serde(flatten)]
    pub issue: Issue,
    #[oai(skip_serializing_if_is_none)]
    pub reporter: Option<UserBrief>,
    #[oai(skip_serializing_if_is_none)]
    pub assignee: Option<UserBrief>,
    pub timeline: Vec<TimelineEntry>,
    pub photos: Vec<IssuePhoto>,
    pub age_days: i64,
    pub is_overdue: bool,
}

fn validate_title(value: &str) -> Result<(), ValidationError> {
    check_trimmed_length(value, 5, 100, "Title must be between 5 and 100 characters")
}

fn validate_description(value: &str) -> Result<(), ValidationError> {
    check_trimmed_length(value, 10, 1000, "Description must be between 10 and 1000 characters")
}

fn check_trimmed_length(
    value: &str,
    min: usize,
    max: usize,
    message: &'static str,
) -> Result<(), ValidationError> {
    let length = value.trim().chars().count();
    if length < min || length > max {
        let mut err = ValidationError::new("length");
        err.message = Some(Cow::Borrowed(message));
        return Err(err);
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, Object, Validate)]
pub struct AiSuggestions {
    #[validate(custom = "validate_category")]
    pub category: Option<String>,

    #[validate(custom = "validate_priority")]
    pub priority: Option<String>,

    pub estimated_time: Option<String>,

    #[validate(range(min = 0.0, max = 1.0))]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object, Validate)]
pub struct NewPhoto {
    #[validate(custom = "validate_not_blank")]
    pub url: String,

    pub caption: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object, Validate)]
pub struct NewIssue {
    #[validate(custom = "validate_title")]
    pub title: String,

    #[validate(custom = "validate_description")]
    pub description: String,

    #[validate(custom = "validate_category")]
    pub category: String,

    /// medium when it is not given.
    #[validate(custom = "validate_priority")]
    pub priority: Option<String>,

    /// Where inside the building, e.g. "Kitchen". Flat and building come from the reporter.
    pub area: Option<String>,

    #[validate]
    pub photos: Option<Vec<NewPhoto>>,

    pub is_emergency: Option<bool>,

    #[validate(custom = "validate_emergency_type")]
    pub emergency_type: Option<String>,

    #[validate]
    pub ai_suggestions: Option<AiSuggestions>,

    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object, Validate)]
pub struct CostInput {
    #[validate(range(min = 0.0))]
    pub estimated: Option<f64>,

    #[validate(range(min = 0.0))]
    pub actual: Option<f64>,

    #[validate(length(min = 1, max = 8, message = "Currency must be between 1 and 8 characters"))]
    pub currency: Option<String>,
}

/// Every field is optional, only the given ones are changed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Object, Validate)]
pub struct IssueUpdate {
    #[validate(custom = "validate_title")]
    pub title: Option<String>,

    #[validate(custom = "validate_description")]
    pub description: Option<String>,

    #[validate(custom = "validate_category")]
    pub category: Option<String>,

    #[validate(custom = "validate_priority")]
    pub priority: Option<String>,

    #[validate(custom = "validate_issue_status")]
    pub status: Option<String>,

    pub assigned_to: Option<Uuid>,

    pub estimated_completion: Option<DateTime<Utc>>,

    #[validate]
    pub cost: Option<CostInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object, Validate)]
pub struct RatingRequest {
    #[validate(range(min = 1, max = 5, message = "Rating must be between 1 and 5"))]
    pub score: i32,

    #[validate(length(max = 500, message = "Feedback cannot exceed 500 characters"))]
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Object)]
pub struct Rating {
    pub score: i32,
    #[oai(skip_serializing_if_is_none)]
    pub feedback: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueFilter {
    pub status: Option<String>,
    pub category: Option<String>,
    pub priority: Option<String>,
    pub assigned_to: Option<Uuid>,
    pub reported_by: Option<Uuid>,
}

impl IssueFilter {
    /// Residents only see what they reported, technicians only what they were assigned.
    pub fn to_query(&self, viewer: &User) -> Result<ComposeQueryItem, anyhow::Error> {
        let mut query = ComposeQueryItem::new("and");
        if let Some(status) = &self.status {
            let status = IssueStatus::from_str(status)
                .map_err(|e| ServiceError::bad_request(&e.to_string()))?;
            query.add_query_item(QueryItem::eq("status", Value::String(status.to_string()))?);
        }
        if let Some(category) = &self.category {
            let category = IssueCategory::from_str(category)
                .map_err(|e| ServiceError::bad_request(&e.to_string()))?;
            query.add_query_item(QueryItem::eq("category", Value::String(category.to_string()))?);
        }
        if let Some(priority) = &self.priority {
            let priority = Priority::from_str(priority)
                .map_err(|e| ServiceError::bad_request(&e.to_string()))?;
            query.add_query_item(QueryItem::eq("priority", Value::String(priority.to_string()))?);
        }

        let (reported_by, assigned_to) = match viewer.role() {
            Some(Role::Resident) => (Some(viewer.id), self.assigned_to),
            Some(Role::Technician) => (self.reported_by, Some(viewer.id)),
            _ => (self.reported_by, self.assigned_to),
        };
        if let Some(id) = reported_by {
            query.add_query_item(QueryItem::eq("reported_by", Value::Uuid(id))?);
        }
        if let Some(id) = assigned_to {
            query.add_query_item(QueryItem::eq("assigned_to", Value::Uuid(id))?);
        }

        AnyOk(query)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct IssuePage {
    pub issues: Vec<IssueDetail>,
    pub total_pages: u64,
    pub current_page: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Object, sqlx::FromRow)]
pub struct CountItem {
    pub key: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct IssueStats {
    pub status_stats: Vec<CountItem>,
    pub category_stats: Vec<CountItem>,
    pub priority_stats: Vec<CountItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Object)]
pub struct AssignmentAck {
    pub message: String,
    pub status: String,
}

fn check_payload<T: Validate>(payload: &T, what: &str) -> Result<(), anyhow::Error> {
    match payload.validate() {
        Ok(_) => Ok(()),
        Err(e) => Err(ServiceError::bad_request(&format!("Invalid {}: {}", what, e))),
    }
}

async fn add_timeline_entry(
    tx: &mut Transaction<'_, Postgres>,
    issue_id: &Uuid,
    status: TimelineStatus,
    message: &str,
    updated_by: &Uuid,
) -> Result<(), anyhow::Error> {
    sqlx::query(
        "INSERT INTO societyhub_issue_timeline (id, issue_id, status, message, updated_by) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(Uuid::new_v4())
    .bind(issue_id)
    .bind(status.as_str())
    .bind(message)
    .bind(updated_by)
    .execute(&mut *tx)
    .await?;

    AnyOk(())
}

async fn lock_issue(
    tx: &mut Transaction<'_, Postgres>,
    id: &Uuid,
) -> Result<Issue, anyhow::Error> {
    let issue = sqlx::query_as::<_, Issue>("SELECT * FROM societyhub_issue WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

    match issue {
        Some(issue) => AnyOk(issue),
        None => Err(ServiceError::not_found("Issue not found")),
    }
}

async fn save_issue(
    tx: &mut Transaction<'_, Postgres>,
    issue: &Issue,
) -> Result<Issue, anyhow::Error> {
    let issue = sqlx::query_as::<_, Issue>(
        "UPDATE societyhub_issue SET title = $1, description = $2, category = $3, priority = $4, status = $5, assigned_to = $6, estimated_completion = $7, actual_completion = $8, cost_estimated = $9, cost_actual = $10, cost_currency = $11, rating_score = $12, rating_feedback = $13, rating_submitted_at = $14, updated_at = NOW() WHERE id = $15 RETURNING *",
    )
    .bind(&issue.title)
    .bind(&issue.description)
    .bind(&issue.category)
    .bind(&issue.priority)
    .bind(&issue.status)
    .bind(issue.assigned_to)
    .bind(issue.estimated_completion)
    .bind(issue.actual_completion)
    .bind(issue.cost_estimated)
    .bind(issue.cost_actual)
    .bind(&issue.cost_currency)
    .bind(issue.rating_score)
    .bind(&issue.rating_feedback)
    .bind(issue.rating_submitted_at)
    .bind(issue.id)
    .fetch_one(&mut *tx)
    .await?;

    AnyOk(issue)
}

impl Issue {
    pub fn is_overdue(&self, now: &DateTime<Utc>) -> bool {
        let finished = IssueStatus::from_str(&self.status)
            .map(|s| s.is_finished())
            .unwrap_or(false);
        match &self.estimated_completion {
            Some(estimated) if !finished => now > estimated,
            _ => false,
        }
    }

    /// Residents may only touch the issues they reported.
    pub fn check_access(&self, user: &User) -> Result<(), anyhow::Error> {
        if user.role() == Some(Role::Resident) && self.reported_by != user.id {
            return Err(ServiceError::forbidden("Access denied"));
        }
        Ok(())
    }

    /// Applies the given changes and returns the timeline entries they produce.
    pub fn apply_update(
        &mut self,
        update: &IssueUpdate,
        now: &DateTime<Utc>,
    ) -> Result<Vec<(TimelineStatus, String)>, anyhow::Error> {
        let mut entries = vec![];

        if let Some(title) = &update.title {
            self.title = title.trim().to_string();
        }
        if let Some(description) = &update.description {
            self.description = description.trim().to_string();
        }
        if let Some(category) = &update.category {
            self.category = IssueCategory::from_str(category)?.to_string();
        }
        if let Some(priority) = &update.priority {
            self.priority = Priority::from_str(priority)?.to_string();
        }
        if let Some(estimated) = update.estimated_completion {
            self.estimated_completion = Some(estimated);
        }
        if let Some(cost) = &update.cost {
            if let Some(estimated) = cost.estimated {
                self.cost_estimated = Some(estimated);
            }
            if let Some(actual) = cost.actual {
                self.cost_actual = Some(actual);
            }
            if let Some(currency) = &cost.currency {
                self.cost_currency = currency.clone();
            }
        }

        if let Some(status) = &update.status {
            let status = IssueStatus::from_str(status)?;
            if status.as_str() != self.status {
                self.status = status.to_string();
                if status == IssueStatus::Resolved {
                    self.actual_completion = Some(*now);
                }
                entries.push((status.into(), format!("Status updated to {}", status)));
            }
        }

        if let Some(assignee) = update.assigned_to {
            if self.assigned_to != Some(assignee) {
                self.assigned_to = Some(assignee);
                entries.push((TimelineStatus::Assigned, "Assigned to technician".to_string()));
            }
        }

        AnyOk(entries)
    }

    pub fn rating(&self) -> Option<Rating> {
        match (self.rating_score, self.rating_submitted_at) {
            (Some(score), Some(submitted_at)) => Some(Rating {
                score,
                feedback: self.rating_feedback.clone(),
                submitted_at,
            }),
            _ => None,
        }
    }

    pub async fn get_by_id(pool: &sqlx::PgPool, id: &Uuid) -> Result<Issue, anyhow::Error> {
        let issue = sqlx::query_as::<_, Issue>("SELECT * FROM societyhub_issue WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;

        match issue {
            Some(issue) => AnyOk(issue),
            None => Err(ServiceError::not_found("Issue not found")),
        }
    }

    /// Loads the people, timelines and photos of all issues with three queries.
    pub async fn with_details(
        pool: &sqlx::PgPool,
        issues: Vec<Issue>,
    ) -> Result<Vec<IssueDetail>, anyhow::Error> {
        if issues.is_empty() {
            return AnyOk(vec![]);
        }

        let ids = issues.iter().map(|i| i.id).collect::<Vec<Uuid>>();
        let mut user_ids = issues
            .iter()
            .flat_map(|i| std::iter::once(i.reported_by).chain(i.assigned_to))
            .collect::<Vec<Uuid>>();
        user_ids.sort();
        user_ids.dedup();

        let users = UserBrief::get_by_ids(pool, &user_ids)
            .await?
            .into_iter()
            .map(|u| (u.id, u))
            .collect::<HashMap<Uuid, UserBrief>>();

        let timeline = sqlx::query_as::<_, TimelineEntry>(
            "SELECT t.id, t.issue_id, t.status, t.message, t.updated_by, u.name AS updated_by_name, t.created_at FROM societyhub_issue_timeline t LEFT JOIN societyhub_user u ON u.id = t.updated_by WHERE t.issue_id = ANY($1) ORDER BY t.created_at",
        )
        .bind(&ids)
        .fetch_all(pool)
        .await?;

        let photos = sqlx::query_as::<_, IssuePhoto>(
            "SELECT * FROM societyhub_issue_photo WHERE issue_id = ANY($1) ORDER BY uploaded_at",
        )
        .bind(&ids)
        .fetch_all(pool)
        .await?;

        let mut timeline_by_issue: HashMap<Uuid, Vec<TimelineEntry>> = HashMap::new();
        for entry in timeline {
            timeline_by_issue.entry(entry.issue_id).or_default().push(entry);
        }
        let mut photos_by_issue: HashMap<Uuid, Vec<IssuePhoto>> = HashMap::new();
        for photo in photos {
            photos_by_issue.entry(photo.issue_id).or_default().push(photo);
        }

        let now = Utc::now();
        let details = issues
            .into_iter()
            .map(|issue| IssueDetail {
                reporter: users.get(&issue.reported_by).cloned(),
                assignee: issue.assigned_to.and_then(|id| users.get(&id).cloned()),
                timeline: timeline_by_issue.remove(&issue.id).unwrap_or_default(),
                photos: photos_by_issue.remove(&issue.id).unwrap_or_default(),
                age_days: age_days(&issue.created_at, &now),
                is_overdue: issue.is_overdue(&now),
                issue,
            })
            .collect();

        AnyOk(details)
    }

    pub async fn get_detail(pool: &sqlx::PgPool, issue: Issue) -> Result<IssueDetail, anyhow::Error> {
        let mut details = Issue::with_details(pool, vec![issue]).await?;
        match details.pop() {
            Some(detail) => AnyOk(detail),
            None => Err(ServiceError::not_found("Issue not found")),
        }
    }

    pub async fn get_records(
        pool: &sqlx::PgPool,
        filter: &IssueFilter,
        viewer: &User,
        page: u64,
        page_size: u64,
    ) -> Result<IssuePage, anyhow::Error> {
        let query = filter.to_query(viewer)?;
        let mut params = vec![];
        let where_clause = query.where_clause(&mut params);

        let sql_str = format!(
            "SELECT * FROM societyhub_issue {} ORDER BY created_at DESC {}",
            where_clause,
            make_pagination_clause(page, page_size)
        );
        let issues = bind_query_as(sqlx::query_as::<_, Issue>(&sql_str), &params)
            .fetch_all(pool)
            .await?;

        let count_str = format!("SELECT COUNT(*) FROM societyhub_issue {}", where_clause);
        let total = bind_query_scalar(sqlx::query_scalar::<_, i64>(&count_str), &params)
            .fetch_one(pool)
            .await? as u64;

        AnyOk(IssuePage {
            issues: Issue::with_details(pool, issues).await?,
            total_pages: total_pages(total, page_size),
            current_page: page,
            total,
        })
    }

    pub async fn create(
        pool: &sqlx::PgPool,
        reporter: &User,
        new_issue: &NewIssue,
    ) -> Result<IssueDetail, anyhow::Error> {
        check_payload(new_issue, "issue")?;

        let category = IssueCategory::from_str(&new_issue.category)?;
        let priority = match &new_issue.priority {
            Some(p) => Priority::from_str(p)?,
            None => Priority::Medium,
        };
        let is_emergency = new_issue.is_emergency.unwrap_or(false);
        let emergency_type = if is_emergency {
            new_issue.emergency_type.clone()
        } else {
            None
        };
        let ai = new_issue.ai_suggestions.as_ref();

        let mut tx = pool.begin().await?;
        let issue = sqlx::query_as::<_, Issue>(
            "INSERT INTO societyhub_issue (id, title, description, category, priority, status, reported_by, location_flat_number, location_building, location_area, ai_category, ai_priority, ai_estimated_time, ai_confidence, cost_currency, tags, is_emergency, emergency_type) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(new_issue.title.trim())
        .bind(new_issue.description.trim())
        .bind(category.as_str())
        .bind(priority.as_str())
        .bind(IssueStatus::Pending.as_str())
        .bind(reporter.id)
        .bind(&reporter.flat_number)
        .bind(&reporter.building)
        .bind(&new_issue.area)
        .bind(ai.and_then(|a| a.category.clone()))
        .bind(ai.and_then(|a| a.priority.clone()))
        .bind(ai.and_then(|a| a.estimated_time.clone()))
        .bind(ai.and_then(|a| a.confidence))
        .bind(DEFAULT_CURRENCY)
        .bind(new_issue.tags.clone().unwrap_or_default())
        .bind(is_emergency)
        .bind(emergency_type)
        .fetch_one(&mut tx)
        .await?;

        for photo in new_issue.photos.iter().flatten() {
            sqlx::query(
                "INSERT INTO societyhub_issue_photo (id, issue_id, url, caption) VALUES ($1, $2, $3, $4)",
            )
            .bind(Uuid::new_v4())
            .bind(issue.id)
            .bind(photo.url.trim())
            .bind(&photo.caption)
            .execute(&mut tx)
            .await?;
        }

        add_timeline_entry(&mut tx, &issue.id, TimelineStatus::Reported, "Issue reported", &reporter.id)
            .await?;
        tx.commit().await?;

        info!("{} reported a {} issue ({}).", reporter.email, issue.category, issue.id);
        Issue::get_detail(pool, issue).await
    }

    pub async fn update(
        pool: &sqlx::PgPool,
        id: &Uuid,
        user: &User,
        update: &IssueUpdate,
    ) -> Result<IssueDetail, anyhow::Error> {
        check_payload(update, "issue update")?;

        if let Some(assignee) = update.assigned_to {
            match User::get_by_id(pool, &assignee).await? {
                Some(technician) if technician.role() == Some(Role::Technician) => {}
                Some(_) => {
                    return Err(ServiceError::bad_request("Issues can only be assigned to technicians"))
                }
                None => return Err(ServiceError::not_found("Technician not found")),
            }
        }

        let mut tx = pool.begin().await?;
        let mut issue = lock_issue(&mut tx, id).await?;
        issue.check_access(user)?;

        let entries = issue.apply_update(update, &Utc::now())?;
        let issue = save_issue(&mut tx, &issue).await?;
        for (status, message) in entries {
            add_timeline_entry(&mut tx, &issue.id, status, &message, &user.id).await?;
        }
        tx.commit().await?;

        debug!("Issue {} updated by {}.", issue.id, user.email);
        Issue::get_detail(pool, issue).await
    }

    /// Adds a photo and returns all photos of the issue.
    pub async fn add_photo(
        pool: &sqlx::PgPool,
        id: &Uuid,
        user: &User,
        photo: &NewPhoto,
    ) -> Result<Vec<IssuePhoto>, anyhow::Error> {
        check_payload(photo, "photo")?;
        let issue = Issue::get_by_id(pool, id).await?;
        issue.check_access(user)?;

        sqlx::query(
            "INSERT INTO societyhub_issue_photo (id, issue_id, url, caption) VALUES ($1, $2, $3, $4)",
        )
        .bind(Uuid::new_v4())
        .bind(issue.id)
        .bind(photo.url.trim())
        .bind(&photo.caption)
        .execute(pool)
        .await?;

        let photos = sqlx::query_as::<_, IssuePhoto>(
            "SELECT * FROM societyhub_issue_photo WHERE issue_id = $1 ORDER BY uploaded_at",
        )
        .bind(issue.id)
        .fetch_all(pool)
        .await?;

        AnyOk(photos)
    }

    /// Only the reporter can rate, and only once the issue is resolved or closed.
    pub async fn rate(
        pool: &sqlx::PgPool,
        id: &Uuid,
        user: &User,
        request: &RatingRequest,
    ) -> Result<Rating, anyhow::Error> {
        check_payload(request, "rating")?;

        let mut tx = pool.begin().await?;
        let mut issue = lock_issue(&mut tx, id).await?;
        if issue.reported_by != user.id {
            return Err(ServiceError::forbidden(
                "Only the person who reported can rate this issue",
            ));
        }

        let finished = IssueStatus::from_str(&issue.status)
            .map(|s| s.is_finished())
            .unwrap_or(false);
        if !finished {
            return Err(ServiceError::bad_request("Can only rate resolved or closed issues"));
        }

        issue.rating_score = Some(request.score);
        issue.rating_feedback = request.feedback.as_ref().map(|f| f.trim().to_string());
        issue.rating_submitted_at = Some(Utc::now());
        let issue = save_issue(&mut tx, &issue).await?;
        tx.commit().await?;

        match issue.rating() {
            Some(rating) => AnyOk(rating),
            None => Err(anyhow::anyhow!("The rating of issue {} was not saved", issue.id)),
        }
    }

    pub async fn stats(pool: &sqlx::PgPool) -> Result<IssueStats, anyhow::Error> {
        let count_by = |column: &str| {
            format!(
                "SELECT {} AS key, COUNT(*) AS count FROM societyhub_issue GROUP BY {} ORDER BY count DESC, key",
                column, column
            )
        };

        let status_stats = sqlx::query_as::<_, CountItem>(&count_by("status"))
            .fetch_all(pool)
            .await?;
        let category_stats = sqlx::query_as::<_, CountItem>(&count_by("category"))
            .fetch_all(pool)
            .await?;
        let priority_stats = sqlx::query_as::<_, CountItem>(&count_by("priority"))
            .fetch_all(pool)
            .await?;

        AnyOk(IssueStats {
            status_stats,
            category_stats,
            priority_stats,
        })
    }

    /// Records the technician picked by the matching agent.
    pub async fn assign_technician(
        pool: &sqlx::PgPool,
        id: &Uuid,
        technician_id: &Uuid,
        technician_name: &str,
        assigned_by: &Uuid,
    ) -> Result<Issue, anyhow::Error> {
        let mut tx = pool.begin().await?;
        let mut issue = lock_issue(&mut tx, id).await?;
        issue.assigned_to = Some(*technician_id);
        issue.status = IssueStatus::Assigned.to_string();
        let issue = save_issue(&mut tx, &issue).await?;
        add_timeline_entry(
            &mut tx,
            &issue.id,
            TimelineStatus::Assigned,
            &format!("Assigned to {}", technician_name),
            assigned_by,
        )
        .await?;
        tx.commit().await?;

        info!("Issue {} assigned to {}.", issue.id, technician_name);
        AnyOk(issue)
    }

    pub async fn accept_assignment(
        pool: &sqlx::PgPool,
        id: &Uuid,
        user: &User,
    ) -> Result<AssignmentAck, anyhow::Error> {
        let mut tx = pool.begin().await?;
        let mut issue = lock_issue(&mut tx, id).await?;
        issue.check_access(user)?;
        if issue.assigned_to.is_none() {
            return Err(ServiceError::bad_request("No technician assigned to this issue"));
        }

        issue.status = IssueStatus::InProgress.to_string();
        let issue = save_issue(&mut tx, &issue).await?;
        add_timeline_entry(
            &mut tx,
            &issue.id,
            TimelineStatus::Accepted,
            "Resident accepted technician assignment",
            &user.id,
        )
        .await?;
        tx.commit().await?;

        AnyOk(AssignmentAck {
            message: "Technician assignment accepted".to_string(),
            status: issue.status,
        })
    }

    pub async fn reject_assignment(
        pool: &sqlx::PgPool,
        id: &Uuid,
        user: &User,
        reason: Option<&str>,
    ) -> Result<AssignmentAck, anyhow::Error> {
        let mut tx = pool.begin().await?;
        let mut issue = lock_issue(&mut tx, id).await?;
        issue.check_access(user)?;
        if issue.assigned_to.is_none() {
            return Err(ServiceError::bad_request("No technician assigned to this issue"));
        }

        issue.assigned_to = None;
        issue.status = IssueStatus::Pending.to_string();
        let issue = save_issue(&mut tx, &issue).await?;
        let reason = match reason.map(|r| r.trim()) {
            Some(r) if !r.is_empty() => r,
            _ => "Not specified",
        };
        add_timeline_entry(
            &mut tx,
            &issue.id,
            TimelineStatus::Rejected,
            &format!("Technician assignment rejected. Reason: {}", reason),
            &user.id,
        )
        .await?;
        tx.commit().await?;

        AnyOk(AssignmentAck {
            message: "Technician assignment rejected".to_string(),
            status: issue.status,
        })
    }

    pub async fn get_reported_by(
        pool: &sqlx::PgPool,
        resident_id: &Uuid,
    ) -> Result<Vec<Issue>, anyhow::Error> {
        let issues = sqlx::query_as::<_, Issue>(
            "SELECT * FROM societyhub_issue WHERE reported_by = $1 ORDER BY created_at DESC",
        )
        .bind(resident_id)
        .fetch_all(pool)
        .await?;

        AnyOk(issues)
    }

    /// Pending issues nobody was assigned to, oldest first.
    pub async fn get_unassigned(pool: &sqlx::PgPool) -> Result<Vec<Issue>, anyhow::Error> {
        let issues = sqlx::query_as::<_, Issue>(
            "SELECT * FROM societyhub_issue WHERE assigned_to IS NULL AND status = $1 ORDER BY created_at",
        )
        .bind(IssueStatus::Pending.as_str())
        .fetch_all(pool)
        .await?;

        AnyOk(issues)
    }

    /// Issues a technician is currently working on or about to start.
    pub async fn get_active_assignments(
        pool: &sqlx::PgPool,
        technician_id: &Uuid,
    ) -> Result<Vec<Issue>, anyhow::Error> {
        let issues = sqlx::query_as::<_, Issue>(
            "SELECT * FROM societyhub_issue WHERE assigned_to = $1 AND status = ANY($2) ORDER BY created_at DESC",
        )
        .bind(technician_id)
        .bind(vec![
            IssueStatus::Assigned.to_string(),
            IssueStatus::InProgress.to_string(),
        ])
        .fetch_all(pool)
        .await?;

        AnyOk(issues)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::setup_test_db;
    use chrono::Duration;

    pub fn sample_issue() -> Issue {
        let now = Utc::now();
        Issue {
            id: Uuid::new_v4(),
            title: "Water leak in kitchen sink".to_string(),
            description: "Water is dripping under the kitchen sink.".to_string(),
            category: "plumbing".to_string(),
            priority: "high".to_string(),
            status: "pending".to_string(),
            reported_by: Uuid::new_v4(),
            assigned_to: None,
            location_flat_number: Some("A-501".to_string()),
            location_building: Some("Tower A".to_string()),
            location_area: Some("Kitchen".to_string()),
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

    fn new_issue() -> NewIssue {
        NewIssue {
            title: "Water leak in kitchen sink".to_string(),
            description: "Water is dripping under the kitchen sink.".to_string(),
            category: "plumbing".to_string(),
            priority: None,
            area: Some("Kitchen".to_string()),
            photos: None,
            is_emergency: None,
            emergency_type: None,
            ai_suggestions: None,
            tags: None,
        }
    }

    #[test]
    fn test_new_issue_validation() {
        assert!(new_issue().validate().is_ok());

        let mut issue = new_issue();
        issue.title = "  Leak   ".to_string();
        assert!(issue.validate().is_err());

        let mut issue = new_issue();
        issue.description = "Too short".to_string();
        assert!(issue.validate().is_err());

        let mut issue = new_issue();
        issue.category = "roofing".to_string();
        assert!(issue.validate().is_err());

        let mut issue = new_issue();
        issue.photos = Some(vec![NewPhoto {
            url: " ".to_string(),
            caption: None,
        }]);
        assert!(issue.validate().is_err());
    }

    #[test]
    fn test_rating_validation() {
        let rating = RatingRequest {
            score: 6,
            feedback: None,
        };
        assert!(rating.validate().is_err());

        let rating = RatingRequest {
            score: 5,
            feedback: Some("x".repeat(501)),
        };
        assert!(rating.validate().is_err());
    }

    #[test]
    fn test_apply_update() {
        let now = Utc::now();
        let mut issue = sample_issue();
        let technician = Uuid::new_v4();
        let update = IssueUpdate {
            priority: Some("urgent".to_string()),
            status: Some("resolved".to_string()),
            assigned_to: Some(technician),
            cost: Some(CostInput {
                estimated: None,
                actual: Some(750.0),
                currency: None,
            }),
            ..Default::default()
        };

        let entries = issue.apply_update(&update, &now).unwrap();
        assert_eq!(issue.priority, "urgent");
        assert_eq!(issue.status, "resolved");
        assert_eq!(issue.actual_completion, Some(now));
        assert_eq!(issue.cost_actual, Some(750.0));
        assert_eq!(issue.cost_currency, "INR");
        assert_eq!(
            entries,
            vec![
                (TimelineStatus::Resolved, "Status updated to resolved".to_string()),
                (TimelineStatus::Assigned, "Assigned to technician".to_string()),
            ]
        );

        // Repeating the same values changes nothing.
        let entries = issue.apply_update(&update, &now).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_cost_currency_limit() {
        let update = IssueUpdate {
            cost: Some(CostInput {
                estimated: Some(1200.0),
                actual: None,
                currency: Some("RUPEES-INR".to_string()),
            }),
            ..Default::default()
        };
        let err = check_payload(&update, "issue").unwrap_err();
        assert!(matches!(err.downcast_ref::<ServiceError>(), Some(ServiceError::BadRequest { .. })));

        let update = IssueUpdate {
            cost: Some(CostInput {
                estimated: Some(1200.0),
                actual: None,
                currency: Some("INR".to_string()),
            }),
            ..Default::default()
        };
        assert!(check_payload(&update, "issue").is_ok());
    }

    #[test]
    fn test_is_overdue() {
        let now = Utc::now();
        let mut issue = sample_issue();
        assert!(!issue.is_overdue(&now));

        issue.estimated_completion = Some(now - Duration::hours(1));
        assert!(issue.is_overdue(&now));

        issue.status = "closed".to_string();
        assert!(!issue.is_overdue(&now));
    }

    #[tokio::test]
    #[ignore]
    async fn test_missing_issue_is_not_found() {
        let pool = setup_test_db().await;
        let err = Issue::get_by_id(&pool, &Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.to_string(), "Issue not found");
    }
}
