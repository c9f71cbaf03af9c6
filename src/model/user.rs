//! Residents, admins and technicians.

use super::core::{
    total_pages, validate_availability, validate_role, validate_skills, Availability, Role,
    ServiceError, BCRYPT_COST, DEFAULT_AVATAR, DEFAULT_HOURLY_RATE, PHONE_REGEX,
};
use crate::query_builder::sql_builder::{
    bind_query_as, bind_query_scalar, make_pagination_clause, ComposeQueryItem, QueryItem, Value,
};
use anyhow::Ok as AnyOk;
use chrono::{DateTime, Utc};
use log::{debug, info};
use poem_openapi::Object;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;
use validator::Validate;

const USER_COLUMNS: &str = "id, name, email, role, phone, flat_number, building, avatar, \
    is_active, last_login, skills, hourly_rate, availability, notify_email, notify_sms, \
    notify_push, language, created_at, updated_at, \
    CASE WHEN role = 'resident' AND flat_number IS NOT NULL AND building IS NOT NULL \
    THEN flat_number || ', ' || building END AS full_address";

const BRIEF_COLUMNS: &str =
    "id, name, email, phone, flat_number, building, skills, hourly_rate, availability";

/// A user as it is returned by the API. The password hash never leaves the credentials query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Object, sqlx::FromRow)]
pub struct User {
    #[oai(read_only)]
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub role: String,
    pub phone: String,
    #[oai(skip_serializing_if_is_none)]
    pub flat_number: Option<String>,
    #[oai(skip_serializing_if_is_none)]
    pub building: Option<String>,
    pub avatar: String,
    pub is_active: bool,
    pub last_login: DateTime<Utc>,
    pub skills: Vec<String>,
    pub hourly_rate: f64,
    pub availability: String,
    pub notify_email: bool,
    pub notify_sms: bool,
    pub notify_push: bool,
    pub language: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// "flat, building" for residents.
    #[oai(skip_serializing_if_is_none)]
    pub full_address: Option<String>,
}

/// The fields of a user which are embedded into bills, issues and assignment lists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Object, sqlx::FromRow)]
pub struct UserBrief {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: String,
    #[oai(skip_serializing_if_is_none)]
    pub flat_number: Option<String>,
    #[oai(skip_serializing_if_is_none)]
    pub building: Option<String>,
    pub skills: Vec<String>,
    pub hourly_rate: f64,
    pub availability: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct Credentials {
    id: Uuid,
    password_hash: String,
    is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object, Validate)]
pub struct NewUser {
    #[validate(length(
        min = 1,
        max = 50,
        message = "Name must be between 1 and 50 characters"
    ))]
    pub name: String,

    #[validate(
        email(message = "Please enter a valid email"),
        length(max = 255, message = "Email cannot be longer than 255 characters")
    )]
    pub email: String,

    #[validate(length(min = 6, message = "Password must be at least 6 characters"))]
    pub password: String,

    #[validate(
        regex(path = "PHONE_REGEX", message = "Please enter a valid phone number"),
        length(max = 32, message = "Phone number cannot be longer than 32 characters")
    )]
    pub phone: String,

    #[validate(custom = "validate_role")]
    pub role: Option<String>,

    #[validate(length(max = 32, message = "Flat number cannot be longer than 32 characters"))]
    pub flat_number: Option<String>,

    #[validate(length(max = 64, message = "Building cannot be longer than 64 characters"))]
    pub building: Option<String>,

    #[validate(custom = "validate_skills")]
    pub skills: Option<Vec<String>>,

    #[validate(range(min = 0.0, message = "Hourly rate cannot be negative"))]
    pub hourly_rate: Option<f64>,

    #[validate(custom = "validate_availability")]
    pub availability: Option<String>,
}

impl NewUser {
    pub fn role(&self) -> Result<Role, anyhow::Error> {
        match &self.role {
            Some(role) => Role::from_str(role),
            None => Ok(Role::Resident),
        }
    }

    /// Field checks plus the rules which depend on the role.
    pub fn check(&self) -> Result<(), anyhow::Error> {
        if let Err(e) = self.validate() {
            return Err(ServiceError::bad_request(&format!("Invalid user: {}", e)));
        }

        let role = self.role()?;
        if role == Role::Resident {
            let missing = |v: &Option<String>| v.as_ref().map_or(true, |s| s.trim().is_empty());
            if missing(&self.flat_number) {
                return Err(ServiceError::bad_request("Flat number is required for residents"));
            }
            if missing(&self.building) {
                return Err(ServiceError::bad_request("Building is required for residents"));
            }
        }

        Ok(())
    }
}

const DUPLICATE_EMAIL: &str = "User already exists with this email";

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(e) => e.code().as_deref() == Some("23505"),
        _ => false,
    }
}

pub async fn hash_password(password: &str) -> Result<String, anyhow::Error> {
    let password = password.to_string();
    // bcrypt is deliberately slow, keep it off the async workers.
    let hashed = tokio::task::spawn_blocking(move || bcrypt::hash(password, BCRYPT_COST)).await??;
    AnyOk(hashed)
}

pub async fn verify_password(password: &str, hashed: &str) -> Result<bool, anyhow::Error> {
    let password = password.to_string();
    let hashed = hashed.to_string();
    let matched = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hashed)).await??;
    AnyOk(matched)
}

impl User {
    pub fn role(&self) -> Option<Role> {
        Role::from_str(&self.role).ok()
    }

    pub fn is_admin(&self) -> bool {
        self.role() == Some(Role::Admin)
    }

    /// Fails with a forbidden error when the user doesn't have one of the given roles.
    pub fn require_role(&self, roles: &[Role]) -> Result<(), anyhow::Error> {
        match self.role() {
            Some(role) if roles.contains(&role) => Ok(()),
            _ => Err(ServiceError::forbidden(&format!(
                "User role {} is not authorized to access this route, it requires {}",
                self.role,
                roles
                    .iter()
                    .map(|r| r.as_str())
                    .collect::<Vec<&str>>()
                    .join(" or ")
            ))),
        }
    }

    pub async fn create(pool: &sqlx::PgPool, new_user: &NewUser) -> Result<User, anyhow::Error> {
        new_user.check()?;

        let email = new_user.email.trim().to_lowercase();
        let exists = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM societyhub_user WHERE email = $1",
        )
        .bind(&email)
        .fetch_one(pool)
        .await?;

        if exists > 0 {
            return Err(ServiceError::conflict(DUPLICATE_EMAIL));
        }

        let role = new_user.role()?;
        let password_hash = hash_password(&new_user.password).await?;
        let availability = match &new_user.availability {
            Some(a) => Availability::from_str(a)?,
            None => Availability::Available,
        };

        let sql_str = format!(
            "INSERT INTO societyhub_user (id, name, email, password_hash, role, phone, flat_number, building, avatar, skills, hourly_rate, availability) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) RETURNING {}",
            USER_COLUMNS
        );
        let user = sqlx::query_as::<_, User>(&sql_str)
            .bind(Uuid::new_v4())
            .bind(new_user.name.trim())
            .bind(&email)
            .bind(password_hash)
            .bind(role.as_str())
            .bind(new_user.phone.trim())
            .bind(new_user.flat_number.as_ref().map(|v| v.trim().to_string()))
            .bind(new_user.building.as_ref().map(|v| v.trim().to_string()))
            .bind(DEFAULT_AVATAR)
            .bind(new_user.skills.clone().unwrap_or_default())
            .bind(new_user.hourly_rate.unwrap_or(DEFAULT_HOURLY_RATE))
            .bind(availability.as_str())
            .fetch_one(pool)
            .await
            .map_err(|e| {
                // Another registration with the same email can land between the check and the insert.
                if is_unique_violation(&e) {
                    ServiceError::conflict(DUPLICATE_EMAIL)
                } else {
                    e.into()
                }
            })?;

        info!("Registered a new {} ({}).", user.role, user.email);
        AnyOk(user)
    }

    /// Checks the credentials, records the login and returns the user.
    pub async fn authenticate(
        pool: &sqlx::PgPool,
        email: &str,
        password: &str,
    ) -> Result<User, anyhow::Error> {
        let email = email.trim().to_lowercase();
        let credentials = sqlx::query_as::<_, Credentials>(
            "SELECT id, password_hash, is_active FROM societyhub_user WHERE email = $1",
        )
        .bind(&email)
        .fetch_optional(pool)
        .await?;

        let credentials = match credentials {
            Some(c) => c,
            None => return Err(ServiceError::unauthorized("Invalid credentials")),
        };

        if !verify_password(password, &credentials.password_hash).await? {
            return Err(ServiceError::unauthorized("Invalid credentials"));
        }

        if !credentials.is_active {
            return Err(ServiceError::unauthorized("Account is deactivated"));
        }

        let sql_str = format!(
            "UPDATE societyhub_user SET last_login = NOW() WHERE id = $1 RETURNING {}",
            USER_COLUMNS
        );
        let user = sqlx::query_as::<_, User>(&sql_str)
            .bind(credentials.id)
            .fetch_one(pool)
            .await?;

        debug!("{} logged in.", user.email);
        AnyOk(user)
    }

    pub async fn get_by_id(pool: &sqlx::PgPool, id: &Uuid) -> Result<Option<User>, anyhow::Error> {
        let sql_str = format!("SELECT {} FROM societyhub_user WHERE id = $1", USER_COLUMNS);
        let user = sqlx::query_as::<_, User>(&sql_str)
            .bind(id)
            .fetch_optional(pool)
            .await?;

        AnyOk(user)
    }

    pub async fn get_by_email(pool: &sqlx::PgPool, email: &str) -> Result<Option<User>, anyhow::Error> {
        let sql_str = format!("SELECT {} FROM societyhub_user WHERE email = $1", USER_COLUMNS);
        let user = sqlx::query_as::<_, User>(&sql_str)
            .bind(email.trim().to_lowercase())
            .fetch_optional(pool)
            .await?;

        AnyOk(user)
    }

    /// Newest users first, optionally only one role.
    pub async fn get_records(
        pool: &sqlx::PgPool,
        role: Option<&str>,
        page: u64,
        page_size: u64,
    ) -> Result<UserPage, anyhow::Error> {
        let mut query = ComposeQueryItem::new("and");
        if let Some(role) = role {
            let role = Role::from_str(role).map_err(|e| ServiceError::bad_request(&e.to_string()))?;
            query.add_query_item(QueryItem::eq("role", Value::String(role.to_string()))?);
        }

        let mut params = vec![];
        let where_clause = query.where_clause(&mut params);

        let sql_str = format!(
            "SELECT {} FROM societyhub_user {} ORDER BY created_at DESC {}",
            USER_COLUMNS,
            where_clause,
            make_pagination_clause(page, page_size)
        );
        let users = bind_query_as(sqlx::query_as::<_, User>(&sql_str), &params)
            .fetch_all(pool)
            .await?;

        let count_str = format!("SELECT COUNT(*) FROM societyhub_user {}", where_clause);
        let total = bind_query_scalar(sqlx::query_scalar::<_, i64>(&count_str), &params)
            .fetch_one(pool)
            .await? as u64;

        AnyOk(UserPage {
            users,
            total_pages: total_pages(total, page_size),
            current_page: page,
            total,
        })
    }

    /// Active technicians sorted by name.
    pub async fn get_technicians(pool: &sqlx::PgPool) -> Result<Vec<UserBrief>, anyhow::Error> {
        let sql_str = format!(
            "SELECT {} FROM societyhub_user WHERE role = $1 AND is_active = TRUE ORDER BY name",
            BRIEF_COLUMNS
        );
        let technicians = sqlx::query_as::<_, UserBrief>(&sql_str)
            .bind(Role::Technician.as_str())
            .fetch_all(pool)
            .await?;

        AnyOk(technicians)
    }

    /// Technicians who can take a new job right now.
    pub async fn get_available_technicians(
        pool: &sqlx::PgPool,
    ) -> Result<Vec<UserBrief>, anyhow::Error> {
        let sql_str = format!(
            "SELECT {} FROM societyhub_user WHERE role = $1 AND availability = $2 AND is_active = TRUE ORDER BY created_at",
            BRIEF_COLUMNS
        );
        let technicians = sqlx::query_as::<_, UserBrief>(&sql_str)
            .bind(Role::Technician.as_str())
            .bind(Availability::Available.as_str())
            .fetch_all(pool)
            .await?;

        AnyOk(technicians)
    }
}

impl UserBrief {
    pub async fn get_by_ids(
        pool: &sqlx::PgPool,
        ids: &[Uuid],
    ) -> Result<Vec<UserBrief>, anyhow::Error> {
        if ids.is_empty() {
            return AnyOk(vec![]);
        }

        let sql_str = format!(
            "SELECT {} FROM societyhub_user WHERE id = ANY($1)",
            BRIEF_COLUMNS
        );
        let users = sqlx::query_as::<_, UserBrief>(&sql_str)
            .bind(ids.to_vec())
            .fetch_all(pool)
            .await?;

        AnyOk(users)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct UserPage {
    pub users: Vec<User>,
    pub total_pages: u64,
    pub current_page: u64,
    pub total: u64,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::setup_test_db;

    pub fn resident() -> NewUser {
        NewUser {
            name: "Neha Patel".to_string(),
            email: "Neha.Patel@Example.com".to_string(),
            password: "secret123".to_string(),
            phone: "+91 98200 11111".to_string(),
            role: None,
            flat_number: Some("A-501".to_string()),
            building: Some("Tower A".to_string()),
            skills: None,
            hourly_rate: None,
            availability: None,
        }
    }

    #[test]
    fn test_new_user_check() {
        assert!(resident().check().is_ok());

        let mut user = resident();
        user.flat_number = None;
        let err = user.check().unwrap_err();
        assert_eq!(err.to_string(), "Flat number is required for residents");

        let mut user = resident();
        user.password = "123".to_string();
        assert!(user.check().is_err());

        let mut user = resident();
        user.phone = "not a phone".to_string();
        assert!(user.check().is_err());

        let mut technician = resident();
        technician.role = Some("technician".to_string());
        technician.flat_number = None;
        technician.building = None;
        technician.skills = Some(vec!["plumbing".to_string()]);
        assert!(technician.check().is_ok());

        let mut intruder = resident();
        intruder.role = Some("root".to_string());
        assert!(intruder.check().is_err());
    }

    #[test]
    fn test_new_user_column_limits() {
        let mut user = resident();
        user.phone = "9".repeat(33);
        let err = user.check().unwrap_err();
        assert!(matches!(err.downcast_ref::<ServiceError>(), Some(ServiceError::BadRequest { .. })));

        let mut user = resident();
        user.flat_number = Some("A".repeat(33));
        assert!(user.check().is_err());

        let mut user = resident();
        user.building = Some("Tower ".repeat(11));
        assert!(user.check().is_err());

        let mut user = resident();
        user.email = format!("{}@societyhub.com", "n".repeat(250));
        assert!(user.check().is_err());

        let mut user = resident();
        user.phone = "9".repeat(32);
        user.flat_number = Some("A".repeat(32));
        user.building = Some("B".repeat(64));
        assert!(user.check().is_ok());
    }

    pub fn sample_user(role: &str) -> User {
        let now = Utc::now();
        User {
            id: Uuid::new_v4(),
            name: "Raj Verma".to_string(),
            email: "raj@example.com".to_string(),
            role: role.to_string(),
            phone: "9820012345".to_string(),
            flat_number: Some("B-203".to_string()),
            building: Some("Tower B".to_string()),
            avatar: DEFAULT_AVATAR.to_string(),
            is_active: true,
            last_login: now,
            skills: vec![],
            hourly_rate: DEFAULT_HOURLY_RATE,
            availability: "available".to_string(),
            notify_email: true,
            notify_sms: true,
            notify_push: true,
            language: "en".to_string(),
            created_at: now,
            updated_at: now,
            full_address: Some("B-203, Tower B".to_string()),
        }
    }

    #[test]
    fn test_require_role() {
        let user = sample_user("resident");

        assert!(user.require_role(&[Role::Resident]).is_ok());
        let err = user.require_role(&[Role::Admin]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "User role resident is not authorized to access this route, it requires admin"
        );
        assert!(!user.is_admin());
    }

    #[tokio::test]
    async fn test_password_hashing() {
        let hashed = hash_password("secret123").await.unwrap();
        assert_ne!(hashed, "secret123");
        assert!(verify_password("secret123", &hashed).await.unwrap());
        assert!(!verify_password("secret124", &hashed).await.unwrap());
    }

    #[tokio::test]
    #[ignore]
    async fn test_register_and_login() {
        let pool = setup_test_db().await;
        let mut new_user = resident();
        new_user.email = format!("resident-{}@example.com", Uuid::new_v4());

        let user = User::create(&pool, &new_user).await.unwrap();
        assert_eq!(user.role, "resident");
        assert_eq!(user.full_address.as_deref(), Some("A-501, Tower A"));

        let again = User::create(&pool, &new_user).await.unwrap_err();
        assert_eq!(again.to_string(), "User already exists with this email");
        assert!(matches!(again.downcast_ref::<ServiceError>(), Some(ServiceError::Conflict { .. })));

        let logged_in = User::authenticate(&pool, &new_user.email.to_uppercase(), "secret123")
            .await
            .unwrap();
        assert_eq!(logged_in.id, user.id);

        let denied = User::authenticate(&pool, &new_user.email, "wrong-password")
            .await
            .unwrap_err();
        assert_eq!(denied.to_string(), "Invalid credentials");
    }

    #[tokio::test]
    #[ignore]
    async fn test_concurrent_registration() {
        let pool = setup_test_db().await;
        let mut new_user = resident();
        new_user.email = format!("resident-{}@example.com", Uuid::new_v4());

        let (first, second) = tokio::join!(User::create(&pool, &new_user), User::create(&pool, &new_user));
        let results = vec![first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        for err in results.iter().filter_map(|r| r.as_ref().err()) {
            assert!(matches!(err.downcast_ref::<ServiceError>(), Some(ServiceError::Conflict { .. })));
        }
    }
}
