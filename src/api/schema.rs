use crate::model::core::ServiceError;
use crate::model::user::User;
use chrono::{DateTime, Utc};
use log::warn;
use poem_openapi::types::ToJSON;
use poem_openapi::Object;
use poem_openapi::{payload::Json, ApiResponse, Tags};
use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Tags)]
pub enum ApiTags {
    Auth,
    Users,
    Bills,
    Issues,
    TechnicianAssignment,
    Notifications,
    AiBilling,
    Maintenance,
    Security,
    Health,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Object)]
pub struct ErrorMessage {
    pub msg: String,
}

#[derive(ApiResponse)]
pub enum JsonResponse<T: ToJSON> {
    #[oai(status = 200)]
    Ok(Json<T>),

    #[oai(status = 201)]
    Created(Json<T>),

    #[oai(status = 400)]
    BadRequest(Json<ErrorMessage>),

    #[oai(status = 401)]
    Unauthorized(Json<ErrorMessage>),

    #[oai(status = 403)]
    Forbidden(Json<ErrorMessage>),

    #[oai(status = 404)]
    NotFound(Json<ErrorMessage>),

    #[oai(status = 500)]
    InternalError(Json<ErrorMessage>),
}

impl<T: ToJSON> JsonResponse<T> {
    pub fn ok(t: T) -> Self {
        Self::Ok(Json(t))
    }

    pub fn created(t: T) -> Self {
        Self::Created(Json(t))
    }

    pub fn bad_request(msg: String) -> Self {
        Self::BadRequest(Json(ErrorMessage { msg }))
    }

    pub fn unauthorized(msg: String) -> Self {
        Self::Unauthorized(Json(ErrorMessage { msg }))
    }

    pub fn forbidden(msg: String) -> Self {
        Self::Forbidden(Json(ErrorMessage { msg }))
    }

    pub fn not_found(msg: String) -> Self {
        Self::NotFound(Json(ErrorMessage { msg }))
    }

    pub fn internal_error(msg: String) -> Self {
        Self::InternalError(Json(ErrorMessage { msg }))
    }

    /// Picks the status code from a [`ServiceError`], any other error is a 500 with a generic message.
    pub fn from_error(err: anyhow::Error) -> Self {
        match err.downcast::<ServiceError>() {
            Ok(ServiceError::NotFound { msg }) => Self::not_found(msg),
            Ok(ServiceError::Forbidden { msg }) => Self::forbidden(msg),
            Ok(ServiceError::BadRequest { msg }) => Self::bad_request(msg),
            // An already registered email is answered with 400.
            Ok(ServiceError::Conflict { msg }) => Self::bad_request(msg),
            Ok(ServiceError::Unauthorized { msg }) => Self::unauthorized(msg),
            Err(err) => {
                warn!("Internal error: {:?}", err);
                Self::internal_error("Server error".to_string())
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Object, Validate)]
pub struct Pagination {
    #[validate(range(min = 1, message = "Page must be at least 1"))]
    pub page: u64,

    #[validate(range(min = 1, max = 100, message = "Limit must be between 1 and 100"))]
    pub page_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct AuthResponse {
    pub token: String,
    pub user: User,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct HealthStatus {
    pub status: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
pub struct Message {
    pub message: String,
}

impl Message {
    pub fn new(message: &str) -> Self {
        Message {
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Object)]
#[oai(rename_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceService {
    pub name: String,
    pub icon: String,
    pub available: u32,
    pub next_slot: String,
    pub rate: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[oai(rename_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub struct BookingRequest {
    pub service: Option<String>,
    pub preferred_time: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Object)]
pub struct SecurityAlert {
    pub id: u64,
    #[oai(rename = "type")]
    #[serde(rename = "type")]
    pub kind: String,
    pub visitor: String,
    pub photo: String,
    pub time: String,
    pub status: String,
    pub items: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Object)]
#[oai(rename_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub struct AssignRequest {
    pub issue_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Object)]
pub struct RejectRequest {
    pub reason: Option<String>,
}

pub fn maintenance_services() -> Vec<MaintenanceService> {
    [
        ("Plumber", "Wrench", 3, "2PM Today", "₹500/hour"),
        ("Electrician", "AlertTriangle", 2, "4PM Today", "₹600/hour"),
        ("Carpenter", "Wrench", 1, "10AM Tomorrow", "₹400/hour"),
        ("Painter", "Wrench", 0, "9AM Monday", "₹300/hour"),
    ]
    .iter()
    .map(|(name, icon, available, next_slot, rate)| MaintenanceService {
        name: name.to_string(),
        icon: icon.to_string(),
        available: *available,
        next_slot: next_slot.to_string(),
        rate: rate.to_string(),
    })
    .collect()
}

pub fn security_alerts() -> Vec<SecurityAlert> {
    vec![
        SecurityAlert {
            id: 1,
            kind: "delivery".to_string(),
            visitor: "Amazon Delivery".to_string(),
            photo: "/placeholder.svg".to_string(),
            time: "2024-01-10 14:30".to_string(),
            status: "pending".to_string(),
            items: "Package for Flat A-501".to_string(),
        },
        SecurityAlert {
            id: 2,
            kind: "guest".to_string(),
            visitor: "John Smith".to_string(),
            photo: "/placeholder.svg".to_string(),
            time: "2024-01-09 18:45".to_string(),
            status: "approved".to_string(),
            items: "Visiting Flat A-501".to_string(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_error() {
        let resp = JsonResponse::<Message>::from_error(ServiceError::not_found("Bill not found"));
        assert!(matches!(resp, JsonResponse::NotFound(Json(ErrorMessage { ref msg })) if msg == "Bill not found"));

        let resp = JsonResponse::<Message>::from_error(ServiceError::conflict("User already exists"));
        assert!(matches!(resp, JsonResponse::BadRequest(_)));

        let resp = JsonResponse::<Message>::from_error(ServiceError::forbidden("Access denied"));
        assert!(matches!(resp, JsonResponse::Forbidden(_)));

        let resp = JsonResponse::<Message>::from_error(anyhow::anyhow!("connection reset"));
        assert!(matches!(resp, JsonResponse::InternalError(Json(ErrorMessage { ref msg })) if msg == "Server error"));
    }

    #[test]
    fn test_catalogs() {
        let services = maintenance_services();
        assert_eq!(services.len(), 4);
        assert_eq!(services[1].name, "Electrician");
        assert_eq!(services[3].available, 0);

        let alerts = security_alerts();
        assert_eq!(alerts[0].items, "Package for Flat A-501");
        assert_eq!(alerts[1].status, "approved");
    }

    #[test]
    fn test_pagination() {
        assert!(Pagination { page: 1, page_size: 10 }.validate().is_ok());
        assert!(Pagination { page: 0, page_size: 10 }.validate().is_err());
        assert!(Pagination { page: 1, page_size: 0 }.validate().is_err());
    }
}
