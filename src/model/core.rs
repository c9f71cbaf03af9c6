//! Core definitions shared by all models: the text enumerations stored in the database, the service errors which the API maps to status codes and a few common validators.

use custom_error::custom_error;
use lazy_static::lazy_static;
use regex::Regex;
use std::borrow::Cow;
use std::str::FromStr;
use validator::ValidationError;

pub const DEFAULT_PAGE: u64 = 1;
pub const DEFAULT_PAGE_SIZE: u64 = 10;
pub const DEFAULT_CURRENCY: &str = "INR";
pub const DEFAULT_AVATAR: &str = "/placeholder.svg";
pub const DEFAULT_HOURLY_RATE: f64 = 500.0;
pub const BCRYPT_COST: u32 = 12;

lazy_static! {
    pub static ref PHONE_REGEX: Regex = Regex::new(r"^[0-9+\-\s()]+$").unwrap();
    pub static ref DUPLICATE_REGEX: Regex = Regex::new(r"(?i)duplicate|double").unwrap();
}

// Failures which carry a meaning for the caller. The API layer downcasts an `anyhow::Error` into it to pick the status code, anything else is an internal error.
custom_error! {
#[derive(PartialEq)]
pub ServiceError
    NotFound{msg: String} = "{msg}",
    Forbidden{msg: String} = "{msg}",
    BadRequest{msg: String} = "{msg}",
    Conflict{msg: String} = "{msg}",
    Unauthorized{msg: String} = "{msg}",
}

impl ServiceError {
    pub fn not_found(msg: &str) -> anyhow::Error {
        ServiceError::NotFound { msg: msg.to_string() }.into()
    }

    pub fn forbidden(msg: &str) -> anyhow::Error {
        ServiceError::Forbidden { msg: msg.to_string() }.into()
    }

    pub fn bad_request(msg: &str) -> anyhow::Error {
        ServiceError::BadRequest { msg: msg.to_string() }.into()
    }

    pub fn conflict(msg: &str) -> anyhow::Error {
        ServiceError::Conflict { msg: msg.to_string() }.into()
    }

    pub fn unauthorized(msg: &str) -> anyhow::Error {
        ServiceError::Unauthorized { msg: msg.to_string() }.into()
    }
}

/// Declares an enumeration which is stored as TEXT and travels as a plain string in the JSON payloads.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            pub fn values() -> Vec<&'static str> {
                Self::ALL.iter().map(|v| v.as_str()).collect()
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    _ => Err(anyhow::anyhow!(
                        "Invalid {}: {}, it must be one of {:?}",
                        stringify!($name),
                        s,
                        Self::values()
                    )),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }
    };
}

text_enum!(Role {
    Resident => "resident",
    Admin => "admin",
    Technician => "technician",
});

text_enum!(Availability {
    Available => "available",
    Busy => "busy",
    Offline => "offline",
});

text_enum!(Skill {
    Plumbing => "plumbing",
    Electrical => "electrical",
    Carpentry => "carpentry",
    Painting => "painting",
    Cleaning => "cleaning",
    Security => "security",
});

text_enum!(BillType {
    Maintenance => "maintenance",
    Electricity => "electricity",
    Water => "water",
    Gas => "gas",
    Parking => "parking",
    Amenities => "amenities",
    Other => "other",
});

text_enum!(BillStatus {
    Pending => "pending",
    Paid => "paid",
    Overdue => "overdue",
    Disputed => "disputed",
    Cancelled => "cancelled",
});

text_enum!(PaymentMethod {
    Online => "online",
    Cash => "cash",
    Cheque => "cheque",
    Upi => "upi",
    BankTransfer => "bank_transfer",
});

text_enum!(ProofType {
    Receipt => "receipt",
    Screenshot => "screenshot",
    BankStatement => "bank_statement",
    UpiConfirmation => "upi_confirmation",
});

text_enum!(
    /// What a resident claims when disputing a bill.
    DisputeKind {
        AlreadyPaid => "already-paid",
        PaidTwice => "paid-twice",
        WrongSplit => "wrong-split",
    }
);

impl DisputeKind {
    /// The reason which is recorded on the dispute.
    pub fn reason(&self) -> &'static str {
        match self {
            DisputeKind::AlreadyPaid => "Already Paid",
            DisputeKind::PaidTwice => "Paid Twice",
            DisputeKind::WrongSplit => "Wrong Bill Split",
        }
    }
}

text_enum!(DisputeStatus {
    Pending => "pending",
    Resolved => "resolved",
    Rejected => "rejected",
});

text_enum!(IssueCategory {
    Plumbing => "plumbing",
    Electrical => "electrical",
    Carpentry => "carpentry",
    Painting => "painting",
    Cleaning => "cleaning",
    Security => "security",
    Elevator => "elevator",
    Parking => "parking",
    Garden => "garden",
    Other => "other",
});

text_enum!(Priority {
    Low => "low",
    Medium => "medium",
    High => "high",
    Urgent => "urgent",
});

text_enum!(IssueStatus {
    Pending => "pending",
    Assigned => "assigned",
    InProgress => "in-progress",
    Resolved => "resolved",
    Closed => "closed",
    Cancelled => "cancelled",
});

impl IssueStatus {
    /// Whether the issue no longer needs work.
    pub fn is_finished(&self) -> bool {
        matches!(self, IssueStatus::Resolved | IssueStatus::Closed)
    }
}

text_enum!(TimelineStatus {
    Reported => "reported",
    Assigned => "assigned",
    Accepted => "accepted",
    Rejected => "rejected",
    InProgress => "in-progress",
    Resolved => "resolved",
    Closed => "closed",
    Cancelled => "cancelled",
    Pending => "pending",
});

impl From<IssueStatus> for TimelineStatus {
    fn from(status: IssueStatus) -> Self {
        match status {
            IssueStatus::Pending => TimelineStatus::Pending,
            IssueStatus::Assigned => TimelineStatus::Assigned,
            IssueStatus::InProgress => TimelineStatus::InProgress,
            IssueStatus::Resolved => TimelineStatus::Resolved,
            IssueStatus::Closed => TimelineStatus::Closed,
            IssueStatus::Cancelled => TimelineStatus::Cancelled,
        }
    }
}

text_enum!(EmergencyType {
    Medical => "medical",
    Fire => "fire",
    Theft => "theft",
    Security => "security",
    Structural => "structural",
});

fn check_text_enum<T: FromStr>(value: &str, code: &'static str) -> Result<(), ValidationError> {
    match T::from_str(value) {
        Ok(_) => Ok(()),
        Err(_) => {
            let mut err = ValidationError::new(code);
            err.message = Some(Cow::Owned(format!("{} is not allowed here", value)));
            err.add_param("value".into(), &value);
            Err(err)
        }
    }
}

pub fn validate_role(value: &str) -> Result<(), ValidationError> {
    check_text_enum::<Role>(value, "invalid_role")
}

pub fn validate_availability(value: &str) -> Result<(), ValidationError> {
    check_text_enum::<Availability>(value, "invalid_availability")
}

pub fn validate_skills(values: &Vec<String>) -> Result<(), ValidationError> {
    for value in values {
        check_text_enum::<Skill>(value, "invalid_skill")?;
    }
    Ok(())
}

pub fn validate_bill_type(value: &str) -> Result<(), ValidationError> {
    check_text_enum::<BillType>(value, "invalid_bill_type")
}

pub fn validate_payment_method(value: &str) -> Result<(), ValidationError> {
    check_text_enum::<PaymentMethod>(value, "invalid_payment_method")
}

pub fn validate_proof_type(value: &str) -> Result<(), ValidationError> {
    check_text_enum::<ProofType>(value, "invalid_proof_type")
}

pub fn validate_dispute_kind(value: &str) -> Result<(), ValidationError> {
    check_text_enum::<DisputeKind>(value, "invalid_dispute_type")
}

pub fn validate_category(value: &str) -> Result<(), ValidationError> {
    check_text_enum::<IssueCategory>(value, "invalid_category")
}

pub fn validate_priority(value: &str) -> Result<(), ValidationError> {
    check_text_enum::<Priority>(value, "invalid_priority")
}

pub fn validate_issue_status(value: &str) -> Result<(), ValidationError> {
    check_text_enum::<IssueStatus>(value, "invalid_status")
}

pub fn validate_emergency_type(value: &str) -> Result<(), ValidationError> {
    check_text_enum::<EmergencyType>(value, "invalid_emergency_type")
}

/// Validates a required text after trimming it, the way the title and description of an issue are checked.
pub fn validate_not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        let mut err = ValidationError::new("blank");
        err.message = Some(Cow::Borrowed("must not be blank"));
        return Err(err);
    }
    Ok(())
}

/// Number of pages for `total` records.
pub fn total_pages(total: u64, page_size: u64) -> u64 {
    if page_size == 0 {
        return 0;
    }
    (total + page_size - 1) / page_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_enum_round_trip() {
        assert_eq!(IssueStatus::from_str("in-progress").unwrap(), IssueStatus::InProgress);
        assert_eq!(PaymentMethod::BankTransfer.as_str(), "bank_transfer");
        assert_eq!(format!("{}", Role::Technician), "technician");
        assert!(IssueStatus::from_str("in_progress").is_err());
        assert_eq!(BillType::values().len(), 7);
    }

    #[test]
    fn test_dispute_reason() {
        assert_eq!(DisputeKind::from_str("already-paid").unwrap().reason(), "Already Paid");
        assert_eq!(DisputeKind::PaidTwice.reason(), "Paid Twice");
        assert_eq!(DisputeKind::WrongSplit.reason(), "Wrong Bill Split");
        assert!(DisputeKind::from_str("Paid Twice").is_err());
    }

    #[test]
    fn test_validators() {
        assert!(validate_role("admin").is_ok());
        assert!(validate_role("superuser").is_err());
        assert!(validate_skills(&vec!["plumbing".to_string(), "security".to_string()]).is_ok());
        assert!(validate_skills(&vec!["welding".to_string()]).is_err());
        assert!(validate_not_blank("   ").is_err());
        assert!(PHONE_REGEX.is_match("+91 (22) 555-0101"));
        assert!(!PHONE_REGEX.is_match("call me"));
    }

    #[test]
    fn test_duplicate_regex() {
        assert!(DUPLICATE_REGEX.is_match("I was charged DOUBLE this month"));
        assert!(DUPLICATE_REGEX.is_match("Duplicate entry"));
        assert!(!DUPLICATE_REGEX.is_match("Paid Twice"));
    }

    #[test]
    fn test_service_error_downcast() {
        let err = ServiceError::not_found("Bill not found");
        assert_eq!(err.to_string(), "Bill not found");
        assert_eq!(
            err.downcast_ref::<ServiceError>(),
            Some(&ServiceError::NotFound { msg: "Bill not found".to_string() })
        );
    }

    #[test]
    fn test_total_pages() {
        assert_eq!(total_pages(0, 10), 0);
        assert_eq!(total_pages(10, 10), 1);
        assert_eq!(total_pages(11, 10), 2);
    }
}
