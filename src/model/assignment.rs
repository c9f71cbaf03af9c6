//! Technician matching for maintenance issues and the assignment document shown to the resident.
//!
//! The document has the same shape whether it comes from an external matching agent or from [`assign`], which is the built-in matcher used when no agent is configured.

use super::core::{DEFAULT_CURRENCY, DEFAULT_HOURLY_RATE};
use super::issue::Issue;
use super::user::UserBrief;
use super::util::format_amount;
use poem_openapi::Object;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const ASSIGNMENT_TYPE: &str = "technician_assignment";

/// Rate assumed for a technician who didn't publish one.
const UNKNOWN_HOURLY_RATE: f64 = 1000.0;
const AFFORDABLE_HOURLY_RATE: f64 = 600.0;
const URGENT_KEYWORDS: [&str; 6] = ["emergency", "urgent", "broken", "not working", "leak", "spark"];

/// A candidate as it is sent to the matching agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentTechnician {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    pub phone: String,
    pub email: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(rename = "hourlyRate")]
    pub hourly_rate: Option<f64>,
    pub availability: String,
}

impl From<&UserBrief> for AgentTechnician {
    fn from(user: &UserBrief) -> Self {
        AgentTechnician {
            id: user.id.to_string(),
            name: user.name.clone(),
            phone: user.phone.clone(),
            email: user.email.clone(),
            skills: user.skills.clone(),
            hourly_rate: Some(user.hourly_rate),
            availability: user.availability.clone(),
        }
    }
}

/// What the matching agent reads on stdin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRequest {
    pub title: String,
    pub description: String,
    pub category: String,
    pub technicians: Vec<AgentTechnician>,
}

impl AgentRequest {
    pub fn new(issue: &Issue, technicians: &[UserBrief]) -> Self {
        AgentRequest {
            title: issue.title.clone(),
            description: issue.description.clone(),
            category: issue.category.clone(),
            technicians: technicians.iter().map(AgentTechnician::from).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Object)]
#[oai(rename_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub struct AssignedTechnician {
    pub id: String,
    pub name: String,
    pub phone: String,
    pub email: String,
    pub skills: Vec<String>,
    pub hourly_rate: f64,
    pub availability: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Object)]
pub struct IssueSummary {
    pub title: String,
    pub description: String,
    pub category: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Object)]
pub struct EstimatedCost {
    pub estimated_hours: f64,
    pub hourly_rate: f64,
    pub total_cost: f64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Object)]
pub struct AssignmentAction {
    #[oai(rename = "type")]
    #[serde(rename = "type")]
    pub kind: String,
    pub label: String,
    pub description: String,
}

/// The assignment document returned by the assign and lookup endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Object)]
#[oai(rename_all = "camelCase")]
#[serde(rename_all = "camelCase")]
pub struct AssignmentNotice {
    #[oai(rename = "type")]
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    pub technician: AssignedTechnician,
    pub issue: IssueSummary,
    pub estimated_time: String,
    pub estimated_cost: EstimatedCost,
    pub actions: Vec<AssignmentAction>,
}

impl AssignmentNotice {
    pub fn new(technician: AssignedTechnician, issue: IssueSummary) -> Self {
        AssignmentNotice {
            kind: ASSIGNMENT_TYPE.to_string(),
            title: format!("Technician Assigned: {}", technician.name),
            message: format!(
                "{} has been assigned to your issue. They specialize in {} and charge ₹{}/hour.",
                technician.name,
                technician.skills.join(", "),
                format_amount(technician.hourly_rate)
            ),
            estimated_time: estimated_time(&issue.category, &issue.title, &issue.description),
            estimated_cost: estimated_cost(&issue.category, technician.hourly_rate),
            actions: default_actions(),
            technician,
            issue,
        }
    }

    /// The document of an issue which already has an assignee.
    pub fn from_assignee(issue: &Issue, assignee: &UserBrief) -> Self {
        AssignmentNotice::new(
            AssignedTechnician {
                id: assignee.id.to_string(),
                name: assignee.name.clone(),
                phone: assignee.phone.clone(),
                email: assignee.email.clone(),
                skills: assignee.skills.clone(),
                hourly_rate: assignee.hourly_rate,
                availability: assignee.availability.clone(),
            },
            IssueSummary {
                title: issue.title.clone(),
                description: issue.description.clone(),
                category: issue.category.clone(),
            },
        )
    }
}

pub fn default_actions() -> Vec<AssignmentAction> {
    [
        ("accept", "Accept Assignment", "Accept this technician for your issue"),
        ("reschedule", "Request Reschedule", "Request a different time slot"),
        ("reject", "Reject & Request Another", "Request a different technician"),
    ]
    .iter()
    .map(|(kind, label, description)| AssignmentAction {
        kind: kind.to_string(),
        label: label.to_string(),
        description: description.to_string(),
    })
    .collect()
}

/// Typical duration of a job, flagged when the title or description sounds urgent.
pub fn estimated_time(category: &str, title: &str, description: &str) -> String {
    let base = match category.to_lowercase().as_str() {
        "plumbing" => "2-4 hours",
        "electrical" => "1-3 hours",
        "carpentry" => "2-6 hours",
        "cleaning" => "1-2 hours",
        "security" => "1-2 hours",
        "elevator" => "4-8 hours",
        "parking" => "1-3 hours",
        "garden" => "2-4 hours",
        _ => "2-4 hours",
    };

    let title = title.to_lowercase();
    let description = description.to_lowercase();
    let urgent = URGENT_KEYWORDS
        .iter()
        .any(|k| title.contains(k) || description.contains(k));

    if urgent {
        format!("{} (Urgent)", base)
    } else {
        base.to_string()
    }
}

pub fn estimated_cost(category: &str, hourly_rate: f64) -> EstimatedCost {
    let hours = match category.to_lowercase().as_str() {
        "plumbing" => 2.5,
        "electrical" => 2.0,
        "carpentry" => 3.0,
        "cleaning" => 1.5,
        "security" => 1.5,
        "elevator" => 6.0,
        "parking" => 2.0,
        "garden" => 2.5,
        _ => 2.5,
    };

    EstimatedCost {
        estimated_hours: hours,
        hourly_rate,
        total_cost: hourly_rate * hours,
        currency: DEFAULT_CURRENCY.to_string(),
    }
}

/// Skill match first, then availability, then an affordable rate.
pub fn score_technician(category: &str, technician: &AgentTechnician) -> i32 {
    let category = category.to_lowercase();
    let skills = technician
        .skills
        .iter()
        .map(|s| s.to_lowercase())
        .collect::<Vec<String>>();

    let mut score = 0;
    if skills.contains(&category) {
        score += 3;
    } else if skills.iter().any(|s| category.contains(s.as_str())) {
        score += 2;
    }

    if technician.availability == "available" {
        score += 1;
    }

    if technician.hourly_rate.unwrap_or(UNKNOWN_HOURLY_RATE) < AFFORDABLE_HOURLY_RATE {
        score += 1;
    }

    score
}

/// The first technician with the strictly best positive score. Without one, a generalist who does both plumbing and electrical work, else the first candidate.
pub fn pick_technician<'a>(
    category: &str,
    technicians: &'a [AgentTechnician],
) -> Option<&'a AgentTechnician> {
    let mut best: Option<&AgentTechnician> = None;
    let mut best_score = 0;
    for technician in technicians {
        let score = score_technician(category, technician);
        if score > best_score {
            best_score = score;
            best = Some(technician);
        }
    }

    best.or_else(|| {
        technicians.iter().find(|t| {
            t.skills.iter().any(|s| s == "plumbing") && t.skills.iter().any(|s| s == "electrical")
        })
    })
    .or_else(|| technicians.first())
}

/// The built-in matcher. Produces the same JSON an external agent would print.
pub fn assign(request: &AgentRequest) -> serde_json::Value {
    let category = request.category.to_lowercase();
    match pick_technician(&category, &request.technicians) {
        Some(technician) => {
            let notice = AssignmentNotice::new(
                AssignedTechnician {
                    id: technician.id.clone(),
                    name: technician.name.clone(),
                    phone: technician.phone.clone(),
                    email: technician.email.clone(),
                    skills: technician.skills.clone(),
                    hourly_rate: technician.hourly_rate.unwrap_or(DEFAULT_HOURLY_RATE),
                    availability: technician.availability.clone(),
                },
                IssueSummary {
                    title: request.title.clone(),
                    description: request.description.clone(),
                    category,
                },
            );
            match serde_json::to_value(&notice) {
                Ok(value) => value,
                Err(e) => json!({ "error": format!("Error while processing issue: {}", e) }),
            }
        }
        None => json!({
            "error": "No suitable technician found for this category",
            "category": category,
            "available_technicians": request.technicians.len(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn technician(id: &str, skills: &[&str], rate: Option<f64>, availability: &str) -> AgentTechnician {
        AgentTechnician {
            id: id.to_string(),
            name: format!("Technician {}", id),
            phone: "+91 98765 43210".to_string(),
            email: format!("{}@societyhub.com", id),
            skills: skills.iter().map(|s| s.to_string()).collect(),
            hourly_rate: rate,
            availability: availability.to_string(),
        }
    }

    #[test]
    fn test_score_technician() {
        let plumber = technician("t1", &["plumbing"], Some(800.0), "available");
        assert_eq!(score_technician("plumbing", &plumber), 4);
        assert_eq!(score_technician("Plumbing", &plumber), 4);

        let cheap_busy = technician("t2", &["cleaning"], Some(500.0), "busy");
        assert_eq!(score_technician("plumbing", &cheap_busy), 1);

        let no_rate = technician("t3", &["garden"], None, "offline");
        assert_eq!(score_technician("plumbing", &no_rate), 0);
    }

    #[test]
    fn test_pick_technician() {
        let technicians = vec![
            technician("t1", &["electrical"], Some(900.0), "available"),
            technician("t2", &["plumbing"], Some(800.0), "available"),
            technician("t3", &["plumbing", "electrical"], Some(750.0), "available"),
        ];
        // t2 and t3 tie, the first one wins.
        assert_eq!(pick_technician("plumbing", &technicians).unwrap().id, "t2");

        let offline = vec![
            technician("t1", &["garden"], None, "offline"),
            technician("t2", &["plumbing", "electrical"], None, "offline"),
        ];
        assert_eq!(pick_technician("elevator", &offline).unwrap().id, "t2");

        let nobody = vec![technician("t1", &["garden"], None, "offline")];
        assert_eq!(pick_technician("elevator", &nobody).unwrap().id, "t1");
        assert!(pick_technician("elevator", &[]).is_none());
    }

    #[test]
    fn test_estimated_time() {
        assert_eq!(estimated_time("electrical", "Fan is slow", "Ceiling fan runs slowly"), "1-3 hours");
        assert_eq!(
            estimated_time("plumbing", "Kitchen sink", "Persistent LEAK under the sink"),
            "2-4 hours (Urgent)"
        );
        assert_eq!(estimated_time("roofing", "Roof", "Needs a check"), "2-4 hours");
    }

    #[test]
    fn test_estimated_cost() {
        let cost = estimated_cost("plumbing", 800.0);
        assert_eq!(cost.estimated_hours, 2.5);
        assert_eq!(cost.total_cost, 2000.0);
        assert_eq!(cost.currency, "INR");
        assert_eq!(estimated_cost("unknown", 100.0).total_cost, 250.0);
    }

    #[test]
    fn test_assign() {
        let request = AgentRequest {
            title: "Water leak in kitchen sink".to_string(),
            description: "Water is dripping under the sink".to_string(),
            category: "plumbing".to_string(),
            technicians: vec![technician("t1", &["plumbing"], Some(800.0), "available")],
        };

        let value = assign(&request);
        assert_eq!(value["type"], "technician_assignment");
        assert_eq!(value["title"], "Technician Assigned: Technician t1");
        assert_eq!(
            value["message"],
            "Technician t1 has been assigned to your issue. They specialize in plumbing and charge ₹800/hour."
        );
        assert_eq!(value["technician"]["hourlyRate"], 800.0);
        assert_eq!(value["estimatedTime"], "2-4 hours (Urgent)");
        assert_eq!(value["estimatedCost"]["total_cost"], 2000.0);
        assert_eq!(value["actions"][2]["type"], "reject");

        let notice: AssignmentNotice = serde_json::from_value(value).unwrap();
        assert_eq!(notice.technician.id, "t1");

        let empty = AgentRequest {
            technicians: vec![],
            ..request
        };
        assert_eq!(assign(&empty)["error"], "No suitable technician found for this category");
    }
}
