//! Runs the external analysis agents.
//!
//! An agent is a script in the agents directory, started with the configured interpreter. It reads its input as JSON on stdin or from its arguments and prints a JSON document on stdout. When no agents directory is configured, the built-in technician matcher and duplicate detector produce the same documents.

pub mod duplicate;

use crate::model::assignment::{self, AgentRequest, AssignmentNotice};
use crate::model::issue::Issue;
use crate::model::user::UserBrief;
use crate::AppConfig;
use custom_error::custom_error;
use log::{debug, info, warn};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use uuid::Uuid;

pub const CATEGORY_AGENT: &str = "categoryagent.py";
pub const BILLING_AGENT: &str = "billingagent.py";

custom_error! {
#[derive(PartialEq)]
pub AgentError
    Spawn{program: String, reason: String} = "Failed to start {program}: {reason}",
    Timeout{seconds: u64} = "The agent did not finish within {seconds} seconds",
    Exit{code: i32, stderr: String} = "The agent exited with code {code}: {stderr}",
    Io{reason: String} = "Failed to talk to the agent: {reason}",
    Rejected{reason: String} = "{reason}",
}

#[derive(Debug, Clone)]
pub struct AgentRunner {
    pub python: String,
    pub agents_dir: PathBuf,
    pub timeout: Duration,
}

impl AgentRunner {
    /// `None` when no agents directory is configured.
    pub fn from_config(config: &AppConfig) -> Option<AgentRunner> {
        config.agents_dir.as_ref().map(|dir| AgentRunner {
            python: config.python.clone(),
            agents_dir: dir.clone(),
            timeout: config.agent_timeout,
        })
    }

    /// Runs a script and returns what it printed. The child is killed when it runs past the timeout.
    pub async fn run(
        &self,
        script: &str,
        args: &[&str],
        input: Option<Vec<u8>>,
    ) -> Result<String, AgentError> {
        let script_path = self.agents_dir.join(script);
        debug!("Running {} {} {:?}", self.python, script_path.display(), args);

        let mut child = Command::new(&self.python)
            .arg(&script_path)
            .args(args)
            .current_dir(&self.agents_dir)
            .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Spawn {
                program: format!("{} {}", self.python, script_path.display()),
                reason: e.to_string(),
            })?;

        // The input is written from its own task, so an agent which never reads stdin can't hold the request past the timeout.
        let writer = match (input, child.stdin.take()) {
            (Some(input), Some(mut stdin)) => Some(tokio::spawn(async move {
                let result = stdin.write_all(&input).await;
                // Closing stdin tells the agent that the input is complete.
                drop(stdin);
                result
            })),
            _ => None,
        };

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output.map_err(|e| AgentError::Io { reason: e.to_string() })?,
            Err(_) => {
                if let Some(writer) = &writer {
                    writer.abort();
                }
                warn!("{} timed out after {:?}.", script, self.timeout);
                return Err(AgentError::Timeout {
                    seconds: self.timeout.as_secs(),
                });
            }
        };

        if let Some(writer) = writer {
            match writer.await {
                Ok(Ok(())) => {}
                // The agent may exit without reading all of its input, its exit status decides.
                Ok(Err(e)) => debug!("{} didn't read all of its input: {}", script, e),
                Err(e) => debug!("Writing the input of {} was cancelled: {}", script, e),
            }
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!("{} failed: {}", script, stderr);
            return Err(AgentError::Exit {
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Agents may print progress before their result. Tries the whole output first, then the last line holding a JSON object, and keeps the raw text otherwise.
pub fn parse_json_output(output: &str) -> serde_json::Value {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(output.trim()) {
        if value.is_object() {
            return value;
        }
    }

    for line in output.lines().rev() {
        let line = line.trim();
        if line.starts_with('{') && line.ends_with('}') {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
                return value;
            }
            break;
        }
    }

    json!({ "raw_output": output })
}

/// Asks the matching agent for a technician. The result is either an assignment document or an object with an `error` field.
pub async fn run_category_agent(
    config: &AppConfig,
    request: &AgentRequest,
) -> Result<serde_json::Value, AgentError> {
    let runner = match AgentRunner::from_config(config) {
        Some(runner) => runner,
        None => return Ok(assignment::assign(request)),
    };

    let input = serde_json::to_vec(request).map_err(|e| AgentError::Io {
        reason: e.to_string(),
    })?;
    let output = runner.run(CATEGORY_AGENT, &[], Some(input)).await?;

    match serde_json::from_str::<serde_json::Value>(output.trim()) {
        Ok(value) => Ok(value),
        Err(_) => {
            warn!("Failed to parse the output of the matching agent: {}", output);
            Ok(json!({ "error": "Failed to parse agent output", "raw_output": output }))
        }
    }
}

/// A technician picked by the matching agent, checked against the candidates it was offered.
#[derive(Debug, Clone)]
pub struct TechnicianMatch {
    /// The document as the agent printed it.
    pub document: serde_json::Value,
    pub notice: AssignmentNotice,
    pub technician_id: Uuid,
}

pub async fn match_technician(
    config: &AppConfig,
    issue: &Issue,
    technicians: &[UserBrief],
) -> Result<TechnicianMatch, AgentError> {
    let request = AgentRequest::new(issue, technicians);
    let document = run_category_agent(config, &request).await?;

    if let Some(err) = document.get("error") {
        let reason = err.as_str().map(String::from).unwrap_or_else(|| err.to_string());
        return Err(AgentError::Rejected { reason });
    }

    let notice = serde_json::from_value::<AssignmentNotice>(document.clone()).map_err(|e| {
        warn!("Unexpected output of the matching agent: {}", e);
        AgentError::Rejected {
            reason: "Failed to parse agent output".to_string(),
        }
    })?;

    let technician_id = match Uuid::parse_str(&notice.technician.id) {
        Ok(id) if technicians.iter().any(|t| t.id == id) => id,
        _ => {
            return Err(AgentError::Rejected {
                reason: format!("The agent picked an unknown technician: {}", notice.technician.id),
            })
        }
    };

    Ok(TechnicianMatch {
        document,
        notice,
        technician_id,
    })
}

fn billing_error(csv_file: &str, error: &str) -> serde_json::Value {
    json!({
        "error": error,
        "analysis_type": duplicate::ANALYSIS_TYPE,
        "csv_file": csv_file,
    })
}

async fn detect_in_background(csv: &Path) -> serde_json::Value {
    let csv_file = csv.display().to_string();
    let path = csv.to_path_buf();
    let result = tokio::task::spawn_blocking(move || duplicate::detect_duplicates(&path)).await;

    match result {
        Ok(Ok(report)) => match serde_json::to_value(report) {
            Ok(value) => value,
            Err(e) => billing_error(&csv_file, &e.to_string()),
        },
        Ok(Err(e)) => billing_error(&csv_file, &e.to_string()),
        Err(e) => billing_error(&csv_file, &e.to_string()),
    }
}

/// Runs the duplicate detection on the billing export. Failures of the analysis itself are reported inside the document, only a failing agent process is an error.
pub async fn run_billing_agent(config: &AppConfig) -> Result<serde_json::Value, AgentError> {
    let csv = match &config.billing_csv {
        Some(csv) => csv,
        None => return Ok(billing_error("", "No billing export is configured")),
    };

    match AgentRunner::from_config(config) {
        Some(runner) => {
            let csv_file = csv.display().to_string();
            let output = runner.run(BILLING_AGENT, &[&csv_file], None).await?;
            info!("The billing agent analysed {}.", csv_file);
            Ok(parse_json_output(&output))
        }
        None => Ok(detect_in_background(csv).await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::assignment::AgentTechnician;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_parse_json_output() {
        let pretty = "{\n  \"total_records\": 3\n}\n";
        assert_eq!(parse_json_output(pretty)["total_records"], 3);

        let noisy = "Loading model...\nWarning: GOOGLE_API_KEY not found\n{\"total_records\": 5}\n";
        assert_eq!(parse_json_output(noisy)["total_records"], 5);

        let plain = "Nothing to report";
        assert_eq!(parse_json_output(plain)["raw_output"], "Nothing to report");

        let broken = "{\"total_records\": }";
        assert_eq!(parse_json_output(broken)["raw_output"], broken);
    }

    #[tokio::test]
    async fn test_builtin_category_agent() {
        let config = AppConfig::new("secret");
        let request = AgentRequest {
            title: "Sparks from the switch board".to_string(),
            description: "The switch board in the hall sparks when used".to_string(),
            category: "electrical".to_string(),
            technicians: vec![AgentTechnician {
                id: "tech-1".to_string(),
                name: "Amit Singh".to_string(),
                phone: "+91 98765 43211".to_string(),
                email: "amit.electrician@societyhub.com".to_string(),
                skills: vec!["electrical".to_string()],
                hourly_rate: Some(900.0),
                availability: "available".to_string(),
            }],
        };

        let value = run_category_agent(&config, &request).await.unwrap();
        assert_eq!(value["technician"]["name"], "Amit Singh");
        assert_eq!(value["estimatedTime"], "1-3 hours (Urgent)");
    }

    fn technician(name: &str, skills: &[&str], rate: f64) -> UserBrief {
        UserBrief {
            id: Uuid::new_v4(),
            name: name.to_string(),
            email: format!("{}@societyhub.com", name.to_lowercase().replace(' ', ".")),
            phone: "+91 98765 43210".to_string(),
            flat_number: None,
            building: None,
            skills: skills.iter().map(|s| s.to_string()).collect(),
            hourly_rate: rate,
            availability: "available".to_string(),
        }
    }

    #[tokio::test]
    async fn test_match_technician() {
        let config = AppConfig::new("secret");
        let issue = crate::model::issue::tests::sample_issue();
        let technicians = vec![
            technician("Amit Singh", &["electrical"], 900.0),
            technician("Rajesh Kumar", &["plumbing"], 800.0),
        ];

        let matched = match_technician(&config, &issue, &technicians).await.unwrap();
        assert_eq!(matched.technician_id, technicians[1].id);
        assert_eq!(matched.notice.technician.name, "Rajesh Kumar");
        assert_eq!(matched.document["technician"]["name"], "Rajesh Kumar");
    }

    #[tokio::test]
    async fn test_builtin_billing_agent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bills.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(
            b"Bill ID,Resident Name,Amount,Status,Date,Comments\nB1,Sneha Rao,1200,Paid,2025-07-16,\nB2,Sneha Rao,1200,Paid,2025-07-16,\n",
        )
        .unwrap();

        let mut config = AppConfig::new("secret");
        let value = run_billing_agent(&config).await.unwrap();
        assert_eq!(value["error"], "No billing export is configured");

        config.billing_csv = Some(path);
        let value = run_billing_agent(&config).await.unwrap();
        assert_eq!(value["duplicate_records"], 2);
        assert_eq!(value["duplicate_details"][0]["bill_ids"][1], "B2");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_with_unread_input() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("sleepy.sh"), "sleep 5\n").unwrap();
        let runner = AgentRunner {
            python: "/bin/sh".to_string(),
            agents_dir: dir.path().to_path_buf(),
            timeout: Duration::from_secs(1),
        };

        // Far more than a pipe buffer holds, so writing it blocks until the agent reads.
        let input = vec![b'x'; 4 * 1024 * 1024];
        let started = std::time::Instant::now();
        let err = runner.run("sleepy.sh", &[], Some(input)).await.unwrap_err();
        assert_eq!(err, AgentError::Timeout { seconds: 1 });
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_echoes_input() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("echo.sh"), "cat\n").unwrap();
        let runner = AgentRunner {
            python: "/bin/sh".to_string(),
            agents_dir: dir.path().to_path_buf(),
            timeout: Duration::from_secs(5),
        };

        let output = runner
            .run("echo.sh", &[], Some(b"{\"technician\": \"t1\"}".to_vec()))
            .await
            .unwrap();
        assert_eq!(parse_json_output(&output)["technician"], "t1");
    }

    #[tokio::test]
    async fn test_missing_interpreter() {
        let mut config = AppConfig::new("secret");
        config.agents_dir = Some(std::env::temp_dir());
        config.python = "societyhub-no-such-python".to_string();

        let runner = AgentRunner::from_config(&config).unwrap();
        let err = runner.run(CATEGORY_AGENT, &[], Some(b"{}".to_vec())).await.unwrap_err();
        assert!(matches!(err, AgentError::Spawn { .. }));
    }
}
