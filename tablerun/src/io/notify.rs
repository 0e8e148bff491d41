//! Failure notification channel.
//!
//! When an agent attempt fails without debug output, its captured diagnostics
//! are handed to a [`Notifier`] instead of the terminal.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Local};
use tracing::{error, info};

use crate::io::config::NotifyConfig;
use crate::io::process::run_command_with_timeout;

const SEND_TIMEOUT: Duration = Duration::from_secs(60);
const SEND_OUTPUT_LIMIT_BYTES: usize = 16_000;

/// Diagnostics of one failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub subject: String,
    pub body: String,
}

pub trait Notifier {
    fn notify(&self, report: &FailureReport) -> Result<()>;
}

/// Writes the report to the diagnostic stream. Used when no recipients are configured.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, report: &FailureReport) -> Result<()> {
        error!(subject = %report.subject, "{}", report.body);
        Ok(())
    }
}

/// Pipes an RFC 822 message to a mail command such as `sendmail -t`.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    to: Vec<String>,
    from: Option<String>,
    command: Vec<String>,
}

impl CommandNotifier {
    pub fn new(cfg: &NotifyConfig) -> Self {
        Self {
            to: cfg.to.clone(),
            from: cfg.from.clone(),
            command: cfg.command.clone(),
        }
    }

    pub fn compose(&self, report: &FailureReport, date: DateTime<Local>) -> String {
        let mut message = String::new();
        message.push_str(&format!("To: {}\n", self.to.join(", ")));
        if let Some(from) = &self.from {
            message.push_str(&format!("From: {from}\n"));
        }
        message.push_str(&format!("Subject: {}\n", report.subject));
        message.push_str(&format!("Date: {}\n", date.to_rfc2822()));
        message.push_str("Content-Type: text/plain; charset=utf-8\n\n");
        message.push_str(&report.body);
        if !report.body.ends_with('\n') {
            message.push('\n');
        }
        message
    }
}

impl Notifier for CommandNotifier {
    fn notify(&self, report: &FailureReport) -> Result<()> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("notify.command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        let message = self.compose(report, Local::now());
        let output = run_command_with_timeout(
            cmd,
            Some(message.as_bytes()),
            SEND_TIMEOUT,
            SEND_OUTPUT_LIMIT_BYTES,
        )
        .with_context(|| format!("run notify command '{program}'"))?;
        if !output.succeeded() {
            return Err(anyhow!(
                "notify command failed with status {:?}: {}",
                output.status.code(),
                output.stderr_text().trim()
            ));
        }
        info!(recipients = self.to.len(), "failure report sent");
        Ok(())
    }
}

/// Mail when recipients are configured, log otherwise.
pub fn notifier_from_config(cfg: &NotifyConfig) -> Box<dyn Notifier> {
    if cfg.to.is_empty() {
        Box::new(LogNotifier)
    } else {
        Box::new(CommandNotifier::new(cfg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn report() -> FailureReport {
        FailureReport {
            subject: "tablerun: build failed on web-1".to_string(),
            body: "store unreachable".to_string(),
        }
    }

    #[test]
    fn compose_writes_headers_then_body() {
        let notifier = CommandNotifier::new(&NotifyConfig {
            to: vec!["ops@example.com".to_string(), "dev@example.com".to_string()],
            from: Some("tablerun@example.com".to_string()),
            command: vec!["sendmail".to_string(), "-t".to_string()],
        });
        let date = Local
            .with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
            .single()
            .expect("date");
        let message = notifier.compose(&report(), date);

        let (headers, body) = message.split_once("\n\n").expect("header separator");
        assert!(headers.starts_with("To: ops@example.com, dev@example.com\n"));
        assert!(headers.contains("From: tablerun@example.com\n"));
        assert!(headers.contains("Subject: tablerun: build failed on web-1\n"));
        assert!(headers.contains("Date: "));
        assert_eq!(body, "store unreachable\n");
    }

    #[test]
    fn command_receives_message_on_stdin() {
        let temp = tempfile::tempdir().expect("tempdir");
        let sink = temp.path().join("mail.txt");
        let notifier = CommandNotifier::new(&NotifyConfig {
            to: vec!["ops@example.com".to_string()],
            from: None,
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("cat > {}", sink.display()),
            ],
        });
        notifier.notify(&report()).expect("notify");
        let written = std::fs::read_to_string(&sink).expect("read");
        assert!(written.contains("Subject: tablerun: build failed on web-1"));
        assert!(written.ends_with("store unreachable\n"));
    }

    #[test]
    fn failing_command_is_an_error() {
        let notifier = CommandNotifier::new(&NotifyConfig {
            to: vec!["ops@example.com".to_string()],
            from: None,
            command: vec!["false".to_string()],
        });
        assert!(notifier.notify(&report()).is_err());
    }
}
