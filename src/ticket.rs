//! Ticket notifier: state-change reports to the external ticket backend.
//!
//! The backend is an opaque command configured through `TICKET_CMD`; when it
//! is not configured, notifications fall through to the main log. Subjects
//! are chosen per transition ("processing", "Finished cell", "Delivered",
//! "failed") so a repeated message on the same transition is benign.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::external::{env_bindings, CommandRunner};

#[cfg(test)]
use mockall::automock;

#[derive(Debug, Error, Clone)]
pub enum NotifyError {
    #[error("ticket transport failed: {0}")]
    Transport(String),
    #[error("ticket backend exited {status}: {stderr}")]
    Backend { status: i32, stderr: String },
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait TicketNotifier: Send + Sync {
    async fn notify(
        &self,
        run: &str,
        queue: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), NotifyError>;
}

/// Production notifier: runs the configured command template with the
/// message bound into its environment.
pub struct CommandNotifier<R: CommandRunner> {
    template: String,
    runner: R,
}

impl<R: CommandRunner> CommandNotifier<R> {
    pub fn new(template: String, runner: R) -> Self {
        CommandNotifier { template, runner }
    }
}

#[async_trait]
impl<R: CommandRunner> TicketNotifier for CommandNotifier<R> {
    async fn notify(
        &self,
        run: &str,
        queue: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), NotifyError> {
        let envs = env_bindings(&[
            ("run", run),
            ("queue", queue),
            ("subject", subject),
            ("body", body),
        ]);
        let output = self
            .runner
            .run_template(&self.template, &envs)
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        if output.success() {
            debug!(run, queue, subject, "ticket notification sent");
            Ok(())
        } else {
            Err(NotifyError::Backend {
                status: output.status_code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

/// Fallback when no ticket backend is configured: messages land in the main
/// log and nowhere else.
pub struct LogNotifier;

#[async_trait]
impl TicketNotifier for LogNotifier {
    async fn notify(
        &self,
        run: &str,
        queue: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), NotifyError> {
        tracing::info!(run, queue, subject, body, "ticket backend not configured");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Retry a notification with bounded exponential backoff. Used for the final
/// run report, where giving up has to be escalated by the caller.
pub async fn notify_with_retry(
    notifier: &dyn TicketNotifier,
    retry: &RetryConfig,
    run: &str,
    queue: &str,
    subject: &str,
    body: &str,
) -> Result<(), NotifyError> {
    let mut delay = retry.base_delay;
    let mut last_err = NotifyError::Transport("no attempts made".to_string());
    for attempt in 1..=retry.max_attempts {
        match notifier.notify(run, queue, subject, body).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(
                    run,
                    subject,
                    attempt,
                    max = retry.max_attempts,
                    error = %e,
                    "ticket notification failed"
                );
                last_err = e;
            }
        }
        if attempt < retry.max_attempts {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(retry.max_delay);
        }
    }
    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::{CommandOutput, MockCommandRunner};
    use mockall::predicate::{always, eq};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn command_notifier_binds_the_message() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run_template()
            .with(eq("notify-backend"), always())
            .times(1)
            .returning(|_, envs| {
                let envs = envs.to_vec();
                assert!(envs.contains(&("subject".to_string(), "new run".to_string())));
                assert!(envs.contains(&("queue".to_string(), "sequencing".to_string())));
                Ok(CommandOutput {
                    status_code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                })
            });
        let notifier = CommandNotifier::new("notify-backend".to_string(), runner);
        notifier
            .notify("20190226_TEST_00testrun", "sequencing", "new run", "details")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn backend_failure_is_an_error() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run_template().returning(|_, _| {
            Ok(CommandOutput {
                status_code: 2,
                stdout: String::new(),
                stderr: "queue unknown\n".to_string(),
            })
        });
        let notifier = CommandNotifier::new("notify-backend".to_string(), runner);
        let err = notifier.notify("run", "q", "s", "b").await.unwrap_err();
        assert!(matches!(err, NotifyError::Backend { status: 2, .. }));
    }

    struct FlakyNotifier {
        calls: AtomicU32,
        succeed_on: u32,
    }

    #[async_trait]
    impl TicketNotifier for FlakyNotifier {
        async fn notify(&self, _: &str, _: &str, _: &str, _: &str) -> Result<(), NotifyError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.succeed_on {
                Ok(())
            } else {
                Err(NotifyError::Transport("down".to_string()))
            }
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_failures() {
        let notifier = FlakyNotifier {
            calls: AtomicU32::new(0),
            succeed_on: 3,
        };
        notify_with_retry(&notifier, &fast_retry(), "run", "q", "s", "b")
            .await
            .unwrap();
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let notifier = FlakyNotifier {
            calls: AtomicU32::new(0),
            succeed_on: u32::MAX,
        };
        let err = notify_with_retry(&notifier, &fast_retry(), "run", "q", "s", "b")
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Transport(_)));
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 3);
    }
}
