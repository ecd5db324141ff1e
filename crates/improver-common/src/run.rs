/// Submit-and-poll driver for one assistant run.
///
/// `submit` creates a thread, posts one user message and starts a run. `await_completion`
/// checks the run on a fixed interval up to a hard attempt ceiling, so the worst-case wait is
/// `poll_interval * (max_attempts - 1)` plus request time. Neither operation retries; retry
/// policy belongs to the caller.
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::Serialize;
use tracing::{debug, info};

use crate::assistant::{AssistantClientError, AssistantTransport, RunStatus};

/// Identifies a started run. Discarded once its reply has been captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct RunHandle {
    pub thread_id: String,
    pub run_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("assistant transport error: {0}")]
    Transport(#[from] AssistantClientError),

    #[error("assistant run {run_id} ended with status {status:?}: {detail}")]
    Assistant {
        run_id: String,
        status: RunStatus,
        detail: String,
    },

    #[error("assistant run {run_id} did not finish after {attempts} status checks")]
    Timeout { run_id: String, attempts: u32 },
}

/// Suspends the poll loop between status checks.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

pub struct AssistantRunner<T: ?Sized> {
    transport: Arc<T>,
    sleeper: Arc<dyn Sleeper>,
}

impl<T: ?Sized> Clone for AssistantRunner<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            sleeper: Arc::clone(&self.sleeper),
        }
    }
}

impl<T: AssistantTransport + ?Sized> AssistantRunner<T> {
    pub fn new(transport: Arc<T>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { transport, sleeper }
    }

    pub fn sleeper(&self) -> &Arc<dyn Sleeper> {
        &self.sleeper
    }

    /// Post `payload` (serialized as pretty JSON) together with `instructions` as a single user
    /// message on a fresh thread and start a run on it.
    pub async fn submit(
        &self,
        payload: &serde_json::Value,
        instructions: &str,
    ) -> Result<RunHandle, RunError> {
        let content = compose_message(payload, instructions)
            .map_err(AssistantClientError::InvalidJson)?;

        let thread = self.transport.create_thread().await?;
        self.transport.create_message(&thread.id, &content).await?;
        let run = self.transport.create_run(&thread.id).await?;

        info!(thread_id = %thread.id, run_id = %run.id, "assistant run started");
        Ok(RunHandle {
            thread_id: thread.id,
            run_id: run.id,
        })
    }

    /// Poll until the run is terminal and return the latest assistant message text.
    ///
    /// Performs at most `max_attempts` status checks (at least one) and sleeps
    /// `poll_interval` between consecutive checks.
    pub async fn await_completion(
        &self,
        handle: &RunHandle,
        poll_interval: Duration,
        max_attempts: u32,
    ) -> Result<String, RunError> {
        let max_attempts = max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let run = self
                .transport
                .retrieve_run(&handle.thread_id, &handle.run_id)
                .await?;
            debug!(run_id = %handle.run_id, attempt, status = ?run.status, "polled assistant run");

            match run.status {
                RunStatus::Completed => return self.latest_reply(handle).await,
                status if status.is_terminal() => {
                    let detail = run
                        .last_error
                        .map(|e| match (e.code, e.message) {
                            (Some(code), Some(message)) => format!("{code}: {message}"),
                            (None, Some(message)) => message,
                            (Some(code), None) => code,
                            (None, None) => "no error detail reported".to_string(),
                        })
                        .unwrap_or_else(|| "no error detail reported".to_string());
                    return Err(RunError::Assistant {
                        run_id: handle.run_id.clone(),
                        status,
                        detail,
                    });
                }
                _ => {}
            }

            if attempt < max_attempts {
                self.sleeper.sleep(poll_interval).await;
            }
        }

        Err(RunError::Timeout {
            run_id: handle.run_id.clone(),
            attempts: max_attempts,
        })
    }

    async fn latest_reply(&self, handle: &RunHandle) -> Result<String, RunError> {
        let messages = self.transport.list_messages(&handle.thread_id).await?;
        messages
            .data
            .iter()
            .find(|m| m.role == "assistant")
            .map(|m| m.text())
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| RunError::Assistant {
                run_id: handle.run_id.clone(),
                status: RunStatus::Completed,
                detail: "run completed without an assistant text message".to_string(),
            })
    }
}

fn compose_message(
    payload: &serde_json::Value,
    instructions: &str,
) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string_pretty(payload)?;
    Ok(format!("{}\n\n{json}", instructions.trim_end()))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    use crate::assistant::{MessageList, Run, RunLastError, Thread, ThreadMessage};

    #[derive(Default)]
    struct ScriptedTransport {
        statuses: Mutex<VecDeque<RunStatus>>,
        sticky: Option<RunStatus>,
        reply: Option<String>,
        posted: Mutex<Vec<String>>,
        checks: Mutex<u32>,
    }

    impl ScriptedTransport {
        fn with_statuses(statuses: &[RunStatus], reply: Option<&str>) -> Self {
            Self {
                statuses: Mutex::new(statuses.iter().copied().collect()),
                reply: reply.map(str::to_string),
                ..Self::default()
            }
        }

        fn stuck(status: RunStatus) -> Self {
            Self {
                sticky: Some(status),
                ..Self::default()
            }
        }

        fn checks(&self) -> u32 {
            *self.checks.lock().unwrap()
        }
    }

    impl AssistantTransport for ScriptedTransport {
        fn create_thread(&self) -> BoxFuture<'_, Result<Thread, AssistantClientError>> {
            Box::pin(async { Ok(Thread { id: "thread_1".into() }) })
        }

        fn create_message<'a>(
            &'a self,
            _thread_id: &'a str,
            content: &'a str,
        ) -> BoxFuture<'a, Result<ThreadMessage, AssistantClientError>> {
            Box::pin(async move {
                self.posted.lock().unwrap().push(content.to_string());
                Ok(ThreadMessage {
                    id: "msg_user".into(),
                    role: "user".into(),
                    content: vec![],
                })
            })
        }

        fn create_run<'a>(
            &'a self,
            _thread_id: &'a str,
        ) -> BoxFuture<'a, Result<Run, AssistantClientError>> {
            Box::pin(async {
                Ok(Run {
                    id: "run_1".into(),
                    status: RunStatus::Queued,
                    last_error: None,
                })
            })
        }

        fn retrieve_run<'a>(
            &'a self,
            _thread_id: &'a str,
            run_id: &'a str,
        ) -> BoxFuture<'a, Result<Run, AssistantClientError>> {
            Box::pin(async move {
                *self.checks.lock().unwrap() += 1;
                let status = self
                    .statuses
                    .lock()
                    .unwrap()
                    .pop_front()
                    .or(self.sticky)
                    .unwrap_or(RunStatus::InProgress);
                let last_error = (status == RunStatus::Failed).then(|| RunLastError {
                    code: Some("server_error".into()),
                    message: Some("model overloaded".into()),
                });
                Ok(Run {
                    id: run_id.to_string(),
                    status,
                    last_error,
                })
            })
        }

        fn list_messages<'a>(
            &'a self,
            _thread_id: &'a str,
        ) -> BoxFuture<'a, Result<MessageList, AssistantClientError>> {
            let reply = self.reply.clone();
            Box::pin(async move {
                let mut data = Vec::new();
                if let Some(text) = reply {
                    data.push(
                        serde_json::from_value(serde_json::json!({
                            "id": "msg_reply",
                            "role": "assistant",
                            "content": [{"type": "text", "text": {"value": text}}]
                        }))
                        .unwrap(),
                    );
                }
                Ok(MessageList { data })
            })
        }
    }

    #[derive(Default)]
    struct RecordingSleeper {
        slept: Mutex<Vec<Duration>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
            self.slept.lock().unwrap().push(duration);
            Box::pin(async {})
        }
    }

    type Fixture = (
        AssistantRunner<ScriptedTransport>,
        Arc<ScriptedTransport>,
        Arc<RecordingSleeper>,
    );

    fn runner(transport: ScriptedTransport) -> Fixture {
        let transport = Arc::new(transport);
        let sleeper = Arc::new(RecordingSleeper::default());
        let runner = AssistantRunner::new(Arc::clone(&transport), sleeper.clone());
        (runner, transport, sleeper)
    }

    fn handle() -> RunHandle {
        RunHandle {
            thread_id: "thread_1".into(),
            run_id: "run_1".into(),
        }
    }

    #[tokio::test]
    async fn submit_embeds_payload_after_instructions() {
        let (runner, transport, _) = runner(ScriptedTransport::default());
        let handle = runner
            .submit(&serde_json::json!({"headline": "Old"}), "Return ONLY JSON.\n")
            .await
            .unwrap();
        assert_eq!(handle.thread_id, "thread_1");
        assert_eq!(handle.run_id, "run_1");

        let posted = transport.posted.lock().unwrap();
        assert_eq!(posted.len(), 1);
        assert!(posted[0].starts_with("Return ONLY JSON.\n\n{"));
        assert!(posted[0].contains("\"headline\": \"Old\""));
    }

    #[tokio::test]
    async fn completed_run_returns_latest_assistant_text() {
        let (runner, transport, sleeper) = runner(ScriptedTransport::with_statuses(
            &[RunStatus::Queued, RunStatus::InProgress, RunStatus::Completed],
            Some(r#"{"headline":"New"}"#),
        ));
        let reply = runner
            .await_completion(&handle(), Duration::from_secs(2), 30)
            .await
            .unwrap();
        assert_eq!(reply, r#"{"headline":"New"}"#);
        assert_eq!(transport.checks(), 3);
        assert_eq!(
            *sleeper.slept.lock().unwrap(),
            vec![Duration::from_secs(2), Duration::from_secs(2)]
        );
    }

    #[tokio::test]
    async fn stuck_run_times_out_after_exactly_max_attempts() {
        let (runner, transport, sleeper) = runner(ScriptedTransport::stuck(RunStatus::InProgress));
        let err = runner
            .await_completion(&handle(), Duration::from_millis(10), 3)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Timeout { attempts: 3, .. }));
        assert_eq!(transport.checks(), 3);
        assert_eq!(sleeper.slept.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_run_carries_provider_detail() {
        let (runner, _, _) = runner(ScriptedTransport::with_statuses(&[RunStatus::Failed], None));
        let err = runner
            .await_completion(&handle(), Duration::from_millis(10), 5)
            .await
            .unwrap_err();
        match err {
            RunError::Assistant { status, detail, .. } => {
                assert_eq!(status, RunStatus::Failed);
                assert_eq!(detail, "server_error: model overloaded");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn expired_run_is_an_assistant_error() {
        let (runner, _, _) = runner(ScriptedTransport::with_statuses(&[RunStatus::Expired], None));
        let err = runner
            .await_completion(&handle(), Duration::from_millis(10), 5)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RunError::Assistant {
                status: RunStatus::Expired,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn completed_run_without_reply_is_an_assistant_error() {
        let (runner, _, _) =
            runner(ScriptedTransport::with_statuses(&[RunStatus::Completed], None));
        let err = runner
            .await_completion(&handle(), Duration::from_millis(10), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Assistant { .. }));
    }
}
