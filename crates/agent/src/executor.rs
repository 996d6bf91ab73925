//! Step executor — runs one plan step against the completion service.
//!
//! One `chat_start` per step. Frames are routed into the transcript until
//! the reply completes, fails, or the step timeout fires. A step never
//! returns an error: timeouts, upstream errors, and lost connections become
//! sentinel results the evaluator can score.
//!
//! Tool calls embedded in the reply as
//! `<tool_call>{"name": ..., "parameters": {...}}</tool_call>` are executed
//! afterwards, one at a time, in textual order, up to a per-step cap.

use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use regex::Regex;
use serde_json::Value;
use stepwise_config::EngineConfig;
use stepwise_core::error::ToolError;
use stepwise_core::event::{EngineEvent, EventBus};
use stepwise_core::message::Message;
use stepwise_core::plan::Step;
use stepwise_core::protocol::ClientFrame;
use stepwise_core::tool::{ToolInvocation, ToolRegistry, ToolResult};
use stepwise_transport::Session;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::lock;
use crate::router::{RouteOutcome, StreamRouter};

static TOOL_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<tool_call>\s*(.*?)\s*</tool_call>").expect("valid tool call pattern")
});

/// Operator control over a running task, observed between and during steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunControl {
    #[default]
    Run,
    Pause,
    Stop,
}

/// How a step request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    TimedOut { after_secs: u64 },
    UpstreamError(String),
    Disconnected,
    Interrupted,
}

/// Everything that happened while executing one step.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub step_id: String,
    pub outcome: StepOutcome,
    /// Reply text exactly as completed.
    pub response: String,
    /// Executed tools, by name, in order.
    pub tool_results: Vec<(String, ToolResult)>,
    pub malformed_calls: Vec<String>,
    /// Tool calls dropped by the per-step cap.
    pub ignored_tool_calls: usize,
    /// The stop tool cut tool processing short.
    pub stopped_by_tool: bool,
}

impl StepReport {
    fn new(step_id: &str, outcome: StepOutcome) -> Self {
        Self {
            step_id: step_id.to_string(),
            outcome,
            response: String::new(),
            tool_results: Vec::new(),
            malformed_calls: Vec::new(),
            ignored_tool_calls: 0,
            stopped_by_tool: false,
        }
    }

    /// True for anything other than a completed reply.
    pub fn is_degraded(&self) -> bool {
        self.outcome != StepOutcome::Completed
    }

    /// The text handed to the evaluator and stored as the step result.
    ///
    /// Degraded steps yield a sentinel that always mentions "error".
    pub fn result_text(&self) -> String {
        match &self.outcome {
            StepOutcome::TimedOut { after_secs } => {
                format!("Error: step timed out after {after_secs}s without a response")
            }
            StepOutcome::UpstreamError(error) => format!("Error: step failed: {error}"),
            StepOutcome::Disconnected => {
                "Error: connection lost before the step completed".to_string()
            }
            StepOutcome::Interrupted => "Error: step interrupted by stop request".to_string(),
            StepOutcome::Completed => {
                let mut lines = vec![strip_tool_calls(&self.response)];
                for (name, result) in &self.tool_results {
                    let verdict = if result.success { "succeeded" } else { "failed" };
                    lines.push(format!("Tool {name} {verdict}: {}", result.message));
                }
                for reason in &self.malformed_calls {
                    lines.push(format!("Skipped malformed tool call: {reason}"));
                }
                if self.ignored_tool_calls > 0 {
                    lines.push(format!(
                        "Tool call limit reached: {} call(s) ignored",
                        self.ignored_tool_calls
                    ));
                }
                lines.retain(|l| !l.is_empty());
                lines.join("\n")
            }
        }
    }
}

/// Extract embedded tool calls in textual order.
///
/// Each match is either an invocation or a [`ToolError::MalformedCall`]
/// explaining why it was unusable.
pub fn extract_tool_calls(text: &str) -> Vec<Result<ToolInvocation, ToolError>> {
    TOOL_CALL
        .captures_iter(text)
        .map(|caps| {
            let body = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let value: Value = serde_json::from_str(body)
                .map_err(|e| ToolError::MalformedCall(format!("invalid JSON: {e}")))?;
            let Value::Object(mut map) = value else {
                return Err(ToolError::MalformedCall("call is not a JSON object".into()));
            };
            let name = match map.remove("name") {
                Some(Value::String(name)) if !name.trim().is_empty() => name,
                _ => return Err(ToolError::MalformedCall("missing tool name".into())),
            };
            let parameters = match map.remove("parameters") {
                None | Some(Value::Null) => Value::Object(serde_json::Map::new()),
                Some(params @ Value::Object(_)) => params,
                Some(_) => {
                    return Err(ToolError::MalformedCall(format!(
                        "parameters for '{name}' are not an object"
                    )));
                }
            };
            let id = map.remove("id").and_then(|v| v.as_str().map(str::to_string));
            Ok(ToolInvocation {
                name,
                parameters,
                id,
            })
        })
        .collect()
}

fn strip_tool_calls(text: &str) -> String {
    TOOL_CALL.replace_all(text, "").trim().to_string()
}

/// Executes plan steps over a session.
pub struct StepExecutor {
    model: String,
    timeout: Duration,
    max_tool_calls: usize,
    stop_tool: String,
    tools: Arc<ToolRegistry>,
    events: Arc<EventBus>,
}

impl StepExecutor {
    pub fn new(model: impl Into<String>, tools: Arc<ToolRegistry>, events: Arc<EventBus>) -> Self {
        Self {
            model: model.into(),
            timeout: Duration::from_secs(30),
            max_tool_calls: 25,
            stop_tool: "stop".into(),
            tools,
            events,
        }
    }

    pub fn from_config(
        config: &EngineConfig,
        tools: Arc<ToolRegistry>,
        events: Arc<EventBus>,
    ) -> Self {
        Self::new(config.model.clone(), tools, events)
            .with_timeout(config.executor.step_timeout())
            .with_max_tool_calls(config.executor.max_tool_calls)
            .with_stop_tool(config.executor.stop_tool.clone())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_tool_calls(mut self, max: usize) -> Self {
        self.max_tool_calls = max;
        self
    }

    pub fn with_stop_tool(mut self, name: impl Into<String>) -> Self {
        self.stop_tool = name.into();
        self
    }

    /// Run `step`: send it, route the reply, then dispatch its tool calls.
    pub async fn execute(
        &self,
        step: &Step,
        session: &mut Session,
        router: &Mutex<StreamRouter>,
        control: &mut watch::Receiver<RunControl>,
    ) -> StepReport {
        if *control.borrow_and_update() == RunControl::Stop {
            return StepReport::new(&step.id, StepOutcome::Interrupted);
        }

        session.drain();
        let history = {
            let mut router = lock(router);
            let history = router.transcript().history();
            let note = format!("{} {}", router.autonomous_prefix(), step.description);
            router.push(Message::user(note));
            history
        };

        let request = ClientFrame::ChatStart {
            message: step.description.clone(),
            model: self.model.clone(),
            conversation: history,
        };
        if let Err(e) = session.send(request).await {
            warn!(step_id = %step.id, error = %e, "Could not send step request");
            lock(router).push(Message::system(format!(
                "Could not send step '{}': {e}",
                step.id
            )));
            return self.finish(StepReport::new(&step.id, StepOutcome::Disconnected));
        }
        debug!(step_id = %step.id, "Step request sent");

        let (outcome, response) = self.await_reply(step, session, router, control).await;
        let mut report = StepReport::new(&step.id, outcome);
        report.response = response;

        if report.outcome == StepOutcome::Completed {
            self.dispatch_tools(&mut report, router, control).await;
        }
        self.finish(report)
    }

    async fn await_reply(
        &self,
        step: &Step,
        session: &mut Session,
        router: &Mutex<StreamRouter>,
        control: &mut watch::Receiver<RunControl>,
    ) -> (StepOutcome, String) {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut control_open = true;

        loop {
            tokio::select! {
                frame = tokio::time::timeout_at(deadline, session.recv()) => match frame {
                    Err(_) => {
                        let after_secs = self.timeout.as_secs();
                        warn!(step_id = %step.id, timeout_secs = after_secs, "Step timed out, continuing with degraded result");
                        let mut router = lock(router);
                        router.abort("timed out");
                        router.push(Message::system(format!(
                            "Step '{}' timed out after {after_secs}s",
                            step.id
                        )));
                        return (StepOutcome::TimedOut { after_secs }, String::new());
                    }
                    Ok(None) => {
                        warn!(step_id = %step.id, "Connection lost during step");
                        let mut router = lock(router);
                        router.abort("connection lost");
                        router.push(Message::system(format!(
                            "Connection lost while running step '{}'",
                            step.id
                        )));
                        return (StepOutcome::Disconnected, String::new());
                    }
                    Ok(Some(Err(e))) => {
                        warn!(step_id = %step.id, error = %e, "Ignoring undecodable frame");
                        lock(router).push(Message::system(format!("Ignored frame: {e}")));
                    }
                    Ok(Some(Ok(frame))) => {
                        let routed = lock(router).route(frame);
                        match routed {
                            RouteOutcome::Pending => {}
                            RouteOutcome::Completed(text) => return (StepOutcome::Completed, text),
                            RouteOutcome::Failed(error) => {
                                warn!(step_id = %step.id, error = %error, "Completion service reported an error");
                                return (StepOutcome::UpstreamError(error), String::new());
                            }
                        }
                    }
                },
                changed = control.changed(), if control_open => {
                    if changed.is_err() {
                        control_open = false;
                    } else if *control.borrow_and_update() == RunControl::Stop {
                        lock(router).abort("stopped");
                        return (StepOutcome::Interrupted, String::new());
                    }
                }
            }
        }
    }

    async fn dispatch_tools(
        &self,
        report: &mut StepReport,
        router: &Mutex<StreamRouter>,
        control: &watch::Receiver<RunControl>,
    ) {
        let calls = extract_tool_calls(&report.response);
        let total = calls.len();

        for (position, call) in calls.into_iter().enumerate() {
            if *control.borrow() == RunControl::Stop {
                report.outcome = StepOutcome::Interrupted;
                return;
            }

            let invocation = match call {
                Ok(invocation) => invocation,
                Err(e) => {
                    warn!(step_id = %report.step_id, error = %e, "Skipping malformed tool call");
                    report.malformed_calls.push(e.to_string());
                    continue;
                }
            };

            if invocation.name == self.stop_tool {
                info!(step_id = %report.step_id, "Stop tool reached, skipping remaining tool calls");
                report.stopped_by_tool = true;
                break;
            }

            if report.tool_results.len() >= self.max_tool_calls {
                report.ignored_tool_calls = total - position;
                warn!(
                    step_id = %report.step_id,
                    executed = report.tool_results.len(),
                    ignored = report.ignored_tool_calls,
                    "Tool call limit reached"
                );
                self.events.publish(EngineEvent::ToolCallsTruncated {
                    step_id: report.step_id.clone(),
                    executed: report.tool_results.len(),
                    ignored: report.ignored_tool_calls,
                    timestamp: Utc::now(),
                });
                lock(router).push(Message::system(format!(
                    "Tool call limit ({}) reached in step '{}'; {} call(s) ignored",
                    self.max_tool_calls, report.step_id, report.ignored_tool_calls
                )));
                break;
            }

            let start = Instant::now();
            let result = match self.tools.execute(&invocation).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(tool = %invocation.name, error = %e, "Tool execution failed");
                    let mut failed = ToolResult::failed(e.to_string());
                    failed.id = invocation.id.clone();
                    failed
                }
            };
            let duration_ms = start.elapsed().as_millis() as u64;

            self.events.publish(EngineEvent::ToolExecuted {
                tool_name: invocation.name.clone(),
                success: result.success,
                duration_ms,
                timestamp: Utc::now(),
            });
            report.tool_results.push((invocation.name, result));
        }

        if !report.tool_results.is_empty() {
            let summary = report
                .tool_results
                .iter()
                .map(|(name, r)| {
                    let mark = if r.success { "ok" } else { "failed" };
                    format!("- {name} [{mark}]: {}", r.message)
                })
                .collect::<Vec<_>>()
                .join("\n");
            lock(router).push(Message::agent(format!("Tool results:\n{summary}")));
        }
    }

    fn finish(&self, report: StepReport) -> StepReport {
        self.events.publish(EngineEvent::StepFinished {
            step_id: report.step_id.clone(),
            degraded: report.is_degraded(),
            timestamp: Utc::now(),
        });
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{CountingTool, connected_session};
    use stepwise_core::message::Role;
    use stepwise_transport::{ScriptedReply, ScriptedTransport};

    fn executor(registry: ToolRegistry) -> StepExecutor {
        StepExecutor::new("claude", Arc::new(registry), Arc::new(EventBus::default()))
    }

    fn step() -> Step {
        Step::new("step_1", "Create a composition")
    }

    #[test]
    fn extracts_calls_in_order_and_flags_malformed() {
        let text = r#"
<tool_call>{"name": "search_docs", "parameters": {"query": "comp"}, "id": "a"}</tool_call>
<tool_call>{"name": "upload", "parameters": "oops"}</tool_call>
<tool_call>not json</tool_call>
<tool_call>{"name": "stop"}</tool_call>
"#;
        let calls = extract_tool_calls(text);
        assert_eq!(calls.len(), 4);
        let first = calls[0].as_ref().unwrap();
        assert_eq!(first.name, "search_docs");
        assert_eq!(first.id.as_deref(), Some("a"));
        assert!(matches!(calls[1], Err(ToolError::MalformedCall(_))));
        assert!(matches!(calls[2], Err(ToolError::MalformedCall(_))));
        assert_eq!(calls[3].as_ref().unwrap().parameters, serde_json::json!({}));
    }

    #[test]
    fn sentinels_mention_error() {
        for outcome in [
            StepOutcome::TimedOut { after_secs: 30 },
            StepOutcome::UpstreamError("boom".into()),
            StepOutcome::Disconnected,
            StepOutcome::Interrupted,
        ] {
            let report = StepReport::new("s", outcome);
            assert!(report.result_text().to_lowercase().contains("error"));
        }
    }

    #[tokio::test]
    async fn completed_reply_becomes_result() {
        let transport = ScriptedTransport::with_replies([ScriptedReply::completion(&[
            "Composition ", "created.",
        ])]);
        let mut session = connected_session(&transport).await;
        let router = Mutex::new(StreamRouter::default());
        let (_tx, mut rx) = watch::channel(RunControl::Run);

        let report = executor(ToolRegistry::new())
            .execute(&step(), &mut session, &router, &mut rx)
            .await;

        assert_eq!(report.outcome, StepOutcome::Completed);
        assert_eq!(report.result_text(), "Composition created.");
        assert_eq!(transport.sent_messages(), vec!["Create a composition"]);

        let router = router.lock().unwrap();
        let messages = router.transcript().messages();
        assert!(messages[0].content.starts_with("[AUTONOMOUS]"));
        assert_eq!(messages[1].role, Role::Assistant);
        assert!(!messages[1].is_streaming());
    }

    #[tokio::test(start_paused = true)]
    async fn silence_resolves_to_timeout_sentinel() {
        let transport = ScriptedTransport::with_replies([ScriptedReply::Silent]);
        let mut session = connected_session(&transport).await;
        let router = Mutex::new(StreamRouter::default());
        let (_tx, mut rx) = watch::channel(RunControl::Run);

        let report = executor(ToolRegistry::new())
            .execute(&step(), &mut session, &router, &mut rx)
            .await;

        assert_eq!(report.outcome, StepOutcome::TimedOut { after_secs: 30 });
        assert!(report.result_text().contains("timed out"));
        let router = router.lock().unwrap();
        assert!(router.streaming_id().is_none());
        assert_eq!(router.transcript().last().unwrap().role, Role::System);
    }

    #[tokio::test]
    async fn upstream_error_resolves_to_error_sentinel() {
        let transport = ScriptedTransport::with_replies([ScriptedReply::error("quota exceeded")]);
        let mut session = connected_session(&transport).await;
        let router = Mutex::new(StreamRouter::default());
        let (_tx, mut rx) = watch::channel(RunControl::Run);

        let report = executor(ToolRegistry::new())
            .execute(&step(), &mut session, &router, &mut rx)
            .await;

        assert_eq!(
            report.outcome,
            StepOutcome::UpstreamError("quota exceeded".into())
        );
        assert!(report.result_text().contains("quota exceeded"));
    }

    #[tokio::test]
    async fn tools_run_sequentially_until_stop_tool() {
        let reply = r#"Working.
<tool_call>{"name": "count", "parameters": {"n": 1}}</tool_call>
<tool_call>{"name": "count", "parameters": {"n": 2}}</tool_call>
<tool_call>{"name": "stop", "parameters": {}}</tool_call>
<tool_call>{"name": "count", "parameters": {"n": 3}}</tool_call>"#;
        let transport = ScriptedTransport::with_replies([ScriptedReply::completion(&[reply])]);
        let mut session = connected_session(&transport).await;
        let router = Mutex::new(StreamRouter::default());
        let (_tx, mut rx) = watch::channel(RunControl::Run);

        let tool = CountingTool::new("count");
        let calls = tool.calls();
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(tool));

        let report = executor(registry)
            .execute(&step(), &mut session, &router, &mut rx)
            .await;

        assert!(report.stopped_by_tool);
        assert_eq!(report.tool_results.len(), 2);
        assert_eq!(*calls.lock().unwrap(), vec![1, 2]);
        assert!(!report.result_text().contains("<tool_call>"));
    }

    #[tokio::test]
    async fn tool_cap_ignores_and_records_extra_calls() {
        let reply: String = (1..=5)
            .map(|n| format!(r#"<tool_call>{{"name": "count", "parameters": {{"n": {n}}}}}</tool_call>"#))
            .collect();
        let transport = ScriptedTransport::with_replies([ScriptedReply::completion(&[reply.as_str()])]);
        let mut session = connected_session(&transport).await;
        let router = Mutex::new(StreamRouter::default());
        let (_tx, mut rx) = watch::channel(RunControl::Run);

        let tool = CountingTool::new("count");
        let calls = tool.calls();
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(tool));

        let events = Arc::new(EventBus::default());
        let mut event_rx = events.subscribe();
        let report = StepExecutor::new("claude", Arc::new(registry), events)
            .with_max_tool_calls(3)
            .execute(&step(), &mut session, &router, &mut rx)
            .await;

        assert_eq!(*calls.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(report.ignored_tool_calls, 2);
        assert!(report.result_text().contains("2 call(s) ignored"));

        let router = router.lock().unwrap();
        assert!(
            router
                .transcript()
                .messages()
                .iter()
                .any(|m| m.role == Role::System && m.content.contains("limit (3)"))
        );

        let mut truncated = false;
        while let Ok(event) = event_rx.try_recv() {
            if let EngineEvent::ToolCallsTruncated { ignored, .. } = event.as_ref() {
                assert_eq!(*ignored, 2);
                truncated = true;
            }
        }
        assert!(truncated);
    }

    #[tokio::test]
    async fn unknown_tool_is_a_failed_result() {
        let reply = r#"<tool_call>{"name": "missing", "parameters": {}}</tool_call>"#;
        let transport = ScriptedTransport::with_replies([ScriptedReply::completion(&[reply])]);
        let mut session = connected_session(&transport).await;
        let router = Mutex::new(StreamRouter::default());
        let (_tx, mut rx) = watch::channel(RunControl::Run);

        let report = executor(ToolRegistry::new())
            .execute(&step(), &mut session, &router, &mut rx)
            .await;

        assert_eq!(report.tool_results.len(), 1);
        assert!(!report.tool_results[0].1.success);
        assert!(report.result_text().contains("Tool missing failed"));
    }

    #[tokio::test]
    async fn stop_interrupts_waiting_step() {
        let transport = ScriptedTransport::with_replies([ScriptedReply::Silent]);
        let mut session = connected_session(&transport).await;
        let router = Mutex::new(StreamRouter::default());
        let (tx, mut rx) = watch::channel(RunControl::Run);

        let exec = executor(ToolRegistry::new());
        let step = step();
        let run = exec.execute(&step, &mut session, &router, &mut rx);
        let stop = async {
            tokio::task::yield_now().await;
            tx.send_replace(RunControl::Stop);
        };
        let (report, ()) = tokio::join!(run, stop);

        assert_eq!(report.outcome, StepOutcome::Interrupted);
    }

    #[tokio::test]
    async fn disconnected_session_fails_fast() {
        let transport = ScriptedTransport::new();
        let mut session = Session::new(Arc::new(transport.clone()), Default::default());
        let router = Mutex::new(StreamRouter::default());
        let (_tx, mut rx) = watch::channel(RunControl::Run);

        let report = executor(ToolRegistry::new())
            .execute(&step(), &mut session, &router, &mut rx)
            .await;

        assert_eq!(report.outcome, StepOutcome::Disconnected);
        assert!(transport.sent().is_empty());
    }
}
