//! Streaming response router.
//!
//! Turns the ordered inbound frame stream into transcript mutations. At most
//! one message is streaming at a time; the router holds its id rather than
//! searching the transcript for it.
//!
//! Streamed content is kept as a list of segments so tool-call markers stay
//! where they were inserted while text keeps arriving after them. Markers
//! are keyed by call id. A completion without an id resolves the most recent
//! unresolved marker with the same query.

use serde_json::json;
use stepwise_core::message::{Message, MessageState, Transcript};
use stepwise_core::protocol::{ServerFrame, ToolCallDescriptor, result_count};
use stepwise_core::tool::ToolInvocation;
use tracing::{debug, warn};

/// What a routed frame means for the step waiting on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Keep waiting.
    Pending,
    /// The reply finished with this text.
    Completed(String),
    /// The service reported an error.
    Failed(String),
}

#[derive(Debug)]
enum Segment {
    Text(String),
    Marker(usize),
}

#[derive(Debug)]
struct Marker {
    call_id: String,
    query: String,
    results: Option<usize>,
}

impl Marker {
    fn render(&self) -> String {
        match self.results {
            None => format!("Searching: \"{}\"", self.query),
            Some(n) => format!("Documentation: \"{}\" ({} results)", self.query, n),
        }
    }
}

#[derive(Debug)]
struct ActiveStream {
    message_id: String,
    segments: Vec<Segment>,
    markers: Vec<Marker>,
    show_markers: bool,
}

impl ActiveStream {
    fn push_text(&mut self, text: &str) {
        if let Some(Segment::Text(last)) = self.segments.last_mut() {
            last.push_str(text);
        } else {
            self.segments.push(Segment::Text(text.to_string()));
        }
    }

    fn add_marker(&mut self, call: &ToolCallDescriptor) {
        let call_id = call
            .id
            .clone()
            .unwrap_or_else(|| format!("marker_{}", self.markers.len() + 1));
        self.markers.push(Marker {
            call_id,
            query: call.query.clone(),
            results: None,
        });
        self.segments.push(Segment::Marker(self.markers.len() - 1));
    }

    fn resolve_marker(&mut self, call: &ToolCallDescriptor, results: usize) -> bool {
        let by_id = call.id.as_deref().and_then(|id| {
            self.markers
                .iter()
                .position(|m| m.results.is_none() && m.call_id == id)
        });
        let index = by_id.or_else(|| {
            self.markers
                .iter()
                .rposition(|m| m.results.is_none() && m.query == call.query)
        });
        match index {
            Some(i) => {
                self.markers[i].results = Some(results);
                true
            }
            None => false,
        }
    }

    /// Text with markers rendered on their own lines.
    fn render(&self) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Marker(i) => {
                    if !out.is_empty() && !out.ends_with('\n') {
                        out.push('\n');
                    }
                    out.push_str(&self.markers[*i].render());
                    out.push('\n');
                }
            }
        }
        out
    }

    /// Swap the streamed text for `text`, keeping markers in order ahead of it.
    fn replace_text(&mut self, text: &str) {
        self.segments.retain(|s| matches!(s, Segment::Marker(_)));
        self.segments.push(Segment::Text(text.to_string()));
    }

    /// Streamed text without markers.
    fn plain_text(&self) -> String {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Text(text) => Some(text.as_str()),
                Segment::Marker(_) => None,
            })
            .collect()
    }
}

/// Owns the transcript and applies inbound frames to it.
pub struct StreamRouter {
    transcript: Transcript,
    active: Option<ActiveStream>,
    autonomous_prefix: String,
}

impl StreamRouter {
    pub fn new(autonomous_prefix: impl Into<String>) -> Self {
        Self {
            transcript: Transcript::new(),
            active: None,
            autonomous_prefix: autonomous_prefix.into(),
        }
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Append a resolved message. Returns its id.
    pub fn push(&mut self, message: Message) -> String {
        self.transcript.push(message)
    }

    /// Id of the message currently streaming, if any.
    pub fn streaming_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.message_id.as_str())
    }

    pub fn autonomous_prefix(&self) -> &str {
        &self.autonomous_prefix
    }

    /// Apply one frame.
    pub fn route(&mut self, frame: ServerFrame) -> RouteOutcome {
        match frame {
            ServerFrame::ConnectionEstablished { .. } => RouteOutcome::Pending,
            ServerFrame::ChatStarted { model } => {
                debug!(model = ?model, "Reply started");
                self.open();
                RouteOutcome::Pending
            }
            ServerFrame::ContentDelta { content } => {
                self.open().push_text(&content);
                self.sync();
                RouteOutcome::Pending
            }
            ServerFrame::ToolCallStart { tool_calls } => {
                let stream = self.open();
                let show_markers = stream.show_markers;
                for call in &tool_calls {
                    if show_markers {
                        stream.add_marker(call);
                    }
                }
                let id = stream.message_id.clone();
                if let Some(message) = self.transcript.streaming_mut(&id) {
                    message
                        .tool_calls
                        .extend(tool_calls.into_iter().map(|call| ToolInvocation {
                            name: call.name,
                            parameters: json!({ "query": call.query }),
                            id: call.id,
                        }));
                }
                self.sync();
                RouteOutcome::Pending
            }
            ServerFrame::ToolCallComplete { tool_call, result } => {
                if let Some(stream) = self.active.as_mut()
                    && stream.show_markers
                    && !stream.resolve_marker(&tool_call, result_count(&result))
                {
                    warn!(query = %tool_call.query, "Tool result has no pending marker");
                }
                self.sync();
                RouteOutcome::Pending
            }
            ServerFrame::ChatComplete { content } => RouteOutcome::Completed(self.finish(content)),
            ServerFrame::Error { error } => {
                self.fail(&error);
                RouteOutcome::Failed(error)
            }
        }
    }

    /// Release the streaming message without a completion event, keeping
    /// whatever content it had. Used on stop, timeout, and disconnect.
    pub fn abort(&mut self, reason: &str) {
        let Some(stream) = self.active.take() else {
            return;
        };
        let mut content = stream.render();
        if content.trim().is_empty() {
            content = format!("({reason})");
        }
        if let Some(message) = self.transcript.streaming_mut(&stream.message_id) {
            message.content = content;
            message.state = MessageState::Resolved;
        }
        debug!(reason, "Streaming message released");
    }

    /// Drop all messages. Any in-flight stream is forgotten with them.
    pub fn clear(&mut self) {
        self.active = None;
        self.transcript.clear();
    }

    /// The active stream, opening one if none is in flight.
    fn open(&mut self) -> &mut ActiveStream {
        let transcript = &mut self.transcript;
        let prefix = &self.autonomous_prefix;
        self.active.get_or_insert_with(|| {
            // Suppression is decided once, from the message that prompted this reply.
            let show_markers = !transcript
                .last_user_message()
                .is_some_and(|m| m.content.starts_with(prefix.as_str()));
            ActiveStream {
                message_id: transcript.push(Message::streaming()),
                segments: Vec::new(),
                markers: Vec::new(),
                show_markers,
            }
        })
    }

    /// Re-render the streaming message from its segments.
    fn sync(&mut self) {
        if let Some(stream) = &self.active
            && let Some(message) = self.transcript.streaming_mut(&stream.message_id)
        {
            message.content = stream.render();
        }
    }

    fn finish(&mut self, content: String) -> String {
        let stream = self.open();
        // The final content is authoritative; deltas may have been cumulative.
        if !content.is_empty() && stream.plain_text() != content {
            stream.replace_text(&content);
        }
        let text = if content.is_empty() {
            stream.plain_text()
        } else {
            content
        };
        self.sync();

        if let Some(stream) = self.active.take()
            && let Some(message) = self.transcript.streaming_mut(&stream.message_id)
        {
            message.state = MessageState::Resolved;
        }
        text
    }

    fn fail(&mut self, error: &str) {
        let text = format!("Error: {error}");
        match self.active.take() {
            Some(stream) => {
                if let Some(message) = self.transcript.streaming_mut(&stream.message_id) {
                    message.content = text;
                    message.state = MessageState::Resolved;
                }
            }
            None => {
                self.transcript.push(Message::system(text));
            }
        }
    }
}

impl Default for StreamRouter {
    fn default() -> Self {
        Self::new("[AUTONOMOUS]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_core::message::Role;

    fn delta(text: &str) -> ServerFrame {
        ServerFrame::ContentDelta {
            content: text.into(),
        }
    }

    fn start(calls: &[(&str, Option<&str>)]) -> ServerFrame {
        ServerFrame::ToolCallStart {
            tool_calls: calls
                .iter()
                .map(|(q, id)| {
                    let call = ToolCallDescriptor::new("search_docs", *q);
                    match id {
                        Some(id) => call.with_id(*id),
                        None => call,
                    }
                })
                .collect(),
        }
    }

    fn complete(query: &str, id: Option<&str>, results: usize) -> ServerFrame {
        let call = ToolCallDescriptor::new("search_docs", query);
        ServerFrame::ToolCallComplete {
            tool_call: match id {
                Some(id) => call.with_id(id),
                None => call,
            },
            result: serde_json::Value::Array(vec![serde_json::Value::Null; results]),
        }
    }

    fn streaming_content(router: &StreamRouter) -> String {
        let id = router.streaming_id().unwrap().to_string();
        router.transcript().get(&id).unwrap().content.clone()
    }

    #[test]
    fn deltas_append_to_one_message() {
        let mut router = StreamRouter::default();
        router.push(Message::user("hello"));
        router.route(ServerFrame::ChatStarted { model: None });
        router.route(delta("Hel"));
        router.route(delta("lo"));

        assert_eq!(streaming_content(&router), "Hello");
        assert_eq!(router.transcript().len(), 2);
    }

    #[test]
    fn markers_stay_in_place_while_text_continues() {
        let mut router = StreamRouter::default();
        router.push(Message::user("how do masks work?"));
        router.route(delta("Let me check."));
        router.route(start(&[("mask path", Some("c1"))]));
        router.route(delta("Masks are paths."));

        assert_eq!(
            streaming_content(&router),
            "Let me check.\nSearching: \"mask path\"\nMasks are paths."
        );

        router.route(complete("mask path", Some("c1"), 4));
        assert_eq!(
            streaming_content(&router),
            "Let me check.\nDocumentation: \"mask path\" (4 results)\nMasks are paths."
        );
    }

    #[test]
    fn duplicate_queries_resolve_by_call_id() {
        let mut router = StreamRouter::default();
        router.push(Message::user("q"));
        router.route(start(&[("layer", Some("a")), ("layer", Some("b"))]));

        router.route(complete("layer", Some("a"), 1));
        router.route(complete("layer", Some("b"), 7));
        let content = streaming_content(&router);
        let first = content.find("(1 results)").unwrap();
        let second = content.find("(7 results)").unwrap();
        assert!(first < second);
    }

    #[test]
    fn completion_without_id_takes_latest_matching_marker() {
        let mut router = StreamRouter::default();
        router.push(Message::user("q"));
        router.route(start(&[("layer", None), ("layer", None)]));
        router.route(complete("layer", None, 2));

        let content = streaming_content(&router);
        assert_eq!(
            content,
            "Searching: \"layer\"\nDocumentation: \"layer\" (2 results)\n"
        );
    }

    #[test]
    fn autonomous_prefix_suppresses_markers() {
        let mut router = StreamRouter::default();
        router.push(Message::user("[AUTONOMOUS] Create comp"));
        router.route(delta("Working"));
        router.route(start(&[("comp", Some("c1"))]));
        router.route(complete("comp", Some("c1"), 3));

        assert_eq!(streaming_content(&router), "Working");
        let id = router.streaming_id().unwrap().to_string();
        assert_eq!(router.transcript().get(&id).unwrap().tool_calls.len(), 1);
    }

    #[test]
    fn chat_complete_resolves_and_releases() {
        let mut router = StreamRouter::default();
        router.push(Message::user("q"));
        router.route(delta("done"));
        let outcome = router.route(ServerFrame::ChatComplete {
            content: "done".into(),
        });

        assert_eq!(outcome, RouteOutcome::Completed("done".into()));
        assert!(router.streaming_id().is_none());
        let last = router.transcript().last().unwrap();
        assert_eq!(last.state, MessageState::Resolved);
        assert_eq!(last.content, "done");
        assert_eq!(router.transcript().history().len(), 2);
    }

    #[test]
    fn chat_complete_without_deltas_uses_final_content() {
        let mut router = StreamRouter::default();
        let outcome = router.route(ServerFrame::ChatComplete {
            content: "all at once".into(),
        });
        assert_eq!(outcome, RouteOutcome::Completed("all at once".into()));
        assert_eq!(router.transcript().last().unwrap().content, "all at once");
    }

    #[test]
    fn final_content_replaces_cumulative_deltas() {
        let mut router = StreamRouter::default();
        router.push(Message::user("hi"));
        router.route(ServerFrame::ChatStarted { model: None });
        router.route(delta("Echo: "));
        router.route(delta("Echo: hi"));
        let outcome = router.route(ServerFrame::ChatComplete {
            content: "Echo: hi".into(),
        });

        assert_eq!(outcome, RouteOutcome::Completed("Echo: hi".into()));
        assert_eq!(router.transcript().last().unwrap().content, "Echo: hi");
        let history = router.transcript().history();
        assert_eq!(history.last().unwrap().content, "Echo: hi");
    }

    #[test]
    fn final_content_keeps_markers_ahead_of_text() {
        let mut router = StreamRouter::default();
        router.push(Message::user("how do masks work?"));
        router.route(delta("Let me"));
        router.route(start(&[("mask path", Some("c1"))]));
        router.route(complete("mask path", Some("c1"), 2));
        router.route(ServerFrame::ChatComplete {
            content: "Masks are paths.".into(),
        });

        assert_eq!(
            router.transcript().last().unwrap().content,
            "Documentation: \"mask path\" (2 results)\nMasks are paths."
        );
    }

    #[test]
    fn error_replaces_streaming_message() {
        let mut router = StreamRouter::default();
        router.route(delta("partial output"));
        let outcome = router.route(ServerFrame::Error {
            error: "rate limited".into(),
        });

        assert_eq!(outcome, RouteOutcome::Failed("rate limited".into()));
        assert!(router.streaming_id().is_none());
        let last = router.transcript().last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, "Error: rate limited");
        assert_eq!(router.transcript().len(), 1);
    }

    #[test]
    fn error_without_stream_is_system_message() {
        let mut router = StreamRouter::default();
        router.route(ServerFrame::Error {
            error: "bad request".into(),
        });
        let last = router.transcript().last().unwrap();
        assert_eq!(last.role, Role::System);
        assert!(last.content.contains("bad request"));
    }

    #[test]
    fn abort_releases_pointer_and_keeps_content() {
        let mut router = StreamRouter::default();
        router.route(delta("half"));
        router.abort("stopped");
        assert!(router.streaming_id().is_none());
        assert_eq!(router.transcript().last().unwrap().content, "half");
        assert!(!router.transcript().last().unwrap().is_streaming());
    }

    #[test]
    fn resolved_messages_are_never_rewritten() {
        let mut router = StreamRouter::default();
        router.route(delta("first"));
        router.route(ServerFrame::ChatComplete {
            content: "first".into(),
        });
        router.route(delta("second"));

        let contents: Vec<_> = router
            .transcript()
            .messages()
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents, vec!["first", "second"]);
    }
}
