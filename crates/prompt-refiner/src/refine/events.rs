//! Per-session progress events and the channel that carries them.
//!
//! One [`EventSink`] / [`EventStream`] pair exists per session. The controller
//! and the running stage share clones of the sink, so token fragments and
//! lifecycle events land in one FIFO in emission order. The sink accepts at
//! most one terminal event (`Done` or `Error`) and drops anything after it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::refine::types::{RefinementState, Stage};

/// Literal written to the wire in place of a serialized `Done`.
pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RefinementEvent {
    Init {
        session_id: String,
    },
    #[serde(rename = "start")]
    StageStart {
        #[serde(rename = "node")]
        stage: Stage,
    },
    Token {
        #[serde(rename = "node")]
        stage: Stage,
        #[serde(rename = "token")]
        text: String,
    },
    #[serde(rename = "end")]
    StageEnd {
        #[serde(rename = "node")]
        stage: Stage,
        #[serde(rename = "updates")]
        snapshot: RefinementState,
    },
    Error {
        #[serde(rename = "error")]
        message: String,
    },
    Done,
}

impl RefinementEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }

    /// Payload for one SSE `data:` line.
    pub fn to_sse_data(&self) -> String {
        match self {
            Self::Done => DONE_SENTINEL.to_string(),
            other => serde_json::to_string(other)
                .unwrap_or_else(|e| format!(r#"{{"status":"error","error":"{e}"}}"#)),
        }
    }
}

// ── Sink ─────────────────────────────────────────────────────────────────────

/// Producer half. Cheap to clone.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<RefinementEvent>,
    terminated: Arc<AtomicBool>,
}

impl EventSink {
    /// Push an event. Returns `false` if it was dropped, either because the
    /// stream already terminated or because the consumer is gone.
    pub fn emit(&self, event: RefinementEvent) -> bool {
        if event.is_terminal() {
            if self.terminated.swap(true, Ordering::SeqCst) {
                tracing::warn!(?event, "dropping second terminal event");
                return false;
            }
        } else if self.terminated.load(Ordering::SeqCst) {
            tracing::warn!(?event, "dropping event emitted after termination");
            return false;
        }
        self.tx.send(event).is_ok()
    }

    pub fn init(&self, session_id: &str) -> bool {
        self.emit(RefinementEvent::Init {
            session_id: session_id.to_string(),
        })
    }

    pub fn stage_start(&self, stage: Stage) -> bool {
        self.emit(RefinementEvent::StageStart { stage })
    }

    pub fn token(&self, stage: Stage, text: &str) -> bool {
        self.emit(RefinementEvent::Token {
            stage,
            text: text.to_string(),
        })
    }

    pub fn stage_end(&self, stage: Stage, snapshot: RefinementState) -> bool {
        self.emit(RefinementEvent::StageEnd { stage, snapshot })
    }

    pub fn error(&self, message: impl Into<String>) -> bool {
        self.emit(RefinementEvent::Error {
            message: message.into(),
        })
    }

    pub fn done(&self) -> bool {
        self.emit(RefinementEvent::Done)
    }

    /// True once the consumer has dropped its stream.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves when the consumer drops its stream.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

// ── Stream ───────────────────────────────────────────────────────────────────

/// Consumer half. Ends after the last sink clone is dropped.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<RefinementEvent>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<RefinementEvent> {
        self.rx.recv().await
    }

    /// Drain every event until the producer side is gone.
    pub async fn collect(mut self) -> Vec<RefinementEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        events
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<RefinementEvent> {
        UnboundedReceiverStream::new(self.rx)
    }
}

pub fn event_channel() -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        EventSink {
            tx,
            terminated: Arc::new(AtomicBool::new(false)),
        },
        EventStream { rx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refine::types::StageUpdate;

    #[tokio::test]
    async fn events_arrive_in_order() {
        let (sink, stream) = event_channel();
        sink.init("abc");
        sink.stage_start(Stage::Generate);
        sink.token(Stage::Generate, "Hel");
        sink.token(Stage::Generate, "lo");
        sink.done();
        drop(sink);

        let events = stream.collect().await;
        assert_eq!(events.len(), 5);
        assert!(matches!(&events[0], RefinementEvent::Init { session_id } if session_id == "abc"));
        assert!(matches!(&events[2], RefinementEvent::Token { text, .. } if text == "Hel"));
        assert_eq!(events[4], RefinementEvent::Done);
    }

    #[tokio::test]
    async fn only_one_terminal_event_gets_through() {
        let (sink, stream) = event_channel();
        let clone = sink.clone();
        assert!(sink.error("boom"));
        assert!(!clone.done());
        assert!(!clone.stage_start(Stage::Reflect));
        drop(sink);
        drop(clone);

        let events = stream.collect().await;
        assert_eq!(
            events,
            vec![RefinementEvent::Error {
                message: "boom".into()
            }]
        );
    }

    #[tokio::test]
    async fn sink_notices_dropped_consumer() {
        let (sink, stream) = event_channel();
        assert!(!sink.is_closed());
        drop(stream);
        assert!(sink.is_closed());
        sink.closed().await;
        assert!(!sink.init("gone"));
    }

    #[test]
    fn wire_format_matches_frontend_contract() {
        let start = RefinementEvent::StageStart {
            stage: Stage::Analyze,
        };
        assert_eq!(
            start.to_sse_data(),
            r#"{"status":"start","node":"analyzer"}"#
        );

        let token = RefinementEvent::Token {
            stage: Stage::Generate,
            text: "hi".into(),
        };
        assert_eq!(
            token.to_sse_data(),
            r#"{"status":"token","node":"generator","token":"hi"}"#
        );

        let error = RefinementEvent::Error {
            message: "x".into(),
        };
        assert_eq!(error.to_sse_data(), r#"{"status":"error","error":"x"}"#);
        assert_eq!(RefinementEvent::Done.to_sse_data(), "[DONE]");
    }

    #[test]
    fn stage_end_carries_snapshot() {
        let snapshot = RefinementState::new("s1", "orig");
        let event = RefinementEvent::StageEnd {
            stage: Stage::Reflect,
            snapshot,
        };
        let value: serde_json::Value = serde_json::from_str(&event.to_sse_data()).unwrap();
        assert_eq!(value["status"], "end");
        assert_eq!(value["node"], "reflector");
        assert_eq!(value["updates"]["session_id"], "s1");
        assert_eq!(value["updates"]["original_prompt"], "orig");
        assert_eq!(value["updates"]["is_perfect"], false);
    }

    #[test]
    fn generator_end_exposes_prompt_and_template_keys() {
        let mut snapshot = RefinementState::new("s1", "orig");
        snapshot.apply(StageUpdate::Analyzed {
            user_intent: "email".into(),
        });
        snapshot.apply(StageUpdate::Generated {
            improved_text: "draft".into(),
            retrieval_match: Some("email".into()),
        });
        let event = RefinementEvent::StageEnd {
            stage: Stage::Generate,
            snapshot,
        };
        let value: serde_json::Value = serde_json::from_str(&event.to_sse_data()).unwrap();
        let updates = &value["updates"];
        assert_eq!(updates["improved_prompt"], "draft");
        assert_eq!(updates["rag_match"], "email");
        assert_eq!(updates["user_intent"], "email");
        assert_eq!(updates["iteration_count"], 2);
        assert!(updates.get("improved_text").is_none());
    }
}
