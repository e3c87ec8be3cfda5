//! Typed progress events for a chat turn.
//!
//! The orchestrator is the single writer; a subscriber (in practice the GUI
//! front-end) registers a sink and receives events in emission order. Sinks
//! must never block the core: the channel sink is unbounded and
//! back-pressure is the subscriber's responsibility.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::api::Usage;

/// Progress events emitted over the lifetime of one turn.
///
/// Ordering contract: `Start` precedes everything, each `ToolCallStart`
/// precedes its `ToolCallResult`, and `Done` is last. A turn cancelled
/// between a tool-call start and its result terminates with `Done` instead
/// of the result.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    Start {
        message_id: i64,
    },
    Delta {
        message_id: i64,
        text: String,
    },
    Reasoning {
        message_id: i64,
        text: String,
    },
    ToolCallStart {
        message_id: i64,
        tool_name: String,
        args_raw: String,
    },
    ToolCallResult {
        message_id: i64,
        tool_name: String,
        result_text: String,
        success: bool,
    },
    Done {
        message_id: i64,
        usage: Option<Usage>,
    },
}

/// Event delivery contract. Implementations must not block.
pub trait TurnEventSink: Send + Sync {
    fn emit(&self, event: TurnEvent);
}

/// Sink that discards all events, for tests and headless contexts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl TurnEventSink for NoopSink {
    fn emit(&self, _event: TurnEvent) {}
}

/// Sink that forwards events onto an unbounded channel for a subscriber to
/// drain at its own pace.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TurnEvent>,
}

impl ChannelSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TurnEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TurnEventSink for ChannelSink {
    fn emit(&self, event: TurnEvent) {
        let _ = self.tx.send(event);
    }
}

/// Sink that records every event, for asserting event order in tests.
#[derive(Default)]
pub struct CollectingSink {
    events: std::sync::Mutex<Vec<TurnEvent>>,
}

impl CollectingSink {
    pub fn events(&self) -> Vec<TurnEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl TurnEventSink for CollectingSink {
    fn emit(&self, event: TurnEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = TurnEvent::Delta {
            message_id: 42,
            text: "hi".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"delta\""));
        assert!(json.contains("\"message_id\":42"));
    }

    #[test]
    fn done_event_omits_absent_usage_fields() {
        let event = TurnEvent::Done {
            message_id: 1,
            usage: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"usage\":null"));
    }

    #[test]
    fn channel_sink_preserves_emission_order() {
        let (sink, mut rx) = ChannelSink::channel();
        sink.emit(TurnEvent::Start { message_id: 1 });
        sink.emit(TurnEvent::Done {
            message_id: 1,
            usage: None,
        });
        assert!(matches!(rx.try_recv().unwrap(), TurnEvent::Start { .. }));
        assert!(matches!(rx.try_recv().unwrap(), TurnEvent::Done { .. }));
    }
}
