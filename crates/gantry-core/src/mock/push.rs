//! Scripted push-event sequences for mocked WebSocket and EventSource
//! streams.

use serde::Deserialize;
use std::time::Duration;

/// Transport of a mocked stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamProtocol {
    Ws,
    Es,
}

/// One event definition as it appears in a mock file. Several
/// definitions may share a name; replaying that name runs all of them
/// in definition order.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDef {
    pub name: String,
    #[serde(default)]
    pub message: Option<serde_json::Value>,
    #[serde(default)]
    pub sequence: Option<Vec<EventDef>>,
    #[serde(default)]
    pub options: EventOptions,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventOptions {
    /// Milliseconds to wait before pushing.
    #[serde(default)]
    pub delay: Option<u64>,
    /// EventSource event name.
    #[serde(default)]
    pub event: Option<String>,
    /// EventSource event id.
    #[serde(default)]
    pub id: Option<String>,
    /// Include this event when the reserved "connect" name is replayed
    /// without an explicit connect definition.
    #[serde(default)]
    pub connect: bool,
}

/// Flattened replay step.
#[derive(Debug, Clone, PartialEq)]
pub struct EventStep {
    pub message: Option<serde_json::Value>,
    pub delay: Duration,
    pub event: Option<String>,
    pub id: Option<String>,
}

/// What the replay hands to the transport per step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    /// Strings pass through verbatim, everything else is serialized as
    /// JSON.
    pub data: String,
    pub event: Option<String>,
    pub id: Option<String>,
}

#[derive(Debug)]
pub(super) struct StreamEntry {
    protocol: StreamProtocol,
    events: Vec<EventDef>,
}

impl StreamEntry {
    pub(super) fn new(protocol: StreamProtocol, events: Vec<EventDef>) -> Self {
        Self { protocol, events }
    }

    pub(super) fn protocol(&self) -> StreamProtocol {
        self.protocol
    }

    /// Steps for a named event, flattening nested sequences.
    ///
    /// The name "connect" is reserved: when no definition carries that
    /// name, a sequence is synthesized from every definition flagged
    /// `connect: true`, so a stream can script its greeting without a
    /// dedicated entry.
    pub(super) fn sequence_for(&self, name: &str) -> Option<Vec<EventStep>> {
        let named: Vec<&EventDef> = self.events.iter().filter(|e| e.name == name).collect();

        let chosen: Vec<&EventDef> = if named.is_empty() && name == "connect" {
            self.events.iter().filter(|e| e.options.connect).collect()
        } else {
            named
        };
        if chosen.is_empty() {
            return None;
        }

        let mut steps = Vec::new();
        for def in chosen {
            flatten(def, &mut steps);
        }
        Some(steps)
    }
}

fn flatten(def: &EventDef, out: &mut Vec<EventStep>) {
    if let Some(sequence) = &def.sequence {
        for nested in sequence {
            flatten(nested, out);
        }
        return;
    }
    out.push(EventStep {
        message: def.message.clone(),
        delay: Duration::from_millis(def.options.delay.unwrap_or(0)),
        event: def.options.event.clone(),
        id: def.options.id.clone(),
    });
}

impl EventStep {
    #[must_use]
    pub fn to_message(&self) -> PushMessage {
        let data = match &self.message {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(value) => serde_json::to_string(value).unwrap_or_default(),
            None => String::new(),
        };
        PushMessage {
            data,
            event: self.event.clone(),
            id: self.id.clone(),
        }
    }
}

/// Replay a snapshotted sequence, honoring per-step delays. The
/// transport callback pushes each message; replay stops when it reports
/// the stream is gone.
pub async fn replay<F>(steps: Vec<EventStep>, mut push: F)
where
    F: FnMut(PushMessage) -> bool,
{
    for step in steps {
        if !step.delay.is_zero() {
            tokio::time::sleep(step.delay).await;
        }
        if !push(step.to_message()) {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(name: &str, message: &str) -> EventDef {
        EventDef {
            name: name.to_string(),
            message: Some(serde_json::Value::String(message.to_string())),
            sequence: None,
            options: EventOptions::default(),
        }
    }

    fn data(steps: &[EventStep]) -> Vec<String> {
        steps.iter().map(|s| s.to_message().data).collect()
    }

    #[test]
    fn named_event_collects_all_definitions_in_order() {
        let entry = StreamEntry::new(
            StreamProtocol::Ws,
            vec![def("tick", "a"), def("other", "x"), def("tick", "b")],
        );
        let steps = entry.sequence_for("tick").unwrap();
        assert_eq!(data(&steps), ["a", "b"]);
        assert!(entry.sequence_for("nope").is_none());
    }

    #[test]
    fn nested_sequences_flatten() {
        let mut outer = def("batch", "");
        outer.message = None;
        outer.sequence = Some(vec![def("", "one"), def("", "two")]);
        let entry = StreamEntry::new(StreamProtocol::Ws, vec![outer]);

        let steps = entry.sequence_for("batch").unwrap();
        assert_eq!(data(&steps), ["one", "two"]);
    }

    #[test]
    fn connect_synthesized_from_flagged_events() {
        let mut hello = def("hello", "hi");
        hello.options.connect = true;
        let entry = StreamEntry::new(StreamProtocol::Es, vec![def("tick", "t"), hello]);

        let steps = entry.sequence_for("connect").unwrap();
        assert_eq!(data(&steps), ["hi"]);
    }

    #[test]
    fn literal_connect_definition_wins_over_flags() {
        let mut flagged = def("greet", "flagged");
        flagged.options.connect = true;
        let entry = StreamEntry::new(
            StreamProtocol::Es,
            vec![flagged, def("connect", "literal")],
        );

        let steps = entry.sequence_for("connect").unwrap();
        assert_eq!(data(&steps), ["literal"]);
    }

    #[test]
    fn non_string_messages_serialize_as_json() {
        let mut d = def("tick", "");
        d.message = Some(serde_json::json!({"n": 1}));
        d.options.event = Some("update".to_string());
        d.options.id = Some("7".to_string());
        let entry = StreamEntry::new(StreamProtocol::Es, vec![d]);

        let msg = entry.sequence_for("tick").unwrap()[0].to_message();
        assert_eq!(msg.data, r#"{"n":1}"#);
        assert_eq!(msg.event.as_deref(), Some("update"));
        assert_eq!(msg.id.as_deref(), Some("7"));
    }

    #[tokio::test(start_paused = true)]
    async fn replay_honors_delays_and_stops_on_dead_stream() {
        let steps = vec![
            EventStep {
                message: Some(serde_json::Value::String("now".into())),
                delay: Duration::ZERO,
                event: None,
                id: None,
            },
            EventStep {
                message: Some(serde_json::Value::String("late".into())),
                delay: Duration::from_millis(40),
                event: None,
                id: None,
            },
            EventStep {
                message: Some(serde_json::Value::String("never".into())),
                delay: Duration::ZERO,
                event: None,
                id: None,
            },
        ];

        let mut seen = Vec::new();
        replay(steps, |msg| {
            seen.push(msg.data.clone());
            msg.data != "late"
        })
        .await;

        assert_eq!(seen, ["now", "late"]);
    }
}
