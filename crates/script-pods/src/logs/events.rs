//! Pod events rendered as script log lines.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Event;

use crate::logs::{wrapped, ProcessOutput, ProcessOutputSource};

/// Script log lines for the events that occurred after a watermark.
#[derive(Debug, Default)]
pub struct PodEventLines {
    pub outputs: Vec<ProcessOutput>,
    /// Newest event time included, i.e. the next events watermark.
    pub latest: Option<DateTime<Utc>>,
}

/// Latest of every timestamp the API server may have set on `event`.
#[must_use]
pub fn event_occurred(event: &Event) -> Option<DateTime<Utc>> {
    [
        event.event_time.as_ref().map(|t| t.0),
        event.last_timestamp.as_ref().map(|t| t.0),
        event.first_timestamp.as_ref().map(|t| t.0),
        event.metadata.creation_timestamp.as_ref().map(|t| t.0),
    ]
    .into_iter()
    .flatten()
    .max()
}

/// Render the events newer than `since`, oldest first.
///
/// Warnings render as `warning` blocks, image pulls as `wait` blocks and
/// everything else as debug lines.
#[must_use]
pub fn translate_events(events: &[Event], since: Option<DateTime<Utc>>) -> PodEventLines {
    let mut relevant: Vec<(&Event, DateTime<Utc>)> = events
        .iter()
        .filter_map(|event| event_occurred(event).map(|occurred| (event, occurred)))
        .filter(|(_, occurred)| since.map_or(true, |since| *occurred > since))
        .collect();
    relevant.sort_by_key(|(_, occurred)| *occurred);

    let mut lines = PodEventLines {
        latest: relevant.last().map(|(_, occurred)| *occurred),
        ..PodEventLines::default()
    };

    for (event, occurred) in relevant {
        let text = format!(
            "[POD EVENT] {} | {} (Count: {})",
            event.reason.as_deref().unwrap_or_default(),
            event.message.as_deref().unwrap_or_default(),
            event.count.unwrap_or(1)
        );

        match wrapper_for(event, events) {
            Some(wrapper) => lines.outputs.extend(wrapped(
                wrapper,
                ProcessOutputSource::StdOut,
                text,
                occurred,
            )),
            None => lines
                .outputs
                .push(ProcessOutput::new(ProcessOutputSource::Debug, text, occurred)),
        }
    }

    lines
}

fn wrapper_for(event: &Event, all: &[Event]) -> Option<&'static str> {
    if is_type(event, "Warning") {
        return Some("warning");
    }
    if is_reason(event, "Pulling") {
        return Some("wait");
    }
    // A pull that we showed starting is shown finishing the same way.
    if is_reason(event, "Pulled")
        && all.iter().any(|other| {
            is_reason(other, "Pulling")
                && other.involved_object.field_path == event.involved_object.field_path
        })
    {
        return Some("wait");
    }
    None
}

fn is_type(event: &Event, type_: &str) -> bool {
    event
        .type_
        .as_deref()
        .is_some_and(|t| t.eq_ignore_ascii_case(type_))
}

fn is_reason(event: &Event, reason: &str) -> bool {
    event
        .reason
        .as_deref()
        .is_some_and(|r| r.eq_ignore_ascii_case(reason))
}
