//! Ordered, exactly-once reading of a script pod's log.

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::logs::cipher::LogCipher;
use crate::logs::line::{parse_line, LogLine, ParseResult};
use crate::logs::{ProcessOutput, ProcessOutputSource};

/// How far a caller has read a pod's log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogPosition {
    /// Line number of the last numbered line delivered.
    pub sequence: i64,
    /// Unparseable lines delivered after line `sequence`.
    pub invalid_after: usize,
}

impl From<i64> for LogPosition {
    fn from(sequence: i64) -> Self {
        Self {
            sequence,
            invalid_after: 0,
        }
    }
}

/// New lines read from one fetch of a pod's log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodLogs {
    pub outputs: Vec<ProcessOutput>,
    /// Line number of the last line delivered (or the caller's own sequence
    /// when nothing new was read).
    pub next_sequence: i64,
    /// Unparseable lines delivered after line `next_sequence`, counting
    /// earlier reads when `next_sequence` did not move.
    pub invalid_after: usize,
    /// Set once the end-of-stream line has been delivered.
    pub exit_code: Option<i32>,
    /// Newest timestamp among the numbered lines delivered.
    pub latest_occurred: Option<DateTime<Utc>>,
}

impl PodLogs {
    #[must_use]
    pub fn position(&self) -> LogPosition {
        LogPosition {
            sequence: self.next_sequence,
            invalid_after: self.invalid_after,
        }
    }
}

enum Entry {
    Numbered {
        line: LogLine,
        exit_code: Option<i32>,
    },
    Invalid(String),
}

/// Read the lines after `from` out of `lines`.
///
/// Lines at or below `from.sequence` are skipped; the fetch may overlap the
/// previous one. From the first new line on, every line number must be exactly
/// one more than the one before, otherwise
/// [`Error::UnexpectedLogLineNumber`] is returned and nothing is delivered.
///
/// Unparseable lines become `StdErr` diagnostics stamped with `now`. Each one
/// belongs to the numbered line before it, or to the line before the first
/// numbered line of the fetch when it leads the fetch. Those after line
/// `from.sequence` are new except the first `from.invalid_after` of them.
pub fn read_pod_logs<'a>(
    lines: impl IntoIterator<Item = &'a str>,
    from: LogPosition,
    cipher: Option<&LogCipher>,
    now: DateTime<Utc>,
) -> Result<PodLogs> {
    let entries: Vec<Entry> = lines
        .into_iter()
        .filter(|raw| !raw.trim().is_empty())
        .map(|raw| match parse_line(raw, cipher) {
            ParseResult::Valid(line) => Entry::Numbered {
                line,
                exit_code: None,
            },
            ParseResult::EndOfStream { line, exit_code } => Entry::Numbered {
                line,
                exit_code: Some(exit_code),
            },
            ParseResult::Invalid { error } => Entry::Invalid(error),
        })
        .collect();

    let mut logs = PodLogs {
        next_sequence: from.sequence,
        ..PodLogs::default()
    };
    let mut owner = entries
        .iter()
        .find_map(|entry| match entry {
            Entry::Numbered { line, .. } => Some(line.line_number - 1),
            Entry::Invalid(_) => None,
        })
        .unwrap_or(from.sequence);
    let mut invalid_after = 0;

    for entry in entries {
        let (line, exit_code) = match entry {
            Entry::Numbered { line, exit_code } => (line, exit_code),
            Entry::Invalid(error) => {
                if owner < from.sequence {
                    continue;
                }
                invalid_after += 1;
                if owner == from.sequence && invalid_after <= from.invalid_after {
                    continue;
                }
                logs.outputs
                    .push(ProcessOutput::new(ProcessOutputSource::StdErr, error, now));
                continue;
            }
        };

        let number = line.line_number;
        owner = number;

        let reading_new_lines = logs.next_sequence != from.sequence;
        if !reading_new_lines && number <= from.sequence {
            if number == from.sequence {
                invalid_after = 0;
            }
            continue;
        }

        let expected = logs.next_sequence + 1;
        if number != expected {
            return Err(Error::UnexpectedLogLineNumber {
                expected,
                actual: number,
            });
        }
        logs.next_sequence = number;
        logs.latest_occurred = logs.latest_occurred.max(Some(line.occurred));
        invalid_after = 0;

        match exit_code {
            Some(code) => {
                logs.exit_code = Some(code);
                logs.outputs.push(ProcessOutput::new(
                    ProcessOutputSource::Debug,
                    format!("The script process exited with code {code}"),
                    line.occurred,
                ));
            }
            None => logs.outputs.push(into_output(line)),
        }
    }

    logs.invalid_after = if logs.next_sequence == from.sequence {
        invalid_after.max(from.invalid_after)
    } else {
        invalid_after
    };
    Ok(logs)
}

fn into_output(line: LogLine) -> ProcessOutput {
    ProcessOutput::new(line.source, line.message, line.occurred)
}
