//! Pod log line parsing
//!
//! Wire format: `lineNumber|timestamp|source|message`. Only the first three
//! pipes delimit fields, so messages may contain `|`.

use chrono::{DateTime, Utc};

use crate::logs::cipher::LogCipher;
use crate::logs::ProcessOutputSource;

/// Message prefix the script runner writes once the script process exits.
pub const END_OF_STREAM_MARKER: &str = "EOS-075CD4F0-8C76-491D-BA76-0879D35E9CFE";
const END_OF_STREAM_DELIMITER: &str = "<<>>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub line_number: i64,
    pub occurred: DateTime<Utc>,
    pub source: ProcessOutputSource,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    Valid(LogLine),
    /// The end-of-stream marker line. `line.message` still holds the raw marker.
    EndOfStream { line: LogLine, exit_code: i32 },
    /// The line could not be parsed. `error` quotes the raw line.
    Invalid { error: String },
}

pub fn parse_line(raw: &str, cipher: Option<&LogCipher>) -> ParseResult {
    let parts: Vec<&str> = raw.splitn(4, '|').collect();
    let [line_number, occurred, source, message] = parts.as_slice() else {
        return invalid("is not correctly pipe-delimited", raw);
    };

    let Ok(line_number) = line_number.trim().parse::<i64>() else {
        return invalid("has an invalid line number", raw);
    };

    let Ok(occurred) = DateTime::parse_from_rfc3339(occurred.trim()) else {
        return invalid("has an invalid log timestamp", raw);
    };

    let Ok(source) = source.trim().parse::<ProcessOutputSource>() else {
        return invalid("has an invalid log level", raw);
    };

    let message = match cipher {
        Some(cipher) => match cipher.decrypt(message) {
            Ok(plaintext) => plaintext,
            Err(e) => return invalid(&format!("could not be decrypted ({e})"), raw),
        },
        None => (*message).to_string(),
    };

    let line = LogLine {
        line_number,
        occurred: occurred.with_timezone(&Utc),
        source,
        message,
    };

    let Some(marker_tail) = line.message.strip_prefix(END_OF_STREAM_MARKER) else {
        return ParseResult::Valid(line);
    };

    match marker_tail
        .strip_prefix(END_OF_STREAM_DELIMITER)
        .and_then(|code| code.trim().parse::<i32>().ok())
    {
        Some(exit_code) => ParseResult::EndOfStream { line, exit_code },
        None => invalid("has an invalid end of stream marker", raw),
    }
}

fn invalid(problem: &str, raw: &str) -> ParseResult {
    ParseResult::Invalid {
        error: format!("Pod log line {problem}: '{raw}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn expect_invalid(raw: &str, needle: &str) {
        match parse_line(raw, None) {
            ParseResult::Invalid { error } => {
                assert!(error.contains(needle), "{error} should mention {needle}");
                assert!(error.contains(raw));
            }
            other => panic!("expected invalid line, got {other:?}"),
        }
    }

    fn expect_valid(raw: &str) -> LogLine {
        match parse_line(raw, None) {
            ParseResult::Valid(line) => line,
            other => panic!("expected valid line, got {other:?}"),
        }
    }

    #[test]
    fn malformed_lines_name_the_broken_field() {
        expect_invalid("a|b|c", "not correctly pipe-delimited");
        expect_invalid("abcdefg", "not correctly pipe-delimited");
        expect_invalid("x|2024-04-03T06:03:10Z|stdout|msg", "line number");
        expect_invalid("1 |b|c|d", "log timestamp");
        expect_invalid("1|2024-04-03T06:03:10.501025551Z |c|d", "log level");
    }

    #[test]
    fn parses_a_simple_line() {
        let line = expect_valid("123|2024-04-03T06:03:10.501025551Z|stdout|This is the message");
        assert_eq!(line.line_number, 123);
        assert_eq!(line.source, ProcessOutputSource::StdOut);
        assert_eq!(line.message, "This is the message");
        assert_eq!(
            line.occurred,
            Utc.with_ymd_and_hms(2024, 4, 3, 6, 3, 10).unwrap()
                + chrono::Duration::nanoseconds(501_025_551)
        );
    }

    #[test]
    fn keeps_pipes_inside_the_message() {
        let line = expect_valid("7 | 2024-04-03T06:03:10Z | StdErr |This is the me|ss|age");
        assert_eq!(line.source, ProcessOutputSource::StdErr);
        assert_eq!(line.message, "This is the me|ss|age");
    }

    #[test]
    fn end_of_stream_carries_exit_code() {
        for (code, expected) in [("137", 137), ("-64", -64), ("0", 0)] {
            let raw = format!("123|2024-04-03T06:03:10Z|debug|{END_OF_STREAM_MARKER}<<>>{code}");
            match parse_line(&raw, None) {
                ParseResult::EndOfStream { line, exit_code } => {
                    assert_eq!(exit_code, expected);
                    assert_eq!(line.line_number, 123);
                    assert_eq!(line.source, ProcessOutputSource::Debug);
                }
                other => panic!("expected end of stream, got {other:?}"),
            }
        }
    }

    #[test]
    fn end_of_stream_without_code_is_invalid() {
        expect_invalid(
            &format!("123|2024-04-03T06:03:10Z|stdout|{END_OF_STREAM_MARKER}<<>>"),
            "end of stream",
        );
    }

    #[test]
    fn encrypted_messages_are_decrypted() {
        let cipher = LogCipher::new(&crate::logs::cipher::generate_key()).unwrap();
        let sealed = cipher.encrypt("top secret|with pipe").unwrap();
        let raw = format!("1|2024-04-03T06:03:10Z|stdout|{sealed}");

        match parse_line(&raw, Some(&cipher)) {
            ParseResult::Valid(line) => assert_eq!(line.message, "top secret|with pipe"),
            other => panic!("expected valid line, got {other:?}"),
        }

        let plain = "1|2024-04-03T06:03:10Z|stdout|not encrypted";
        assert!(matches!(
            parse_line(plain, Some(&cipher)),
            ParseResult::Invalid { .. }
        ));
    }
}
