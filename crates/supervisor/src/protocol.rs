//! The line protocol the capture server speaks on stderr.

use crate::error::ProcessError;
use crate::stats::CaptureStats;

pub const ERROR_PREFIX: &str = "error: ";
pub const STATS_PREFIX: &str = "stats: ";

#[derive(Debug)]
pub enum Event {
    Error(ProcessError),
    Stats(CaptureStats),
}

/// Classify one stderr line. Lines without a known prefix are not events.
pub fn parse_line(line: &str) -> Option<Event> {
    if let Some(message) = line.strip_prefix(ERROR_PREFIX) {
        return Some(Event::Error(ProcessError::Reported(message.to_string())));
    }
    let payload = line.strip_prefix(STATS_PREFIX)?;
    Some(match serde_json::from_str(payload) {
        Ok(stats) => Event::Stats(stats),
        Err(err) => Event::Error(ProcessError::StatsDecode(err)),
    })
}

pub fn stats_line(stats: &CaptureStats) -> Result<String, serde_json::Error> {
    Ok(format!("{STATS_PREFIX}{}", serde_json::to_string(stats)?))
}

pub fn error_line(message: &str) -> String {
    format!("{ERROR_PREFIX}{message}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn classifies_lines() {
        assert!(matches!(
            parse_line("error: interface en0 went away"),
            Some(Event::Error(ProcessError::Reported(msg))) if msg == "interface en0 went away"
        ));
        assert!(matches!(
            parse_line("stats: {\"received\":"),
            Some(Event::Error(ProcessError::StatsDecode(_)))
        ));
        assert!(parse_line("listening on /tmp/x.sock").is_none());
        assert!(parse_line("errors: 3").is_none());
        assert!(parse_line("").is_none());
    }

    #[test]
    fn unknown_stats_fields_are_ignored() {
        let line = "stats: {\"received\":1,\"dropped\":0,\"bytes\":60,\"capture_buffer_fill\":60,\
                    \"save_buffer_fill\":0,\"timestamp_ms\":1,\"interface\":\"en0\"}";
        let Some(Event::Stats(stats)) = parse_line(line) else {
            panic!("not a stats line");
        };
        assert_eq!(stats.bytes, 60);
    }

    proptest! {
        #[test]
        fn stats_survive_the_line_protocol(
            received: u64,
            dropped: u64,
            bytes: u64,
            capture_buffer_fill: u64,
            save_buffer_fill: u64,
            timestamp_ms: u64,
        ) {
            let stats = CaptureStats {
                received,
                dropped,
                bytes,
                capture_buffer_fill,
                save_buffer_fill,
                timestamp_ms,
            };
            let line = stats_line(&stats).unwrap();
            match parse_line(&line) {
                Some(Event::Stats(parsed)) => prop_assert_eq!(parsed, stats),
                other => prop_assert!(false, "unexpected {:?}", other),
            }
        }

        #[test]
        fn error_messages_survive_the_line_protocol(message in "[^\n]*") {
            match parse_line(&error_line(&message)) {
                Some(Event::Error(ProcessError::Reported(parsed))) => prop_assert_eq!(parsed, message),
                other => prop_assert!(false, "unexpected {:?}", other),
            }
        }
    }
}
