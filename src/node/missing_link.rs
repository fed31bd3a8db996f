use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::node::rmt::RmtTag;

/// Paths containing this marker belong to discovery / probing traffic, which routinely targets
///  links that may not exist
pub const RESEARCH_PATH_MARKER: &str = "/rsch-";

pub const MISSING_LINK_REPORT_INTERVAL: Duration = Duration::from_millis(1000);

/// Decides whether a message to a missing link should be reported (warning plus negative ack),
///  rate limiting repeated reports for the same link name.
///
/// Only the most recently reported link name is remembered: a different name is always
///  reported, so interleaved failures for two names are never suppressed.
pub struct MissingLinkReporter {
    report_interval: Duration,
    last_report: Mutex<Option<(String, Instant)>>,
}

impl Default for MissingLinkReporter {
    fn default() -> Self {
        Self::new(MISSING_LINK_REPORT_INTERVAL)
    }
}

impl MissingLinkReporter {
    pub fn new(report_interval: Duration) -> MissingLinkReporter {
        MissingLinkReporter {
            report_interval,
            last_report: Mutex::new(None),
        }
    }

    /// Returns `true` if the failure should be reported, and records it as the most recent report
    ///  in that case
    pub fn should_report(&self, target: &str, link_name: &str, payload: &[u8]) -> bool {
        if RmtTag::is_negative_ack(payload) || target.contains(RESEARCH_PATH_MARKER) {
            return false;
        }

        let now = Instant::now();
        let mut last_report = self.last_report.lock()
            .unwrap_or_else(|e| e.into_inner());

        let is_suppressed = match last_report.as_ref() {
            Some((last_name, at)) => last_name == link_name && now.duration_since(*at) < self.report_interval,
            None => false,
        };
        if is_suppressed {
            return false;
        }

        *last_report = Some((link_name.to_string(), now));
        true
    }
}
