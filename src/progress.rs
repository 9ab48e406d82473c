use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tokio::sync::broadcast;

/// Matches the first percentage in a progress line, e.g. ` 42.7% of 10MiB`.
static PERCENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)%").unwrap());

/// Extract a progress percentage from one line of tool output.
///
/// Lines without a percentage yield `None`; values are clamped to [0, 100].
/// Tolerant of interleaved stdout/stderr text and partial lines.
pub fn parse_percent(line: &str) -> Option<f32> {
    let caps = PERCENT_RE.captures(line)?;
    let value: f32 = caps.get(1)?.as_str().parse().ok()?;
    Some(value.clamp(0.0, 100.0))
}

/// One progress update, tagged with the caller-supplied request id.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProgressEvent {
    pub id: String,
    pub progress: f32,
}

/// Fan-out channel from in-flight downloads to connected listeners.
///
/// Publishing is fire-and-forget: with no subscribers it is a no-op, and a
/// lagging subscriber loses old events instead of blocking the publisher.
#[derive(Debug, Clone)]
pub struct ProgressBroadcaster {
    tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Dropping the returned receiver unsubscribes the listener.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, id: &str, progress: f32) {
        let _ = self.tx.send(ProgressEvent {
            id: id.to_string(),
            progress,
        });
    }
}
