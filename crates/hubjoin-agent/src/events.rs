//! State transition records.
//!
//! Every transition of the fallback engine and the CSR lifecycle is logged
//! as a structured `tracing` event and, when a channel is attached, forwarded
//! to the embedding caller.

use std::fmt;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::info;

/// Which state machine produced a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Machine {
    Fallback,
    Csr,
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Machine::Fallback => f.write_str("fallback"),
            Machine::Csr => f.write_str("csr"),
        }
    }
}

/// One state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub machine: Machine,
    /// Candidate or request the transition concerns.
    pub subject: String,
    pub from: String,
    pub to: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Emits transition records.
#[derive(Debug, Clone, Default)]
pub struct TransitionLog {
    tx: Option<mpsc::UnboundedSender<Transition>>,
}

impl TransitionLog {
    /// A log that only writes to `tracing`.
    pub fn new() -> Self {
        Self::default()
    }

    /// A log that also forwards every record to the returned receiver.
    pub fn with_channel() -> (Self, mpsc::UnboundedReceiver<Transition>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Record a transition.
    pub fn record(
        &self,
        machine: Machine,
        subject: impl fmt::Display,
        from: impl fmt::Display,
        to: impl fmt::Display,
        reason: impl Into<String>,
    ) {
        let transition = Transition {
            machine,
            subject: subject.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            reason: reason.into(),
            at: Utc::now(),
        };

        info!(
            machine = %transition.machine,
            subject = %transition.subject,
            from = %transition.from,
            to = %transition.to,
            reason = %transition.reason,
            "State transition"
        );

        if let Some(tx) = &self.tx {
            // Receiver might be dropped
            tx.send(transition).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwards_to_channel() {
        let (log, mut rx) = TransitionLog::with_channel();
        log.record(Machine::Csr, "req-1", "Pending", "Approved", "approved by hub");

        let t = rx.try_recv().unwrap();
        assert_eq!(t.machine, Machine::Csr);
        assert_eq!(t.subject, "req-1");
        assert_eq!(t.from, "Pending");
        assert_eq!(t.to, "Approved");
    }

    #[test]
    fn test_dropped_receiver_is_ignored() {
        let (log, rx) = TransitionLog::with_channel();
        drop(rx);
        log.record(Machine::Fallback, "a", "Untried", "Probing", "probe");
    }
}
