// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Daemon-side transaction state
//!
//! Every mutating request allocates a transaction driven by a worker
//! through a fixed phase sequence. Progress is reported to the client in
//! at-least-five-percent increments.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "UPPERCASE")]
pub enum TransactionKind {
    Install,
    Verify,
    Remove,
    Build,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Phase {
    Init,
    Download,
    Verify,
    Apply,
    Commit,
    Done,
    Failed,
}

impl Phase {
    /// Terminal phases end the transaction's worker
    pub fn terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionProgress {
    pub id: u64,
    pub state: Phase,
    pub bytes_current: u64,
    pub bytes_total: u64,
    pub percentage: u8,
}

/// Io progress bookkeeping with percentage throttling
#[derive(Debug, Clone, Copy, Default)]
pub struct IoProgress {
    pub bytes_current: u64,
    pub bytes_total: u64,
    last_reported_percent: Option<u8>,
}

impl IoProgress {
    const MIN_DELTA: u8 = 5;

    pub fn start(bytes_total: u64) -> Self {
        Self {
            bytes_current: 0,
            bytes_total,
            last_reported_percent: None,
        }
    }

    pub fn percentage(&self) -> u8 {
        if self.bytes_total == 0 {
            return 100;
        }
        ((self.bytes_current.saturating_mul(100)) / self.bytes_total).min(100) as u8
    }

    /// Advance the counter. Returns the percentage when it moved at least
    /// five points past the last reported value (or hit the ends).
    pub fn advance(&mut self, bytes: u64) -> Option<u8> {
        self.bytes_current = (self.bytes_current + bytes).min(self.bytes_total);
        let percent = self.percentage();

        let report = match self.last_reported_percent {
            None => true,
            Some(last) => percent >= last + Self::MIN_DELTA || (percent == 100 && last != 100),
        };

        if report {
            self.last_reported_percent = Some(percent);
            Some(percent)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_terminate() {
        assert!(Phase::Done.terminal());
        assert!(Phase::Failed.terminal());
        assert!(!Phase::Apply.terminal());
    }

    #[test]
    fn progress_throttles_below_five_points() {
        let mut progress = IoProgress::start(1000);

        assert_eq!(progress.advance(10), Some(1));
        assert_eq!(progress.advance(10), None);
        assert_eq!(progress.advance(20), None);
        // 1 -> 6 crosses the five point threshold
        assert_eq!(progress.advance(20), Some(6));
        assert_eq!(progress.advance(900), Some(96));
        // Completion always reports
        assert_eq!(progress.advance(40), Some(100));
    }

    #[test]
    fn zero_total_reports_complete() {
        let mut progress = IoProgress::start(0);

        assert_eq!(progress.advance(0), Some(100));
    }
}
