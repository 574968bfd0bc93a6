// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Per-request transaction state
//!
//! Created on RPC entry, mutated only by the worker driving it, torn
//! down on COMMIT or FAILED. Io progress rides the event channel with
//! the five-percent-point throttle applied.

use tokio::sync::mpsc;
use wire::transaction::IoProgress;
use wire::{Event, Packet, Phase, TransactionKind, TransactionProgress};

#[derive(Debug)]
pub struct Transaction {
    pub id: u64,
    pub kind: TransactionKind,
    pub phase: Phase,
    pub failure_reason: Option<String>,
    progress: IoProgress,
    events: mpsc::Sender<Packet>,
}

impl Transaction {
    pub fn new(id: u64, kind: TransactionKind, events: mpsc::Sender<Packet>) -> Self {
        Self {
            id,
            kind,
            phase: Phase::Init,
            failure_reason: None,
            progress: IoProgress::default(),
            events,
        }
    }

    /// Move to the next phase and announce it
    pub async fn advance(&mut self, phase: Phase) {
        self.phase = phase;
        self.emit(self.progress.percentage()).await;
    }

    /// Mark the transaction failed with its reason
    pub async fn fail(&mut self, reason: impl ToString) {
        self.failure_reason = Some(reason.to_string());
        self.advance(Phase::Failed).await;
    }

    /// Begin an io-tracked stage of `total` bytes
    pub fn begin_io(&mut self, total: u64) {
        self.progress = IoProgress::start(total);
    }

    /// Account `bytes` of progress, emitting when the throttle allows
    pub async fn io(&mut self, bytes: u64) {
        if let Some(percent) = self.progress.advance(bytes) {
            self.emit(percent).await;
        }
    }

    /// Best-effort io accounting from sync contexts (download callbacks)
    pub fn io_blocking(&mut self, bytes: u64) {
        if let Some(percent) = self.progress.advance(bytes) {
            let event = self.event(percent);
            let _ = self.events.try_send(Packet::Event(event));
        }
    }

    async fn emit(&self, percentage: u8) {
        let _ = self.events.send(Packet::Event(self.event(percentage))).await;
    }

    fn event(&self, percentage: u8) -> Event {
        Event::TransactionIoProgress(TransactionProgress {
            id: self.id,
            state: self.phase,
            bytes_current: self.progress.bytes_current,
            bytes_total: self.progress.bytes_total,
            percentage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress_events(packets: Vec<Packet>) -> Vec<TransactionProgress> {
        packets
            .into_iter()
            .map(|packet| match packet {
                Packet::Event(Event::TransactionIoProgress(progress)) => progress,
                _ => panic!("expected progress event"),
            })
            .collect()
    }

    #[tokio::test]
    async fn phases_and_progress_are_announced() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut txn = Transaction::new(7, TransactionKind::Install, tx);

        txn.advance(Phase::Download).await;
        txn.begin_io(1000);
        txn.io(10).await;
        txn.io(10).await; // throttled
        txn.io(980).await;
        txn.advance(Phase::Done).await;

        drop(txn);

        let mut packets = vec![];
        while let Some(packet) = rx.recv().await {
            packets.push(packet);
        }

        let events = progress_events(packets);
        assert_eq!(events.len(), 4);
        assert_eq!(events[0].state, Phase::Download);
        assert_eq!(events[1].percentage, 1);
        assert_eq!(events[2].percentage, 100);
        assert_eq!(events[3].state, Phase::Done);
        assert!(events.iter().all(|e| e.id == 7));
    }

    #[tokio::test]
    async fn failure_carries_the_reason() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut txn = Transaction::new(1, TransactionKind::Remove, tx);

        txn.fail("pack vanished").await;

        assert_eq!(txn.phase, Phase::Failed);
        assert_eq!(txn.failure_reason.as_deref(), Some("pack vanished"));

        drop(txn);
        let packet = rx.recv().await.unwrap();
        let events = progress_events(vec![packet]);
        assert_eq!(events[0].state, Phase::Failed);
    }
}
