// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;

use crate::solver_trait::SolveResult;

// Single slot mailbox carrying the latest plate solution from the solve worker
// to the Stellarium server. There is no queue: a newer solution replaces one
// that has not yet been picked up, since only the most recent camera pointing
// is of interest.
//
// Clones share the same slot.
#[derive(Clone, Debug, Default)]
pub struct ResultChannel {
    slot: Arc<Mutex<Option<SolveResult>>>,
}

impl ResultChannel {
    pub fn new() -> Self {
        ResultChannel::default()
    }

    // The slot only ever holds a plain value, so a panic while it was locked
    // cannot leave it inconsistent.
    fn lock(&self) -> MutexGuard<'_, Option<SolveResult>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `result`, replacing any unread result.
    pub fn publish(&self, result: SolveResult) {
        if let Some(dropped) = self.lock().replace(result) {
            debug!("Replacing unread solve result {:?}", dropped);
        }
    }

    /// Removes and returns the pending result, if any.
    pub fn take_if_present(&self) -> Option<SolveResult> {
        self.lock().take()
    }

    /// Discards the pending result, if any.
    pub fn clear(&self) {
        if let Some(dropped) = self.take_if_present() {
            debug!("Discarding stale solve result {:?}", dropped);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn result(x: f64) -> SolveResult {
        SolveResult{ra: x, dec: x}
    }

    #[test]
    fn test_take_is_empty_initially() {
        let channel = ResultChannel::new();
        assert!(channel.take_if_present().is_none());
    }

    #[test]
    fn test_last_write_wins() {
        let channel = ResultChannel::new();
        channel.publish(result(1.0));
        channel.publish(result(2.0));
        assert_eq!(channel.take_if_present(), Some(result(2.0)));
        assert!(channel.take_if_present().is_none());
        assert!(channel.take_if_present().is_none());

        channel.publish(result(3.0));
        assert_eq!(channel.take_if_present(), Some(result(3.0)));
    }

    #[test]
    fn test_clear() {
        let channel = ResultChannel::new();
        channel.publish(result(1.0));
        channel.clear();
        assert!(channel.take_if_present().is_none());
        // Clearing an empty slot is fine.
        channel.clear();
    }

    #[test]
    fn test_clones_share_slot() {
        let producer = ResultChannel::new();
        let consumer = producer.clone();
        producer.publish(result(4.0));
        assert_eq!(consumer.take_if_present(), Some(result(4.0)));
        assert!(producer.take_if_present().is_none());
    }

    #[test]
    fn test_concurrent_publish_and_take() {
        let producer = ResultChannel::new();
        let consumer = producer.clone();
        let count = 10_000;
        let worker = thread::spawn(move || {
            for i in 1..=count {
                producer.publish(SolveResult{ra: i as f64, dec: -(i as f64)});
            }
        });

        let mut last_seen = 0.0;
        let mut finished = false;
        loop {
            if let Some(taken) = consumer.take_if_present() {
                // Never a mix of two publications.
                assert_eq!(taken.dec, -taken.ra);
                // Each value is delivered at most once, in order.
                assert!(taken.ra > last_seen);
                last_seen = taken.ra;
            }
            if finished {
                break;
            }
            finished = worker.is_finished();
        }
        worker.join().unwrap();
        // The final publication is never lost.
        assert_eq!(last_seen, count as f64);
    }
}
