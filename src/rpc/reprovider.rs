//! Periodic re-announcement of this node's own provider records.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use tracing::debug;

use crate::common::Id;

use super::server::ProviderStore;

/// Whether a provider record is due to be re-announced.
///
/// Only this node's own records are ever reprovided, and only once they
/// are within `threshold` of expiring (or already expired).
pub fn should_reprovide(
    is_self: bool,
    expires_at: Instant,
    now: Instant,
    threshold: Duration,
) -> bool {
    if !is_self {
        return false;
    }

    match expires_at.checked_duration_since(now) {
        Some(remaining) => remaining <= threshold,
        // Already expired; self records are kept so they can still recover.
        None => true,
    }
}

/// Progress of reprovide cycles, for observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReprovideEvent {
    /// A cycle began with this many records due for re-announcement.
    CycleStarted { due: usize },
    /// Every announcement of the cycle finished; this many succeeded
    /// on at least one node.
    CycleDone { announced: usize },
}

/// Schedules reprovide cycles and tracks each cycle's announcements
/// until they all complete.
#[derive(Debug)]
pub(crate) struct Reprovider {
    interval: Duration,
    threshold: Duration,
    /// `None` starts a cycle on the next check.
    last_cycle: Option<Instant>,
    enabled: bool,
    /// Keys announced by the running cycle, awaiting completion.
    pending: HashSet<Id>,
    announced: usize,
    watchers: Vec<Sender<ReprovideEvent>>,
}

impl Reprovider {
    pub fn new(interval: Duration, threshold: Duration) -> Reprovider {
        Reprovider {
            interval,
            threshold,
            last_cycle: Some(Instant::now()),
            enabled: true,
            pending: HashSet::new(),
            announced: 0,
            watchers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self) -> Receiver<ReprovideEvent> {
        let (sender, receiver) = flume::unbounded();
        self.watchers.push(sender);
        receiver
    }

    pub fn start(&mut self) {
        if !self.enabled {
            self.enabled = true;
            // Catch up promptly after being stopped for a while.
            self.last_cycle = None;
        }
    }

    pub fn stop(&mut self) {
        self.enabled = false;
        self.pending.clear();
        self.announced = 0;
    }

    /// The records due for re-announcement, when a new cycle is starting.
    ///
    /// A new cycle only starts once the previous one fully completed and
    /// the interval elapsed since it started.
    pub fn due(&mut self, providers: &ProviderStore) -> Vec<(Id, Box<[u8]>)> {
        if !self.enabled
            || !self.pending.is_empty()
            || self
                .last_cycle
                .map_or(false, |last| last.elapsed() < self.interval)
        {
            return Vec::new();
        }

        self.last_cycle = Some(Instant::now());

        let due = providers.due_self_records(self.threshold);

        debug!(due = due.len(), "Reprovide cycle starting");
        self.emit(ReprovideEvent::CycleStarted { due: due.len() });

        if due.is_empty() {
            self.emit(ReprovideEvent::CycleDone { announced: 0 });
        } else {
            self.pending = due.iter().map(|(key, _)| *key).collect();
            self.announced = 0;
        }

        due
    }

    /// Record that one of the cycle's announcements finished.
    pub fn announce_done(&mut self, key: &Id, stored: bool) {
        if !self.pending.remove(key) {
            return;
        }

        if stored {
            self.announced += 1;
        }

        if self.pending.is_empty() {
            debug!(announced = self.announced, "Reprovide cycle done");
            self.emit(ReprovideEvent::CycleDone {
                announced: self.announced,
            });
        }
    }

    fn emit(&mut self, event: ReprovideEvent) {
        self.watchers
            .retain(|watcher| watcher.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_self_records_are_never_reprovided() {
        let now = Instant::now();

        assert!(!should_reprovide(
            false,
            now,
            now,
            Duration::from_secs(60)
        ));
    }

    #[test]
    fn self_record_far_from_expiry_is_not_due() {
        let now = Instant::now();
        let expires_at = now + Duration::from_secs(600);

        assert!(!should_reprovide(
            true,
            expires_at,
            now,
            Duration::from_secs(60)
        ));
    }

    #[test]
    fn self_record_near_expiry_is_due() {
        let now = Instant::now();
        let expires_at = now + Duration::from_secs(30);

        assert!(should_reprovide(
            true,
            expires_at,
            now,
            Duration::from_secs(60)
        ));
    }

    #[test]
    fn expired_self_record_is_still_due() {
        let now = Instant::now();
        let expires_at = now - Duration::from_secs(30);

        assert!(should_reprovide(
            true,
            expires_at,
            now,
            Duration::from_secs(60)
        ));
    }

    #[test]
    fn cycle_done_once_every_announcement_completes() {
        let mut reprovider = Reprovider::new(Duration::from_secs(3600), Duration::from_secs(60));
        let events = reprovider.subscribe();

        let first = Id::random();
        let second = Id::random();
        reprovider.pending = vec![first, second].into_iter().collect();

        reprovider.announce_done(&first, true);
        assert!(events.try_recv().is_err());

        reprovider.announce_done(&second, false);
        assert_eq!(
            events.try_recv(),
            Ok(ReprovideEvent::CycleDone { announced: 1 })
        );
    }

    #[test]
    fn stopped_reprovider_has_nothing_due() {
        let mut reprovider = Reprovider::new(Duration::from_millis(0), Duration::from_secs(60));
        reprovider.stop();

        let providers = ProviderStore::new(Id::random(), Duration::from_secs(60));

        assert!(reprovider.due(&providers).is_empty());
    }
}
