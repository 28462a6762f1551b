//! Deadline slots with fire-time guards
//!
//! Every timer in the client (backoff, batch pause, idle finalization,
//! placeholder injection, send retry, keepalive) is a `TimerSlot`. A slot holds
//! at most one deadline plus the tag captured when it was armed. The owner
//! compares that tag against its current turn or connection epoch when the
//! deadline passes, so a timer armed for superseded state is discarded instead
//! of acting on newer state.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct TimerSlot<Tag> {
    armed: Option<(Instant, Tag)>,
}

impl<Tag> Default for TimerSlot<Tag> {
    fn default() -> Self {
        Self { armed: None }
    }
}

impl<Tag: Copy + PartialEq> TimerSlot<Tag> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or re-arm) the slot to fire `after` from `now`
    pub fn arm(&mut self, now: Instant, after: Duration, tag: Tag) {
        self.armed = Some((now + after, tag));
    }

    pub fn cancel(&mut self) {
        self.armed = None;
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.armed.as_ref().map(|(at, _)| *at)
    }

    pub fn tag(&self) -> Option<Tag> {
        self.armed.as_ref().map(|(_, tag)| *tag)
    }

    /// Disarm and return the tag if the deadline has passed.
    pub fn take_expired(&mut self, now: Instant) -> Option<Tag> {
        match self.armed {
            Some((at, tag)) if at <= now => {
                self.armed = None;
                Some(tag)
            }
            _ => None,
        }
    }

    /// Like `take_expired`, but only yields when the captured tag still
    /// matches `current`. Stale expirations are dropped.
    pub fn fire_if_current(&mut self, now: Instant, current: Tag) -> bool {
        match self.take_expired(now) {
            Some(tag) if tag == current => true,
            Some(_) => {
                tracing::debug!("dropping stale timer");
                false
            }
            None => false,
        }
    }
}

/// Earliest of a set of optional deadlines
pub fn earliest<I>(deadlines: I) -> Option<Instant>
where
    I: IntoIterator<Item = Option<Instant>>,
{
    deadlines.into_iter().flatten().min()
}
