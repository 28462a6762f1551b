//! Paced release of streamed response fragments
//!
//! Fragments arrive at whatever rhythm the server and network produce. The
//! scheduler buffers them and hands them on in batches separated by short,
//! slightly randomized pauses so the reply appears to be typed. It never
//! reorders anything: fragments leave in exactly the order they came in.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::PacingConfig;
use crate::jitter::Jitter;
use crate::state::TurnId;
use crate::timer::{earliest, TimerSlot};

/// A piece of the assistant's reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub text: String,
    /// Locally injected placeholder rather than server content
    pub synthetic: bool,
    pub received_at: Instant,
}

impl Fragment {
    pub fn real(text: impl Into<String>, now: Instant) -> Self {
        Self {
            text: text.into(),
            synthetic: false,
            received_at: now,
        }
    }

    pub fn synthetic(text: impl Into<String>, now: Instant) -> Self {
        Self {
            text: text.into(),
            synthetic: true,
            received_at: now,
        }
    }

    fn ends_sentence(&self) -> bool {
        matches!(self.text.trim_end().chars().last(), Some('.' | '!' | '?'))
    }
}

/// What a timer poll produced
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Release {
    pub fragments: Vec<Fragment>,
    /// Nothing was released for the whole idle window
    pub timed_out: bool,
}

pub struct ChunkScheduler {
    config: PacingConfig,
    jitter: Box<dyn Jitter>,
    turn: TurnId,
    buffer: VecDeque<Fragment>,
    // A cycle is running: `next_cycle` is armed for a pause or a grace
    // re-check and new fragments queue behind it
    releasing: bool,
    batch_count: u32,
    current_batch_size: usize,
    current_pause: Duration,
    sentence_boundary_pending: bool,
    last_release: Option<Instant>,
    real_received: usize,
    synthetic_sent: bool,
    next_cycle: TimerSlot<TurnId>,
    idle: TimerSlot<TurnId>,
}

impl ChunkScheduler {
    pub fn new(config: PacingConfig, jitter: Box<dyn Jitter>) -> Self {
        let current_batch_size = config
            .batch_size
            .clamp(config.min_batch_size.max(1), config.max_batch_size.max(1));
        let current_pause = Duration::from_millis(config.pause_ms);
        Self {
            config,
            jitter,
            turn: TurnId::default(),
            buffer: VecDeque::new(),
            releasing: false,
            batch_count: 0,
            current_batch_size,
            current_pause,
            sentence_boundary_pending: false,
            last_release: None,
            real_received: 0,
            synthetic_sent: false,
            next_cycle: TimerSlot::new(),
            idle: TimerSlot::new(),
        }
    }

    /// Drop everything and start over for `turn`. Timers armed for an
    /// earlier turn are cancelled.
    pub fn reset(&mut self, turn: TurnId) {
        self.turn = turn;
        self.buffer.clear();
        self.releasing = false;
        self.batch_count = 0;
        self.current_batch_size = self
            .config
            .batch_size
            .clamp(self.config.min_batch_size.max(1), self.config.max_batch_size.max(1));
        self.current_pause = Duration::from_millis(self.config.pause_ms);
        self.sentence_boundary_pending = false;
        self.last_release = None;
        self.real_received = 0;
        self.synthetic_sent = false;
        self.next_cycle.cancel();
        self.idle.cancel();
    }

    /// Start the idle watchdog without releasing anything, so a turn whose
    /// request went out but never gets an answer still ends.
    pub fn arm_watchdog(&mut self, now: Instant) {
        self.idle.arm(now, self.config.idle_timeout(), self.turn);
    }

    /// Queue a fragment. Returns whatever is released right away, which is
    /// only ever the head of a new cycle; anything arriving while a cycle
    /// runs waits for the next timer.
    pub fn ingest(&mut self, fragment: Fragment, now: Instant) -> Vec<Fragment> {
        if !fragment.synthetic {
            self.real_received += 1;
        }
        tracing::debug!(turn = %self.turn, len = fragment.text.len(), "fragment received");

        if !self.config.batching {
            self.mark_released(std::slice::from_ref(&fragment), now);
            return vec![fragment];
        }

        self.buffer.push_back(fragment);
        if self.releasing {
            return Vec::new();
        }
        self.release_batch(now)
    }

    /// Emit a placeholder fragment ahead of the real ones.
    ///
    /// Only the first call of a turn does anything, and only while no real
    /// fragment has arrived. The placeholder skips the buffer.
    pub fn inject_synthetic(&mut self, text: impl Into<String>, now: Instant) -> Option<Fragment> {
        if self.real_received > 0 || self.synthetic_sent {
            return None;
        }
        self.synthetic_sent = true;
        // Does not touch the idle watchdog: a placeholder is not progress
        Some(Fragment::synthetic(text, now))
    }

    /// Fire due timers.
    pub fn poll(&mut self, now: Instant) -> Release {
        let mut release = Release::default();

        if self.next_cycle.fire_if_current(now, self.turn) {
            if self.buffer.is_empty() {
                // Quiet through the grace window; the next arrival opens a new cycle
                self.releasing = false;
            } else {
                release.fragments = self.release_batch(now);
            }
        }

        if self.idle.fire_if_current(now, self.turn) {
            tracing::warn!(turn = %self.turn, "no fragment within the idle window");
            release.timed_out = true;
        }

        release
    }

    /// Completion: hand over everything still buffered, in order, and stop
    /// all timers.
    pub fn finish(&mut self) -> Vec<Fragment> {
        self.next_cycle.cancel();
        self.idle.cancel();
        self.releasing = false;
        self.buffer.drain(..).collect()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        earliest([self.next_cycle.deadline(), self.idle.deadline()])
    }

    pub fn turn(&self) -> TurnId {
        self.turn
    }

    pub fn has_real_fragments(&self) -> bool {
        self.real_received > 0
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_releasing(&self) -> bool {
        self.releasing
    }

    pub fn current_batch_size(&self) -> usize {
        self.current_batch_size
    }

    pub fn current_pause(&self) -> Duration {
        self.current_pause
    }

    pub fn last_release(&self) -> Option<Instant> {
        self.last_release
    }

    fn release_batch(&mut self, now: Instant) -> Vec<Fragment> {
        self.batch_count += 1;
        if self.batch_count > 1 {
            self.current_batch_size = self.jittered_batch_size();
        }

        let take = self.current_batch_size.min(self.buffer.len());
        let batch: Vec<Fragment> = self.buffer.drain(..take).collect();
        if batch.is_empty() {
            self.releasing = false;
            return batch;
        }

        self.sentence_boundary_pending = batch.last().map_or(false, Fragment::ends_sentence);
        self.mark_released(&batch, now);

        self.releasing = true;
        if self.buffer.is_empty() {
            // Re-check shortly in case the network is just between packets
            self.next_cycle.arm(now, self.config.grace(), self.turn);
        } else {
            let pause = self.next_pause();
            self.next_cycle.arm(now, pause, self.turn);
        }

        tracing::debug!(
            turn = %self.turn,
            released = batch.len(),
            buffered = self.buffer.len(),
            "batch released"
        );
        batch
    }

    fn mark_released(&mut self, fragments: &[Fragment], now: Instant) {
        if fragments.iter().all(|f| f.synthetic) {
            return;
        }
        self.last_release = Some(now);
        self.idle.arm(now, self.config.idle_timeout(), self.turn);
    }

    fn jittered_batch_size(&mut self) -> usize {
        let min = self.config.min_batch_size.max(1);
        let max = self.config.max_batch_size.max(min);
        let spread = self.config.batch_size_spread as f64 * self.jitter.signed();
        let size = (self.config.batch_size as f64 + spread).round().max(0.0) as usize;
        size.clamp(min, max)
    }

    fn next_pause(&mut self) -> Duration {
        let jitter = self.config.pause_jitter_ms as f64 * self.jitter.signed();
        let base = (self.config.pause_ms as f64 + jitter).round().max(0.0) as u64;
        let max = self.config.max_pause_ms.max(self.config.min_pause_ms);
        let mut pause = base.clamp(self.config.min_pause_ms, max);

        if self.sentence_boundary_pending {
            pause += self.config.sentence_pause_ms;
            self.sentence_boundary_pending = false;
        }

        self.current_pause = Duration::from_millis(pause);
        self.current_pause
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::jitter::{FixedJitter, RandomJitter, SequenceJitter};
    use pretty_assertions::assert_eq;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn scheduler() -> ChunkScheduler {
        let mut scheduler = ChunkScheduler::new(PacingConfig::default(), Box::new(FixedJitter(0.5)));
        scheduler.reset(TurnId(1));
        scheduler
    }

    fn texts(fragments: &[Fragment]) -> Vec<&str> {
        fragments.iter().map(|f| f.text.as_str()).collect()
    }

    /// Ingest every text at the same instant, returning what came out at once
    fn burst(scheduler: &mut ChunkScheduler, texts: &[&str], now: Instant) -> Vec<Fragment> {
        texts
            .iter()
            .flat_map(|text| scheduler.ingest(Fragment::real(*text, now), now))
            .collect()
    }

    /// Step through every deadline until the scheduler has nothing left.
    fn drain(scheduler: &mut ChunkScheduler, mut now: Instant) -> (Vec<Fragment>, Instant) {
        let mut out = Vec::new();
        while scheduler.buffered() > 0 {
            now = scheduler.next_deadline().expect("deadline while buffered");
            out.extend(scheduler.poll(now).fragments);
        }
        (out, now)
    }

    #[test]
    fn test_first_fragment_is_released_on_arrival() {
        let mut scheduler = scheduler();
        let now = Instant::now();

        let first = scheduler.ingest(Fragment::real("a", now), now);
        assert_eq!(texts(&first), vec!["a"]);
        assert!(scheduler.is_releasing());
        assert_eq!(scheduler.next_deadline(), Some(now + ms(500)));
    }

    #[test]
    fn test_burst_is_split_into_paced_batches() {
        let mut scheduler = scheduler();
        let start = Instant::now();
        let numbers: Vec<String> = (1..=13).map(|i| i.to_string()).collect();
        let numbers: Vec<&str> = numbers.iter().map(String::as_str).collect();

        let immediate = burst(&mut scheduler, &numbers, start);
        assert_eq!(texts(&immediate), vec!["1"]);
        assert_eq!(scheduler.buffered(), 12);
        assert_eq!(scheduler.next_deadline(), Some(start + ms(500)));

        // Nothing comes out early
        assert!(scheduler.poll(start + ms(499)).fragments.is_empty());
        let batch = scheduler.poll(start + ms(500)).fragments;
        assert_eq!(texts(&batch), vec!["2", "3", "4", "5", "6"]);
        assert_eq!(scheduler.current_pause(), ms(800));
        assert_eq!(scheduler.next_deadline(), Some(start + ms(1300)));

        assert!(scheduler.poll(start + ms(1299)).fragments.is_empty());
        let batch = scheduler.poll(start + ms(1300)).fragments;
        assert_eq!(texts(&batch), vec!["7", "8", "9", "10", "11"]);

        let batch = scheduler.poll(start + ms(2100)).fragments;
        assert_eq!(texts(&batch), vec!["12", "13"]);
        assert!(scheduler.is_releasing());
        assert_eq!(scheduler.next_deadline(), Some(start + ms(2600)));

        assert!(scheduler.poll(start + ms(2600)).fragments.is_empty());
        assert!(!scheduler.is_releasing());
    }

    #[test]
    fn test_trickle_is_grouped_into_batches() {
        let mut scheduler = scheduler();
        let start = Instant::now();
        let mut on_arrival = 0;
        let mut releases: Vec<(Instant, Vec<Fragment>)> = Vec::new();

        for i in 0..20u64 {
            let now = start + ms(50 * i);
            while let Some(deadline) = scheduler.next_deadline().filter(|d| *d <= now) {
                let batch = scheduler.poll(deadline).fragments;
                if !batch.is_empty() {
                    releases.push((deadline, batch));
                }
            }
            let released = scheduler.ingest(Fragment::real(format!("{} ", i), now), now);
            if !released.is_empty() {
                on_arrival += released.len();
                releases.push((now, released));
            }
        }
        let end = start + ms(50 * 19);
        let mut now = end;
        while scheduler.buffered() > 0 {
            now = scheduler.next_deadline().unwrap();
            releases.push((now, scheduler.poll(now).fragments));
        }

        assert_eq!(on_arrival, 1);
        for (_, batch) in &releases {
            assert!(batch.len() <= 8, "batch of {}", batch.len());
        }
        for pair in releases.windows(2) {
            assert!(pair[1].0 - pair[0].0 >= ms(500), "releases too close together");
        }
        let joined: String = releases
            .iter()
            .flat_map(|(_, batch)| batch.iter().map(|f| f.text.as_str()))
            .collect();
        let expected: String = (0..20).map(|i| format!("{} ", i)).collect();
        assert_eq!(joined, expected);
    }

    #[test]
    fn test_fragments_during_grace_wait_for_the_cycle() {
        let mut scheduler = scheduler();
        let start = Instant::now();
        scheduler.ingest(Fragment::real("a", start), start);

        let held = scheduler.ingest(Fragment::real("b", start + ms(100)), start + ms(100));
        assert!(held.is_empty());
        assert_eq!(scheduler.buffered(), 1);

        let batch = scheduler.poll(start + ms(500)).fragments;
        assert_eq!(texts(&batch), vec!["b"]);
    }

    #[test]
    fn test_fragment_after_quiet_period_is_released_at_once() {
        let mut scheduler = scheduler();
        let start = Instant::now();
        scheduler.ingest(Fragment::real("a", start), start);
        assert!(scheduler.poll(start + ms(500)).fragments.is_empty());
        assert!(!scheduler.is_releasing());

        let later = start + ms(900);
        let released = scheduler.ingest(Fragment::real("b", later), later);
        assert_eq!(texts(&released), vec!["b"]);
    }

    #[test]
    fn test_order_is_preserved_under_random_pacing() {
        let config = PacingConfig {
            batch_size_spread: 3,
            pause_jitter_ms: 600,
            ..PacingConfig::default()
        };
        let mut scheduler = ChunkScheduler::new(config, Box::new(RandomJitter::seeded(42)));
        scheduler.reset(TurnId(1));

        let pushed: Vec<String> = (0..200).map(|i| format!("w{} ", i)).collect();
        let mut now = Instant::now();
        let mut received = Vec::new();
        for (i, text) in pushed.iter().enumerate() {
            received.extend(scheduler.ingest(Fragment::real(text.clone(), now), now));
            if i % 17 == 0 {
                if let Some(deadline) = scheduler.next_deadline() {
                    now = deadline;
                    received.extend(scheduler.poll(now).fragments);
                }
            }
        }
        let (rest, _) = drain(&mut scheduler, now);
        received.extend(rest);

        let received: String = received.iter().map(|f| f.text.as_str()).collect();
        assert_eq!(received, pushed.concat());
    }

    #[test]
    fn test_batch_size_and_pause_stay_in_bounds() {
        let config = PacingConfig {
            batch_size_spread: 10,
            pause_jitter_ms: 2000,
            sentence_pause_ms: 0,
            ..PacingConfig::default()
        };
        let jitter = SequenceJitter::new(vec![0.0, 0.0, 0.99, 0.99, 0.0, 0.99]);
        let mut scheduler = ChunkScheduler::new(config, Box::new(jitter));
        scheduler.reset(TurnId(1));

        let start = Instant::now();
        let numbers: Vec<String> = (0..100).map(|i| i.to_string()).collect();
        let numbers: Vec<&str> = numbers.iter().map(String::as_str).collect();
        burst(&mut scheduler, &numbers, start);

        let mut now = start;
        while scheduler.buffered() > 0 {
            now = scheduler.next_deadline().unwrap();
            let batch = scheduler.poll(now).fragments;
            assert!((3..=8).contains(&scheduler.current_batch_size()));
            assert!(batch.len() <= 8);
            let pause = scheduler.current_pause();
            assert!(pause >= ms(600) && pause <= ms(1200), "pause {:?}", pause);
        }
    }

    #[test]
    fn test_sentence_end_extends_next_pause() {
        let mut scheduler = scheduler();
        let start = Instant::now();
        burst(
            &mut scheduler,
            &["One", " two", " three", " four", " five", " done.", " more"],
            start,
        );

        let batch = scheduler.poll(start + ms(500)).fragments;
        assert_eq!(batch.last().unwrap().text, " done.");
        assert_eq!(scheduler.current_pause(), ms(1000));
        assert_eq!(scheduler.next_deadline(), Some(start + ms(1500)));
    }

    #[test]
    fn test_sentence_bonus_only_counts_last_fragment() {
        let mut scheduler = scheduler();
        let start = Instant::now();
        burst(&mut scheduler, &["x", "Hi!", " a", " b", " c", " d", " e"], start);

        let batch = scheduler.poll(start + ms(500)).fragments;
        assert_eq!(texts(&batch), vec!["Hi!", " a", " b", " c", " d"]);
        assert_eq!(scheduler.current_pause(), ms(800));
    }

    #[test]
    fn test_empty_buffer_rechecks_after_grace() {
        let mut scheduler = scheduler();
        let start = Instant::now();
        scheduler.ingest(Fragment::real("only", start), start);

        assert_eq!(scheduler.next_deadline(), Some(start + ms(500)));
        let release = scheduler.poll(start + ms(500));
        assert!(release.fragments.is_empty());
        assert!(!release.timed_out);
        // Only the idle watchdog is left
        assert_eq!(scheduler.next_deadline(), Some(start + ms(8000)));
    }

    #[test]
    fn test_empty_fragments_are_forwarded() {
        let mut scheduler = scheduler();
        let now = Instant::now();
        let released = scheduler.ingest(Fragment::real("", now), now);
        assert_eq!(texts(&released), vec![""]);
        assert!(scheduler.has_real_fragments());
    }

    #[test]
    fn test_idle_timeout_after_silence() {
        let mut scheduler = scheduler();
        let start = Instant::now();
        scheduler.ingest(Fragment::real("partial", start), start);

        assert!(!scheduler.poll(start + ms(7999)).timed_out);
        assert!(scheduler.poll(start + ms(8000)).timed_out);
    }

    #[test]
    fn test_no_premature_completion_with_short_gaps() {
        let mut scheduler = scheduler();
        let mut now = Instant::now();
        for i in 0..10 {
            scheduler.ingest(Fragment::real(i.to_string(), now), now);
            // Walk through every timer in the gap before the next fragment
            let next = now + ms(5000);
            while let Some(deadline) = scheduler.next_deadline().filter(|d| *d <= next) {
                assert!(!scheduler.poll(deadline).timed_out, "timed out at fragment {}", i);
            }
            now = next;
        }
    }

    #[test]
    fn test_watchdog_covers_turn_without_fragments() {
        let mut scheduler = scheduler();
        let start = Instant::now();
        scheduler.arm_watchdog(start);
        assert!(scheduler.poll(start + ms(8000)).timed_out);
    }

    #[test]
    fn test_placeholder_does_not_extend_watchdog() {
        let mut scheduler = scheduler();
        let start = Instant::now();
        scheduler.arm_watchdog(start);
        scheduler.inject_synthetic("Let me see", start + ms(800)).unwrap();

        assert_eq!(scheduler.next_deadline(), Some(start + ms(8000)));
        assert!(scheduler.poll(start + ms(8000)).timed_out);
    }

    #[test]
    fn test_synthetic_fragment_only_before_real() {
        let mut scheduler = scheduler();
        let now = Instant::now();

        let fake = scheduler.inject_synthetic("Thinking about it", now).unwrap();
        assert!(fake.synthetic);
        assert!(!scheduler.has_real_fragments());
        assert!(scheduler.inject_synthetic("again", now).is_none());

        let mut scheduler = self::scheduler();
        scheduler.ingest(Fragment::real("Real", now), now);
        assert!(scheduler.inject_synthetic("late", now).is_none());
    }

    #[test]
    fn test_reset_discards_timers_of_previous_turn() {
        let mut scheduler = scheduler();
        let start = Instant::now();
        burst(&mut scheduler, &["a", "b", "c", "d", "e", "f", "g", "h", "i"], start);
        assert!(scheduler.next_deadline().is_some());

        scheduler.reset(TurnId(2));
        assert_eq!(scheduler.buffered(), 0);
        assert_eq!(scheduler.next_deadline(), None);
        assert_eq!(scheduler.poll(start + ms(60_000)), Release::default());
        assert_eq!(scheduler.turn(), TurnId(2));
    }

    #[test]
    fn test_finish_flushes_in_order() {
        let mut scheduler = scheduler();
        let start = Instant::now();
        burst(&mut scheduler, &["a", "b", "c", "d", "e", "f", "g"], start);
        let batch = scheduler.poll(start + ms(500)).fragments;
        assert_eq!(texts(&batch), vec!["b", "c", "d", "e", "f"]);

        let rest = scheduler.finish();
        assert_eq!(texts(&rest), vec!["g"]);
        assert_eq!(scheduler.next_deadline(), None);
        assert!(!scheduler.is_releasing());
    }

    #[test]
    fn test_batching_disabled_passes_through() {
        let config = PacingConfig {
            batching: false,
            ..PacingConfig::default()
        };
        let mut scheduler = ChunkScheduler::new(config, Box::new(FixedJitter(0.5)));
        scheduler.reset(TurnId(1));
        let now = Instant::now();

        for text in ["a", "b", "c"] {
            let released = scheduler.ingest(Fragment::real(text, now), now);
            assert_eq!(texts(&released), vec![text]);
        }
        assert_eq!(scheduler.buffered(), 0);
    }
}
