//! Idle-flow flush scheduling.
//!
//! Runs on capture time (the newest packet timestamp seen), not wall-clock
//! time, so replaying an old capture flushes exactly as it would have live.
//! A check is due every `flush_after / 2`; each check finalizes flows idle
//! since before `now - flush_after`.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FlushScheduler {
    flush_after_us: Option<u64>,
    now_us: u64,
    next_check_us: Option<u64>,
}

impl FlushScheduler {
    pub fn new(flush_after: Option<Duration>) -> Self {
        Self {
            flush_after_us: flush_after.map(|d| d.as_micros().max(1) as u64),
            now_us: 0,
            next_check_us: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.flush_after_us.is_some()
    }

    /// Capture time as of the last tick.
    pub fn now_us(&self) -> u64 {
        self.now_us
    }

    /// Advance the capture clock to `timestamp_us`. Returns the cutoff when
    /// a check is due: flows last seen before it should be flushed.
    pub fn tick(&mut self, timestamp_us: u64) -> Option<u64> {
        let flush_after = self.flush_after_us?;
        let interval = (flush_after / 2).max(1);
        self.now_us = self.now_us.max(timestamp_us);

        let due = *self.next_check_us.get_or_insert(self.now_us + interval);
        if self.now_us < due {
            return None;
        }
        self.next_check_us = Some(self.now_us + interval);
        Some(self.now_us.saturating_sub(flush_after))
    }
}
