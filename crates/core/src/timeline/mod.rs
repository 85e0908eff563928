use std::time::{Duration, Instant};

/// Simulation time advanced explicitly by the tick loop.
#[derive(Debug, Default, Clone)]
pub struct PlaybackClock {
    pub time_seconds: f32,
}

impl PlaybackClock {
    pub fn reset(&mut self) {
        self.time_seconds = 0.0;
    }

    pub fn advance(&mut self, delta: f32) {
        self.time_seconds = (self.time_seconds + delta).max(0.0);
    }
}

/// Paces a tick loop at a fixed rate.
///
/// Deadlines are spaced one interval apart from the start. A loop that falls
/// more than one interval behind restarts its schedule from now instead of
/// bursting to catch up.
#[derive(Debug, Clone)]
pub struct TickClock {
    interval: Duration,
    started: Instant,
    next_deadline: Instant,
    ticks: u64,
}

impl TickClock {
    /// Rates that are not finite and positive fall back to one tick per second.
    pub fn new(rate_hz: f32) -> Self {
        let rate_hz = if rate_hz.is_finite() && rate_hz > 0.0 {
            rate_hz
        } else {
            1.0
        };
        let interval = Duration::from_secs_f32(1.0 / rate_hz);
        let now = Instant::now();
        Self {
            interval,
            started: now,
            next_deadline: now + interval,
            ticks: 0,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        self.interval
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn elapsed_seconds(&self) -> f32 {
        self.started.elapsed().as_secs_f32()
    }

    /// Moves to the next deadline as seen at `now` and returns how long to
    /// wait for it.
    pub fn advance(&mut self, now: Instant) -> Duration {
        self.ticks += 1;
        let wait = self.next_deadline.saturating_duration_since(now);
        if now > self.next_deadline + self.interval {
            self.next_deadline = now + self.interval;
        } else {
            self.next_deadline += self.interval;
        }
        wait
    }

    /// Sleeps until the next deadline.
    pub fn wait_next(&mut self) {
        let wait = self.advance(Instant::now());
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
    }
}
