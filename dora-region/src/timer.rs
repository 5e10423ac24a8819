use std::time::{Duration, Instant};

pub struct Timer {
    active: bool,
    timestamp: Instant,
}

impl Timer {
    pub fn new(active: bool) -> Timer {
        Timer {
            active,
            timestamp: Instant::now(),
        }
    }

    /// Milliseconds since the last call to `stop` (or since creation).
    pub fn stop(&mut self) -> f32 {
        assert!(self.active);
        let curr = Instant::now();
        let last = self.timestamp;
        self.timestamp = curr;

        in_ms(curr - last)
    }
}

pub fn in_ms(duration: Duration) -> f32 {
    duration.as_secs_f32() * 1000.0
}
