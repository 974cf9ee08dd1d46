//! Single-shot countdown used for stage deadlines and the blind CTS grace delay.

use std::time::{Duration, Instant};

/// A single-shot timer. At most one deadline is live at a time.
#[derive(Debug, Default)]
pub struct StageTimer {
    deadline: Option<Instant>,
}

impl StageTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer to fire `duration` from now, replacing any earlier arm.
    pub fn arm(&mut self, duration: Duration) {
        self.arm_at(Instant::now() + duration);
    }

    /// Arm the timer to fire at `deadline`, replacing any earlier arm.
    pub fn arm_at(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Returns `true` once when the deadline has passed, disarming the timer.
    pub fn fire_if_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}
