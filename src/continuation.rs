//! Autoplay of the next episode near the end of the current one.

/// Remaining seconds below which the next-episode prompt arms.
pub const ARM_WINDOW_SECONDS: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationState {
    Idle,
    Armed,
    Counting { remaining: u64 },
    Dismissed,
    Advancing,
}

/// What a time-update tick changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Unchanged,
    /// Went Idle -> Armed -> Counting on this tick.
    Armed { remaining: u64 },
    Countdown { remaining: u64 },
}

#[derive(Debug)]
pub struct ContinuationController {
    state: ContinuationState,
    next_episode: Option<String>,
}

impl ContinuationController {
    pub fn new(next_episode: Option<String>) -> Self {
        Self {
            state: ContinuationState::Idle,
            next_episode,
        }
    }

    pub fn state(&self) -> ContinuationState {
        self.state
    }

    pub fn countdown(&self) -> Option<u64> {
        match self.state {
            ContinuationState::Counting { remaining } => Some(remaining),
            _ => None,
        }
    }

    /// New episode identity: back to Idle.
    pub fn reset(&mut self, next_episode: Option<String>) {
        self.state = ContinuationState::Idle;
        self.next_episode = next_episode;
    }

    pub fn on_time_update(&mut self, position: f64, duration: f64) -> Tick {
        if !duration.is_finite() || duration <= 0.0 || !position.is_finite() {
            return Tick::Unchanged;
        }
        let remaining = duration - position;
        match self.state {
            ContinuationState::Idle => {
                if remaining > 0.0 && remaining < ARM_WINDOW_SECONDS && self.next_episode.is_some()
                {
                    self.state = ContinuationState::Armed;
                    let remaining = remaining.ceil() as u64;
                    self.state = ContinuationState::Counting { remaining };
                    tracing::debug!(remaining, "next-episode countdown armed");
                    Tick::Armed { remaining }
                } else {
                    Tick::Unchanged
                }
            }
            ContinuationState::Armed | ContinuationState::Counting { .. } => {
                if remaining <= 0.0 {
                    return Tick::Unchanged;
                }
                let remaining = remaining.ceil() as u64;
                let changed = self.countdown() != Some(remaining);
                self.state = ContinuationState::Counting { remaining };
                if changed {
                    Tick::Countdown { remaining }
                } else {
                    Tick::Unchanged
                }
            }
            ContinuationState::Dismissed | ContinuationState::Advancing => Tick::Unchanged,
        }
    }

    /// User dismissed the prompt. Returns whether anything changed.
    pub fn cancel(&mut self) -> bool {
        match self.state {
            ContinuationState::Armed | ContinuationState::Counting { .. } => {
                self.state = ContinuationState::Dismissed;
                true
            }
            ContinuationState::Idle
            | ContinuationState::Dismissed
            | ContinuationState::Advancing => false,
        }
    }

    /// Explicit "play now": advances from any live state once a next episode
    /// is known, including after the prompt was dismissed.
    pub fn play_now(&mut self) -> Option<String> {
        match self.state {
            ContinuationState::Advancing => None,
            ContinuationState::Idle
            | ContinuationState::Armed
            | ContinuationState::Counting { .. }
            | ContinuationState::Dismissed => self.advance(),
        }
    }

    /// End of stream. Advances unless the prompt was dismissed.
    pub fn on_ended(&mut self) -> Option<String> {
        match self.state {
            ContinuationState::Idle
            | ContinuationState::Armed
            | ContinuationState::Counting { .. } => self.advance(),
            ContinuationState::Dismissed | ContinuationState::Advancing => None,
        }
    }

    fn advance(&mut self) -> Option<String> {
        let next = self.next_episode.clone()?;
        self.state = ContinuationState::Advancing;
        Some(next)
    }
}
