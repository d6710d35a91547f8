use std::time::{Duration, Instant};

/// Counts the messages a peer can abuse to keep us busy without transferring
/// anything, over fixed windows of time.
#[derive(Debug)]
pub(crate) struct FloodingStat {
    window_start: Instant,
    /// Choke and unchoke messages that changed the choke state.
    choke_unchoke_count: u32,
    keep_alive_count: u32,
}

/// Which of the limits was exceeded.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Flood {
    ChokeUnchoke(u32),
    KeepAlive(u32),
}

impl FloodingStat {
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            choke_unchoke_count: 0,
            keep_alive_count: 0,
        }
    }

    pub fn record_choke_unchoke(&mut self) {
        self.choke_unchoke_count += 1;
    }

    pub fn record_keep_alive(&mut self) {
        self.keep_alive_count += 1;
    }

    /// Checks the counts of the current window against the limits, which are
    /// the given ratios of messages per second of the window. The counts are
    /// reset once the window has passed.
    pub fn check(
        &mut self,
        now: Instant,
        window: Duration,
        choke_ratio: f64,
        keep_alive_ratio: f64,
    ) -> Result<(), Flood> {
        let window_secs = window.as_secs_f64();
        if self.choke_unchoke_count as f64 >= choke_ratio * window_secs {
            return Err(Flood::ChokeUnchoke(self.choke_unchoke_count));
        }
        if self.keep_alive_count as f64 >= keep_alive_ratio * window_secs {
            return Err(Flood::KeepAlive(self.keep_alive_count));
        }

        if now.saturating_duration_since(self.window_start) >= window {
            self.window_start = now;
            self.choke_unchoke_count = 0;
            self.keep_alive_count = 0;
        }
        Ok(())
    }
}
