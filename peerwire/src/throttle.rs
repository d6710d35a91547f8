use std::time::Instant;

use crate::peer::codec::MAX_BLOCK_LEN;

/// Caps the rate at which block data is uploaded, shared by all sessions of a
/// swarm.
///
/// This is a token bucket: tokens, which are bytes, accumulate at the
/// configured rate up to a capacity of one second's worth of upload (or a
/// single block message, whichever is larger, so that a block can always be
/// sent eventually). Sending a block consumes as many tokens as it is long.
#[derive(Debug)]
pub struct UploadThrottle {
    /// Bytes per second, or `None` if the upload is not limited.
    rate: Option<u64>,
    tokens: f64,
    capacity: f64,
    last_refill: Instant,
}

impl UploadThrottle {
    /// Creates a throttle that lets everything through.
    pub fn unlimited() -> Self {
        Self {
            rate: None,
            tokens: 0.0,
            capacity: 0.0,
            last_refill: Instant::now(),
        }
    }

    /// Creates a throttle with the given rate in bytes per second that starts
    /// out with a full bucket.
    pub fn new(rate: Option<u64>, now: Instant) -> Self {
        let mut throttle = Self::unlimited();
        throttle.set_rate(rate, now);
        throttle
    }

    /// Changes the rate and refills the bucket.
    pub fn set_rate(&mut self, rate: Option<u64>, now: Instant) {
        self.rate = rate;
        if let Some(rate) = rate {
            // the largest message we may upload is a block message
            let min_capacity = (4 + 9 + MAX_BLOCK_LEN) as f64;
            self.capacity = (rate as f64).max(min_capacity);
            self.tokens = self.capacity;
        }
        self.last_refill = now;
    }

    pub fn rate(&self) -> Option<u64> {
        self.rate
    }

    /// Consumes `len` tokens if available and returns whether the bytes may be
    /// sent.
    pub fn try_consume(&mut self, len: usize, now: Instant) -> bool {
        let rate = match self.rate {
            Some(rate) => rate,
            None => return true,
        };

        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens = f64::min(
            self.capacity,
            self.tokens + elapsed.as_secs_f64() * rate as f64,
        );

        let len = len as f64;
        if self.tokens >= len {
            self.tokens -= len;
            true
        } else {
            false
        }
    }
}

impl Default for UploadThrottle {
    fn default() -> Self {
        Self::unlimited()
    }
}
