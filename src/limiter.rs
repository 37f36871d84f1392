use std::time::Duration;

// Transfer-rate throttle shared by all peers of a torrent, one instance
// per direction. A reservation either passes immediately (zero) or tells
// the caller how long to back off before retrying; the writer never sleeps
// while holding the torrent lock.
pub trait RateLimiter: Send + Sync {
    fn reserve(&self, n: usize) -> Duration;
}

// Default limiter: everything passes.
#[derive(Debug, Default)]
pub struct Unlimited;

impl RateLimiter for Unlimited {
    fn reserve(&self, _n: usize) -> Duration {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_delays() {
        let limiter = Unlimited;
        assert_eq!(limiter.reserve(0x4000), Duration::ZERO);
        assert_eq!(limiter.reserve(usize::MAX), Duration::ZERO);
    }
}
