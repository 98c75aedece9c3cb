use backon::{BackoffBuilder, ConstantBuilder};
use std::time::Duration;

pub const LIVE_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Creates a backoff iterator for live kline stream reconnection.
/// Fixed delay between attempts, unlimited retries: the current bar must stay fresh,
/// so the stream loop never gives up.
pub fn reconnect_backoff(delay: Duration) -> impl Iterator<Item = Duration> {
    ConstantBuilder::default()
        .with_delay(delay)
        .without_max_times()
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_constant_and_unbounded() {
        let delays: Vec<Duration> = reconnect_backoff(LIVE_RECONNECT_DELAY).take(50).collect();

        assert_eq!(delays.len(), 50);
        assert!(delays.iter().all(|d| *d == LIVE_RECONNECT_DELAY));
    }
}
