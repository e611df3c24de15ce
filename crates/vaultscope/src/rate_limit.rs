use std::{collections::VecDeque, time::Duration};
use tokio::{sync::Mutex, time::Instant};

/// Sliding-window limiter: at most `limit` acquisitions in any trailing `window`.
///
/// The wait happens while holding the lock, so concurrent callers queue up behind the one that
/// is sleeping and each sees an up-to-date window when it gets its turn.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    stamps: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn per_second(calls_per_second: u32) -> Self {
        Self::new(calls_per_second, Duration::from_secs(1))
    }

    pub fn new(limit: u32, window: Duration) -> Self {
        let limit = usize::try_from(limit.max(1)).unwrap_or(usize::MAX);
        Self {
            limit,
            window,
            stamps: Mutex::new(VecDeque::with_capacity(limit.min(1024))),
        }
    }

    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Suspend until one more call fits in the window, then record it.
    pub async fn acquire(&self) {
        let mut stamps = self.stamps.lock().await;
        self.evict(&mut stamps, Instant::now());
        while stamps.len() >= self.limit {
            let Some(oldest) = stamps.front().copied() else {
                break;
            };
            tokio::time::sleep_until(oldest + self.window).await;
            self.evict(&mut stamps, Instant::now());
        }
        stamps.push_back(Instant::now());
    }

    fn evict(&self, stamps: &mut VecDeque<Instant>, now: Instant) {
        while stamps
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= self.window)
        {
            stamps.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_limit_in_any_window() -> eyre::Result<()> {
        let k = 3_usize;
        let limiter = RateLimiter::per_second(3);
        let limiter = &limiter;

        let mut done: Vec<Instant> = join_all((0..10).map(|_| async move {
            limiter.acquire().await;
            Instant::now()
        }))
        .await;
        done.sort();

        for (i, start) in done.iter().enumerate() {
            let in_window = done
                .iter()
                .skip(i)
                .take_while(|t| t.duration_since(*start) < Duration::from_secs(1))
                .count();
            assert!(in_window <= k, "{in_window} calls within one second of call {i}");
        }
        let first = done.first().copied().ok_or_else(|| eyre::eyre!("no calls"))?;
        let last = done.last().copied().ok_or_else(|| eyre::eyre!("no calls"))?;
        assert_eq!(
            last.duration_since(first),
            Duration::from_secs(3),
            "10 calls at 3/s need three full windows"
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn calls_under_the_limit_do_not_wait() {
        let limiter = RateLimiter::per_second(5);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO, "no sleep below the limit");
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides_as_time_passes() {
        let limiter = RateLimiter::per_second(2);
        limiter.acquire().await;
        tokio::time::advance(Duration::from_millis(600)).await;
        limiter.acquire().await;

        let start = Instant::now();
        limiter.acquire().await;
        assert_eq!(
            start.elapsed(),
            Duration::from_millis(400),
            "third call waits for the first to leave the window"
        );
    }
}
