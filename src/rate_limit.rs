//! `--rate-limit` values for LLM field extraction.
//!
//! A limit is a request count over a window, like `10/s`, `500/m` or
//! `100/10s`. Requests are released evenly across the window, with the first
//! window's worth available at once.

use std::{fmt, str::FromStr, time::Duration};

use leaky_bucket::RateLimiter;

use crate::prelude::*;

/// How many chunk requests we may send per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    requests: usize,
    window_count: u64,
    window_unit: char,
}

impl RateLimit {
    /// The length of one window.
    pub fn window(&self) -> Duration {
        let unit_secs = match self.window_unit {
            's' => 1,
            'm' => 60,
            _ => 60 * 60,
        };
        Duration::from_secs(self.window_count * unit_secs)
    }

    /// The gap between requests once the initial burst is spent.
    pub fn spacing(&self) -> Duration {
        self.window() / u32::try_from(self.requests).unwrap_or(u32::MAX)
    }

    pub fn to_rate_limiter(&self) -> RateLimiter {
        RateLimiter::builder()
            .initial(self.requests)
            .max(self.requests)
            .refill(1)
            .interval(self.spacing().max(Duration::from_millis(1)))
            .build()
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/", self.requests)?;
        if self.window_count != 1 {
            write!(f, "{}", self.window_count)?;
        }
        write!(f, "{}", self.window_unit)
    }
}

impl FromStr for RateLimit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse = || -> Result<Self> {
            let (requests, window) = s
                .split_once('/')
                .ok_or_else(|| anyhow!("expected a limit like \"10/s\" or \"100/10s\""))?;
            let requests = requests.trim().parse::<usize>()?;

            let window = window.trim();
            let window_unit = window
                .chars()
                .last()
                .filter(|c| matches!(c, 's' | 'm' | 'h'))
                .ok_or_else(|| anyhow!("window must end in s, m or h"))?;
            let window_count = match &window[..window.len() - 1] {
                "" => 1,
                count => count.parse::<u64>()?,
            };
            if requests == 0 || window_count == 0 {
                return Err(anyhow!("limit must allow at least one request per window"));
            }
            Ok(Self {
                requests,
                window_count,
                window_unit,
            })
        };
        parse().with_context(|| format!("Failed to parse rate limit {s:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_windows() {
        for (input, window, spacing) in [
            ("10/s", Duration::from_secs(1), Duration::from_millis(100)),
            ("500/m", Duration::from_secs(60), Duration::from_millis(120)),
            ("100/10s", Duration::from_secs(10), Duration::from_millis(100)),
            ("3600/h", Duration::from_secs(3600), Duration::from_secs(1)),
        ] {
            let limit = input.parse::<RateLimit>().unwrap();
            assert_eq!(limit.window(), window, "{input}");
            assert_eq!(limit.spacing(), spacing, "{input}");
            assert_eq!(limit.to_string(), input);
        }
    }

    #[test]
    fn rejects_bad_limits() {
        for input in ["10/d", "ten/s", "10", "0/s", "5/0m", "5/xs", "5/"] {
            assert!(input.parse::<RateLimit>().is_err(), "{input}");
        }
    }

    #[tokio::test]
    async fn limiter_allows_one_window_up_front() {
        let limiter = "3/h".parse::<RateLimit>().unwrap().to_rate_limiter();
        assert!(limiter.try_acquire(3));
        assert!(!limiter.try_acquire(1));
    }
}
