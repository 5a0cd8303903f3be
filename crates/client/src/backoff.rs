use std::time::Duration;

/// 指数退避：第 n 次重连前等待 `base * 2^(n-1)`，不超过 `max`
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn delay_at(&self, attempt: u32) -> Duration {
        let exp = std::cmp::min(attempt.saturating_sub(1), 20);
        let factor = 1u32 << exp;
        std::cmp::min(self.base.saturating_mul(factor), self.max)
    }
}
