//! 지수 백오프 계산.
//!
//! 요청 재시도와 스트림 재연결이 같은 공식을 공유합니다:
//!
//! ```text
//! base(n)  = min(initial * multiplier^(n-1), max)      (n >= 1)
//! delay(n) = clamp(base(n) ± base(n) * jitter * U(-0.5, 0.5), 0, max)
//! ```

use std::time::Duration;

use rand::Rng;

/// 지수 백오프 정책.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    /// 첫 재시도 대기 시간
    pub initial_delay: Duration,
    /// 시도마다 곱해지는 배수
    pub multiplier: f64,
    /// 대기 시간 상한
    pub max_delay: Duration,
    /// 무작위 변동 비율 (0.0 = 변동 없음)
    pub jitter: f64,
}

impl ExponentialBackoff {
    /// 새 백오프 정책 생성.
    pub fn new(initial_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            multiplier,
            max_delay,
            jitter: 0.0,
        }
    }

    /// 무작위 변동 비율 설정.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.max(0.0);
        self
    }

    /// 변동이 없는 n번째(1부터) 대기 시간.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let max_ms = self.max_delay.as_secs_f64() * 1000.0;
        let raw_ms = self.initial_delay.as_secs_f64() * 1000.0 * self.multiplier.powi(exponent);

        // multiplier^n이 무한대로 발산해도 상한에서 잘린다
        let ms = if raw_ms.is_finite() {
            raw_ms.min(max_ms)
        } else {
            max_ms
        };
        millis_to_duration(ms)
    }

    /// 변동이 적용된 n번째(1부터) 대기 시간.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::thread_rng())
    }

    /// 주어진 난수 생성기로 변동을 적용한 대기 시간.
    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }

        let base_ms = base.as_secs_f64() * 1000.0;
        let max_ms = self.max_delay.as_secs_f64() * 1000.0;
        let offset = base_ms * self.jitter * rng.gen_range(-0.5..=0.5);
        millis_to_duration((base_ms + offset).clamp(0.0, max_ms))
    }
}

/// 밀리초(실수)를 나노초 단위로 반올림해 변환.
fn millis_to_duration(ms: f64) -> Duration {
    Duration::from_nanos((ms.max(0.0) * 1_000_000.0).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn reconnect_defaults() -> ExponentialBackoff {
        ExponentialBackoff::new(Duration::from_millis(500), 2.0, Duration::from_millis(30_000))
            .with_jitter(0.1)
    }

    #[test]
    fn test_base_delay_sequence() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(1000), 2.0, Duration::from_millis(10_000));

        assert_eq!(backoff.base_delay(1), Duration::from_millis(1000));
        assert_eq!(backoff.base_delay(2), Duration::from_millis(2000));
        assert_eq!(backoff.base_delay(3), Duration::from_millis(4000));
        assert_eq!(backoff.base_delay(4), Duration::from_millis(8000));
        assert_eq!(backoff.base_delay(5), Duration::from_millis(10_000));
        assert_eq!(backoff.base_delay(50), Duration::from_millis(10_000));
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(500), 2.0, Duration::from_millis(30_000));
        assert_eq!(backoff.delay(3), Duration::from_millis(2000));
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let backoff = reconnect_defaults();
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..200 {
            let delay = backoff.delay_with_rng(2, &mut rng).as_secs_f64() * 1000.0;
            // 1000ms ± 5%
            assert!((950.0..=1050.0).contains(&delay), "delay {delay} out of band");
        }
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let backoff = reconnect_defaults();
        assert!(backoff.delay(u32::MAX) <= Duration::from_millis(30_000));
    }

    proptest! {
        #[test]
        fn prop_delay_never_exceeds_cap(
            attempt in 1u32..200,
            initial_ms in 1u64..5_000,
            multiplier in 1.0f64..5.0,
            max_ms in 1u64..120_000,
            jitter in 0.0f64..1.0,
            seed in any::<u64>(),
        ) {
            let backoff = ExponentialBackoff::new(
                Duration::from_millis(initial_ms),
                multiplier,
                Duration::from_millis(max_ms),
            )
            .with_jitter(jitter);
            let mut rng = StdRng::seed_from_u64(seed);

            prop_assert!(backoff.delay_with_rng(attempt, &mut rng) <= backoff.max_delay);
        }

        #[test]
        fn prop_base_delay_is_monotonic(
            attempt in 1u32..100,
            initial_ms in 1u64..5_000,
            multiplier in 1.0f64..5.0,
            max_ms in 1u64..120_000,
        ) {
            let backoff = ExponentialBackoff::new(
                Duration::from_millis(initial_ms),
                multiplier,
                Duration::from_millis(max_ms),
            );

            prop_assert!(backoff.base_delay(attempt) <= backoff.base_delay(attempt + 1));
        }
    }
}
