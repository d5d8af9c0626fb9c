//! 연속 rate limit 배치에 대한 백오프 곡선.
//!
//! 공식 API와 스크래핑 소스는 서로 다른 곡선을 씁니다. 기본값은 실제
//! 서비스에 맞춰 조정된 값이므로 환경 변수로만 바꿉니다.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
    /// ±비율 지터 (0.0 ~ 1.0)
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::official_api()
    }
}

impl BackoffPolicy {
    /// 공식 API (KRX, Yahoo): 1분에서 시작해 최대 3분.
    pub fn official_api() -> Self {
        Self {
            base: Duration::from_secs(60),
            multiplier: 2.0,
            max: Duration::from_secs(180),
            jitter: 0.1,
        }
    }

    /// 스크래핑 (Naver): 5분에서 시작해 최대 10분.
    pub fn scraping() -> Self {
        Self {
            base: Duration::from_secs(300),
            multiplier: 2.0,
            max: Duration::from_secs(600),
            jitter: 0.1,
        }
    }

    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            ..Self::official_api()
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// `step`번째 백오프의 지터 없는 대기 시간.
    pub fn base_delay(&self, step: u32) -> Duration {
        let factor = self.multiplier.powi(step.min(32) as i32);
        let secs = (self.base.as_secs_f64() * factor).min(self.max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// 지터를 적용한 대기 시간. `max`를 넘지 않습니다.
    pub fn delay(&self, step: u32) -> Duration {
        let delay = self.base_delay(step);
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_secs_f64((delay.as_secs_f64() * factor).min(self.max.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_curves_differ_by_source_type() {
        let api = BackoffPolicy::official_api();
        let scraping = BackoffPolicy::scraping();

        assert_eq!(api.base_delay(0), Duration::from_secs(60));
        assert_eq!(api.base_delay(1), Duration::from_secs(120));
        assert_eq!(api.base_delay(5), Duration::from_secs(180));

        assert_eq!(scraping.base_delay(0), Duration::from_secs(300));
        assert_eq!(scraping.base_delay(3), Duration::from_secs(600));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = BackoffPolicy::official_api();
        for _ in 0..100 {
            let d = policy.delay(0).as_secs_f64();
            assert!((54.0..=66.0).contains(&d), "delay {d} out of band");
        }
        assert!(policy.delay(10) <= policy.max);
    }
}
