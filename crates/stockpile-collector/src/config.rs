//! 환경변수 기반 설정 모듈.
//!
//! 소스별 설정은 `YAHOO_`, `KRX_`, `NAVER_` 접두사로 덮어쓸 수 있습니다.
//! 예: `NAVER_BACKOFF_BASE_SECS=300`, `KRX_CB_FAILURE_THRESHOLD=3`.

use std::path::PathBuf;
use std::time::Duration;

use stockpile_resilience::{
    AdaptiveBatchConfig, BackoffPolicy, CircuitBreakerConfig, RetryPolicy,
};

use crate::Result;

/// Collector 전체 설정
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// JSON 결과 디렉토리
    pub data_dir: PathBuf,
    /// 체크포인트 디렉토리
    pub checkpoint_dir: PathBuf,
    /// 백업 디렉토리
    pub backup_dir: PathBuf,
    /// 보관할 백업 수
    pub backup_keep: usize,
    /// 설정 시 PostgreSQL에도 기록
    pub database_url: Option<String>,
    /// KRX Open API 인증키
    pub krx_api_key: Option<String>,
    /// 유니버스 캐시 TTL
    pub universe_ttl: Duration,
    /// 히스토리 룩백 (거래일)
    pub history_lookback: usize,
    /// 품질 검증 최소 커버리지 (%)
    pub min_coverage: f64,
    pub yahoo: SourceSettings,
    pub krx: SourceSettings,
    pub naver: SourceSettings,
}

/// 소스 하나의 회복탄력성 설정
#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub circuit_breaker: CircuitBreakerConfig,
    /// 초당 요청 수
    pub rate_per_sec: f64,
    pub burst: u32,
    pub retry: RetryPolicy,
    pub batch: AdaptiveBatchConfig,
}

impl SourceSettings {
    /// Yahoo Finance 기본값 (관대한 공개 API)
    pub fn yahoo_defaults() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_per_sec: 2.0,
            burst: 5,
            retry: RetryPolicy::default(),
            batch: AdaptiveBatchConfig::default(),
        }
    }

    /// KRX Open API 기본값
    pub fn krx_defaults() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_per_sec: 5.0,
            burst: 10,
            retry: RetryPolicy::default(),
            batch: AdaptiveBatchConfig {
                batch_size: 100,
                concurrency: 8,
                ..AdaptiveBatchConfig::default()
            },
        }
    }

    /// 네이버 금융 기본값 (스크래핑, 보수적)
    pub fn naver_defaults() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::conservative(),
            rate_per_sec: 1.0,
            burst: 2,
            retry: RetryPolicy::patient(),
            batch: AdaptiveBatchConfig::scraping(),
        }
    }

    /// `{prefix}_*` 환경변수로 기본값을 덮어씁니다.
    pub fn from_env(prefix: &str, defaults: SourceSettings) -> Self {
        let key = |name: &str| format!("{}_{}", prefix, name);
        let cb = defaults.circuit_breaker;
        let retry = defaults.retry;
        let batch = defaults.batch;
        let backoff = batch.backoff;

        Self {
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: env_var_parse(
                    &key("CB_FAILURE_THRESHOLD"),
                    cb.failure_threshold,
                ),
                recovery_timeout: env_secs(&key("CB_RECOVERY_SECS"), cb.recovery_timeout),
                success_threshold: env_var_parse(
                    &key("CB_SUCCESS_THRESHOLD"),
                    cb.success_threshold,
                ),
                max_open_cycles: env_var_parse(&key("CB_MAX_OPEN_CYCLES"), cb.max_open_cycles),
            },
            rate_per_sec: env_var_parse(&key("RATE_PER_SEC"), defaults.rate_per_sec),
            burst: env_var_parse(&key("BURST"), defaults.burst),
            retry: RetryPolicy {
                max_retries: env_var_parse(&key("MAX_RETRIES"), retry.max_retries),
                base_delay: env_millis(&key("RETRY_BASE_MS"), retry.base_delay),
                max_delay: env_millis(&key("RETRY_MAX_MS"), retry.max_delay),
                ..retry
            },
            batch: AdaptiveBatchConfig {
                batch_size: env_var_parse(&key("BATCH_SIZE"), batch.batch_size),
                concurrency: env_var_parse(&key("CONCURRENCY"), batch.concurrency),
                inter_batch_delay: env_millis(&key("BATCH_DELAY_MS"), batch.inter_batch_delay),
                inter_batch_jitter: env_millis(&key("BATCH_JITTER_MS"), batch.inter_batch_jitter),
                item_timeout: env_secs(&key("ITEM_TIMEOUT_SECS"), batch.item_timeout),
                batch_timeout: env_secs(&key("BATCH_TIMEOUT_SECS"), batch.batch_timeout),
                max_consecutive_failures: env_var_parse(
                    &key("MAX_CONSECUTIVE_FAILURES"),
                    batch.max_consecutive_failures,
                ),
                backoff: BackoffPolicy {
                    base: env_secs(&key("BACKOFF_BASE_SECS"), backoff.base),
                    max: env_secs(&key("BACKOFF_MAX_SECS"), backoff.max),
                    ..backoff
                },
                ..batch
            },
        }
    }
}

impl CollectorConfig {
    /// 환경변수에서 설정 로드
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            data_dir: env_path("DATA_DIR", "data"),
            checkpoint_dir: env_path("CHECKPOINT_DIR", "data/checkpoints"),
            backup_dir: env_path("BACKUP_DIR", "backups"),
            backup_keep: env_var_parse("BACKUP_KEEP", 7),
            database_url: env_var_opt("DATABASE_URL"),
            krx_api_key: env_var_opt("KRX_API_KEY"),
            universe_ttl: Duration::from_secs(env_var_parse("UNIVERSE_TTL_SECS", 21_600)),
            history_lookback: env_var_parse("HISTORY_LOOKBACK_DAYS", 300),
            min_coverage: env_var_parse("QUALITY_MIN_COVERAGE", 95.0),
            yahoo: SourceSettings::from_env("YAHOO", SourceSettings::yahoo_defaults()),
            krx: SourceSettings::from_env("KRX", SourceSettings::krx_defaults()),
            naver: SourceSettings::from_env("NAVER", SourceSettings::naver_defaults()),
        };
        config.validate()?;
        Ok(config)
    }

    /// 설정 값 검증
    pub fn validate(&self) -> Result<()> {
        for (name, source) in [("YAHOO", &self.yahoo), ("KRX", &self.krx), ("NAVER", &self.naver)] {
            if source.rate_per_sec <= 0.0 {
                return Err(crate::CollectorError::Config(format!(
                    "{}_RATE_PER_SEC는 0보다 커야 합니다",
                    name
                )));
            }
            if source.batch.batch_size == 0 || source.batch.concurrency == 0 {
                return Err(crate::CollectorError::Config(format!(
                    "{} 배치 크기와 동시성은 0보다 커야 합니다",
                    name
                )));
            }
        }
        if !(0.0..=100.0).contains(&self.min_coverage) {
            return Err(crate::CollectorError::Config(
                "QUALITY_MIN_COVERAGE는 0~100 범위여야 합니다".to_string(),
            ));
        }
        Ok(())
    }

    /// CLI `--batch-size`를 모든 소스에 적용
    pub fn override_batch_size(&mut self, batch_size: usize) {
        for source in [&mut self.yahoo, &mut self.krx, &mut self.naver] {
            source.batch.batch_size = batch_size.max(1);
        }
    }
}

/// 환경변수에서 값을 파싱 (실패 시 기본값 사용)
fn env_var_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// 비어 있지 않은 환경변수
fn env_var_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_path(key: &str, default: &str) -> PathBuf {
    env_var_opt(key)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_var_parse(key, default.as_secs()))
}

fn env_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_var_parse(key, default.as_millis() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_prefix_overrides() {
        std::env::set_var("CFGTEST_CB_FAILURE_THRESHOLD", "9");
        std::env::set_var("CFGTEST_BACKOFF_BASE_SECS", "300");
        std::env::set_var("CFGTEST_BATCH_SIZE", "not-a-number");

        let settings = SourceSettings::from_env("CFGTEST", SourceSettings::yahoo_defaults());

        assert_eq!(settings.circuit_breaker.failure_threshold, 9);
        assert_eq!(settings.batch.backoff.base, Duration::from_secs(300));
        // 파싱 실패는 기본값
        assert_eq!(settings.batch.batch_size, AdaptiveBatchConfig::default().batch_size);
        assert_eq!(settings.burst, 5);

        std::env::remove_var("CFGTEST_CB_FAILURE_THRESHOLD");
        std::env::remove_var("CFGTEST_BACKOFF_BASE_SECS");
        std::env::remove_var("CFGTEST_BATCH_SIZE");
    }

    #[test]
    fn test_backoff_asymmetry_defaults() {
        let krx = SourceSettings::krx_defaults();
        let naver = SourceSettings::naver_defaults();

        assert_eq!(krx.batch.backoff.base, Duration::from_secs(60));
        assert_eq!(krx.batch.backoff.max, Duration::from_secs(180));
        assert_eq!(naver.batch.backoff.base, Duration::from_secs(300));
        assert_eq!(naver.batch.backoff.max, Duration::from_secs(600));
    }
}
