//! 시장별 소스/가드 구성.
//!
//! - US: Yahoo 하나로 가격/히스토리/지표. 지표 단계는 서킷 브레이커 없이
//!   레이트 리미터와 재시도만 적용합니다.
//! - KR: KRX Open API(주), 네이버 금융(보조), Yahoo(가격/히스토리 전용).
//!   모든 단계를 서킷 브레이커로 감쌉니다.
//!
//! 같은 소스의 브레이커와 리미터는 실행 전체에서 하나씩 만들어 단계와
//! 시장 사이에서 `Arc`로 공유됩니다.

use std::sync::Arc;

use stockpile_core::{Market, Ticker};
use stockpile_data::{
    benchmark_ticker, DataSource, KrxApiSource, KrxUniverseProvider, NaverFinanceSource,
    TickerUniverseProvider, YahooScreenerUniverse, YahooSource,
};
use stockpile_resilience::{
    AdaptiveBatchStrategy, CircuitBreaker, RetryExecutor, SourceGuard, TokenBucketRateLimiter,
};

use crate::config::{CollectorConfig, SourceSettings};
use crate::error::Result;

/// 한 단계에서 사용할 소스와 회복탄력성 구성.
#[derive(Clone)]
pub struct SourceBinding {
    pub source: Arc<dyn DataSource>,
    pub guard: SourceGuard,
    pub batch: Arc<AdaptiveBatchStrategy>,
}

impl SourceBinding {
    /// 가드 없이 소스만 연결 (테스트, dry-run).
    pub fn unguarded(source: Arc<dyn DataSource>, batch: AdaptiveBatchStrategy) -> Self {
        let name = source.name().to_string();
        Self {
            source,
            guard: SourceGuard::passthrough(name),
            batch: Arc::new(batch),
        }
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }
}

/// 시장 하나의 수집 계획.
#[derive(Clone)]
pub struct MarketPlan {
    pub market: Market,
    pub universe: Arc<dyn TickerUniverseProvider>,
    pub prices: SourceBinding,
    pub history: SourceBinding,
    pub metrics: SourceBinding,
    /// 주 소스가 실패했거나 핵심 필드가 빈 종목에만 사용
    pub metrics_fallback: Option<SourceBinding>,
    /// 베타 계산용 벤치마크
    pub benchmark: Option<Ticker>,
}

/// 소스 하나에 대한 공유 리소스.
struct SourceResources {
    settings: SourceSettings,
    limiter: Arc<TokenBucketRateLimiter>,
    breaker: Arc<CircuitBreaker>,
}

impl SourceResources {
    fn new(name: &str, settings: &SourceSettings) -> Self {
        Self {
            settings: settings.clone(),
            limiter: Arc::new(TokenBucketRateLimiter::new(
                settings.rate_per_sec,
                settings.burst,
            )),
            breaker: Arc::new(CircuitBreaker::new(
                name,
                settings.circuit_breaker.clone(),
            )),
        }
    }

    fn binding(
        &self,
        source: Arc<dyn DataSource>,
        phase: &str,
        with_breaker: bool,
    ) -> SourceBinding {
        let name = format!("{}:{}", source.name(), phase);
        let mut guard = SourceGuard::new(&name)
            .with_rate_limiter(self.limiter.clone())
            .with_retry(RetryExecutor::new(&name, self.settings.retry.clone()));
        if with_breaker {
            guard = guard.with_circuit_breaker(self.breaker.clone());
        }

        let mut batch = self.settings.batch.clone();
        batch.concurrency = batch.concurrency.min(source.max_concurrency()).max(1);

        SourceBinding {
            source,
            guard,
            batch: Arc::new(AdaptiveBatchStrategy::new(name, batch)),
        }
    }
}

/// 실행 전체에서 공유하는 소스별 브레이커/리미터.
///
/// `--market all`에서 KOSPI와 KOSDAQ이 같은 KRX 브레이커를 보므로, 앞 시장에서
/// 열린 서킷과 소진된 토큰이 다음 시장에 그대로 이어집니다.
pub struct SharedResources {
    yahoo: SourceResources,
    krx: SourceResources,
    naver: SourceResources,
}

impl SharedResources {
    pub fn new(config: &CollectorConfig) -> Self {
        Self {
            yahoo: SourceResources::new("yahoo", &config.yahoo),
            krx: SourceResources::new("krx", &config.krx),
            naver: SourceResources::new("naver", &config.naver),
        }
    }

    /// 소스 이름("yahoo", "krx", "naver")으로 브레이커 조회.
    pub fn circuit_breaker(&self, source: &str) -> Option<&Arc<CircuitBreaker>> {
        match source {
            "yahoo" => Some(&self.yahoo.breaker),
            "krx" => Some(&self.krx.breaker),
            "naver" => Some(&self.naver.breaker),
            _ => None,
        }
    }
}

/// 여러 시장의 계획을 한 번에 만듭니다. 소스별 리소스는 모든 계획이 공유합니다.
pub fn build_plans(markets: &[Market], config: &CollectorConfig) -> Result<Vec<MarketPlan>> {
    let shared = SharedResources::new(config);
    markets
        .iter()
        .map(|&market| build_plan(market, config, &shared))
        .collect()
}

/// 설정과 공유 리소스로 시장 하나의 계획을 만듭니다.
pub fn build_plan(
    market: Market,
    config: &CollectorConfig,
    shared: &SharedResources,
) -> Result<MarketPlan> {
    let yahoo_res = &shared.yahoo;

    if market == Market::Us {
        let yahoo: Arc<dyn DataSource> = Arc::new(YahooSource::new()?);
        return Ok(MarketPlan {
            market,
            universe: Arc::new(YahooScreenerUniverse::new()),
            prices: yahoo_res.binding(yahoo.clone(), "prices", true),
            history: yahoo_res.binding(yahoo.clone(), "history", true),
            metrics: yahoo_res.binding(yahoo, "metrics", false),
            metrics_fallback: None,
            benchmark: Some(benchmark_ticker(market)),
        });
    }

    let yahoo: Arc<dyn DataSource> = Arc::new(YahooSource::price_history_only()?);
    let naver_res = &shared.naver;
    let naver: Arc<dyn DataSource> = Arc::new(NaverFinanceSource::new());

    let plan = match &config.krx_api_key {
        Some(key) => {
            let krx_res = &shared.krx;
            let krx: Arc<dyn DataSource> = Arc::new(KrxApiSource::new(key.clone()));
            MarketPlan {
                market,
                universe: Arc::new(KrxUniverseProvider::new()),
                prices: krx_res.binding(krx.clone(), "prices", true),
                history: yahoo_res.binding(yahoo, "history", true),
                metrics: krx_res.binding(krx, "metrics", true),
                metrics_fallback: Some(naver_res.binding(naver, "metrics", true)),
                benchmark: Some(benchmark_ticker(market)),
            }
        }
        None => {
            tracing::warn!(
                market = %market,
                "KRX_API_KEY 미설정: 네이버 금융을 주 지표 소스로 사용"
            );
            MarketPlan {
                market,
                universe: Arc::new(KrxUniverseProvider::new()),
                prices: yahoo_res.binding(yahoo.clone(), "prices", true),
                history: yahoo_res.binding(yahoo, "history", true),
                metrics: naver_res.binding(naver, "metrics", true),
                metrics_fallback: None,
                benchmark: Some(benchmark_ticker(market)),
            }
        }
    };
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;
    use stockpile_resilience::CircuitState;

    fn config(krx_api_key: Option<&str>) -> CollectorConfig {
        CollectorConfig {
            data_dir: PathBuf::from("data"),
            checkpoint_dir: PathBuf::from("data/checkpoints"),
            backup_dir: PathBuf::from("backups"),
            backup_keep: 7,
            database_url: None,
            krx_api_key: krx_api_key.map(String::from),
            universe_ttl: Duration::from_secs(60),
            history_lookback: 300,
            min_coverage: 95.0,
            yahoo: SourceSettings::yahoo_defaults(),
            krx: SourceSettings::krx_defaults(),
            naver: SourceSettings::naver_defaults(),
        }
    }

    fn single(market: Market, config: &CollectorConfig) -> MarketPlan {
        build_plan(market, config, &SharedResources::new(config)).unwrap()
    }

    #[test]
    fn test_us_metrics_skip_circuit_breaker() {
        let plan = single(Market::Us, &config(None));
        assert!(plan.prices.guard.circuit_breaker().is_some());
        assert!(plan.history.guard.circuit_breaker().is_some());
        assert!(plan.metrics.guard.circuit_breaker().is_none());
        assert!(plan.metrics_fallback.is_none());
        assert_eq!(plan.benchmark.unwrap().symbol(), "SPY");
    }

    #[test]
    fn test_kr_wraps_every_phase_and_shares_breaker() {
        let plan = single(Market::Kospi, &config(Some("key")));
        let prices_cb = plan.prices.guard.circuit_breaker().unwrap();
        let metrics_cb = plan.metrics.guard.circuit_breaker().unwrap();
        assert!(Arc::ptr_eq(prices_cb, metrics_cb));
        assert!(plan.history.guard.circuit_breaker().is_some());

        let fallback = plan.metrics_fallback.unwrap();
        assert_eq!(fallback.name(), "naver");
        assert!(fallback.guard.circuit_breaker().is_some());
    }

    #[test]
    fn test_kr_without_api_key_uses_naver_primary() {
        let plan = single(Market::Kosdaq, &config(None));
        assert_eq!(plan.metrics.name(), "naver");
        assert!(plan.metrics_fallback.is_none());
    }

    #[test]
    fn test_breaker_state_carries_across_markets() {
        let config = config(Some("key"));
        let plans = build_plans(&[Market::Us, Market::Kospi, Market::Kosdaq], &config).unwrap();

        // KOSPI 가격 단계에서 KRX 서킷이 열리면
        let kospi_cb = plans[1].prices.guard.circuit_breaker().unwrap();
        for _ in 0..config.krx.circuit_breaker.failure_threshold {
            kospi_cb.record_failure();
        }
        assert_eq!(kospi_cb.state(), CircuitState::Open);

        // KOSDAQ도 같은 서킷을 봄
        let kosdaq_cb = plans[2].prices.guard.circuit_breaker().unwrap();
        assert!(Arc::ptr_eq(kospi_cb, kosdaq_cb));
        assert_eq!(kosdaq_cb.state(), CircuitState::Open);
        assert!(plans[2].metrics.guard.circuit_breaker().unwrap().check().is_err());

        // Yahoo는 US와 KR 히스토리 단계가 공유
        assert!(Arc::ptr_eq(
            plans[0].prices.guard.circuit_breaker().unwrap(),
            plans[2].history.guard.circuit_breaker().unwrap(),
        ));
        // 다른 소스는 영향 없음
        let naver = plans[2].metrics_fallback.as_ref().unwrap();
        assert_eq!(
            naver.guard.circuit_breaker().unwrap().state(),
            CircuitState::Closed
        );
    }
}
