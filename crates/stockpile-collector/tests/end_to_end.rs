//! 모의 소스로 전체 수집 흐름을 검증합니다.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use stockpile_collector::modules::{
    CheckpointTracker, CollectionOrchestrator, MarketPlan, RunOptions, SourceBinding,
};
use stockpile_collector::{exit_code, CollectionPhase};
use stockpile_core::{Bar, FetchError, HistoryRecord, Market, MetricsRecord, PriceRecord, Ticker};
use stockpile_data::{DataSource, MemoryStorage, StaticUniverse, Storage};
use stockpile_resilience::{AdaptiveBatchConfig, AdaptiveBatchStrategy};

/// 종목별 실패를 주입할 수 있는 모의 소스.
#[derive(Default)]
struct MockSource {
    price_errors: HashMap<String, FetchError>,
    metrics_errors: HashMap<String, FetchError>,
    price_calls: AtomicUsize,
}

impl MockSource {
    fn fail_price(mut self, symbol: &str, error: FetchError) -> Self {
        self.price_errors.insert(symbol.to_string(), error);
        self
    }

    fn fail_metrics(mut self, symbol: &str, error: FetchError) -> Self {
        self.metrics_errors.insert(symbol.to_string(), error);
        self
    }
}

fn history_for(ticker: &Ticker) -> HistoryRecord {
    let start = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
    let seed = ticker.symbol().bytes().map(i64::from).sum::<i64>();
    let bars = (0..80)
        .map(|i| {
            // 완만한 상승 + 주기적 흔들림
            let wobble = [0, 3, -2, 4, -1][i % 5];
            let close = Decimal::from(100 + seed % 7 + i as i64 + wobble);
            Bar {
                date: start + chrono::Duration::days(i as i64),
                open: close - dec!(1),
                high: close + dec!(2),
                low: close - dec!(2),
                close,
                volume: 10_000 + (i as i64 % 7) * 500,
            }
        })
        .collect();
    HistoryRecord::new(bars)
}

#[async_trait]
impl DataSource for MockSource {
    fn name(&self) -> &str {
        "mock"
    }

    async fn price(&self, ticker: &Ticker) -> Result<PriceRecord, FetchError> {
        self.price_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.price_errors.get(ticker.symbol()) {
            return Err(error.clone());
        }
        history_for(ticker)
            .to_price_record()
            .ok_or_else(|| FetchError::NotFound("empty history".into()))
    }

    async fn history(
        &self,
        ticker: &Ticker,
        _lookback: usize,
    ) -> Result<HistoryRecord, FetchError> {
        Ok(history_for(ticker))
    }

    async fn metrics(&self, ticker: &Ticker) -> Result<MetricsRecord, FetchError> {
        if let Some(error) = self.metrics_errors.get(ticker.symbol()) {
            return Err(error.clone());
        }
        Ok(MetricsRecord {
            per: Some(dec!(15.2)),
            pbr: Some(dec!(2.1)),
            roe: Some(dec!(14.0)),
            dividend_yield: Some(dec!(1.8)),
            market_cap: Some(dec!(1000000000)),
            ..Default::default()
        })
    }
}

fn batch(batch_size: usize, max_consecutive_failures: u32) -> AdaptiveBatchStrategy {
    AdaptiveBatchStrategy::new(
        "mock",
        AdaptiveBatchConfig {
            batch_size,
            concurrency: 2,
            inter_batch_delay: Duration::ZERO,
            inter_batch_jitter: Duration::ZERO,
            max_consecutive_failures,
            ..AdaptiveBatchConfig::default()
        },
    )
}

fn plan(
    market: Market,
    symbols: &[&str],
    source: Arc<MockSource>,
    batch_size: usize,
) -> MarketPlan {
    let source: Arc<dyn DataSource> = source;
    let binding = SourceBinding::unguarded(source, batch(batch_size, 1));
    MarketPlan {
        market,
        universe: Arc::new(StaticUniverse::from_symbols(market, symbols)),
        prices: binding.clone(),
        history: binding.clone(),
        metrics: binding,
        metrics_fallback: None,
        benchmark: Some(Ticker::us("SPY")),
    }
}

fn temp_dir() -> PathBuf {
    std::env::temp_dir().join(format!("stockpile-e2e-{}", uuid::Uuid::new_v4()))
}

fn orchestrator(storage: Arc<MemoryStorage>, dir: &Path, resume: bool) -> CollectionOrchestrator {
    CollectionOrchestrator::new(storage as Arc<dyn Storage>, dir.join("checkpoints"))
        .with_reports_dir(dir.join("reports"))
        .with_options(RunOptions {
            resume,
            ..RunOptions::default()
        })
}

#[tokio::test]
async fn test_partial_failures_keep_successful_tickers() {
    let dir = temp_dir();
    let storage = Arc::new(MemoryStorage::new());
    let source = Arc::new(
        MockSource::default()
            .fail_price("B", FetchError::Network("connection reset".into()))
            .fail_metrics("C", FetchError::NotFound("no fundamentals".into())),
    );

    let run = orchestrator(storage.clone(), &dir, false)
        .run_market(&plan(Market::Us, &["A", "B", "C"], source, 10))
        .await;
    let result = &run.result;

    assert_eq!(result.phase, CollectionPhase::Complete);
    assert_eq!(result.total, 3);
    assert_eq!(result.successful, 2);
    assert_eq!(result.failed, 1);
    assert_eq!(result.missing_tickers, vec!["B".to_string()]);
    assert!(!result.abort_run);
    assert_eq!(exit_code(&[result.clone()]), 0);

    let symbols: Vec<&str> = run.merged.iter().map(|r| r.ticker.symbol()).collect();
    assert_eq!(symbols, vec!["A", "C"]);

    let a = &run.merged[0];
    assert!(a.metrics.is_some());
    assert!(a.technicals.as_ref().and_then(|t| t.rsi_14).is_some());
    // 소스가 주지 않은 52주 값은 히스토리로 보완
    assert!(a.metrics.as_ref().and_then(|m| m.week_52_high).is_some());

    let c = &run.merged[1];
    assert!(c.metrics.is_none());
    assert!(c.technicals.is_some());

    let saved: Vec<String> = storage
        .prices(Market::Us)
        .iter()
        .map(|r| r.ticker.symbol().to_string())
        .collect();
    assert_eq!(saved, vec!["A".to_string(), "C".to_string()]);
    let c_row = storage
        .metrics(Market::Us)
        .into_iter()
        .find(|r| r.ticker.symbol() == "C")
        .unwrap();
    assert!(c_row.metrics.is_none());
    assert!(c_row.technicals.is_some());

    let quality = run.quality.as_ref().unwrap();
    assert_eq!(quality.coverage, 66.67);
    assert!(!quality.passed);

    let checkpoint = CheckpointTracker::load(&dir.join("checkpoints"), Market::Us)
        .await
        .unwrap();
    assert_eq!(checkpoint.len(), 2);
    assert!(std::fs::read_dir(dir.join("reports")).unwrap().count() >= 1);

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn test_resume_collects_only_remaining() {
    let dir = temp_dir();
    let storage = Arc::new(MemoryStorage::new());

    let first = Arc::new(
        MockSource::default().fail_price("B", FetchError::Network("connection reset".into())),
    );
    orchestrator(storage.clone(), &dir, false)
        .run_market(&plan(Market::Us, &["A", "B", "C"], first, 10))
        .await;

    let second = Arc::new(MockSource::default());
    let run = orchestrator(storage.clone(), &dir, true)
        .run_market(&plan(Market::Us, &["A", "B", "C"], second.clone(), 10))
        .await;

    assert_eq!(run.result.phase, CollectionPhase::Complete);
    assert_eq!(run.result.skipped, 2);
    assert_eq!(run.result.successful, 1);
    assert!(run.result.missing_tickers.is_empty());
    assert_eq!(second.price_calls.load(Ordering::SeqCst), 1);
    assert_eq!(run.quality.unwrap().coverage, 100.0);
    assert_eq!(storage.prices(Market::Us).len(), 3);

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn test_auth_failure_aborts_run() {
    let dir = temp_dir();
    let storage = Arc::new(MemoryStorage::new());
    let source = Arc::new(
        MockSource::default().fail_price("005930", FetchError::Auth("invalid AUTH_KEY".into())),
    );

    let plans = vec![
        plan(Market::Kospi, &["005930", "000660"], source.clone(), 1),
        plan(Market::Kosdaq, &["247540"], source, 1),
    ];
    let runs = orchestrator(storage.clone(), &dir, false).run_all(&plans).await;

    assert_eq!(runs.len(), 1);
    let result = &runs[0].result;
    assert_eq!(result.phase, CollectionPhase::Failed);
    assert!(result.abort_run);
    assert!(result.errors.iter().any(|e| e.kind == "AUTH_ERROR"));
    assert!(storage.prices(Market::Kospi).is_empty());
    assert_eq!(exit_code(&[result.clone()]), 1);

    // 중단된 시장의 체크포인트는 기록되지 않음
    assert!(!CheckpointTracker::path_for(&dir.join("checkpoints"), Market::Kospi).exists());

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn test_rate_limit_halt_continues_with_successes() {
    let dir = temp_dir();
    let storage = Arc::new(MemoryStorage::new());
    let source = Arc::new(
        MockSource::default().fail_price("B", FetchError::RateLimited("HTTP 429".into())),
    );

    // 배치 1개 = 종목 1개, 연속 rate limit 배치 1회면 중단
    let run = orchestrator(storage.clone(), &dir, false)
        .run_market(&plan(Market::Us, &["A", "B", "C"], source.clone(), 1))
        .await;
    let result = &run.result;

    assert_eq!(result.phase, CollectionPhase::Complete);
    assert!(result.rate_limit_hit);
    assert_eq!(result.successful, 1);
    assert_eq!(
        result.missing_tickers,
        vec!["B".to_string(), "C".to_string()]
    );
    // C는 시도되지 않음
    assert_eq!(source.price_calls.load(Ordering::SeqCst), 2);
    assert_eq!(storage.prices(Market::Us).len(), 1);
    assert_eq!(exit_code(&[result.clone()]), 2);

    let _ = std::fs::remove_dir_all(dir);
}
