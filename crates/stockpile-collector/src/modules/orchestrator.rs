//! 시장 단위 수집 오케스트레이터.
//!
//! INIT → PRICES → HISTORY → METRICS → TECHNICALS → SAVE → COMPLETE 순서로
//! 진행하며, 각 네트워크 단계는 [`SourceGuard`]를 거쳐 적응형 배치로
//! 실행됩니다. SAVE 이후 체크포인트 저장과 품질 검증이 이어집니다.
//!
//! 종목 하나의 실패는 해당 종목만 누락시키고, 인증 실패나 소진된 회로는
//! 시장을 FAILED로 만들고 `abort_run`을 세웁니다.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use stockpile_core::{
    CompanyRecord, ErrorKind, FetchError, HistoryRecord, Market, MergedRecord, MetricsRecord,
    PriceRecord, TechnicalIndicators, Ticker,
};
use stockpile_data::{
    merge_metrics, needs_fallback, write_json_atomic, MetricsRow, MetricsValidator, PriceRow,
    RuleTableValidator, SaveReport, StandardTechnicals, Storage, TechnicalsCalculator,
    UniverseCache,
};
use stockpile_resilience::{BatchOutcome, HaltReason};
use tracing::{debug, info, warn};

use super::checkpoint::CheckpointTracker;
use super::quality::{QualityReport, QualityVerifier, DEFAULT_MIN_COVERAGE};
use super::wiring::{MarketPlan, SourceBinding};
use crate::error::Result;
use crate::phase::CollectionPhase;
use crate::result::CollectionResult;

/// 실행 옵션.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// 체크포인트를 이어서 실행
    pub resume: bool,
    /// 유니버스 앞쪽 N개만 수집
    pub limit: Option<usize>,
    /// 지정 종목만 수집
    pub tickers: Option<Vec<String>>,
    /// 히스토리 룩백 (거래일)
    pub history_lookback: usize,
    pub min_coverage: f64,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            resume: false,
            limit: None,
            tickers: None,
            history_lookback: 300,
            min_coverage: DEFAULT_MIN_COVERAGE,
        }
    }
}

impl RunOptions {
    fn is_partial(&self) -> bool {
        self.limit.is_some() || self.tickers.is_some()
    }
}

/// 시장 하나의 실행 결과.
#[derive(Debug, Clone)]
pub struct MarketRun {
    pub result: CollectionResult,
    /// SAVE까지 도달한 경우에만 존재
    pub quality: Option<QualityReport>,
    /// 이번 실행에서 저장된 레코드 (유니버스 순서)
    pub merged: Vec<MergedRecord>,
}

#[derive(Serialize)]
struct RunReport<'a> {
    result: &'a CollectionResult,
    quality: Option<&'a QualityReport>,
}

/// 단계 실행 후 소스 상태 판정.
enum SourceVerdict {
    Continue,
    Abort,
}

/// 수집 오케스트레이터.
pub struct CollectionOrchestrator {
    storage: Arc<dyn Storage>,
    universe_cache: Arc<UniverseCache>,
    checkpoint_dir: PathBuf,
    reports_dir: Option<PathBuf>,
    validator: Arc<dyn MetricsValidator>,
    technicals: Arc<dyn TechnicalsCalculator>,
    options: RunOptions,
}

impl CollectionOrchestrator {
    pub fn new(storage: Arc<dyn Storage>, checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage,
            universe_cache: Arc::new(UniverseCache::new(Duration::from_secs(6 * 3600))),
            checkpoint_dir: checkpoint_dir.into(),
            reports_dir: None,
            validator: Arc::new(RuleTableValidator::default()),
            technicals: Arc::new(StandardTechnicals::default()),
            options: RunOptions::default(),
        }
    }

    pub fn with_universe_cache(mut self, cache: Arc<UniverseCache>) -> Self {
        self.universe_cache = cache;
        self
    }

    /// 시장별 JSON 실행 보고서 디렉토리.
    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = Some(dir.into());
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn MetricsValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_technicals(mut self, technicals: Arc<dyn TechnicalsCalculator>) -> Self {
        self.technicals = technicals;
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    /// 여러 시장을 순서대로 실행합니다. `abort_run`이 세워지면 남은 시장은 건너뜁니다.
    pub async fn run_all(&self, plans: &[MarketPlan]) -> Vec<MarketRun> {
        let mut runs = Vec::with_capacity(plans.len());
        for (idx, plan) in plans.iter().enumerate() {
            let run = self.run_market(plan).await;
            let abort = run.result.abort_run;
            runs.push(run);
            if abort {
                let skipped: Vec<&str> =
                    plans[idx + 1..].iter().map(|p| p.market.as_str()).collect();
                if !skipped.is_empty() {
                    warn!(skipped = ?skipped, "실행 중단: 남은 시장 건너뜀");
                }
                break;
            }
        }
        runs
    }

    /// 시장 하나를 수집합니다. 항상 결과를 반환합니다.
    pub async fn run_market(&self, plan: &MarketPlan) -> MarketRun {
        let mut result = CollectionResult::new(plan.market);
        info!(market = %plan.market, resume = self.options.resume, "시장 수집 시작");

        let (quality, merged) = match self.execute(plan, &mut result).await {
            Ok(Some((quality, merged))) => (Some(quality), merged),
            Ok(None) => (None, Vec::new()),
            Err(e) => {
                result.fail(ErrorKind::Other.as_str(), e.to_string());
                (None, Vec::new())
            }
        };

        result.log_summary();
        self.write_report(&result, quality.as_ref()).await;

        MarketRun {
            result,
            quality,
            merged,
        }
    }

    async fn execute(
        &self,
        plan: &MarketPlan,
        result: &mut CollectionResult,
    ) -> Result<Option<(QualityReport, Vec<MergedRecord>)>> {
        let market = plan.market;

        // INIT: 유니버스와 체크포인트
        let companies = match self.resolve_universe(plan).await {
            Ok(companies) => companies,
            Err(e) => {
                result.fail(ErrorKind::DataNotFound.as_str(), format!("유니버스 조회 실패: {}", e));
                return Ok(None);
            }
        };
        let universe: Vec<Ticker> = companies.iter().map(|c| c.ticker.clone()).collect();
        result.total = universe.len();

        let mut checkpoint = if self.options.resume {
            CheckpointTracker::load(&self.checkpoint_dir, market).await?
        } else {
            CheckpointTracker::empty(&self.checkpoint_dir, market)
        };
        let remaining = checkpoint.get_remaining(&universe);
        result.skipped = universe.len() - remaining.len();
        info!(
            market = %market,
            total = universe.len(),
            remaining = remaining.len(),
            skipped = result.skipped,
            "수집 대상 확정"
        );

        // PRICES
        result.enter(CollectionPhase::Prices)?;
        let source = plan.prices.source.clone();
        let outcome = fetch_phase(&plan.prices, remaining.clone(), |ticker| {
            let source = source.clone();
            async move { source.price(&ticker).await }
        })
        .await;
        if let SourceVerdict::Abort = absorb_flags(&plan.prices, &outcome, result) {
            return Ok(None);
        }
        let (prices, price_errors) = split_outcome(outcome);
        result.failed = price_errors.len();
        record_errors(result, &price_errors);

        // 가격이 없는 종목은 이후 단계에서 제외
        let priced: Vec<Ticker> = remaining
            .iter()
            .filter(|t| prices.contains_key(*t))
            .cloned()
            .collect();

        // HISTORY
        result.enter(CollectionPhase::History)?;
        let lookback = self.options.history_lookback;
        let source = plan.history.source.clone();
        let outcome = fetch_phase(&plan.history, priced.clone(), |ticker| {
            let source = source.clone();
            async move { source.history(&ticker, lookback).await }
        })
        .await;
        if let SourceVerdict::Abort = absorb_flags(&plan.history, &outcome, result) {
            return Ok(None);
        }
        let (histories, history_errors) = split_outcome(outcome);
        record_errors(result, &history_errors);

        let benchmark = match (&plan.benchmark, priced.is_empty()) {
            (Some(bench), false) => self.fetch_benchmark(&plan.history, bench).await,
            _ => None,
        };

        // METRICS
        result.enter(CollectionPhase::Metrics)?;
        let metrics = match self.collect_metrics(plan, &priced, &histories, result).await {
            Some(metrics) => metrics,
            None => return Ok(None),
        };

        // TECHNICALS
        result.enter(CollectionPhase::Technicals)?;
        let technicals: HashMap<Ticker, TechnicalIndicators> = histories
            .iter()
            .filter_map(|(ticker, history)| {
                let indicators = self.technicals.compute(history, benchmark.as_ref());
                (!indicators.is_empty()).then(|| (ticker.clone(), indicators))
            })
            .collect();
        debug!(market = %market, computed = technicals.len(), "기술지표 계산 완료");

        // SAVE
        result.enter(CollectionPhase::Save)?;
        let by_ticker: HashMap<&Ticker, &CompanyRecord> =
            companies.iter().map(|c| (&c.ticker, c)).collect();
        let merged = assemble(&priced, &by_ticker, prices, metrics, technicals);

        let saved = self.save(market, &merged, result).await?;
        result.successful = saved;

        // 체크포인트와 품질 검증은 SAVE의 후속 작업
        checkpoint.mark_batch_completed(merged.iter().map(|r| &r.ticker));
        if let Err(e) = checkpoint.save().await {
            warn!(market = %market, error = %e, "체크포인트 저장 실패");
            result.record_error(ErrorKind::Other.as_str(), format!("checkpoint: {}", e));
        }

        let symbols: Vec<String> = universe.iter().map(|t| t.symbol().to_string()).collect();
        let mut verifier = QualityVerifier::for_market(market, self.options.min_coverage);
        if self.options.is_partial() {
            verifier = verifier.restrict_major_to(&symbols);
        }
        let collected: HashSet<String> = checkpoint.completed().iter().cloned().collect();
        let collected_metrics: Vec<MetricsRecord> =
            merged.iter().filter_map(|r| r.metrics.clone()).collect();
        let quality = verifier.verify(market, &symbols, &collected, &collected_metrics);
        result.missing_tickers = quality.missing_tickers.clone();

        result.enter(CollectionPhase::Complete)?;
        Ok(Some((quality, merged)))
    }

    /// 유니버스 조회 후 `--tickers`, `--limit` 적용.
    async fn resolve_universe(&self, plan: &MarketPlan) -> Result<Vec<CompanyRecord>> {
        let market = plan.market;

        let mut companies: Vec<CompanyRecord> = match &self.options.tickers {
            Some(symbols) => {
                // 지정 종목은 유니버스 조회 실패와 무관하게 수집 (이름만 유실)
                let known = match self.universe_cache.get(plan.universe.as_ref(), market).await {
                    Ok(list) => list,
                    Err(e) => {
                        warn!(market = %market, error = %e, "유니버스 조회 실패, 지정 종목만 사용");
                        Arc::new(Vec::new())
                    }
                };
                symbols
                    .iter()
                    .map(|symbol| {
                        let ticker = if market.is_korean() {
                            Ticker::new(symbol.as_str(), market)
                        } else {
                            Ticker::us(symbol.as_str())
                        };
                        known
                            .iter()
                            .find(|c| c.ticker == ticker)
                            .cloned()
                            .unwrap_or_else(|| CompanyRecord::new(ticker))
                    })
                    .collect()
            }
            None => {
                let list = self.universe_cache.get(plan.universe.as_ref(), market).await?;
                list.iter().filter(|c| c.ticker.market() == market).cloned().collect()
            }
        };

        let mut seen = HashSet::new();
        companies.retain(|c| seen.insert(c.ticker.clone()));

        if let Some(limit) = self.options.limit {
            companies.truncate(limit);
        }
        Ok(companies)
    }

    async fn fetch_benchmark(
        &self,
        binding: &SourceBinding,
        bench: &Ticker,
    ) -> Option<HistoryRecord> {
        let lookback = self.options.history_lookback;
        let source = binding.source.clone();
        match binding
            .guard
            .call(|| {
                let source = source.clone();
                async move { source.history(bench, lookback).await }
            })
            .await
        {
            Ok(history) => Some(history),
            Err(e) => {
                warn!(benchmark = %bench.symbol(), error = %e, "벤치마크 히스토리 실패, 베타 생략");
                None
            }
        }
    }

    /// 주 소스 → 보조 소스 → 병합 → 52주 보완 → 검증.
    ///
    /// 실행 중단이 필요하면 `None`.
    async fn collect_metrics(
        &self,
        plan: &MarketPlan,
        priced: &[Ticker],
        histories: &HashMap<Ticker, HistoryRecord>,
        result: &mut CollectionResult,
    ) -> Option<HashMap<Ticker, MetricsRecord>> {
        let source = plan.metrics.source.clone();
        let outcome = fetch_phase(&plan.metrics, priced.to_vec(), |ticker| {
            let source = source.clone();
            async move { source.metrics(&ticker).await }
        })
        .await;
        if let SourceVerdict::Abort = absorb_flags(&plan.metrics, &outcome, result) {
            return None;
        }
        let (primary, primary_errors) = split_outcome(outcome);

        let mut secondary = HashMap::new();
        if let Some(fallback) = &plan.metrics_fallback {
            let candidates: Vec<Ticker> = priced
                .iter()
                .filter(|t| primary.get(*t).map_or(true, needs_fallback))
                .cloned()
                .collect();

            if !candidates.is_empty() {
                info!(
                    market = %plan.market,
                    source = %fallback.name(),
                    candidates = candidates.len(),
                    "보조 소스로 지표 보완"
                );
                let source = fallback.source.clone();
                let outcome = fetch_phase(fallback, candidates, |ticker| {
                    let source = source.clone();
                    async move { source.metrics(&ticker).await }
                })
                .await;
                if let SourceVerdict::Abort = absorb_flags(fallback, &outcome, result) {
                    return None;
                }
                let (ok, errors) = split_outcome(outcome);
                for (ticker, error) in &errors {
                    debug!(ticker = %ticker.symbol(), error = %error, "보조 소스 지표 실패");
                }
                secondary = ok;
            }
        }

        let outcome = merge_metrics(primary, secondary);
        if outcome.total_backfilled() > 0 || outcome.stale_primary > 0 {
            info!(
                market = %plan.market,
                primary = outcome.from_primary,
                secondary = outcome.from_secondary,
                backfilled = outcome.total_backfilled(),
                stale_primary = outcome.stale_primary,
                "지표 병합"
            );
        }

        // 두 소스 모두 실패한 종목만 에러로 남김
        let unresolved: Vec<(Ticker, FetchError)> = primary_errors
            .into_iter()
            .filter(|(t, _)| !outcome.merged.contains_key(t))
            .collect();
        record_errors(result, &unresolved);

        let validated = outcome
            .merged
            .into_iter()
            .map(|(ticker, mut record)| {
                if let Some(history) = histories.get(&ticker) {
                    fill_week_52(&mut record, history);
                }
                let record = self.validator.validate(&ticker, record);
                (ticker, record)
            })
            .collect();
        Some(validated)
    }

    async fn save(
        &self,
        market: Market,
        merged: &[MergedRecord],
        result: &mut CollectionResult,
    ) -> Result<usize> {
        let companies: Vec<CompanyRecord> = merged
            .iter()
            .map(|r| {
                r.company
                    .clone()
                    .unwrap_or_else(|| CompanyRecord::new(r.ticker.clone()))
            })
            .collect();
        let price_rows: Vec<PriceRow> = merged
            .iter()
            .map(|r| PriceRow {
                ticker: r.ticker.clone(),
                price: r.price.clone(),
            })
            .collect();
        let metric_rows: Vec<MetricsRow> = merged
            .iter()
            .filter(|r| r.metrics.is_some() || r.technicals.is_some())
            .map(|r| MetricsRow {
                ticker: r.ticker.clone(),
                date: r.price.date,
                metrics: r.metrics.clone(),
                technicals: r.technicals.clone(),
            })
            .collect();

        let mut report = SaveReport::default();
        report.absorb(self.storage.save_companies(market, &companies).await?);
        let prices_report = self.storage.save_prices(market, &price_rows).await?;
        let saved = prices_report.saved;
        report.absorb(prices_report);
        report.absorb(self.storage.save_metrics(market, &metric_rows).await?);

        for error in &report.errors {
            result.record_error("STORAGE", error.clone());
        }
        info!(
            market = %market,
            storage = %self.storage.name(),
            prices = saved,
            metrics = metric_rows.len(),
            skipped = report.skipped,
            errors = report.errors.len(),
            "저장 완료"
        );
        Ok(saved)
    }

    async fn write_report(&self, result: &CollectionResult, quality: Option<&QualityReport>) {
        let Some(dir) = &self.reports_dir else {
            return;
        };
        let path = dir.join(format!(
            "{}_{}.json",
            result.market.as_str().to_lowercase(),
            Utc::now().format("%Y%m%d_%H%M%S")
        ));
        let report = RunReport { result, quality };
        match write_json_atomic(&path, &report).await {
            Ok(()) => debug!(path = %path.display(), "실행 보고서 저장"),
            Err(e) => warn!(path = %path.display(), error = %e, "실행 보고서 저장 실패"),
        }
    }
}

/// 바인딩의 배치 전략과 가드로 종목별 요청을 실행합니다.
async fn fetch_phase<T, F, Fut>(
    binding: &SourceBinding,
    tickers: Vec<Ticker>,
    op: F,
) -> BatchOutcome<Ticker, T>
where
    F: Fn(Ticker) -> Fut,
    Fut: Future<Output = std::result::Result<T, FetchError>>,
{
    let guard = &binding.guard;
    let op = &op;
    binding
        .batch
        .run(tickers, move |ticker: Ticker| async move {
            guard.call(|| op(ticker.clone())).await
        })
        .await
}

/// 배치 결과의 중단 사유와 서킷 상태를 결과에 반영합니다.
fn absorb_flags<T>(
    binding: &SourceBinding,
    outcome: &BatchOutcome<Ticker, T>,
    result: &mut CollectionResult,
) -> SourceVerdict {
    if outcome.rate_limit_hit {
        result.rate_limit_hit = true;
    }
    if binding.guard.circuit_tripped() {
        result.circuit_breaker_tripped = true;
    }

    if outcome.halted == Some(HaltReason::Auth) {
        result.abort_run = true;
        result.fail(
            ErrorKind::AuthError.as_str(),
            format!("{}: {}", binding.name(), HaltReason::Auth),
        );
        return SourceVerdict::Abort;
    }
    if binding.guard.circuit_exhausted() {
        result.abort_run = true;
        result.fail(
            ErrorKind::CircuitOpen.as_str(),
            format!("{}: circuit breaker exhausted", binding.name()),
        );
        return SourceVerdict::Abort;
    }
    if outcome.halted == Some(HaltReason::RateLimit) {
        warn!(
            source = %binding.name(),
            failed = outcome.failed_count(),
            "rate limit 한도 초과, 성공 종목으로 다음 단계 진행"
        );
    }
    SourceVerdict::Continue
}

fn split_outcome<T>(
    outcome: BatchOutcome<Ticker, T>,
) -> (HashMap<Ticker, T>, Vec<(Ticker, FetchError)>) {
    let mut ok = HashMap::with_capacity(outcome.results.len());
    let mut failed = Vec::new();
    for item in outcome.results {
        match item.result {
            Ok(value) => {
                ok.insert(item.item, value);
            }
            Err(e) => failed.push((item.item, e)),
        }
    }
    (ok, failed)
}

fn record_errors(result: &mut CollectionResult, errors: &[(Ticker, FetchError)]) {
    for (ticker, error) in errors {
        result.record_ticker_error(ticker, error);
    }
}

/// 소스가 주지 않은 52주 최고/최저를 히스토리로 채웁니다.
fn fill_week_52(record: &mut MetricsRecord, history: &HistoryRecord) {
    if record.week_52_high.is_some() && record.week_52_low.is_some() {
        return;
    }
    if let Some((high, low)) = history.week_52_extremes() {
        record.week_52_high.get_or_insert(high);
        record.week_52_low.get_or_insert(low);
    }
}

fn assemble(
    priced: &[Ticker],
    companies: &HashMap<&Ticker, &CompanyRecord>,
    mut prices: HashMap<Ticker, PriceRecord>,
    mut metrics: HashMap<Ticker, MetricsRecord>,
    mut technicals: HashMap<Ticker, TechnicalIndicators>,
) -> Vec<MergedRecord> {
    priced
        .iter()
        .filter_map(|ticker| {
            let price = prices.remove(ticker)?;
            let mut record = MergedRecord::new(ticker.clone(), price);
            record.company = companies.get(ticker).map(|c| (*c).clone());
            record.metrics = metrics.remove(ticker).filter(|m| !m.is_empty());
            record.technicals = technicals.remove(ticker);
            Some(record)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use stockpile_core::Bar;

    fn bars(n: usize) -> Vec<Bar> {
        let start = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        (0..n)
            .map(|i| {
                let base = rust_decimal::Decimal::from(100 + i as i64);
                Bar {
                    date: start + chrono::Duration::days(i as i64),
                    open: base,
                    high: base + dec!(2),
                    low: base - dec!(3),
                    close: base,
                    volume: 1_000,
                }
            })
            .collect()
    }

    #[test]
    fn test_fill_week_52_only_missing_fields() {
        let history = HistoryRecord::new(bars(10));

        let mut record = MetricsRecord {
            week_52_high: Some(dec!(500)),
            ..Default::default()
        };
        fill_week_52(&mut record, &history);
        assert_eq!(record.week_52_high, Some(dec!(500)));
        assert_eq!(record.week_52_low, Some(dec!(97)));

        let mut empty = MetricsRecord::default();
        fill_week_52(&mut empty, &history);
        assert_eq!(empty.week_52_high, Some(dec!(111)));
        assert_eq!(empty.week_52_low, Some(dec!(97)));
    }

    #[test]
    fn test_assemble_drops_unpriced_and_empty_metrics() {
        let a = Ticker::us("A");
        let b = Ticker::us("B");
        let price = PriceRecord::from_bars(&bars(2)).unwrap();

        let company = CompanyRecord::new(a.clone()).with_name("Alpha");
        let companies: HashMap<&Ticker, &CompanyRecord> = [(&a, &company)].into_iter().collect();
        let prices: HashMap<Ticker, PriceRecord> = [(a.clone(), price)].into_iter().collect();
        let metrics: HashMap<Ticker, MetricsRecord> = [
            (a.clone(), MetricsRecord::default()),
            (b.clone(), MetricsRecord {
                per: Some(dec!(10)),
                ..Default::default()
            }),
        ]
        .into_iter()
        .collect();

        let merged = assemble(&[a.clone(), b], &companies, prices, metrics, HashMap::new());

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].ticker, a);
        assert_eq!(merged[0].company.as_ref().and_then(|c| c.name.as_deref()), Some("Alpha"));
        assert!(merged[0].metrics.is_none());
    }
}
