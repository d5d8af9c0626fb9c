//! 수집 후 품질 검증.
//!
//! 유니버스 대비 커버리지, 누락 종목, 반드시 있어야 하는 대형주 누락을
//! 확인합니다. 핵심 재무지표 필드별 채움 비율도 보고해서 소스가 200 OK를
//! 주면서 특정 필드만 비우는 상황을 잡아냅니다.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use stockpile_core::{Market, MetricField, MetricsRecord};

/// 기본 최소 커버리지 (%).
pub const DEFAULT_MIN_COVERAGE: f64 = 95.0;

/// 시장별 대형주 목록.
pub fn major_tickers(market: Market) -> &'static [&'static str] {
    match market {
        Market::Us => &[
            "AAPL", "MSFT", "NVDA", "AMZN", "GOOGL", "META", "TSLA", "AVGO", "JPM", "V",
        ],
        Market::Kospi => &[
            "005930", // 삼성전자
            "000660", // SK하이닉스
            "373220", // LG에너지솔루션
            "207940", // 삼성바이오로직스
            "005380", // 현대차
            "068270", // 셀트리온
            "000270", // 기아
            "105560", // KB금융
            "035420", // NAVER
            "005490", // POSCO홀딩스
        ],
        Market::Kosdaq => &[
            "247540", // 에코프로비엠
            "086520", // 에코프로
            "196170", // 알테오젠
            "028300", // HLB
            "403870", // HPSP
        ],
    }
}

/// 품질 검증 결과.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub market: Market,
    pub universe_size: usize,
    pub collected: usize,
    /// 커버리지 (%), 소수점 2자리
    pub coverage: f64,
    pub min_coverage: f64,
    pub missing_tickers: Vec<String>,
    pub missing_major: Vec<String>,
    /// 핵심 필드별 non-null 비율 (0.0 ~ 1.0)
    pub field_coverage: BTreeMap<MetricField, f64>,
    pub passed: bool,
}

/// 품질 검증기.
#[derive(Debug, Clone)]
pub struct QualityVerifier {
    min_coverage: f64,
    major: Vec<String>,
}

impl QualityVerifier {
    pub fn new(min_coverage: f64, major: Vec<String>) -> Self {
        Self {
            min_coverage,
            major,
        }
    }

    /// 시장 기본 대형주 목록 사용.
    pub fn for_market(market: Market, min_coverage: f64) -> Self {
        Self::new(
            min_coverage,
            major_tickers(market).iter().map(|s| s.to_string()).collect(),
        )
    }

    /// 대형주 목록을 유니버스에 있는 것으로 한정합니다 (`--tickers`, `--limit` 실행).
    pub fn restrict_major_to(mut self, universe: &[String]) -> Self {
        let universe: HashSet<&str> = universe.iter().map(String::as_str).collect();
        self.major.retain(|m| universe.contains(m.as_str()));
        self
    }

    /// 검증을 실행합니다.
    ///
    /// * `universe` - 전체 종목 심볼 (순서 유지)
    /// * `collected` - 수집 완료 심볼
    /// * `metrics` - 수집된 종목의 재무지표 (필드 비율 계산용)
    pub fn verify(
        &self,
        market: Market,
        universe: &[String],
        collected: &HashSet<String>,
        metrics: &[MetricsRecord],
    ) -> QualityReport {
        let missing_tickers: Vec<String> = universe
            .iter()
            .filter(|s| !collected.contains(*s))
            .cloned()
            .collect();
        let collected_count = universe.len() - missing_tickers.len();

        let coverage = if universe.is_empty() {
            0.0
        } else {
            round2(collected_count as f64 * 100.0 / universe.len() as f64)
        };

        let missing_major: Vec<String> = self
            .major
            .iter()
            .filter(|m| !collected.contains(*m))
            .cloned()
            .collect();

        let field_coverage = MetricField::KEY
            .iter()
            .map(|field| {
                let ratio = if metrics.is_empty() {
                    0.0
                } else {
                    let filled = metrics.iter().filter(|m| field.get(m).is_some()).count();
                    round2(filled as f64 / metrics.len() as f64)
                };
                (*field, ratio)
            })
            .collect();

        let passed = coverage >= self.min_coverage && missing_major.is_empty();

        let report = QualityReport {
            market,
            universe_size: universe.len(),
            collected: collected_count,
            coverage,
            min_coverage: self.min_coverage,
            missing_tickers,
            missing_major,
            field_coverage,
            passed,
        };
        report.log();
        report
    }
}

impl QualityReport {
    fn log(&self) {
        if self.passed {
            tracing::info!(
                market = %self.market,
                coverage = self.coverage,
                collected = self.collected,
                universe = self.universe_size,
                "품질 검증 통과"
            );
        } else {
            tracing::warn!(
                market = %self.market,
                coverage = self.coverage,
                min_coverage = self.min_coverage,
                missing = self.missing_tickers.len(),
                missing_major = ?self.missing_major,
                "품질 검증 실패"
            );
        }
        for (field, ratio) in &self.field_coverage {
            tracing::debug!(market = %self.market, field = %field, ratio, "필드 채움 비율");
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
