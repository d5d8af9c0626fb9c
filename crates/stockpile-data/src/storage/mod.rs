//! 수집 결과 저장소.
//!
//! - [`json_file::JsonFileStorage`]: `{data_dir}/{market}/{date}/*.json`
//! - [`postgres::PostgresStorage`]: PostgreSQL upsert
//! - [`memory::MemoryStorage`]: dry-run 및 테스트용
//! - [`fanout::FanOutStorage`]: 여러 저장소에 동시 기록

pub mod fanout;
pub mod json_file;
pub mod memory;
pub mod postgres;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use stockpile_core::{
    CompanyRecord, Market, MetricsRecord, PriceRecord, TechnicalIndicators, Ticker,
};
use uuid::Uuid;

use crate::error::Result;

/// 종목별 가격 행.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRow {
    pub ticker: Ticker,
    pub price: PriceRecord,
}

/// 종목별 지표 행.
///
/// 재무지표가 없어도 기술지표만으로 저장될 수 있습니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRow {
    pub ticker: Ticker,
    /// 기준일 (가격 기준일)
    pub date: NaiveDate,
    pub metrics: Option<MetricsRecord>,
    pub technicals: Option<TechnicalIndicators>,
}

/// 저장 결과.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaveReport {
    pub saved: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

impl SaveReport {
    pub fn saved(saved: usize) -> Self {
        Self {
            saved,
            ..Default::default()
        }
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// 다른 보고서를 합산합니다.
    pub fn absorb(&mut self, other: SaveReport) {
        self.saved += other.saved;
        self.skipped += other.skipped;
        self.errors.extend(other.errors);
    }
}

/// 수집 결과 저장소.
#[async_trait]
pub trait Storage: Send + Sync {
    fn name(&self) -> &str;

    async fn save_companies(&self, market: Market, companies: &[CompanyRecord])
        -> Result<SaveReport>;

    async fn save_prices(&self, market: Market, rows: &[PriceRow]) -> Result<SaveReport>;

    async fn save_metrics(&self, market: Market, rows: &[MetricsRow]) -> Result<SaveReport>;

    /// 실행 기준일에 가격이 저장된 종목 심볼.
    async fn load_completed_tickers(&self, market: Market) -> Result<HashSet<String>>;

    /// 심볼 → 종목 ID.
    async fn company_id_mapping(&self, market: Market) -> Result<HashMap<String, Uuid>>;
}

/// 기술지표 컬럼 (저장 순서).
pub(crate) const TECHNICAL_COLUMNS: [&str; 14] = [
    "rsi_14",
    "mfi_14",
    "macd",
    "macd_signal",
    "macd_histogram",
    "bb_upper",
    "bb_middle",
    "bb_lower",
    "bb_percent_b",
    "volume_change_pct",
    "beta",
    "sma_20",
    "sma_50",
    "sma_200",
];

/// [`TECHNICAL_COLUMNS`] 순서의 값.
pub(crate) fn technical_values(t: &TechnicalIndicators) -> [Option<f64>; 14] {
    [
        t.rsi_14,
        t.mfi_14,
        t.macd,
        t.macd_signal,
        t.macd_histogram,
        t.bb_upper,
        t.bb_middle,
        t.bb_lower,
        t.bb_percent_b,
        t.volume_change_pct,
        t.beta,
        t.sma_20,
        t.sma_50,
        t.sma_200,
    ]
}

/// 다른 시장의 행은 건너뜁니다.
fn split_by_market<'a, T>(
    market: Market,
    rows: &'a [T],
    ticker_of: impl Fn(&T) -> &Ticker,
) -> (Vec<&'a T>, usize) {
    let matching: Vec<&T> = rows.iter().filter(|r| ticker_of(r).market() == market).collect();
    let skipped = rows.len() - matching.len();
    if skipped > 0 {
        tracing::warn!(market = %market, skipped, "다른 시장 종목은 저장하지 않음");
    }
    (matching, skipped)
}
