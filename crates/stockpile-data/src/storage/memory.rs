//! 메모리 저장소 (dry-run, 테스트).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use stockpile_core::{CompanyRecord, Market};
use uuid::Uuid;

use super::{split_by_market, MetricsRow, PriceRow, SaveReport, Storage};
use crate::error::Result;

#[derive(Default)]
struct MarketData {
    companies: BTreeMap<String, CompanyRecord>,
    prices: BTreeMap<String, PriceRow>,
    metrics: BTreeMap<String, MetricsRow>,
    ids: HashMap<String, Uuid>,
}

/// 프로세스 메모리에만 기록하는 저장소.
#[derive(Default)]
pub struct MemoryStorage {
    markets: Mutex<HashMap<Market, MarketData>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_market<R>(&self, market: Market, f: impl FnOnce(&mut MarketData) -> R) -> R {
        let mut markets = self
            .markets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(markets.entry(market).or_default())
    }

    /// 저장된 종목 (심볼 순).
    pub fn companies(&self, market: Market) -> Vec<CompanyRecord> {
        self.with_market(market, |data| data.companies.values().cloned().collect())
    }

    /// 저장된 가격 (심볼 순).
    pub fn prices(&self, market: Market) -> Vec<PriceRow> {
        self.with_market(market, |data| data.prices.values().cloned().collect())
    }

    /// 저장된 지표 (심볼 순).
    pub fn metrics(&self, market: Market) -> Vec<MetricsRow> {
        self.with_market(market, |data| data.metrics.values().cloned().collect())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn name(&self) -> &str {
        "memory"
    }

    async fn save_companies(
        &self,
        market: Market,
        companies: &[CompanyRecord],
    ) -> Result<SaveReport> {
        let (rows, skipped) = split_by_market(market, companies, |c| &c.ticker);
        let saved = rows.len();
        self.with_market(market, |data| {
            for company in rows {
                let symbol = company.ticker.symbol().to_string();
                data.ids.entry(symbol.clone()).or_insert_with(Uuid::new_v4);
                data.companies.insert(symbol, company.clone());
            }
        });
        Ok(SaveReport {
            saved,
            skipped,
            errors: Vec::new(),
        })
    }

    async fn save_prices(&self, market: Market, rows: &[PriceRow]) -> Result<SaveReport> {
        let (rows, skipped) = split_by_market(market, rows, |r| &r.ticker);
        let saved = rows.len();
        self.with_market(market, |data| {
            for row in rows {
                data.prices
                    .insert(row.ticker.symbol().to_string(), row.clone());
            }
        });
        Ok(SaveReport {
            saved,
            skipped,
            errors: Vec::new(),
        })
    }

    async fn save_metrics(&self, market: Market, rows: &[MetricsRow]) -> Result<SaveReport> {
        let (rows, skipped) = split_by_market(market, rows, |r| &r.ticker);
        let saved = rows.len();
        self.with_market(market, |data| {
            for row in rows {
                data.metrics
                    .insert(row.ticker.symbol().to_string(), row.clone());
            }
        });
        Ok(SaveReport {
            saved,
            skipped,
            errors: Vec::new(),
        })
    }

    async fn load_completed_tickers(&self, market: Market) -> Result<HashSet<String>> {
        Ok(self.with_market(market, |data| data.prices.keys().cloned().collect()))
    }

    async fn company_id_mapping(&self, market: Market) -> Result<HashMap<String, Uuid>> {
        Ok(self.with_market(market, |data| data.ids.clone()))
    }
}
