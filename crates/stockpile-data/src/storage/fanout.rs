//! 여러 저장소에 동시에 기록하는 저장소.
//!
//! 첫 번째 저장소가 기준입니다. 조회는 첫 번째 저장소에서만 하고, 기록은
//! 모든 저장소에 합니다. 기준 저장소의 실패는 그대로 반환하고, 나머지
//! 저장소의 실패는 보고서의 `errors`에 담습니다.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use stockpile_core::{CompanyRecord, Market};
use tracing::warn;
use uuid::Uuid;

use super::{MetricsRow, PriceRow, SaveReport, Storage};
use crate::error::{DataError, Result};

pub struct FanOutStorage {
    backends: Vec<Arc<dyn Storage>>,
}

impl FanOutStorage {
    pub fn new(backends: Vec<Arc<dyn Storage>>) -> Result<Self> {
        if backends.is_empty() {
            return Err(DataError::ConfigError(
                "fan-out storage needs at least one backend".to_string(),
            ));
        }
        Ok(Self { backends })
    }

    pub fn backends(&self) -> &[Arc<dyn Storage>] {
        &self.backends
    }

    fn primary(&self) -> &Arc<dyn Storage> {
        &self.backends[0]
    }

    /// 기준 저장소 결과에 나머지 저장소 오류를 덧붙입니다.
    fn combine(&self, results: Vec<Result<SaveReport>>) -> Result<SaveReport> {
        let mut results = results.into_iter().zip(&self.backends);
        let mut report = match results.next() {
            Some((result, _)) => result?,
            None => SaveReport::default(),
        };

        for (result, backend) in results {
            match result {
                Ok(secondary) => {
                    let name = backend.name();
                    report.errors.extend(
                        secondary
                            .errors
                            .into_iter()
                            .map(|e| format!("{}: {}", name, e)),
                    );
                }
                Err(e) => {
                    warn!(storage = backend.name(), error = %e, "보조 저장소 기록 실패");
                    report.errors.push(format!("{}: {}", backend.name(), e));
                }
            }
        }
        Ok(report)
    }
}

#[async_trait]
impl Storage for FanOutStorage {
    fn name(&self) -> &str {
        "fanout"
    }

    async fn save_companies(
        &self,
        market: Market,
        companies: &[CompanyRecord],
    ) -> Result<SaveReport> {
        let results = join_all(
            self.backends
                .iter()
                .map(|b| b.save_companies(market, companies)),
        )
        .await;
        self.combine(results)
    }

    async fn save_prices(&self, market: Market, rows: &[PriceRow]) -> Result<SaveReport> {
        let results = join_all(self.backends.iter().map(|b| b.save_prices(market, rows))).await;
        self.combine(results)
    }

    async fn save_metrics(&self, market: Market, rows: &[MetricsRow]) -> Result<SaveReport> {
        let results = join_all(self.backends.iter().map(|b| b.save_metrics(market, rows))).await;
        self.combine(results)
    }

    async fn load_completed_tickers(&self, market: Market) -> Result<HashSet<String>> {
        self.primary().load_completed_tickers(market).await
    }

    async fn company_id_mapping(&self, market: Market) -> Result<HashMap<String, Uuid>> {
        self.primary().company_id_mapping(market).await
    }
}
