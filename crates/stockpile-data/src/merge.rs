//! 주 소스/보조 소스 재무지표 병합.
//!
//! 주 소스의 성공 결과가 기준입니다. 주 소스에 없거나 실패한 종목은 보조
//! 소스 결과를 그대로 사용하고, 양쪽 모두 있는 종목은 주 소스의 빈 필드만
//! [`MetricField::ALL`] 테이블 순서대로 채웁니다. 충돌 시 항상 주 소스가
//! 이깁니다.

use std::collections::{BTreeMap, HashMap};

use stockpile_core::{MetricField, MetricsRecord, Ticker};
use tracing::{debug, warn};

/// 병합 결과와 통계.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub merged: HashMap<Ticker, MetricsRecord>,
    /// 주 소스에서 온 종목 수
    pub from_primary: usize,
    /// 보조 소스만으로 채운 종목 수
    pub from_secondary: usize,
    /// 보조 소스로 채운 필드 수 (필드별)
    pub backfilled_fields: BTreeMap<MetricField, usize>,
    /// 주 소스 기준일이 보조 소스보다 오래된 종목 수
    pub stale_primary: usize,
}

impl MergeOutcome {
    /// 보조 소스로 채운 필드 총합.
    pub fn total_backfilled(&self) -> usize {
        self.backfilled_fields.values().sum()
    }
}

/// 핵심 필드가 하나라도 비어 있으면 보조 소스 조회가 필요합니다.
pub fn needs_fallback(record: &MetricsRecord) -> bool {
    !record.missing_key_fields().is_empty()
}

/// 두 소스의 재무지표를 병합합니다.
pub fn merge_metrics(
    primary: HashMap<Ticker, MetricsRecord>,
    mut secondary: HashMap<Ticker, MetricsRecord>,
) -> MergeOutcome {
    let mut outcome = MergeOutcome {
        merged: HashMap::with_capacity(primary.len() + secondary.len()),
        ..Default::default()
    };

    for (ticker, mut record) in primary {
        outcome.from_primary += 1;

        if let Some(fallback) = secondary.remove(&ticker) {
            if let (Some(primary_date), Some(secondary_date)) = (record.as_of, fallback.as_of) {
                if primary_date < secondary_date {
                    warn!(
                        ticker = %ticker,
                        primary_as_of = %primary_date,
                        secondary_as_of = %secondary_date,
                        "주 소스 데이터가 보조 소스보다 오래됨 (주 소스 값 유지)"
                    );
                    outcome.stale_primary += 1;
                }
            }

            let filled = record.backfill_from(&fallback);
            if !filled.is_empty() {
                debug!(ticker = %ticker, fields = filled.len(), "보조 소스로 빈 필드 보완");
            }
            for field in filled {
                *outcome.backfilled_fields.entry(field).or_insert(0) += 1;
            }
        }

        outcome.merged.insert(ticker, record);
    }

    for (ticker, record) in secondary {
        outcome.from_secondary += 1;
        outcome.merged.insert(ticker, record);
    }

    outcome
}
