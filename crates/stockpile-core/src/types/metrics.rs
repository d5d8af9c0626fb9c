//! 재무지표 레코드와 필드 테이블.
//!
//! 필드별 병합/검증/커버리지 규칙은 모두 [`MetricField`] 테이블을 거칩니다.
//! 새 필드를 추가하면 `get`/`slot`의 match가 컴파일 단계에서 누락을 알려줍니다.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 종목 재무지표.
///
/// 모든 필드는 독립적으로 nullable이며, `None`은 "소스가 제공하지 않음"을
/// 뜻합니다 (0이 아님).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    /// PER (주가수익비율)
    pub per: Option<Decimal>,
    /// PBR (주가순자산비율)
    pub pbr: Option<Decimal>,
    /// PSR (주가매출비율)
    pub psr: Option<Decimal>,
    /// ROE (%)
    pub roe: Option<Decimal>,
    /// ROA (%)
    pub roa: Option<Decimal>,
    /// 부채비율 (%)
    pub debt_to_equity: Option<Decimal>,
    /// 배당수익률 (%)
    pub dividend_yield: Option<Decimal>,
    /// EPS (주당순이익)
    pub eps: Option<Decimal>,
    /// BPS (주당순자산)
    pub bps: Option<Decimal>,
    /// 시가총액 (현지 통화)
    pub market_cap: Option<Decimal>,
    pub week_52_high: Option<Decimal>,
    pub week_52_low: Option<Decimal>,
    /// 소스 기준일
    pub as_of: Option<NaiveDate>,
}

/// 재무지표 필드 식별자.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricField {
    Per,
    Pbr,
    Psr,
    Roe,
    Roa,
    DebtToEquity,
    DividendYield,
    Eps,
    Bps,
    MarketCap,
    Week52High,
    Week52Low,
}

impl MetricField {
    /// 전체 필드 테이블 (병합 순서).
    pub const ALL: [MetricField; 12] = [
        MetricField::Per,
        MetricField::Pbr,
        MetricField::Psr,
        MetricField::Roe,
        MetricField::Roa,
        MetricField::DebtToEquity,
        MetricField::DividendYield,
        MetricField::Eps,
        MetricField::Bps,
        MetricField::MarketCap,
        MetricField::Week52High,
        MetricField::Week52Low,
    ];

    /// 품질 검증과 폴백 판단에 쓰는 핵심 필드.
    pub const KEY: [MetricField; 5] = [
        MetricField::Per,
        MetricField::Pbr,
        MetricField::Roe,
        MetricField::DividendYield,
        MetricField::MarketCap,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricField::Per => "per",
            MetricField::Pbr => "pbr",
            MetricField::Psr => "psr",
            MetricField::Roe => "roe",
            MetricField::Roa => "roa",
            MetricField::DebtToEquity => "debt_to_equity",
            MetricField::DividendYield => "dividend_yield",
            MetricField::Eps => "eps",
            MetricField::Bps => "bps",
            MetricField::MarketCap => "market_cap",
            MetricField::Week52High => "week_52_high",
            MetricField::Week52Low => "week_52_low",
        }
    }

    /// 레코드에서 필드 값 읽기.
    pub fn get(&self, record: &MetricsRecord) -> Option<Decimal> {
        match self {
            MetricField::Per => record.per,
            MetricField::Pbr => record.pbr,
            MetricField::Psr => record.psr,
            MetricField::Roe => record.roe,
            MetricField::Roa => record.roa,
            MetricField::DebtToEquity => record.debt_to_equity,
            MetricField::DividendYield => record.dividend_yield,
            MetricField::Eps => record.eps,
            MetricField::Bps => record.bps,
            MetricField::MarketCap => record.market_cap,
            MetricField::Week52High => record.week_52_high,
            MetricField::Week52Low => record.week_52_low,
        }
    }

    /// 레코드의 필드 슬롯 (쓰기용).
    pub fn slot<'a>(&self, record: &'a mut MetricsRecord) -> &'a mut Option<Decimal> {
        match self {
            MetricField::Per => &mut record.per,
            MetricField::Pbr => &mut record.pbr,
            MetricField::Psr => &mut record.psr,
            MetricField::Roe => &mut record.roe,
            MetricField::Roa => &mut record.roa,
            MetricField::DebtToEquity => &mut record.debt_to_equity,
            MetricField::DividendYield => &mut record.dividend_yield,
            MetricField::Eps => &mut record.eps,
            MetricField::Bps => &mut record.bps,
            MetricField::MarketCap => &mut record.market_cap,
            MetricField::Week52High => &mut record.week_52_high,
            MetricField::Week52Low => &mut record.week_52_low,
        }
    }
}

impl fmt::Display for MetricField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MetricsRecord {
    /// 값이 있는 필드 수.
    pub fn populated_count(&self) -> usize {
        MetricField::ALL
            .iter()
            .filter(|f| f.get(self).is_some())
            .count()
    }

    /// 모든 필드가 비어 있는지 여부.
    pub fn is_empty(&self) -> bool {
        self.populated_count() == 0
    }

    /// 핵심 필드 중 비어 있는 것.
    pub fn missing_key_fields(&self) -> Vec<MetricField> {
        MetricField::KEY
            .iter()
            .copied()
            .filter(|f| f.get(self).is_none())
            .collect()
    }

    /// 비어 있는 필드만 `other`에서 채웁니다.
    ///
    /// 이미 값이 있는 필드는 절대 덮어쓰지 않습니다.
    /// 채운 필드 목록을 반환합니다.
    pub fn backfill_from(&mut self, other: &MetricsRecord) -> Vec<MetricField> {
        let mut filled = Vec::new();
        for field in MetricField::ALL {
            let slot = field.slot(self);
            if slot.is_none() {
                if let Some(value) = field.get(other) {
                    *slot = Some(value);
                    filled.push(field);
                }
            }
        }
        if self.as_of.is_none() {
            self.as_of = other.as_of;
        }
        filled
    }
}
