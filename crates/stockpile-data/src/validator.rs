//! 재무지표 검증.
//!
//! 필드별 최소/최대 규칙 테이블을 적용합니다. 규칙을 벗어난 값은 정책에 따라
//! 경계값으로 잘라내거나(`Warn`) 버립니다(`Reject`). 모든 변경은 로그로
//! 남깁니다.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use stockpile_core::{MetricField, MetricsRecord, Ticker};
use tracing::warn;

/// 재무지표 정제기.
pub trait MetricsValidator: Send + Sync {
    /// 원시 레코드를 정제한 결과를 반환합니다.
    fn validate(&self, ticker: &Ticker, raw: MetricsRecord) -> MetricsRecord;
}

/// 범위 위반 시 처리 방식.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulePolicy {
    /// 경계값으로 잘라내고 경고
    Warn,
    /// 값을 버림 (null)
    Reject,
}

/// 필드 하나의 허용 범위.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRule {
    pub field: MetricField,
    pub min: Option<Decimal>,
    pub max: Option<Decimal>,
    pub policy: RulePolicy,
}

impl FieldRule {
    pub fn reject(field: MetricField, min: Option<Decimal>, max: Option<Decimal>) -> Self {
        Self {
            field,
            min,
            max,
            policy: RulePolicy::Reject,
        }
    }

    pub fn clamp(field: MetricField, min: Decimal, max: Decimal) -> Self {
        Self {
            field,
            min: Some(min),
            max: Some(max),
            policy: RulePolicy::Warn,
        }
    }

    /// 규칙 적용. 값이 바뀌면 `Some(새 값)`을 반환합니다.
    fn apply(&self, value: Decimal) -> Option<Option<Decimal>> {
        let below = self.min.map_or(false, |min| value < min);
        let above = self.max.map_or(false, |max| value > max);
        if !below && !above {
            return None;
        }
        match self.policy {
            RulePolicy::Reject => Some(None),
            RulePolicy::Warn => {
                let bound = if below { self.min } else { self.max };
                Some(bound)
            }
        }
    }
}

/// 검증 과정에서 바뀐 필드 하나.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub field: MetricField,
    pub before: Decimal,
    pub after: Option<Decimal>,
}

/// 규칙 테이블 기반 검증기.
#[derive(Debug, Clone)]
pub struct RuleTableValidator {
    rules: Vec<FieldRule>,
}

impl Default for RuleTableValidator {
    fn default() -> Self {
        Self::new(vec![
            FieldRule::reject(MetricField::Per, Some(dec!(-1000)), Some(dec!(10000))),
            FieldRule::reject(MetricField::Pbr, Some(Decimal::ZERO), Some(dec!(1000))),
            FieldRule::reject(MetricField::Psr, Some(Decimal::ZERO), Some(dec!(10000))),
            FieldRule::clamp(MetricField::Roe, dec!(-1000), dec!(1000)),
            FieldRule::clamp(MetricField::Roa, dec!(-1000), dec!(1000)),
            FieldRule::reject(MetricField::DebtToEquity, Some(Decimal::ZERO), Some(dec!(100000))),
            FieldRule::clamp(MetricField::DividendYield, Decimal::ZERO, dec!(100)),
            FieldRule::reject(MetricField::MarketCap, Some(Decimal::ONE), None),
            FieldRule::reject(MetricField::Week52High, Some(Decimal::ZERO), None),
            FieldRule::reject(MetricField::Week52Low, Some(Decimal::ZERO), None),
        ])
    }
}

impl RuleTableValidator {
    pub fn new(rules: Vec<FieldRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[FieldRule] {
        &self.rules
    }

    /// 정제 결과와 변경 목록을 함께 반환합니다.
    pub fn validate_detailed(
        &self,
        ticker: &Ticker,
        mut record: MetricsRecord,
    ) -> (MetricsRecord, Vec<FieldChange>) {
        let mut changes = Vec::new();

        for rule in &self.rules {
            let slot = rule.field.slot(&mut record);
            let Some(value) = *slot else { continue };
            if let Some(after) = rule.apply(value) {
                *slot = after;
                changes.push(FieldChange {
                    field: rule.field,
                    before: value,
                    after,
                });
            }
        }

        // 52주 최저가는 최고가를 넘을 수 없음
        if let (Some(high), Some(low)) = (record.week_52_high, record.week_52_low) {
            if low > high {
                record.week_52_high = None;
                record.week_52_low = None;
                changes.push(FieldChange {
                    field: MetricField::Week52High,
                    before: high,
                    after: None,
                });
                changes.push(FieldChange {
                    field: MetricField::Week52Low,
                    before: low,
                    after: None,
                });
            }
        }

        for change in &changes {
            match change.after {
                Some(after) => warn!(
                    ticker = %ticker,
                    field = %change.field,
                    before = %change.before,
                    after = %after,
                    "지표 값 범위 보정"
                ),
                None => warn!(
                    ticker = %ticker,
                    field = %change.field,
                    before = %change.before,
                    "지표 값 범위 벗어남 (제거)"
                ),
            }
        }

        (record, changes)
    }
}

impl MetricsValidator for RuleTableValidator {
    fn validate(&self, ticker: &Ticker, raw: MetricsRecord) -> MetricsRecord {
        self.validate_detailed(ticker, raw).0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticker() -> Ticker {
        Ticker::us("TEST")
    }

    #[test]
    fn test_in_range_values_untouched() {
        let raw = MetricsRecord {
            per: Some(dec!(15.3)),
            pbr: Some(dec!(2.1)),
            dividend_yield: Some(dec!(1.8)),
            market_cap: Some(dec!(3000000000)),
            ..Default::default()
        };
        let (cleaned, changes) =
            RuleTableValidator::default().validate_detailed(&ticker(), raw.clone());
        assert_eq!(cleaned, raw);
        assert!(changes.is_empty());
    }

    #[test]
    fn test_reject_policy_nulls_value() {
        let raw = MetricsRecord {
            per: Some(dec!(25000)),
            pbr: Some(dec!(-1)),
            ..Default::default()
        };
        let cleaned = RuleTableValidator::default().validate(&ticker(), raw);
        assert_eq!(cleaned.per, None);
        assert_eq!(cleaned.pbr, None);
    }

    #[test]
    fn test_warn_policy_clamps_value() {
        let raw = MetricsRecord {
            dividend_yield: Some(dec!(250)),
            roe: Some(dec!(-5000)),
            ..Default::default()
        };
        let (cleaned, changes) = RuleTableValidator::default().validate_detailed(&ticker(), raw);
        assert_eq!(cleaned.dividend_yield, Some(dec!(100)));
        assert_eq!(cleaned.roe, Some(dec!(-1000)));
        assert_eq!(changes.len(), 2);
    }

    #[test]
    fn test_inverted_week_52_range_nulls_both() {
        let raw = MetricsRecord {
            week_52_high: Some(dec!(100)),
            week_52_low: Some(dec!(120)),
            ..Default::default()
        };
        let cleaned = RuleTableValidator::default().validate(&ticker(), raw);
        assert_eq!(cleaned.week_52_high, None);
        assert_eq!(cleaned.week_52_low, None);
    }

    #[test]
    fn test_zero_market_cap_rejected() {
        let raw = MetricsRecord {
            market_cap: Some(Decimal::ZERO),
            ..Default::default()
        };
        let cleaned = RuleTableValidator::default().validate(&ticker(), raw);
        assert_eq!(cleaned.market_cap, None);
    }
}
