//! 가격, 히스토리, 기술지표 및 병합 레코드.

use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{MetricsRecord, Ticker};

/// 52주 고저 계산에 사용하는 거래일 수.
pub const TRADING_DAYS_PER_YEAR: usize = 252;

/// 일봉 OHLCV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub date: NaiveDate,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: i64,
}

/// 최신 가격 레코드.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecord {
    /// 기준일
    pub date: NaiveDate,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: i64,
    /// 전일 대비 등락률 (%)
    pub change_pct: Option<Decimal>,
}

impl PriceRecord {
    /// 일봉 목록에서 최신 가격 레코드를 만듭니다.
    ///
    /// 전용 "최신가" 엔드포인트가 없는 소스는 짧은 히스토리를 조회한 뒤
    /// 마지막 봉으로 가격을 만듭니다. 등락률은 직전 봉 종가 기준입니다.
    pub fn from_bars(bars: &[Bar]) -> Option<Self> {
        let latest = bars.iter().max_by_key(|b| b.date)?;
        let previous = bars
            .iter()
            .filter(|b| b.date < latest.date)
            .max_by_key(|b| b.date);

        let change_pct = previous.and_then(|p| change_percent(latest.close, p.close));

        Some(Self {
            date: latest.date,
            open: latest.open,
            high: latest.high,
            low: latest.low,
            close: latest.close,
            volume: latest.volume,
            change_pct,
        })
    }
}

/// 등락률 (%), 소수점 2자리.
pub fn change_percent(current: Decimal, previous: Decimal) -> Option<Decimal> {
    if previous.is_zero() {
        return None;
    }
    Some(((current - previous) / previous * Decimal::ONE_HUNDRED).round_dp(2))
}

/// 한 종목의 일봉 시계열.
///
/// 생성 시 날짜 오름차순으로 정렬하고 중복 날짜는 제거합니다.
/// 조회 이후에는 변경되지 않습니다.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    bars: Vec<Bar>,
}

impl HistoryRecord {
    pub fn new(mut bars: Vec<Bar>) -> Self {
        bars.sort_by_key(|b| b.date);
        bars.dedup_by_key(|b| b.date);
        Self { bars }
    }

    /// 최근 `lookback`개 봉만 유지한 히스토리.
    pub fn with_lookback(bars: Vec<Bar>, lookback: usize) -> Self {
        let mut history = Self::new(bars);
        if history.bars.len() > lookback {
            let skip = history.bars.len() - lookback;
            history.bars.drain(..skip);
        }
        history
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn latest(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.bars.first().map(|b| b.date)
    }

    /// 종가 시계열 (f64).
    pub fn closes(&self) -> Vec<f64> {
        self.bars
            .iter()
            .map(|b| b.close.to_f64().unwrap_or(0.0))
            .collect()
    }

    /// 거래량 시계열 (f64).
    pub fn volumes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.volume as f64).collect()
    }

    /// 최근 252 거래일 기준 (최고가, 최저가).
    pub fn week_52_extremes(&self) -> Option<(Decimal, Decimal)> {
        let start = self.bars.len().saturating_sub(TRADING_DAYS_PER_YEAR);
        let window = &self.bars[start..];
        let high = window.iter().map(|b| b.high).max()?;
        let low = window.iter().map(|b| b.low).min()?;
        Some((high, low))
    }

    /// 마지막 봉으로 만든 가격 레코드.
    pub fn to_price_record(&self) -> Option<PriceRecord> {
        let len = self.bars.len();
        PriceRecord::from_bars(&self.bars[len.saturating_sub(2)..])
    }
}

/// 히스토리에서 계산한 기술적 지표.
///
/// 히스토리의 순수 함수이며 숨은 상태가 없습니다.
/// 데이터가 부족한 지표는 `None`입니다.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TechnicalIndicators {
    pub rsi_14: Option<f64>,
    pub mfi_14: Option<f64>,
    pub macd: Option<f64>,
    pub macd_signal: Option<f64>,
    pub macd_histogram: Option<f64>,
    pub bb_upper: Option<f64>,
    pub bb_middle: Option<f64>,
    pub bb_lower: Option<f64>,
    pub bb_percent_b: Option<f64>,
    /// 최근 거래량 / 20일 평균 거래량 대비 변화율 (%)
    pub volume_change_pct: Option<f64>,
    /// 벤치마크 대비 베타
    pub beta: Option<f64>,
    pub sma_20: Option<f64>,
    pub sma_50: Option<f64>,
    pub sma_200: Option<f64>,
}

impl TechnicalIndicators {
    /// 계산된 지표가 하나도 없는지 여부.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// 종목 기본 정보 (유니버스 제공자가 반환).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompanyRecord {
    pub ticker: Ticker,
    pub name: Option<String>,
    pub sector: Option<String>,
}

impl CompanyRecord {
    pub fn new(ticker: Ticker) -> Self {
        Self {
            ticker,
            name: None,
            sector: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// 한 종목의 최종 병합 결과.
///
/// 가격은 필수이며 재무지표와 기술지표는 선택적으로 덧붙습니다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedRecord {
    pub ticker: Ticker,
    pub company: Option<CompanyRecord>,
    pub price: PriceRecord,
    pub metrics: Option<MetricsRecord>,
    pub technicals: Option<TechnicalIndicators>,
}

impl MergedRecord {
    pub fn new(ticker: Ticker, price: PriceRecord) -> Self {
        Self {
            ticker,
            company: None,
            price,
            metrics: None,
            technicals: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bar(day: u32, close: Decimal) -> Bar {
        Bar {
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            open: close,
            high: close + dec!(1),
            low: close - dec!(1),
            close,
            volume: 1_000,
        }
    }

    #[test]
    fn test_price_from_latest_bars() {
        let bars = vec![bar(3, dec!(110)), bar(2, dec!(100))];
        let price = PriceRecord::from_bars(&bars).unwrap();

        assert_eq!(price.date, NaiveDate::from_ymd_opt(2024, 1, 3).unwrap());
        assert_eq!(price.close, dec!(110));
        assert_eq!(price.change_pct, Some(dec!(10.00)));
    }

    #[test]
    fn test_price_single_bar_has_no_change() {
        let price = PriceRecord::from_bars(&[bar(2, dec!(100))]).unwrap();
        assert_eq!(price.change_pct, None);
        assert!(PriceRecord::from_bars(&[]).is_none());
    }

    #[test]
    fn test_history_sorted_and_deduplicated() {
        let history = HistoryRecord::new(vec![bar(5, dec!(3)), bar(1, dec!(1)), bar(5, dec!(3))]);
        assert_eq!(history.len(), 2);
        assert_eq!(history.latest().unwrap().close, dec!(3));
        assert_eq!(history.closes(), vec![1.0, 3.0]);
    }

    #[test]
    fn test_history_lookback_and_extremes() {
        let bars: Vec<Bar> = (1..=20).map(|d| bar(d, Decimal::from(d))).collect();
        let history = HistoryRecord::with_lookback(bars, 5);

        assert_eq!(history.len(), 5);
        assert_eq!(history.week_52_extremes(), Some((dec!(21), dec!(15))));
        assert_eq!(history.to_price_record().unwrap().close, dec!(20));
    }
}
