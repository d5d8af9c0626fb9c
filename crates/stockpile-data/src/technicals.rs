//! 히스토리 기반 기술적 지표 계산.
//!
//! 모든 계산은 히스토리의 순수 함수입니다. 데이터가 부족한 지표는 `None`을
//! 돌려주며, 결과는 소수점 4자리로 반올림합니다.
//!
//! # 지표
//!
//! - RSI(14): 지수가중평균 (alpha = 1/period, 첫 값은 단순평균)
//! - MFI(14): 전형가격 × 거래량 기반 자금 흐름
//! - MACD(12, 26, 9): EMA(alpha = 2/(n+1), 첫 값은 SMA)
//! - 볼린저 밴드(20, 2σ) 및 %B
//! - SMA 20/50/200
//! - 20일 평균 대비 거래량 변화율
//! - 벤치마크 대비 베타 (최근 1년 일간 수익률)

use std::collections::HashMap;

use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use stockpile_core::{
    HistoryRecord, Market, TechnicalIndicators, Ticker, TRADING_DAYS_PER_YEAR,
};

/// 기술 지표 계산기.
pub trait TechnicalsCalculator: Send + Sync {
    /// 히스토리(와 선택적 벤치마크)에서 지표를 계산합니다.
    fn compute(
        &self,
        history: &HistoryRecord,
        benchmark: Option<&HistoryRecord>,
    ) -> TechnicalIndicators;
}

/// 시장별 베타 벤치마크.
pub fn benchmark_ticker(market: Market) -> Ticker {
    match market {
        Market::Us => Ticker::us("SPY"),
        Market::Kospi | Market::Kosdaq => Ticker::new("^KS11", market),
    }
}

/// 베타 계산에 필요한 최소 수익률 쌍 수.
const MIN_BETA_SAMPLES: usize = 20;

/// 표준 지표 세트.
#[derive(Debug, Clone)]
pub struct StandardTechnicals {
    pub rsi_period: usize,
    pub mfi_period: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub bb_period: usize,
    pub bb_std_dev: f64,
    pub volume_window: usize,
}

impl Default for StandardTechnicals {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            mfi_period: 14,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            bb_period: 20,
            bb_std_dev: 2.0,
            volume_window: 20,
        }
    }
}

impl TechnicalsCalculator for StandardTechnicals {
    fn compute(
        &self,
        history: &HistoryRecord,
        benchmark: Option<&HistoryRecord>,
    ) -> TechnicalIndicators {
        let closes = history.closes();
        let volumes = history.volumes();

        let mut indicators = TechnicalIndicators {
            rsi_14: rsi(&closes, self.rsi_period),
            mfi_14: self.mfi(history),
            volume_change_pct: volume_change_pct(&volumes, self.volume_window),
            beta: benchmark.and_then(|b| beta(history, b)),
            sma_20: sma(&closes, 20),
            sma_50: sma(&closes, 50),
            sma_200: sma(&closes, 200),
            ..Default::default()
        };

        if let Some((line, signal)) =
            macd(&closes, self.macd_fast, self.macd_slow, self.macd_signal)
        {
            indicators.macd = Some(line);
            indicators.macd_signal = signal;
            indicators.macd_histogram = signal.map(|s| line - s);
        }

        if let Some(bands) = bollinger(&closes, self.bb_period, self.bb_std_dev) {
            indicators.bb_upper = Some(bands.upper);
            indicators.bb_middle = Some(bands.middle);
            indicators.bb_lower = Some(bands.lower);
            indicators.bb_percent_b = Some(bands.percent_b);
        }

        round_all(indicators)
    }
}

impl StandardTechnicals {
    fn mfi(&self, history: &HistoryRecord) -> Option<f64> {
        let period = self.mfi_period;
        let bars = history.bars();
        if period == 0 || bars.len() < period + 1 {
            return None;
        }

        let typical: Vec<(f64, f64)> = bars
            .iter()
            .map(|b| {
                let high = b.high.to_f64().unwrap_or(0.0);
                let low = b.low.to_f64().unwrap_or(0.0);
                let close = b.close.to_f64().unwrap_or(0.0);
                ((high + low + close) / 3.0, b.volume as f64)
            })
            .collect();

        let start = typical.len() - period;
        let mut positive = 0.0;
        let mut negative = 0.0;
        for i in start..typical.len() {
            let (tp, volume) = typical[i];
            let prev_tp = typical[i - 1].0;
            let flow = tp * volume;
            if tp > prev_tp {
                positive += flow;
            } else if tp < prev_tp {
                negative += flow;
            }
        }

        if negative == 0.0 {
            return Some(if positive == 0.0 { 50.0 } else { 100.0 });
        }
        let ratio = positive / negative;
        Some(100.0 - 100.0 / (1.0 + ratio))
    }
}

/// RSI (마지막 값).
fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period + 1 {
        return None;
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let gains: Vec<f64> = deltas.iter().map(|d| d.max(0.0)).collect();
    let losses: Vec<f64> = deltas.iter().map(|d| (-d).max(0.0)).collect();

    let avg_gain = wilder_average(&gains, period)?;
    let avg_loss = wilder_average(&losses, period)?;

    if avg_loss == 0.0 {
        return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - 100.0 / (1.0 + rs))
}

/// alpha = 1/period 지수가중평균. 첫 값은 단순평균.
fn wilder_average(values: &[f64], period: usize) -> Option<f64> {
    if values.len() < period {
        return None;
    }
    let alpha = 1.0 / period as f64;
    let seed = values[..period].iter().sum::<f64>() / period as f64;
    Some(
        values[period..]
            .iter()
            .fold(seed, |avg, v| v * alpha + avg * (1.0 - alpha)),
    )
}

/// 단순이동평균 (마지막 값).
fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// EMA 시계열. 인덱스 0이 원본의 `period - 1`번째 값에 대응합니다.
fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }
    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut series = Vec::with_capacity(values.len() - period + 1);
    let mut ema = values[..period].iter().sum::<f64>() / period as f64;
    series.push(ema);
    for value in &values[period..] {
        ema = (value - ema) * multiplier + ema;
        series.push(ema);
    }
    series
}

/// MACD 라인과 시그널 (마지막 값). 시그널은 데이터가 부족하면 `None`.
fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> Option<(f64, Option<f64>)> {
    if fast == 0 || fast >= slow {
        return None;
    }
    let slow_ema = ema_series(closes, slow);
    if slow_ema.is_empty() {
        return None;
    }
    let fast_ema = ema_series(closes, fast);
    let offset = slow - fast;

    let line: Vec<f64> = slow_ema
        .iter()
        .enumerate()
        .map(|(i, slow_value)| fast_ema[i + offset] - slow_value)
        .collect();

    let last = *line.last()?;
    let signal_value = ema_series(&line, signal).last().copied();
    Some((last, signal_value))
}

struct Bands {
    upper: f64,
    middle: f64,
    lower: f64,
    percent_b: f64,
}

/// 볼린저 밴드 (모표준편차).
fn bollinger(closes: &[f64], period: usize, std_dev: f64) -> Option<Bands> {
    let middle = sma(closes, period)?;
    let window = &closes[closes.len() - period..];
    let variance = window.iter().map(|c| (c - middle).powi(2)).sum::<f64>() / period as f64;
    let sigma = variance.sqrt();

    let upper = middle + std_dev * sigma;
    let lower = middle - std_dev * sigma;
    let last = *closes.last()?;
    let width = upper - lower;
    let percent_b = if width == 0.0 { 0.5 } else { (last - lower) / width };

    Some(Bands {
        upper,
        middle,
        lower,
        percent_b,
    })
}

/// 직전 `window`일 평균 대비 마지막 거래량 변화율 (%).
fn volume_change_pct(volumes: &[f64], window: usize) -> Option<f64> {
    if window == 0 || volumes.len() < window + 1 {
        return None;
    }
    let last = *volumes.last()?;
    let previous = &volumes[volumes.len() - 1 - window..volumes.len() - 1];
    let average = previous.iter().sum::<f64>() / window as f64;
    if average == 0.0 {
        return None;
    }
    Some((last / average - 1.0) * 100.0)
}

/// 날짜를 맞춘 일간 수익률 기준 베타.
fn beta(history: &HistoryRecord, benchmark: &HistoryRecord) -> Option<f64> {
    let benchmark_closes: HashMap<NaiveDate, f64> = benchmark
        .bars()
        .iter()
        .filter_map(|b| Some((b.date, b.close.to_f64()?)))
        .collect();

    let aligned: Vec<(f64, f64)> = history
        .bars()
        .iter()
        .filter_map(|b| {
            let bench = *benchmark_closes.get(&b.date)?;
            Some((b.close.to_f64()?, bench))
        })
        .collect();

    let returns: Vec<(f64, f64)> = aligned
        .windows(2)
        .filter(|w| w[0].0 != 0.0 && w[0].1 != 0.0)
        .map(|w| (w[1].0 / w[0].0 - 1.0, w[1].1 / w[0].1 - 1.0))
        .collect();

    let start = returns.len().saturating_sub(TRADING_DAYS_PER_YEAR);
    let returns = &returns[start..];
    if returns.len() < MIN_BETA_SAMPLES {
        return None;
    }

    let n = returns.len() as f64;
    let mean_stock = returns.iter().map(|r| r.0).sum::<f64>() / n;
    let mean_bench = returns.iter().map(|r| r.1).sum::<f64>() / n;

    let covariance = returns
        .iter()
        .map(|(s, b)| (s - mean_stock) * (b - mean_bench))
        .sum::<f64>();
    let variance = returns
        .iter()
        .map(|(_, b)| (b - mean_bench).powi(2))
        .sum::<f64>();

    if variance == 0.0 {
        return None;
    }
    Some(covariance / variance)
}

fn round4(value: Option<f64>) -> Option<f64> {
    value
        .filter(|v| v.is_finite())
        .map(|v| (v * 10_000.0).round() / 10_000.0)
}

fn round_all(t: TechnicalIndicators) -> TechnicalIndicators {
    TechnicalIndicators {
        rsi_14: round4(t.rsi_14),
        mfi_14: round4(t.mfi_14),
        macd: round4(t.macd),
        macd_signal: round4(t.macd_signal),
        macd_histogram: round4(t.macd_histogram),
        bb_upper: round4(t.bb_upper),
        bb_middle: round4(t.bb_middle),
        bb_lower: round4(t.bb_lower),
        bb_percent_b: round4(t.bb_percent_b),
        volume_change_pct: round4(t.volume_change_pct),
        beta: round4(t.beta),
        sma_20: round4(t.sma_20),
        sma_50: round4(t.sma_50),
        sma_200: round4(t.sma_200),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal::Decimal;
    use stockpile_core::Bar;

    fn history_from(closes: &[f64], volumes: &[i64]) -> HistoryRecord {
        let start = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
        let bars = closes
            .iter()
            .zip(volumes)
            .enumerate()
            .map(|(i, (close, volume))| {
                let close = Decimal::from_f64_retain(*close).unwrap().round_dp(6);
                Bar {
                    date: start + Duration::days(i as i64),
                    open: close,
                    high: close,
                    low: close,
                    close,
                    volume: *volume,
                }
            })
            .collect();
        HistoryRecord::new(bars)
    }

    #[test]
    fn test_rsi_extremes() {
        let rising: Vec<f64> = (1..=30).map(|i| i as f64).collect();
        assert_eq!(rsi(&rising, 14), Some(100.0));

        let flat = vec![50.0; 30];
        assert_eq!(rsi(&flat, 14), Some(50.0));

        let falling: Vec<f64> = (1..=30).rev().map(|i| i as f64).collect();
        assert_eq!(rsi(&falling, 14), Some(0.0));
    }

    #[test]
    fn test_rsi_needs_period_plus_one() {
        let closes: Vec<f64> = (1..=14).map(|i| i as f64).collect();
        assert_eq!(rsi(&closes, 14), None);
    }

    #[test]
    fn test_sma_uses_last_window() {
        let values: Vec<f64> = (1..=25).map(|i| i as f64).collect();
        // 6..=25 평균
        assert_eq!(sma(&values, 20), Some(15.5));
        assert_eq!(sma(&values, 50), None);
    }

    #[test]
    fn test_bollinger_converged_bands() {
        let closes = vec![10.0; 25];
        let bands = bollinger(&closes, 20, 2.0).unwrap();
        assert_eq!(bands.upper, 10.0);
        assert_eq!(bands.lower, 10.0);
        assert_eq!(bands.percent_b, 0.5);
    }

    #[test]
    fn test_macd_signal_requires_enough_bars() {
        let closes: Vec<f64> = (1..=30).map(|i| i as f64).collect();
        let (line, signal) = macd(&closes, 12, 26, 9).unwrap();
        assert!(line > 0.0);
        assert!(signal.is_none());

        let closes: Vec<f64> = (1..=40).map(|i| i as f64).collect();
        let (_, signal) = macd(&closes, 12, 26, 9).unwrap();
        assert!(signal.is_some());

        let short: Vec<f64> = (1..=20).map(|i| i as f64).collect();
        assert!(macd(&short, 12, 26, 9).is_none());
    }

    #[test]
    fn test_volume_change() {
        let mut volumes = vec![100.0; 20];
        volumes.push(150.0);
        assert_eq!(volume_change_pct(&volumes, 20), Some(50.0));
        assert_eq!(volume_change_pct(&volumes[..20], 20), None);
    }

    #[test]
    fn test_beta_of_doubled_returns() {
        let returns: Vec<f64> = (0..60)
            .map(|i| if i % 2 == 0 { 0.01 } else { -0.005 })
            .collect();

        let mut bench = vec![100.0];
        let mut stock = vec![100.0];
        for r in &returns {
            bench.push(bench.last().unwrap() * (1.0 + r));
            stock.push(stock.last().unwrap() * (1.0 + 2.0 * r));
        }
        let volumes = vec![1000; bench.len()];

        let benchmark = history_from(&bench, &volumes);
        let history = history_from(&stock, &volumes);

        let beta = beta(&history, &benchmark).unwrap();
        assert!((beta - 2.0).abs() < 1e-3, "beta = {beta}");

        let self_beta = super::beta(&benchmark, &benchmark).unwrap();
        assert!((self_beta - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_beta_requires_overlap() {
        let closes: Vec<f64> = (1..=10).map(|i| i as f64).collect();
        let volumes = vec![1000; 10];
        let history = history_from(&closes, &volumes);
        assert_eq!(beta(&history, &history), None);
    }

    #[test]
    fn test_compute_with_short_history() {
        let closes: Vec<f64> = (1..=30).map(|i| 100.0 + i as f64).collect();
        let volumes = vec![1000; 30];
        let history = history_from(&closes, &volumes);

        let indicators = StandardTechnicals::default().compute(&history, None);

        assert_eq!(indicators.rsi_14, Some(100.0));
        assert_eq!(indicators.mfi_14, Some(100.0));
        assert!(indicators.sma_20.is_some());
        assert!(indicators.sma_50.is_none());
        assert!(indicators.sma_200.is_none());
        assert!(indicators.macd.is_some());
        assert!(indicators.macd_signal.is_none());
        assert!(indicators.macd_histogram.is_none());
        assert!(indicators.beta.is_none());
        assert_eq!(indicators.volume_change_pct, Some(0.0));
    }

    #[test]
    fn test_empty_history_yields_empty_indicators() {
        let indicators = StandardTechnicals::default().compute(&HistoryRecord::default(), None);
        assert!(indicators.is_empty());
    }

    #[test]
    fn test_benchmark_ticker() {
        assert_eq!(benchmark_ticker(Market::Us).symbol(), "SPY");
        assert_eq!(benchmark_ticker(Market::Kosdaq).symbol(), "^KS11");
    }
}
