//! Yahoo Finance 소스.
//!
//! 미국 시장에서는 가격/히스토리/재무지표를 모두 제공하고, 한국 시장에서는
//! `.KS`/`.KQ` 접미사로 가격과 히스토리만 제공합니다.

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use stockpile_core::{Bar, FetchError, HistoryRecord, Market, MetricsRecord, PriceRecord, Ticker};
use tokio::sync::Mutex;
use tracing::debug;
use yahoo_finance_api::YahooConnector;

use super::DataSource;
use crate::error::{DataError, Result};

/// 가격(소수점 4자리) 변환.
fn round_decimal_from_f64(value: f64) -> Option<Decimal> {
    Decimal::from_f64(value).map(|d| d.round_dp(4))
}

/// 퍼센트(소수점 2자리) 변환.
fn round_decimal_from_f64_dp2(value: f64) -> Option<Decimal> {
    Decimal::from_f64(value).map(|d| d.round_dp(2))
}

/// Yahoo Finance 심볼.
///
/// - 지수(`^KS11`)는 그대로
/// - KOSPI → `005930.KS`, KOSDAQ → `035720.KQ`
/// - 미국 클래스 주식 `BRK.B` → `BRK-B`
pub fn yahoo_symbol(ticker: &Ticker) -> String {
    let symbol = ticker.symbol();
    if symbol.starts_with('^') {
        return symbol.to_string();
    }
    match ticker.market() {
        Market::Kospi => format!("{}.KS", symbol),
        Market::Kosdaq => format!("{}.KQ", symbol),
        Market::Us => symbol.replace('.', "-"),
    }
}

/// 룩백(거래일 수)을 Yahoo range 문자열로 변환.
fn range_for_lookback(lookback: usize) -> &'static str {
    match lookback {
        0..=5 => "5d",
        6..=21 => "1mo",
        22..=63 => "3mo",
        64..=126 => "6mo",
        127..=252 => "1y",
        253..=504 => "2y",
        _ => "5y",
    }
}

/// 거래소 현지 시간 오프셋 (일봉 타임스탬프 → 거래일).
fn market_offset(market: Market) -> FixedOffset {
    let hours = if market.is_korean() { 9 } else { -5 };
    FixedOffset::east_opt(hours * 3600).unwrap_or_else(|| Utc.fix())
}

fn trading_date(timestamp: i64, market: Market) -> Option<NaiveDate> {
    DateTime::from_timestamp(timestamp, 0)
        .map(|dt| dt.with_timezone(&market_offset(market)).date_naive())
}

/// 분류는 상위 에러 원문으로만 합니다. 종목 코드는 메시지에만 붙습니다.
fn yahoo_error(symbol: &str, err: impl std::fmt::Display) -> FetchError {
    let detail = err.to_string();
    let context = format!("Yahoo Finance API 오류 ({})", symbol);
    let lower = detail.to_lowercase();
    if lower.contains("no quotes") || lower.contains("no result") || lower.contains("empty data") {
        FetchError::NotFound(format!("{}: {}", context, detail))
    } else {
        FetchError::from_upstream(context, detail)
    }
}

/// Yahoo Finance 데이터 소스.
pub struct YahooSource {
    /// 시세 조회용 (`&self` API)
    quotes: YahooConnector,
    /// `get_ticker_info`는 crumb 갱신 때문에 `&mut self`가 필요
    info: Mutex<YahooConnector>,
    metrics_enabled: bool,
    concurrency: usize,
}

impl YahooSource {
    pub fn new() -> Result<Self> {
        let connect = || {
            YahooConnector::new().map_err(|e| {
                DataError::ConnectionError(format!("Yahoo Finance 연결 실패: {}", e))
            })
        };
        Ok(Self {
            quotes: connect()?,
            info: Mutex::new(connect()?),
            metrics_enabled: true,
            concurrency: 4,
        })
    }

    /// 가격/히스토리 전용 (한국 시장 보조 소스).
    pub fn price_history_only() -> Result<Self> {
        Ok(Self {
            metrics_enabled: false,
            ..Self::new()?
        })
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    async fn fetch_bars(
        &self,
        ticker: &Ticker,
        range: &str,
    ) -> std::result::Result<Vec<Bar>, FetchError> {
        let symbol = yahoo_symbol(ticker);
        debug!(symbol = %symbol, range = range, "Yahoo Finance API 호출");

        let response = self
            .quotes
            .get_quote_range(&symbol, "1d", range)
            .await
            .map_err(|e| yahoo_error(&symbol, e))?;
        let quotes = response.quotes().map_err(|e| yahoo_error(&symbol, e))?;

        let bars: Vec<Bar> = quotes
            .iter()
            .filter_map(|q| {
                Some(Bar {
                    date: trading_date(q.timestamp as i64, ticker.market())?,
                    open: round_decimal_from_f64(q.open)?,
                    high: round_decimal_from_f64(q.high)?,
                    low: round_decimal_from_f64(q.low)?,
                    close: round_decimal_from_f64(q.close)?,
                    volume: i64::try_from(q.volume).unwrap_or(i64::MAX),
                })
            })
            .collect();

        if bars.is_empty() {
            return Err(FetchError::NotFound(format!("Yahoo Finance 시세 없음: {}", symbol)));
        }
        Ok(bars)
    }
}

#[async_trait::async_trait]
impl DataSource for YahooSource {
    fn name(&self) -> &str {
        "yahoo"
    }

    fn max_concurrency(&self) -> usize {
        self.concurrency
    }

    /// 5일 범위의 마지막 봉으로 가격을 만듭니다.
    async fn price(&self, ticker: &Ticker) -> std::result::Result<PriceRecord, FetchError> {
        let bars = self.fetch_bars(ticker, "5d").await?;
        PriceRecord::from_bars(&bars)
            .ok_or_else(|| FetchError::NotFound(format!("Yahoo Finance 가격 없음: {}", ticker)))
    }

    async fn history(
        &self,
        ticker: &Ticker,
        lookback: usize,
    ) -> std::result::Result<HistoryRecord, FetchError> {
        let bars = self.fetch_bars(ticker, range_for_lookback(lookback)).await?;
        Ok(HistoryRecord::with_lookback(bars, lookback))
    }

    /// `get_ticker_info` (summary detail, key statistics, financial data).
    async fn metrics(&self, ticker: &Ticker) -> std::result::Result<MetricsRecord, FetchError> {
        if !self.metrics_enabled {
            return Err(FetchError::unsupported(self.name(), "metrics"));
        }
        let symbol = yahoo_symbol(ticker);

        let summary = {
            let mut connector = self.info.lock().await;
            connector
                .get_ticker_info(&symbol)
                .await
                .map_err(|e| yahoo_error(&symbol, e))?
        };

        let result_data = summary
            .quote_summary
            .and_then(|qs| qs.result)
            .and_then(|r| r.into_iter().next())
            .ok_or_else(|| FetchError::NotFound(format!("Yahoo ticker info 결과 없음: {}", symbol)))?;

        let summary_detail = result_data.summary_detail.as_ref();
        let key_stats = result_data.default_key_statistics.as_ref();
        let financial_data = result_data.financial_data.as_ref();

        let metrics = MetricsRecord {
            per: summary_detail
                .and_then(|sd| sd.trailing_pe)
                .and_then(round_decimal_from_f64),
            pbr: key_stats
                .and_then(|ks| ks.price_to_book)
                .and_then(round_decimal_from_f64),
            psr: None,
            roe: financial_data
                .and_then(|fd| fd.return_on_equity)
                .and_then(|v| round_decimal_from_f64_dp2(v * 100.0)), // % 변환
            roa: financial_data
                .and_then(|fd| fd.return_on_assets)
                .and_then(|v| round_decimal_from_f64_dp2(v * 100.0)), // % 변환
            debt_to_equity: financial_data
                .and_then(|fd| fd.debt_to_equity)
                .and_then(round_decimal_from_f64),
            dividend_yield: summary_detail
                .and_then(|sd| sd.trailing_annual_dividend_yield)
                .and_then(|v| round_decimal_from_f64_dp2(v * 100.0)), // % 변환
            eps: key_stats
                .and_then(|ks| ks.trailing_eps)
                .and_then(round_decimal_from_f64),
            bps: key_stats
                .and_then(|ks| ks.book_value)
                .and_then(round_decimal_from_f64),
            market_cap: summary_detail
                .and_then(|sd| sd.market_cap)
                .and_then(Decimal::from_u64),
            // 52주 고저는 히스토리에서 채움
            week_52_high: None,
            week_52_low: None,
            as_of: Some(Utc::now().with_timezone(&market_offset(ticker.market())).date_naive()),
        };

        if metrics.is_empty() {
            return Err(FetchError::NotFound(format!("Yahoo Finance 지표 없음: {}", symbol)));
        }

        debug!(
            symbol = %symbol,
            per = ?metrics.per,
            pbr = ?metrics.pbr,
            roe = ?metrics.roe,
            "Yahoo ticker info 수집 완료"
        );
        Ok(metrics)
    }
}
