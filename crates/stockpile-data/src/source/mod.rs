//! 수집 소스 계약.
//!
//! 모든 소스는 가격/히스토리/재무지표 세 가지 배치 작업을 노출합니다.
//! 제공하지 않는 작업은 메서드를 생략하지 않고, 모든 종목을 "지원하지
//! 않음" 실패로 돌려줍니다.

pub mod krx;
pub mod naver;
pub mod yahoo;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::StatusCode;
use stockpile_core::{
    FetchBatch, FetchError, FetchResult, HistoryRecord, MetricsRecord, PriceRecord, Ticker,
};
use tokio::time::Instant;

/// 브라우저 User-Agent (스크래핑 소스용).
pub(crate) const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// 데이터 소스.
///
/// 종목 단위 메서드(`price`/`history`/`metrics`)만 구현하면 배치 메서드는
/// 제한된 동시성으로 자동 제공됩니다. 벌크 엔드포인트가 있는 소스는 배치
/// 메서드를 직접 구현할 수 있습니다.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// 소스 이름 (로그, 결과 메타데이터).
    fn name(&self) -> &str;

    /// 배치 기본 구현의 동시 요청 수.
    fn max_concurrency(&self) -> usize {
        4
    }

    async fn price(&self, ticker: &Ticker) -> Result<PriceRecord, FetchError> {
        let _ = ticker;
        Err(FetchError::unsupported(self.name(), "prices"))
    }

    async fn history(&self, ticker: &Ticker, lookback: usize) -> Result<HistoryRecord, FetchError> {
        let _ = (ticker, lookback);
        Err(FetchError::unsupported(self.name(), "history"))
    }

    async fn metrics(&self, ticker: &Ticker) -> Result<MetricsRecord, FetchError> {
        let _ = ticker;
        Err(FetchError::unsupported(self.name(), "metrics"))
    }

    async fn fetch_prices(&self, tickers: &[Ticker]) -> FetchBatch<PriceRecord> {
        fetch_each(self.name(), tickers, self.max_concurrency(), |t| self.price(t)).await
    }

    async fn fetch_history(
        &self,
        tickers: &[Ticker],
        lookback: usize,
    ) -> FetchBatch<HistoryRecord> {
        fetch_each(self.name(), tickers, self.max_concurrency(), |t| {
            self.history(t, lookback)
        })
        .await
    }

    async fn fetch_metrics(&self, tickers: &[Ticker]) -> FetchBatch<MetricsRecord> {
        fetch_each(self.name(), tickers, self.max_concurrency(), |t| self.metrics(t)).await
    }
}

/// 종목별 작업을 제한된 동시성으로 실행하고 입력 종목에 맞춘 배치를 만듭니다.
pub async fn fetch_each<'a, T, F, Fut>(
    source: &str,
    tickers: &'a [Ticker],
    concurrency: usize,
    operation: F,
) -> FetchBatch<T>
where
    F: Fn(&'a Ticker) -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let operation = &operation;
    let tasks: Vec<_> = tickers
        .iter()
        .map(|ticker| async move {
            let fut = operation(ticker);
            let started = Instant::now();
            let outcome = fut.await;
            FetchResult {
                ticker: ticker.clone(),
                outcome,
                latency: started.elapsed(),
                source: source.to_string(),
            }
        })
        .collect();
    let results: Vec<FetchResult<T>> = stream::iter(tasks)
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    results
        .into_iter()
        .collect::<FetchBatch<T>>()
        .conform_to(tickers, source)
}

/// HTTP 상태 코드를 수집 에러로 변환합니다. 성공 코드는 `None`.
pub(crate) fn status_to_error(status: StatusCode, context: &str) -> Option<FetchError> {
    if status.is_success() {
        return None;
    }
    let message = format!("{}: HTTP {}", context, status);
    Some(match status.as_u16() {
        429 => FetchError::RateLimited(message),
        401 | 403 => FetchError::Auth(message),
        404 => FetchError::NotFound(message),
        500..=599 => FetchError::Network(message),
        _ => FetchError::Other(message),
    })
}

/// reqwest 에러를 수집 에러로 변환합니다.
pub(crate) fn from_reqwest(err: reqwest::Error, context: &str) -> FetchError {
    let message = format!("{}: {}", context, err);
    if err.is_timeout() {
        FetchError::Timeout(message)
    } else if err.is_connect() {
        FetchError::Network(message)
    } else if let Some(status) = err.status() {
        status_to_error(status, context).unwrap_or(FetchError::Other(message))
    } else if err.is_decode() {
        FetchError::Validation(message)
    } else {
        FetchError::from_upstream(context, err)
    }
}

/// 타임아웃이 설정된 HTTP 클라이언트.
pub(crate) fn http_client(timeout: Duration, user_agent: Option<&str>) -> reqwest::Client {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(ua) = user_agent {
        builder = builder.user_agent(ua);
    }
    builder.build().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "HTTP 클라이언트 설정 실패, 기본 클라이언트 사용");
        reqwest::Client::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use stockpile_core::{ErrorKind, Market};

    struct PricesOnly;

    #[async_trait]
    impl DataSource for PricesOnly {
        fn name(&self) -> &str {
            "prices-only"
        }

        async fn price(&self, ticker: &Ticker) -> Result<PriceRecord, FetchError> {
            if ticker.symbol() == "MISSING" {
                return Err(FetchError::NotFound("no quote".into()));
            }
            Ok(PriceRecord {
                date: NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
                open: dec!(10),
                high: dec!(11),
                low: dec!(9),
                close: dec!(10.5),
                volume: 100,
                change_pct: None,
            })
        }
    }

    fn tickers(symbols: &[&str]) -> Vec<Ticker> {
        symbols.iter().map(|s| Ticker::us(*s)).collect()
    }

    #[tokio::test]
    async fn test_default_batch_covers_every_ticker() {
        let input = tickers(&["AAPL", "MISSING", "MSFT"]);
        let batch = PricesOnly.fetch_prices(&input).await;

        assert!(batch.covers_exactly(&input));
        assert_eq!(batch.succeeded_count(), 2);
        assert_eq!(batch.count_kind(ErrorKind::DataNotFound), 1);
    }

    #[tokio::test]
    async fn test_unsupported_operation_fails_all_with_reason() {
        let input = vec![Ticker::new("005930", Market::Kospi)];
        let batch = PricesOnly.fetch_history(&input, 300).await;

        assert_eq!(batch.failed_count(), 1);
        let (_, err) = batch.failed().next().unwrap();
        assert!(err.to_string().contains("does not support history"));
    }

    #[test]
    fn test_status_mapping() {
        let kind = |code: u16| {
            status_to_error(StatusCode::from_u16(code).unwrap(), "test")
                .map(|e| e.kind())
        };
        assert_eq!(kind(200), None);
        assert_eq!(kind(429), Some(ErrorKind::RateLimit));
        assert_eq!(kind(401), Some(ErrorKind::AuthError));
        assert_eq!(kind(403), Some(ErrorKind::AuthError));
        assert_eq!(kind(404), Some(ErrorKind::DataNotFound));
        assert_eq!(kind(503), Some(ErrorKind::Network));
    }
}
