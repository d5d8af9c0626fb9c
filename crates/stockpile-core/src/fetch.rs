//! 종목 단위 수집 결과.
//!
//! 한 단계(phase)를 마친 배치는 입력 종목을 하나도 잃지 않습니다.
//! 모든 입력 종목은 성공 또는 실패 중 정확히 한 곳에 나타납니다.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::{ErrorKind, FetchError, Ticker};

/// 한 종목, 한 단계의 수집 결과.
#[derive(Debug, Clone)]
pub struct FetchResult<T> {
    pub ticker: Ticker,
    pub outcome: Result<T, FetchError>,
    /// 요청 소요 시간
    pub latency: Duration,
    /// 결과를 만든 소스 이름
    pub source: String,
}

impl<T> FetchResult<T> {
    pub fn success(ticker: Ticker, value: T, source: impl Into<String>, latency: Duration) -> Self {
        Self {
            ticker,
            outcome: Ok(value),
            latency,
            source: source.into(),
        }
    }

    pub fn failure(
        ticker: Ticker,
        error: FetchError,
        source: impl Into<String>,
        latency: Duration,
    ) -> Self {
        Self {
            ticker,
            outcome: Err(error),
            latency,
            source: source.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn value(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&FetchError> {
        self.outcome.as_ref().err()
    }
}

/// 종목당 최대 하나의 결과를 갖는 배치.
///
/// 같은 종목을 다시 넣으면 이전 결과를 대체합니다.
/// 삽입 순서가 유지됩니다.
#[derive(Debug, Clone)]
pub struct FetchBatch<T> {
    results: Vec<FetchResult<T>>,
    index: HashMap<Ticker, usize>,
}

impl<T> Default for FetchBatch<T> {
    fn default() -> Self {
        Self {
            results: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T> FetchBatch<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 모든 종목을 같은 사유로 실패 처리한 배치.
    ///
    /// 지원하지 않는 작업은 메서드를 생략하지 않고 이 형태로 응답합니다.
    pub fn all_failed(
        tickers: &[Ticker],
        source: &str,
        error: impl Fn(&Ticker) -> FetchError,
    ) -> Self {
        let mut batch = Self::new();
        for ticker in tickers {
            batch.push(FetchResult::failure(
                ticker.clone(),
                error(ticker),
                source,
                Duration::ZERO,
            ));
        }
        batch
    }

    /// 결과 추가. 같은 종목이 이미 있으면 대체합니다.
    pub fn push(&mut self, result: FetchResult<T>) {
        match self.index.get(&result.ticker) {
            Some(&i) => self.results[i] = result,
            None => {
                self.index.insert(result.ticker.clone(), self.results.len());
                self.results.push(result);
            }
        }
    }

    /// 입력 종목 목록에 맞춰 배치를 정리합니다.
    ///
    /// - 결과가 없는 종목은 `NotFound` 실패로 채웁니다.
    /// - 입력에 없는 종목의 결과는 버립니다.
    /// - 결과 순서는 입력 순서를 따릅니다.
    pub fn conform_to(self, tickers: &[Ticker], source: &str) -> Self {
        let mut by_ticker: HashMap<Ticker, FetchResult<T>> = self
            .results
            .into_iter()
            .map(|r| (r.ticker.clone(), r))
            .collect();

        let mut conformed = Self::new();
        for ticker in tickers {
            if conformed.contains(ticker) {
                continue;
            }
            let result = by_ticker.remove(ticker).unwrap_or_else(|| {
                FetchResult::failure(
                    ticker.clone(),
                    FetchError::NotFound(format!("{} returned no result for {}", source, ticker)),
                    source,
                    Duration::ZERO,
                )
            });
            conformed.push(result);
        }
        conformed
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn contains(&self, ticker: &Ticker) -> bool {
        self.index.contains_key(ticker)
    }

    pub fn get(&self, ticker: &Ticker) -> Option<&FetchResult<T>> {
        self.index.get(ticker).map(|&i| &self.results[i])
    }

    pub fn results(&self) -> &[FetchResult<T>] {
        &self.results
    }

    /// 성공한 종목과 값.
    pub fn succeeded(&self) -> impl Iterator<Item = (&Ticker, &T)> {
        self.results
            .iter()
            .filter_map(|r| r.value().map(|v| (&r.ticker, v)))
    }

    /// 실패한 종목과 에러.
    pub fn failed(&self) -> impl Iterator<Item = (&Ticker, &FetchError)> {
        self.results
            .iter()
            .filter_map(|r| r.error().map(|e| (&r.ticker, e)))
    }

    pub fn succeeded_count(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.len() - self.succeeded_count()
    }

    pub fn succeeded_tickers(&self) -> Vec<Ticker> {
        self.succeeded().map(|(t, _)| t.clone()).collect()
    }

    /// 특정 분류로 실패한 종목 수.
    pub fn count_kind(&self, kind: ErrorKind) -> usize {
        self.failed().filter(|(_, e)| e.kind() == kind).count()
    }

    pub fn into_results(self) -> Vec<FetchResult<T>> {
        self.results
    }

    /// (성공 맵, 실패 맵)으로 분리.
    pub fn into_maps(self) -> (HashMap<Ticker, T>, HashMap<Ticker, FetchError>) {
        let mut ok = HashMap::new();
        let mut err = HashMap::new();
        for r in self.results {
            match r.outcome {
                Ok(v) => {
                    ok.insert(r.ticker, v);
                }
                Err(e) => {
                    err.insert(r.ticker, e);
                }
            }
        }
        (ok, err)
    }

    /// 성공/실패 집합이 서로소이고 입력과 정확히 일치하는지 확인.
    pub fn covers_exactly(&self, tickers: &[Ticker]) -> bool {
        let expected: HashSet<&Ticker> = tickers.iter().collect();
        let ok: HashSet<&Ticker> = self.succeeded().map(|(t, _)| t).collect();
        let failed: HashSet<&Ticker> = self.failed().map(|(t, _)| t).collect();
        ok.is_disjoint(&failed)
            && ok.len() + failed.len() == expected.len()
            && ok.union(&failed).all(|t| expected.contains(t))
    }
}

impl<T> FromIterator<FetchResult<T>> for FetchBatch<T> {
    fn from_iter<I: IntoIterator<Item = FetchResult<T>>>(iter: I) -> Self {
        let mut batch = Self::new();
        for r in iter {
            batch.push(r);
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Market;
    use proptest::prelude::*;

    fn t(s: &str) -> Ticker {
        Ticker::new(s, Market::Us)
    }

    #[test]
    fn test_push_replaces_duplicate() {
        let mut batch: FetchBatch<u32> = FetchBatch::new();
        batch.push(FetchResult::failure(
            t("A"),
            FetchError::Timeout("slow".into()),
            "yahoo",
            Duration::ZERO,
        ));
        batch.push(FetchResult::success(t("A"), 1, "yahoo", Duration::ZERO));

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.succeeded_count(), 1);
        assert_eq!(batch.failed_count(), 0);
    }

    #[test]
    fn test_conform_fills_missing_and_drops_strays() {
        let batch: FetchBatch<u32> = vec![
            FetchResult::success(t("B"), 2, "src", Duration::from_millis(5)),
            FetchResult::success(t("Z"), 9, "src", Duration::ZERO),
        ]
        .into_iter()
        .collect();

        let tickers = vec![t("A"), t("B")];
        let conformed = batch.conform_to(&tickers, "src");

        assert_eq!(conformed.len(), 2);
        assert_eq!(conformed.results()[0].ticker, t("A"));
        assert_eq!(
            conformed.get(&t("A")).unwrap().error().map(|e| e.kind()),
            Some(ErrorKind::DataNotFound)
        );
        assert_eq!(conformed.get(&t("B")).unwrap().value(), Some(&2));
        assert_eq!(conformed.get(&t("B")).unwrap().latency, Duration::from_millis(5));
        assert!(!conformed.contains(&t("Z")));
        assert!(conformed.covers_exactly(&tickers));
    }

    #[test]
    fn test_all_failed() {
        let tickers = vec![t("A"), t("B")];
        let batch: FetchBatch<()> =
            FetchBatch::all_failed(&tickers, "krx", |_| FetchError::unsupported("krx", "history"));
        assert_eq!(batch.failed_count(), 2);
        assert!(batch.covers_exactly(&tickers));
    }

    proptest! {
        #[test]
        fn prop_conform_covers_every_input(
            inputs in proptest::collection::vec("[A-E]", 0..12),
            returned in proptest::collection::vec(("[A-G]", any::<bool>()), 0..12),
        ) {
            let tickers: Vec<Ticker> = inputs.iter().map(|s| t(s)).collect();
            let batch: FetchBatch<u8> = returned
                .iter()
                .map(|(s, ok)| {
                    if *ok {
                        FetchResult::success(t(s), 1, "p", Duration::ZERO)
                    } else {
                        FetchResult::failure(
                            t(s),
                            FetchError::Network("x".into()),
                            "p",
                            Duration::ZERO,
                        )
                    }
                })
                .collect();

            let conformed = batch.conform_to(&tickers, "p");
            let mut unique = tickers.clone();
            unique.sort();
            unique.dedup();

            prop_assert_eq!(conformed.len(), unique.len());
            prop_assert_eq!(conformed.succeeded_count() + conformed.failed_count(), unique.len());
            prop_assert!(conformed.covers_exactly(&unique));
        }
    }
}
