//! 적응형 배치 전략.
//!
//! 종목 목록을 고정 크기 배치로 나눠 처리합니다. 배치 안에서는 제한된
//! 동시성으로 요청하고, 배치 N+1은 배치 N의 결과가 모두 모인 뒤에만
//! 시작합니다. 배치 전체가 rate limit으로 실패하는 일이 연속되면
//! 소스별 백오프 곡선에 따라 쉬고, 한도를 넘으면 남은 종목은 시도하지
//! 않고 rate limit 실패로 표시합니다.

use std::future::Future;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use rand::Rng;
use stockpile_core::{FetchBatch, FetchError, FetchResult, Ticker};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::classify::FailureClass;

/// 배치 전략 설정.
#[derive(Debug, Clone)]
pub struct AdaptiveBatchConfig {
    pub batch_size: usize,
    /// 배치 안의 동시 요청 수
    pub concurrency: usize,
    /// 배치 사이 기본 대기 (실패 여부와 무관하게 항상 적용)
    pub inter_batch_delay: Duration,
    /// 배치 사이 추가 지터 (0 ~ 값)
    pub inter_batch_jitter: Duration,
    /// 종목 하나의 제한 시간
    pub item_timeout: Duration,
    /// 배치 전체의 제한 시간
    pub batch_timeout: Duration,
    /// 이 횟수만큼 연속 rate limit 배치가 나오면 백오프
    pub backoff_trigger: u32,
    /// 이 횟수만큼 연속 rate limit 배치가 나오면 중단
    pub max_consecutive_failures: u32,
    pub backoff: BackoffPolicy,
}

impl Default for AdaptiveBatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            concurrency: 5,
            inter_batch_delay: Duration::from_millis(500),
            inter_batch_jitter: Duration::from_millis(500),
            item_timeout: Duration::from_secs(30),
            batch_timeout: Duration::from_secs(300),
            backoff_trigger: 2,
            max_consecutive_failures: 5,
            backoff: BackoffPolicy::official_api(),
        }
    }
}

impl AdaptiveBatchConfig {
    /// 스크래핑 소스용 (작은 배치, 낮은 동시성, 긴 백오프).
    pub fn scraping() -> Self {
        Self {
            batch_size: 20,
            concurrency: 3,
            inter_batch_delay: Duration::from_secs(1),
            inter_batch_jitter: Duration::from_secs(1),
            backoff: BackoffPolicy::scraping(),
            ..Default::default()
        }
    }
}

/// 소스 실행 중단 사유.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// 연속 rate limit 배치가 한도를 넘음
    RateLimit,
    /// 인증 실패
    Auth,
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaltReason::RateLimit => write!(f, "rate limit exhausted"),
            HaltReason::Auth => write!(f, "authentication failed"),
        }
    }
}

/// 항목 하나의 처리 결과.
#[derive(Debug, Clone)]
pub struct ItemOutcome<I, T> {
    pub item: I,
    pub result: Result<T, FetchError>,
    pub latency: Duration,
}

/// 전체 실행 결과. `results`는 입력 순서를 유지하며 입력 항목 수와 같습니다.
#[derive(Debug, Clone)]
pub struct BatchOutcome<I, T> {
    pub results: Vec<ItemOutcome<I, T>>,
    pub halted: Option<HaltReason>,
    /// rate limit 실패가 한 번이라도 있었는지
    pub rate_limit_hit: bool,
    /// 백오프 횟수
    pub backoffs: u32,
    pub batches_run: usize,
}

impl<I, T> BatchOutcome<I, T> {
    pub fn succeeded_count(&self) -> usize {
        self.results.iter().filter(|r| r.result.is_ok()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.results.len() - self.succeeded_count()
    }
}

impl<T> BatchOutcome<Ticker, T> {
    pub fn into_fetch_batch(self, source: &str) -> FetchBatch<T> {
        self.results
            .into_iter()
            .map(|o| FetchResult {
                ticker: o.item,
                outcome: o.result,
                latency: o.latency,
                source: source.to_string(),
            })
            .collect()
    }
}

/// 적응형 배치 실행기.
#[derive(Debug, Clone)]
pub struct AdaptiveBatchStrategy {
    name: String,
    config: AdaptiveBatchConfig,
}

impl AdaptiveBatchStrategy {
    pub fn new(name: impl Into<String>, config: AdaptiveBatchConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub fn config(&self) -> &AdaptiveBatchConfig {
        &self.config
    }

    /// 모든 항목을 배치 단위로 처리합니다.
    pub async fn run<I, T, F, Fut>(&self, items: Vec<I>, operation: F) -> BatchOutcome<I, T>
    where
        I: Clone,
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let batch_size = self.config.batch_size.max(1);
        let total_batches = items.len().div_ceil(batch_size);
        let mut outcome = BatchOutcome {
            results: Vec::with_capacity(items.len()),
            halted: None,
            rate_limit_hit: false,
            backoffs: 0,
            batches_run: 0,
        };
        let mut consecutive_rate_limited = 0u32;

        for (batch_idx, chunk) in items.chunks(batch_size).enumerate() {
            if batch_idx > 0 {
                self.pause_between_batches().await;
            }

            let batch_results = self.run_batch(chunk, &operation).await;
            outcome.batches_run += 1;

            let classes: Vec<FailureClass> = batch_results
                .iter()
                .filter_map(|r| r.result.as_ref().err().map(FailureClass::classify))
                .collect();
            let all_rate_limited = classes.len() == batch_results.len()
                && classes.iter().all(|c| *c == FailureClass::RateLimit);
            let auth_failed = classes.contains(&FailureClass::AuthError);
            if classes.contains(&FailureClass::RateLimit) {
                outcome.rate_limit_hit = true;
            }

            debug!(
                source = %self.name,
                batch = batch_idx + 1,
                total_batches,
                failed = classes.len(),
                size = chunk.len(),
                "Batch completed"
            );
            outcome.results.extend(batch_results);

            let remaining = &items[((batch_idx + 1) * batch_size).min(items.len())..];

            if auth_failed {
                warn!(source = %self.name, skipped = remaining.len(), "인증 실패로 소스 중단");
                outcome.halted = Some(HaltReason::Auth);
                Self::mark_remaining(&mut outcome, remaining, |_| {
                    FetchError::Auth("source halted after authentication failure".to_string())
                });
                break;
            }

            if all_rate_limited {
                consecutive_rate_limited += 1;
            } else {
                consecutive_rate_limited = 0;
            }

            if consecutive_rate_limited >= self.config.max_consecutive_failures {
                warn!(
                    source = %self.name,
                    consecutive = consecutive_rate_limited,
                    skipped = remaining.len(),
                    "연속 rate limit 한도 초과, 남은 종목 중단"
                );
                outcome.halted = Some(HaltReason::RateLimit);
                Self::mark_remaining(&mut outcome, remaining, |_| {
                    FetchError::RateLimited(
                        "not attempted: consecutive rate-limited batches".to_string(),
                    )
                });
                break;
            }

            if consecutive_rate_limited >= self.config.backoff_trigger && !remaining.is_empty() {
                let step = consecutive_rate_limited - self.config.backoff_trigger;
                let delay = self.config.backoff.delay(step);
                info!(
                    source = %self.name,
                    consecutive = consecutive_rate_limited,
                    delay_secs = delay.as_secs_f64(),
                    "Rate limit backoff"
                );
                tokio::time::sleep(delay).await;
                outcome.backoffs += 1;
            }
        }

        outcome
    }

    async fn run_batch<I, T, F, Fut>(&self, chunk: &[I], operation: &F) -> Vec<ItemOutcome<I, T>>
    where
        I: Clone,
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let item_timeout = self.config.item_timeout;
        let batch_timeout = self.config.batch_timeout;
        let mut slots: Vec<Option<(Result<T, FetchError>, Duration)>> =
            (0..chunk.len()).map(|_| None).collect();

        let pending = stream::iter(chunk.iter().cloned().enumerate())
            .map(|(idx, item)| {
                let fut = operation(item);
                async move {
                    let started = Instant::now();
                    let result = match tokio::time::timeout(item_timeout, fut).await {
                        Ok(result) => result,
                        Err(_) => Err(FetchError::Timeout(format!(
                            "item timed out after {}s",
                            item_timeout.as_secs_f64()
                        ))),
                    };
                    (idx, result, started.elapsed())
                }
            })
            .buffer_unordered(self.config.concurrency.max(1));
        tokio::pin!(pending);

        let deadline = tokio::time::sleep(batch_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                next = pending.next() => match next {
                    Some((idx, result, latency)) => slots[idx] = Some((result, latency)),
                    None => break,
                },
                _ = &mut deadline => {
                    warn!(
                        source = %self.name,
                        timeout_secs = batch_timeout.as_secs_f64(),
                        unfinished = slots.iter().filter(|s| s.is_none()).count(),
                        "Batch timed out"
                    );
                    break;
                }
            }
        }

        chunk
            .iter()
            .cloned()
            .zip(slots)
            .map(|(item, slot)| match slot {
                Some((result, latency)) => ItemOutcome {
                    item,
                    result,
                    latency,
                },
                None => ItemOutcome {
                    item,
                    result: Err(FetchError::Timeout(format!(
                        "batch timed out after {}s",
                        batch_timeout.as_secs_f64()
                    ))),
                    latency: batch_timeout,
                },
            })
            .collect()
    }

    async fn pause_between_batches(&self) {
        let mut delay = self.config.inter_batch_delay;
        let jitter_ms = self.config.inter_batch_jitter.as_millis() as u64;
        if jitter_ms > 0 {
            delay += Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn mark_remaining<I: Clone, T>(
        outcome: &mut BatchOutcome<I, T>,
        remaining: &[I],
        error: impl Fn(&I) -> FetchError,
    ) {
        outcome
            .results
            .extend(remaining.iter().map(|item| ItemOutcome {
                item: item.clone(),
                result: Err(error(item)),
                latency: Duration::ZERO,
            }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use stockpile_core::{ErrorKind, Market};

    fn config() -> AdaptiveBatchConfig {
        AdaptiveBatchConfig {
            batch_size: 2,
            concurrency: 2,
            inter_batch_delay: Duration::from_millis(10),
            inter_batch_jitter: Duration::ZERO,
            item_timeout: Duration::from_secs(5),
            batch_timeout: Duration::from_secs(30),
            backoff_trigger: 2,
            max_consecutive_failures: 3,
            backoff: BackoffPolicy::official_api().without_jitter(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_items_preserved_in_order() {
        let strategy = AdaptiveBatchStrategy::new("test", config());
        let items: Vec<u32> = (0..7).collect();

        let outcome = strategy
            .run(items, |n| async move {
                // 뒤 항목이 먼저 끝나도 결과 순서는 입력 순서
                tokio::time::sleep(Duration::from_millis(u64::from(10 - n))).await;
                if n % 3 == 0 {
                    Err(FetchError::NotFound(format!("{n}")))
                } else {
                    Ok(n * 10)
                }
            })
            .await;

        assert_eq!(outcome.results.len(), 7);
        assert_eq!(outcome.batches_run, 4);
        let order: Vec<u32> = outcome.results.iter().map(|r| r.item).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(outcome.succeeded_count(), 4);
        assert!(outcome.halted.is_none());
        assert!(!outcome.rate_limit_hit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_rate_limits_backoff_then_halt() {
        let calls = AtomicU32::new(0);
        let strategy = AdaptiveBatchStrategy::new("test", config());
        let start = Instant::now();

        let outcome = strategy
            .run((0..10).collect::<Vec<u32>>(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(FetchError::RateLimited("429".into())) }
            })
            .await;

        // 3번째 배치에서 중단, 나머지 4개는 시도하지 않음
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(outcome.results.len(), 10);
        assert_eq!(outcome.halted, Some(HaltReason::RateLimit));
        assert_eq!(outcome.backoffs, 1);
        assert!(outcome.rate_limit_hit);
        assert!(outcome
            .results
            .iter()
            .all(|r| r.result.as_ref().unwrap_err().kind() == ErrorKind::RateLimit));
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_rate_limit_resets_counter() {
        let strategy = AdaptiveBatchStrategy::new("test", config());

        let outcome = strategy
            .run((0..10).collect::<Vec<u32>>(), |n| async move {
                // 배치 3은 성공 1개 포함
                if n == 4 {
                    Ok(())
                } else {
                    Err(FetchError::RateLimited("429".into()))
                }
            })
            .await;

        assert_eq!(outcome.halted, None);
        assert_eq!(outcome.batches_run, 5);
        assert_eq!(outcome.succeeded_count(), 1);
        // 배치 2 이후 1회, 배치 5 이후는 남은 항목이 없어 백오프 없음
        assert_eq!(outcome.backoffs, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_halts_source() {
        let calls = AtomicU32::new(0);
        let strategy = AdaptiveBatchStrategy::new("test", config());

        let outcome = strategy
            .run((0..6).collect::<Vec<u32>>(), |n| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 1 {
                        Err(FetchError::Auth("401".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.halted, Some(HaltReason::Auth));
        assert_eq!(outcome.results.len(), 6);
        assert_eq!(outcome.succeeded_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_item_and_batch_timeouts_become_failures() {
        let mut cfg = config();
        cfg.batch_size = 3;
        cfg.concurrency = 1;
        cfg.item_timeout = Duration::from_secs(5);
        cfg.batch_timeout = Duration::from_secs(8);
        let strategy = AdaptiveBatchStrategy::new("test", cfg);

        let outcome = strategy
            .run(vec![0u32, 1, 2], |n| async move {
                let wait = if n == 0 { 60 } else { 4 };
                tokio::time::sleep(Duration::from_secs(wait)).await;
                Ok(n)
            })
            .await;

        // 0: 5s에 항목 타임아웃, 1: 9s에 끝나므로 배치 타임아웃(8s), 2: 미시작
        assert_eq!(outcome.results.len(), 3);
        assert_eq!(outcome.succeeded_count(), 0);
        for r in &outcome.results {
            assert_eq!(r.result.as_ref().unwrap_err().kind(), ErrorKind::Timeout);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_into_fetch_batch_covers_every_ticker() {
        let strategy = AdaptiveBatchStrategy::new("test", config());
        let tickers: Vec<Ticker> = ["005930", "000660", "035420"]
            .iter()
            .map(|s| Ticker::new(*s, Market::Kospi))
            .collect();

        let outcome = strategy
            .run(tickers.clone(), |t| async move {
                if t.symbol() == "000660" {
                    Err(FetchError::NotFound("no data".into()))
                } else {
                    Ok(t.symbol().len())
                }
            })
            .await;
        let batch = outcome.into_fetch_batch("test");

        assert!(batch.covers_exactly(&tickers));
        assert_eq!(batch.succeeded_count(), 2);
        assert_eq!(batch.failed_count(), 1);
    }
}
