//! 시장 단위 수집 결과.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stockpile_core::{FetchError, Market, Ticker};

use crate::error::{CollectorError, Result};
use crate::phase::CollectionPhase;

/// 실행 중 발생한 에러 한 건.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub phase: CollectionPhase,
    /// 종목 단위 에러면 심볼
    pub ticker: Option<String>,
    /// 에러 분류 (`RATE_LIMIT`, `TIMEOUT` ...)
    pub kind: String,
    pub message: String,
}

/// 한 시장의 수집 결과.
///
/// 오케스트레이터만 변경하며 COMPLETE/FAILED 이후에는 고정됩니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionResult {
    pub market: Market,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// 유니버스 종목 수
    pub total: usize,
    /// 이번 실행에서 저장된 종목 수
    pub successful: usize,
    /// 가격 수집에 실패한 종목 수
    pub failed: usize,
    /// 체크포인트로 건너뛴 종목 수
    pub skipped: usize,
    pub phase: CollectionPhase,
    pub errors: Vec<RunError>,
    pub rate_limit_hit: bool,
    pub circuit_breaker_tripped: bool,
    /// 인증 실패 또는 회로 소진으로 전체 실행 중단
    pub abort_run: bool,
    pub missing_tickers: Vec<String>,
}

impl CollectionResult {
    pub fn new(market: Market) -> Self {
        Self {
            market,
            started_at: Utc::now(),
            finished_at: None,
            total: 0,
            successful: 0,
            failed: 0,
            skipped: 0,
            phase: CollectionPhase::Init,
            errors: Vec::new(),
            rate_limit_hit: false,
            circuit_breaker_tripped: false,
            abort_run: false,
            missing_tickers: Vec::new(),
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn is_complete(&self) -> bool {
        self.phase == CollectionPhase::Complete
    }

    /// 레이트 리밋 때문에 누락 종목이 남은 상태.
    pub fn is_rate_limit_incomplete(&self) -> bool {
        self.rate_limit_hit && !self.missing_tickers.is_empty()
    }

    /// 다음 단계로 전이합니다.
    pub fn enter(&mut self, phase: CollectionPhase) -> Result<()> {
        if !self.phase.can_transition_to(phase) {
            return Err(CollectorError::InvalidTransition {
                from: self.phase,
                to: phase,
            });
        }
        tracing::debug!(market = %self.market, from = %self.phase, to = %phase, "단계 전이");
        self.phase = phase;
        if phase.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// 복구 불가능한 에러로 FAILED 처리합니다.
    pub fn fail(&mut self, kind: &str, message: impl Into<String>) {
        if self.is_frozen() {
            return;
        }
        let message = message.into();
        tracing::error!(
            market = %self.market,
            phase = %self.phase,
            kind,
            error = %message,
            "수집 실패"
        );
        self.errors.push(RunError {
            phase: self.phase,
            ticker: None,
            kind: kind.to_string(),
            message,
        });
        self.phase = CollectionPhase::Failed;
        self.finished_at = Some(Utc::now());
    }

    /// 종목 단위 에러 기록.
    pub fn record_ticker_error(&mut self, ticker: &Ticker, error: &FetchError) {
        if self.is_frozen() {
            return;
        }
        self.errors.push(RunError {
            phase: self.phase,
            ticker: Some(ticker.symbol().to_string()),
            kind: error.kind().as_str().to_string(),
            message: error.to_string(),
        });
    }

    /// 종목과 무관한 에러 기록 (저장 보고서 등).
    pub fn record_error(&mut self, kind: &str, message: impl Into<String>) {
        if self.is_frozen() {
            return;
        }
        self.errors.push(RunError {
            phase: self.phase,
            ticker: None,
            kind: kind.to_string(),
            message: message.into(),
        });
    }

    /// 단계별 에러 수.
    pub fn error_count(&self, phase: CollectionPhase) -> usize {
        self.errors.iter().filter(|e| e.phase == phase).count()
    }

    /// 성공률 (%)
    pub fn success_rate(&self) -> f64 {
        let attempted = self.total.saturating_sub(self.skipped);
        if attempted == 0 {
            0.0
        } else {
            (self.successful as f64 / attempted as f64) * 100.0
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    /// 요약 로그 출력
    pub fn log_summary(&self) {
        tracing::info!(
            market = %self.market,
            phase = %self.phase,
            total = self.total,
            successful = self.successful,
            failed = self.failed,
            skipped = self.skipped,
            errors = self.errors.len(),
            missing = self.missing_tickers.len(),
            rate_limit_hit = self.rate_limit_hit,
            circuit_breaker_tripped = self.circuit_breaker_tripped,
            abort_run = self.abort_run,
            success_rate = format!("{:.1}%", self.success_rate()),
            elapsed = format!("{:.1}s", self.elapsed_secs()),
            "수집 완료"
        );
    }
}

/// 프로세스 종료 코드.
///
/// - 0: 모든 시장 COMPLETE, 레이트 리밋 미완료 없음
/// - 2: 실패한 시장은 없고 레이트 리밋으로 누락이 남은 시장이 있음
/// - 1: 그 외
pub fn exit_code(results: &[CollectionResult]) -> u8 {
    if results.iter().any(|r| !r.is_complete()) {
        return 1;
    }
    if results.iter().any(|r| r.is_rate_limit_incomplete()) {
        return 2;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(market: Market) -> CollectionResult {
        let mut result = CollectionResult::new(market);
        let mut phase = CollectionPhase::Init;
        while let Some(next) = phase.next() {
            result.enter(next).unwrap();
            phase = next;
        }
        result
    }

    #[test]
    fn test_result_frozen_after_complete() {
        let mut result = completed(Market::Us);
        assert!(result.is_frozen());
        assert!(result.finished_at.is_some());

        result.fail("OTHER", "late failure");
        assert_eq!(result.phase, CollectionPhase::Complete);
        assert!(result.errors.is_empty());

        assert!(matches!(
            result.enter(CollectionPhase::Failed),
            Err(CollectorError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_fail_records_phase() {
        let mut result = CollectionResult::new(Market::Kospi);
        result.enter(CollectionPhase::Prices).unwrap();
        result.fail("AUTH_ERROR", "KRX 인증 실패");

        assert_eq!(result.phase, CollectionPhase::Failed);
        assert_eq!(result.errors[0].phase, CollectionPhase::Prices);
        assert_eq!(result.error_count(CollectionPhase::Prices), 1);
    }

    #[test]
    fn test_exit_codes() {
        let ok = completed(Market::Us);
        assert_eq!(exit_code(&[ok.clone()]), 0);

        let mut limited = completed(Market::Kospi);
        limited.rate_limit_hit = true;
        limited.missing_tickers = vec!["005930".into()];
        assert_eq!(exit_code(&[ok.clone(), limited.clone()]), 2);

        // 레이트 리밋이 있었어도 누락이 없으면 성공
        let mut recovered = completed(Market::Kosdaq);
        recovered.rate_limit_hit = true;
        assert_eq!(exit_code(&[recovered]), 0);

        let mut failed = CollectionResult::new(Market::Us);
        failed.fail("AUTH_ERROR", "denied");
        assert_eq!(exit_code(&[limited, failed]), 1);
    }
}
