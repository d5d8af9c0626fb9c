//! 종목 단위 수집 에러와 분류 체계.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// 에러 분류.
///
/// 재시도, 서킷 브레이커, 배치 백오프가 모두 이 분류를 기준으로 동작합니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// 요청 한도 초과 (백오프 후 재시도)
    RateLimit,
    /// 타임아웃 (재시도)
    Timeout,
    /// 네트워크/연결 오류 (재시도)
    Network,
    /// 종목에 데이터가 없음 (재시도 안 함)
    DataNotFound,
    /// 인증 실패 (소스 전체 중단)
    AuthError,
    /// 서킷 오픈 (리셋 시각까지 대기)
    CircuitOpen,
    /// 잘못된 데이터 (필드 제거)
    Validation,
    /// 분류되지 않은 에러
    Other,
}

/// Rate limit 응답에서 흔히 보이는 문구.
const RATE_LIMIT_INDICATORS: &[&str] = &[
    "rate limit",
    "ratelimit",
    "rate-limit",
    "too many requests",
    "throttl",
    "quota exceeded",
    "request limit",
];

const TIMEOUT_INDICATORS: &[&str] = &["timed out", "timeout", "deadline has elapsed"];

const NETWORK_INDICATORS: &[&str] = &[
    "connection",
    "connect error",
    "dns",
    "reset by peer",
    "broken pipe",
    "network",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
];

const AUTH_INDICATORS: &[&str] = &[
    "unauthorized",
    "forbidden",
    "invalid api key",
    "auth_key",
    "authentication",
];

const NOT_FOUND_INDICATORS: &[&str] = &["not found", "no data", "데이터 없음", "empty result"];

/// 바로 뒤의 숫자를 HTTP 상태 코드로 읽는 문맥.
const STATUS_PREFIXES: &[&str] = &["http", "http/1.1", "http/2", "status", "code"];

fn status_kind(code: u16) -> Option<ErrorKind> {
    match code {
        429 => Some(ErrorKind::RateLimit),
        401 | 403 => Some(ErrorKind::AuthError),
        404 => Some(ErrorKind::DataNotFound),
        408 => Some(ErrorKind::Timeout),
        500..=599 => Some(ErrorKind::Network),
        _ => None,
    }
}

/// 메시지에서 HTTP 상태 코드를 찾습니다.
///
/// 독립된 3자리 숫자이면서 `HTTP 429`, `status: 503`, `(403)` 처럼 상태 코드
/// 문맥에 있거나 메시지 맨 앞에 올 때만 인정합니다. `040300.KS` 같은 종목
/// 코드 안의 숫자는 상태 코드가 아닙니다.
fn http_status_codes(lower: &str) -> Vec<u16> {
    let bytes = lower.as_bytes();
    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'.' || b == b'_';
    let mut codes = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        let end = i;

        if end - start != 3
            || (start > 0 && is_word(bytes[start - 1]))
            || (end < bytes.len() && is_word(bytes[end]))
        {
            continue;
        }

        let prefix = lower[..start]
            .trim_end_matches(|c: char| c.is_whitespace() || matches!(c, ':' | '=' | '#'));
        let in_parens = prefix.ends_with('(') && bytes.get(end) == Some(&b')');
        let in_context = prefix.is_empty()
            || in_parens
            || STATUS_PREFIXES.iter().any(|p| prefix.ends_with(p));

        if in_context {
            if let Ok(code) = lower[start..end].parse() {
                codes.push(code);
            }
        }
    }
    codes
}

impl ErrorKind {
    /// 에러 메시지 문자열로 분류합니다.
    ///
    /// 모든 수집기가 같은 분류기를 써야 백오프 동작이 일관됩니다.
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        if let Some(kind) = http_status_codes(&lower).into_iter().find_map(status_kind) {
            return kind;
        }

        let matches = |indicators: &[&str]| indicators.iter().any(|i| lower.contains(i));
        if matches(RATE_LIMIT_INDICATORS) {
            ErrorKind::RateLimit
        } else if matches(AUTH_INDICATORS) {
            ErrorKind::AuthError
        } else if matches(TIMEOUT_INDICATORS) {
            ErrorKind::Timeout
        } else if matches(NOT_FOUND_INDICATORS) {
            ErrorKind::DataNotFound
        } else if matches(NETWORK_INDICATORS) {
            ErrorKind::Network
        } else {
            ErrorKind::Other
        }
    }

    /// 재시도 가능한 분류인지 확인.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit | ErrorKind::Timeout | ErrorKind::Network
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "RATE_LIMIT",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Network => "NETWORK",
            ErrorKind::DataNotFound => "DATA_NOT_FOUND",
            ErrorKind::AuthError => "AUTH_ERROR",
            ErrorKind::CircuitOpen => "CIRCUIT_OPEN",
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Other => "OTHER",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 종목 하나를 수집하다 발생한 에러.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FetchError {
    /// 요청 한도 초과
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// 타임아웃
    #[error("Timeout: {0}")]
    Timeout(String),

    /// 네트워크/연결 에러
    #[error("Network error: {0}")]
    Network(String),

    /// 데이터 없음
    #[error("Data not found: {0}")]
    NotFound(String),

    /// 인증 실패
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// 서킷 브레이커가 열려 있음
    #[error("Circuit breaker '{name}' is open (retry after {remaining:?})")]
    CircuitOpen { name: String, remaining: Duration },

    /// 데이터 검증 실패
    #[error("Validation failed: {0}")]
    Validation(String),

    /// 소스가 지원하지 않는 작업
    #[error("{provider} does not support {operation}")]
    Unsupported {
        provider: String,
        operation: &'static str,
    },

    /// 분류되지 않은 에러
    #[error("{0}")]
    Other(String),
}

impl FetchError {
    /// 메시지로 분류하여 에러를 만듭니다.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::with_kind(ErrorKind::from_message(&message), message)
    }

    /// 상위 에러 원문으로 분류한 뒤, 종목 등 문맥을 붙인 메시지로 에러를 만듭니다.
    ///
    /// 문맥 문자열(종목 코드 등)은 분류에 영향을 주지 않습니다.
    pub fn from_upstream(context: impl fmt::Display, detail: impl fmt::Display) -> Self {
        let detail = detail.to_string();
        Self::with_kind(
            ErrorKind::from_message(&detail),
            format!("{}: {}", context, detail),
        )
    }

    /// 이미 정해진 분류로 에러를 만듭니다.
    pub fn with_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::RateLimit => FetchError::RateLimited(message),
            ErrorKind::Timeout => FetchError::Timeout(message),
            ErrorKind::Network => FetchError::Network(message),
            ErrorKind::DataNotFound => FetchError::NotFound(message),
            ErrorKind::AuthError => FetchError::Auth(message),
            ErrorKind::Validation => FetchError::Validation(message),
            ErrorKind::CircuitOpen | ErrorKind::Other => FetchError::Other(message),
        }
    }

    pub fn unsupported(provider: impl Into<String>, operation: &'static str) -> Self {
        FetchError::Unsupported {
            provider: provider.into(),
            operation,
        }
    }

    /// 에러 분류.
    ///
    /// `Other`는 메시지를 다시 분류합니다. 지원하지 않는 작업은
    /// "데이터 없음"으로 취급합니다.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::RateLimited(_) => ErrorKind::RateLimit,
            FetchError::Timeout(_) => ErrorKind::Timeout,
            FetchError::Network(_) => ErrorKind::Network,
            FetchError::NotFound(_) | FetchError::Unsupported { .. } => ErrorKind::DataNotFound,
            FetchError::Auth(_) => ErrorKind::AuthError,
            FetchError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            FetchError::Validation(_) => ErrorKind::Validation,
            FetchError::Other(message) => ErrorKind::from_message(message),
        }
    }

    /// 재시도 가능한 에러인지 확인.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// 서킷 브레이커 실패로 집계할 에러인지 확인.
    ///
    /// 데이터 없음/검증 실패는 상위 서비스 상태와 무관하므로 제외합니다.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::DataNotFound | ErrorKind::Validation | ErrorKind::CircuitOpen
        )
    }

    /// 서킷 오픈 에러의 남은 대기 시간.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::CircuitOpen { remaining, .. } => Some(*remaining),
            _ => None,
        }
    }
}
