//! 배치 백오프용 실패 분류.
//!
//! 모든 수집기가 같은 분류기를 써야 소스마다 백오프가 일관되게 동작합니다.

use stockpile_core::{ErrorKind, FetchError};

/// 배치 전략이 보는 실패 분류.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    RateLimit,
    Timeout,
    NoData,
    AuthError,
    Other,
}

impl FailureClass {
    pub fn classify(error: &FetchError) -> Self {
        Self::from_kind(error.kind())
    }

    /// 타입 정보 없이 메시지만 있을 때.
    pub fn classify_message(message: &str) -> Self {
        Self::from_kind(ErrorKind::from_message(message))
    }

    fn from_kind(kind: ErrorKind) -> Self {
        match kind {
            // 서킷 오픈은 상위 소스가 한도에 걸린 것과 같게 취급
            ErrorKind::RateLimit | ErrorKind::CircuitOpen => FailureClass::RateLimit,
            ErrorKind::Timeout => FailureClass::Timeout,
            ErrorKind::DataNotFound => FailureClass::NoData,
            ErrorKind::AuthError => FailureClass::AuthError,
            ErrorKind::Network | ErrorKind::Validation | ErrorKind::Other => FailureClass::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::RateLimit => "RATE_LIMIT",
            FailureClass::Timeout => "TIMEOUT",
            FailureClass::NoData => "NO_DATA",
            FailureClass::AuthError => "AUTH_ERROR",
            FailureClass::Other => "OTHER",
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_typed_errors() {
        assert_eq!(
            FailureClass::classify(&FetchError::RateLimited("x".into())),
            FailureClass::RateLimit
        );
        assert_eq!(
            FailureClass::classify(&FetchError::CircuitOpen {
                name: "naver".into(),
                remaining: Duration::from_secs(3)
            }),
            FailureClass::RateLimit
        );
        assert_eq!(
            FailureClass::classify(&FetchError::unsupported("krx", "history")),
            FailureClass::NoData
        );
        assert_eq!(
            FailureClass::classify(&FetchError::Auth("bad key".into())),
            FailureClass::AuthError
        );
    }

    #[test]
    fn test_message_substrings() {
        assert_eq!(
            FailureClass::classify_message("Too Many Requests"),
            FailureClass::RateLimit
        );
        assert_eq!(
            FailureClass::classify_message("request timed out"),
            FailureClass::Timeout
        );
        assert_eq!(
            FailureClass::classify_message("no data for 000000"),
            FailureClass::NoData
        );
        assert_eq!(FailureClass::classify_message("boom"), FailureClass::Other);
    }
}
