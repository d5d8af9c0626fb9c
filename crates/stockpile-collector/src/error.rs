//! 에러 타입 정의.

use stockpile_data::DataError;
use thiserror::Error;

use crate::phase::CollectionPhase;

/// Collector 에러 타입
#[derive(Debug, Error)]
pub enum CollectorError {
    /// 설정 에러
    #[error("Configuration error: {0}")]
    Config(String),

    /// 데이터 계층 에러 (저장소, 유니버스 등)
    #[error("Data error: {0}")]
    Data(#[from] DataError),

    /// 파일 입출력 에러
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 직렬화 에러
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 허용되지 않는 단계 전이
    #[error("Invalid phase transition: {from} -> {to}")]
    InvalidTransition {
        from: CollectionPhase,
        to: CollectionPhase,
    },
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, CollectorError>;
