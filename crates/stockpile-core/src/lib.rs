//! # Stockpile Core
//!
//! 수집 파이프라인 전반에서 공유하는 도메인 타입을 제공합니다:
//! - 시장 및 종목 식별자 (`Market`, `Ticker`)
//! - 가격/히스토리/재무지표/기술지표 레코드
//! - 종목 단위 수집 결과 (`FetchResult`, `FetchBatch`)
//! - 에러 분류 체계 (`FetchError`, `ErrorKind`)
//! - 로깅 인프라

pub mod error;
pub mod fetch;
pub mod logging;
pub mod types;

pub use error::*;
pub use fetch::*;
pub use logging::*;
pub use types::*;
