//! 미국/한국 주식 데이터 수집기.
//!
//! 이 crate는 시장 단위 수집 파이프라인을 제공합니다:
//! - 유니버스 조회 → 가격 → 히스토리 → 재무지표 → 기술지표 → 저장
//! - 체크포인트 기반 이어받기
//! - 수집 후 품질 검증과 JSON 실행 보고서
//! - 백업 및 JSON → PostgreSQL 적재

pub mod config;
pub mod error;
pub mod modules;
pub mod phase;
pub mod result;

pub use config::{CollectorConfig, SourceSettings};
pub use error::{CollectorError, Result};
pub use phase::CollectionPhase;
pub use result::{exit_code, CollectionResult, RunError};
