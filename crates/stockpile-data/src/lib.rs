//! 수집 소스, 폴백 병합, 검증, 기술 지표, 종목 유니버스, 저장소.
//!
//! 이 crate는 다음을 제공합니다:
//! - [`DataSource`] 계약과 Yahoo / KRX Open API / 네이버 금융 구현
//! - 1차/2차 지표 병합 ([`merge_metrics`])
//! - 규칙 테이블 기반 지표 검증 ([`RuleTableValidator`])
//! - 히스토리 기반 기술 지표 계산 ([`StandardTechnicals`])
//! - TTL 캐시가 붙은 종목 유니버스 ([`UniverseCache`])
//! - JSON 파일 / PostgreSQL / 메모리 저장소와 fan-out

pub mod error;
pub mod merge;
pub mod source;
pub mod storage;
pub mod technicals;
pub mod universe;
pub mod validator;

pub use error::{DataError, Result};
pub use merge::{merge_metrics, needs_fallback, MergeOutcome};
pub use source::{
    krx::KrxApiSource, naver::NaverFinanceSource, yahoo::YahooSource, DataSource,
};
pub use storage::{
    fanout::FanOutStorage,
    json_file::{read_json_or_default, write_json_atomic, JsonFileStorage},
    memory::MemoryStorage,
    postgres::PostgresStorage,
    MetricsRow, PriceRow, SaveReport, Storage,
};
pub use technicals::{benchmark_ticker, StandardTechnicals, TechnicalsCalculator};
pub use universe::{
    KrxUniverseProvider, StaticUniverse, TickerUniverseProvider, UniverseCache,
    YahooScreenerUniverse,
};
pub use validator::{FieldChange, FieldRule, MetricsValidator, RulePolicy, RuleTableValidator};
