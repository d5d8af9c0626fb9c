//! 수집 파이프라인 전반에서 사용되는 공통 타입.

mod market;
mod metrics;
mod records;

pub use market::*;
pub use metrics::*;
pub use records::*;
