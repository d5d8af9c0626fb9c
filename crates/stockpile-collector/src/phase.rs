//! 수집 단계 상태 머신.
//!
//! ```text
//! INIT → PRICES → HISTORY → METRICS → TECHNICALS → SAVE → COMPLETE
//!   └──────┴────────┴─────────┴───────────┴─────────┴──→ FAILED
//! ```
//!
//! COMPLETE와 FAILED는 종료 상태이며 이후 전이는 허용되지 않습니다.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 수집 단계.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CollectionPhase {
    Init,
    Prices,
    History,
    Metrics,
    Technicals,
    Save,
    Complete,
    Failed,
}

impl CollectionPhase {
    /// 정상 진행 시 다음 단계.
    pub fn next(&self) -> Option<CollectionPhase> {
        match self {
            Self::Init => Some(Self::Prices),
            Self::Prices => Some(Self::History),
            Self::History => Some(Self::Metrics),
            Self::Metrics => Some(Self::Technicals),
            Self::Technicals => Some(Self::Save),
            Self::Save => Some(Self::Complete),
            Self::Complete | Self::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// 네트워크 호출이 일어나는 단계.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Prices | Self::History | Self::Metrics)
    }

    /// `to`로 전이 가능한지 여부.
    ///
    /// 종료 상태가 아니면 언제든 FAILED로 갈 수 있습니다.
    pub fn can_transition_to(&self, to: CollectionPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == Self::Failed || self.next() == Some(to)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Prices => "PRICES",
            Self::History => "HISTORY",
            Self::Metrics => "METRICS",
            Self::Technicals => "TECHNICALS",
            Self::Save => "SAVE",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for CollectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
