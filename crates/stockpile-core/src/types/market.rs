//! 시장 및 종목 식별자.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 수집 대상 시장.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Market {
    /// 미국 주식 (NYSE, NASDAQ 등)
    Us,
    /// 유가증권시장
    Kospi,
    /// 코스닥
    Kosdaq,
}

impl Market {
    /// 모든 시장.
    pub const ALL: [Market; 3] = [Market::Us, Market::Kospi, Market::Kosdaq];

    /// 대문자 시장 코드.
    pub fn as_str(&self) -> &'static str {
        match self {
            Market::Us => "US",
            Market::Kospi => "KOSPI",
            Market::Kosdaq => "KOSDAQ",
        }
    }

    /// 한국 시장 여부.
    pub fn is_korean(&self) -> bool {
        matches!(self, Market::Kospi | Market::Kosdaq)
    }

    /// 국가 코드 ("US" / "KR").
    pub fn region(&self) -> &'static str {
        if self.is_korean() {
            "KR"
        } else {
            "US"
        }
    }
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Market {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "US" => Ok(Market::Us),
            "KOSPI" | "STK" => Ok(Market::Kospi),
            "KOSDAQ" | "KSQ" => Ok(Market::Kosdaq),
            other => Err(format!("Unknown market: {}", other)),
        }
    }
}

/// 시장 내에서 종목을 유일하게 식별하는 티커.
///
/// 생성 후 변경되지 않습니다. 심볼 문자열은 시장별 형식을 그대로 유지합니다
/// (예: `AAPL`, `005930`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ticker {
    symbol: String,
    market: Market,
}

impl Ticker {
    /// 새 티커를 생성합니다. 앞뒤 공백은 제거됩니다.
    pub fn new(symbol: impl Into<String>, market: Market) -> Self {
        Self {
            symbol: symbol.into().trim().to_string(),
            market,
        }
    }

    /// 미국 주식 티커.
    pub fn us(symbol: impl Into<String>) -> Self {
        Self::new(symbol.into().to_uppercase(), Market::Us)
    }

    /// 심볼 문자열.
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// 소속 시장.
    pub fn market(&self) -> Market {
        self.market
    }
}

impl fmt::Display for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.market, self.symbol)
    }
}
