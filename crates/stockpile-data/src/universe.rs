//! 종목 유니버스 제공자와 TTL 캐시.
//!
//! - [`KrxUniverseProvider`]: KRX 정보데이터시스템 전종목 목록 (KOSPI/KOSDAQ)
//! - [`YahooScreenerUniverse`]: Yahoo 사전 정의 screener (US)
//! - [`StaticUniverse`]: 명시적 목록 또는 파일
//!
//! 조회 결과는 [`UniverseCache`]가 TTL 동안 보관합니다.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use stockpile_core::{CompanyRecord, Market, Ticker};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{DataError, Result};
use crate::source::{http_client, BROWSER_USER_AGENT};

/// 시장별 전체 종목 목록 제공자.
#[async_trait]
pub trait TickerUniverseProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, market: Market) -> Result<Vec<CompanyRecord>>;
}

// ==================== KRX ====================

const KRX_DATA_URL: &str = "http://data.krx.co.kr";

/// KRX 전종목 기본정보 (MDCSTAT01501).
pub struct KrxUniverseProvider {
    client: reqwest::Client,
    base_url: String,
}

impl Default for KrxUniverseProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl KrxUniverseProvider {
    pub fn new() -> Self {
        Self {
            client: http_client(Duration::from_secs(30), Some(BROWSER_USER_AGENT)),
            base_url: KRX_DATA_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn market_code(market: Market) -> Result<&'static str> {
        match market {
            Market::Kospi => Ok("STK"),
            Market::Kosdaq => Ok("KSQ"),
            Market::Us => Err(DataError::ConfigError(
                "KRX universe does not cover US".to_string(),
            )),
        }
    }
}

#[derive(Deserialize)]
struct KrxListingResponse {
    #[serde(rename = "OutBlock_1")]
    out_block: Option<Vec<KrxListing>>,
}

#[derive(Deserialize)]
struct KrxListing {
    #[serde(rename = "ISU_SRT_CD")]
    code: String,
    #[serde(rename = "ISU_ABBRV")]
    name: String,
    #[serde(rename = "SECT_TP_NM", default)]
    sector: Option<String>,
}

#[async_trait]
impl TickerUniverseProvider for KrxUniverseProvider {
    fn name(&self) -> &str {
        "krx_listing"
    }

    async fn fetch(&self, market: Market) -> Result<Vec<CompanyRecord>> {
        let market_code = Self::market_code(market)?;
        let params = [
            ("bld", "dbms/MDC/STAT/standard/MDCSTAT01501"),
            ("mktId", market_code),
            ("share", "1"),
            ("csvxls_is498No", "false"),
        ];

        let response = self
            .client
            .post(format!(
                "{}/comm/bldAttendant/getJsonData.cmd",
                self.base_url
            ))
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DataError::FetchError(format!(
                "KRX listing {}: HTTP {}",
                market, status
            )));
        }

        let data: KrxListingResponse = response.json().await?;
        let companies: Vec<CompanyRecord> = data
            .out_block
            .unwrap_or_default()
            .into_iter()
            .filter(|row| !row.code.trim().is_empty())
            .map(|row| CompanyRecord {
                ticker: Ticker::new(row.code, market),
                name: Some(row.name),
                sector: row.sector.filter(|s| !s.trim().is_empty()),
            })
            .collect();

        info!(market = %market, count = companies.len(), "KRX 종목 목록 조회 완료");
        Ok(companies)
    }
}

// ==================== Yahoo screener ====================

const YAHOO_QUERY_URL: &str = "https://query1.finance.yahoo.com";

/// 기본 screener 목록.
const DEFAULT_SCREENERS: [&str; 4] = [
    "most_actives",
    "undervalued_large_caps",
    "growth_technology_stocks",
    "aggressive_small_caps",
];

/// Yahoo 사전 정의 screener 기반 US 유니버스.
pub struct YahooScreenerUniverse {
    client: reqwest::Client,
    base_url: String,
    screeners: Vec<String>,
}

impl Default for YahooScreenerUniverse {
    fn default() -> Self {
        Self::new()
    }
}

impl YahooScreenerUniverse {
    pub fn new() -> Self {
        Self {
            client: http_client(Duration::from_secs(30), Some(BROWSER_USER_AGENT)),
            base_url: YAHOO_QUERY_URL.to_string(),
            screeners: DEFAULT_SCREENERS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_screeners(mut self, screeners: Vec<String>) -> Self {
        self.screeners = screeners;
        self
    }

    async fn fetch_screener(&self, screener_id: &str) -> Result<Vec<CompanyRecord>> {
        #[derive(Deserialize)]
        struct ScreenerResponse {
            finance: Option<FinanceResult>,
        }

        #[derive(Deserialize)]
        struct FinanceResult {
            result: Option<Vec<ScreenerResult>>,
        }

        #[derive(Deserialize)]
        struct ScreenerResult {
            quotes: Option<Vec<Quote>>,
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Quote {
            symbol: String,
            #[serde(default)]
            short_name: Option<String>,
            #[serde(default)]
            long_name: Option<String>,
            #[serde(default)]
            sector: Option<String>,
        }

        let response = self
            .client
            .get(format!("{}/v1/finance/screener/predefined/saved", self.base_url))
            .query(&[("scrIds", screener_id), ("count", "250")])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DataError::FetchError(format!(
                "Yahoo screener {}: HTTP {}",
                screener_id, status
            )));
        }

        let data: ScreenerResponse = response.json().await?;
        let companies = data
            .finance
            .and_then(|f| f.result)
            .and_then(|r| r.into_iter().next())
            .and_then(|r| r.quotes)
            .unwrap_or_default()
            .into_iter()
            // 접미사가 붙은 심볼은 해외 상장
            .filter(|q| !q.symbol.contains('.'))
            .map(|q| {
                let name = q.long_name.or(q.short_name);
                CompanyRecord {
                    ticker: Ticker::us(q.symbol),
                    name,
                    sector: q.sector,
                }
            })
            .collect();

        Ok(companies)
    }
}

#[async_trait]
impl TickerUniverseProvider for YahooScreenerUniverse {
    fn name(&self) -> &str {
        "yahoo_screener"
    }

    async fn fetch(&self, market: Market) -> Result<Vec<CompanyRecord>> {
        if market != Market::Us {
            return Err(DataError::ConfigError(format!(
                "Yahoo screener universe does not cover {}",
                market
            )));
        }

        let mut seen = HashSet::new();
        let mut companies = Vec::new();
        let mut failures = 0;

        for screener in &self.screeners {
            match self.fetch_screener(screener).await {
                Ok(found) => {
                    debug!(screener = %screener, count = found.len(), "screener 조회");
                    for company in found {
                        if seen.insert(company.ticker.clone()) {
                            companies.push(company);
                        }
                    }
                }
                Err(e) => {
                    warn!(screener = %screener, error = %e, "screener 조회 실패");
                    failures += 1;
                }
            }
        }

        if companies.is_empty() && failures > 0 {
            return Err(DataError::FetchError(format!(
                "all {} Yahoo screeners failed",
                failures
            )));
        }

        info!(count = companies.len(), "Yahoo screener 유니버스 조회 완료");
        Ok(companies)
    }
}

// ==================== Static ====================

/// 명시적 종목 목록.
#[derive(Debug, Clone, Default)]
pub struct StaticUniverse {
    companies: Vec<CompanyRecord>,
}

impl StaticUniverse {
    pub fn new(companies: Vec<CompanyRecord>) -> Self {
        Self { companies }
    }

    /// 심볼 목록으로 생성.
    pub fn from_symbols<S: AsRef<str>>(market: Market, symbols: &[S]) -> Self {
        let companies = symbols
            .iter()
            .map(|s| s.as_ref().trim())
            .filter(|s| !s.is_empty())
            .map(|s| CompanyRecord::new(Self::ticker(s, market)))
            .collect();
        Self { companies }
    }

    /// 파일에서 로드합니다.
    ///
    /// 한 줄에 `심볼[,이름[,섹터]]` 형식이며 `#`으로 시작하는 줄은 무시합니다.
    pub fn from_file(market: Market, path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(Self::parse(market, &content))
    }

    fn parse(market: Market, content: &str) -> Self {
        let companies = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| {
                let mut parts = line.splitn(3, ',').map(str::trim);
                let symbol = parts.next().unwrap_or_default();
                let name = parts.next().filter(|s| !s.is_empty()).map(String::from);
                let sector = parts.next().filter(|s| !s.is_empty()).map(String::from);
                CompanyRecord {
                    ticker: Self::ticker(symbol, market),
                    name,
                    sector,
                }
            })
            .collect();
        Self { companies }
    }

    fn ticker(symbol: &str, market: Market) -> Ticker {
        match market {
            Market::Us => Ticker::us(symbol),
            _ => Ticker::new(symbol, market),
        }
    }
}

#[async_trait]
impl TickerUniverseProvider for StaticUniverse {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch(&self, market: Market) -> Result<Vec<CompanyRecord>> {
        Ok(self
            .companies
            .iter()
            .filter(|c| c.ticker.market() == market)
            .cloned()
            .collect())
    }
}

// ==================== Cache ====================

struct CachedUniverse {
    fetched_at: Instant,
    companies: Arc<Vec<CompanyRecord>>,
}

/// 유니버스 TTL 캐시.
///
/// (제공자 이름, 시장) 단위로 보관하며 실패한 조회는 캐시하지 않습니다.
pub struct UniverseCache {
    ttl: Duration,
    entries: Mutex<HashMap<(String, Market), CachedUniverse>>,
}

impl UniverseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 캐시된 목록을 반환하고, 없거나 만료됐으면 제공자에서 다시 조회합니다.
    pub async fn get(
        &self,
        provider: &dyn TickerUniverseProvider,
        market: Market,
    ) -> Result<Arc<Vec<CompanyRecord>>> {
        let key = (provider.name().to_string(), market);

        {
            let entries = self.entries.lock().await;
            if let Some(cached) = entries.get(&key) {
                if cached.fetched_at.elapsed() < self.ttl {
                    debug!(provider = %key.0, market = %market, "유니버스 캐시 적중");
                    return Ok(Arc::clone(&cached.companies));
                }
            }
        }

        let companies = Arc::new(provider.fetch(market).await?);
        self.entries.lock().await.insert(
            key,
            CachedUniverse {
                fetched_at: Instant::now(),
                companies: Arc::clone(&companies),
            },
        );
        Ok(companies)
    }

    /// 시장 하나의 캐시를 비웁니다.
    pub async fn invalidate(&self, market: Market) {
        self.entries.lock().await.retain(|(_, m), _| *m != market);
    }

    pub async fn invalidate_all(&self) {
        self.entries.lock().await.clear();
    }
}
