//! KRX Open API 소스.
//!
//! 한국거래소(KRX) Open API의 전종목 일별 스냅샷으로 가격과 가치지표를
//! 제공합니다. 종목별 요청 대신 (시장, 기준일)마다 한 번만 조회해
//! 캐시하고, 휴장일이면 최대 7일 전까지 거슬러 올라갑니다.
//!
//! 히스토리는 제공하지 않습니다.
//!
//! # 인증
//!
//! `AUTH_KEY`는 HTTP 헤더로 전달합니다. 키는 환경변수 `KRX_API_KEY`에서
//! 읽습니다.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, FixedOffset, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use stockpile_core::{FetchError, Market, MetricsRecord, PriceRecord, Ticker};
use tokio::sync::Mutex;

use super::{from_reqwest, http_client, status_to_error, DataSource};

const DEFAULT_BASE_URL: &str = "https://data-dbg.krx.co.kr";

/// 휴장일 대비 기준일 탐색 범위.
const MAX_LOOKBACK_DAYS: i64 = 7;

/// API 응답 래퍼.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    #[serde(rename = "OutBlock_1")]
    out_block: Option<Vec<T>>,
}

/// 일별 매매정보 (전종목).
#[derive(Debug, Deserialize)]
struct RawDailyTrade {
    #[serde(rename = "BAS_DD")]
    date: String,
    #[serde(rename = "ISU_CD")]
    code: String,
    #[serde(rename = "TDD_CLSPRC")]
    close: String,
    #[serde(rename = "FLUC_RT", default)]
    change_rate: Option<String>,
    #[serde(rename = "TDD_OPNPRC", default)]
    open: Option<String>,
    #[serde(rename = "TDD_HGPRC", default)]
    high: Option<String>,
    #[serde(rename = "TDD_LWPRC", default)]
    low: Option<String>,
    #[serde(rename = "ACC_TRDVOL")]
    volume: String,
    #[serde(rename = "MKTCAP", default)]
    market_cap: Option<String>,
}

/// 가치지표 (PER/PBR/배당수익률).
#[derive(Debug, Deserialize)]
struct RawValuation {
    #[serde(rename = "ISU_SRT_CD")]
    ticker: String,
    #[serde(rename = "PER", default)]
    per: Option<String>,
    #[serde(rename = "PBR", default)]
    pbr: Option<String>,
    #[serde(rename = "DVD_YLD", default)]
    dividend_yield: Option<String>,
    #[serde(rename = "EPS", default)]
    eps: Option<String>,
    #[serde(rename = "BPS", default)]
    bps: Option<String>,
}

/// 일별 매매 스냅샷 한 행.
#[derive(Debug, Clone)]
struct TradeRow {
    price: PriceRecord,
    market_cap: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SnapshotKind {
    Trades,
    Valuation,
}

/// (시장, 종류)별 전종목 스냅샷.
#[derive(Debug, Default)]
struct Snapshot {
    base_date: Option<NaiveDate>,
    trades: HashMap<String, TradeRow>,
    valuations: HashMap<String, MetricsRecord>,
}

/// KRX Open API 데이터 소스.
pub struct KrxApiSource {
    client: reqwest::Client,
    auth_key: String,
    base_url: String,
    snapshots: Mutex<HashMap<(Market, SnapshotKind), Arc<Snapshot>>>,
    /// 고정 기준일 (테스트/재처리용)
    base_date: Option<NaiveDate>,
}

impl KrxApiSource {
    pub fn new(auth_key: impl Into<String>) -> Self {
        Self {
            client: http_client(Duration::from_secs(30), None),
            auth_key: auth_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            snapshots: Mutex::new(HashMap::new()),
            base_date: None,
        }
    }

    /// 환경변수 `KRX_API_KEY`에서 인증키를 읽어 생성.
    pub fn from_env() -> Option<Self> {
        std::env::var("KRX_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(Self::new)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_base_date(mut self, date: NaiveDate) -> Self {
        self.base_date = Some(date);
        self
    }

    fn api_id(market: Market, kind: SnapshotKind) -> Result<&'static str, FetchError> {
        match (market, kind) {
            (Market::Kospi, SnapshotKind::Trades) => Ok("stk_bydd_trd"),
            (Market::Kosdaq, SnapshotKind::Trades) => Ok("ksq_bydd_trd"),
            (Market::Kospi, SnapshotKind::Valuation) => Ok("stk_isu_per_pbr"),
            (Market::Kosdaq, SnapshotKind::Valuation) => Ok("ksq_isu_per_pbr"),
            (Market::Us, _) => Err(FetchError::unsupported("krx", "US market")),
        }
    }

    /// API 요청 실행.
    async fn request<T: for<'de> Deserialize<'de>>(
        &self,
        api_id: &str,
        base_date: NaiveDate,
    ) -> Result<Vec<T>, FetchError> {
        let url = format!("{}/svc/sample/apis/stk/{}", self.base_url, api_id);
        let bas_dd = base_date.format("%Y%m%d").to_string();
        let context = format!("KRX API [{}]", api_id);

        tracing::debug!(api_id = api_id, base_date = %bas_dd, "KRX API 요청");

        let response = self
            .client
            .get(&url)
            .query(&[("basDd", bas_dd.as_str())])
            .header("AUTH_KEY", &self.auth_key)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| from_reqwest(e, &context))?;

        if let Some(err) = status_to_error(response.status(), &context) {
            return Err(err);
        }

        let data: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| from_reqwest(e, &context))?;
        Ok(data.out_block.unwrap_or_default())
    }

    /// 스냅샷 조회 (캐시 우선).
    ///
    /// lock을 잡은 채로 조회하므로 같은 스냅샷을 동시에 두 번 받지 않습니다.
    /// 실패한 조회는 캐시하지 않습니다.
    async fn snapshot(
        &self,
        market: Market,
        kind: SnapshotKind,
    ) -> Result<Arc<Snapshot>, FetchError> {
        let api_id = Self::api_id(market, kind)?;
        let mut cache = self.snapshots.lock().await;
        if let Some(snapshot) = cache.get(&(market, kind)) {
            return Ok(Arc::clone(snapshot));
        }

        let start = self.base_date.unwrap_or_else(today_kst);
        for back in 0..MAX_LOOKBACK_DAYS {
            let date = start - ChronoDuration::days(back);
            let snapshot = match kind {
                SnapshotKind::Trades => {
                    let rows: Vec<RawDailyTrade> = self.request(api_id, date).await?;
                    Snapshot {
                        base_date: Some(date),
                        trades: rows.into_iter().filter_map(parse_trade_row).collect(),
                        ..Default::default()
                    }
                }
                SnapshotKind::Valuation => {
                    let rows: Vec<RawValuation> = self.request(api_id, date).await?;
                    Snapshot {
                        base_date: Some(date),
                        valuations: rows
                            .into_iter()
                            .map(|v| parse_valuation_row(v, date))
                            .collect(),
                        ..Default::default()
                    }
                }
            };

            if snapshot.trades.is_empty() && snapshot.valuations.is_empty() {
                tracing::debug!(api_id = api_id, date = %date, "KRX 데이터 없음 (휴장일), 전일 조회");
                continue;
            }

            tracing::info!(
                market = %market,
                api_id = api_id,
                base_date = %date,
                count = snapshot.trades.len() + snapshot.valuations.len(),
                "KRX 스냅샷 조회 완료"
            );
            let snapshot = Arc::new(snapshot);
            cache.insert((market, kind), Arc::clone(&snapshot));
            return Ok(snapshot);
        }

        Err(FetchError::NotFound(format!(
            "KRX {} 최근 {}일 데이터 없음",
            api_id, MAX_LOOKBACK_DAYS
        )))
    }

    /// 캐시된 스냅샷 제거 (다음 조회 시 새로 받음).
    pub async fn clear_cache(&self) {
        self.snapshots.lock().await.clear();
    }
}

#[async_trait::async_trait]
impl DataSource for KrxApiSource {
    fn name(&self) -> &str {
        "krx"
    }

    fn max_concurrency(&self) -> usize {
        16
    }

    async fn price(&self, ticker: &Ticker) -> Result<PriceRecord, FetchError> {
        let snapshot = self.snapshot(ticker.market(), SnapshotKind::Trades).await?;
        snapshot
            .trades
            .get(ticker.symbol())
            .map(|row| row.price.clone())
            .ok_or_else(|| FetchError::NotFound(format!("KRX 매매정보 없음: {}", ticker)))
    }

    /// 가치지표 + 매매 스냅샷의 시가총액.
    async fn metrics(&self, ticker: &Ticker) -> Result<MetricsRecord, FetchError> {
        let valuation = self.snapshot(ticker.market(), SnapshotKind::Valuation).await?;
        let mut metrics = valuation
            .valuations
            .get(ticker.symbol())
            .cloned()
            .ok_or_else(|| FetchError::NotFound(format!("KRX 가치지표 없음: {}", ticker)))?;

        if metrics.market_cap.is_none() {
            // 시가총액은 보조 정보라 매매 스냅샷 실패는 무시
            if let Ok(trades) = self.snapshot(ticker.market(), SnapshotKind::Trades).await {
                metrics.market_cap = trades.trades.get(ticker.symbol()).and_then(|r| r.market_cap);
            }
        }
        Ok(metrics)
    }
}

/// 한국 시간 기준 오늘.
fn today_kst() -> NaiveDate {
    let kst = FixedOffset::east_opt(9 * 3600);
    match kst {
        Some(offset) => Utc::now().with_timezone(&offset).date_naive(),
        None => Utc::now().date_naive(),
    }
}

/// 표준코드(KR7005930003)면 단축코드(005930)로 변환.
fn short_code(code: &str) -> String {
    let code = code.trim();
    if code.len() == 12 && code.starts_with("KR") && code.is_ascii() {
        code[3..9].to_string()
    } else {
        code.to_string()
    }
}

fn parse_trade_row(t: RawDailyTrade) -> Option<(String, TradeRow)> {
    let date = parse_date_yyyymmdd(&t.date)?;
    let close = parse_decimal(&t.close)?;
    let volume = t.volume.replace(',', "").parse().ok()?;
    let price = PriceRecord {
        date,
        open: parse_decimal_opt(&t.open).unwrap_or(close),
        high: parse_decimal_opt(&t.high).unwrap_or(close),
        low: parse_decimal_opt(&t.low).unwrap_or(close),
        close,
        volume,
        change_pct: parse_decimal_opt(&t.change_rate),
    };
    Some((
        short_code(&t.code),
        TradeRow {
            price,
            market_cap: parse_decimal_opt(&t.market_cap),
        },
    ))
}

fn parse_valuation_row(v: RawValuation, date: NaiveDate) -> (String, MetricsRecord) {
    let metrics = MetricsRecord {
        per: parse_decimal_opt(&v.per),
        pbr: parse_decimal_opt(&v.pbr),
        dividend_yield: parse_decimal_opt(&v.dividend_yield),
        eps: parse_decimal_opt(&v.eps),
        bps: parse_decimal_opt(&v.bps),
        as_of: Some(date),
        ..Default::default()
    };
    (short_code(&v.ticker), metrics)
}

fn parse_decimal(s: &str) -> Option<Decimal> {
    let cleaned = s.trim().replace([',', '%'], "");
    if cleaned.is_empty() || cleaned == "-" {
        return None;
    }
    cleaned.parse().ok()
}

/// 쉼표/퍼센트 기호를 제거하고 파싱. 빈 값과 "-"는 `None`.
fn parse_decimal_opt(s: &Option<String>) -> Option<Decimal> {
    s.as_deref().and_then(parse_decimal)
}

/// YYYYMMDD 형식의 날짜 문자열을 NaiveDate로 파싱.
fn parse_date_yyyymmdd(s: &str) -> Option<NaiveDate> {
    // YYYY/MM/DD 형식도 지원
    if s.contains('/') {
        NaiveDate::parse_from_str(s, "%Y/%m/%d").ok()
    } else {
        NaiveDate::parse_from_str(s, "%Y%m%d").ok()
    }
}
