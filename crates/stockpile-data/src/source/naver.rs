//! 네이버 금융 스크래핑 소스.
//!
//! 국내(KR) 주식의 재무지표를 네이버 금융 종목 페이지(`/item/main.naver`)에서
//! 수집합니다. KRX Open API의 폴백 소스이며 재무지표만 제공합니다.
//!
//! ## 추출 항목
//! - `em#_per`, `em#_pbr`, `em#_eps`, `em#_dvr`: PER, PBR, EPS, 배당수익률
//! - `em#_market_sum`: 시가총액 (억원 단위 표기)
//! - "52주최고" 행: 52주 최고/최저
//! - 기업실적분석 표: ROE, 부채비율

use std::time::Duration;

use chrono::{FixedOffset, NaiveDate, Utc};
use rust_decimal::Decimal;
use scraper::{Html, Selector};
use stockpile_core::{FetchError, MetricsRecord, Ticker};

use super::{from_reqwest, http_client, status_to_error, DataSource, BROWSER_USER_AGENT};

const DEFAULT_BASE_URL: &str = "https://finance.naver.com";

/// 네이버 금융 데이터 소스.
pub struct NaverFinanceSource {
    client: reqwest::Client,
    base_url: String,
}

impl Default for NaverFinanceSource {
    fn default() -> Self {
        Self::new()
    }
}

impl NaverFinanceSource {
    pub fn new() -> Self {
        Self {
            client: http_client(Duration::from_secs(30), Some(BROWSER_USER_AGENT)),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait::async_trait]
impl DataSource for NaverFinanceSource {
    fn name(&self) -> &str {
        "naver"
    }

    fn max_concurrency(&self) -> usize {
        2
    }

    async fn metrics(&self, ticker: &Ticker) -> Result<MetricsRecord, FetchError> {
        let url = format!("{}/item/main.naver", self.base_url);
        let context = format!("Naver Finance [{}]", ticker.symbol());

        let response = self
            .client
            .get(&url)
            .query(&[("code", ticker.symbol())])
            .send()
            .await
            .map_err(|e| from_reqwest(e, &context))?;

        if let Some(err) = status_to_error(response.status(), &context) {
            return Err(err);
        }

        let html = response.text().await.map_err(|e| from_reqwest(e, &context))?;
        let mut metrics = parse_item_page(&html);
        if metrics.is_empty() {
            return Err(FetchError::NotFound(format!("{}: 데이터 없음", context)));
        }
        metrics.as_of = Some(today_kst());

        tracing::debug!(
            ticker = %ticker,
            per = ?metrics.per,
            pbr = ?metrics.pbr,
            roe = ?metrics.roe,
            "네이버 금융 지표 수집 완료"
        );
        Ok(metrics)
    }
}

fn today_kst() -> NaiveDate {
    match FixedOffset::east_opt(9 * 3600) {
        Some(offset) => Utc::now().with_timezone(&offset).date_naive(),
        None => Utc::now().date_naive(),
    }
}

/// 종목 main 페이지 HTML에서 재무지표 추출.
pub fn parse_item_page(html: &str) -> MetricsRecord {
    let document = Html::parse_document(html);
    let (week_52_high, week_52_low) = extract_52week_high_low(&document);

    MetricsRecord {
        per: extract_value_by_id(&document, "_per"),
        pbr: extract_value_by_id(&document, "_pbr"),
        eps: extract_value_by_id(&document, "_eps"),
        dividend_yield: extract_value_by_id(&document, "_dvr"),
        market_cap: extract_market_cap(&document),
        roe: extract_row_value(&document, "ROE"),
        debt_to_equity: extract_row_value(&document, "부채비율"),
        week_52_high,
        week_52_low,
        ..Default::default()
    }
}

/// `<em id="...">` 값 추출.
fn extract_value_by_id(document: &Html, id: &str) -> Option<Decimal> {
    let selector = Selector::parse(&format!("em#{}", id)).ok()?;
    document
        .select(&selector)
        .next()
        .and_then(|el| parse_decimal_value(&el.text().collect::<String>()))
}

fn extract_market_cap(document: &Html) -> Option<Decimal> {
    let selector = Selector::parse("em#_market_sum").ok()?;
    document
        .select(&selector)
        .next()
        .and_then(|el| parse_market_sum(&el.text().collect::<String>()))
}

/// 52주 최고/최저.
///
/// HTML 구조: `<th>52주최고|최저</th><td><em>169,400</em><span>|</span><em>52,500</em></td>`
fn extract_52week_high_low(document: &Html) -> (Option<Decimal>, Option<Decimal>) {
    let (Ok(tr_selector), Ok(em_selector)) = (Selector::parse("tr"), Selector::parse("em")) else {
        return (None, None);
    };

    for tr in document.select(&tr_selector) {
        let text = tr.text().collect::<String>();
        if text.contains("52주최고") || text.contains("52주 최고") {
            let ems: Vec<_> = tr.select(&em_selector).collect();
            let value = |i: usize| {
                ems.get(i)
                    .and_then(|em| parse_decimal_value(&em.text().collect::<String>()))
            };
            return (value(0), value(1));
        }
    }
    (None, None)
}

/// 기업실적분석 표의 한 행 값.
///
/// 앞의 세 칸은 최근 연간 실적(과거 → 최신)이므로 그중 마지막 값을 씁니다.
/// "동일업종" 비교 행은 제외합니다.
fn extract_row_value(document: &Html, label: &str) -> Option<Decimal> {
    let tr_selector = Selector::parse("tr").ok()?;
    let td_selector = Selector::parse("td").ok()?;

    document
        .select(&tr_selector)
        .filter(|tr| {
            let text = tr.text().collect::<String>();
            text.contains(label) && !text.contains("동일업종")
        })
        .find_map(|tr| {
            tr.select(&td_selector)
                .take(3)
                .filter_map(|td| parse_decimal_value(td.text().collect::<String>().trim()))
                .last()
        })
}

/// 숫자, 소수점, 음수 부호만 남기고 파싱. 빈 값과 "-"는 `None`.
fn parse_decimal_value(text: &str) -> Option<Decimal> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();

    if cleaned.is_empty() || cleaned == "-" {
        return None;
    }
    cleaned.parse().ok()
}

/// 시가총액 표기 파싱 (원 단위로 변환).
///
/// 네이버는 억원 단위로 표기합니다: "1,234" → 1234억, "452조 1,234" → 452조 1234억.
fn parse_market_sum(text: &str) -> Option<Decimal> {
    let digits = |s: &str| -> Option<Decimal> {
        let cleaned: String = s.chars().filter(|c| c.is_ascii_digit() || *c == '.').collect();
        if cleaned.is_empty() {
            None
        } else {
            cleaned.parse().ok()
        }
    };
    let jo = Decimal::from(1_000_000_000_000i64);
    let eok = Decimal::from(100_000_000i64);

    match text.split_once('조') {
        Some((trillions, rest)) => {
            let trillions = digits(trillions)?;
            let rest = digits(rest).unwrap_or(Decimal::ZERO);
            Some(trillions * jo + rest * eok)
        }
        None => digits(text).map(|v| v * eok),
    }
}
