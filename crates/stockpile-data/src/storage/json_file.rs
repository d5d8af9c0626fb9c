//! JSON 파일 저장소.
//!
//! 디렉토리 구조:
//!
//! ```text
//! {data_dir}/{market}/company_ids.json
//! {data_dir}/{market}/{date}/companies.json
//! {data_dir}/{market}/{date}/prices.json
//! {data_dir}/{market}/{date}/metrics.json
//! ```
//!
//! 기존 파일과 심볼 기준으로 병합한 뒤 임시 파일에 쓰고 rename 합니다.
//! 재개(resume) 실행은 같은 날짜 파일에 이어서 기록됩니다.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Serialize;
use stockpile_core::{CompanyRecord, Market};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{split_by_market, MetricsRow, PriceRow, SaveReport, Storage};
use crate::error::Result;

const COMPANIES_FILE: &str = "companies.json";
const PRICES_FILE: &str = "prices.json";
const METRICS_FILE: &str = "metrics.json";
const COMPANY_IDS_FILE: &str = "company_ids.json";

/// JSON 파일 저장소.
pub struct JsonFileStorage {
    data_dir: PathBuf,
    date: NaiveDate,
    write_lock: Mutex<()>,
}

impl JsonFileStorage {
    /// 오늘 날짜 기준 저장소.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            date: chrono::Local::now().date_naive(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = date;
        self
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn market_dir(&self, market: Market) -> PathBuf {
        self.data_dir.join(market.as_str().to_lowercase())
    }

    /// 실행일 디렉토리.
    pub fn day_dir(&self, market: Market) -> PathBuf {
        self.market_dir(market)
            .join(self.date.format("%Y-%m-%d").to_string())
    }

    pub async fn load_companies(&self, market: Market) -> Result<Vec<CompanyRecord>> {
        read_json_or_default(&self.day_dir(market).join(COMPANIES_FILE)).await
    }

    pub async fn load_prices(&self, market: Market) -> Result<Vec<PriceRow>> {
        read_json_or_default(&self.day_dir(market).join(PRICES_FILE)).await
    }

    pub async fn load_metrics(&self, market: Market) -> Result<Vec<MetricsRow>> {
        read_json_or_default(&self.day_dir(market).join(METRICS_FILE)).await
    }

    /// 기존 파일과 심볼 기준으로 병합해 저장합니다. 새 값이 이깁니다.
    async fn upsert<T>(
        &self,
        path: PathBuf,
        rows: Vec<&T>,
        key_of: impl Fn(&T) -> String,
    ) -> Result<usize>
    where
        T: Serialize + DeserializeOwned + Clone,
    {
        let existing: Vec<T> = read_json_or_default(&path).await?;
        let mut merged: BTreeMap<String, T> =
            existing.into_iter().map(|row| (key_of(&row), row)).collect();
        for row in &rows {
            merged.insert(key_of(row), (*row).clone());
        }

        let values: Vec<T> = merged.into_values().collect();
        write_json_atomic(&path, &values).await?;
        debug!(path = %path.display(), written = rows.len(), total = values.len(), "JSON 저장");
        Ok(rows.len())
    }
}

#[async_trait]
impl Storage for JsonFileStorage {
    fn name(&self) -> &str {
        "json"
    }

    async fn save_companies(
        &self,
        market: Market,
        companies: &[CompanyRecord],
    ) -> Result<SaveReport> {
        let _guard = self.write_lock.lock().await;
        let (rows, skipped) = split_by_market(market, companies, |c| &c.ticker);

        let ids_path = self.market_dir(market).join(COMPANY_IDS_FILE);
        let mut ids: BTreeMap<String, Uuid> = read_json_or_default(&ids_path).await?;
        let before = ids.len();
        for company in &rows {
            ids.entry(company.ticker.symbol().to_string())
                .or_insert_with(Uuid::new_v4);
        }
        if ids.len() != before {
            write_json_atomic(&ids_path, &ids).await?;
        }

        let saved = self
            .upsert(self.day_dir(market).join(COMPANIES_FILE), rows, |c: &CompanyRecord| {
                c.ticker.symbol().to_string()
            })
            .await?;

        Ok(SaveReport {
            saved,
            skipped,
            errors: Vec::new(),
        })
    }

    async fn save_prices(&self, market: Market, rows: &[PriceRow]) -> Result<SaveReport> {
        let _guard = self.write_lock.lock().await;
        let (rows, skipped) = split_by_market(market, rows, |r| &r.ticker);
        let saved = self
            .upsert(self.day_dir(market).join(PRICES_FILE), rows, |r: &PriceRow| {
                r.ticker.symbol().to_string()
            })
            .await?;

        Ok(SaveReport {
            saved,
            skipped,
            errors: Vec::new(),
        })
    }

    async fn save_metrics(&self, market: Market, rows: &[MetricsRow]) -> Result<SaveReport> {
        let _guard = self.write_lock.lock().await;
        let (rows, skipped) = split_by_market(market, rows, |r| &r.ticker);
        let saved = self
            .upsert(self.day_dir(market).join(METRICS_FILE), rows, |r: &MetricsRow| {
                r.ticker.symbol().to_string()
            })
            .await?;

        Ok(SaveReport {
            saved,
            skipped,
            errors: Vec::new(),
        })
    }

    async fn load_completed_tickers(&self, market: Market) -> Result<HashSet<String>> {
        Ok(self
            .load_prices(market)
            .await?
            .into_iter()
            .map(|row| row.ticker.symbol().to_string())
            .collect())
    }

    async fn company_id_mapping(&self, market: Market) -> Result<HashMap<String, Uuid>> {
        let ids: BTreeMap<String, Uuid> =
            read_json_or_default(&self.market_dir(market).join(COMPANY_IDS_FILE)).await?;
        Ok(ids.into_iter().collect())
    }
}

/// JSON을 임시 파일에 쓴 뒤 rename 합니다.
///
/// 같은 파일시스템 안의 rename이므로 읽는 쪽은 이전 파일 또는 새 파일 중
/// 하나만 봅니다.
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let content = serde_json::to_vec_pretty(value)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// JSON 파일을 읽습니다. 파일이 없으면 기본값.
pub async fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use stockpile_core::{PriceRecord, Ticker};

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("stockpile-json-{}", Uuid::new_v4()))
    }

    fn price_row(symbol: &str, close: rust_decimal::Decimal) -> PriceRow {
        PriceRow {
            ticker: Ticker::us(symbol),
            price: PriceRecord {
                date: NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
                open: close,
                high: close,
                low: close,
                close,
                volume: 1_000,
                change_pct: None,
            },
        }
    }

    #[tokio::test]
    async fn test_prices_upsert_and_completed_tickers() {
        let dir = temp_dir();
        let storage = JsonFileStorage::new(&dir)
            .with_date(NaiveDate::from_ymd_opt(2024, 6, 3).unwrap());

        storage
            .save_prices(Market::Us, &[price_row("AAPL", dec!(190)), price_row("MSFT", dec!(420))])
            .await
            .unwrap();
        let report = storage
            .save_prices(Market::Us, &[price_row("AAPL", dec!(191))])
            .await
            .unwrap();
        assert_eq!(report.saved, 1);

        let prices = storage.load_prices(Market::Us).await.unwrap();
        assert_eq!(prices.len(), 2);
        assert_eq!(prices[0].price.close, dec!(191));

        let completed = storage.load_completed_tickers(Market::Us).await.unwrap();
        assert!(completed.contains("AAPL") && completed.contains("MSFT"));

        assert!(dir.join("us").join("2024-06-03").join("prices.json").exists());
        assert!(!dir.join("us").join("2024-06-03").join("prices.json.tmp").exists());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_company_ids_are_stable() {
        let dir = temp_dir();
        let storage = JsonFileStorage::new(&dir);
        let companies = vec![CompanyRecord::new(Ticker::new("005930", Market::Kospi))
            .with_name("삼성전자")];

        storage.save_companies(Market::Kospi, &companies).await.unwrap();
        let first = storage.company_id_mapping(Market::Kospi).await.unwrap();
        storage.save_companies(Market::Kospi, &companies).await.unwrap();
        let second = storage.company_id_mapping(Market::Kospi).await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(first, second);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_other_market_rows_skipped() {
        let dir = temp_dir();
        let storage = JsonFileStorage::new(&dir);

        let report = storage
            .save_prices(Market::Kospi, &[price_row("AAPL", dec!(190))])
            .await
            .unwrap();

        assert_eq!(report.saved, 0);
        assert_eq!(report.skipped, 1);

        let _ = std::fs::remove_dir_all(dir);
    }
}
