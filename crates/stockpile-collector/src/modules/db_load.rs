//! JSON 결과를 다른 저장소(PostgreSQL)로 적재.

use stockpile_core::Market;
use stockpile_data::{JsonFileStorage, SaveReport, Storage};

use crate::error::Result;

/// 하루치 JSON 결과를 `target`에 upsert합니다.
pub async fn load_into(
    source: &JsonFileStorage,
    target: &dyn Storage,
    market: Market,
) -> Result<SaveReport> {
    let companies = source.load_companies(market).await?;
    let prices = source.load_prices(market).await?;
    let metrics = source.load_metrics(market).await?;

    if prices.is_empty() {
        tracing::warn!(
            market = %market,
            date = %source.date(),
            dir = %source.day_dir(market).display(),
            "적재할 가격 데이터 없음"
        );
    }

    let mut report = target.save_companies(market, &companies).await?;
    report.absorb(target.save_prices(market, &prices).await?);
    report.absorb(target.save_metrics(market, &metrics).await?);

    tracing::info!(
        market = %market,
        date = %source.date(),
        target = %target.name(),
        companies = companies.len(),
        prices = prices.len(),
        metrics = metrics.len(),
        skipped = report.skipped,
        errors = report.errors.len(),
        "DB 적재 완료"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use stockpile_core::{CompanyRecord, MetricsRecord, PriceRecord, Ticker};
    use stockpile_data::{MemoryStorage, MetricsRow, PriceRow};

    #[tokio::test]
    async fn test_load_into_memory() {
        let dir = std::env::temp_dir().join(format!("stockpile-dbload-{}", uuid::Uuid::new_v4()));
        let date = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        let json = JsonFileStorage::new(&dir).with_date(date);
        let ticker = Ticker::new("005930", Market::Kospi);

        json.save_companies(
            Market::Kospi,
            &[CompanyRecord::new(ticker.clone()).with_name("삼성전자")],
        )
        .await
        .unwrap();
        json.save_prices(
            Market::Kospi,
            &[PriceRow {
                ticker: ticker.clone(),
                price: PriceRecord {
                    date,
                    open: dec!(70000),
                    high: dec!(71000),
                    low: dec!(69500),
                    close: dec!(70500),
                    volume: 1_000_000,
                    change_pct: None,
                },
            }],
        )
        .await
        .unwrap();
        json.save_metrics(
            Market::Kospi,
            &[MetricsRow {
                ticker: ticker.clone(),
                date,
                metrics: Some(MetricsRecord {
                    per: Some(dec!(12.5)),
                    ..Default::default()
                }),
                technicals: None,
            }],
        )
        .await
        .unwrap();

        let memory = MemoryStorage::new();
        let report = load_into(&json, &memory, Market::Kospi).await.unwrap();

        assert_eq!(report.saved, 3);
        assert!(report.is_clean());
        assert_eq!(memory.prices(Market::Kospi)[0].price.close, dec!(70500));
        assert_eq!(
            memory.metrics(Market::Kospi)[0].metrics.as_ref().and_then(|m| m.per),
            Some(dec!(12.5))
        );

        let _ = std::fs::remove_dir_all(dir);
    }
}
