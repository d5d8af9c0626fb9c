//! PostgreSQL 저장소.
//!
//! `companies`, `daily_prices`, `daily_metrics` 세 테이블에 upsert 합니다.
//! 지표 컬럼은 `COALESCE(EXCLUDED.col, table.col)`로 갱신하므로 이번 수집에서
//! 비어 있는 값이 이전 값을 지우지 않습니다.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::{PgPool, PgPoolOptions};
use stockpile_core::{CompanyRecord, Market, MetricField};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{
    split_by_market, technical_values, MetricsRow, PriceRow, SaveReport, Storage,
    TECHNICAL_COLUMNS,
};
use crate::error::{DataError, Result};

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS companies (
        id          UUID PRIMARY KEY,
        market      TEXT NOT NULL,
        symbol      TEXT NOT NULL,
        name        TEXT,
        sector      TEXT,
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (market, symbol)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS daily_prices (
        company_id   UUID NOT NULL REFERENCES companies(id),
        date         DATE NOT NULL,
        open         NUMERIC NOT NULL,
        high         NUMERIC NOT NULL,
        low          NUMERIC NOT NULL,
        close        NUMERIC NOT NULL,
        volume       BIGINT NOT NULL,
        change_pct   NUMERIC,
        collected_on DATE NOT NULL,
        PRIMARY KEY (company_id, date)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS daily_metrics (
        company_id        UUID NOT NULL REFERENCES companies(id),
        date              DATE NOT NULL,
        per               NUMERIC,
        pbr               NUMERIC,
        psr               NUMERIC,
        roe               NUMERIC,
        roa               NUMERIC,
        debt_to_equity    NUMERIC,
        dividend_yield    NUMERIC,
        eps               NUMERIC,
        bps               NUMERIC,
        market_cap        NUMERIC,
        week_52_high      NUMERIC,
        week_52_low       NUMERIC,
        rsi_14            DOUBLE PRECISION,
        mfi_14            DOUBLE PRECISION,
        macd              DOUBLE PRECISION,
        macd_signal       DOUBLE PRECISION,
        macd_histogram    DOUBLE PRECISION,
        bb_upper          DOUBLE PRECISION,
        bb_middle         DOUBLE PRECISION,
        bb_lower          DOUBLE PRECISION,
        bb_percent_b      DOUBLE PRECISION,
        volume_change_pct DOUBLE PRECISION,
        beta              DOUBLE PRECISION,
        sma_20            DOUBLE PRECISION,
        sma_50            DOUBLE PRECISION,
        sma_200           DOUBLE PRECISION,
        PRIMARY KEY (company_id, date)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_daily_prices_collected
        ON daily_prices (collected_on)
    "#,
];

/// PostgreSQL 저장소.
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
    run_date: NaiveDate,
}

impl PostgresStorage {
    /// 연결 풀을 만듭니다.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await
            .map_err(|e| DataError::ConnectionError(e.to_string()))?;

        info!("Database connection established");
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            run_date: chrono::Local::now().date_naive(),
        }
    }

    pub fn with_run_date(mut self, run_date: NaiveDate) -> Self {
        self.run_date = run_date;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 테이블이 없으면 생성합니다.
    pub async fn migrate(&self) -> Result<()> {
        info!("Running database migrations...");
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| DataError::MigrationError(e.to_string()))?;
        }
        info!("Migrations completed successfully");
        Ok(())
    }

    fn metrics_upsert_sql() -> String {
        let metric_columns: Vec<&str> = MetricField::ALL.iter().map(|f| f.as_str()).collect();
        let columns: Vec<&str> = metric_columns
            .iter()
            .copied()
            .chain(TECHNICAL_COLUMNS)
            .collect();

        // $1 market, $2 symbol, $3 date, $4.. 값
        let placeholders: Vec<String> = (0..columns.len()).map(|i| format!("${}", i + 4)).collect();
        let updates: Vec<String> = columns
            .iter()
            .map(|c| format!("{c} = COALESCE(EXCLUDED.{c}, daily_metrics.{c})"))
            .collect();

        format!(
            "INSERT INTO daily_metrics (company_id, date, {columns})
             SELECT id, $3, {placeholders} FROM companies WHERE market = $1 AND symbol = $2
             ON CONFLICT (company_id, date) DO UPDATE SET {updates}",
            columns = columns.join(", "),
            placeholders = placeholders.join(", "),
            updates = updates.join(", "),
        )
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    fn name(&self) -> &str {
        "postgres"
    }

    #[instrument(skip(self, companies), fields(count = companies.len()))]
    async fn save_companies(
        &self,
        market: Market,
        companies: &[CompanyRecord],
    ) -> Result<SaveReport> {
        let (rows, skipped) = split_by_market(market, companies, |c| &c.ticker);
        let mut report = SaveReport {
            skipped,
            ..Default::default()
        };

        for company in rows {
            let result = sqlx::query(
                r#"
                INSERT INTO companies (id, market, symbol, name, sector)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (market, symbol) DO UPDATE SET
                    name = COALESCE(EXCLUDED.name, companies.name),
                    sector = COALESCE(EXCLUDED.sector, companies.sector),
                    updated_at = NOW()
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(market.as_str())
            .bind(company.ticker.symbol())
            .bind(company.name.as_deref())
            .bind(company.sector.as_deref())
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => report.saved += 1,
                Err(e) => {
                    warn!(ticker = %company.ticker, error = %e, "종목 저장 실패");
                    report.errors.push(format!("{}: {}", company.ticker, e));
                }
            }
        }

        debug!(saved = report.saved, "종목 저장 완료");
        Ok(report)
    }

    #[instrument(skip(self, rows), fields(count = rows.len()))]
    async fn save_prices(&self, market: Market, rows: &[PriceRow]) -> Result<SaveReport> {
        let (rows, skipped) = split_by_market(market, rows, |r| &r.ticker);
        let mut report = SaveReport {
            skipped,
            ..Default::default()
        };

        for row in rows {
            let price = &row.price;
            let result = sqlx::query(
                r#"
                INSERT INTO daily_prices
                    (company_id, date, open, high, low, close, volume, change_pct, collected_on)
                SELECT id, $3, $4, $5, $6, $7, $8, $9, $10
                FROM companies WHERE market = $1 AND symbol = $2
                ON CONFLICT (company_id, date) DO UPDATE SET
                    open = EXCLUDED.open,
                    high = EXCLUDED.high,
                    low = EXCLUDED.low,
                    close = EXCLUDED.close,
                    volume = EXCLUDED.volume,
                    change_pct = COALESCE(EXCLUDED.change_pct, daily_prices.change_pct),
                    collected_on = EXCLUDED.collected_on
                "#,
            )
            .bind(market.as_str())
            .bind(row.ticker.symbol())
            .bind(price.date)
            .bind(price.open)
            .bind(price.high)
            .bind(price.low)
            .bind(price.close)
            .bind(price.volume)
            .bind(price.change_pct)
            .bind(self.run_date)
            .execute(&self.pool)
            .await;

            match result {
                // 종목 행이 없으면 아무것도 삽입되지 않음
                Ok(done) if done.rows_affected() == 0 => report.skipped += 1,
                Ok(_) => report.saved += 1,
                Err(e) => {
                    warn!(ticker = %row.ticker, error = %e, "가격 저장 실패");
                    report.errors.push(format!("{}: {}", row.ticker, e));
                }
            }
        }

        Ok(report)
    }

    #[instrument(skip(self, rows), fields(count = rows.len()))]
    async fn save_metrics(&self, market: Market, rows: &[MetricsRow]) -> Result<SaveReport> {
        let (rows, skipped) = split_by_market(market, rows, |r| &r.ticker);
        let mut report = SaveReport {
            skipped,
            ..Default::default()
        };
        let sql = Self::metrics_upsert_sql();

        for row in rows {
            let mut query = sqlx::query(&sql)
                .bind(market.as_str())
                .bind(row.ticker.symbol())
                .bind(row.date);

            let metrics = row.metrics.clone().unwrap_or_default();
            for field in MetricField::ALL {
                query = query.bind(field.get(&metrics));
            }
            let technicals = row.technicals.clone().unwrap_or_default();
            for value in technical_values(&technicals) {
                query = query.bind(value);
            }

            match query.execute(&self.pool).await {
                Ok(done) if done.rows_affected() == 0 => report.skipped += 1,
                Ok(_) => report.saved += 1,
                Err(e) => {
                    warn!(ticker = %row.ticker, error = %e, "지표 저장 실패");
                    report.errors.push(format!("{}: {}", row.ticker, e));
                }
            }
        }

        Ok(report)
    }

    async fn load_completed_tickers(&self, market: Market) -> Result<HashSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT c.symbol FROM daily_prices p
            JOIN companies c ON c.id = p.company_id
            WHERE c.market = $1 AND p.collected_on = $2
            "#,
        )
        .bind(market.as_str())
        .bind(self.run_date)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(symbol,)| symbol).collect())
    }

    async fn company_id_mapping(&self, market: Market) -> Result<HashMap<String, Uuid>> {
        let rows: Vec<(String, Uuid)> =
            sqlx::query_as("SELECT symbol, id FROM companies WHERE market = $1")
                .bind(market.as_str())
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().collect())
    }
}
