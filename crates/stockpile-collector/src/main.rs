//! Stockpile 데이터 수집기 CLI.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use stockpile_collector::modules::{self, CollectionOrchestrator, RunOptions};
use stockpile_collector::{exit_code, CollectorConfig};
use stockpile_core::{init_logging, LogConfig, LogFormat, Market};
use stockpile_data::{
    FanOutStorage, JsonFileStorage, MemoryStorage, PostgresStorage, Storage, UniverseCache,
};

#[derive(Parser)]
#[command(name = "stockpile-collector")]
#[command(about = "US/KR equity data collector", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// 로그 레벨 (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// 로그 형식 (pretty, json, compact)
    #[arg(long, default_value = "compact")]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// 시장 데이터 수집
    Collect {
        #[arg(long, value_enum)]
        market: MarketArg,

        /// 체크포인트에서 이어서 실행
        #[arg(long)]
        resume: bool,

        /// 모든 소스의 배치 크기 덮어쓰기
        #[arg(long)]
        batch_size: Option<usize>,

        /// 유니버스 앞쪽 N개만 수집
        #[arg(long)]
        limit: Option<usize>,

        /// 특정 종목만 수집 (쉼표로 구분, 예: "AAPL,MSFT")
        #[arg(long, value_delimiter = ',')]
        tickers: Option<Vec<String>>,

        /// 메모리 저장소 사용 (파일/DB 기록 없음)
        #[arg(long)]
        dry_run: bool,
    },

    /// 데이터/체크포인트 디렉토리 백업
    Backup,

    /// JSON 결과를 PostgreSQL로 적재
    LoadDb {
        #[arg(long, value_enum)]
        market: MarketArg,

        /// 기준일 (YYYY-MM-DD, 기본: 오늘)
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MarketArg {
    Us,
    Kospi,
    Kosdaq,
    /// KOSPI + KOSDAQ
    Kr,
    /// US + KOSPI + KOSDAQ
    All,
}

impl MarketArg {
    fn markets(self) -> Vec<Market> {
        match self {
            MarketArg::Us => vec![Market::Us],
            MarketArg::Kospi => vec![Market::Kospi],
            MarketArg::Kosdaq => vec![Market::Kosdaq],
            MarketArg::Kr => vec![Market::Kospi, Market::Kosdaq],
            MarketArg::All => vec![Market::Us, Market::Kospi, Market::Kosdaq],
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(LogConfig::new(&cli.log_level).with_format(cli.log_format)) {
        eprintln!("로깅 초기화 실패: {}", e);
        return ExitCode::from(1);
    }

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = format!("{:#}", e), "실행 실패");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    let mut config = CollectorConfig::from_env().context("설정 로드 실패")?;

    match cli.command {
        Commands::Collect {
            market,
            resume,
            batch_size,
            limit,
            tickers,
            dry_run,
        } => {
            if let Some(batch_size) = batch_size {
                config.override_batch_size(batch_size);
            }
            collect(&config, market.markets(), resume, limit, tickers, dry_run).await
        }
        Commands::Backup => {
            let sources = vec![config.data_dir.clone(), config.checkpoint_dir.clone()];
            let report =
                modules::create_backup(&sources, &config.backup_dir, config.backup_keep).await?;
            tracing::info!(
                path = %report.path.display(),
                files = report.files_copied,
                pruned = report.pruned.len(),
                "백업 생성"
            );
            Ok(0)
        }
        Commands::LoadDb { market, date } => {
            let Some(url) = config.database_url.as_deref() else {
                bail!("load-db에는 DATABASE_URL이 필요합니다");
            };
            let postgres = PostgresStorage::connect(url, 5).await?;
            postgres.migrate().await?;

            let mut json = JsonFileStorage::new(&config.data_dir);
            if let Some(date) = date {
                json = json.with_date(date);
            }

            let mut code = 0;
            for market in market.markets() {
                let report = modules::load_into(&json, &postgres, market).await?;
                if !report.is_clean() {
                    for error in &report.errors {
                        tracing::warn!(market = %market, error = %error, "적재 오류");
                    }
                    code = 1;
                }
            }
            Ok(code)
        }
    }
}

async fn collect(
    config: &CollectorConfig,
    markets: Vec<Market>,
    resume: bool,
    limit: Option<usize>,
    tickers: Option<Vec<String>>,
    dry_run: bool,
) -> anyhow::Result<u8> {
    let storage = build_storage(config, dry_run).await?;

    // dry-run은 실제 체크포인트를 건드리지 않음
    let checkpoint_dir = if dry_run {
        std::env::temp_dir().join(format!("stockpile-dry-run-{}", std::process::id()))
    } else {
        config.checkpoint_dir.clone()
    };

    let options = RunOptions {
        resume,
        limit,
        tickers,
        history_lookback: config.history_lookback,
        min_coverage: config.min_coverage,
    };
    let mut orchestrator = CollectionOrchestrator::new(storage, checkpoint_dir)
        .with_universe_cache(Arc::new(UniverseCache::new(config.universe_ttl)))
        .with_options(options);
    if !dry_run {
        orchestrator = orchestrator.with_reports_dir(config.data_dir.join("reports"));
    }

    // 소스별 브레이커/리미터는 모든 시장이 공유
    let plans = modules::build_plans(&markets, config)?;

    tracing::info!(
        markets = ?plans.iter().map(|p| p.market.as_str()).collect::<Vec<_>>(),
        dry_run,
        "=== 수집 시작 ==="
    );
    let runs = orchestrator.run_all(&plans).await;

    for run in &runs {
        if let Some(quality) = &run.quality {
            tracing::info!(
                market = %run.result.market,
                coverage = quality.coverage,
                passed = quality.passed,
                "품질 검증"
            );
        }
    }

    let results: Vec<_> = runs.into_iter().map(|r| r.result).collect();
    // 중단으로 실행되지 않은 시장도 실패로 간주
    if results.len() < plans.len() {
        return Ok(1);
    }
    let code = exit_code(&results);
    tracing::info!(exit_code = code, "=== 수집 종료 ===");
    Ok(code)
}

async fn build_storage(
    config: &CollectorConfig,
    dry_run: bool,
) -> anyhow::Result<Arc<dyn Storage>> {
    if dry_run {
        tracing::info!("dry-run: 메모리 저장소 사용");
        return Ok(Arc::new(MemoryStorage::new()));
    }

    let json: Arc<dyn Storage> = Arc::new(JsonFileStorage::new(&config.data_dir));
    let Some(url) = config.database_url.as_deref() else {
        return Ok(json);
    };

    let postgres = PostgresStorage::connect(url, 5).await?;
    postgres.migrate().await?;
    tracing::info!("PostgreSQL 저장소 연결");
    let storage = FanOutStorage::new(vec![json, Arc::new(postgres) as Arc<dyn Storage>])?;
    Ok(Arc::new(storage))
}
