//! 수집 모듈.

pub mod backup;
pub mod checkpoint;
pub mod db_load;
pub mod orchestrator;
pub mod quality;
pub mod wiring;

pub use backup::{create_backup, create_backup_at, list_backups, prune_backups, BackupReport};
pub use checkpoint::CheckpointTracker;
pub use db_load::load_into;
pub use orchestrator::{CollectionOrchestrator, MarketRun, RunOptions};
pub use quality::{major_tickers, QualityReport, QualityVerifier, DEFAULT_MIN_COVERAGE};
pub use wiring::{build_plan, build_plans, MarketPlan, SharedResources, SourceBinding};
