//! 체크포인트 관리 모듈.
//!
//! 시장별로 완료된 종목 심볼 집합을 파일에 보관해 중단된 수집을 이어서
//! 실행할 수 있게 합니다.
//!
//! # 주요 기능
//!
//! - **남은 종목 계산**: 입력 순서를 유지한 채 완료 종목 제외
//! - **원자적 저장**: 임시 파일에 쓴 뒤 rename (라이브 파일은 부분 기록되지 않음)
//! - **파일 없음**: 빈 집합으로 시작
//!
//! 같은 체크포인트 파일을 두 실행이 동시에 쓰는 경우는 지원하지 않습니다.
//!
//! # 사용 예
//!
//! ```rust,ignore
//! let mut checkpoint = CheckpointTracker::load(&dir, Market::Kospi).await?;
//! let remaining = checkpoint.get_remaining(&universe);
//! // ... 수집 ...
//! checkpoint.mark_batch_completed(saved.iter());
//! checkpoint.save().await?;
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stockpile_core::{Market, Ticker};
use stockpile_data::{read_json_or_default, write_json_atomic};

use crate::Result;

/// 체크포인트 파일 내용.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CheckpointFile {
    market: Option<Market>,
    updated_at: Option<DateTime<Utc>>,
    completed: BTreeSet<String>,
}

/// 시장 하나의 완료 종목 추적기.
#[derive(Debug, Clone)]
pub struct CheckpointTracker {
    path: PathBuf,
    market: Market,
    completed: BTreeSet<String>,
}

impl CheckpointTracker {
    /// 체크포인트 파일 경로.
    pub fn path_for(dir: &Path, market: Market) -> PathBuf {
        dir.join(format!("{}_checkpoint.json", market.as_str().to_lowercase()))
    }

    /// 빈 추적기 (파일은 읽지 않음).
    pub fn empty(dir: &Path, market: Market) -> Self {
        Self {
            path: Self::path_for(dir, market),
            market,
            completed: BTreeSet::new(),
        }
    }

    /// 파일에서 로드합니다. 파일이 없으면 빈 집합.
    pub async fn load(dir: &Path, market: Market) -> Result<Self> {
        let path = Self::path_for(dir, market);
        let file: CheckpointFile = read_json_or_default(&path).await?;

        if !file.completed.is_empty() {
            tracing::info!(
                market = %market,
                completed = file.completed.len(),
                updated_at = ?file.updated_at,
                "체크포인트 로드"
            );
        }

        Ok(Self {
            path,
            market,
            completed: file.completed,
        })
    }

    pub fn market(&self) -> Market {
        self.market
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 완료되지 않은 종목 (입력 순서 유지).
    pub fn get_remaining(&self, all: &[Ticker]) -> Vec<Ticker> {
        all.iter()
            .filter(|t| !self.completed.contains(t.symbol()))
            .cloned()
            .collect()
    }

    pub fn is_completed(&self, ticker: &Ticker) -> bool {
        self.completed.contains(ticker.symbol())
    }

    pub fn mark_completed(&mut self, ticker: &Ticker) {
        self.completed.insert(ticker.symbol().to_string());
    }

    pub fn mark_batch_completed<'a>(&mut self, tickers: impl IntoIterator<Item = &'a Ticker>) {
        for ticker in tickers {
            self.mark_completed(ticker);
        }
    }

    pub fn completed(&self) -> &BTreeSet<String> {
        &self.completed
    }

    pub fn len(&self) -> usize {
        self.completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }

    /// 메모리 상태를 비웁니다 (`save` 전까지 파일은 그대로).
    pub fn clear(&mut self) {
        self.completed.clear();
    }

    /// 전체 집합을 원자적으로 저장합니다.
    pub async fn save(&self) -> Result<()> {
        let file = CheckpointFile {
            market: Some(self.market),
            updated_at: Some(Utc::now()),
            completed: self.completed.clone(),
        };
        write_json_atomic(&self.path, &file).await?;
        tracing::debug!(market = %self.market, completed = self.completed.len(), "체크포인트 저장");
        Ok(())
    }
}
