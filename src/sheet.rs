//! The operator-facing request sheet. Rows arrive as a CSV export in the
//! documented column order; status transitions are written back by row.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    Active,
    Planned,
    Completed,
    Cancelled,
}

impl RequestStatus {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "ACTIVE" => Some(RequestStatus::Active),
            "PLANNED" => Some(RequestStatus::Planned),
            "COMPLETED" => Some(RequestStatus::Completed),
            "CANCELLED" => Some(RequestStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestStatus::Active => write!(f, "ACTIVE"),
            RequestStatus::Planned => write!(f, "PLANNED"),
            RequestStatus::Completed => write!(f, "COMPLETED"),
            RequestStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// One "reach X% by T" request. `row` is the 1-based sheet row (the header
/// occupies row 1), which doubles as the request's identity.
#[derive(Clone, Debug, PartialEq)]
pub struct SpecialRequest {
    pub row: u32,
    pub target_local: NaiveDateTime,
    pub target_percent: u32,
    pub status: RequestStatus,
}

#[async_trait]
pub trait SheetClient: Send + Sync {
    async fn list_requests(&self) -> Result<Vec<SpecialRequest>>;
    async fn update_status(&self, row: u32, status: RequestStatus) -> Result<()>;
}

pub struct HttpSheetClient {
    client: reqwest::Client,
    sheet: config::Sheet,
}

impl HttpSheetClient {
    pub fn new(sheet: config::Sheet) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("offpeak-ev-charging")
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        HttpSheetClient { client, sheet }
    }
}

#[async_trait]
impl SheetClient for HttpSheetClient {
    #[tracing::instrument(skip(self))]
    async fn list_requests(&self) -> Result<Vec<SpecialRequest>> {
        let raw = self
            .client
            .get(&self.sheet.url)
            .bearer_auth(&self.sheet.service_account_key)
            .send()
            .await
            .context("reaching request sheet")?
            .error_for_status()
            .context("request sheet status")?
            .text()
            .await
            .context("reading request sheet")?;

        parse_rows(&raw)
    }

    #[tracing::instrument(skip(self))]
    async fn update_status(&self, row: u32, status: RequestStatus) -> Result<()> {
        #[derive(Serialize)]
        struct StatusUpdate {
            row: u32,
            status: String,
        }

        self.client
            .post(&self.sheet.url)
            .bearer_auth(&self.sheet.service_account_key)
            .json(&StatusUpdate {
                row,
                status: status.to_string(),
            })
            .send()
            .await
            .context("reaching request sheet")?
            .error_for_status()
            .context("status write-back")?;
        Ok(())
    }
}

/// Columns: Date | Time | Target% | Status | CreatedAt | UpdatedAt.
/// Malformed rows are skipped with a warning; one bad row must not take the
/// planner down.
pub fn parse_rows(raw: &str) -> Result<Vec<SpecialRequest>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(raw.as_bytes());

    let mut requests = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let row = index as u32 + 2;
        let record = record.context("reading sheet row")?;

        let parsed = (|| {
            let date = NaiveDate::parse_from_str(record.get(0)?.trim(), "%Y-%m-%d").ok()?;
            let time = NaiveTime::parse_from_str(record.get(1)?.trim(), "%H:%M").ok()?;
            let target_percent: u32 = record.get(2)?.trim().parse().ok()?;
            let status = RequestStatus::parse(record.get(3)?)?;
            Some(SpecialRequest {
                row,
                target_local: date.and_time(time),
                target_percent,
                status,
            })
        })();

        match parsed {
            Some(request) if (50..=100).contains(&request.target_percent) => {
                requests.push(request)
            }
            Some(request) => {
                tracing::warn!(
                    row,
                    target = request.target_percent,
                    "skipping request with target outside 50–100"
                );
            }
            None => {
                tracing::warn!(row, record = ?record, "skipping malformed sheet row");
            }
        }
    }

    Ok(requests)
}

/// Test double with scripted rows; records every status write-back.
#[derive(Default)]
pub struct MemorySheet {
    rows: RwLock<Vec<SpecialRequest>>,
    pub updates: RwLock<Vec<(u32, RequestStatus)>>,
}

impl MemorySheet {
    pub fn with_rows(rows: Vec<SpecialRequest>) -> Self {
        MemorySheet {
            rows: RwLock::new(rows),
            updates: RwLock::default(),
        }
    }
}

#[async_trait]
impl SheetClient for MemorySheet {
    async fn list_requests(&self) -> Result<Vec<SpecialRequest>> {
        Ok(self.rows.read().await.clone())
    }

    async fn update_status(&self, row: u32, status: RequestStatus) -> Result<()> {
        self.updates.write().await.push((row, status));
        let mut rows = self.rows.write().await;
        if let Some(request) = rows.iter_mut().find(|r| r.row == row) {
            request.status = status;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_rows() {
        let raw = "\
Date,Time,Target%,Status,CreatedAt,UpdatedAt
2025-01-22,07:00,85,ACTIVE,2025-01-20 10:00,2025-01-20 10:00
2025-01-25,18:30,90,PLANNED,2025-01-20 11:00,2025-01-20 11:00
";
        let rows = parse_rows(raw).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].row, 2);
        assert_eq!(rows[0].target_percent, 85);
        assert_eq!(rows[0].status, RequestStatus::Active);
        assert_eq!(
            rows[0].target_local,
            NaiveDate::from_ymd_opt(2025, 1, 22)
                .unwrap()
                .and_hms_opt(7, 0, 0)
                .unwrap()
        );
        assert_eq!(rows[1].row, 3);
    }

    #[test]
    fn skips_malformed_and_out_of_range_rows() {
        let raw = "\
Date,Time,Target%,Status,CreatedAt,UpdatedAt
not-a-date,07:00,85,ACTIVE,,
2025-01-22,07:00,45,ACTIVE,,
2025-01-22,07:00,85,RUNNING,,
2025-01-23,08:00,100,ACTIVE,,
";
        let rows = parse_rows(raw).unwrap();
        assert_eq!(rows.len(), 1);
        // Row numbering still counts the skipped rows.
        assert_eq!(rows[0].row, 5);
        assert_eq!(rows[0].target_percent, 100);
    }
}
