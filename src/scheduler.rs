//! Client for the external one-shot job scheduler. Jobs carry an OIDC
//! identity, fire once at an exact minute, and are deleted by the handler
//! they invoke, so the live job set stays bounded to pending sessions.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Timelike};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct JobSpec {
    pub name: String,
    /// Five-field cron pinned to one exact minute of one day.
    pub schedule: String,
    pub target_url: String,
    pub body: serde_json::Value,
    pub oidc_audience: String,
    pub retry_max_attempts: u32,
}

impl JobSpec {
    pub fn one_shot(
        name: String,
        fire_at: DateTime<Tz>,
        target_url: String,
        body: serde_json::Value,
        oidc_audience: String,
    ) -> Self {
        JobSpec {
            name,
            schedule: exact_minute_cron(fire_at),
            target_url,
            body,
            oidc_audience,
            retry_max_attempts: 3,
        }
    }
}

fn exact_minute_cron(at: DateTime<Tz>) -> String {
    format!("{} {} {} {} *", at.minute(), at.hour(), at.day(), at.month())
}

#[async_trait]
pub trait SchedulerClient: Send + Sync {
    async fn create_job(&self, spec: &JobSpec) -> Result<()>;
    /// Deleting an already-gone job is not an error; self-deletion and the
    /// planner's orphan sweep may race.
    async fn delete_job(&self, name: &str) -> Result<()>;
    async fn list_jobs(&self) -> Result<Vec<String>>;
}

pub struct HttpSchedulerClient {
    client: reqwest::Client,
    base: String,
    auth_token: String,
}

impl HttpSchedulerClient {
    pub fn new(scheduler: &config::Scheduler, auth_token: String) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("offpeak-ev-charging")
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        let base = format!(
            "{}/projects/{}/locations/{}/jobs",
            scheduler.url, scheduler.project_id, scheduler.region
        );
        HttpSchedulerClient {
            client,
            base,
            auth_token,
        }
    }
}

#[async_trait]
impl SchedulerClient for HttpSchedulerClient {
    #[tracing::instrument(skip(self, spec), fields(job = %spec.name))]
    async fn create_job(&self, spec: &JobSpec) -> Result<()> {
        self.client
            .post(&self.base)
            .bearer_auth(&self.auth_token)
            .json(spec)
            .send()
            .await
            .context("reaching scheduler")?
            .error_for_status()
            .with_context(|| format!("creating job {}", spec.name))?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn delete_job(&self, name: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/{}", self.base, name))
            .bearer_auth(&self.auth_token)
            .send()
            .await
            .context("reaching scheduler")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::debug!(name, "job already gone");
            return Ok(());
        }
        response
            .error_for_status()
            .with_context(|| format!("deleting job {}", name))?;
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct JobList {
            #[serde(default)]
            jobs: Vec<JobName>,
        }
        #[derive(Deserialize)]
        struct JobName {
            name: String,
        }

        let list: JobList = self
            .client
            .get(&self.base)
            .bearer_auth(&self.auth_token)
            .send()
            .await
            .context("reaching scheduler")?
            .error_for_status()
            .context("listing jobs")?
            .json()
            .await
            .context("parsing job list")?;
        Ok(list.jobs.into_iter().map(|j| j.name).collect())
    }
}

/// Test double recording the full create/delete history.
#[derive(Default)]
pub struct MemoryScheduler {
    jobs: RwLock<Vec<JobSpec>>,
    pub created: RwLock<Vec<JobSpec>>,
    pub deleted: RwLock<Vec<String>>,
}

impl MemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn live_jobs(&self) -> Vec<String> {
        self.jobs.read().await.iter().map(|j| j.name.clone()).collect()
    }
}

#[async_trait]
impl SchedulerClient for MemoryScheduler {
    async fn create_job(&self, spec: &JobSpec) -> Result<()> {
        self.created.write().await.push(spec.clone());
        self.jobs.write().await.push(spec.clone());
        Ok(())
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        self.deleted.write().await.push(name.to_string());
        self.jobs.write().await.retain(|j| j.name != name);
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<String>> {
        Ok(self.live_jobs().await)
    }
}
