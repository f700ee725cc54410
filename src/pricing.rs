//! Client for the external charging-price service. The service decides when
//! charging is cheap; this side only supplies vehicle state and constants.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config;
use crate::schedule::DesiredWindow;

/// Seam for the worker's control logic; the HTTP client below is the live
/// implementation.
#[async_trait]
pub trait PricingApi: Send + Sync {
    async fn fetch_windows(&self, battery_level: u32) -> Result<Vec<DesiredWindow>>;
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct PricingRequest {
    battery_level: u32,
    battery_capacity: f64,
    consumption: f64,
    daily_mileage: f64,
    charge_limits: ChargeLimits,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ChargeLimits {
    optimal_upper: u32,
    optimal_lower: u32,
    emergency: u32,
    charging_rate: u32,
}

#[derive(Deserialize, Debug)]
struct PricingResponse {
    success: bool,
    data: Option<PricingData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct PricingData {
    charging_schedule: Vec<WireWindow>,
    #[serde(default)]
    #[allow(dead_code)]
    summary: Option<serde_json::Value>,
}

// Inner fields are snake_case on the wire, unlike their container.
#[derive(Deserialize, Debug)]
struct WireWindow {
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    charge_amount: f64,
}

pub struct PricingClient {
    client: reqwest::Client,
    pricing: config::Pricing,
    battery_capacity_kwh: f64,
}

impl PricingClient {
    pub fn new(pricing: config::Pricing, battery_capacity_kwh: f64) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("offpeak-ev-charging")
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        PricingClient {
            client,
            pricing,
            battery_capacity_kwh,
        }
    }

    /// An empty result is a valid answer meaning "no charging recommended";
    /// the caller decides what to do with it.
    #[tracing::instrument(skip(self))]
    async fn fetch_windows_inner(&self, battery_level: u32) -> Result<Vec<DesiredWindow>> {
        let request = PricingRequest {
            battery_level,
            battery_capacity: self.battery_capacity_kwh,
            consumption: self.pricing.consumption_kwh_per_100km,
            daily_mileage: self.pricing.daily_mileage_km,
            charge_limits: ChargeLimits {
                optimal_upper: self.pricing.optimal_upper,
                optimal_lower: self.pricing.optimal_lower,
                emergency: self.pricing.emergency,
                charging_rate: self.pricing.charging_rate_amps,
            },
        };

        let raw = self
            .client
            .post(&self.pricing.url)
            .header("X-API-Key", &self.pricing.api_key)
            .json(&request)
            .send()
            .await
            .context("reaching pricing service")?
            .error_for_status()
            .context("pricing service status")?
            .text()
            .await
            .context("reading pricing response")?;

        parse_response(&raw)
    }
}

#[async_trait]
impl PricingApi for PricingClient {
    async fn fetch_windows(&self, battery_level: u32) -> Result<Vec<DesiredWindow>> {
        self.fetch_windows_inner(battery_level).await
    }
}

fn parse_response(raw: &str) -> Result<Vec<DesiredWindow>> {
    let response: PricingResponse =
        serde_json::from_str(raw).context("parsing pricing response")?;

    if !response.success {
        return Err(anyhow!(
            "pricing service reported failure: {}",
            response.error.unwrap_or_else(|| "no detail".to_string())
        ));
    }

    let data = response
        .data
        .ok_or_else(|| anyhow!("pricing response missing data"))?;

    Ok(data
        .charging_schedule
        .into_iter()
        .map(|w| DesiredWindow {
            start: w.start_time,
            end: w.end_time,
            charge_amount_kwh: w.charge_amount,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_schedule() {
        let raw = r#"{
            "success": true,
            "data": {
                "chargingSchedule": [
                    {"start_time": "2025-01-21T21:00:00Z", "end_time": "2025-01-21T22:00:00Z", "charge_amount": 5.5},
                    {"start_time": "2025-01-22T00:00:00Z", "end_time": "2025-01-22T02:00:00Z", "charge_amount": 11.0}
                ],
                "summary": {"total_cost": 3.21}
            }
        }"#;

        let windows = parse_response(raw).unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].charge_amount_kwh, 5.5);
        assert!(windows[0].start < windows[0].end);
    }

    #[test]
    fn empty_schedule_is_valid() {
        let raw = r#"{"success": true, "data": {"chargingSchedule": []}}"#;
        assert!(parse_response(raw).unwrap().is_empty());
    }

    #[test]
    fn failure_is_an_error() {
        let raw = r#"{"success": false, "error": "upstream tariff feed down"}"#;
        let err = parse_response(raw).unwrap_err();
        assert!(err.to_string().contains("tariff feed"));
    }
}
