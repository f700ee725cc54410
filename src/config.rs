use std::path::PathBuf;

use anyhow::{anyhow, Error};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

pub trait Validate: Sized {
    fn validate(self) -> Result<Self, Error>;
}

#[derive(Default, Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Config {
    pub home: Home,
    pub oauth: OAuth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<Proxy>,
    pub worker: Worker,
    pub pricing: Pricing,
    pub sheet: Sheet,
    pub scheduler: Scheduler,
    pub charging: Charging,
}

/// Center and radius of the region classified as HOME.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Home {
    pub latitude: f64,
    pub longitude: f64,
    /// Euclidean degree-distance radius, not meters.
    pub radius_degrees: f64,
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct OAuth {
    pub client_id: String,
    pub client_secret: String,
    pub domain: String,
    pub public_key_url: String,
    /// Where the token record is persisted. Worker is the only writer.
    pub token_path: PathBuf,
    /// Command-signing key, consumed by the signing proxy.
    pub private_key_path: PathBuf,
}

/// Local command-signing proxy. When absent, signed commands fail NotSupported.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct Proxy {
    pub host: String,
    pub port: u16,
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct Worker {
    /// Absolute URL Scout uses to reach the worker service.
    pub url: String,
    /// Listen address for the worker's HTTP server.
    pub bind: String,
    /// Bearer secret required on mutating endpoints.
    pub auth_token: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Pricing {
    pub url: String,
    pub api_key: String,
    pub consumption_kwh_per_100km: f64,
    pub daily_mileage_km: f64,
    pub optimal_upper: u32,
    pub optimal_lower: u32,
    pub emergency: u32,
    pub charging_rate_amps: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct Sheet {
    pub url: String,
    pub service_account_key: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct Scheduler {
    pub url: String,
    pub project_id: String,
    pub region: String,
    pub oidc_audience: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Charging {
    pub vin: String,
    pub battery_capacity_kwh: f64,
    pub charging_rate_kw: f64,
    /// Local-time intervals the planner avoids.
    pub peak_intervals: Vec<(NaiveTime, NaiveTime)>,
    /// Directory for the embedded state store.
    pub state_path: PathBuf,
}

impl Validate for Config {
    fn validate(self) -> Result<Self, Error> {
        Ok(Self {
            home: self.home.validate()?,
            oauth: self.oauth.validate()?,
            proxy: self.proxy,
            worker: self.worker.validate()?,
            pricing: self.pricing.validate()?,
            sheet: self.sheet.validate()?,
            scheduler: self.scheduler.validate()?,
            charging: self.charging.validate()?,
        })
    }
}

impl Validate for Home {
    fn validate(self) -> Result<Self, Error> {
        if !(-90.0..=90.0).contains(&self.latitude) || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(anyhow!(
                "home coordinates ({}, {}) are not on the globe",
                self.latitude,
                self.longitude
            ));
        }
        if self.radius_degrees <= 0.0 {
            return Err(anyhow!(
                "home radius_degrees {} must be positive",
                self.radius_degrees
            ));
        }
        Ok(self)
    }
}

impl Validate for OAuth {
    fn validate(self) -> Result<Self, Error> {
        if self == Self::default() {
            return Err(anyhow!(
                "oauth credentials must be changed from default values"
            ));
        }
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(anyhow!("oauth client_id and client_secret must be set"));
        }
        Ok(self)
    }
}

impl Validate for Worker {
    fn validate(self) -> Result<Self, Error> {
        if self.url.is_empty() {
            return Err(anyhow!("worker url must be set"));
        }
        if self.auth_token.is_empty() {
            return Err(anyhow!("worker auth_token must be set"));
        }
        Ok(self)
    }
}

impl Validate for Pricing {
    fn validate(self) -> Result<Self, Error> {
        if self.optimal_lower >= self.optimal_upper {
            return Err(anyhow!(
                "pricing optimal_lower {} must be below optimal_upper {}",
                self.optimal_lower,
                self.optimal_upper
            ));
        }
        Ok(self)
    }
}

impl Validate for Sheet {
    fn validate(self) -> Result<Self, Error> {
        if self.url.is_empty() {
            return Err(anyhow!("sheet url must be set"));
        }
        Ok(self)
    }
}

impl Validate for Scheduler {
    fn validate(self) -> Result<Self, Error> {
        if self.project_id.is_empty() || self.region.is_empty() {
            return Err(anyhow!("scheduler project_id and region must be set"));
        }
        Ok(self)
    }
}

impl Validate for Charging {
    fn validate(self) -> Result<Self, Error> {
        if self.vin.is_empty() {
            return Err(anyhow!("vin must be set"));
        }
        if self.battery_capacity_kwh <= 0.0 || self.charging_rate_kw <= 0.0 {
            return Err(anyhow!(
                "battery_capacity_kwh {} and charging_rate_kw {} must be positive",
                self.battery_capacity_kwh,
                self.charging_rate_kw
            ));
        }
        for (start, end) in &self.peak_intervals {
            if start >= end {
                return Err(anyhow!(
                    "specified peak interval with start {} >= end {}",
                    start,
                    end
                ));
            }
        }
        for ((_, prev_end), (next_start, _)) in self
            .peak_intervals
            .iter()
            .zip(self.peak_intervals.iter().skip(1))
        {
            if prev_end >= next_start {
                return Err(anyhow!(
                    "peak intervals must be nonoverlapping and sorted, but prev_end {} >= next_start {}",
                    prev_end,
                    next_start,
                ));
            }
        }
        Ok(self)
    }
}

impl Default for Home {
    fn default() -> Self {
        Home {
            latitude: 52.2297,
            longitude: 21.0122,
            radius_degrees: 0.002,
        }
    }
}

impl Default for OAuth {
    fn default() -> Self {
        OAuth {
            client_id: "your_client_id".to_string(),
            client_secret: "your_client_secret".to_string(),
            domain: "your-app.example.com".to_string(),
            public_key_url:
                "https://your-app.example.com/.well-known/appspecific/com.tesla.3p.public-key.pem"
                    .to_string(),
            token_path: PathBuf::from("tokens.json"),
            private_key_path: PathBuf::from("private-key.pem"),
        }
    }
}

impl Default for Worker {
    fn default() -> Self {
        Worker {
            url: "http://127.0.0.1:8080".to_string(),
            bind: "0.0.0.0:8080".to_string(),
            auth_token: "change_me".to_string(),
        }
    }
}

impl Default for Pricing {
    fn default() -> Self {
        Pricing {
            url: "https://pricing.example.com/api/calculate".to_string(),
            api_key: "your_pricing_api_key".to_string(),
            consumption_kwh_per_100km: 18.0,
            daily_mileage_km: 40.0,
            optimal_upper: 80,
            optimal_lower: 50,
            emergency: 20,
            charging_rate_amps: 16,
        }
    }
}

impl Default for Sheet {
    fn default() -> Self {
        Sheet {
            url: "https://sheets.example.com/special-charging".to_string(),
            service_account_key: "your_service_account_key".to_string(),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler {
            url: "https://cloudscheduler.googleapis.com/v1".to_string(),
            project_id: "your-project".to_string(),
            region: "europe-central2".to_string(),
            oidc_audience: "https://your-worker.example.com".to_string(),
        }
    }
}

impl Default for Charging {
    fn default() -> Charging {
        Charging {
            vin: "5YJ3E7EB0KF000000".to_string(),
            battery_capacity_kwh: 75.,
            charging_rate_kw: 11.,
            peak_intervals: vec![
                (
                    NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
                    NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
                ),
                (
                    NaiveTime::from_hms_opt(19, 0, 0).unwrap(),
                    NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
                ),
            ],
            state_path: PathBuf::from("state"),
        }
    }
}
