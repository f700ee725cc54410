use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use super::{wire, ApiError, BASE_URL};
use crate::config;
use crate::schedule::ScheduleSpec;
use crate::snapshot::VehicleSnapshot;

static USER_AGENT: &str = "offpeak-ev-charging";

const REQUEST_DEADLINE: Duration = Duration::from_secs(30);
const WAKE_DEADLINE: Duration = Duration::from_secs(30);
const WAKE_POLL: Duration = Duration::from_secs(2);

/// Where request tokens come from. The worker plugs in its broker; scout
/// plugs in its direct secret-store read with worker escalation.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// A token expected to be valid for the next request.
    async fn access_token(&self) -> Result<String, ApiError>;

    /// A token that is fresh with certainty, after a 401. May be called at
    /// most once per gateway operation.
    async fn refreshed_token(&self) -> Result<String, ApiError>;
}

#[derive(Deserialize, Debug, Clone)]
pub struct VehicleSummary {
    pub id: u64,
    pub vin: String,
}

/// Typed surface over the vehicle cloud and the signing proxy. The worker's
/// control logic only ever sees this trait.
#[async_trait]
pub trait VehicleApi: Send + Sync {
    async fn get_snapshot(&self, include_location: bool) -> Result<VehicleSnapshot, ApiError>;
    async fn wake_up(&self) -> Result<(), ApiError>;
    async fn list_charge_schedules(&self) -> Result<Vec<wire::ChargeSchedule>, ApiError>;
    async fn add_charge_schedule(&self, spec: &ScheduleSpec) -> Result<i64, ApiError>;
    async fn remove_charge_schedule(&self, schedule_id: i64) -> Result<(), ApiError>;
    async fn set_charge_limit(&self, percent: u32) -> Result<(), ApiError>;
    async fn charge_start(&self) -> Result<(), ApiError>;
    async fn charge_stop(&self) -> Result<(), ApiError>;
}

pub struct Gateway {
    client: reqwest::Client,
    command_client: reqwest::Client,
    /// Base URL of the signing proxy; signed commands fail NotSupported
    /// without one.
    command_base: Option<String>,
    home: config::Home,
    tokens: Arc<dyn TokenSource>,
    vin: String,
    vehicle_id: u64,
}

impl Gateway {
    /// Build clients and bind the configured VIN to its cloud id: the first
    /// vehicle whose VIN matches, else the first the account returns.
    pub async fn connect(
        home: config::Home,
        proxy: Option<config::Proxy>,
        vin: String,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Gateway, ApiError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_DEADLINE)
            .build()
            .map_err(|e| ApiError::Transient(e.to_string()))?;

        let (command_client, command_base) = match proxy {
            Some(proxy) => {
                // The proxy generates a self-signed certificate at startup;
                // the verification exception is narrowed to loopback targets.
                let loopback = proxy.host == "localhost" || proxy.host == "127.0.0.1";
                let command_client = reqwest::Client::builder()
                    .user_agent(USER_AGENT)
                    .timeout(REQUEST_DEADLINE)
                    .danger_accept_invalid_certs(loopback)
                    .build()
                    .map_err(|e| ApiError::Transient(e.to_string()))?;
                (
                    command_client,
                    Some(format!("https://{}:{}", proxy.host, proxy.port)),
                )
            }
            None => (client.clone(), None),
        };

        let mut gateway = Gateway {
            client,
            command_client,
            command_base,
            home,
            tokens,
            vin,
            vehicle_id: 0,
        };

        let vehicles = gateway.list_vehicles().await?;
        let chosen = vehicles
            .iter()
            .find(|v| v.vin == gateway.vin)
            .or_else(|| vehicles.first())
            .ok_or_else(|| ApiError::BadRequest("account has no vehicles".to_string()))?;
        if chosen.vin != gateway.vin {
            tracing::warn!(
                configured = %gateway.vin,
                found = %chosen.vin,
                "configured VIN not in account, using first vehicle"
            );
        }
        gateway.vehicle_id = chosen.id;
        gateway.vin = chosen.vin.clone();

        Ok(gateway)
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_vehicles(&self) -> Result<Vec<VehicleSummary>, ApiError> {
        #[derive(Deserialize)]
        struct Response {
            response: Vec<VehicleSummary>,
        }

        let url = format!("{}/api/1/vehicles", BASE_URL);
        let rsp: Response = self
            .send(|token| self.client.get(&url).bearer_auth(token))
            .await?;
        Ok(rsp.response)
    }

    /// One request with the gateway's retry discipline: a single re-attempt
    /// after a forced token refresh on 401, a single re-attempt on transient
    /// failure, a single backoff on 429.
    async fn send<T, F>(&self, build: F) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        let mut token = self.tokens.access_token().await?;
        let mut retried_auth = false;
        let mut retried_transport = false;

        loop {
            let attempt = async {
                let response = build(&token).send().await?;
                let status = response.status();
                if status.is_success() {
                    response
                        .json::<T>()
                        .await
                        .map_err(|e| ApiError::BadRequest(format!("malformed response: {}", e)))
                } else {
                    let body = response.text().await.unwrap_or_default();
                    Err(ApiError::classify(status, &body))
                }
            };

            match attempt.await {
                Ok(parsed) => return Ok(parsed),
                Err(ApiError::Unauthorized) if !retried_auth => {
                    retried_auth = true;
                    tracing::info!("401 from vehicle API, forcing token refresh");
                    token = self.tokens.refreshed_token().await?;
                }
                Err(ApiError::Unauthorized) => return Err(ApiError::NeedsReauthorization),
                Err(err @ ApiError::Transient(_)) if !retried_transport => {
                    retried_transport = true;
                    tracing::warn!(error = %err, "transient failure, retrying once");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(ApiError::RateLimited) if !retried_transport => {
                    retried_transport = true;
                    tracing::warn!("rate limited, backing off once");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Signed command through the proxy. `result: false` answers surface the
    /// vehicle's reason string.
    async fn command(
        &self,
        name: &str,
        body: serde_json::Value,
    ) -> Result<CommandResult, ApiError> {
        let base = self.command_base.as_ref().ok_or_else(|| {
            ApiError::NotSupported("no signing proxy configured".to_string())
        })?;

        #[derive(Deserialize)]
        struct Response {
            response: CommandResult,
        }

        let url = format!("{}/api/1/vehicles/{}/command/{}", base, self.vin, name);
        let rsp: Response = self
            .send(|token| self.command_client.post(&url).bearer_auth(token).json(&body))
            .await?;
        Ok(rsp.response)
    }

    async fn vehicle_status(&self) -> Result<wire::VehicleData, ApiError> {
        #[derive(Deserialize)]
        struct Response {
            response: wire::VehicleData,
        }

        let url = format!("{}/api/1/vehicles/{}", BASE_URL, self.vehicle_id);
        let rsp: Response = self
            .send(|token| self.client.get(&url).bearer_auth(token))
            .await?;
        Ok(rsp.response)
    }

    async fn vehicle_data(&self, endpoints: &str) -> Result<wire::VehicleData, ApiError> {
        #[derive(Deserialize)]
        struct Response {
            response: wire::VehicleData,
        }

        let url = format!("{}/api/1/vehicles/{}/vehicle_data", BASE_URL, self.vehicle_id);
        let rsp: Response = self
            .send(|token| {
                self.client
                    .get(&url)
                    .query(&[("endpoints", endpoints)])
                    .bearer_auth(token)
            })
            .await?;
        Ok(rsp.response)
    }
}

#[derive(Deserialize, Debug)]
struct CommandResult {
    result: bool,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    schedule_id: Option<i64>,
}

#[async_trait]
impl VehicleApi for Gateway {
    #[tracing::instrument(skip(self))]
    async fn get_snapshot(&self, include_location: bool) -> Result<VehicleSnapshot, ApiError> {
        // vehicle_data is rejected for sleeping vehicles, so the cheap
        // status read decides whether there is anything more to fetch.
        let status = self.vehicle_status().await?;
        if !status.is_online() {
            return Ok(VehicleSnapshot::offline(&self.vin, Utc::now()));
        }

        // GPS is only populated when location data is explicitly requested.
        let endpoints = if include_location {
            "charge_state;drive_state;location_data"
        } else {
            "charge_state"
        };

        match self.vehicle_data(endpoints).await {
            Ok(data) => Ok(VehicleSnapshot::from_vehicle_data(&data, &self.home, Utc::now())),
            // Fell asleep between the two reads.
            Err(ApiError::Transient(msg)) if msg.contains("408") => {
                Ok(VehicleSnapshot::offline(&self.vin, Utc::now()))
            }
            Err(err) => Err(err),
        }
    }

    /// Wake the vehicle from sleep, returning only once it reports online.
    #[tracing::instrument(skip(self))]
    async fn wake_up(&self) -> Result<(), ApiError> {
        #[derive(Deserialize)]
        struct Response {
            response: WakeData,
        }
        #[derive(Deserialize)]
        struct WakeData {
            state: String,
        }

        let url = format!("{}/api/1/vehicles/{}/wake_up", BASE_URL, self.vehicle_id);

        let waker = async {
            loop {
                let rsp: Response = self
                    .send(|token| self.client.post(&url).bearer_auth(token))
                    .await?;
                if rsp.response.state == "online" {
                    tracing::debug!("vehicle is awake");
                    return Ok::<(), ApiError>(());
                }
                tracing::debug!("vehicle is asleep, waiting");
                tokio::time::sleep(WAKE_POLL).await;
            }
        };

        tokio::time::timeout(WAKE_DEADLINE, waker)
            .await
            .map_err(|_| ApiError::WakeTimeout)?
    }

    #[tracing::instrument(skip(self))]
    async fn list_charge_schedules(&self) -> Result<Vec<wire::ChargeSchedule>, ApiError> {
        let data = self.vehicle_data("charge_schedule_data").await?;
        Ok(data
            .charge_schedule_data
            .unwrap_or_default()
            .charge_schedules)
    }

    #[tracing::instrument(skip(self, spec))]
    async fn add_charge_schedule(&self, spec: &ScheduleSpec) -> Result<i64, ApiError> {
        let result = self
            .command("add_charge_schedule", serde_json::to_value(spec).unwrap_or_default())
            .await?;
        if !result.result {
            return Err(ApiError::BadRequest(format!(
                "add_charge_schedule rejected: {}",
                result.reason
            )));
        }
        result.schedule_id.ok_or_else(|| {
            ApiError::BadRequest("add_charge_schedule response carried no schedule id".to_string())
        })
    }

    #[tracing::instrument(skip(self))]
    async fn remove_charge_schedule(&self, schedule_id: i64) -> Result<(), ApiError> {
        let result = self
            .command("remove_charge_schedule", json!({ "id": schedule_id }))
            .await?;
        if result.result {
            Ok(())
        } else {
            Err(ApiError::BadRequest(format!(
                "remove_charge_schedule rejected: {}",
                result.reason
            )))
        }
    }

    #[tracing::instrument(skip(self))]
    async fn set_charge_limit(&self, percent: u32) -> Result<(), ApiError> {
        let result = self
            .command("set_charge_limit", json!({ "percent": percent }))
            .await?;
        // The vehicle answers result=false when the limit is already there.
        if result.result || result.reason == "already_set" {
            Ok(())
        } else {
            Err(ApiError::BadRequest(format!(
                "set_charge_limit rejected: {}",
                result.reason
            )))
        }
    }

    #[tracing::instrument(skip(self))]
    async fn charge_start(&self) -> Result<(), ApiError> {
        let result = self.command("charge_start", json!({})).await?;
        if result.result {
            Ok(())
        } else {
            Err(ApiError::BadRequest(format!(
                "charge_start rejected: {}",
                result.reason
            )))
        }
    }

    #[tracing::instrument(skip(self))]
    async fn charge_stop(&self) -> Result<(), ApiError> {
        let result = self.command("charge_stop", json!({})).await?;
        if result.result {
            Ok(())
        } else {
            Err(ApiError::BadRequest(format!(
                "charge_stop rejected: {}",
                result.reason
            )))
        }
    }
}
