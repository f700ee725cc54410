mod error;
mod token;
mod vehicle;
mod wire;

static BASE_URL: &str = "https://fleet-api.prd.eu.vn.cloud.tesla.com";
static AUTH_URL: &str = "https://auth.tesla.com/oauth2/v3/token";

pub use error::ApiError;
pub use token::{refresh_token_grant, TokenRecord};
pub use vehicle::{Gateway, TokenSource, VehicleApi, VehicleSummary};
pub use wire::{ChargeSchedule, ChargeScheduleData, ChargeState, DriveState, VehicleData};
