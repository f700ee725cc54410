//! Raw response shapes from the vehicle cloud, kept close to the wire.
//! Domain reduction happens in [`crate::snapshot`].

use serde::{Deserialize, Serialize};

#[derive(Deserialize, Debug)]
pub struct VehicleData {
    pub id: u64,
    pub vin: String,
    pub state: String,
    #[serde(default)]
    pub in_service: bool,
    pub charge_state: Option<ChargeState>,
    pub drive_state: Option<DriveState>,
    pub charge_schedule_data: Option<ChargeScheduleData>,
}

impl VehicleData {
    pub fn is_online(&self) -> bool {
        self.state == "online"
    }
}

#[derive(Deserialize, Debug)]
pub struct ChargeState {
    pub battery_level: u32,
    pub charge_limit_soc: u32,
    #[serde(default)]
    pub charge_limit_soc_max: u32,
    #[serde(default)]
    pub charge_limit_soc_min: u32,
    pub charging_state: String,
    #[serde(default)]
    pub charge_port_door_open: bool,
    #[serde(default)]
    pub charge_port_latch: String,
    #[serde(default)]
    pub conn_charge_cable: String,
    #[serde(default)]
    pub charge_rate: f32,
    #[serde(default)]
    pub charger_power: u32,
    #[serde(default)]
    pub minutes_to_full_charge: u32,
    #[serde(default)]
    pub scheduled_charging_pending: bool,
    pub timestamp: Option<i64>,
}

#[derive(Deserialize, Debug)]
pub struct DriveState {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    #[serde(default)]
    pub heading: u32,
    #[serde(default)]
    pub speed: Option<f32>,
}

#[derive(Deserialize, Debug, Default)]
pub struct ChargeScheduleData {
    #[serde(default)]
    pub charge_schedules: Vec<ChargeSchedule>,
}

/// A charge schedule as stored on the vehicle. Ids are server-assigned.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChargeSchedule {
    pub id: i64,
    pub enabled: bool,
    pub start_enabled: bool,
    /// Minutes from local midnight, 0–1439.
    pub start_time: u32,
    pub end_enabled: bool,
    pub end_time: u32,
    /// Day bitmask as reported by the vehicle; 127 means every day.
    pub days_of_week: u32,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub one_time: bool,
}
