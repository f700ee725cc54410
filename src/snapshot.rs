use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config;
use crate::tesla::VehicleData;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChargingState {
    Charging,
    Complete,
    Disconnected,
    Stopped,
    NoPower,
    Unknown,
}

impl ChargingState {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Charging" => ChargingState::Charging,
            "Complete" => ChargingState::Complete,
            "Disconnected" => ChargingState::Disconnected,
            "Stopped" => ChargingState::Stopped,
            "NoPower" => ChargingState::NoPower,
            _ => ChargingState::Unknown,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortLatch {
    Engaged,
    Disengaged,
    Unknown,
}

impl PortLatch {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Engaged" => PortLatch::Engaged,
            "Disengaged" => PortLatch::Disengaged,
            _ => PortLatch::Unknown,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocationStatus {
    Home,
    Outside,
    Unknown,
}

impl std::fmt::Display for LocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LocationStatus::Home => write!(f, "HOME"),
            LocationStatus::Outside => write!(f, "OUTSIDE"),
            LocationStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Everything a single read of the vehicle yields, reduced to what the
/// control plane acts on.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct VehicleSnapshot {
    pub vin: String,
    pub online: bool,
    pub battery_percent: u32,
    pub charging_state: ChargingState,
    pub charge_port_latch: PortLatch,
    pub connected_cable: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub location_status: LocationStatus,
    pub is_charging_ready: bool,
    pub current_charge_limit: u32,
    pub read_timestamp: DateTime<Utc>,
}

impl VehicleSnapshot {
    pub fn from_vehicle_data(data: &VehicleData, home: &config::Home, now: DateTime<Utc>) -> Self {
        let (battery, limit, charging_state, latch, cable) = match &data.charge_state {
            Some(cs) => (
                cs.battery_level,
                cs.charge_limit_soc,
                ChargingState::parse(&cs.charging_state),
                PortLatch::parse(&cs.charge_port_latch),
                cs.conn_charge_cable.clone(),
            ),
            None => (0, 0, ChargingState::Unknown, PortLatch::Unknown, String::new()),
        };

        let (latitude, longitude) = match &data.drive_state {
            Some(ds) => (ds.latitude, ds.longitude),
            None => (None, None),
        };

        VehicleSnapshot {
            vin: data.vin.clone(),
            online: data.is_online(),
            battery_percent: battery,
            charging_state,
            charge_port_latch: latch,
            connected_cable: cable.clone(),
            latitude,
            longitude,
            location_status: classify_location(latitude, longitude, home),
            is_charging_ready: charging_ready(charging_state, latch, &cable),
            current_charge_limit: limit,
            read_timestamp: now,
        }
    }

    /// Placeholder snapshot for a vehicle the cloud reports as asleep or
    /// offline; nothing beyond the online flag is known.
    pub fn offline(vin: &str, now: DateTime<Utc>) -> Self {
        VehicleSnapshot {
            vin: vin.to_string(),
            online: false,
            battery_percent: 0,
            charging_state: ChargingState::Unknown,
            charge_port_latch: PortLatch::Unknown,
            connected_cable: String::new(),
            latitude: None,
            longitude: None,
            location_status: LocationStatus::Unknown,
            is_charging_ready: false,
            current_charge_limit: 0,
            read_timestamp: now,
        }
    }

    pub fn at_home(&self) -> bool {
        self.location_status == LocationStatus::Home
    }

    /// Last four VIN characters, for log lines.
    pub fn vin_tail(&self) -> &str {
        let n = self.vin.len();
        &self.vin[n.saturating_sub(4)..]
    }
}

/// The vehicle can begin a scheduled charge: it is already charging (or
/// finished), or the cable is physically latched and identified.
pub fn charging_ready(state: ChargingState, latch: PortLatch, cable: &str) -> bool {
    match state {
        ChargingState::Charging | ChargingState::Complete => true,
        _ => latch == PortLatch::Engaged && cable_is_valid(cable),
    }
}

fn cable_is_valid(cable: &str) -> bool {
    !cable.is_empty() && cable != "Unknown" && cable != "<invalid>" && cable != "Invalid"
}

/// HOME iff the Euclidean degree distance to the configured home point is
/// within the configured radius. Missing coordinates classify as UNKNOWN.
pub fn classify_location(
    latitude: Option<f64>,
    longitude: Option<f64>,
    home: &config::Home,
) -> LocationStatus {
    match (latitude, longitude) {
        (Some(lat), Some(lon)) => {
            let d_lat = lat - home.latitude;
            let d_lon = lon - home.longitude;
            if (d_lat * d_lat + d_lon * d_lon).sqrt() <= home.radius_degrees {
                LocationStatus::Home
            } else {
                LocationStatus::Outside
            }
        }
        _ => LocationStatus::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn home() -> config::Home {
        config::Home {
            latitude: 52.2297,
            longitude: 21.0122,
            radius_degrees: 0.002,
        }
    }

    #[test]
    fn location_classification() {
        let home = home();
        assert_eq!(
            classify_location(Some(52.2297), Some(21.0122), &home),
            LocationStatus::Home
        );
        assert_eq!(
            classify_location(Some(52.2312), Some(21.0122), &home),
            LocationStatus::Home
        );
        assert_eq!(
            classify_location(Some(52.3), Some(21.0122), &home),
            LocationStatus::Outside
        );
        assert_eq!(
            classify_location(None, Some(21.0122), &home),
            LocationStatus::Unknown
        );
        assert_eq!(classify_location(None, None, &home), LocationStatus::Unknown);
    }

    #[test]
    fn readiness_from_charging_state() {
        assert!(charging_ready(
            ChargingState::Charging,
            PortLatch::Disengaged,
            ""
        ));
        assert!(charging_ready(
            ChargingState::Complete,
            PortLatch::Unknown,
            "Unknown"
        ));
    }

    #[test]
    fn readiness_from_cable() {
        assert!(charging_ready(
            ChargingState::Stopped,
            PortLatch::Engaged,
            "IEC"
        ));
        assert!(!charging_ready(
            ChargingState::Stopped,
            PortLatch::Engaged,
            "Unknown"
        ));
        assert!(!charging_ready(
            ChargingState::Stopped,
            PortLatch::Engaged,
            "<invalid>"
        ));
        assert!(!charging_ready(ChargingState::Stopped, PortLatch::Engaged, ""));
        assert!(!charging_ready(
            ChargingState::Disconnected,
            PortLatch::Disengaged,
            "IEC"
        ));
    }

    proptest! {
        // HOME iff within the Euclidean radius; UNKNOWN iff a coordinate is absent.
        #[test]
        fn location_matches_distance(
            lat in prop::option::of(50.0f64..54.0),
            lon in prop::option::of(19.0f64..23.0),
        ) {
            let home = home();
            let status = classify_location(lat, lon, &home);
            match (lat, lon) {
                (Some(lat), Some(lon)) => {
                    let dist = ((lat - home.latitude).powi(2) + (lon - home.longitude).powi(2)).sqrt();
                    if dist <= home.radius_degrees {
                        prop_assert_eq!(status, LocationStatus::Home);
                    } else {
                        prop_assert_eq!(status, LocationStatus::Outside);
                    }
                }
                _ => prop_assert_eq!(status, LocationStatus::Unknown),
            }
        }

        // Charging/Complete always ready; otherwise only a latched, identified cable is.
        #[test]
        fn readiness_derivation(latch_engaged: bool, cable in "[A-Za-z<>]{0,8}") {
            let latch = if latch_engaged { PortLatch::Engaged } else { PortLatch::Disengaged };
            prop_assert!(charging_ready(ChargingState::Charging, latch, &cable));
            prop_assert!(charging_ready(ChargingState::Complete, latch, &cable));

            let expected = latch_engaged
                && !cable.is_empty()
                && cable != "Unknown"
                && cable != "<invalid>"
                && cable != "Invalid";
            prop_assert_eq!(charging_ready(ChargingState::Stopped, latch, &cable), expected);
        }
    }
}
