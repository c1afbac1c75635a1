use serde::{Deserialize, Serialize};

/// Highest accepted setpoint; the lower bound is exclusive zero.
pub const MAX_TARGET: i32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "UPPERCASE")]
pub enum Mode {
    Off,
    Hot(u8),
    Termo(u8),
}

impl Mode {
    pub fn kind(self) -> ModeKind {
        match self {
            Self::Off => ModeKind::Off,
            Self::Hot(_) => ModeKind::Hot,
            Self::Termo(_) => ModeKind::Termo,
        }
    }

    pub fn target(self) -> Option<u8> {
        match self {
            Self::Off => None,
            Self::Hot(target) | Self::Termo(target) => Some(target),
        }
    }

    pub fn as_str(self) -> &'static str {
        self.kind().as_str()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModeKind {
    Off,
    Hot,
    Termo,
}

impl ModeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Hot => "HOT",
            Self::Termo => "TERMO",
        }
    }
}

/// Accepts a requested setpoint when it lies in (0, 100].
pub fn validate_target(value: i32) -> Option<u8> {
    if (1..=MAX_TARGET).contains(&value) {
        u8::try_from(value).ok()
    } else {
        None
    }
}

/// Outcome of a state machine operation, one per user-visible notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaterEvent {
    ModeChanged(Mode),
    InvalidSetpoint { mode: ModeKind, value: i32 },
    ImpossibleSetpoint { target: u8, current: i32 },
    AboveTarget { target: u8, current: i32 },
    HotComplete { target: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub mode: &'static str,
    #[serde(rename = "requestedTemp")]
    pub requested_temp: Option<u8>,
    #[serde(rename = "currentTemp")]
    pub current_temp: i32,
    #[serde(rename = "heaterOn")]
    pub heater_on: bool,
    #[serde(rename = "hotTarget")]
    pub hot_target: u8,
    #[serde(rename = "termoTarget")]
    pub termo_target: u8,
}

/// Platform facts shown by `/status`. Host builds leave the radio fields zeroed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceVitals {
    pub ip: String,
    #[serde(rename = "rssiDbm")]
    pub rssi_dbm: i32,
    #[serde(rename = "freeHeapBytes")]
    pub free_heap_bytes: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn target_range_is_exclusive_zero_inclusive_hundred() {
        assert_eq!(validate_target(0), None);
        assert_eq!(validate_target(1), Some(1));
        assert_eq!(validate_target(100), Some(100));
        assert_eq!(validate_target(101), None);
        assert_eq!(validate_target(-5), None);
        assert_eq!(validate_target(i32::MAX), None);
    }

    #[test]
    fn mode_reports_kind_and_target() {
        assert_eq!(Mode::Off.target(), None);
        assert_eq!(Mode::Hot(95).target(), Some(95));
        assert_eq!(Mode::Termo(80).kind(), ModeKind::Termo);
        assert_eq!(Mode::Termo(80).as_str(), "TERMO");
    }

    #[test]
    fn status_report_uses_camel_case_keys() {
        let report = StatusReport {
            mode: "HOT",
            requested_temp: Some(100),
            current_temp: 42,
            heater_on: true,
            hot_target: 100,
            termo_target: 80,
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "mode": "HOT",
                "requestedTemp": 100,
                "currentTemp": 42,
                "heaterOn": true,
                "hotTarget": 100,
                "termoTarget": 80,
            })
        );
    }
}
