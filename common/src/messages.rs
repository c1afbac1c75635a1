//! User-facing notification texts.

use crate::{
    config::TeapotConfig,
    types::{DeviceVitals, HeaterEvent, Mode, ModeKind, StatusReport},
};

pub const DEVICE_NAME: &str = "Teapot";
pub const UNAUTHORIZED: &str = "Sorry, you are not authorized to use this bot.";
pub const RESTARTING: &str = "Restarting...";

pub fn welcome_text(config: &TeapotConfig) -> String {
    format!(
        "Welcome to {DEVICE_NAME}!\n\
         /help - this message\n\
         /status - device status\n\
         /restart - restart the device\n\
         /hot - Hot mode (boil to {hot} C)\n\
         /termo - Termo mode (hold {termo} C)\n\
         /off - turn all modes off\n\
         /h<t> - Hot mode to t C, e.g. /h95\n\
         /t<t> - Termo mode at t C, e.g. /t50",
        hot = config.default_hot_target,
        termo = config.default_termo_target,
    )
}

pub fn ready_text() -> String {
    format!("{DEVICE_NAME} Ready")
}

pub fn invalid_command_text(text: &str) -> String {
    format!("Invalid command: {text}")
}

pub fn event_text(event: &HeaterEvent) -> String {
    match event {
        HeaterEvent::ModeChanged(Mode::Hot(target)) => format!("Set HOT mode to {target} C"),
        HeaterEvent::ModeChanged(Mode::Termo(target)) => format!("Set TERMO mode to {target} C"),
        HeaterEvent::ModeChanged(Mode::Off) => "All modes are OFF".to_string(),
        HeaterEvent::InvalidSetpoint { mode, .. } => match mode {
            ModeKind::Termo => "Invalid TERMO value".to_string(),
            ModeKind::Hot | ModeKind::Off => "Invalid HOT value".to_string(),
        },
        HeaterEvent::ImpossibleSetpoint { .. } => {
            "Impossible to set HOT mode, value above current temp".to_string()
        }
        HeaterEvent::AboveTarget { .. } => "Current temp above requested".to_string(),
        HeaterEvent::HotComplete { .. } => "Hot complete".to_string(),
    }
}

pub fn status_text(report: &StatusReport, vitals: &DeviceVitals) -> String {
    let requested = report
        .requested_temp
        .map_or_else(|| "--".to_string(), |target| target.to_string());
    format!(
        "Device Status:\n\
         IP: {ip}\n\
         RSSI: {rssi} dBm\n\
         Free Heap: {heap} bytes\n\
         Mode: {mode}\n\
         Requested temp: {requested} C\n\
         Current temp: {current} C",
        ip = vitals.ip,
        rssi = vitals.rssi_dbm,
        heap = vitals.free_heap_bytes,
        mode = report.mode,
        current = report.current_temp,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn event_texts() {
        assert_eq!(
            event_text(&HeaterEvent::ModeChanged(Mode::Hot(95))),
            "Set HOT mode to 95 C"
        );
        assert_eq!(
            event_text(&HeaterEvent::ModeChanged(Mode::Termo(80))),
            "Set TERMO mode to 80 C"
        );
        assert_eq!(
            event_text(&HeaterEvent::ModeChanged(Mode::Off)),
            "All modes are OFF"
        );
        assert_eq!(
            event_text(&HeaterEvent::InvalidSetpoint {
                mode: ModeKind::Termo,
                value: 0
            }),
            "Invalid TERMO value"
        );
        assert_eq!(
            event_text(&HeaterEvent::InvalidSetpoint {
                mode: ModeKind::Hot,
                value: 101
            }),
            "Invalid HOT value"
        );
        assert_eq!(
            event_text(&HeaterEvent::HotComplete { target: 100 }),
            "Hot complete"
        );
    }

    #[test]
    fn status_text_layout() {
        let report = StatusReport {
            mode: "OFF",
            requested_temp: None,
            current_temp: 23,
            heater_on: false,
            hot_target: 100,
            termo_target: 80,
        };
        let vitals = DeviceVitals {
            ip: "192.168.1.40".to_string(),
            rssi_dbm: -61,
            free_heap_bytes: 181_220,
        };

        assert_eq!(
            status_text(&report, &vitals),
            "Device Status:\nIP: 192.168.1.40\nRSSI: -61 dBm\nFree Heap: 181220 bytes\n\
             Mode: OFF\nRequested temp: -- C\nCurrent temp: 23 C"
        );
    }

    #[test]
    fn welcome_lists_configured_defaults() {
        let text = welcome_text(&TeapotConfig::default());
        assert!(text.starts_with("Welcome to Teapot!"));
        assert!(text.contains("/hot - Hot mode (boil to 100 C)"));
        assert!(text.contains("/termo - Termo mode (hold 80 C)"));
        assert_eq!(ready_text(), "Teapot Ready");
    }
}
