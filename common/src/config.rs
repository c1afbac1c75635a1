use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{command::parse_leading_int, types::MAX_TARGET};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeapotConfig {
    pub sample_interval_ms: u64,
    pub sample_count: u16,
    pub adc_divisor: f32,
    pub hysteresis: u8,
    pub long_press_ms: u32,
    pub default_hot_target: u8,
    pub default_termo_target: u8,
    pub bot_polling_interval_ms: u64,
    pub provisioning_timeout_sec: u64,
}

impl Default for TeapotConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 250,
            sample_count: 10,
            adc_divisor: 8.0,
            hysteresis: 10,
            long_press_ms: 500,
            default_hot_target: 100,
            default_termo_target: 80,
            bot_polling_interval_ms: 1_000,
            provisioning_timeout_sec: 180,
        }
    }
}

impl TeapotConfig {
    pub fn sanitize(&mut self) {
        let max = MAX_TARGET as u8;
        self.default_hot_target = self.default_hot_target.clamp(1, max);
        self.default_termo_target = self.default_termo_target.clamp(1, max);
        self.sample_count = self.sample_count.max(1);
        self.sample_interval_ms = self.sample_interval_ms.max(1);
        self.bot_polling_interval_ms = self.bot_polling_interval_ms.max(1);
        self.long_press_ms = self.long_press_ms.max(1);

        if !self.adc_divisor.is_finite() || self.adc_divisor <= 0.0 {
            self.adc_divisor = 8.0;
        }
    }
}

/// Telegram credentials, persisted as `{"bot_token": .., "chat_id": ..}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub bot_token: String,
    pub chat_id: String,
}

impl BotConfig {
    pub fn from_json(raw: &[u8]) -> Result<Self, ConfigError> {
        let mut config: Self = serde_json::from_slice(raw)?;
        config.sanitize();
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn sanitize(&mut self) {
        self.bot_token = self.bot_token.trim().to_string();
        self.chat_id = self.chat_id.trim().to_string();
    }

    /// Remote control runs only with both a token and an authorized chat.
    pub fn remote_enabled(&self) -> bool {
        !self.bot_token.is_empty() && !self.chat_id.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub ota_password: String,
}

impl NetworkConfig {
    pub fn has_station_credentials(&self) -> bool {
        !self.wifi_ssid.trim().is_empty()
    }
}

/// Parses the persisted last-message id. Garbage or non-positive values mean
/// "no checkpoint".
pub fn parse_checkpoint(raw: &str) -> Option<i64> {
    let id = parse_leading_int(raw);
    (id > 0).then_some(id)
}
