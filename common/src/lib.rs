pub mod button;
pub mod command;
pub mod config;
pub mod heater;
pub mod messages;
pub mod ports;
pub mod remote;
pub mod sampler;
pub mod telegram;
pub mod types;

pub use button::{ButtonEvent, ButtonMailbox};
pub use command::{interpret, Command};
pub use config::{BotConfig, ConfigError, NetworkConfig, TeapotConfig};
pub use heater::TeapotEngine;
pub use ports::{AnalogInput, HeaterOutput, OutputError};
pub use remote::{dispatch, poll_remote, Dispatch, RemoteOutcome};
pub use sampler::TemperatureSampler;
pub use telegram::{BotSession, BotTransport, Inbound, TelegramError, Update};
pub use types::{DeviceVitals, HeaterEvent, Mode, ModeKind, StatusReport};
