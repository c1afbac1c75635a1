//! Hardware seams used by the engine and sampler. The ESP firmware backs
//! these with ADC and GPIO drivers; the host build backs them with a
//! simulated kettle.

use thiserror::Error;

#[derive(Debug, Error)]
#[error("heater output write failed: {0}")]
pub struct OutputError(pub String);

/// One-shot reader for the thermistor divider.
pub trait AnalogInput {
    /// A single raw conversion, 10-bit scale. `None` when the conversion
    /// failed.
    fn read_raw(&mut self) -> Option<u16>;
}

/// The relay that switches the heating element.
pub trait HeaterOutput {
    fn set_heater(&mut self, on: bool) -> Result<(), OutputError>;
}
