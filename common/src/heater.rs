use crate::{
    button::ButtonEvent,
    config::TeapotConfig,
    ports::HeaterOutput,
    types::{validate_target, HeaterEvent, Mode, ModeKind, StatusReport},
};

/// Owns the mode, the setpoints and the heater output. Every mode change goes
/// through the `request_*` operations, `tick` or `apply_button`.
#[derive(Debug)]
pub struct TeapotEngine<H> {
    config: TeapotConfig,
    heater: H,

    mode: Mode,
    hot_target: u8,
    termo_target: u8,
    last_temp: i32,
    heater_on: bool,
}

impl<H: HeaterOutput> TeapotEngine<H> {
    pub fn new(mut config: TeapotConfig, mut heater: H) -> Self {
        config.sanitize();
        // An unconfirmed relay counts as energized so the next tick retries.
        let heater_on = heater.set_heater(false).is_err();
        Self {
            hot_target: config.default_hot_target,
            termo_target: config.default_termo_target,
            config,
            heater,
            mode: Mode::Off,
            last_temp: 0,
            heater_on,
        }
    }

    pub fn config(&self) -> &TeapotConfig {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn hot_target(&self) -> u8 {
        self.hot_target
    }

    pub fn termo_target(&self) -> u8 {
        self.termo_target
    }

    pub fn last_temp(&self) -> i32 {
        self.last_temp
    }

    pub fn is_heater_on(&self) -> bool {
        self.heater_on
    }

    pub fn heater(&self) -> &H {
        &self.heater
    }

    /// Records a fresh reading without running the control law, so button and
    /// remote requests see the current temperature.
    pub fn observe_temperature(&mut self, temp: i32) {
        self.last_temp = temp;
    }

    pub fn request_hot(&mut self, target: i32) -> Vec<HeaterEvent> {
        let Some(target) = validate_target(target) else {
            return vec![HeaterEvent::InvalidSetpoint {
                mode: ModeKind::Hot,
                value: target,
            }];
        };

        if self.last_temp > i32::from(target) {
            return vec![HeaterEvent::ImpossibleSetpoint {
                target,
                current: self.last_temp,
            }];
        }

        self.hot_target = target;
        self.mode = Mode::Hot(target);
        self.energize(true);
        vec![HeaterEvent::ModeChanged(self.mode)]
    }

    pub fn request_termo(&mut self, target: i32) -> Vec<HeaterEvent> {
        let Some(target) = validate_target(target) else {
            return vec![HeaterEvent::InvalidSetpoint {
                mode: ModeKind::Termo,
                value: target,
            }];
        };

        self.termo_target = target;
        self.mode = Mode::Termo(target);

        let mut events = Vec::with_capacity(2);
        if self.last_temp > i32::from(target) {
            events.push(HeaterEvent::AboveTarget {
                target,
                current: self.last_temp,
            });
            self.energize(false);
        } else {
            self.energize(true);
        }
        events.push(HeaterEvent::ModeChanged(self.mode));
        events
    }

    pub fn request_off(&mut self) -> Vec<HeaterEvent> {
        self.mode = Mode::Off;
        self.energize(false);
        vec![HeaterEvent::ModeChanged(Mode::Off)]
    }

    /// Periodic control law. Also re-drives the relay when an earlier write
    /// did not go through.
    pub fn tick(&mut self, current_temp: i32) -> Vec<HeaterEvent> {
        self.last_temp = current_temp;

        match self.mode {
            Mode::Hot(target) if current_temp >= i32::from(target) => {
                let mut events = vec![HeaterEvent::HotComplete { target }];
                events.extend(self.request_off());
                events
            }
            Mode::Termo(target) => {
                let target = i32::from(target);
                if current_temp >= target {
                    self.energize(false);
                } else if current_temp < target - i32::from(self.config.hysteresis) {
                    self.energize(true);
                }
                Vec::new()
            }
            Mode::Hot(_) => {
                self.energize(true);
                Vec::new()
            }
            Mode::Off => {
                self.energize(false);
                Vec::new()
            }
        }
    }

    pub fn apply_button(&mut self, event: ButtonEvent) -> Vec<HeaterEvent> {
        match (self.mode, event) {
            (Mode::Off, ButtonEvent::ShortPress) => {
                if self.last_temp < i32::from(self.hot_target) {
                    self.request_hot(i32::from(self.config.default_hot_target))
                } else {
                    self.request_off()
                }
            }
            (Mode::Off, ButtonEvent::LongPress) => {
                self.request_termo(i32::from(self.config.default_termo_target))
            }
            (Mode::Hot(_) | Mode::Termo(_), _) => self.request_off(),
        }
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            mode: self.mode.as_str(),
            requested_temp: self.mode.target(),
            current_temp: self.last_temp,
            heater_on: self.heater_on,
            hot_target: self.hot_target,
            termo_target: self.termo_target,
        }
    }

    /// Writes only on change. `heater_on` follows confirmed writes.
    fn energize(&mut self, on: bool) {
        if self.heater_on != on && self.heater.set_heater(on).is_ok() {
            self.heater_on = on;
        }
    }
}
