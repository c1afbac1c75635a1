use crate::{config::TeapotConfig, ports::AnalogInput};

/// Rate-limited, averaged temperature estimate in whole degrees.
#[derive(Debug)]
pub struct TemperatureSampler<A> {
    input: A,
    interval_ms: u64,
    count: u16,
    divisor: f32,
    last_sample_ms: Option<u64>,
    current: i32,
}

impl<A: AnalogInput> TemperatureSampler<A> {
    pub fn new(input: A, config: &TeapotConfig) -> Self {
        Self {
            input,
            interval_ms: config.sample_interval_ms.max(1),
            count: config.sample_count.max(1),
            divisor: config.adc_divisor,
            last_sample_ms: None,
            current: 0,
        }
    }

    /// Returns the latest estimate, acquiring a fresh one when the interval
    /// has elapsed (always on the first call).
    pub fn sample(&mut self, now_ms: u64) -> i32 {
        if let Some(last) = self.last_sample_ms {
            if now_ms.saturating_sub(last) < self.interval_ms {
                return self.current;
            }
        }

        self.last_sample_ms = Some(now_ms);
        if let Some(temp) = self.acquire() {
            self.current = temp;
        }
        self.current
    }

    pub fn current(&self) -> i32 {
        self.current
    }

    /// Averages the conversions that succeeded. Failed ones are left out of
    /// the mean; `None` when all of them failed.
    fn acquire(&mut self) -> Option<i32> {
        let (sum, ok) = (0..self.count)
            .filter_map(|_| self.input.read_raw())
            .fold((0_u32, 0_u32), |(sum, ok), raw| (sum + u32::from(raw), ok + 1));
        if ok == 0 {
            return None;
        }
        // Integer mean first, then scale; truncates toward zero.
        let mean = sum / ok;
        Some((mean as f32 / self.divisor) as i32)
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Clone, Default)]
    struct FakeAdc {
        value: Rc<Cell<u16>>,
        reads: Rc<Cell<usize>>,
    }

    impl AnalogInput for FakeAdc {
        fn read_raw(&mut self) -> Option<u16> {
            self.reads.set(self.reads.get() + 1);
            Some(self.value.get())
        }
    }

    struct ScriptedAdc {
        values: Vec<Option<u16>>,
        next: usize,
    }

    impl ScriptedAdc {
        fn readings(values: &[u16]) -> Self {
            Self {
                values: values.iter().copied().map(Some).collect(),
                next: 0,
            }
        }
    }

    impl AnalogInput for ScriptedAdc {
        fn read_raw(&mut self) -> Option<u16> {
            let value = self.values[self.next % self.values.len()];
            self.next += 1;
            value
        }
    }

    #[test]
    fn first_call_acquires_ten_readings() {
        let adc = FakeAdc::default();
        adc.value.set(640);
        let mut sampler = TemperatureSampler::new(adc.clone(), &TeapotConfig::default());

        assert_eq!(sampler.sample(0), 80);
        assert_eq!(adc.reads.get(), 10);
    }

    #[test]
    fn holds_value_until_interval_elapses() {
        let adc = FakeAdc::default();
        adc.value.set(160);
        let mut sampler = TemperatureSampler::new(adc.clone(), &TeapotConfig::default());
        assert_eq!(sampler.sample(1_000), 20);

        adc.value.set(800);
        assert_eq!(sampler.sample(1_249), 20);
        assert_eq!(adc.reads.get(), 10);

        assert_eq!(sampler.sample(1_250), 100);
        assert_eq!(adc.reads.get(), 20);
        assert_eq!(sampler.current(), 100);
    }

    #[test]
    fn mean_is_truncated_before_and_after_scaling() {
        // sum 6479 -> mean 647 -> 80.875 -> 80
        let mut values = vec![648; 9];
        values.push(647);
        let sum: u32 = values.iter().map(|v| u32::from(*v)).sum();
        assert_eq!(sum, 6_479);
        let adc = ScriptedAdc::readings(&values);
        let mut sampler = TemperatureSampler::new(adc, &TeapotConfig::default());

        assert_eq!(sampler.sample(0), 80);
    }

    #[test]
    fn full_scale_reading() {
        let adc = ScriptedAdc::readings(&[1023]);
        let mut sampler = TemperatureSampler::new(adc, &TeapotConfig::default());

        assert_eq!(sampler.sample(0), 127);
    }

    #[test]
    fn failed_conversions_are_left_out_of_the_mean() {
        let mut values = vec![Some(640); 7];
        values.extend([None, None, None]);
        let adc = ScriptedAdc { values, next: 0 };
        let mut sampler = TemperatureSampler::new(adc, &TeapotConfig::default());

        assert_eq!(sampler.sample(0), 80);
    }

    #[test]
    fn all_conversions_failing_keeps_last_estimate() {
        let mut values = vec![Some(720); 10];
        values.extend([None; 10]);
        let adc = ScriptedAdc { values, next: 0 };
        let mut sampler = TemperatureSampler::new(adc, &TeapotConfig::default());
        assert_eq!(sampler.sample(0), 90);

        assert_eq!(sampler.sample(250), 90);
        assert_eq!(sampler.current(), 90);
    }
}
