//! Volume through a named mixer element, scaled to 0..=65535 per channel.

use serde::{Deserialize, Serialize};
use wavepipe_backends::{ControlDevice, ControlError, ElementInfo};

use crate::error::EngineError;

const FULL_SCALE: i128 = u16::MAX as i128;

/// One reading of a mixer element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeReading {
    pub min: i64,
    pub max: i64,
    pub step: i64,
    pub left: u16,
    pub right: u16,
}

impl From<ControlError> for EngineError {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::ElementNotFound(name) => EngineError::ElementNotFound(name),
            ControlError::Io(message) => EngineError::Mixer(message),
        }
    }
}

// Element ranges can span most of i64, so the products are taken in i128.
fn to_normalized(raw: i64, info: &ElementInfo) -> u16 {
    let range = i128::from(info.max) - i128::from(info.min);
    if range <= 0 {
        return 0;
    }
    let offset = i128::from(raw.clamp(info.min, info.max)) - i128::from(info.min);
    (offset * FULL_SCALE / range) as u16
}

fn to_raw(volume: u16, info: &ElementInfo) -> i64 {
    let range = (i128::from(info.max) - i128::from(info.min)).max(0);
    let offset = (i128::from(volume) * range + FULL_SCALE / 2) / FULL_SCALE;
    (i128::from(info.min) + offset) as i64
}

pub struct MixerControl {
    control: Option<Box<dyn ControlDevice>>,
}

impl MixerControl {
    pub fn new(control: Option<Box<dyn ControlDevice>>) -> Self {
        Self { control }
    }

    pub fn is_available(&self) -> bool {
        self.control.is_some()
    }

    pub fn get(&self, element: &str) -> Result<VolumeReading, EngineError> {
        let control = self.control.as_ref().ok_or(EngineError::NoMixer)?;
        let info = control.element_info(element)?;
        let values = control.read_integers(element)?;
        let left = values
            .first()
            .copied()
            .ok_or_else(|| EngineError::Mixer(format!("{element} has no values")))?;
        // Mono elements report the same level on both channels.
        let right = values.get(1).copied().unwrap_or(left);
        Ok(VolumeReading {
            min: info.min,
            max: info.max,
            step: info.step,
            left: to_normalized(left, &info),
            right: to_normalized(right, &info),
        })
    }

    /// Sets either or both channels; a `None` channel keeps its level.
    pub fn set(
        &mut self,
        element: &str,
        left: Option<u16>,
        right: Option<u16>,
    ) -> Result<(), EngineError> {
        let control = self.control.as_mut().ok_or(EngineError::NoMixer)?;
        let info = control.element_info(element)?;
        let mut values = control.read_integers(element)?;
        if values.is_empty() {
            return Err(EngineError::Mixer(format!("{element} has no values")));
        }
        if values.len() == 1 {
            if let Some(volume) = left.or(right) {
                values[0] = to_raw(volume, &info);
            }
        } else {
            if let Some(volume) = left {
                values[0] = to_raw(volume, &info);
            }
            if let Some(volume) = right {
                values[1] = to_raw(volume, &info);
            }
        }
        tracing::trace!(element, ?values, "writing mixer element");
        control.write_integers(element, &values)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wavepipe_backends::SimulatedControl;

    fn info(count: usize) -> ElementInfo {
        ElementInfo {
            min: 0,
            max: 31,
            step: 1,
            count,
        }
    }

    #[test]
    fn readings_scale_to_full_range() {
        let control = SimulatedControl::new().with_element("PCM", info(2), 31);
        let mixer = MixerControl::new(Some(Box::new(control)));
        let reading = mixer.get("PCM").unwrap();
        assert_eq!((reading.left, reading.right), (65535, 65535));
        assert_eq!((reading.min, reading.max, reading.step), (0, 31, 1));
    }

    #[test]
    fn writes_round_to_the_nearest_step() {
        let control = SimulatedControl::new().with_element("PCM", info(2), 0);
        let mut mixer = MixerControl::new(Some(Box::new(control.clone())));
        mixer.set("PCM", Some(32768), None).unwrap();
        assert_eq!(control.values("PCM"), Some(vec![16, 0]));
        assert_eq!(mixer.get("PCM").unwrap().left, 33824);
    }

    #[test]
    fn mono_elements_mirror_both_channels() {
        let control = SimulatedControl::new().with_element("Master", info(1), 0);
        let mut mixer = MixerControl::new(Some(Box::new(control)));
        mixer.set("Master", None, Some(65535)).unwrap();
        let reading = mixer.get("Master").unwrap();
        assert_eq!((reading.left, reading.right), (65535, 65535));
    }

    #[test]
    fn missing_control_and_element_are_distinct() {
        let mixer = MixerControl::new(None);
        assert_eq!(mixer.get("PCM"), Err(EngineError::NoMixer));

        let mixer = MixerControl::new(Some(Box::new(SimulatedControl::new())));
        assert_eq!(
            mixer.get("PCM"),
            Err(EngineError::ElementNotFound("PCM".into()))
        );
    }

    #[test]
    fn offset_ranges_map_to_zero() {
        let info = ElementInfo {
            min: -40,
            max: 0,
            step: 1,
            count: 2,
        };
        assert_eq!(to_normalized(-40, &info), 0);
        assert_eq!(to_raw(0, &info), -40);
        assert_eq!(to_raw(65535, &info), 0);
    }

    #[test]
    fn full_width_ranges_do_not_overflow() {
        let info = ElementInfo {
            min: i64::MIN,
            max: i64::MAX,
            step: 1,
            count: 1,
        };
        assert_eq!(to_normalized(i64::MIN, &info), 0);
        assert_eq!(to_normalized(i64::MAX, &info), 65535);
        assert_eq!(to_normalized(0, &info), 32767);
        assert_eq!(to_raw(0, &info), i64::MIN);
        assert_eq!(to_raw(65535, &info), i64::MAX);
    }
}
