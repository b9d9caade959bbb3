//! The closed set of controllable devices and their ON/OFF state.
//!
//! Device names are API identifiers; anything outside [`Device::ALL`] is
//! rejected at the handler boundary and never reaches storage.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Device names
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Fan,
    Pump,
    PlantLight,
    Automation,
    /// Pre-rename alias for the automation toggle. Old clients still write
    /// it; it keeps its own row and has no scheduler side effect.
    Autobot,
}

impl Device {
    pub const ALL: [Device; 5] = [
        Device::Fan,
        Device::Pump,
        Device::PlantLight,
        Device::Automation,
        Device::Autobot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Fan => "fan",
            Device::Pump => "pump",
            Device::PlantLight => "plantLight",
            Device::Automation => "automation",
            Device::Autobot => "autobot",
        }
    }
}

impl FromStr for Device {
    type Err = ();

    /// Exact-match parse; device names are case-sensitive API identifiers.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fan" => Ok(Device::Fan),
            "pump" => Ok(Device::Pump),
            "plantLight" => Ok(Device::PlantLight),
            "automation" => Ok(Device::Automation),
            "autobot" => Ok(Device::Autobot),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ON/OFF state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceState {
    On,
    Off,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::On => "ON",
            DeviceState::Off => "OFF",
        }
    }

    pub fn is_on(&self) -> bool {
        matches!(self, DeviceState::On)
    }
}

impl FromStr for DeviceState {
    type Err = ();

    /// Case-insensitive, trims whitespace.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "ON" => Ok(DeviceState::On),
            "OFF" => Ok(DeviceState::Off),
            _ => Err(()),
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- Device parsing -----------------------------------------------------

    #[test]
    fn device_parse_known_names() {
        assert_eq!("fan".parse(), Ok(Device::Fan));
        assert_eq!("pump".parse(), Ok(Device::Pump));
        assert_eq!("plantLight".parse(), Ok(Device::PlantLight));
        assert_eq!("automation".parse(), Ok(Device::Automation));
        assert_eq!("autobot".parse(), Ok(Device::Autobot));
    }

    #[test]
    fn device_parse_unknown_name() {
        assert!("heater".parse::<Device>().is_err());
        assert!("".parse::<Device>().is_err());
    }

    #[test]
    fn device_parse_is_case_sensitive() {
        assert!("Fan".parse::<Device>().is_err());
        assert!("plantlight".parse::<Device>().is_err());
        assert!("AUTOMATION".parse::<Device>().is_err());
    }

    #[test]
    fn device_all_round_trips() {
        for d in Device::ALL {
            assert_eq!(d.as_str().parse(), Ok(d));
        }
    }

    // -- State parsing ------------------------------------------------------

    #[test]
    fn state_parse_uppercase() {
        assert_eq!("ON".parse(), Ok(DeviceState::On));
        assert_eq!("OFF".parse(), Ok(DeviceState::Off));
    }

    #[test]
    fn state_parse_mixed_case_and_whitespace() {
        assert_eq!("on".parse(), Ok(DeviceState::On));
        assert_eq!(" oFf ".parse(), Ok(DeviceState::Off));
        assert_eq!("\tON\n".parse(), Ok(DeviceState::On));
    }

    #[test]
    fn state_parse_garbage() {
        assert!("TOGGLE".parse::<DeviceState>().is_err());
        assert!("".parse::<DeviceState>().is_err());
    }

    #[test]
    fn state_serializes_as_wire_string() {
        assert_eq!(serde_json::to_value(DeviceState::On).unwrap(), "ON");
        assert_eq!(serde_json::to_value(DeviceState::Off).unwrap(), "OFF");
    }
}
