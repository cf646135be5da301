/*!
 * Device profiles: which states and commands a kind of device declares.
 */
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use homeflow_core::types::{CommandKind, State, StateKind};

use crate::error::{Error, Result};

/// Kind of device, determining its declared states and commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Accepts every state
    #[default]
    Generic,
    /// Dimmable light
    Light,
    /// Motion sensor
    Motion,
    /// Light sensor
    Photocell,
    /// Door or window contact
    Door,
    /// Lock
    Lock,
    /// Occupancy of a room
    Room,
    /// On/off switch
    Switch,
}

const META: [CommandKind; 6] = [
    CommandKind::Previous,
    CommandKind::Toggle,
    CommandKind::Initial,
    CommandKind::Automatic,
    CommandKind::Manual,
    CommandKind::Status,
];

impl DeviceKind {
    /// The name used in configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Generic => "generic",
            DeviceKind::Light => "light",
            DeviceKind::Motion => "motion",
            DeviceKind::Photocell => "photocell",
            DeviceKind::Door => "door",
            DeviceKind::Lock => "lock",
            DeviceKind::Room => "room",
            DeviceKind::Switch => "switch",
        }
    }

    /// The states a device of this kind may hold, besides UNKNOWN
    pub fn declared_states(&self) -> &'static [StateKind] {
        match self {
            DeviceKind::Generic => &StateKind::ALL,
            DeviceKind::Light => &[StateKind::On, StateKind::Off, StateKind::Level],
            DeviceKind::Switch => &[StateKind::On, StateKind::Off],
            DeviceKind::Motion => &[StateKind::Motion, StateKind::Still],
            DeviceKind::Photocell => &[StateKind::Light, StateKind::Dark],
            DeviceKind::Door => &[StateKind::Open, StateKind::Closed],
            DeviceKind::Lock => &[StateKind::Locked, StateKind::Unlocked],
            DeviceKind::Room => &[StateKind::Occupied, StateKind::Vacant],
        }
    }

    /// The commands a device of this kind documents.
    ///
    /// Informational only; commands are never rejected on this basis.
    pub fn declared_commands(&self) -> Vec<CommandKind> {
        let mut commands: Vec<CommandKind> = match self {
            DeviceKind::Generic => CommandKind::ALL.to_vec(),
            DeviceKind::Light => vec![CommandKind::On, CommandKind::Off, CommandKind::Level],
            DeviceKind::Switch => vec![CommandKind::On, CommandKind::Off],
            DeviceKind::Motion => vec![CommandKind::Motion, CommandKind::Still],
            DeviceKind::Photocell => vec![CommandKind::Light, CommandKind::Dark],
            DeviceKind::Door => vec![CommandKind::Open, CommandKind::Close],
            DeviceKind::Lock => vec![CommandKind::Lock, CommandKind::Unlock],
            DeviceKind::Room => vec![CommandKind::Occupy, CommandKind::Vacate],
        };
        for meta in META {
            if !commands.contains(&meta) {
                commands.push(meta);
            }
        }
        commands
    }

    /// Whether a device of this kind may hold a state
    pub fn accepts(&self, state: State) -> bool {
        state == State::Unknown || self.declared_states().contains(&state.kind())
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let kind = match s.trim().to_lowercase().as_str() {
            "generic" => DeviceKind::Generic,
            "light" => DeviceKind::Light,
            "motion" => DeviceKind::Motion,
            "photocell" => DeviceKind::Photocell,
            "door" => DeviceKind::Door,
            "lock" => DeviceKind::Lock,
            "room" => DeviceKind::Room,
            "switch" => DeviceKind::Switch,
            other => return Err(Error::configuration(format!("Unknown device kind: {}", other))),
        };
        Ok(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_declared_states() {
        assert!(DeviceKind::Light.accepts(State::Level(30)));
        assert!(DeviceKind::Light.accepts(State::Unknown));
        assert!(!DeviceKind::Light.accepts(State::Dark));
        assert!(DeviceKind::Door.accepts(State::Closed));
        assert!(!DeviceKind::Switch.accepts(State::Level(10)));
        assert!(DeviceKind::Generic.accepts(State::Occupied));
    }

    #[test]
    fn test_declared_commands_include_meta() {
        let commands = DeviceKind::Photocell.declared_commands();
        assert!(commands.contains(&CommandKind::Dark));
        assert!(commands.contains(&CommandKind::Status));
        assert!(!commands.contains(&CommandKind::On));
        assert_eq!(DeviceKind::Generic.declared_commands().len(), CommandKind::ALL.len());
    }

    #[test]
    fn test_parse() {
        assert_eq!("Photocell".parse::<DeviceKind>().unwrap(), DeviceKind::Photocell);
        assert!("toaster".parse::<DeviceKind>().is_err());
        let kind: DeviceKind = serde_json::from_str("\"room\"").unwrap();
        assert_eq!(kind, DeviceKind::Room);
    }
}
