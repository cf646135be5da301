/*!
 * Core data types for HomeFlow.
 *
 * This module defines the command and state vocabulary shared by devices,
 * drivers and the rule engine, along with the stable handles used to refer
 * to devices and drivers.
 */
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Stable handle of a device inside the registry arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(u32);

impl DeviceId {
    /// Create a handle from a registry index
    pub fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    /// Get the registry index of the handle
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device#{}", self.0)
    }
}

static NEXT_DRIVER_ID: AtomicU32 = AtomicU32::new(1);

/// Stable handle of a driver instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DriverId(u32);

impl DriverId {
    /// Allocate a fresh driver handle
    pub fn next() -> Self {
        Self(NEXT_DRIVER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for DriverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "driver#{}", self.0)
    }
}

/// A driver-specific hardware address.
///
/// Addresses are compared case-insensitively with surrounding whitespace
/// removed, so `"19.05.7b"` and `"19.05.7B "` refer to the same unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Create a normalized address
    pub fn new<S: AsRef<str>>(address: S) -> Self {
        Self(address.as_ref().trim().to_uppercase())
    }

    /// Get the normalized string form
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether a raw address refers to this one
    pub fn matches(&self, other: &Address) -> bool {
        self.0 == other.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Address {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}

/// A command understood by devices and drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Command {
    /// Switch on
    On,
    /// Switch off
    Off,
    /// Dim to a level between 0 and 100
    Level(u8),
    /// Motion detected
    Motion,
    /// No motion
    Still,
    /// Ambient light detected
    Light,
    /// Darkness detected
    Dark,
    /// Open
    Open,
    /// Close
    Close,
    /// Activate
    Activate,
    /// Deactivate
    Deactivate,
    /// Mark occupied
    Occupy,
    /// Mark vacant
    Vacate,
    /// Lock
    Lock,
    /// Unlock
    Unlock,
    /// Return to the previous distinct state
    Previous,
    /// Flip between on and off
    Toggle,
    /// Return to the configured initial state
    Initial,
    /// Resume automatic scheduling
    Automatic,
    /// Hold the device manually, suspending automatic scheduling
    Manual,
    /// Poll without changing state
    Status,
}

/// Payload-free discriminant of a [`Command`], used as a rule key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum CommandKind {
    On,
    Off,
    Level,
    Motion,
    Still,
    Light,
    Dark,
    Open,
    Close,
    Activate,
    Deactivate,
    Occupy,
    Vacate,
    Lock,
    Unlock,
    Previous,
    Toggle,
    Initial,
    Automatic,
    Manual,
    Status,
}

impl CommandKind {
    /// Every command kind, in declaration order
    pub const ALL: [CommandKind; 21] = [
        CommandKind::On,
        CommandKind::Off,
        CommandKind::Level,
        CommandKind::Motion,
        CommandKind::Still,
        CommandKind::Light,
        CommandKind::Dark,
        CommandKind::Open,
        CommandKind::Close,
        CommandKind::Activate,
        CommandKind::Deactivate,
        CommandKind::Occupy,
        CommandKind::Vacate,
        CommandKind::Lock,
        CommandKind::Unlock,
        CommandKind::Previous,
        CommandKind::Toggle,
        CommandKind::Initial,
        CommandKind::Automatic,
        CommandKind::Manual,
        CommandKind::Status,
    ];

    /// Get the canonical token
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::On => "ON",
            CommandKind::Off => "OFF",
            CommandKind::Level => "LEVEL",
            CommandKind::Motion => "MOTION",
            CommandKind::Still => "STILL",
            CommandKind::Light => "LIGHT",
            CommandKind::Dark => "DARK",
            CommandKind::Open => "OPEN",
            CommandKind::Close => "CLOSE",
            CommandKind::Activate => "ACTIVATE",
            CommandKind::Deactivate => "DEACTIVATE",
            CommandKind::Occupy => "OCCUPY",
            CommandKind::Vacate => "VACATE",
            CommandKind::Lock => "LOCK",
            CommandKind::Unlock => "UNLOCK",
            CommandKind::Previous => "PREVIOUS",
            CommandKind::Toggle => "TOGGLE",
            CommandKind::Initial => "INITIAL",
            CommandKind::Automatic => "AUTOMATIC",
            CommandKind::Manual => "MANUAL",
            CommandKind::Status => "STATUS",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let token = s.trim().to_uppercase();
        CommandKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == token)
            .ok_or_else(|| Error::parse(format!("Unknown command: {}", s)))
    }
}

impl Command {
    /// Get the payload-free kind of the command
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::On => CommandKind::On,
            Command::Off => CommandKind::Off,
            Command::Level(_) => CommandKind::Level,
            Command::Motion => CommandKind::Motion,
            Command::Still => CommandKind::Still,
            Command::Light => CommandKind::Light,
            Command::Dark => CommandKind::Dark,
            Command::Open => CommandKind::Open,
            Command::Close => CommandKind::Close,
            Command::Activate => CommandKind::Activate,
            Command::Deactivate => CommandKind::Deactivate,
            Command::Occupy => CommandKind::Occupy,
            Command::Vacate => CommandKind::Vacate,
            Command::Lock => CommandKind::Lock,
            Command::Unlock => CommandKind::Unlock,
            Command::Previous => CommandKind::Previous,
            Command::Toggle => CommandKind::Toggle,
            Command::Initial => CommandKind::Initial,
            Command::Automatic => CommandKind::Automatic,
            Command::Manual => CommandKind::Manual,
            Command::Status => CommandKind::Status,
        }
    }

    /// Whether the command is resolved against device history rather than a table
    pub fn is_meta(&self) -> bool {
        matches!(
            self,
            Command::Previous
                | Command::Toggle
                | Command::Initial
                | Command::Automatic
                | Command::Manual
                | Command::Status
        )
    }

    /// The state a plain command resolves to. Meta-commands have none.
    pub fn target_state(&self) -> Option<State> {
        let state = match self {
            Command::On => State::On,
            Command::Off => State::Off,
            Command::Level(0) => State::Off,
            Command::Level(level) => State::Level(*level),
            Command::Motion => State::Motion,
            Command::Still => State::Still,
            Command::Light => State::Light,
            Command::Dark => State::Dark,
            Command::Open => State::Open,
            Command::Close => State::Closed,
            Command::Activate => State::Active,
            Command::Deactivate => State::Inactive,
            Command::Occupy => State::Occupied,
            Command::Vacate => State::Vacant,
            Command::Lock => State::Locked,
            Command::Unlock => State::Unlocked,
            _ => return None,
        };
        Some(state)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Level(level) => write!(f, "LEVEL:{}", level),
            other => f.write_str(other.kind().as_str()),
        }
    }
}

/// Split `"LEVEL:30"`, `"level,30"` or `"LEVEL 30"` into token and payload
fn split_payload(s: &str) -> (&str, Option<&str>) {
    let s = s.trim();
    match s
        .char_indices()
        .find(|&(_, c)| c == ':' || c == ',' || c.is_whitespace())
    {
        Some((at, c)) => (&s[..at], Some(s[at + c.len_utf8()..].trim())),
        None => (s, None),
    }
}

fn parse_level(raw: Option<&str>, input: &str) -> Result<u8> {
    let raw = raw.ok_or_else(|| Error::parse(format!("Missing level in {}", input)))?;
    let level: u8 = raw
        .parse()
        .map_err(|_| Error::parse(format!("Invalid level in {}", input)))?;
    if level > 100 {
        return Err(Error::parse(format!("Level out of range in {}", input)));
    }
    Ok(level)
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (token, payload) = split_payload(s);
        let kind: CommandKind = token.parse()?;
        let command = match kind {
            CommandKind::Level => Command::Level(parse_level(payload, s)?),
            CommandKind::On => Command::On,
            CommandKind::Off => Command::Off,
            CommandKind::Motion => Command::Motion,
            CommandKind::Still => Command::Still,
            CommandKind::Light => Command::Light,
            CommandKind::Dark => Command::Dark,
            CommandKind::Open => Command::Open,
            CommandKind::Close => Command::Close,
            CommandKind::Activate => Command::Activate,
            CommandKind::Deactivate => Command::Deactivate,
            CommandKind::Occupy => Command::Occupy,
            CommandKind::Vacate => Command::Vacate,
            CommandKind::Lock => Command::Lock,
            CommandKind::Unlock => Command::Unlock,
            CommandKind::Previous => Command::Previous,
            CommandKind::Toggle => Command::Toggle,
            CommandKind::Initial => Command::Initial,
            CommandKind::Automatic => Command::Automatic,
            CommandKind::Manual => Command::Manual,
            CommandKind::Status => Command::Status,
        };
        if payload.is_some() && kind != CommandKind::Level {
            return Err(Error::parse(format!("Unexpected payload in {}", s)));
        }
        Ok(command)
    }
}

impl TryFrom<String> for Command {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Command> for String {
    fn from(command: Command) -> Self {
        command.to_string()
    }
}

/// The state held by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
#[allow(missing_docs)]
pub enum State {
    #[default]
    Unknown,
    On,
    Off,
    Level(u8),
    Motion,
    Still,
    Light,
    Dark,
    Open,
    Closed,
    Active,
    Inactive,
    Occupied,
    Vacant,
    Locked,
    Unlocked,
}

/// Payload-free discriminant of a [`State`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum StateKind {
    Unknown,
    On,
    Off,
    Level,
    Motion,
    Still,
    Light,
    Dark,
    Open,
    Closed,
    Active,
    Inactive,
    Occupied,
    Vacant,
    Locked,
    Unlocked,
}

impl StateKind {
    /// Every state kind, in declaration order
    pub const ALL: [StateKind; 16] = [
        StateKind::Unknown,
        StateKind::On,
        StateKind::Off,
        StateKind::Level,
        StateKind::Motion,
        StateKind::Still,
        StateKind::Light,
        StateKind::Dark,
        StateKind::Open,
        StateKind::Closed,
        StateKind::Active,
        StateKind::Inactive,
        StateKind::Occupied,
        StateKind::Vacant,
        StateKind::Locked,
        StateKind::Unlocked,
    ];

    /// Get the canonical token
    pub fn as_str(&self) -> &'static str {
        match self {
            StateKind::Unknown => "UNKNOWN",
            StateKind::On => "ON",
            StateKind::Off => "OFF",
            StateKind::Level => "LEVEL",
            StateKind::Motion => "MOTION",
            StateKind::Still => "STILL",
            StateKind::Light => "LIGHT",
            StateKind::Dark => "DARK",
            StateKind::Open => "OPEN",
            StateKind::Closed => "CLOSED",
            StateKind::Active => "ACTIVE",
            StateKind::Inactive => "INACTIVE",
            StateKind::Occupied => "OCCUPIED",
            StateKind::Vacant => "VACANT",
            StateKind::Locked => "LOCKED",
            StateKind::Unlocked => "UNLOCKED",
        }
    }
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StateKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let token = s.trim().to_uppercase();
        StateKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == token)
            .ok_or_else(|| Error::parse(format!("Unknown state: {}", s)))
    }
}

impl State {
    /// Get the payload-free kind of the state
    pub fn kind(&self) -> StateKind {
        match self {
            State::Unknown => StateKind::Unknown,
            State::On => StateKind::On,
            State::Off => StateKind::Off,
            State::Level(_) => StateKind::Level,
            State::Motion => StateKind::Motion,
            State::Still => StateKind::Still,
            State::Light => StateKind::Light,
            State::Dark => StateKind::Dark,
            State::Open => StateKind::Open,
            State::Closed => StateKind::Closed,
            State::Active => StateKind::Active,
            State::Inactive => StateKind::Inactive,
            State::Occupied => StateKind::Occupied,
            State::Vacant => StateKind::Vacant,
            State::Locked => StateKind::Locked,
            State::Unlocked => StateKind::Unlocked,
        }
    }

    /// The command that drives a device into this state
    pub fn as_command(&self) -> Option<Command> {
        let command = match self {
            State::Unknown => return None,
            State::On => Command::On,
            State::Off => Command::Off,
            State::Level(level) => Command::Level(*level),
            State::Motion => Command::Motion,
            State::Still => Command::Still,
            State::Light => Command::Light,
            State::Dark => Command::Dark,
            State::Open => Command::Open,
            State::Closed => Command::Close,
            State::Active => Command::Activate,
            State::Inactive => Command::Deactivate,
            State::Occupied => Command::Occupy,
            State::Vacant => Command::Vacate,
            State::Locked => Command::Lock,
            State::Unlocked => Command::Unlock,
        };
        Some(command)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Level(level) => write!(f, "LEVEL:{}", level),
            other => f.write_str(other.kind().as_str()),
        }
    }
}

impl FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (token, payload) = split_payload(s);
        let kind: StateKind = token.parse()?;
        if kind == StateKind::Level {
            return Ok(State::Level(parse_level(payload, s)?));
        }
        if payload.is_some() {
            return Err(Error::parse(format!("Unexpected payload in {}", s)));
        }
        let state = match kind {
            StateKind::Unknown => State::Unknown,
            StateKind::On => State::On,
            StateKind::Off => State::Off,
            StateKind::Level => unreachable!("handled above"),
            StateKind::Motion => State::Motion,
            StateKind::Still => State::Still,
            StateKind::Light => State::Light,
            StateKind::Dark => State::Dark,
            StateKind::Open => State::Open,
            StateKind::Closed => State::Closed,
            StateKind::Active => State::Active,
            StateKind::Inactive => State::Inactive,
            StateKind::Occupied => State::Occupied,
            StateKind::Vacant => State::Vacant,
            StateKind::Locked => State::Locked,
            StateKind::Unlocked => State::Unlocked,
        };
        Ok(state)
    }
}

impl TryFrom<String> for State {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<State> for String {
    fn from(state: State) -> Self {
        state.to_string()
    }
}

/// Who issued a command
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    /// Another device, or the device itself
    Device(DeviceId),
    /// A decoded event from a hardware link
    Driver(DriverId),
    /// A front end such as the management API, with its attribution
    External(String),
}

impl Source {
    /// The device handle, if the source is a device
    pub fn device(&self) -> Option<DeviceId> {
        match self {
            Source::Device(id) => Some(*id),
            _ => None,
        }
    }

    /// The driver handle, if the source is a driver
    pub fn driver(&self) -> Option<DriverId> {
        match self {
            Source::Driver(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Device(id) => write!(f, "{}", id),
            Source::Driver(id) => write!(f, "{}", id),
            Source::External(name) => write!(f, "external:{}", name),
        }
    }
}
