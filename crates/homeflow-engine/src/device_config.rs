/*!
 * Device configuration.
 *
 * A [`DeviceConfig`] describes one device and its rule tables. Rule tables
 * accept a single entry or a list. Entries that cannot be used, and keys
 * nobody understands, are reported and skipped; the device is still built
 * from whatever remains.
 */
use std::collections::BTreeMap;
use std::path::Path;
use std::slice;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use homeflow_core::time::{CronSpec, TimeRange};
use homeflow_core::types::{Address, Command, DeviceId, DriverId, Source, StateKind};
use homeflow_core::utils::seconds_to_duration;

use crate::error::{Error, Result};
use crate::profiles::DeviceKind;
use crate::rules::{
    DelayRule, IdleRule, IgnoreRule, MapRule, RestrictionRule, RuleSet, TimeRule, TriggerRule,
};

/// A single value or a list of values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    /// Several values, in order
    List(Vec<T>),
    /// One value
    Single(T),
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        OneOrMany::List(Vec::new())
    }
}

impl<T> OneOrMany<T> {
    /// The values, in order
    pub fn as_slice(&self) -> &[T] {
        match self {
            OneOrMany::Single(value) => slice::from_ref(value),
            OneOrMany::List(values) => values,
        }
    }

    /// Whether there is no value
    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }
}

impl<T> From<Vec<T>> for OneOrMany<T> {
    fn from(values: Vec<T>) -> Self {
        OneOrMany::List(values)
    }
}

/// One field of a calendar tuple: `"*"`, `5`, `"1-5"` or `[1, 3]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CalendarField {
    /// A single value
    Number(u32),
    /// A set of values
    Set(Vec<u32>),
    /// A textual field
    Text(String),
}

impl CalendarField {
    fn to_field_string(&self) -> String {
        match self {
            CalendarField::Number(n) => n.to_string(),
            CalendarField::Set(values) => values
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(","),
            CalendarField::Text(text) => text.clone(),
        }
    }
}

/// When a time rule fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CalendarSpec {
    /// A clock string such as `"6:30 PM"`, or six space-separated fields
    Text(String),
    /// Second, minute, hour, day, month, weekday (0 = Monday)
    Fields(Vec<CalendarField>),
}

impl CalendarSpec {
    /// Resolve into a calendar specification
    pub fn to_cron(&self) -> Result<CronSpec> {
        match self {
            CalendarSpec::Text(text) => Ok(text.parse()?),
            CalendarSpec::Fields(fields) => {
                let fields: Vec<String> = fields.iter().map(CalendarField::to_field_string).collect();
                Ok(CronSpec::from_fields(&fields)?)
            }
        }
    }
}

/// One rule entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleEntry {
    /// The command matched, or issued by a time rule; any when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Command>,

    /// The source matched, by device or driver name; any when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// The replacement or follow-up command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapped: Option<Command>,

    /// Delay, hold or idle time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<f64>,

    /// Window start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,

    /// Window end
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,

    /// The blocking state of a restriction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    /// The reference device of a restriction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    /// The calendar of a time rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<CalendarSpec>,

    /// Keys nobody understands
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

/// A rule table slot: a usable entry, or whatever was written instead
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleSlot {
    /// A well-formed entry
    Entry(RuleEntry),
    /// An entry with an unrecognized shape, kept so it can be reported
    Invalid(serde_json::Value),
}

impl RuleSlot {
    /// The entry, or why the slot could not be read as one
    pub fn entry(&self) -> Result<&RuleEntry> {
        match self {
            RuleSlot::Entry(entry) => Ok(entry),
            RuleSlot::Invalid(value) => {
                let reason = serde_json::from_value::<RuleEntry>(value.clone())
                    .err()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unrecognized rule shape".to_string());
                Err(Error::rule(format!("unusable entry {}: {}", value, reason)))
            }
        }
    }
}

impl From<RuleEntry> for RuleSlot {
    fn from(entry: RuleEntry) -> Self {
        RuleSlot::Entry(entry)
    }
}

impl RuleEntry {
    fn window(&self) -> Result<Option<TimeRange>> {
        Ok(TimeRange::from_bounds(self.start.as_deref(), self.end.as_deref())?)
    }

    fn duration(&self) -> Option<Duration> {
        self.seconds
            .map(seconds_to_duration)
            .filter(|duration| !duration.is_zero())
    }

    fn require_mapped(&self, table: &str) -> Result<Command> {
        self.mapped
            .ok_or_else(|| Error::rule(format!("{} rule needs a mapped command", table)))
    }

    fn require_duration(&self, table: &str) -> Result<Duration> {
        self.duration()
            .ok_or_else(|| Error::rule(format!("{} rule needs a positive seconds value", table)))
    }
}

/// Configuration of one device
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Unique device name
    pub name: String,

    /// Device profile
    pub kind: DeviceKind,

    /// Hardware address; makes the device an interface device
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,

    /// Names of the drivers the device is bound to
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub drivers: Vec<String>,

    /// Names of the devices this device listens to
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<String>,

    /// Command establishing the initial state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial: Option<Command>,

    /// Only notify delegates when the state actually changes
    pub changes_only: bool,

    /// Seconds during which an identical transition is voided
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrigger_delay: Option<f64>,

    /// Never write to the hardware
    pub read_only: bool,

    /// Write to the hardware even when the state did not change
    pub send_always: bool,

    /// Periodically re-assert the state to the hardware
    pub sync: bool,

    /// Map rules
    #[serde(skip_serializing_if = "OneOrMany::is_empty")]
    pub map: OneOrMany<RuleSlot>,

    /// Delay rules
    #[serde(skip_serializing_if = "OneOrMany::is_empty")]
    pub delay: OneOrMany<RuleSlot>,

    /// Trigger rules
    #[serde(skip_serializing_if = "OneOrMany::is_empty")]
    pub trigger: OneOrMany<RuleSlot>,

    /// Ignore rules
    #[serde(skip_serializing_if = "OneOrMany::is_empty")]
    pub ignore: OneOrMany<RuleSlot>,

    /// Restriction rules
    #[serde(skip_serializing_if = "OneOrMany::is_empty")]
    pub restriction: OneOrMany<RuleSlot>,

    /// Idle rules
    #[serde(skip_serializing_if = "OneOrMany::is_empty")]
    pub idle: OneOrMany<RuleSlot>,

    /// Calendar rules
    #[serde(skip_serializing_if = "OneOrMany::is_empty")]
    pub time: OneOrMany<RuleSlot>,

    /// Keys nobody understands
    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_json::Value>,
}

impl DeviceConfig {
    /// Start a configuration for a named device
    pub fn new<S: AsRef<str>>(name: S) -> Self {
        Self {
            name: name.as_ref().to_string(),
            ..Self::default()
        }
    }

    /// Set the profile
    pub fn with_kind(mut self, kind: DeviceKind) -> Self {
        self.kind = kind;
        self
    }

    /// Bind to hardware at an address through the named drivers
    pub fn with_address<S: AsRef<str>>(mut self, address: S, drivers: &[&str]) -> Self {
        self.address = Some(Address::new(address));
        self.drivers = drivers.iter().map(|d| d.to_string()).collect();
        self
    }

    /// Listen to the named devices
    pub fn with_producers(mut self, producers: &[&str]) -> Self {
        self.devices = producers.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Set the initial command
    pub fn with_initial(mut self, command: Command) -> Self {
        self.initial = Some(command);
        self
    }

    /// Only notify delegates on real changes
    pub fn with_changes_only(mut self, changes_only: bool) -> Self {
        self.changes_only = changes_only;
        self
    }

    /// Set the retrigger guard in seconds
    pub fn with_retrigger_delay(mut self, seconds: f64) -> Self {
        self.retrigger_delay = Some(seconds);
        self
    }

    /// Parse a configuration from TOML
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Every unknown key, including those inside rule entries
    pub fn unknown_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.unknown.keys().cloned().collect();
        for (table, entries) in self.tables() {
            for entry in entries.as_slice().iter().filter_map(|slot| slot.entry().ok()) {
                keys.extend(entry.unknown.keys().map(|key| format!("{}.{}", table, key)));
            }
        }
        keys
    }

    fn tables(&self) -> [(&'static str, &OneOrMany<RuleSlot>); 7] {
        [
            ("map", &self.map),
            ("delay", &self.delay),
            ("trigger", &self.trigger),
            ("ignore", &self.ignore),
            ("restriction", &self.restriction),
            ("idle", &self.idle),
            ("time", &self.time),
        ]
    }

    /// Retrigger guard hold time
    pub fn retrigger_duration(&self) -> Option<Duration> {
        self.retrigger_delay
            .map(seconds_to_duration)
            .filter(|duration| !duration.is_zero())
    }

    /// Build the rule set, resolving names through `names`.
    ///
    /// Unusable entries are skipped and returned as errors alongside the
    /// rules that could be built.
    pub fn build_rules(&self, names: &dyn NameResolver) -> (RuleSet, Vec<Error>) {
        let mut rules = RuleSet::new();
        let mut issues = Vec::new();

        for key in self.unknown_keys() {
            issues.push(Error::configuration(format!("Unknown key '{}'", key)));
        }

        for (table, entries) in self.tables() {
            for (index, slot) in entries.as_slice().iter().enumerate() {
                let added = slot
                    .entry()
                    .and_then(|entry| add_rule(&mut rules, table, entry, names));
                if let Err(e) = added {
                    issues.push(Error::rule(format!("{}[{}]: {}", table, index, e)));
                }
            }
        }

        for issue in &issues {
            warn!(device = %self.name, "Skipping configuration: {}", issue);
        }
        (rules, issues)
    }
}

/// Resolves configured names to handles
pub trait NameResolver {
    /// A device handle by name
    fn device(&self, name: &str) -> Option<DeviceId>;

    /// A driver handle by name
    fn driver(&self, name: &str) -> Option<DriverId>;

    /// A command source by name: a device, a driver, or `external:<who>`
    fn source(&self, name: &str) -> Result<Source> {
        if let Some(who) = name.strip_prefix("external:") {
            return Ok(Source::External(who.to_string()));
        }
        if let Some(id) = self.device(name) {
            return Ok(Source::Device(id));
        }
        if let Some(id) = self.driver(name) {
            return Ok(Source::Driver(id));
        }
        Err(Error::not_found(format!("Source '{}'", name)))
    }
}

fn add_rule(rules: &mut RuleSet, table: &str, entry: &RuleEntry, names: &dyn NameResolver) -> Result<()> {
    let window = entry.window()?;
    let command = entry.command.map(|c| c.kind());
    let source = entry.source.as_deref().map(|s| names.source(s)).transpose()?;

    match table {
        "map" => {
            let mapped = entry.require_mapped(table)?;
            let rule = MapRule {
                mapped,
                delay: entry.duration(),
            };
            rules.map.insert(command, source, window, rule);
        }
        "delay" => {
            let rule = DelayRule {
                mapped: entry.mapped,
                delay: entry.require_duration(table)?,
            };
            rules.delay.insert(command, source, window, rule);
        }
        "trigger" => {
            let rule = TriggerRule {
                mapped: entry.require_mapped(table)?,
                delay: entry.require_duration(table)?,
            };
            rules.trigger.insert(command, source, window, rule);
        }
        "ignore" => {
            rules.ignore.insert(command, source, window, IgnoreRule);
        }
        "idle" => {
            let rule = IdleRule {
                mapped: entry.require_mapped(table)?,
                delay: entry.require_duration(table)?,
            };
            rules.idle.insert(command, source, window, rule);
        }
        "restriction" => {
            let state: StateKind = entry
                .state
                .as_deref()
                .ok_or_else(|| Error::rule("restriction needs a state"))?
                .parse()?;
            let device_name = entry
                .device
                .as_deref()
                .ok_or_else(|| Error::rule("restriction needs a device"))?;
            let device = names
                .device(device_name)
                .ok_or_else(|| Error::not_found(format!("Device '{}'", device_name)))?;
            rules.restrictions.push(RestrictionRule {
                state,
                device,
                command,
                window,
            });
        }
        "time" => {
            let spec = entry
                .at
                .as_ref()
                .ok_or_else(|| Error::rule("time rule needs 'at'"))?
                .to_cron()?;
            let command = entry
                .command
                .or(entry.mapped)
                .ok_or_else(|| Error::rule("time rule needs a command"))?;
            rules.time.push(TimeRule { spec, command });
        }
        other => return Err(Error::rule(format!("Unknown rule table '{}'", other))),
    }
    Ok(())
}

/// A whole controller: every device, in construction order
#[derive(Debug, Clone, Default, Serialize)]
pub struct ControllerConfig {
    /// Device configurations
    #[serde(rename = "device")]
    pub devices: Vec<DeviceConfig>,

    /// Device entries that could not be read, with the reason
    #[serde(skip)]
    pub rejected: Vec<String>,
}

impl ControllerConfig {
    /// Parse from TOML text.
    ///
    /// Only malformed TOML fails the whole file. A `[[device]]` entry that
    /// cannot be read is logged, recorded in `rejected` and skipped.
    pub fn from_toml(text: &str) -> Result<Self> {
        let mut table: toml::Table = toml::from_str(text)?;
        let mut config = ControllerConfig::default();

        let entries = match table.remove("device") {
            Some(toml::Value::Array(entries)) => entries,
            Some(toml::Value::Table(entry)) => vec![toml::Value::Table(entry)],
            Some(other) => {
                config.rejected.push(format!(
                    "'device' must be a table or an array, got {}",
                    other.type_str()
                ));
                Vec::new()
            }
            None => Vec::new(),
        };
        for key in table.keys() {
            config.rejected.push(format!("Unknown key '{}'", key));
        }

        for (index, entry) in entries.into_iter().enumerate() {
            let name = entry
                .get("name")
                .and_then(toml::Value::as_str)
                .unwrap_or("?")
                .to_string();
            match entry.try_into::<DeviceConfig>() {
                Ok(device) => config.devices.push(device),
                Err(e) => config
                    .rejected
                    .push(format!("device[{}] '{}': {}", index, name, e)),
            }
        }

        for problem in &config.rejected {
            warn!("Skipping controller configuration: {}", problem);
        }
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&text)
    }
}
