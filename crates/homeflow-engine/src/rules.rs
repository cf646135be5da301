/*!
 * Rule tables.
 *
 * Rules are keyed by a (command, source) pair where either side may be a
 * wildcard. Lookups go from the most specific key to the least: exact
 * pair, command with any source, any command with the source, then any
 * command from any source. Every rule may carry a time-of-day window; a
 * rule whose window does not contain "now" does not match.
 */
use std::collections::HashMap;
use std::time::Duration;

use chrono::NaiveTime;

use homeflow_core::time::{CronSpec, TimeRange};
use homeflow_core::types::{Command, CommandKind, DeviceId, Source, StateKind};

type RuleKey = (Option<CommandKind>, Option<Source>);

/// A rule with its optional window
#[derive(Debug, Clone, PartialEq)]
pub struct Windowed<T> {
    /// The rule body
    pub rule: T,
    /// When the rule applies; always when `None`
    pub window: Option<TimeRange>,
}

impl<T> Windowed<T> {
    /// Whether the rule applies at a time of day
    pub fn applies_at(&self, now: NaiveTime) -> bool {
        self.window.map_or(true, |window| window.contains(now))
    }
}

/// A table of rules looked up most-specific-first
#[derive(Debug, Clone)]
pub struct RuleTable<T> {
    entries: HashMap<RuleKey, Vec<Windowed<T>>>,
}

impl<T> Default for RuleTable<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> RuleTable<T> {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule. Rules under the same key are tried in insertion order.
    pub fn insert(
        &mut self,
        command: Option<CommandKind>,
        source: Option<Source>,
        window: Option<TimeRange>,
        rule: T,
    ) {
        self.entries
            .entry((command, source))
            .or_default()
            .push(Windowed { rule, window });
    }

    /// Find the most specific rule for a command and source at a time of day
    pub fn lookup(&self, command: CommandKind, source: &Source, now: NaiveTime) -> Option<&T> {
        let keys = [
            (Some(command), Some(source.clone())),
            (Some(command), None),
            (None, Some(source.clone())),
            (None, None),
        ];
        keys.iter()
            .filter_map(|key| self.entries.get(key))
            .find_map(|rules| rules.iter().find(|r| r.applies_at(now)))
            .map(|windowed| &windowed.rule)
    }

    /// Visit every rule
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.values().flatten().map(|windowed| &windowed.rule)
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Substitute one command for another, optionally after a delay
#[derive(Debug, Clone, PartialEq)]
pub struct MapRule {
    /// Replacement command
    pub mapped: Command,
    /// Re-issue the replacement later instead of substituting it now
    pub delay: Option<Duration>,
}

/// Hold a command back for a while
#[derive(Debug, Clone, PartialEq)]
pub struct DelayRule {
    /// Command to commit when the delay expires; the held command when `None`
    pub mapped: Option<Command>,
    /// How long to hold
    pub delay: Duration,
}

/// After a commit, issue a follow-up command
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerRule {
    /// Follow-up command
    pub mapped: Command,
    /// Time until the follow-up
    pub delay: Duration,
}

/// Drop matching commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IgnoreRule;

/// After a period without commits, issue a command
#[derive(Debug, Clone, PartialEq)]
pub struct IdleRule {
    /// Command issued when the device has been idle
    pub mapped: Command,
    /// Idle period
    pub delay: Duration,
}

/// Void a command while another device holds a state
#[derive(Debug, Clone, PartialEq)]
pub struct RestrictionRule {
    /// The state that blocks
    pub state: StateKind,
    /// The device whose state is checked; its own commands are exempt
    pub device: DeviceId,
    /// The command blocked; every command when `None`
    pub command: Option<CommandKind>,
    /// When the restriction applies; always when `None`
    pub window: Option<TimeRange>,
}

impl RestrictionRule {
    /// Whether the rule concerns a command at a time of day
    pub fn applies_to(&self, command: CommandKind, now: NaiveTime) -> bool {
        self.command.map_or(true, |c| c == command)
            && self.window.map_or(true, |window| window.contains(now))
    }
}

/// Issue a command to the device on a calendar
#[derive(Debug, Clone, PartialEq)]
pub struct TimeRule {
    /// The calendar
    pub spec: CronSpec,
    /// The command issued
    pub command: Command,
}

/// Every rule configured on a device
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    /// Command substitution
    pub map: RuleTable<MapRule>,
    /// Held commands
    pub delay: RuleTable<DelayRule>,
    /// Follow-up commands
    pub trigger: RuleTable<TriggerRule>,
    /// Dropped commands
    pub ignore: RuleTable<IgnoreRule>,
    /// Idle timeouts
    pub idle: RuleTable<IdleRule>,
    /// Restrictions, checked in order
    pub restrictions: Vec<RestrictionRule>,
    /// Calendar rules
    pub time: Vec<TimeRule>,
}

impl RuleSet {
    /// Create an empty rule set
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrictions that concern a command now
    pub fn restrictions_for(
        &self,
        command: CommandKind,
        now: NaiveTime,
    ) -> impl Iterator<Item = &RestrictionRule> {
        self.restrictions
            .iter()
            .filter(move |rule| rule.applies_to(command, now))
    }

    /// Total number of rules
    pub fn len(&self) -> usize {
        self.map.len()
            + self.delay.len()
            + self.trigger.len()
            + self.ignore.len()
            + self.idle.len()
            + self.restrictions.len()
            + self.time.len()
    }

    /// Whether no rule is configured
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homeflow_core::types::DriverId;

    fn hms(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn noon() -> NaiveTime {
        hms(12, 0)
    }

    #[test]
    fn test_most_specific_first() {
        let motion = Source::Device(DeviceId::from_index(1));
        let other = Source::Device(DeviceId::from_index(2));

        let mut table = RuleTable::new();
        table.insert(None, None, None, "any-any");
        table.insert(None, Some(motion.clone()), None, "any-motion");
        table.insert(Some(CommandKind::On), None, None, "on-any");
        table.insert(Some(CommandKind::On), Some(motion.clone()), None, "on-motion");

        assert_eq!(table.lookup(CommandKind::On, &motion, noon()), Some(&"on-motion"));
        assert_eq!(table.lookup(CommandKind::On, &other, noon()), Some(&"on-any"));
        assert_eq!(table.lookup(CommandKind::Off, &motion, noon()), Some(&"any-motion"));
        assert_eq!(table.lookup(CommandKind::Off, &other, noon()), Some(&"any-any"));
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn test_windows_fall_through() {
        let source = Source::Driver(DriverId::next());
        let night = TimeRange::new(hms(22, 0), hms(6, 0));

        let mut table = RuleTable::new();
        table.insert(Some(CommandKind::On), None, Some(night), "night");
        table.insert(None, None, None, "fallback");

        assert_eq!(table.lookup(CommandKind::On, &source, hms(23, 0)), Some(&"night"));
        assert_eq!(table.lookup(CommandKind::On, &source, hms(3, 0)), Some(&"night"));
        assert_eq!(table.lookup(CommandKind::On, &source, noon()), Some(&"fallback"));
    }

    #[test]
    fn test_same_key_tries_windows_in_order() {
        let source = Source::External("api".into());
        let morning = TimeRange::new(hms(6, 0), hms(12, 0));
        let evening = TimeRange::new(hms(18, 0), hms(23, 0));

        let mut table = RuleTable::new();
        table.insert(Some(CommandKind::Motion), None, Some(morning), 30);
        table.insert(Some(CommandKind::Motion), None, Some(evening), 80);

        assert_eq!(table.lookup(CommandKind::Motion, &source, hms(7, 0)), Some(&30));
        assert_eq!(table.lookup(CommandKind::Motion, &source, hms(19, 0)), Some(&80));
        assert_eq!(table.lookup(CommandKind::Motion, &source, hms(15, 0)), None);
    }

    #[test]
    fn test_restriction_scope() {
        let rule = RestrictionRule {
            state: StateKind::Light,
            device: DeviceId::from_index(0),
            command: Some(CommandKind::On),
            window: None,
        };
        assert!(rule.applies_to(CommandKind::On, noon()));
        assert!(!rule.applies_to(CommandKind::Off, noon()));

        let mut rules = RuleSet::new();
        rules.restrictions.push(rule);
        assert_eq!(rules.restrictions_for(CommandKind::On, noon()).count(), 1);
        assert_eq!(rules.len(), 1);
    }
}
