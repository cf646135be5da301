/*!
 * The stateful device: a per-device rule evaluator.
 *
 * Every command runs through the same pipeline, serialized per device:
 *
 * 1. ignore filter
 * 2. map resolution, possibly deferred behind a timer
 * 3. command to state resolution, including the meta-commands
 * 4. restriction filter
 * 5. retrigger guard
 * 6. delay gate
 * 7. commit
 *
 * Delegates are notified once the pipeline lock has been released.
 */
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{NaiveDateTime, NaiveTime};
use tracing::{debug, info, trace, warn};

use homeflow_core::logging::{device_span, Span};
use homeflow_core::types::{Command, DeviceId, Source, State};
use homeflow_devices::{CommandContext, Device, DeviceError, DeviceInfo, RegistryEvent};

use crate::context::DeviceContext;
use crate::cron::CronTimer;
use crate::device_config::DeviceConfig;
use crate::error::{Error, Result};
use crate::profiles::DeviceKind;
use crate::rules::RuleSet;
use crate::scheduler::OneShotDelay;

/// A committed state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// The concrete command committed
    pub command: Command,
    /// The state before the commit
    pub previous: State,
    /// The state after the commit
    pub state: State,
    /// Whether the state actually changed
    pub changed: bool,
}

/// What the pipeline did with a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Filtered, voided or rejected
    Dropped,
    /// Held back behind a map or delay timer
    Deferred,
    /// A status poll; nothing changed
    Status,
    /// AUTOMATIC or MANUAL was applied
    Mode(Command),
    /// A transition was committed
    Committed(Transition),
}

/// Per-device behaviour switches
#[derive(Debug, Clone, Default)]
pub struct StateSettings {
    /// Device profile
    pub kind: DeviceKind,
    /// Command establishing the initial state
    pub initial: Option<Command>,
    /// Only notify delegates on real changes
    pub changes_only: bool,
    /// Hold time of the retrigger guard
    pub retrigger_delay: Option<Duration>,
}

impl StateSettings {
    /// Take the switches from a device configuration
    pub fn from_config(config: &DeviceConfig) -> Self {
        let initial = config.initial.filter(|command| {
            let usable = !command.is_meta();
            if !usable {
                warn!(device = %config.name, command = %command, "Ignoring meta-command as initial");
            }
            usable
        });
        Self {
            kind: config.kind,
            initial,
            changes_only: config.changes_only,
            retrigger_delay: config.retrigger_duration(),
        }
    }
}

#[derive(Debug, Default)]
struct DeviceCore {
    state: State,
    previous_state: State,
    previous_command: Option<Command>,
    last_set_at: Option<NaiveDateTime>,
}

#[derive(Debug, Default)]
struct Graph {
    producers: Vec<DeviceId>,
    delegates: Vec<DeviceId>,
}

#[derive(Debug)]
struct Timers {
    delays: HashMap<Command, OneShotDelay>,
    triggers: HashMap<Command, OneShotDelay>,
    maps: HashMap<Command, OneShotDelay>,
    idle: OneShotDelay,
    guard: OneShotDelay,
    calendar: Vec<CronTimer>,
}

impl Timers {
    /// A newer command for `command` supersedes pending delays and its trigger
    fn supersede(&self, command: Command) {
        self.delays.values().for_each(OneShotDelay::stop);
        if let Some(trigger) = self.triggers.get(&command) {
            trigger.stop();
        }
    }

    fn stop_scheduling(&self) {
        self.idle.stop();
        self.triggers.values().for_each(OneShotDelay::stop);
        self.delays.values().for_each(OneShotDelay::stop);
    }

    fn stop_all(&mut self) {
        self.stop_scheduling();
        self.maps.values().for_each(OneShotDelay::stop);
        self.guard.stop();
        self.calendar.iter().for_each(CronTimer::stop);
        self.calendar.clear();
    }
}

/// A hardware-independent device driven by its rule tables
pub struct StateDevice {
    id: DeviceId,
    name: String,
    settings: StateSettings,
    rules: RuleSet,
    ctx: DeviceContext,
    pipeline: Mutex<()>,
    core: Mutex<DeviceCore>,
    automatic: Arc<AtomicBool>,
    graph: RwLock<Graph>,
    timers: Mutex<Timers>,
    span: Span,
}

impl fmt::Debug for StateDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateDevice")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.settings.kind)
            .field("state", &self.state())
            .field("rules", &self.rules.len())
            .finish()
    }
}

impl StateDevice {
    /// Create a device in the UNKNOWN state
    pub fn new<S: AsRef<str>>(
        id: DeviceId,
        name: S,
        settings: StateSettings,
        rules: RuleSet,
        ctx: DeviceContext,
    ) -> Self {
        let name = name.as_ref().to_string();
        let span = device_span(&name, &id.to_string());
        let timers = Timers {
            delays: HashMap::new(),
            triggers: HashMap::new(),
            maps: HashMap::new(),
            idle: OneShotDelay::new(ctx.scheduler()),
            guard: OneShotDelay::new(ctx.scheduler()),
            calendar: Vec::new(),
        };
        Self {
            id,
            name,
            settings,
            rules,
            ctx,
            pipeline: Mutex::new(()),
            core: Mutex::new(DeviceCore::default()),
            automatic: Arc::new(AtomicBool::new(true)),
            graph: RwLock::new(Graph::default()),
            timers: Mutex::new(timers),
            span,
        }
    }

    /// The behaviour switches
    pub fn settings(&self) -> &StateSettings {
        &self.settings
    }

    /// The rule tables
    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// The engine services
    pub fn context(&self) -> &DeviceContext {
        &self.ctx
    }

    /// Whether automatic scheduling is active
    pub fn is_automatic(&self) -> bool {
        self.automatic.load(Ordering::SeqCst)
    }

    /// The last distinct state
    pub fn previous_state(&self) -> State {
        self.core().map(|core| core.previous_state).unwrap_or_default()
    }

    /// The last committed command
    pub fn previous_command(&self) -> Option<Command> {
        self.core().ok().and_then(|core| core.previous_command)
    }

    /// When the state was last committed
    pub fn last_set_at(&self) -> Option<NaiveDateTime> {
        self.core().ok().and_then(|core| core.last_set_at)
    }

    fn core(&self) -> Result<MutexGuard<'_, DeviceCore>> {
        self.core
            .lock()
            .map_err(|_| Error::other(format!("Failed to acquire state of {}", self.name)))
    }

    fn timers(&self) -> Result<MutexGuard<'_, Timers>> {
        self.timers
            .lock()
            .map_err(|_| Error::other(format!("Failed to acquire timers of {}", self.name)))
    }

    /// Run a command through the pipeline and notify delegates.
    pub fn process(&self, command: Command, source: &Source, ctx: &CommandContext) -> Outcome {
        let _entered = self.span.enter();

        if ctx.contains(self.id) {
            debug!(command = %command, source = %source, "Dropping command already seen on this path");
            return Outcome::Dropped;
        }

        let outcome = {
            let Ok(_pipeline) = self.pipeline.lock() else {
                warn!(command = %command, "Command pipeline poisoned, dropping command");
                return Outcome::Dropped;
            };
            match self.evaluate(command, source) {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(command = %command, source = %source, "Command failed: {}", e);
                    Outcome::Dropped
                }
            }
        };

        match outcome {
            Outcome::Committed(transition) => {
                if transition.changed || !self.settings.changes_only {
                    self.delegate(transition.command, source, ctx);
                }
                if let Some(registry) = self.ctx.registry() {
                    registry.publish(RegistryEvent::Committed {
                        id: self.id,
                        previous: transition.previous,
                        state: transition.state,
                        changed: transition.changed,
                        source: source.clone(),
                    });
                }
            }
            Outcome::Status => self.delegate(Command::Status, source, ctx),
            Outcome::Mode(mode) => self.delegate(mode, source, ctx),
            Outcome::Dropped | Outcome::Deferred => {}
        }
        outcome
    }

    fn evaluate(&self, command: Command, source: &Source) -> Result<Outcome> {
        let now = self.ctx.clock().now();
        let time = now.time();

        if self.rules.ignore.lookup(command.kind(), source, time).is_some() {
            debug!(command = %command, source = %source, "Ignored");
            return Ok(Outcome::Dropped);
        }

        let mut command = command;
        if let Some(rule) = self.rules.map.lookup(command.kind(), source, time) {
            match rule.delay {
                Some(delay) => {
                    debug!(command = %command, mapped = %rule.mapped, ?delay, "Deferring mapped command");
                    self.arm_map(rule.mapped, delay)?;
                    return Ok(Outcome::Deferred);
                }
                None => {
                    trace!(command = %command, mapped = %rule.mapped, "Mapped");
                    command = rule.mapped;
                }
            }
        }

        let command = match self.resolve(command)? {
            Resolved::Command(command) => command,
            Resolved::Done(outcome) => return Ok(outcome),
        };
        let Some(state) = command.target_state() else {
            debug!(command = %command, "Command resolves to no state");
            return Ok(Outcome::Dropped);
        };

        if self.restricted(command, source, time) {
            return Ok(Outcome::Dropped);
        }

        let current = self.state();
        {
            let timers = self.timers()?;
            if state == current && timers.guard.is_pending() {
                timers.supersede(command);
                debug!(command = %command, "Voided by retrigger guard");
                return Ok(Outcome::Dropped);
            }
        }

        let automatic = self.is_automatic();
        if automatic && source.device() != Some(self.id) {
            if let Some(rule) = self.rules.delay.lookup(command.kind(), source, time) {
                let held = rule.mapped.unwrap_or(command);
                debug!(command = %command, held = %held, delay = ?rule.delay, "Delaying");
                let callback = self.ctx.reissue(self.id, held);
                self.timers()?
                    .delays
                    .entry(command)
                    .or_insert_with(|| OneShotDelay::new(self.ctx.scheduler()))
                    .arm(rule.delay, callback);
                return Ok(Outcome::Deferred);
            }
        }

        self.commit(command, state, source, now, automatic)
            .map(Outcome::Committed)
    }

    fn resolve(&self, command: Command) -> Result<Resolved> {
        let resolved = match command {
            Command::Status => return Ok(Resolved::Done(Outcome::Status)),
            Command::Automatic | Command::Manual => {
                self.set_automatic(command == Command::Automatic)?;
                return Ok(Resolved::Done(Outcome::Mode(command)));
            }
            Command::Previous => match self.previous_state().as_command() {
                Some(previous) => previous,
                None => {
                    debug!("No previous state to return to");
                    return Ok(Resolved::Done(Outcome::Dropped));
                }
            },
            Command::Toggle => match self.state() {
                State::On | State::Level(_) => Command::Off,
                _ => Command::On,
            },
            Command::Initial => match self.settings.initial {
                Some(initial) => initial,
                None => {
                    debug!("No initial command configured");
                    return Ok(Resolved::Done(Outcome::Dropped));
                }
            },
            other => other,
        };
        Ok(Resolved::Command(resolved))
    }

    fn restricted(&self, command: Command, source: &Source, time: NaiveTime) -> bool {
        for rule in self.rules.restrictions_for(command.kind(), time) {
            if source.device() == Some(rule.device) {
                continue;
            }
            let held = self.ctx.state_of(rule.device).map(|state| state.kind());
            if held == Some(rule.state) {
                debug!(command = %command, device = %rule.device, state = %rule.state, "Restricted");
                return true;
            }
        }
        false
    }

    fn commit(
        &self,
        command: Command,
        state: State,
        source: &Source,
        now: NaiveDateTime,
        automatic: bool,
    ) -> Result<Transition> {
        if !self.settings.kind.accepts(state) {
            return Err(DeviceError::InvalidState {
                device: self.name.clone(),
                state,
            }
            .into());
        }

        let transition = {
            let mut core = self.core()?;
            let previous = core.state;
            let changed = previous != state;
            if changed {
                core.previous_state = previous;
            }
            core.state = state;
            core.previous_command = Some(command);
            core.last_set_at = Some(now);
            Transition {
                command,
                previous,
                state,
                changed,
            }
        };

        self.rearm(command, state, source, now.time(), automatic)?;

        info!(
            command = %command,
            source = %source,
            previous = %transition.previous,
            state = %state,
            "Committed"
        );
        Ok(transition)
    }

    /// Cancel stale timers and arm the ones a commit starts
    fn rearm(
        &self,
        command: Command,
        state: State,
        source: &Source,
        time: NaiveTime,
        automatic: bool,
    ) -> Result<()> {
        let mut timers = self.timers()?;

        timers.supersede(command);
        if let Some(hold) = self.settings.retrigger_delay {
            timers.guard.arm(hold, || {});
        }

        if !automatic {
            return Ok(());
        }

        match self.rules.idle.lookup(command.kind(), source, time) {
            Some(rule) if rule.mapped.target_state() != Some(state) => {
                trace!(mapped = %rule.mapped, delay = ?rule.delay, "Idle timer armed");
                timers.idle.arm(rule.delay, self.ctx.reissue(self.id, rule.mapped));
            }
            _ => timers.idle.stop(),
        }

        if let Some(rule) = self.rules.trigger.lookup(command.kind(), source, time) {
            if rule.mapped.target_state() != Some(state) {
                trace!(mapped = %rule.mapped, delay = ?rule.delay, "Trigger timer armed");
                let callback = self.ctx.reissue(self.id, rule.mapped);
                timers
                    .triggers
                    .entry(rule.mapped)
                    .or_insert_with(|| OneShotDelay::new(self.ctx.scheduler()))
                    .arm(rule.delay, callback);
            }
        }
        Ok(())
    }

    fn arm_map(&self, mapped: Command, delay: Duration) -> Result<()> {
        let callback = self.ctx.reissue(self.id, mapped);
        self.timers()?
            .maps
            .entry(mapped)
            .or_insert_with(|| OneShotDelay::new(self.ctx.scheduler()))
            .arm(delay, callback);
        Ok(())
    }

    fn set_automatic(&self, automatic: bool) -> Result<()> {
        self.automatic.store(automatic, Ordering::SeqCst);
        if !automatic {
            self.timers()?.stop_scheduling();
        }
        info!(automatic, "Scheduling mode changed");
        Ok(())
    }

    fn delegate(&self, command: Command, source: &Source, ctx: &CommandContext) {
        let Some(next) = ctx.descend(self.id) else {
            warn!(command = %command, depth = ctx.depth(), "Delegation depth bound reached");
            return;
        };

        for id in self.delegates() {
            if source.device() == Some(id) || next.contains(id) {
                continue;
            }
            match self.ctx.device(id) {
                Some(device) => device.command(command, Source::Device(self.id), &next),
                None => debug!(delegate = %id, "Delegate not available"),
            }
        }
    }

    /// The command that establishes the initial state, with its source.
    ///
    /// The configured initial command comes first; otherwise the state of
    /// the first producer that knows its own.
    pub fn initial_command(&self) -> Option<(Command, Source)> {
        if let Some(initial) = self.settings.initial {
            return Some((initial, Source::Device(self.id)));
        }
        self.producers().into_iter().find_map(|producer| {
            let command = self.ctx.state_of(producer)?.as_command()?;
            Some((command, Source::Device(producer)))
        })
    }

    /// Establish the initial state through the registry entry of this device
    pub fn initialize(&self) {
        if let Some((command, source)) = self.initial_command() {
            debug!(device = %self.name, command = %command, source = %source, "Initializing");
            self.ctx.dispatch(self.id, command, source);
        }
    }

    /// Register the calendar rules; returns how many were started
    pub fn start_calendar(&self) -> Result<usize> {
        let mut timers = self.timers()?;
        for rule in &self.rules.time {
            let issue = self.ctx.reissue(self.id, rule.command);
            let automatic = self.automatic.clone();
            let timer = self.ctx.cron().add(rule.spec.clone(), move || {
                if automatic.load(Ordering::SeqCst) {
                    issue();
                }
            })?;
            timers.calendar.push(timer);
        }
        Ok(timers.calendar.len())
    }

    /// Build the introspection snapshot, without an address
    pub fn snapshot(&self) -> DeviceInfo {
        let (state, previous_state, previous_command, last_set_at) = match self.core() {
            Ok(core) => (
                core.state,
                core.previous_state,
                core.previous_command,
                core.last_set_at,
            ),
            Err(_) => (State::Unknown, State::Unknown, None, None),
        };
        DeviceInfo {
            id: self.id,
            name: self.name.clone(),
            kind: self.settings.kind.to_string(),
            address: None,
            state,
            previous_state,
            previous_command,
            last_set_at,
            automatic: self.is_automatic(),
            producers: self.producers(),
            delegates: self.delegates(),
        }
    }
}

enum Resolved {
    Command(Command),
    Done(Outcome),
}

impl Device for StateDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> State {
        self.core().map(|core| core.state).unwrap_or_default()
    }

    fn command(&self, command: Command, source: Source, ctx: &CommandContext) {
        self.process(command, &source, ctx);
    }

    fn subscribe(&self, delegate: DeviceId) {
        if let Ok(mut graph) = self.graph.write() {
            if !graph.delegates.contains(&delegate) {
                graph.delegates.push(delegate);
            }
        }
    }

    fn unsubscribe(&self, delegate: DeviceId) {
        if let Ok(mut graph) = self.graph.write() {
            graph.delegates.retain(|id| *id != delegate);
        }
    }

    fn add_producer(&self, producer: DeviceId) {
        if let Ok(mut graph) = self.graph.write() {
            if !graph.producers.contains(&producer) {
                graph.producers.push(producer);
            }
        }
    }

    fn delegates(&self) -> Vec<DeviceId> {
        self.graph
            .read()
            .map(|graph| graph.delegates.clone())
            .unwrap_or_default()
    }

    fn producers(&self) -> Vec<DeviceId> {
        self.graph
            .read()
            .map(|graph| graph.producers.clone())
            .unwrap_or_default()
    }

    fn info(&self) -> DeviceInfo {
        self.snapshot()
    }

    fn shutdown(&self) {
        match self.timers() {
            Ok(mut timers) => timers.stop_all(),
            Err(e) => warn!(device = %self.name, "Cannot stop timers: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homeflow_core::config::EngineConfig;
    use homeflow_core::time::{ManualClock, TimeRange};
    use homeflow_core::types::{CommandKind, StateKind};
    use homeflow_devices::Registry;
    use tokio::time::sleep;

    use crate::cron::CronTicker;
    use crate::rules::{DelayRule, IdleRule, IgnoreRule, MapRule, RestrictionRule, TriggerRule};
    use crate::scheduler::Scheduler;

    struct Rig {
        registry: Arc<Registry>,
        ctx: DeviceContext,
        clock: Arc<ManualClock>,
    }

    impl Rig {
        fn new() -> Self {
            let registry = Arc::new(Registry::new());
            let scheduler = Scheduler::start();
            let clock = Arc::new(ManualClock::at_time(NaiveTime::from_hms_opt(12, 0, 0).unwrap()));
            let cron = CronTicker::new(&scheduler, clock.clone());
            let ctx = DeviceContext::new(&registry, scheduler, cron, clock.clone(), EngineConfig::default());
            Self { registry, ctx, clock }
        }

        fn add(&self, name: &str, settings: StateSettings, rules: RuleSet) -> Arc<StateDevice> {
            let id = self.registry.reserve(name).unwrap();
            let device = Arc::new(StateDevice::new(id, name, settings, rules, self.ctx.clone()));
            self.registry.attach(id, device.clone()).unwrap();
            device
        }

        fn light(&self, name: &str, rules: RuleSet) -> Arc<StateDevice> {
            let settings = StateSettings {
                kind: DeviceKind::Light,
                ..StateSettings::default()
            };
            self.add(name, settings, rules)
        }
    }

    fn external() -> Source {
        Source::External("test".into())
    }

    fn issue(device: &StateDevice, command: Command) -> Outcome {
        device.process(command, &external(), &CommandContext::default())
    }

    #[tokio::test]
    async fn test_commands_resolve_to_states() {
        let rig = Rig::new();
        let lamp = rig.light("lamp", RuleSet::new());

        assert_eq!(lamp.state(), State::Unknown);
        issue(&lamp, Command::Level(40));
        assert_eq!(lamp.state(), State::Level(40));
        issue(&lamp, Command::Level(0));
        assert_eq!(lamp.state(), State::Off);
        assert_eq!(lamp.previous_state(), State::Level(40));
        assert_eq!(lamp.previous_command(), Some(Command::Level(0)));
        assert!(lamp.last_set_at().is_some());
    }

    #[tokio::test]
    async fn test_invalid_state_is_dropped() {
        let rig = Rig::new();
        let lamp = rig.light("lamp", RuleSet::new());
        issue(&lamp, Command::On);

        assert_eq!(issue(&lamp, Command::Dark), Outcome::Dropped);
        assert_eq!(lamp.state(), State::On);
    }

    #[tokio::test]
    async fn test_toggle_previous_and_initial() {
        let rig = Rig::new();
        let settings = StateSettings {
            kind: DeviceKind::Light,
            initial: Some(Command::Level(10)),
            ..StateSettings::default()
        };
        let lamp = rig.add("lamp", settings, RuleSet::new());

        assert_eq!(issue(&lamp, Command::Previous), Outcome::Dropped);
        issue(&lamp, Command::Toggle);
        assert_eq!(lamp.state(), State::On);
        issue(&lamp, Command::Level(55));
        issue(&lamp, Command::Toggle);
        assert_eq!(lamp.state(), State::Off);
        issue(&lamp, Command::Previous);
        assert_eq!(lamp.state(), State::Level(55));
        issue(&lamp, Command::Initial);
        assert_eq!(lamp.state(), State::Level(10));
    }

    #[tokio::test]
    async fn test_status_does_not_change_state() {
        let rig = Rig::new();
        let lamp = rig.light("lamp", RuleSet::new());
        issue(&lamp, Command::On);
        assert_eq!(issue(&lamp, Command::Status), Outcome::Status);
        assert_eq!(lamp.state(), State::On);
        assert_eq!(lamp.previous_command(), Some(Command::On));
    }

    #[tokio::test]
    async fn test_map_substitutes() {
        let rig = Rig::new();
        let mut rules = RuleSet::new();
        rules.map.insert(
            Some(CommandKind::On),
            None,
            None,
            MapRule {
                mapped: Command::Level(70),
                delay: None,
            },
        );
        let lamp = rig.light("lamp", rules);

        issue(&lamp, Command::On);
        assert_eq!(lamp.state(), State::Level(70));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_map_reissues_later() {
        let rig = Rig::new();
        let mut rules = RuleSet::new();
        rules.map.insert(
            Some(CommandKind::On),
            None,
            None,
            MapRule {
                mapped: Command::Level(20),
                delay: Some(Duration::from_secs(5)),
            },
        );
        let lamp = rig.light("lamp", rules);

        assert_eq!(issue(&lamp, Command::On), Outcome::Deferred);
        assert_eq!(lamp.state(), State::Unknown);
        sleep(Duration::from_secs(6)).await;
        assert_eq!(lamp.state(), State::Level(20));
    }

    #[tokio::test]
    async fn test_ignore_window_crossing_midnight() {
        let rig = Rig::new();
        let night = TimeRange::new(
            NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
        );
        let mut rules = RuleSet::new();
        rules.ignore.insert(Some(CommandKind::On), None, Some(night), IgnoreRule);
        let lamp = rig.light("lamp", rules);

        rig.clock.set_time(NaiveTime::from_hms_opt(23, 30, 0).unwrap());
        assert_eq!(issue(&lamp, Command::On), Outcome::Dropped);
        rig.clock.set_time(NaiveTime::from_hms_opt(2, 0, 0).unwrap());
        assert_eq!(issue(&lamp, Command::On), Outcome::Dropped);
        rig.clock.set_time(NaiveTime::from_hms_opt(7, 0, 0).unwrap());
        assert!(matches!(issue(&lamp, Command::On), Outcome::Committed(_)));
    }

    #[tokio::test]
    async fn test_restriction_exempts_reference_device() {
        let rig = Rig::new();
        let photocell = rig.add(
            "photocell",
            StateSettings {
                kind: DeviceKind::Photocell,
                ..StateSettings::default()
            },
            RuleSet::new(),
        );
        let mut rules = RuleSet::new();
        rules.restrictions.push(RestrictionRule {
            state: StateKind::Light,
            device: photocell.id(),
            command: Some(CommandKind::On),
            window: None,
        });
        let lamp = rig.light("lamp", rules);

        issue(&photocell, Command::Light);
        assert_eq!(issue(&lamp, Command::On), Outcome::Dropped);
        assert_eq!(lamp.state(), State::Unknown);

        let from_photocell = Source::Device(photocell.id());
        lamp.process(Command::On, &from_photocell, &CommandContext::default());
        assert_eq!(lamp.state(), State::On);

        issue(&photocell, Command::Dark);
        issue(&lamp, Command::Off);
        issue(&lamp, Command::On);
        assert_eq!(lamp.state(), State::On);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_gate_and_cancellation() {
        let rig = Rig::new();
        let mut rules = RuleSet::new();
        rules.delay.insert(
            Some(CommandKind::Off),
            None,
            None,
            DelayRule {
                mapped: None,
                delay: Duration::from_secs(30),
            },
        );
        let lamp = rig.light("lamp", rules);

        issue(&lamp, Command::On);
        assert_eq!(issue(&lamp, Command::Off), Outcome::Deferred);
        sleep(Duration::from_secs(10)).await;
        assert_eq!(lamp.state(), State::On);

        issue(&lamp, Command::On);
        sleep(Duration::from_secs(40)).await;
        assert_eq!(lamp.state(), State::On);

        issue(&lamp, Command::Off);
        sleep(Duration::from_secs(31)).await;
        assert_eq!(lamp.state(), State::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_and_idle() {
        let rig = Rig::new();
        let mut rules = RuleSet::new();
        rules.trigger.insert(
            Some(CommandKind::On),
            None,
            None,
            TriggerRule {
                mapped: Command::Off,
                delay: Duration::from_secs(10),
            },
        );
        rules.idle.insert(
            Some(CommandKind::Off),
            None,
            None,
            IdleRule {
                mapped: Command::Level(5),
                delay: Duration::from_secs(60),
            },
        );
        let lamp = rig.light("lamp", rules);

        issue(&lamp, Command::On);
        sleep(Duration::from_secs(11)).await;
        assert_eq!(lamp.state(), State::Off);
        sleep(Duration::from_secs(61)).await;
        assert_eq!(lamp.state(), State::Level(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_suspends_scheduling() {
        let rig = Rig::new();
        let mut rules = RuleSet::new();
        rules.idle.insert(
            None,
            None,
            None,
            IdleRule {
                mapped: Command::Off,
                delay: Duration::from_secs(5),
            },
        );
        let lamp = rig.light("lamp", rules);

        issue(&lamp, Command::On);
        assert_eq!(issue(&lamp, Command::Manual), Outcome::Mode(Command::Manual));
        assert!(!lamp.is_automatic());
        sleep(Duration::from_secs(10)).await;
        assert_eq!(lamp.state(), State::On);

        issue(&lamp, Command::Automatic);
        issue(&lamp, Command::On);
        sleep(Duration::from_secs(6)).await;
        assert_eq!(lamp.state(), State::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrigger_guard() {
        let rig = Rig::new();
        let settings = StateSettings {
            kind: DeviceKind::Motion,
            retrigger_delay: Some(Duration::from_secs(2)),
            ..StateSettings::default()
        };
        let motion = rig.add("motion", settings, RuleSet::new());

        assert!(matches!(issue(&motion, Command::Motion), Outcome::Committed(_)));
        sleep(Duration::from_millis(500)).await;
        assert_eq!(issue(&motion, Command::Motion), Outcome::Dropped);
        assert!(matches!(issue(&motion, Command::Still), Outcome::Committed(_)));

        sleep(Duration::from_secs(3)).await;
        assert!(matches!(issue(&motion, Command::Still), Outcome::Committed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guarded_repeat_cancels_pending_delay() {
        let rig = Rig::new();
        let mut rules = RuleSet::new();
        rules.delay.insert(
            Some(CommandKind::Off),
            None,
            None,
            DelayRule {
                mapped: None,
                delay: Duration::from_secs(2),
            },
        );
        let settings = StateSettings {
            kind: DeviceKind::Light,
            retrigger_delay: Some(Duration::from_secs(2)),
            ..StateSettings::default()
        };
        let hall = rig.add("hall", settings, rules);

        assert!(matches!(issue(&hall, Command::On), Outcome::Committed(_)));
        assert_eq!(issue(&hall, Command::Off), Outcome::Deferred);
        sleep(Duration::from_millis(500)).await;
        assert_eq!(issue(&hall, Command::On), Outcome::Dropped);

        sleep(Duration::from_secs(3)).await;
        assert_eq!(hall.state(), State::On);
    }

    #[tokio::test]
    async fn test_initial_from_producer() {
        let rig = Rig::new();
        let switch = rig.add(
            "switch",
            StateSettings {
                kind: DeviceKind::Switch,
                ..StateSettings::default()
            },
            RuleSet::new(),
        );
        issue(&switch, Command::On);

        let lamp = rig.light("lamp", RuleSet::new());
        lamp.add_producer(switch.id());
        assert_eq!(
            lamp.initial_command(),
            Some((Command::On, Source::Device(switch.id())))
        );
        lamp.initialize();
        assert_eq!(lamp.state(), State::On);
    }

    #[tokio::test]
    async fn test_snapshot() {
        let rig = Rig::new();
        let lamp = rig.light("lamp", RuleSet::new());
        lamp.subscribe(DeviceId::from_index(7));
        lamp.subscribe(DeviceId::from_index(7));
        issue(&lamp, Command::On);

        let info = lamp.info();
        assert_eq!(info.name, "lamp");
        assert_eq!(info.kind, "light");
        assert_eq!(info.state, State::On);
        assert_eq!(info.delegates, vec![DeviceId::from_index(7)]);
        assert!(info.automatic);
    }
}
