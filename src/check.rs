//! One configured check: validated parameters, schedule, history and the
//! forced-run slot. Execution itself is delegated to the executor.

use crate::executor::{ExecutionReport, Invocation, Launcher};
use crate::modules::Capabilities;
use crate::privileges::{IdSpec, Privileges};
use crate::result::{format_timestamp, CheckResult, Status};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::{debug, error, info};

pub const DEFAULT_TIMEOUT_SECS: u64 = 1800;
pub const DEFAULT_HISTORY: u64 = 10;
pub const DEFAULT_ACTION_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CheckError {
    #[error("Timeout parameter can't be 0")]
    ZeroTimeout,
    #[error("Command or Module parameter has to be set")]
    NothingToRun,
    #[error("Command and Module parameters cannot be set together")]
    CommandAndModule,
    #[error("Parser can be used only with Command parameter")]
    ParserWithoutCommand,
    #[error("Action Command or Module parameter has to be set")]
    ActionNothingToRun,
    #[error("Action Command and Module parameters cannot be set together")]
    ActionCommandAndModule,
    #[error("unknown module {0}")]
    UnknownModule(String),
    #[error("unknown parser {0}")]
    UnknownParser(String),
    #[error("uid and gid cannot be changed for module {0}")]
    ModulePrivileges(String),
    #[error("invalid parameter {name}: {reason}")]
    InvalidParam { name: String, reason: String },
}

/// Command line before `%(Key)s` expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandTemplate {
    Shell(String),
    Exec(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Command {
        command: CommandTemplate,
        parser: Option<String>,
    },
    Module(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionSpec {
    pub target: Target,
    pub timeout: Duration,
}

/// Validated, immutable configuration of one check.
#[derive(Debug, Clone)]
pub struct CheckSpec {
    pub name: String,
    pub target: Target,
    pub interval: Duration,
    pub timeout: Duration,
    pub history: usize,
    pub privileges: Privileges,
    pub maintenance_lock: Option<PathBuf>,
    pub action: Option<ActionSpec>,
    /// Every parameter with defaults applied, as exposed to command
    /// templates, filters and snapshots.
    pub params: Map<String, Value>,
}

fn is_set(value: Option<&Value>) -> bool {
    !matches!(value, None | Some(Value::Null) | Some(Value::Bool(false)))
        && value.and_then(Value::as_str) != Some("")
}

fn invalid(name: &str, reason: impl Into<String>) -> CheckError {
    CheckError::InvalidParam {
        name: name.to_string(),
        reason: reason.into(),
    }
}

fn seconds(params: &Map<String, Value>, name: &str) -> Result<Duration, CheckError> {
    match params.get(name) {
        Some(Value::Number(n)) => n
            .as_f64()
            .filter(|secs| *secs >= 0.0 && secs.is_finite())
            .map(Duration::from_secs_f64)
            .ok_or_else(|| invalid(name, format!("has to be a non-negative number, not {n}"))),
        Some(other) => Err(invalid(name, format!("has to be a number, not {other}"))),
        None => Err(invalid(name, "missing")),
    }
}

fn command_template(name: &str, value: &Value) -> Result<CommandTemplate, CheckError> {
    match value {
        Value::String(line) => Ok(CommandTemplate::Shell(line.clone())),
        Value::Array(items) if !items.is_empty() => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| invalid(name, "every argument has to be a string"))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(CommandTemplate::Exec),
        _ => Err(invalid(name, "has to be a string or a non-empty list")),
    }
}

fn module_name(caps: &Capabilities, value: &Value) -> Result<String, CheckError> {
    let name = value
        .as_str()
        .ok_or_else(|| invalid("Module", "has to be a string"))?;
    if caps.module(name).is_none() {
        return Err(CheckError::UnknownModule(name.to_string()));
    }
    Ok(name.to_string())
}

/// Fills in the parameters every check carries.
pub fn apply_defaults(params: &mut Map<String, Value>) {
    let defaults = [
        ("Command", Value::Null),
        ("Module", Value::Null),
        ("Parser", Value::Null),
        ("Interval", Value::from(0)),
        ("Timeout", Value::from(DEFAULT_TIMEOUT_SECS)),
        ("History", Value::from(DEFAULT_HISTORY)),
        ("uid", Value::from("default")),
        ("gid", Value::from("default")),
        ("Template", Value::Null),
        ("Action", Value::Null),
        ("MaintenanceLock", Value::Null),
    ];
    for (key, value) in defaults {
        params.entry(key).or_insert(value);
    }
    if let Some(Value::Object(action)) = params.get_mut("Action") {
        action.entry("Command").or_insert(Value::Null);
        action.entry("Module").or_insert(Value::Null);
        action
            .entry("Timeout")
            .or_insert(Value::from(DEFAULT_ACTION_TIMEOUT_SECS));
    }
}

impl CheckSpec {
    pub fn from_params(
        name: &str,
        mut params: Map<String, Value>,
        caps: &Capabilities,
    ) -> Result<Self, CheckError> {
        apply_defaults(&mut params);

        let timeout = seconds(&params, "Timeout")?;
        if timeout.is_zero() {
            return Err(CheckError::ZeroTimeout);
        }
        let interval = seconds(&params, "Interval")?;
        let history = params
            .get("History")
            .and_then(Value::as_u64)
            .and_then(|h| usize::try_from(h).ok())
            .ok_or_else(|| invalid("History", "has to be a non-negative integer"))?;

        let has_command = is_set(params.get("Command"));
        let has_module = is_set(params.get("Module"));
        let has_parser = is_set(params.get("Parser"));
        if !has_command && !has_module {
            return Err(CheckError::NothingToRun);
        }
        if has_command && has_module {
            return Err(CheckError::CommandAndModule);
        }
        if has_parser && !has_command {
            return Err(CheckError::ParserWithoutCommand);
        }

        let target = match (params.get("Command"), params.get("Module")) {
            (Some(command), _) if has_command => {
                let parser = if has_parser {
                    let parser = params
                        .get("Parser")
                        .and_then(Value::as_str)
                        .ok_or_else(|| invalid("Parser", "has to be a string"))?;
                    if caps.parser(parser).is_none() {
                        return Err(CheckError::UnknownParser(parser.to_string()));
                    }
                    Some(parser.to_string())
                } else {
                    None
                };
                Target::Command {
                    command: command_template("Command", command)?,
                    parser,
                }
            }
            (_, Some(module)) => Target::Module(module_name(caps, module)?),
            _ => return Err(CheckError::NothingToRun),
        };

        let action = match params.get("Action") {
            None | Some(Value::Null) => None,
            Some(Value::Object(action)) => Some(Self::action(action, caps)?),
            Some(other) => return Err(invalid("Action", format!("unresolved action {other}"))),
        };

        let privileges = Privileges {
            uid: IdSpec::from_param(params.get("uid")).map_err(|e| invalid("uid", e))?,
            gid: IdSpec::from_param(params.get("gid")).map_err(|e| invalid("gid", e))?,
        };
        if !privileges.is_default() {
            let module = [Some(&target), action.as_ref().map(|a| &a.target)]
                .into_iter()
                .flatten()
                .find_map(|t| match t {
                    Target::Module(module) => Some(module.clone()),
                    Target::Command { .. } => None,
                });
            if let Some(module) = module {
                return Err(CheckError::ModulePrivileges(module));
            }
        }

        let maintenance_lock = match params.get("MaintenanceLock") {
            None | Some(Value::Null) => None,
            Some(Value::String(path)) if !path.is_empty() => Some(PathBuf::from(path)),
            Some(other) => {
                return Err(invalid("MaintenanceLock", format!("not a path: {other}")))
            }
        };

        Ok(Self {
            name: name.to_string(),
            target,
            interval,
            timeout,
            history,
            privileges,
            maintenance_lock,
            action,
            params,
        })
    }

    fn action(action: &Map<String, Value>, caps: &Capabilities) -> Result<ActionSpec, CheckError> {
        let has_command = is_set(action.get("Command"));
        let has_module = is_set(action.get("Module"));
        let target = match (has_command, has_module) {
            (true, true) => return Err(CheckError::ActionCommandAndModule),
            (false, false) => return Err(CheckError::ActionNothingToRun),
            (true, false) => Target::Command {
                command: command_template("Action.Command", &action["Command"])?,
                parser: None,
            },
            (false, true) => Target::Module(module_name(caps, &action["Module"])?),
        };
        let timeout = seconds(action, "Timeout")?;
        if timeout.is_zero() {
            return Err(invalid("Action.Timeout", "can't be 0"));
        }
        Ok(ActionSpec { target, timeout })
    }

    /// Single key/value filter match against the effective parameters.
    pub fn matches(&self, key: &str, value: &Value) -> bool {
        self.params.get(key) == Some(value)
    }
}

/// Result of [`Check::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Launched,
    AlreadyRunning,
    Stopping,
}

/// Result of [`Check::collect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collected {
    Idle,
    Pending,
    Completed { status: Status, deadlocked: bool },
}

#[derive(Debug)]
struct InFlight {
    rx: oneshot::Receiver<ExecutionReport>,
    /// Force request generation this run answers, if forced.
    forced_seq: Option<u64>,
    started: Instant,
}

#[derive(Debug)]
pub struct Check {
    spec: Arc<CheckSpec>,
    next_run: Option<Instant>,
    forced: bool,
    force_seq: u64,
    current: Option<InFlight>,
    history: VecDeque<CheckResult>,
    forced_result: Option<CheckResult>,
    suspended: bool,
    stopping: bool,
}

impl Check {
    pub fn new(spec: CheckSpec) -> Self {
        let mut check = Self {
            spec: Arc::new(spec),
            next_run: None,
            forced: false,
            force_seq: 0,
            current: None,
            history: VecDeque::new(),
            forced_result: None,
            suspended: false,
            stopping: false,
        };
        check.schedule_next(Instant::now());
        check
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &CheckSpec {
        &self.spec
    }

    pub fn is_running(&self) -> bool {
        self.current.is_some()
    }

    #[cfg(test)]
    pub fn is_forced(&self) -> bool {
        self.forced
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn next_run(&self) -> Option<Instant> {
        self.next_run
    }

    pub fn history(&self) -> impl Iterator<Item = &CheckResult> {
        self.history.iter()
    }

    pub fn last_result(&self) -> Option<&CheckResult> {
        self.history.back()
    }

    pub fn forced_result(&self) -> Option<&CheckResult> {
        self.forced_result.as_ref()
    }

    pub fn is_due(&self, now: Instant) -> bool {
        if self.stopping {
            return false;
        }
        if self.forced {
            return true;
        }
        !self.suspended
            && !self.spec.interval.is_zero()
            && self.next_run.is_some_and(|at| now >= at)
    }

    /// Sets `nextRun = now + interval` for interval checks.
    pub fn schedule_next(&mut self, now: Instant) {
        if !self.spec.interval.is_zero() {
            self.next_run = Some(now + self.spec.interval);
        }
    }

    /// Marks the check for a forced run and drops the previous forced result.
    pub fn force(&mut self) {
        self.forced = true;
        self.force_seq += 1;
        self.forced_result = None;
    }

    /// Stops accepting new runs. An in-flight run is still collected.
    pub fn stop(&mut self) {
        self.stopping = true;
    }

    pub fn run(&mut self, launcher: &Launcher) -> RunOutcome {
        if self.stopping {
            return RunOutcome::Stopping;
        }
        if self.current.is_some() {
            return RunOutcome::AlreadyRunning;
        }

        let forced_seq = self.forced.then_some(self.force_seq);
        let invocation = Invocation {
            spec: Arc::clone(&self.spec),
            forced: self.forced,
            last_result: self.history.back().cloned(),
        };
        debug!(check = %self.spec.name, forced = self.forced, "launching check");
        self.current = Some(InFlight {
            rx: launcher.launch(invocation),
            forced_seq,
            started: Instant::now(),
        });
        RunOutcome::Launched
    }

    /// Non-blocking; moves a finished run's result into history.
    pub fn collect(&mut self) -> Collected {
        let Some(in_flight) = self.current.as_mut() else {
            return Collected::Idle;
        };
        let report = match in_flight.rx.try_recv() {
            Ok(report) => report,
            Err(TryRecvError::Empty) => return Collected::Pending,
            Err(TryRecvError::Closed) => {
                error!(check = %self.spec.name, "executor vanished without a result");
                ExecutionReport::failed(
                    CheckResult::error("Check executor terminated unexpectedly")
                        .with_forced(in_flight.forced_seq.is_some()),
                )
            }
        };
        let Some(in_flight) = self.current.take() else {
            return Collected::Idle;
        };

        let now = Instant::now();
        let result = report.outcome.into_result();
        let status = result.status;
        info!(
            check = %self.spec.name,
            status = %status,
            forced = result.forced,
            elapsed_ms = now.duration_since(in_flight.started).as_millis() as u64,
            "check result collected"
        );

        match in_flight.forced_seq {
            Some(seq) => {
                if seq == self.force_seq {
                    self.forced_result = Some(result.clone());
                    self.forced = false;
                }
            }
            None => self.schedule_next(now),
        }

        self.history.push_back(result);
        while self.history.len() > self.spec.history {
            self.history.pop_front();
        }

        if report.deadlocked {
            error!(
                check = %self.spec.name,
                "check deadlocked, suspending scheduled runs until forced"
            );
            self.suspended = true;
        } else if in_flight.forced_seq.is_some() && self.suspended {
            info!(check = %self.spec.name, "forced run completed, resuming schedule");
            self.suspended = false;
            self.schedule_next(now);
        }

        Collected::Completed {
            status,
            deadlocked: report.deadlocked,
        }
    }

    pub fn snapshot(&self, with_history: bool) -> CheckSnapshot {
        let now = Instant::now();
        let next_run = self.next_run.map(|at| {
            let wall = SystemTime::now() + at.saturating_duration_since(now);
            format_timestamp(wall)
        });
        CheckSnapshot {
            name: self.spec.name.clone(),
            parameters: self.spec.params.clone(),
            next_run,
            last_result: self.last_result().cloned(),
            forced_result: self.forced_result.clone(),
            running: self.is_running(),
            forced: self.forced,
            suspended: self.suspended,
            results: with_history.then(|| self.history.iter().cloned().collect()),
        }
    }
}

/// Point-in-time view of a check, safe to hand out of the registry lock.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckSnapshot {
    pub name: String,
    pub parameters: Map<String, Value>,
    pub next_run: Option<String>,
    pub last_result: Option<CheckResult>,
    pub forced_result: Option<CheckResult>,
    pub running: bool,
    pub forced: bool,
    pub suspended: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<CheckResult>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::Executor;
    use crate::gate::ConcurrencyGate;
    use crate::process::ProcessRunner;
    use crate::result::Level;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn spec(value: Value) -> Result<CheckSpec, CheckError> {
        CheckSpec::from_params("test", params(value), &Capabilities::builtin())
    }

    fn launcher(size: usize) -> Launcher {
        Launcher::new(
            Executor::new(ProcessRunner::default(), Arc::new(Capabilities::builtin())),
            ConcurrencyGate::new(size),
        )
    }

    async fn wait_collect(check: &mut Check) -> Collected {
        for _ in 0..200 {
            match check.collect() {
                Collected::Pending => tokio::time::sleep(Duration::from_millis(25)).await,
                other => return other,
            }
        }
        panic!("check {} never completed", check.name());
    }

    #[test]
    fn validation_messages() {
        assert_eq!(
            spec(json!({"Command": "true", "Timeout": 0})).unwrap_err(),
            CheckError::ZeroTimeout
        );
        assert_eq!(spec(json!({})).unwrap_err(), CheckError::NothingToRun);
        assert_eq!(
            spec(json!({"Command": "true", "Module": "uname"})).unwrap_err(),
            CheckError::CommandAndModule
        );
        assert_eq!(
            spec(json!({"Module": "uname", "Parser": "nagios"})).unwrap_err(),
            CheckError::ParserWithoutCommand
        );
        assert_eq!(
            spec(json!({"Module": "nope"})).unwrap_err(),
            CheckError::UnknownModule("nope".to_string())
        );
        assert_eq!(
            spec(json!({"Command": "true", "Parser": "nope"})).unwrap_err(),
            CheckError::UnknownParser("nope".to_string())
        );
        assert_eq!(
            spec(json!({"Command": "true", "Action": {"Timeout": 5}})).unwrap_err(),
            CheckError::ActionNothingToRun
        );
        assert_eq!(
            CheckError::ZeroTimeout.to_string(),
            "Timeout parameter can't be 0"
        );
    }

    #[test]
    fn defaults_are_applied() {
        let spec = spec(json!({"Command": ["ls", "-l"], "Action": {"Command": "true"}})).unwrap();
        assert_eq!(spec.timeout, Duration::from_secs(1800));
        assert_eq!(spec.history, 10);
        assert!(spec.interval.is_zero());
        assert!(spec.privileges.is_default());
        assert_eq!(
            spec.target,
            Target::Command {
                command: CommandTemplate::Exec(vec!["ls".to_string(), "-l".to_string()]),
                parser: None,
            }
        );
        assert_eq!(spec.action.unwrap().timeout, Duration::from_secs(60));
        assert_eq!(spec.params["uid"], json!("default"));
    }

    #[test]
    fn interval_checks_are_scheduled_at_construction() {
        let before = Instant::now();
        let check = Check::new(spec(json!({"Command": "true", "Interval": 60})).unwrap());
        let next = check.next_run().unwrap();
        assert!(next >= before + Duration::from_secs(60));
        assert!(!check.is_due(Instant::now()));
        assert!(check.is_due(next));

        let forced_only = Check::new(spec(json!({"Command": "true"})).unwrap());
        assert!(forced_only.next_run().is_none());
        assert!(!forced_only.is_due(Instant::now() + Duration::from_secs(3600)));
    }

    #[test]
    fn forced_flag_makes_check_due() {
        let mut check = Check::new(spec(json!({"Command": "true"})).unwrap());
        check.force();
        assert!(check.is_due(Instant::now()));
        check.stop();
        assert!(!check.is_due(Instant::now()));
    }

    #[tokio::test]
    async fn at_most_one_run_in_flight() {
        let launcher = launcher(4);
        let mut check = Check::new(spec(json!({"Command": "sleep 0.3"})).unwrap());
        assert_eq!(check.run(&launcher), RunOutcome::Launched);
        assert_eq!(check.run(&launcher), RunOutcome::AlreadyRunning);
        assert_eq!(check.collect(), Collected::Pending);

        assert!(matches!(wait_collect(&mut check).await, Collected::Completed { .. }));
        assert_eq!(check.history().count(), 1);
        assert_eq!(check.collect(), Collected::Idle);
    }

    #[tokio::test]
    async fn history_keeps_most_recent_results() {
        let launcher = launcher(4);
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("runs");
        let mut check = Check::new(
            spec(json!({
                "Command": "n=$(( $(cat %(Counter)s 2>/dev/null || echo 0) + 1 )); echo $n > %(Counter)s; echo run-$n",
                "Counter": counter.to_str().unwrap(),
                "History": 3,
            }))
            .unwrap(),
        );
        for _ in 0..5 {
            check.run(&launcher);
            wait_collect(&mut check).await;
        }
        let runs: Vec<_> = check
            .history()
            .map(|result| result.messages_at(Level::Info).to_vec())
            .collect();
        assert_eq!(
            runs,
            vec![
                vec!["run-3".to_string()],
                vec!["run-4".to_string()],
                vec!["run-5".to_string()],
            ]
        );
        assert_eq!(check.last_result().unwrap().messages_at(Level::Info), ["run-5"]);
    }

    #[test]
    fn privileges_are_refused_for_modules() {
        assert_eq!(
            spec(json!({"Module": "uname", "uid": 65534})).unwrap_err(),
            CheckError::ModulePrivileges("uname".to_string())
        );
        assert_eq!(
            spec(json!({"Command": "true", "gid": "nogroup", "Action": {"Module": "uname"}}))
                .unwrap_err(),
            CheckError::ModulePrivileges("uname".to_string())
        );
        let command = spec(json!({"Command": "id -u", "uid": 65534, "Action": {"Command": "true"}}))
            .unwrap();
        assert!(!command.privileges.is_default());
        assert!(spec(json!({"Module": "uname", "uid": "default"})).is_ok());
    }

    #[tokio::test]
    async fn forced_result_is_kept_separately() {
        let launcher = launcher(4);
        let mut check = Check::new(spec(json!({"Command": "echo hello; exit 0"})).unwrap());
        check.force();
        assert!(check.forced_result().is_none());
        check.run(&launcher);
        let collected = wait_collect(&mut check).await;

        assert_eq!(
            collected,
            Collected::Completed {
                status: Status::Ok,
                deadlocked: false
            }
        );
        assert!(!check.is_forced());
        let forced = check.forced_result().unwrap();
        assert!(forced.forced);
        assert_eq!(forced.messages_at(Level::Info), ["hello"]);
        assert!(check.next_run().is_none());

        check.force();
        assert!(check.forced_result().is_none());
    }

    #[tokio::test]
    async fn force_during_older_forced_run_needs_a_fresh_run() {
        let launcher = launcher(4);
        let mut check = Check::new(spec(json!({"Command": "sleep 0.2"})).unwrap());
        check.force();
        check.run(&launcher);
        check.force();
        wait_collect(&mut check).await;

        assert!(check.forced_result().is_none());
        assert!(check.is_forced());
        check.run(&launcher);
        wait_collect(&mut check).await;
        assert!(check.forced_result().is_some());
    }

    #[tokio::test]
    async fn scheduled_run_advances_next_run() {
        let launcher = launcher(4);
        let mut check =
            Check::new(spec(json!({"Command": "true", "Interval": 0.05})).unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(check.is_due(Instant::now()));
        check.run(&launcher);
        let before = Instant::now();
        wait_collect(&mut check).await;
        assert!(check.next_run().unwrap() > before);
    }
}
