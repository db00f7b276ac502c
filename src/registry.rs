//! Owns every check, the forced-run ledger and the scheduling tick.

use crate::check::{Check, CheckSnapshot, CheckSpec, Collected, RunOutcome};
use crate::executor::{Executor, Launcher};
use crate::gate::ConcurrencyGate;
use crate::modules::Capabilities;
use crate::process::{Escalation, ProcessRunner};
use crate::result::Status;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const BASE_TEMPLATE: &str = "BasePlugin";
const SHUTDOWN_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Required BasePlugin template is not configured")]
    MissingBaseTemplate,
    #[error("No plugins loaded")]
    NoChecksLoaded,
    #[error("Plugin {0} not found")]
    NoSuchCheck(String),
    #[error("No plugins found")]
    NoChecksFound,
    #[error("filter has to contain exactly one key, got {0}")]
    InvalidFilter(usize),
    #[error("Process {0} not found")]
    NoSuchProcess(u64),
    #[error("registry is shutting down")]
    Stopping,
}

/// The three check tables of the configuration.
#[derive(Debug, Clone, Default)]
pub struct CheckTables {
    pub templates: Map<String, Value>,
    pub actions: Map<String, Value>,
    pub plugins: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub concurrency: usize,
    pub escalation: Escalation,
    pub max_processes: Option<usize>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            concurrency: crate::gate::default_size(),
            escalation: Escalation::default(),
            max_processes: None,
        }
    }
}

/// What one `tick` did, for logging and metrics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub launched: Vec<String>,
    pub completed: Vec<(String, Status)>,
    pub deadlocked: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessEntry {
    pub id: u64,
    pub plugins: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ProcessStatus {
    InProgress { pending: Vec<String> },
    Complete { plugins: Vec<CheckSnapshot> },
}

/// Forced-run requests. Ids start at 1 and are never reused.
#[derive(Debug)]
struct Ledger {
    entries: VecDeque<ProcessEntry>,
    next_id: u64,
    max: Option<usize>,
}

impl Ledger {
    fn new(max: Option<usize>) -> Self {
        Self {
            entries: VecDeque::new(),
            next_id: 1,
            max,
        }
    }

    fn push(&mut self, plugins: Vec<String>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push_back(ProcessEntry { id, plugins });
        if let Some(max) = self.max {
            while self.entries.len() > max.max(1) {
                if let Some(evicted) = self.entries.pop_front() {
                    debug!(process = evicted.id, "evicting old process");
                }
            }
        }
        id
    }

    fn get(&self, id: u64) -> Option<&ProcessEntry> {
        let first = self.entries.front()?.id;
        let offset = id.checked_sub(first)?;
        self.entries
            .get(usize::try_from(offset).ok()?)
            .filter(|entry| entry.id == id)
    }
}

#[derive(Debug)]
struct Inner {
    checks: BTreeMap<String, Check>,
    ledger: Ledger,
    stopping: bool,
}

#[derive(Debug)]
pub struct Registry {
    inner: Mutex<Inner>,
    launcher: Launcher,
}

fn merge(into: &mut Map<String, Value>, from: &Map<String, Value>) {
    for (key, value) in from {
        into.insert(key.clone(), value.clone());
    }
}

fn resolve_params(
    name: &str,
    options: &Map<String, Value>,
    tables: &CheckTables,
    base: &Map<String, Value>,
) -> Result<Map<String, Value>, String> {
    let mut params = base.clone();

    match options.get("Template") {
        None | Some(Value::Null) => {}
        Some(Value::String(template)) => match tables.templates.get(template) {
            Some(Value::Object(custom)) => merge(&mut params, custom),
            Some(_) => return Err(format!("template {template} is not a mapping")),
            None => return Err(format!("Can't find configured template {template}")),
        },
        Some(other) => return Err(format!("Template has to be a name, not {other}")),
    }

    merge(&mut params, options);

    if let Some(Value::String(action)) = params.get("Action").cloned() {
        match tables.actions.get(&action) {
            Some(Value::Object(definition)) => {
                params.insert("Action".to_string(), Value::Object(definition.clone()));
            }
            Some(_) => return Err(format!("action {action} is not a mapping")),
            None => return Err(format!("Can't find configured action {action}")),
        }
    }

    debug!(check = name, "parameters resolved");
    Ok(params)
}

impl Registry {
    /// Builds every enabled check. A broken check is logged and skipped;
    /// only a missing base template or nothing loaded at all is fatal.
    pub fn load(
        tables: &CheckTables,
        settings: EngineSettings,
        capabilities: Capabilities,
    ) -> Result<Self, RegistryError> {
        let base = match tables.templates.get(BASE_TEMPLATE) {
            Some(Value::Object(base)) => base.clone(),
            Some(Value::Null) => Map::new(),
            _ => {
                error!("Required {BASE_TEMPLATE} template is not configured");
                return Err(RegistryError::MissingBaseTemplate);
            }
        };

        let mut checks = BTreeMap::new();
        for (name, options) in &tables.plugins {
            let Value::Object(options) = options else {
                warn!(check = %name, "plugin definition is not a mapping, not loaded");
                continue;
            };
            if options.get("Enabled") == Some(&Value::Bool(false)) {
                info!(check = %name, "plugin is disabled, skipping");
                continue;
            }

            let params = match resolve_params(name, options, tables, &base) {
                Ok(params) => params,
                Err(err) => {
                    warn!(check = %name, error = %err, "plugin not loaded");
                    continue;
                }
            };
            match CheckSpec::from_params(name, params, &capabilities) {
                Ok(spec) => {
                    info!(check = %name, "loaded plugin");
                    checks.insert(name.clone(), Check::new(spec));
                }
                Err(err) => warn!(check = %name, error = %err, "plugin not loaded"),
            }
        }

        if checks.is_empty() {
            error!("No plugins loaded");
            return Err(RegistryError::NoChecksLoaded);
        }

        info!(
            checks = checks.len(),
            parallel = settings.concurrency,
            "plugins will run approximately at this many parallel processes"
        );
        let gate = ConcurrencyGate::new(settings.concurrency);
        let executor = Executor::new(
            ProcessRunner::new(settings.escalation),
            Arc::new(capabilities),
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                checks,
                ledger: Ledger::new(settings.max_processes),
                stopping: false,
            }),
            launcher: Launcher::new(executor, gate),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        self.launcher.gate()
    }

    /// Collects finished runs, then launches every due check. The only place
    /// execution starts.
    pub fn tick(&self) -> TickReport {
        let now = Instant::now();
        let mut report = TickReport::default();
        let mut inner = self.lock();

        for (name, check) in inner.checks.iter_mut() {
            if let Collected::Completed { status, deadlocked } = check.collect() {
                report.completed.push((name.clone(), status));
                if deadlocked {
                    report.deadlocked.push(name.clone());
                }
            }
        }

        if inner.stopping {
            return report;
        }

        for (name, check) in inner.checks.iter_mut() {
            if !check.is_due(now) {
                continue;
            }
            match check.run(&self.launcher) {
                RunOutcome::Launched => report.launched.push(name.clone()),
                RunOutcome::AlreadyRunning => debug!(check = %name, "still running, skipping"),
                RunOutcome::Stopping => {}
            }
        }
        report
    }

    /// Forces a run of the named checks plus every check whose parameter
    /// `key` equals `value`. Returns the process id to poll.
    pub fn add_process(
        &self,
        names: &[String],
        filter: Option<&Map<String, Value>>,
    ) -> Result<u64, RegistryError> {
        let mut inner = self.lock();
        if inner.stopping {
            return Err(RegistryError::Stopping);
        }

        let mut selected: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for name in names {
            if !inner.checks.contains_key(name) {
                return Err(RegistryError::NoSuchCheck(name.clone()));
            }
            if seen.insert(name.clone()) {
                selected.push(name.clone());
            }
        }

        if let Some(filter) = filter {
            let mut pairs = filter.iter();
            let (Some((key, value)), None) = (pairs.next(), pairs.next()) else {
                return Err(RegistryError::InvalidFilter(filter.len()));
            };
            for check in inner.checks.values() {
                if check.spec().matches(key, value) && seen.insert(check.name().to_string()) {
                    selected.push(check.name().to_string());
                }
            }
        }

        if selected.is_empty() {
            return Err(RegistryError::NoChecksFound);
        }

        info!(
            count = selected.len(),
            plugins = %selected.join(", "),
            "forcing run of plugins"
        );
        for name in &selected {
            if let Some(check) = inner.checks.get_mut(name) {
                check.force();
            }
        }
        Ok(inner.ledger.push(selected))
    }

    pub fn get_process(&self, id: u64) -> Result<ProcessEntry, RegistryError> {
        self.lock()
            .ledger
            .get(id)
            .cloned()
            .ok_or(RegistryError::NoSuchProcess(id))
    }

    pub fn list_processes(&self) -> Vec<ProcessEntry> {
        self.lock().ledger.entries.iter().cloned().collect()
    }

    /// In progress until every member has a forced result from this request,
    /// then the same complete view on every poll.
    pub fn poll_process(&self, id: u64) -> Result<ProcessStatus, RegistryError> {
        let inner = self.lock();
        let entry = inner.ledger.get(id).ok_or(RegistryError::NoSuchProcess(id))?;

        let pending: Vec<String> = entry
            .plugins
            .iter()
            .filter(|name| {
                inner
                    .checks
                    .get(name.as_str())
                    .map_or(true, |check| check.forced_result().is_none())
            })
            .cloned()
            .collect();
        if !pending.is_empty() {
            return Ok(ProcessStatus::InProgress { pending });
        }

        let plugins = entry
            .plugins
            .iter()
            .filter_map(|name| inner.checks.get(name.as_str()))
            .map(|check| check.snapshot(false))
            .collect();
        Ok(ProcessStatus::Complete { plugins })
    }

    pub fn list_checks(&self) -> Vec<CheckSnapshot> {
        self.lock()
            .checks
            .values()
            .map(|check| check.snapshot(false))
            .collect()
    }

    pub fn get_check(&self, name: &str) -> Result<CheckSnapshot, RegistryError> {
        self.lock()
            .checks
            .get(name)
            .map(|check| check.snapshot(true))
            .ok_or_else(|| RegistryError::NoSuchCheck(name.to_string()))
    }

    pub fn check_names(&self) -> Vec<String> {
        self.lock().checks.keys().cloned().collect()
    }

    fn running(&self) -> Vec<String> {
        let mut inner = self.lock();
        for check in inner.checks.values_mut() {
            check.collect();
        }
        inner
            .checks
            .values()
            .filter(|check| check.is_running())
            .map(|check| check.name().to_string())
            .collect()
    }

    /// Stops scheduling and waits up to `timeout` for in-flight runs, which
    /// end through their own timeout escalation. Returns the checks still
    /// running when the wait gave up.
    pub async fn shutdown(&self, timeout: Duration) -> Vec<String> {
        {
            let mut inner = self.lock();
            inner.stopping = true;
            for check in inner.checks.values_mut() {
                check.stop();
            }
        }
        self.gate().close();

        let deadline = Instant::now() + timeout;
        let mut last_count = usize::MAX;
        loop {
            let left = self.running();
            if left.is_empty() {
                info!("all plugins stopped");
                return left;
            }
            if left.len() != last_count {
                info!(
                    "Waiting for {} plugins to shutdown: {}",
                    left.len(),
                    left.join(",")
                );
                last_count = left.len();
            }
            if Instant::now() >= deadline {
                warn!(left = left.len(), "giving up waiting for plugins");
                return left;
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }
    }
}
