//! Runs a single check invocation and always produces a result.

use crate::check::{ActionSpec, CheckSpec, CommandTemplate, Target};
use crate::gate::ConcurrencyGate;
use crate::modules::{Capabilities, ModuleContext, ModuleError};
use crate::privileges::ResolvedIds;
use crate::process::{CommandOutput, CommandSpec, ExecOptions, ProcessError, ProcessRunner};
use crate::result::{CheckResult, Level, Status};
use crate::template::{self, TemplateError};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time;
use tracing::{debug, error, info, warn};

pub const MAINTENANCE_MESSAGE: &str = "Skipped because of maintenance in progress";

/// One run of one check, owned by the task executing it.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub spec: Arc<CheckSpec>,
    pub forced: bool,
    pub last_result: Option<CheckResult>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Maintenance,
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Completed(CheckResult),
    Skipped {
        reason: SkipReason,
        result: CheckResult,
    },
}

impl Outcome {
    pub fn result(&self) -> &CheckResult {
        match self {
            Outcome::Completed(result) | Outcome::Skipped { result, .. } => result,
        }
    }

    pub fn into_result(self) -> CheckResult {
        match self {
            Outcome::Completed(result) | Outcome::Skipped { result, .. } => result,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub outcome: Outcome,
    /// A process tree survived SIGKILL during this run.
    pub deadlocked: bool,
}

impl ExecutionReport {
    pub fn failed(result: CheckResult) -> Self {
        Self {
            outcome: Outcome::Completed(result),
            deadlocked: false,
        }
    }
}

/// Outcome of one command or module body before it is merged into the
/// check result.
struct Body {
    result: CheckResult,
    deadlocked: bool,
}

impl Body {
    fn ok(result: CheckResult) -> Self {
        Self {
            result,
            deadlocked: false,
        }
    }
}

#[derive(Clone)]
pub struct Executor {
    runner: ProcessRunner,
    capabilities: Arc<Capabilities>,
}

impl Executor {
    pub fn new(runner: ProcessRunner, capabilities: Arc<Capabilities>) -> Self {
        Self {
            runner,
            capabilities,
        }
    }

    pub async fn execute(&self, inv: Invocation) -> ExecutionReport {
        let spec = &inv.spec;

        if let Some(lock) = &spec.maintenance_lock {
            if lock.exists() {
                info!(check = %spec.name, lock = %lock.display(), "maintenance in progress, skipping");
                let mut result = CheckResult::new(Status::Warn).with_forced(inv.forced);
                result.add_warn(MAINTENANCE_MESSAGE);
                return ExecutionReport {
                    outcome: Outcome::Skipped {
                        reason: SkipReason::Maintenance,
                        result,
                    },
                    deadlocked: false,
                };
            }
        }

        let ids = match spec.privileges.resolve() {
            Ok(ids) => ids,
            Err(err) => {
                error!(check = %spec.name, error = %err, "can't drop privileges");
                return ExecutionReport::failed(
                    CheckResult::error(err.to_string()).with_forced(inv.forced),
                );
            }
        };
        if !spec.privileges.is_default() {
            debug!(check = %spec.name, uid = %spec.privileges.uid, gid = %spec.privileges.gid, "running with dropped privileges");
        }

        let mut main = self
            .run_target(spec, &spec.target, spec.timeout, ids, inv.last_result.as_ref(), None)
            .await;

        let mut deadlocked = main.deadlocked;
        if let Some(action) = &spec.action {
            let action_body = self.run_action(spec, action, ids, &main.result).await;
            deadlocked |= action_body.deadlocked;
            main.result.set_action(action_body.result);
        }

        let result = main.result.with_forced(inv.forced);
        info!(check = %spec.name, status = %result.status, forced = inv.forced, "check finished");
        ExecutionReport {
            outcome: Outcome::Completed(result),
            deadlocked,
        }
    }

    async fn run_action(
        &self,
        spec: &CheckSpec,
        action: &ActionSpec,
        ids: ResolvedIds,
        main: &CheckResult,
    ) -> Body {
        debug!(check = %spec.name, "executing action");
        self.run_target(spec, &action.target, action.timeout, ids, Some(main), Some(main))
            .await
    }

    /// `context` is the result template fields come from; `action_of` is set
    /// when running an action for that main result.
    async fn run_target(
        &self,
        spec: &CheckSpec,
        target: &Target,
        timeout: Duration,
        ids: ResolvedIds,
        context: Option<&CheckResult>,
        action_of: Option<&CheckResult>,
    ) -> Body {
        match target {
            Target::Command { command, parser } => {
                self.run_command(spec, command, parser.as_deref(), timeout, ids, context)
                    .await
            }
            Target::Module(name) => {
                let ctx = ModuleContext::new(
                    spec.name.clone(),
                    spec.params.clone(),
                    timeout,
                    self.runner.clone(),
                    ids,
                )
                .with_last_result(context.cloned())
                .with_result(action_of.cloned());
                self.run_module(name, ctx).await
            }
        }
    }

    async fn run_command(
        &self,
        spec: &CheckSpec,
        command: &CommandTemplate,
        parser: Option<&str>,
        timeout: Duration,
        ids: ResolvedIds,
        context: Option<&CheckResult>,
    ) -> Body {
        let mut fields = spec.params.clone();
        if let Some(result) = context {
            fields.extend(result.to_fields());
        }

        let command = match expand_command(command, &fields) {
            Ok(command) => command,
            Err(err) => {
                warn!(check = %spec.name, error = %err, "can't expand command");
                return Body::ok(CheckResult::error(format!("Invalid command template: {err}")));
            }
        };

        let opts = ExecOptions {
            stdin: serde_json::to_vec(&Value::Object(fields)).ok(),
            uid: ids.uid,
            gid: ids.gid,
            ..ExecOptions::default()
        };

        let output = match self.runner.run(&command, Some(timeout), opts).await {
            Ok(output) => output,
            Err(err) => return self.process_failure(spec, err),
        };

        let result = match parser {
            Some(name) => self.parse_with(spec, name, &output),
            None => interpret_output(&output),
        };
        Body::ok(result)
    }

    fn process_failure(&self, spec: &CheckSpec, err: ProcessError) -> Body {
        let deadlocked = err.is_deadlock();
        if deadlocked {
            error!(check = %spec.name, error = %err, "execution deadlock");
        } else {
            warn!(check = %spec.name, error = %err, "command failed");
        }
        Body {
            result: CheckResult::error(err.to_string()),
            deadlocked,
        }
    }

    fn parse_with(&self, spec: &CheckSpec, name: &str, output: &CommandOutput) -> CheckResult {
        debug!(check = %spec.name, parser = name, "running parser");
        let parsed = match self.capabilities.parser(name) {
            Some(parser) => parser.parse(&output.stdout, &output.stderr),
            None => Err(ModuleError::Failed(format!("parser {name} is not available"))),
        };
        match parsed {
            Ok(result) => result,
            Err(err) => {
                warn!(check = %spec.name, parser = name, error = %err, "parser execution failed");
                let mut result = CheckResult::new(Status::Error);
                result.add_error(&output.stderr);
                result.add_error(&format!("Parser run failed: {err}"));
                result.add_info(&output.stdout);
                result
            }
        }
    }

    async fn run_module(&self, name: &str, ctx: ModuleContext) -> Body {
        let check = ctx.check.clone();
        let timeout = ctx.timeout;
        let Some(module) = self.capabilities.module(name) else {
            return Body::ok(CheckResult::error(format!("module {name} is not available")));
        };
        debug!(check = %check, module = name, "running module");

        let mut handle = tokio::spawn(async move { module.run(ctx).await });
        match time::timeout(timeout, &mut handle).await {
            Ok(Ok(Ok(result))) => Body::ok(result),
            Ok(Ok(Err(err))) => {
                warn!(check = %check, module = name, error = %err, "module execution failed");
                let deadlocked = matches!(&err, ModuleError::Process(p) if p.is_deadlock());
                Body {
                    result: CheckResult::error(err.to_string()),
                    deadlocked,
                }
            }
            Ok(Err(join_err)) => {
                error!(check = %check, module = name, error = %join_err, "module crashed");
                Body::ok(CheckResult::error(format!("Module {name} crashed: {join_err}")))
            }
            Err(_elapsed) => {
                handle.abort();
                warn!(check = %check, module = name, "module timed out");
                Body::ok(CheckResult::error(format!(
                    "Plugin execution exceeded timeout {} seconds",
                    timeout.as_secs_f64()
                )))
            }
        }
    }
}

fn expand_command(
    command: &CommandTemplate,
    fields: &Map<String, Value>,
) -> Result<CommandSpec, TemplateError> {
    match command {
        CommandTemplate::Shell(line) => Ok(CommandSpec::Shell(template::expand(line, fields)?)),
        CommandTemplate::Exec(argv) => argv
            .iter()
            .map(|arg| template::expand_arg(arg, fields))
            .collect::<Result<Vec<_>, _>>()
            .map(CommandSpec::Exec),
    }
}

/// Structured JSON on stdout wins, otherwise the exit code decides.
pub fn interpret_output(output: &CommandOutput) -> CheckResult {
    let structured = match serde_json::from_str::<Value>(&output.stdout) {
        Ok(Value::Object(obj)) if !obj.is_empty() => Some(obj),
        _ => None,
    };
    if let Some(obj) = structured {
        let has_status = obj
            .get("status")
            .and_then(Value::as_str)
            .and_then(Status::parse)
            .is_some();
        if !has_status {
            return CheckResult::error(format!(
                "Missing status in JSON output: {}",
                output.stdout
            ));
        }
        return match CheckResult::from_value(&Value::Object(obj)) {
            Ok(result) => result,
            Err(err) => CheckResult::error(format!("Invalid JSON structure: {err}")),
        };
    }

    debug!("using non-JSON output");
    let status = match output.exit_code {
        Some(0) => Status::Ok,
        _ => Status::Error,
    };
    let mut result = CheckResult::new(status);
    result.add_msg(Level::Error, &output.stderr);
    result.add_msg(Level::Info, &output.stdout);
    result
}

/// Spawns executors under the concurrency gate.
#[derive(Clone)]
pub struct Launcher {
    executor: Executor,
    gate: Arc<ConcurrencyGate>,
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launcher")
            .field("gate_size", &self.gate.size())
            .finish()
    }
}

impl Launcher {
    pub fn new(executor: Executor, gate: Arc<ConcurrencyGate>) -> Self {
        Self { executor, gate }
    }

    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.gate
    }

    /// The report arrives on the returned receiver. If the task dies first
    /// the sender is dropped and the receiver sees it closed.
    pub fn launch(&self, inv: Invocation) -> oneshot::Receiver<ExecutionReport> {
        let (tx, rx) = oneshot::channel();
        let executor = self.executor.clone();
        let gate = Arc::clone(&self.gate);

        tokio::spawn(async move {
            let name = inv.spec.name.clone();
            let Some(_permit) = gate.acquire(&name).await else {
                let mut result = CheckResult::new(Status::Warn).with_forced(inv.forced);
                result.add_warn("Skipped because the daemon is shutting down");
                let _ = tx.send(ExecutionReport {
                    outcome: Outcome::Skipped {
                        reason: SkipReason::ShuttingDown,
                        result,
                    },
                    deadlocked: false,
                });
                return;
            };
            let report = executor.execute(inv).await;
            if tx.send(report).is_err() {
                debug!(check = %name, "result receiver dropped");
            }
        });
        rx
    }
}
