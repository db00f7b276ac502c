//! In-process check bodies and output parsers, registered by name at startup.

pub mod connection;
pub mod http;
pub mod nagios;
pub mod uname;

use crate::privileges::ResolvedIds;
use crate::process::{CommandOutput, CommandSpec, ExecOptions, ProcessError, ProcessRunner};
use crate::result::{CheckResult, ResultError};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("missing parameter {0}")]
    MissingParam(String),
    #[error("invalid parameter {name}: {reason}")]
    InvalidParam { name: String, reason: String },
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Result(#[from] ResultError),
    #[error("{0}")]
    Failed(String),
}

/// Everything a module sees of the check it runs for.
#[derive(Debug, Clone)]
pub struct ModuleContext {
    pub check: String,
    pub params: Map<String, Value>,
    pub timeout: Duration,
    /// Set for action modules: the main result they act on.
    pub result: Option<CheckResult>,
    pub last_result: Option<CheckResult>,
    runner: ProcessRunner,
    ids: ResolvedIds,
}

impl ModuleContext {
    pub fn new(
        check: impl Into<String>,
        params: Map<String, Value>,
        timeout: Duration,
        runner: ProcessRunner,
        ids: ResolvedIds,
    ) -> Self {
        Self {
            check: check.into(),
            params,
            timeout,
            result: None,
            last_result: None,
            runner,
            ids,
        }
    }

    pub fn with_result(mut self, result: Option<CheckResult>) -> Self {
        self.result = result;
        self
    }

    pub fn with_last_result(mut self, last: Option<CheckResult>) -> Self {
        self.last_result = last;
        self
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&Value, ModuleError> {
        self.params
            .get(name)
            .filter(|v| !v.is_null())
            .ok_or_else(|| ModuleError::MissingParam(name.to_string()))
    }

    /// Runs a command with the check's timeout and privileges.
    pub async fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput, ProcessError> {
        let opts = ExecOptions {
            uid: self.ids.uid,
            gid: self.ids.gid,
            ..ExecOptions::default()
        };
        self.runner.run(spec, Some(self.timeout), opts).await
    }
}

#[async_trait]
pub trait CheckModule: Send + Sync {
    async fn run(&self, ctx: ModuleContext) -> Result<CheckResult, ModuleError>;
}

pub trait OutputParser: Send + Sync {
    fn parse(&self, stdout: &str, stderr: &str) -> Result<CheckResult, ModuleError>;
}

#[derive(Clone, Default)]
pub struct Capabilities {
    modules: HashMap<String, Arc<dyn CheckModule>>,
    parsers: HashMap<String, Arc<dyn OutputParser>>,
}

impl Capabilities {
    pub fn builtin() -> Self {
        let mut caps = Self::default();
        caps.register_module("uname", Arc::new(uname::Uname));
        caps.register_module("tcp_connect", Arc::new(connection::TcpConnect));
        caps.register_module("http_status", Arc::new(http::HttpStatus::new()));
        caps.register_parser("nagios", Arc::new(nagios::Nagios));
        caps
    }

    pub fn register_module(&mut self, name: impl Into<String>, module: Arc<dyn CheckModule>) {
        self.modules.insert(name.into(), module);
    }

    pub fn register_parser(&mut self, name: impl Into<String>, parser: Arc<dyn OutputParser>) {
        self.parsers.insert(name.into(), parser);
    }

    pub fn module(&self, name: &str) -> Option<Arc<dyn CheckModule>> {
        self.modules.get(name).cloned()
    }

    pub fn parser(&self, name: &str) -> Option<Arc<dyn OutputParser>> {
        self.parsers.get(name).cloned()
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut modules: Vec<_> = self.modules.keys().collect();
        let mut parsers: Vec<_> = self.parsers.keys().collect();
        modules.sort();
        parsers.sort();
        f.debug_struct("Capabilities")
            .field("modules", &modules)
            .field("parsers", &parsers)
            .finish()
    }
}
