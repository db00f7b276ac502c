use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Ok,
    Warn,
    Error,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Warn => "WARN",
            Status::Error => "ERROR",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "OK" => Some(Status::Ok),
            "WARN" => Some(Status::Warn),
            "ERROR" => Some(Status::Error),
            _ => None,
        }
    }

    /// Worst of the given statuses, ERROR > WARN > OK, starting from OK.
    pub fn worst<I: IntoIterator<Item = Status>>(statuses: I) -> Status {
        statuses.into_iter().fold(Status::Ok, Status::max)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ResultError {
    #[error("{0}")]
    Validation(String),
    #[error("can't generate overall status without component results")]
    NoComponents,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    const ALL: [Level; 3] = [Level::Info, Level::Error, Level::Warn];

    fn key(self) -> &'static str {
        match self {
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Messages {
    pub info: Vec<String>,
    pub warn: Vec<String>,
    pub error: Vec<String>,
}

impl Messages {
    pub fn level(&self, level: Level) -> &[String] {
        match level {
            Level::Info => &self.info,
            Level::Warn => &self.warn,
            Level::Error => &self.error,
        }
    }

    fn level_mut(&mut self, level: Level) -> &mut Vec<String> {
        match level {
            Level::Info => &mut self.info,
            Level::Warn => &mut self.warn,
            Level::Error => &mut self.error,
        }
    }

    /// Appends every non-empty line of `msg`, trimmed.
    pub fn push_lines(&mut self, level: Level, msg: &str) {
        let bucket = self.level_mut(level);
        bucket.extend(
            msg.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string),
        );
    }

    fn from_value(value: &Value, context: &str) -> Result<Self, ResultError> {
        let obj = value.as_object().ok_or_else(|| {
            ResultError::Validation(format!(
                "{context}: message has to be a dictionary or null, not {}",
                json_type(value)
            ))
        })?;

        let mut messages = Messages::default();
        for level in Level::ALL {
            let entries = obj.get(level.key()).ok_or_else(|| {
                ResultError::Validation(format!(
                    "{context}: can't validate message: missing {} list",
                    level.key()
                ))
            })?;
            let list = entries.as_array().ok_or_else(|| {
                ResultError::Validation(format!(
                    "{context}: message type {} has to be a list, not {}",
                    level.key(),
                    json_type(entries)
                ))
            })?;
            for entry in list {
                let text = entry.as_str().ok_or_else(|| {
                    ResultError::Validation(format!(
                        "{context}: message type {} has to contain strings, not {}",
                        level.key(),
                        json_type(entry)
                    ))
                })?;
                messages.level_mut(level).push(text.to_string());
            }
        }
        Ok(messages)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentResult {
    pub status: Status,
    pub messages: Messages,
}

/// Structured outcome of one check execution.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckResult {
    pub status: Status,
    pub messages: Option<Messages>,
    pub component_results: Option<BTreeMap<String, ComponentResult>>,
    pub action: Option<Box<CheckResult>>,
    pub forced: bool,
    pub last_run: SystemTime,
}

impl CheckResult {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            messages: None,
            component_results: None,
            action: None,
            forced: false,
            last_run: SystemTime::now(),
        }
    }

    pub fn error(msg: impl AsRef<str>) -> Self {
        let mut result = Self::new(Status::Error);
        result.add_msg(Level::Error, msg.as_ref());
        result
    }

    pub fn add_info(&mut self, msg: &str) {
        self.add_msg(Level::Info, msg);
    }

    pub fn add_warn(&mut self, msg: &str) {
        self.add_msg(Level::Warn, msg);
    }

    pub fn add_error(&mut self, msg: &str) {
        self.add_msg(Level::Error, msg);
    }

    /// Empty messages are skipped; multi-line messages become one entry per line.
    pub fn add_msg(&mut self, level: Level, msg: &str) {
        if msg.trim().is_empty() {
            return;
        }
        self.messages
            .get_or_insert_with(Messages::default)
            .push_lines(level, msg);
    }

    pub fn messages_at(&self, level: Level) -> &[String] {
        self.messages
            .as_ref()
            .map(|m| m.level(level))
            .unwrap_or(&[])
    }

    pub fn with_forced(mut self, forced: bool) -> Self {
        self.forced = forced;
        self
    }

    pub fn set_action(&mut self, action: CheckResult) {
        self.action = Some(Box::new(action));
    }

    /// Parses and validates a result supplied from outside the engine, such
    /// as the JSON a check command printed.
    pub fn from_value(value: &Value) -> Result<Self, ResultError> {
        let obj = value.as_object().ok_or_else(|| {
            ResultError::Validation(format!(
                "result has to be a dictionary, not {}",
                json_type(value)
            ))
        })?;
        Self::from_object(obj, "result")
    }

    fn from_object(obj: &Map<String, Value>, context: &str) -> Result<Self, ResultError> {
        let status = parse_status(obj.get("status"), context)?;

        let messages = match obj.get("messages") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(Messages::from_value(raw, context)?),
        };

        let component_results = match obj.get("componentResults") {
            None | Some(Value::Null) => None,
            Some(Value::Object(components)) => {
                let mut parsed = BTreeMap::new();
                for (name, component) in components {
                    parsed.insert(name.clone(), parse_component(name, component)?);
                }
                Some(parsed)
            }
            Some(other) => {
                return Err(ResultError::Validation(format!(
                    "{context}: component result must be dictionary, not {}",
                    json_type(other)
                )))
            }
        };

        let action = match obj.get("action") {
            None | Some(Value::Null) => None,
            Some(Value::Object(action)) => {
                if !action.contains_key("messages") {
                    return Err(ResultError::Validation(
                        "action doesn't have messages".to_string(),
                    ));
                }
                if !action.contains_key("status") {
                    return Err(ResultError::Validation(
                        "action doesn't have status".to_string(),
                    ));
                }
                Some(Box::new(Self::from_object(action, "action")?))
            }
            Some(other) => {
                return Err(ResultError::Validation(format!(
                    "action result must be dictionary, not {}",
                    json_type(other)
                )))
            }
        };

        let forced = obj.get("forced").and_then(Value::as_bool).unwrap_or(false);

        Ok(Self {
            status,
            messages,
            component_results,
            action,
            forced,
            last_run: SystemTime::now(),
        })
    }

    /// Top-level fields used when a result is merged into a command's
    /// template parameters or stdin payload.
    pub fn to_fields(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// Incrementally assembles a result, deriving the overall status from the
/// component results when none is set explicitly.
#[derive(Debug, Default)]
pub struct ResultBuilder {
    status: Option<Status>,
    messages: Option<Messages>,
    components: BTreeMap<String, ComponentResult>,
}

impl ResultBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn message(mut self, level: Level, msg: &str) -> Self {
        if !msg.trim().is_empty() {
            self.messages
                .get_or_insert_with(Messages::default)
                .push_lines(level, msg);
        }
        self
    }

    pub fn component(mut self, name: impl Into<String>, status: Status, messages: Messages) -> Self {
        self.components
            .insert(name.into(), ComponentResult { status, messages });
        self
    }

    pub fn derived_status(&self) -> Result<Status, ResultError> {
        if self.components.is_empty() {
            return Err(ResultError::NoComponents);
        }
        Ok(Status::worst(self.components.values().map(|c| c.status)))
    }

    pub fn build(self) -> Result<CheckResult, ResultError> {
        let status = match self.status {
            Some(status) => status,
            None => self.derived_status()?,
        };
        Ok(CheckResult {
            status,
            messages: self.messages,
            component_results: if self.components.is_empty() {
                None
            } else {
                Some(self.components)
            },
            action: None,
            forced: false,
            last_run: SystemTime::now(),
        })
    }
}

impl Serialize for CheckResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("CheckResult", 6)?;
        state.serialize_field("status", &self.status)?;
        state.serialize_field("messages", &self.messages)?;
        state.serialize_field("componentResults", &self.component_results)?;
        state.serialize_field("action", &self.action)?;
        state.serialize_field("forced", &self.forced)?;
        state.serialize_field("lastRun", &format_timestamp(self.last_run))?;
        state.end()
    }
}

pub fn format_timestamp(ts: SystemTime) -> String {
    humantime::format_rfc3339_seconds(ts).to_string()
}

fn parse_status(raw: Option<&Value>, context: &str) -> Result<Status, ResultError> {
    match raw {
        Some(Value::String(s)) => Status::parse(s).ok_or_else(|| {
            ResultError::Validation(format!(
                "{context}: status has to be OK, ERROR or WARN, not {s}"
            ))
        }),
        Some(other) => Err(ResultError::Validation(format!(
            "{context}: status has to be OK, ERROR or WARN, not {other}"
        ))),
        None => Err(ResultError::Validation(format!(
            "{context}: status is missing"
        ))),
    }
}

fn parse_component(name: &str, raw: &Value) -> Result<ComponentResult, ResultError> {
    let obj = raw.as_object().ok_or_else(|| {
        ResultError::Validation(format!("component {name} has to be a dictionary"))
    })?;
    let context = format!("component {name}");
    let messages = obj
        .get("messages")
        .ok_or_else(|| ResultError::Validation(format!("component {name} doesn't have messages")))?;
    let messages = if messages.is_null() {
        Messages::default()
    } else {
        Messages::from_value(messages, &context)?
    };
    let status = match obj.get("status") {
        Some(raw) => parse_status(Some(raw), &context)?,
        None => {
            return Err(ResultError::Validation(format!(
                "component {name} doesn't have status"
            )))
        }
    };
    Ok(ComponentResult { status, messages })
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "dictionary",
    }
}
