use super::{CheckModule, ModuleContext, ModuleError};
use crate::result::{CheckResult, Level, Messages, ResultBuilder, Status};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Instant;
use tracing::warn;

const DEFAULT_EXPECTED_STATUS: u16 = 200;

/// GETs every URL in `Urls` and compares the response code with
/// `ExpectedStatus`.
pub struct HttpStatus {
    client: Client,
}

impl HttpStatus {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for HttpStatus {
    fn default() -> Self {
        Self::new()
    }
}

fn urls(ctx: &ModuleContext) -> Result<Vec<String>, ModuleError> {
    let invalid = |reason: &str| ModuleError::InvalidParam {
        name: "Urls".to_string(),
        reason: reason.to_string(),
    };
    match ctx.require("Urls")? {
        Value::String(url) => Ok(vec![url.clone()]),
        Value::Array(items) if !items.is_empty() => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| invalid("every url has to be a string"))
            })
            .collect(),
        _ => Err(invalid("has to be a url or a non-empty list of urls")),
    }
}

fn expected_status(ctx: &ModuleContext) -> Result<u16, ModuleError> {
    match ctx.param("ExpectedStatus") {
        None | Some(Value::Null) => Ok(DEFAULT_EXPECTED_STATUS),
        Some(value) => value
            .as_u64()
            .and_then(|code| u16::try_from(code).ok())
            .ok_or_else(|| ModuleError::InvalidParam {
                name: "ExpectedStatus".to_string(),
                reason: format!("not a status code: {value}"),
            }),
    }
}

#[async_trait]
impl CheckModule for HttpStatus {
    async fn run(&self, ctx: ModuleContext) -> Result<CheckResult, ModuleError> {
        let expected = expected_status(&ctx)?;
        let mut builder = ResultBuilder::new();

        for url in urls(&ctx)? {
            let start = Instant::now();
            let mut messages = Messages::default();
            let req = self.client.get(&url).timeout(ctx.timeout);

            let status = match req.send().await {
                Ok(resp) => {
                    let code = resp.status().as_u16();
                    let latency = start.elapsed().as_millis();
                    if code == expected {
                        messages.push_lines(Level::Info, &format!("HTTP {code} in {latency} ms"));
                        Status::Ok
                    } else {
                        messages.push_lines(
                            Level::Error,
                            &format!("HTTP {code}, expected {expected}"),
                        );
                        Status::Error
                    }
                }
                Err(err) => {
                    warn!(check = %ctx.check, url = %url, error = %err, "http check failed");
                    messages.push_lines(Level::Error, &format!("request failed: {err}"));
                    Status::Error
                }
            };
            builder = builder.component(url, status, messages);
        }

        Ok(builder.build()?)
    }
}
