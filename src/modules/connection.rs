use super::{CheckModule, ModuleContext, ModuleError};
use crate::result::{CheckResult, Level, Messages, ResultBuilder, Status};
use async_trait::async_trait;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time;
use tracing::warn;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connects to every `[host, port]` in `Connections`, one component each.
pub struct TcpConnect;

fn targets(ctx: &ModuleContext) -> Result<Vec<(String, u16)>, ModuleError> {
    let invalid = |reason: String| ModuleError::InvalidParam {
        name: "Connections".to_string(),
        reason,
    };
    let Value::Array(entries) = ctx.require("Connections")? else {
        return Err(invalid("has to be a list".to_string()));
    };
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let pair = entry.as_array().filter(|pair| pair.len() == 2);
        let parsed = pair.and_then(|pair| {
            let host = pair[0].as_str()?;
            let port = u16::try_from(pair[1].as_u64()?).ok()?;
            Some((host.to_string(), port))
        });
        out.push(parsed.ok_or_else(|| invalid(format!("expected [host, port], got {entry}")))?);
    }
    if out.is_empty() {
        return Err(invalid("no connections listed".to_string()));
    }
    Ok(out)
}

fn connect_timeout(ctx: &ModuleContext) -> Duration {
    ctx.param("ConnectTimeout")
        .and_then(Value::as_f64)
        .filter(|secs| *secs > 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT)
}

#[async_trait]
impl CheckModule for TcpConnect {
    async fn run(&self, ctx: ModuleContext) -> Result<CheckResult, ModuleError> {
        let limit = connect_timeout(&ctx);
        let mut builder = ResultBuilder::new();

        for (host, port) in targets(&ctx)? {
            let addr = format!("{host}:{port}");
            let start = Instant::now();
            let mut messages = Messages::default();

            let status = match time::timeout(limit, TcpStream::connect(&addr)).await {
                Ok(Ok(_stream)) => {
                    messages.push_lines(
                        Level::Info,
                        &format!("connected in {} ms", start.elapsed().as_millis()),
                    );
                    Status::Ok
                }
                Ok(Err(err)) => {
                    warn!(check = %ctx.check, address = %addr, error = %err, "tcp connect failed");
                    messages.push_lines(Level::Error, &format!("connection failed: {err}"));
                    Status::Error
                }
                Err(_elapsed) => {
                    warn!(check = %ctx.check, address = %addr, "tcp connect timeout");
                    messages.push_lines(
                        Level::Error,
                        &format!("connection timed out after {} ms", limit.as_millis()),
                    );
                    Status::Error
                }
            };
            builder = builder.component(addr, status, messages);
        }

        Ok(builder.build()?)
    }
}
