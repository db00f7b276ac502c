use super::{CheckModule, ModuleContext, ModuleError};
use crate::result::{CheckResult, Status};
use async_trait::async_trait;
use sysinfo::{System, SystemExt};

/// Host identification, always OK.
pub struct Uname;

#[async_trait]
impl CheckModule for Uname {
    async fn run(&self, _ctx: ModuleContext) -> Result<CheckResult, ModuleError> {
        let system = System::new();
        let unknown = || "unknown".to_string();

        let mut result = CheckResult::new(Status::Ok);
        result.add_info(&format!("host: {}", system.host_name().unwrap_or_else(unknown)));
        result.add_info(&format!(
            "os: {} {}",
            system.name().unwrap_or_else(unknown),
            system.os_version().unwrap_or_else(unknown)
        ));
        result.add_info(&format!(
            "kernel: {}",
            system.kernel_version().unwrap_or_else(unknown)
        ));
        result.add_info(&format!("uptime: {}s", system.uptime()));
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privileges::ResolvedIds;
    use crate::process::ProcessRunner;
    use serde_json::Map;
    use std::time::Duration;

    #[tokio::test]
    async fn reports_host_lines() {
        let ctx = ModuleContext::new(
            "uname",
            Map::new(),
            Duration::from_secs(1),
            ProcessRunner::default(),
            ResolvedIds::default(),
        );
        let result = Uname.run(ctx).await.unwrap();
        assert_eq!(result.status, Status::Ok);
        let info = result.messages_at(crate::result::Level::Info);
        assert_eq!(info.len(), 4);
        assert!(info[0].starts_with("host: "));
        assert!(info[2].starts_with("kernel: "));
    }
}
