use super::{ModuleError, OutputParser};
use crate::result::{CheckResult, Level, Status};

/// Nagios plugin convention: the first line starts with `OK`, `WARNING`,
/// `CRITICAL` or `UNKNOWN`, optionally followed by `|` performance data.
pub struct Nagios;

impl OutputParser for Nagios {
    fn parse(&self, stdout: &str, stderr: &str) -> Result<CheckResult, ModuleError> {
        let mut lines = stdout.lines();
        let first = lines
            .next()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .ok_or_else(|| ModuleError::Failed("empty plugin output".to_string()))?;

        let (head, _perfdata) = first.split_once('|').unwrap_or((first, ""));
        let word = head
            .split(|c: char| c == ':' || c == '-' || c.is_whitespace())
            .find(|w| !w.is_empty())
            .unwrap_or_default();

        let (status, level) = match word {
            "OK" => (Status::Ok, Level::Info),
            "WARNING" => (Status::Warn, Level::Warn),
            "CRITICAL" | "UNKNOWN" => (Status::Error, Level::Error),
            other => {
                return Err(ModuleError::Failed(format!(
                    "unrecognised nagios status {other:?}"
                )))
            }
        };

        let mut result = CheckResult::new(status);
        result.add_msg(level, head.trim());
        for line in lines {
            result.add_info(line.split_once('|').map_or(line, |(text, _)| text));
        }
        result.add_error(stderr);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_prefixes() {
        let ok = Nagios.parse("OK - load 0.1 | load=0.1", "").unwrap();
        assert_eq!(ok.status, Status::Ok);
        assert_eq!(ok.messages_at(Level::Info), ["OK - load 0.1"]);

        let warn = Nagios.parse("WARNING: disk 85%\n/ 85%", "").unwrap();
        assert_eq!(warn.status, Status::Warn);
        assert_eq!(warn.messages_at(Level::Warn), ["WARNING: disk 85%"]);
        assert_eq!(warn.messages_at(Level::Info), ["/ 85%"]);

        let crit = Nagios.parse("CRITICAL: down", "boom").unwrap();
        assert_eq!(crit.status, Status::Error);
        assert_eq!(crit.messages_at(Level::Error), ["CRITICAL: down", "boom"]);

        assert_eq!(Nagios.parse("UNKNOWN", "").unwrap().status, Status::Error);
    }

    #[test]
    fn rejects_other_output() {
        assert!(Nagios.parse("", "").is_err());
        assert!(Nagios.parse("all good", "").is_err());
    }
}
