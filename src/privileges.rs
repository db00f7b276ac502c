//! uid/gid a check runs as.

use nix::unistd::{Gid, Group, Uid, User};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum IdSpec {
    /// Keep the daemon's own id.
    #[default]
    Default,
    Numeric(u32),
    Name(String),
}

impl IdSpec {
    pub fn from_param(value: Option<&Value>) -> Result<Self, String> {
        match value {
            None | Some(Value::Null) => Ok(IdSpec::Default),
            Some(Value::String(s)) if s == "default" => Ok(IdSpec::Default),
            Some(Value::String(s)) => match s.parse::<u32>() {
                Ok(id) => Ok(IdSpec::Numeric(id)),
                Err(_) if !s.is_empty() => Ok(IdSpec::Name(s.clone())),
                Err(_) => Err("empty id".to_string()),
            },
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|id| u32::try_from(id).ok())
                .map(IdSpec::Numeric)
                .ok_or_else(|| format!("invalid id {n}")),
            Some(other) => Err(format!("id has to be a number or a name, not {other}")),
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, IdSpec::Default)
    }
}

impl fmt::Display for IdSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdSpec::Default => f.write_str("default"),
            IdSpec::Numeric(id) => write!(f, "{id}"),
            IdSpec::Name(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Privileges {
    pub uid: IdSpec,
    pub gid: IdSpec,
}

/// Numeric ids to apply to a child, `None` meaning unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResolvedIds {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

#[derive(Debug, Error)]
pub enum PrivilegeError {
    #[error("unknown user {0}")]
    UnknownUser(String),
    #[error("unknown group {0}")]
    UnknownGroup(String),
    #[error("lookup of {name} failed: {source}")]
    Lookup { name: String, source: nix::Error },
    #[error("can't switch effective UID/GID to {uid}/{gid}: operation not permitted")]
    NotPermitted { uid: u32, gid: u32 },
}

impl Privileges {
    pub fn is_default(&self) -> bool {
        self.uid.is_default() && self.gid.is_default()
    }

    /// Resolves names to ids and verifies the daemon is allowed to switch to
    /// them, which requires root unless the ids are the current ones.
    pub fn resolve(&self) -> Result<ResolvedIds, PrivilegeError> {
        if self.is_default() {
            return Ok(ResolvedIds::default());
        }
        let uid = match &self.uid {
            IdSpec::Default => None,
            IdSpec::Numeric(id) => Some(*id),
            IdSpec::Name(name) => Some(
                User::from_name(name)
                    .map_err(|source| PrivilegeError::Lookup {
                        name: name.clone(),
                        source,
                    })?
                    .ok_or_else(|| PrivilegeError::UnknownUser(name.clone()))?
                    .uid
                    .as_raw(),
            ),
        };
        let gid = match &self.gid {
            IdSpec::Default => None,
            IdSpec::Numeric(id) => Some(*id),
            IdSpec::Name(name) => Some(
                Group::from_name(name)
                    .map_err(|source| PrivilegeError::Lookup {
                        name: name.clone(),
                        source,
                    })?
                    .ok_or_else(|| PrivilegeError::UnknownGroup(name.clone()))?
                    .gid
                    .as_raw(),
            ),
        };

        let current_uid = Uid::effective().as_raw();
        let current_gid = Gid::effective().as_raw();
        let changes_uid = uid.is_some_and(|id| id != current_uid);
        let changes_gid = gid.is_some_and(|id| id != current_gid);
        if (changes_uid || changes_gid) && !Uid::effective().is_root() {
            return Err(PrivilegeError::NotPermitted {
                uid: uid.unwrap_or(current_uid),
                gid: gid.unwrap_or(current_gid),
            });
        }
        Ok(ResolvedIds { uid, gid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_id_params() {
        assert_eq!(IdSpec::from_param(None), Ok(IdSpec::Default));
        assert_eq!(IdSpec::from_param(Some(&json!("default"))), Ok(IdSpec::Default));
        assert_eq!(IdSpec::from_param(Some(&json!(1000))), Ok(IdSpec::Numeric(1000)));
        assert_eq!(IdSpec::from_param(Some(&json!("1000"))), Ok(IdSpec::Numeric(1000)));
        assert_eq!(
            IdSpec::from_param(Some(&json!("nobody"))),
            Ok(IdSpec::Name("nobody".to_string()))
        );
        assert!(IdSpec::from_param(Some(&json!(-1))).is_err());
        assert!(IdSpec::from_param(Some(&json!([1]))).is_err());
    }

    #[test]
    fn default_resolves_to_nothing() {
        assert_eq!(Privileges::default().resolve().unwrap(), ResolvedIds::default());
    }

    #[test]
    fn current_ids_are_always_allowed() {
        let privileges = Privileges {
            uid: IdSpec::Numeric(Uid::effective().as_raw()),
            gid: IdSpec::Numeric(Gid::effective().as_raw()),
        };
        let ids = privileges.resolve().unwrap();
        assert_eq!(ids.uid, Some(Uid::effective().as_raw()));
    }

    #[test]
    fn unknown_user_fails() {
        let privileges = Privileges {
            uid: IdSpec::Name("smokerd-no-such-user".to_string()),
            gid: IdSpec::Default,
        };
        assert!(matches!(
            privileges.resolve(),
            Err(PrivilegeError::UnknownUser(_))
        ));
    }
}
