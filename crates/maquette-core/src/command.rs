//! The command capability every named operation satisfies.
//!
//! Domain handlers (geometry queries, element edits, document introspection)
//! live outside this crate; each one is registered with the router as a value
//! implementing [`Command`]. Registration is explicit and declarative - no
//! runtime type inspection anywhere.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Whether a command only inspects host state or mutates it.
///
/// Write-kind commands are refused by the router unless the request carries a
/// fresh smoke-test assertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Read,
    Write,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Read => "read",
            CommandKind::Write => "write",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A named operation with a declared read/write kind.
///
/// `execute` may take as long as the underlying host operation takes; the
/// router imposes no timeout. Faults must come back as `Err`, never as a
/// panic, though the router converts panics into execution errors as a last
/// line of defense.
#[async_trait]
pub trait Command: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> CommandKind;
    async fn execute(&self, params: Value) -> Result<Value>;
}

/// A command built from a plain closure.
///
/// Handy for built-ins like `smoke_test` and for tests; domain crates are
/// free to implement [`Command`] directly instead.
pub struct FnCommand<F> {
    name: String,
    kind: CommandKind,
    handler: F,
}

impl<F> FnCommand<F>
where
    F: Fn(Value) -> Result<Value> + Send + Sync,
{
    pub fn new(name: impl Into<String>, kind: CommandKind, handler: F) -> Self {
        Self {
            name: name.into(),
            kind,
            handler,
        }
    }
}

#[async_trait]
impl<F> Command for FnCommand<F>
where
    F: Fn(Value) -> Result<Value> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> CommandKind {
        self.kind
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        (self.handler)(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_command_executes() {
        let cmd = FnCommand::new("echo", CommandKind::Read, |params| Ok(params));
        assert_eq!(cmd.name(), "echo");
        assert_eq!(cmd.kind(), CommandKind::Read);
        let out = cmd.execute(json!({"a": 1})).await.unwrap();
        assert_eq!(out["a"], 1);
    }

    #[test]
    fn test_kind_serde_lowercase() {
        assert_eq!(serde_json::to_string(&CommandKind::Write).unwrap(), "\"write\"");
        let kind: CommandKind = serde_json::from_str("\"read\"").unwrap();
        assert_eq!(kind, CommandKind::Read);
    }
}
