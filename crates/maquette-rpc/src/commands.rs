//! Built-in commands registered at server start.
//!
//! Domain command crates (geometry, elements, documents) register their own
//! handlers on top of these; the server only guarantees the self-test is
//! always present so the smoke gate can be satisfied at all.

use maquette_core::{CommandKind, FnCommand, Result, RpcRouter};
use serde_json::json;
use std::sync::Arc;

pub fn register_builtin_commands(router: &Arc<RpcRouter>) -> Result<()> {
    // Declared write-kind on purpose: the router's special case, not a
    // lenient kind, is what lets it through the gate.
    router.register(Arc::new(FnCommand::new(
        "smoke_test",
        CommandKind::Write,
        |_params| {
            Ok(json!({
                "ok": true,
                "smoke": "pass",
                "pid": std::process::id(),
            }))
        },
    )))?;

    router.register(Arc::new(FnCommand::new(
        "ping",
        CommandKind::Read,
        |_params| Ok(json!("pong")),
    )))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use maquette_core::CommandRegistry;
    use serde_json::Value;
    use std::collections::HashMap;

    fn router() -> Arc<RpcRouter> {
        let registry = Arc::new(CommandRegistry::from_entries(HashMap::new()));
        let router = Arc::new(RpcRouter::new(registry));
        register_builtin_commands(&router).unwrap();
        router
    }

    #[tokio::test]
    async fn test_smoke_test_runs_ungated() {
        let router = router();
        let resp = router.dispatch("smoke_test", None, Value::Null).await;
        let result = resp.result.unwrap();
        assert_eq!(result["ok"], true);
        assert_eq!(result["smoke"], "pass");
    }

    #[tokio::test]
    async fn test_ping() {
        let router = router();
        let resp = router.dispatch("PING", None, Value::Null).await;
        assert_eq!(resp.result.unwrap(), Value::String("pong".into()));
    }
}
