use uuid::Uuid;

use crate::api::engine::Engine;
use crate::error::{ControlError, ControlResult};

/// Refuse to touch a strategy the engine is managing.
///
/// Any doubt (engine down, bad answer) counts as tracked. The engine may pick the
/// strategy up right after this returns; the action lock does not cover that.
pub async fn ensure_not_tracked(engine: &dyn Engine, strategy_uuid: Uuid) -> ControlResult<()> {
    match engine.is_tracked(strategy_uuid).await {
        Ok(false) => Ok(()),
        Ok(true) => {
            tracing::info!("strategy {} is tracked by the engine", strategy_uuid);
            Err(ControlError::engine_tracking())
        }
        Err(e) => {
            tracing::error!("failed to call engine for {}: {}", strategy_uuid, e);
            Err(ControlError::EngineUnreachable(e.to_string()))
        }
    }
}
