use metrics::counter;
use serde::Serialize;
use tracing::{debug, warn};

use b2b_group_core::meta;
use b2b_group_core::policy::{ReverifyDecision, ReverifyPolicy};
use b2b_group_core::AssignmentOutcome;

use crate::engine::AssignmentEngine;

/// Re-runs the assignment on login when the last one is stale.
#[derive(Clone)]
pub struct LoginReverifier {
    engine: AssignmentEngine,
    policy: ReverifyPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reverify", rename_all = "snake_case")]
pub enum ReverifyOutcome {
    Fresh,
    Reassigned { outcome: AssignmentOutcome },
    Failed,
}

impl ReverifyOutcome {
    fn metric_label(&self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Reassigned { .. } => "reassigned",
            Self::Failed => "failed",
        }
    }
}

impl LoginReverifier {
    pub fn new(engine: AssignmentEngine, policy: ReverifyPolicy) -> Self {
        Self { engine, policy }
    }

    /// Never returns an error: a failed re-verification must not block the
    /// login that triggered it.
    pub async fn on_login(&self, user_id: i64) -> ReverifyOutcome {
        let outcome = self.run(user_id).await;
        counter!("login_reverify_total", "result" => outcome.metric_label()).increment(1);
        outcome
    }

    async fn run(&self, user_id: i64) -> ReverifyOutcome {
        let last = match self
            .engine
            .database()
            .users()
            .get_field(user_id, meta::ASSIGNED_AT)
            .await
        {
            Ok(value) => value,
            Err(err) => {
                warn!(stage = "reverify", user_id, error = %err, "failed to read assignment timestamp");
                return ReverifyOutcome::Failed;
            }
        };

        let decision = self.policy.evaluate(last.as_deref(), self.engine.now());
        let ReverifyDecision::Due(reason) = decision else {
            debug!(stage = "reverify", user_id, "assignment still fresh");
            return ReverifyOutcome::Fresh;
        };

        debug!(stage = "reverify", user_id, reason = reason.as_str(), "re-running assignment");
        match self.engine.assign(user_id).await {
            Ok(outcome) => ReverifyOutcome::Reassigned { outcome },
            Err(err) => {
                warn!(stage = "reverify", user_id, error = %err, "re-assignment on login failed");
                ReverifyOutcome::Failed
            }
        }
    }
}
