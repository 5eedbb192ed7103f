//! Per-request permission gate.

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{
    decision_key, AuditLog, AuditRecord, ConsentChoice, ConsentProvider, ConsentRequest,
    DecisionSource, DecisionStore, OperationKind, Origin, PermissionDecision, RiskTier, Scope,
    StoredDecision,
};

/// Decides whether one request may perform an operation.
///
/// Stored decisions and the audit log are shared; the session cache belongs
/// to this request only.
pub struct PermissionGate {
    request_id: String,
    store: Arc<dyn DecisionStore>,
    consent: Arc<dyn ConsentProvider>,
    audit: Arc<AuditLog>,
    session: HashSet<String>,
}

impl PermissionGate {
    pub fn new(
        request_id: impl Into<String>,
        store: Arc<dyn DecisionStore>,
        consent: Arc<dyn ConsentProvider>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            store,
            consent,
            audit,
            session: HashSet::new(),
        }
    }

    /// Evaluates one operation and appends exactly one audit record.
    ///
    /// Never fails: consent errors and cancellation resolve to a denial. A
    /// cancelled request is denied before any cached decision is consulted.
    pub async fn evaluate(
        &mut self,
        origin: Origin,
        kind: &OperationKind,
        tier: RiskTier,
        description: &str,
        cancel: &CancellationToken,
    ) -> PermissionDecision {
        let (scope, source) = self.decide(origin, kind, tier, description, cancel).await;
        let decision = PermissionDecision {
            origin,
            operation_kind: kind.clone(),
            risk_tier: tier,
            scope,
            source,
        };

        tracing::info!(
            request_id = %self.request_id,
            origin = %origin,
            operation = %kind,
            risk = %tier,
            allowed = decision.is_allowed(),
            source = ?source,
            "permission evaluated"
        );

        self.audit
            .append(AuditRecord::new(&self.request_id, &decision, description))
            .await;

        decision
    }

    async fn decide(
        &mut self,
        origin: Origin,
        kind: &OperationKind,
        tier: RiskTier,
        description: &str,
        cancel: &CancellationToken,
    ) -> (Scope, DecisionSource) {
        if cancel.is_cancelled() {
            return (Scope::Deny, DecisionSource::Cancelled);
        }

        let key = decision_key(origin, kind);
        match self.store.get(&key) {
            Some(StoredDecision::Allow) => return (Scope::Always, DecisionSource::Cache),
            Some(StoredDecision::Deny) => return (Scope::Deny, DecisionSource::Cache),
            None => {}
        }

        if self.session.contains(&key) {
            return (Scope::Session, DecisionSource::Session);
        }

        if tier == RiskTier::Low {
            return (Scope::Once, DecisionSource::AutoLow);
        }

        let request = ConsentRequest {
            request_id: self.request_id.clone(),
            operation: kind.clone(),
            risk_tier: tier,
            description: description.to_string(),
        };

        let answer = tokio::select! {
            _ = cancel.cancelled() => return (Scope::Deny, DecisionSource::Cancelled),
            answer = self.consent.request(&request) => answer,
        };

        let choice = match answer {
            Ok(choice) => choice,
            Err(e) => {
                tracing::warn!(
                    request_id = %self.request_id,
                    operation = %kind,
                    error = %e,
                    "consent unavailable, denying"
                );
                return (Scope::Deny, DecisionSource::FailClosed);
            }
        };

        match choice {
            ConsentChoice::AllowOnce => (Scope::Once, DecisionSource::Consent),
            ConsentChoice::AllowSession => {
                self.session.insert(key);
                (Scope::Session, DecisionSource::Consent)
            }
            ConsentChoice::AlwaysAllow => {
                self.remember(&key, StoredDecision::Allow).await;
                (Scope::Always, DecisionSource::Consent)
            }
            ConsentChoice::Deny => (Scope::Deny, DecisionSource::Consent),
            ConsentChoice::AlwaysDeny => {
                self.remember(&key, StoredDecision::Deny).await;
                (Scope::Deny, DecisionSource::Consent)
            }
        }
    }

    async fn remember(&self, key: &str, decision: StoredDecision) {
        // The answer still applies to this evaluation if persisting fails.
        if let Err(e) = self.store.put(key, decision).await {
            tracing::warn!(operation = %key, error = %e, "failed to persist decision");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::{AuditDecision, MemoryDecisionStore};
    use crate::testing::ScriptedConsent;

    struct Fixture {
        store: Arc<MemoryDecisionStore>,
        audit: Arc<AuditLog>,
        consent: Arc<ScriptedConsent>,
    }

    impl Fixture {
        fn new(consent: ScriptedConsent) -> Self {
            Self {
                store: Arc::new(MemoryDecisionStore::new()),
                audit: Arc::new(AuditLog::new()),
                consent: Arc::new(consent),
            }
        }

        fn gate(&self, request_id: &str) -> PermissionGate {
            PermissionGate::new(
                request_id,
                self.store.clone(),
                self.consent.clone(),
                self.audit.clone(),
            )
        }
    }

    #[tokio::test]
    async fn high_risk_fails_closed_without_consent() {
        let fx = Fixture::new(ScriptedConsent::unavailable());
        let mut gate = fx.gate("r1");

        let decision = gate
            .evaluate(
                Origin::Agent,
                &OperationKind::BashExec,
                RiskTier::High,
                "run `make`",
                &CancellationToken::new(),
            )
            .await;

        assert!(!decision.is_allowed());
        assert_eq!(decision.source, DecisionSource::FailClosed);
        assert_eq!(fx.audit.len(), 1);
        assert_eq!(fx.audit.records()[0].decision, AuditDecision::Deny);
    }

    #[tokio::test]
    async fn low_risk_is_auto_approved_without_prompt() {
        let fx = Fixture::new(ScriptedConsent::unavailable());
        let mut gate = fx.gate("r1");

        let decision = gate
            .evaluate(
                Origin::Agent,
                &OperationKind::FileRead,
                RiskTier::Low,
                "read a.rs",
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(decision.scope, Scope::Once);
        assert_eq!(decision.source, DecisionSource::AutoLow);
        assert_eq!(fx.consent.prompts(), 0);
        assert!(fx.store.snapshot().is_empty());
        assert_eq!(fx.audit.len(), 1);
    }

    #[tokio::test]
    async fn always_allow_is_idempotent_across_requests() {
        let fx = Fixture::new(ScriptedConsent::new(vec![ConsentChoice::AlwaysAllow]));
        let cancel = CancellationToken::new();

        let first = fx
            .gate("r1")
            .evaluate(Origin::Agent, &OperationKind::GitPush, RiskTier::High, "push", &cancel)
            .await;
        let second = fx
            .gate("r2")
            .evaluate(Origin::Agent, &OperationKind::GitPush, RiskTier::High, "push", &cancel)
            .await;

        assert_eq!(first.source, DecisionSource::Consent);
        assert_eq!(second.scope, Scope::Always);
        assert_eq!(second.source, DecisionSource::Cache);
        assert_eq!(fx.consent.prompts(), 1);
        assert_eq!(fx.audit.len(), 2);
    }

    #[tokio::test]
    async fn always_deny_short_circuits_later_evaluations() {
        let fx = Fixture::new(ScriptedConsent::new(vec![ConsentChoice::AlwaysDeny]));
        let cancel = CancellationToken::new();
        let mut gate = fx.gate("r1");

        gate.evaluate(Origin::Agent, &OperationKind::BashExec, RiskTier::High, "rm", &cancel)
            .await;
        let again = gate
            .evaluate(Origin::Agent, &OperationKind::BashExec, RiskTier::High, "rm", &cancel)
            .await;

        assert!(!again.is_allowed());
        assert_eq!(again.source, DecisionSource::Cache);
        assert_eq!(fx.consent.prompts(), 1);
    }

    #[tokio::test]
    async fn session_allow_lasts_for_the_request_only() {
        let fx = Fixture::new(ScriptedConsent::new(vec![ConsentChoice::AllowSession]));
        let cancel = CancellationToken::new();
        let mut gate = fx.gate("r1");

        gate.evaluate(Origin::Agent, &OperationKind::BashExec, RiskTier::High, "ls", &cancel)
            .await;
        let cached = gate
            .evaluate(Origin::Agent, &OperationKind::BashExec, RiskTier::High, "ls -la", &cancel)
            .await;
        assert_eq!(cached.source, DecisionSource::Session);

        // A new request starts with an empty session and the queue is drained.
        let other = fx
            .gate("r2")
            .evaluate(Origin::Agent, &OperationKind::BashExec, RiskTier::High, "ls", &cancel)
            .await;
        assert_eq!(other.source, DecisionSource::FailClosed);
        assert!(fx.store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn allow_once_is_not_remembered() {
        let fx = Fixture::new(ScriptedConsent::new(vec![
            ConsentChoice::AllowOnce,
            ConsentChoice::Deny,
        ]));
        let cancel = CancellationToken::new();
        let mut gate = fx.gate("r1");

        let first = gate
            .evaluate(Origin::Agent, &OperationKind::FileEdit, RiskTier::Medium, "edit", &cancel)
            .await;
        let second = gate
            .evaluate(Origin::Agent, &OperationKind::FileEdit, RiskTier::Medium, "edit", &cancel)
            .await;

        assert!(first.is_allowed());
        assert!(!second.is_allowed());
        assert_eq!(second.source, DecisionSource::Consent);
        assert_eq!(fx.consent.prompts(), 2);
    }

    #[tokio::test]
    async fn cancelled_request_is_denied_without_prompt() {
        let fx = Fixture::new(ScriptedConsent::new(vec![ConsentChoice::AllowOnce]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let decision = fx
            .gate("r1")
            .evaluate(Origin::Agent, &OperationKind::GitCommit, RiskTier::Medium, "commit", &cancel)
            .await;

        assert_eq!(decision.source, DecisionSource::Cancelled);
        assert_eq!(fx.consent.prompts(), 0);
        assert_eq!(fx.audit.len(), 1);
    }

    #[tokio::test]
    async fn cancellation_unblocks_a_pending_prompt() {
        let fx = Fixture::new(ScriptedConsent::hanging());
        let cancel = CancellationToken::new();
        let mut gate = fx.gate("r1");

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let decision = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            gate.evaluate(Origin::Agent, &OperationKind::BashExec, RiskTier::High, "sleep", &cancel),
        )
        .await
        .expect("prompt should be cancelled");

        assert_eq!(decision.source, DecisionSource::Cancelled);
        assert_eq!(fx.audit.len(), 1);
    }

    #[tokio::test]
    async fn stored_decision_beats_low_risk() {
        let fx = Fixture::new(ScriptedConsent::unavailable());
        fx.store
            .put("agent:file_read", StoredDecision::Deny)
            .await
            .unwrap();

        let decision = fx
            .gate("r1")
            .evaluate(
                Origin::Agent,
                &OperationKind::FileRead,
                RiskTier::Low,
                "read",
                &CancellationToken::new(),
            )
            .await;

        assert!(!decision.is_allowed());
        assert_eq!(decision.source, DecisionSource::Cache);
    }

    #[tokio::test]
    async fn cancellation_beats_stored_and_session_allows() {
        let fx = Fixture::new(ScriptedConsent::new(vec![ConsentChoice::AllowSession]));
        fx.store
            .put("agent:file_edit", StoredDecision::Allow)
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let mut gate = fx.gate("r1");
        gate.evaluate(Origin::Agent, &OperationKind::BashExec, RiskTier::High, "ls", &cancel)
            .await;

        cancel.cancel();
        let stored = gate
            .evaluate(Origin::Agent, &OperationKind::FileEdit, RiskTier::Medium, "edit", &cancel)
            .await;
        let session = gate
            .evaluate(Origin::Agent, &OperationKind::BashExec, RiskTier::High, "ls", &cancel)
            .await;
        let low = gate
            .evaluate(Origin::Agent, &OperationKind::FileRead, RiskTier::Low, "read", &cancel)
            .await;

        for decision in [stored, session, low] {
            assert!(!decision.is_allowed());
            assert_eq!(decision.source, DecisionSource::Cancelled);
        }
        assert_eq!(fx.audit.len(), 4);
    }

    #[tokio::test]
    async fn pipeline_allow_does_not_cover_agent_requests() {
        let fx = Fixture::new(ScriptedConsent::unavailable());
        fx.store
            .put("pipeline:git_push", StoredDecision::Allow)
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        let mut gate = fx.gate("r1");

        let pipeline = gate
            .evaluate(Origin::Pipeline, &OperationKind::GitPush, RiskTier::High, "push", &cancel)
            .await;
        let agent = gate
            .evaluate(Origin::Agent, &OperationKind::GitPush, RiskTier::High, "push", &cancel)
            .await;

        assert_eq!(pipeline.source, DecisionSource::Cache);
        assert!(pipeline.is_allowed());
        assert_eq!(agent.source, DecisionSource::FailClosed);
        assert!(!agent.is_allowed());
        assert_eq!(fx.audit.records()[1].origin, Origin::Agent);
    }
}
