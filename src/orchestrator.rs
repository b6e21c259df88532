//! Orchestrator: the front door every sensitive operation passes
//! through (spec §3, §4.6). Grounded on
//! `examples/original_source/src/vault/enterprise_vault_orchestrator.py`'s
//! `process_vault_event` pipeline (security-level resolution → session
//! validation → approval requirement check → threat analysis → audit),
//! translated from its dict-shaped `processing_result` into the
//! discriminated `OrchestratorOutcome` spec §6 requires. Background
//! loops are grounded on `robertringler-Qubic/nexus-omega`'s
//! `tokio`+`async-trait` ambient stack (see DESIGN.md) since no teacher
//! file runs an async loop of its own.

use crate::approval::{ApprovalEngine, ApprovalError, ApprovalStatus, OperationExecutor};
use crate::canonical::CanonicalPayload;
use crate::error::VaultError;
use crate::escrow::EscrowEngine;
use crate::eventsink::{EventSink, Outcome, Severity};
use crate::identity::{IdentityError, IdentityStore};
use crate::policy::{OperationType, PolicyStore};
use crate::threat::{ObservedEvent, SecurityInsight, ThreatEngine};
use chrono::{Timelike, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// The discriminated result every sensitive operation resolves to
/// (spec §6): executed now, pending quorum, or rejected outright.
#[derive(Debug, Clone)]
pub enum OrchestratorOutcome {
    Executed { request_id: String, execution_outcome: Option<String>, high_risk_insights: Vec<SecurityInsight> },
    PendingApproval { request_id: String, high_risk_insights: Vec<SecurityInsight> },
    Rejected { reason: String, high_risk_insights: Vec<SecurityInsight> },
}

fn operation_kind_str(op: OperationType) -> &'static str {
    match op {
        OperationType::CredentialAccess => "credential_access",
        OperationType::CredentialCreate => "credential_create",
        OperationType::CredentialUpdate => "credential_update",
        OperationType::CredentialDelete => "credential_delete",
        OperationType::VaultConfigure => "vault_configure",
        OperationType::UserManage => "user_manage",
        OperationType::BackupRestore => "backup_restore",
        OperationType::EmergencyRevoke => "emergency_revoke",
        OperationType::ShareRecover => "share_recover",
        OperationType::HsmOp => "hsm_op",
    }
}

/// UTC business-hours window used by `ApprovalPolicy::business_hours_only`
/// checks. The original system resolves this per-tenant from a calendar
/// service that is out of scope here (spec §1); the kernel fixes a
/// single UTC window as the documented default (see DESIGN.md) and
/// leaves tenant-specific calendars as a host-side extension point.
fn within_business_hours(now: chrono::DateTime<Utc>) -> bool {
    let hour = now.hour();
    (8..18).contains(&hour)
}

pub struct Orchestrator {
    identity: Arc<IdentityStore>,
    approval: Arc<ApprovalEngine>,
    policies: Arc<PolicyStore>,
    threat: Arc<ThreatEngine>,
    escrow: Arc<EscrowEngine>,
    event_sink: Option<Arc<dyn EventSink>>,
}

impl Orchestrator {
    pub fn new(
        identity: Arc<IdentityStore>,
        approval: Arc<ApprovalEngine>,
        policies: Arc<PolicyStore>,
        threat: Arc<ThreatEngine>,
        escrow: Arc<EscrowEngine>,
        event_sink: Option<Arc<dyn EventSink>>,
    ) -> Arc<Self> {
        Arc::new(Self { identity, approval, policies, threat, escrow, event_sink })
    }

    pub async fn register_executor(&self, operation_type: OperationType, executor: Arc<dyn OperationExecutor>) {
        self.approval.register_executor(operation_type, executor).await;
    }

    async fn audit(&self, operation_type: OperationType, subject: Option<String>, outcome: Outcome, severity: Severity, detail: String) {
        if let Some(sink) = &self.event_sink {
            let mut attrs = HashMap::new();
            attrs.insert("operation_type".to_string(), format!("{:?}", operation_type));
            attrs.insert("detail".to_string(), detail);
            let _ = sink.append("orchestrator", "operation.audit", severity, outcome, subject, attrs).await;
        }
    }

    /// Runs the full spec §4.6 pipeline for one sensitive operation:
    /// session validation (fail closed), approval gating, threat
    /// analysis, execution dispatch, and a terminal audit record
    /// regardless of outcome.
    pub async fn submit_operation(
        &self,
        operation_type: OperationType,
        payload: CanonicalPayload,
        session_token: &str,
        eligible_approver_ids: Vec<String>,
        source_ip: Option<String>,
    ) -> std::result::Result<OrchestratorOutcome, VaultError> {
        // 1. Session validation, fail closed.
        let identity = match self.identity.validate_session(session_token).await {
            Ok(identity) => identity,
            Err(e) => {
                self.audit(operation_type, None, Outcome::Denied, Severity::High, format!("session validation failed: {e}"))
                    .await;
                return Err(match e {
                    IdentityError::MachineBindingMismatch(_) => VaultError::AuthFailed(e.to_string()),
                    _ => VaultError::AuthRequired,
                });
            }
        };

        let policy = self
            .policies
            .approval_policy(operation_type)
            .ok_or_else(|| VaultError::PolicyViolation(format!("no policy for {:?}", operation_type)))?
            .clone();

        if policy.business_hours_only && !within_business_hours(Utc::now()) {
            self.audit(
                operation_type,
                Some(identity.identity_id.clone()),
                Outcome::Denied,
                Severity::Medium,
                "operation restricted to business hours".to_string(),
            )
            .await;
            return Ok(OrchestratorOutcome::Rejected {
                reason: "operation restricted to business hours".to_string(),
                high_risk_insights: Vec::new(),
            });
        }

        // 2. Approval gating: always opens a request; a zero-quorum
        // policy resolves to Approved immediately inside ApprovalEngine.
        let request = self
            .approval
            .create_request(operation_type, payload, identity.identity_id.clone(), eligible_approver_ids)
            .await
            .map_err(|e| VaultError::PolicyViolation(e.to_string()))?;

        // 3 & 4. Event construction, threat analysis, threat feedback.
        let event = ObservedEvent {
            entity_id: identity.identity_id.clone(),
            entity_type: "agent".to_string(),
            kind: operation_kind_str(operation_type).to_string(),
            occurred_at: Utc::now(),
            actor_id: Some(identity.identity_id.clone()),
            resource_id: None,
            source_ip,
            outcome: Outcome::Pending,
            attributes: HashMap::new(),
        };
        let insights = self.threat.analyze_event(event).await;
        let broadcast_threshold = self.policies.risk_thresholds().broadcast_risk_threshold;
        let high_risk_insights: Vec<SecurityInsight> =
            insights.into_iter().filter(|i| i.risk >= broadcast_threshold).collect();

        // 5. Execution dispatch.
        if request.status == ApprovalStatus::Approved {
            match self.approval.execute(&request.request_id).await {
                Ok(executed) => {
                    self.audit(
                        operation_type,
                        Some(identity.identity_id.clone()),
                        Outcome::Success,
                        Severity::Info,
                        "operation executed".to_string(),
                    )
                    .await;
                    Ok(OrchestratorOutcome::Executed {
                        request_id: executed.request_id,
                        execution_outcome: executed.execution_outcome,
                        high_risk_insights,
                    })
                }
                Err(ApprovalError::NoExecutor(op)) => {
                    self.audit(
                        operation_type,
                        Some(identity.identity_id.clone()),
                        Outcome::Failure,
                        Severity::High,
                        format!("no executor registered for {:?}", op),
                    )
                    .await;
                    Err(VaultError::internal(format!("no executor registered for {:?}", op)))
                }
                Err(e) => {
                    self.audit(
                        operation_type,
                        Some(identity.identity_id.clone()),
                        Outcome::Failure,
                        Severity::High,
                        format!("execution failed: {e}"),
                    )
                    .await;
                    Err(VaultError::CryptoFailure(e.to_string()))
                }
            }
        } else {
            // 6. Terminal audit record regardless of outcome.
            self.audit(
                operation_type,
                Some(identity.identity_id.clone()),
                Outcome::Pending,
                Severity::Info,
                "operation pending approval".to_string(),
            )
            .await;
            Ok(OrchestratorOutcome::PendingApproval { request_id: request.request_id, high_risk_insights })
        }
    }

    /// Background loop: transitions expired PENDING approval requests
    /// to EXPIRED on a fixed cadence, checking the shutdown signal
    /// between scans only (spec §5 suspension-point rule).
    pub async fn run_approval_expiry_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let expired = self.approval.scan_expired().await;
                    if !expired.is_empty() {
                        tracing::info!(count = expired.len(), "approval requests expired");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Background loop: nightly threat baseline batch refresh, polling
    /// the shutdown signal between entities rather than mid-window.
    pub async fn run_threat_batch_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let mut cancelled = false;
                    self.threat
                        .run_batch_refresh(|| {
                            if *shutdown.borrow() {
                                cancelled = true;
                            }
                            !cancelled
                        })
                        .await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Background loop: sweeps escrows with `expires_at <= now` to
    /// EXPIRED, deleting ciphertext and destroying the KeyOracle handle
    /// (spec §4.4), checking the shutdown signal between scans only.
    pub async fn run_escrow_expiry_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(300));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let expired = self.escrow.sweep_expired().await;
                    if !expired.is_empty() {
                        tracing::info!(count = expired.len(), "escrows expired");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
