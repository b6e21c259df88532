//! # Vault Kernel - Enterprise Credential Vault & Agent Identity Security Core
//!
//! `vault_kernel` is the security core of an enterprise credential vault: it
//! issues and binds agent identities, splits and reconstitutes secrets under
//! Shamir thresholds, gates sensitive operations behind multi-signature
//! approval quorums, escrows credentials for business-continuity recovery,
//! and watches the resulting event stream for anomalous behavior.
//!
//! ## Core Philosophy
//!
//! **No single compromised component can exfiltrate a secret or bypass
//! approval.** Key material never leaves the `KeyOracle` boundary, approval
//! quorums are frozen at request creation, and every operation produces an
//! audit record whether it succeeds, is denied, or is left pending.
//!
//! ## Components
//!
//! - ✅ **IdentityStore** - pre-auth bootstrap, machine-bound agent identities, sessions
//! - ✅ **ShamirEngine** - `k`-of-`n` secret splitting over GF(p)
//! - ✅ **ApprovalEngine** - policy-driven multi-signature quorum and execution dispatch
//! - ✅ **EscrowEngine** - encrypted credential escrow with multi-step recovery
//! - ✅ **ThreatEngine** - behavioral baselines, real-time anomaly detectors, risk scoring
//! - ✅ **Orchestrator** - the front door routing every operation through the above
//!
//! ## Example
//!
//! ```rust
//! use vault_kernel::*;
//! use std::collections::HashSet;
//!
//! # async fn example() {
//! let identity = IdentityStore::new(None);
//! let (clear_token, _pre_auth) = identity
//!     .issue_pre_auth(
//!         "bootstrap-issuer",
//!         None,
//!         Some(1),
//!         HashSet::new(),
//!         HashSet::new(),
//!         PreAuthFlags { pre_approved: true, ephemeral: false, reusable: false },
//!     )
//!     .await;
//!
//! let (agent, _keys, session) = identity
//!     .register_agent("host-42", "worker", Some(&clear_token), HashSet::new(), HashSet::new())
//!     .await
//!     .unwrap();
//! assert_eq!(agent.status, AgentStatus::Active);
//! assert!(session.is_some());
//! # }
//! ```
//!
//! ## Security Model
//!
//! ### Protected Against
//!
//! - **Key exfiltration** - `KeyOracle` never exposes raw key material outside a single operation
//! - **Machine impersonation** - constant-time machine-binding recomputation on every session use
//! - **Quorum manipulation** - eligible approvers are frozen at request creation
//! - **Escrow tampering** - AEAD tag mismatch marks the escrow TAMPERED, never silently decrypts
//! - **Approval replay** - deterministic canonical digests bind a signature to one exact request
//!
//! ### NOT Protected Against
//!
//! - **Root access** - an attacker with full control of the host process
//! - **Compromised KeyOracle backend** - the kernel trusts its configured backend (software or HSM)
//! - **Side-channel attacks on the host** - use the `hsm-support` feature for production deployments

pub mod approval;
pub mod canonical;
pub mod error;
pub mod escrow;
pub mod eventsink;
pub mod identity;
pub mod keyoracle;
pub mod orchestrator;
pub mod policy;
pub mod shamir;
pub mod threat;

pub use approval::{
    ApprovalEngine, ApprovalError, ApprovalRequest, ApprovalSignature, ApprovalStatus,
    OperationExecutor, SignatureAlgorithm, Vote,
};
pub use canonical::{CanonicalPayload, CanonicalValue};
pub use error::VaultError;
pub use escrow::{
    EscrowClass, EscrowEngine, EscrowError, EscrowStatus, EscrowedCredential, RecoveryContact,
    RecoveryRequest, RecoveryStatus,
};
pub use eventsink::{EventSink, EventSinkError, FileEventSink, InMemoryEventSink, Outcome, SecurityEvent, Severity};
pub use identity::{
    AgentIdentity, AgentStatus, IdentityError, IdentityStore, KeyMaterial, PreAuthFlags, PreAuthToken, Session,
};
pub use keyoracle::{KeyHandle, KeyOracle, KeyOracleError, KeyPurpose, SoftwareKeyOracle};
pub use orchestrator::{Orchestrator, OrchestratorOutcome};
pub use policy::{ApprovalPolicy, BaselineParams, EscrowPolicy, OperationType, PolicyStore, RiskThresholds};
pub use shamir::{Share, ShamirEngine, ShamirError, ShareSetMeta, ShareSetStatus};
pub use threat::{AdditiveRiskModel, InsightKind, ObservedEvent, RiskModel, SecurityInsight, ThreatEngine};

/// Version of the vault kernel crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod integration_tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[tokio::test]
    async fn pre_auth_bootstrap_to_active_session_workflow() {
        let sink = InMemoryEventSink::new();
        let identity = IdentityStore::new(Some(sink));

        let (clear_token, _pre_auth) = identity
            .issue_pre_auth(
                "bootstrap-issuer",
                None,
                Some(1),
                HashSet::new(),
                HashSet::new(),
                PreAuthFlags { pre_approved: true, ephemeral: false, reusable: false },
            )
            .await;

        let (agent, _keys, session) = identity
            .register_agent("host-42", "worker", Some(&clear_token), HashSet::new(), HashSet::new())
            .await
            .unwrap();
        assert_eq!(agent.status, AgentStatus::Active);
        let session = session.unwrap();
        assert!(identity.validate_session(&session).await.is_ok());
    }

    #[tokio::test]
    async fn split_secret_recombines_under_threshold() {
        let engine = ShamirEngine::new();
        let secret: &[u8] = b"top secret db password";
        let holders = vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string(), "e".to_string()];
        let (meta, shares) = engine.split("db-password", secret, 3, holders).await.unwrap();
        assert_eq!(meta.threshold, 3);
        let recombined = engine.combine(&shares[0..3]).unwrap();
        assert_eq!(recombined, secret);
    }

    #[tokio::test]
    async fn escrow_recover_and_orchestrator_pipeline_compose() {
        let policies = Arc::new(PolicyStore::with_defaults());
        let key_oracle = SoftwareKeyOracle::new();
        let escrow = EscrowEngine::new(key_oracle, None, policies.clone());

        let escrowed = escrow
            .escrow("cred-1", b"shared service credential", "owner-1", EscrowClass::Department, "handoff", vec![])
            .await
            .unwrap();
        assert_eq!(escrowed.status, EscrowStatus::Active);

        // Department escrow requires two approvers from vault_admin/security_officer.
        let roles = vec!["vault_admin".to_string()];
        let recovery = escrow
            .initiate_recovery(&escrowed.escrow_id, "ops-lead", "quarterly handoff", false, &roles, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(recovery.status, RecoveryStatus::Pending);

        escrow.approve_recovery(&recovery.recovery_id, "approver-1", &roles).await.unwrap();
        let recovery = escrow.approve_recovery(&recovery.recovery_id, "approver-2", &roles).await.unwrap();
        assert_eq!(recovery.status, RecoveryStatus::Completed);

        let recovered = escrow.fetch_recovered(&recovery.recovery_id, "ops-lead").await.unwrap();
        assert_eq!(recovered, b"shared service credential".to_vec());

        // Same pipeline the Orchestrator sits in front of: a quorum-gated
        // operation submitted against a live session.
        let identity = IdentityStore::new(None);
        let (clear_token, _pre_auth) = identity
            .issue_pre_auth("bootstrap-issuer", None, Some(1), HashSet::new(), HashSet::new(), PreAuthFlags {
                pre_approved: true,
                ephemeral: false,
                reusable: false,
            })
            .await;
        let (_agent, _keys, session) = identity
            .register_agent("host-7", "worker", Some(&clear_token), HashSet::new(), HashSet::new())
            .await
            .unwrap();
        let session = session.unwrap();

        let approval = ApprovalEngine::new(policies.clone());
        let threat = ThreatEngine::new(policies.clone(), None);
        let orchestrator = Orchestrator::new(identity, approval, policies, threat, escrow, None);

        let outcome = orchestrator
            .submit_operation(
                OperationType::CredentialDelete,
                CanonicalPayload::new(),
                &session,
                vec!["approver-1".to_string(), "approver-2".to_string(), "approver-3".to_string()],
                None,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, OrchestratorOutcome::PendingApproval { .. }));
    }
}
