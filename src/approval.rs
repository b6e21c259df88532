//! ApprovalEngine: policy-driven quorum authorization of sensitive
//! operations (spec §3, §4.3). Grounded on
//! `examples/original_source/src/vault/multisig_approval.py` for the
//! policy/quorum/signature-record shape, and on the teacher's
//! `bft_watchdog.rs` for the per-request-lock voting idiom
//! (`parking_lot`-style single lock per unit of concurrent state,
//! translated to `tokio::sync::Mutex` since vote application now
//! suspends across canonical-digest hashing only, never across I/O).

use crate::canonical::CanonicalPayload;
use crate::policy::{ApprovalPolicy, OperationType, PolicyStore};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("policy not found for operation {0:?}")]
    PolicyNotFound(OperationType),

    #[error("signer {0} is not an eligible approver for this request")]
    IneligibleApprover(String),

    #[error("signer {0} has already voted on this request")]
    DuplicateVote(String),

    #[error("signature is invalid")]
    SignatureInvalid,

    #[error("request has expired")]
    RequestExpired,

    #[error("time restriction violated")]
    TimeRestrictionViolated,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflicting state: {0}")]
    ConflictState(String),

    #[error("emergency override requires policy permission and caller capability")]
    EmergencyOverrideDenied,

    #[error("no executor registered for operation {0:?}")]
    NoExecutor(OperationType),

    #[error("executor failed: {0}")]
    ExecutionFailed(String),
}

pub type Result<T> = std::result::Result<T, ApprovalError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    Ed25519,
    RsaPssSha256,
    EcdsaP256Sha256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    Approve,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalSignature {
    pub signer_id: String,
    pub signature_bytes: Vec<u8>,
    pub signer_public_key: Vec<u8>,
    pub algorithm: SignatureAlgorithm,
    pub signed_message_hash: [u8; 32],
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Executed,
}

#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub operation_type: OperationType,
    pub operation_payload: CanonicalPayload,
    pub requester_id: String,
    pub policy: ApprovalPolicy,
    pub required_approvals: u32,
    pub total_eligible: u32,
    pub eligible_approver_ids: Vec<String>,
    pub approvals: Vec<ApprovalSignature>,
    pub rejections: Vec<ApprovalSignature>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ApprovalStatus,
    pub emergency_override: bool,
    pub execution_outcome: Option<String>,
}

impl ApprovalRequest {
    /// The deterministic message every approver signs (spec §4.3):
    /// SHA-256 over a length-prefixed concatenation of
    /// `request_id, operation_type, canonical(payload), requester_id,
    /// created_at_ns`.
    pub fn signing_digest(&self) -> [u8; 32] {
        let mut data = Vec::new();
        let push_field = |data: &mut Vec<u8>, bytes: &[u8]| {
            data.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            data.extend_from_slice(bytes);
        };
        push_field(&mut data, self.request_id.as_bytes());
        push_field(&mut data, format!("{:?}", self.operation_type).as_bytes());
        push_field(&mut data, &self.operation_payload.to_canonical_bytes());
        push_field(&mut data, self.requester_id.as_bytes());
        push_field(&mut data, &self.created_at.timestamp_nanos_opt().unwrap_or(0).to_le_bytes());

        let mut hasher = Sha256::new();
        hasher.update(&data);
        hasher.finalize().into()
    }
}

fn verify_signature(
    algorithm: SignatureAlgorithm,
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> bool {
    match algorithm {
        SignatureAlgorithm::Ed25519 => {
            let Ok(pk) = ed25519_compact::PublicKey::from_slice(public_key) else {
                return false;
            };
            let Ok(sig) = ed25519_compact::Signature::from_slice(signature) else {
                return false;
            };
            pk.verify(message, &sig).is_ok()
        }
        SignatureAlgorithm::RsaPssSha256 => {
            use rsa::pkcs1::DecodeRsaPublicKey;
            use rsa::pss::Signature as PssSignature;
            use rsa::signature::Verifier;
            use rsa::RsaPublicKey;
            let Ok(pk) = RsaPublicKey::from_pkcs1_der(public_key) else {
                return false;
            };
            let verifying_key = rsa::pss::VerifyingKey::<sha2::Sha256>::new(pk);
            let Ok(sig) = PssSignature::try_from(signature) else {
                return false;
            };
            verifying_key.verify(message, &sig).is_ok()
        }
        SignatureAlgorithm::EcdsaP256Sha256 => {
            use p256::ecdsa::signature::Verifier;
            use p256::ecdsa::{Signature, VerifyingKey};
            let Ok(vk) = VerifyingKey::from_sec1_bytes(public_key) else {
                return false;
            };
            let Ok(sig) = Signature::from_slice(signature) else {
                return false;
            };
            vk.verify(message, &sig).is_ok()
        }
    }
}

#[async_trait]
pub trait OperationExecutor: Send + Sync {
    async fn execute(&self, request: &ApprovalRequest) -> std::result::Result<String, String>;
}

pub struct ApprovalEngine {
    policies: Arc<PolicyStore>,
    requests: RwLock<HashMap<String, ApprovalRequest>>,
    request_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    executors: RwLock<HashMap<OperationType, Arc<dyn OperationExecutor>>>,
}

impl ApprovalEngine {
    pub fn new(policies: Arc<PolicyStore>) -> Arc<Self> {
        Arc::new(Self {
            policies,
            requests: RwLock::new(HashMap::new()),
            request_locks: RwLock::new(HashMap::new()),
            executors: RwLock::new(HashMap::new()),
        })
    }

    pub async fn register_executor(&self, operation_type: OperationType, executor: Arc<dyn OperationExecutor>) {
        self.executors.write().await.insert(operation_type, executor);
    }

    async fn lock_for(&self, request_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.request_locks.write().await;
        locks
            .entry(request_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Enumerates eligible approvers and freezes them into the request at
    /// creation, preventing set manipulation mid-quorum (spec §4.3).
    pub async fn create_request(
        &self,
        operation_type: OperationType,
        payload: CanonicalPayload,
        requester_id: impl Into<String>,
        eligible_approver_ids: Vec<String>,
    ) -> Result<ApprovalRequest> {
        let policy = self
            .policies
            .approval_policy(operation_type)
            .ok_or(ApprovalError::PolicyNotFound(operation_type))?
            .clone();

        let now = Utc::now();
        // A policy configured with zero required approvals carries no
        // quorum at all; the request is trivially satisfied at creation
        // so the Orchestrator can dispatch execution immediately.
        let status = if policy.required_approvals == 0 {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Pending
        };
        let request = ApprovalRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            operation_type,
            operation_payload: payload,
            requester_id: requester_id.into(),
            required_approvals: policy.required_approvals,
            total_eligible: policy.total_eligible,
            eligible_approver_ids,
            approvals: Vec::new(),
            rejections: Vec::new(),
            created_at: now,
            expires_at: now + ChronoDuration::hours(policy.timeout_hours),
            status,
            policy,
            emergency_override: false,
            execution_outcome: None,
        };

        self.requests.write().await.insert(request.request_id.clone(), request.clone());
        Ok(request)
    }

    pub async fn get(&self, request_id: &str) -> Option<ApprovalRequest> {
        self.requests.read().await.get(request_id).cloned()
    }

    pub async fn submit_vote(
        &self,
        request_id: &str,
        signer_id: &str,
        vote: Vote,
        signer_public_key: &[u8],
        algorithm: SignatureAlgorithm,
        signature_bytes: Vec<u8>,
    ) -> Result<ApprovalRequest> {
        let lock = self.lock_for(request_id).await;
        let _guard = lock.lock().await;

        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(request_id)
            .ok_or_else(|| ApprovalError::NotFound(request_id.to_string()))?;

        if request.status != ApprovalStatus::Pending {
            return Err(ApprovalError::ConflictState(format!(
                "request {} is not pending",
                request_id
            )));
        }
        if Utc::now() >= request.expires_at {
            request.status = ApprovalStatus::Expired;
            return Err(ApprovalError::RequestExpired);
        }
        if !request.eligible_approver_ids.iter().any(|id| id == signer_id) {
            return Err(ApprovalError::IneligibleApprover(signer_id.to_string()));
        }
        let already_voted = request.approvals.iter().any(|a| a.signer_id == signer_id)
            || request.rejections.iter().any(|a| a.signer_id == signer_id);
        if already_voted {
            return Err(ApprovalError::DuplicateVote(signer_id.to_string()));
        }

        let digest = request.signing_digest();
        if !verify_signature(algorithm, signer_public_key, &digest, &signature_bytes) {
            return Err(ApprovalError::SignatureInvalid);
        }

        let signature = ApprovalSignature {
            signer_id: signer_id.to_string(),
            signature_bytes,
            signer_public_key: signer_public_key.to_vec(),
            algorithm,
            signed_message_hash: digest,
            timestamp: Utc::now(),
        };

        match vote {
            Vote::Approve => {
                request.approvals.push(signature);
                if request.approvals.len() as u32 >= request.required_approvals {
                    request.status = ApprovalStatus::Approved;
                }
            }
            Vote::Reject => {
                request.rejections.push(signature);
                request.status = ApprovalStatus::Rejected;
            }
        }

        Ok(request.clone())
    }

    /// Immediate zero-quorum approval. Requires BOTH
    /// `policy.emergency_bypass` and the caller holding the
    /// `emergency_approver` capability — the Open Question resolution
    /// recorded in DESIGN.md.
    pub async fn emergency_override(
        &self,
        request_id: &str,
        caller_capabilities: &HashSet<String>,
    ) -> Result<ApprovalRequest> {
        let lock = self.lock_for(request_id).await;
        let _guard = lock.lock().await;

        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(request_id)
            .ok_or_else(|| ApprovalError::NotFound(request_id.to_string()))?;

        if !(request.policy.emergency_bypass && caller_capabilities.contains("emergency_approver")) {
            return Err(ApprovalError::EmergencyOverrideDenied);
        }
        if request.status != ApprovalStatus::Pending {
            return Err(ApprovalError::ConflictState("request is not pending".into()));
        }

        request.status = ApprovalStatus::Approved;
        request.emergency_override = true;
        Ok(request.clone())
    }

    /// Idempotent: a second APPROVED→EXECUTED attempt after success is a
    /// no-op that returns the already-recorded outcome (spec §4.3).
    pub async fn execute(&self, request_id: &str) -> Result<ApprovalRequest> {
        let lock = self.lock_for(request_id).await;
        let _guard = lock.lock().await;

        let snapshot = {
            let requests = self.requests.read().await;
            requests
                .get(request_id)
                .cloned()
                .ok_or_else(|| ApprovalError::NotFound(request_id.to_string()))?
        };

        if snapshot.status == ApprovalStatus::Executed {
            return Ok(snapshot);
        }
        if snapshot.status != ApprovalStatus::Approved {
            return Err(ApprovalError::ConflictState("request is not approved".into()));
        }

        let executor = self
            .executors
            .read()
            .await
            .get(&snapshot.operation_type)
            .cloned()
            .ok_or(ApprovalError::NoExecutor(snapshot.operation_type))?;

        let outcome = executor
            .execute(&snapshot)
            .await
            .map_err(ApprovalError::ExecutionFailed)?;

        let mut requests = self.requests.write().await;
        let request = requests.get_mut(request_id).unwrap();
        request.status = ApprovalStatus::Executed;
        request.execution_outcome = Some(outcome);
        Ok(request.clone())
    }

    /// Background expiry scanner: transitions PENDING→EXPIRED at or
    /// after `expires_at` (inclusive, per spec §8 boundary behavior).
    pub async fn scan_expired(&self) -> Vec<String> {
        let now = Utc::now();
        let mut requests = self.requests.write().await;
        let mut expired = Vec::new();
        for request in requests.values_mut() {
            if request.status == ApprovalStatus::Pending && now >= request.expires_at {
                request.status = ApprovalStatus::Expired;
                expired.push(request.request_id.clone());
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> CanonicalPayload {
        CanonicalPayload::new().with_str("credential_id", "cred-1")
    }

    #[tokio::test]
    async fn quorum_approval_then_rejection_scenario() {
        let engine = ApprovalEngine::new(Arc::new(PolicyStore::with_defaults()));
        let eligible = vec!["A".into(), "B".into(), "C".into(), "D".into(), "E".into()];
        let request = engine
            .create_request(OperationType::CredentialDelete, payload(), "requester", eligible)
            .await
            .unwrap();
        assert_eq!(request.required_approvals, 3);

        let kp_a = ed25519_compact::KeyPair::generate();
        let digest = request.signing_digest();
        let sig_a = kp_a.sk.sign(digest, None);
        let request = engine
            .submit_vote(
                &request.request_id,
                "A",
                Vote::Approve,
                kp_a.pk.as_ref(),
                SignatureAlgorithm::Ed25519,
                sig_a.as_ref().to_vec(),
            )
            .await
            .unwrap();
        assert_eq!(request.status, ApprovalStatus::Pending);

        let kp_b = ed25519_compact::KeyPair::generate();
        let sig_b = kp_b.sk.sign(request.signing_digest(), None);
        engine
            .submit_vote(
                &request.request_id,
                "B",
                Vote::Approve,
                kp_b.pk.as_ref(),
                SignatureAlgorithm::Ed25519,
                sig_b.as_ref().to_vec(),
            )
            .await
            .unwrap();

        let kp_c = ed25519_compact::KeyPair::generate();
        let sig_c = kp_c.sk.sign(request.signing_digest(), None);
        let request = engine
            .submit_vote(
                &request.request_id,
                "C",
                Vote::Reject,
                kp_c.pk.as_ref(),
                SignatureAlgorithm::Ed25519,
                sig_c.as_ref().to_vec(),
            )
            .await
            .unwrap();
        assert_eq!(request.status, ApprovalStatus::Rejected);

        let kp_d = ed25519_compact::KeyPair::generate();
        let sig_d = kp_d.sk.sign(request.signing_digest(), None);
        let result = engine
            .submit_vote(
                &request.request_id,
                "D",
                Vote::Approve,
                kp_d.pk.as_ref(),
                SignatureAlgorithm::Ed25519,
                sig_d.as_ref().to_vec(),
            )
            .await;
        assert!(matches!(result, Err(ApprovalError::ConflictState(_))));
    }

    #[tokio::test]
    async fn invalid_signature_is_rejected() {
        let engine = ApprovalEngine::new(Arc::new(PolicyStore::with_defaults()));
        let request = engine
            .create_request(OperationType::CredentialAccess, payload(), "requester", vec!["A".into()])
            .await
            .unwrap();
        let kp = ed25519_compact::KeyPair::generate();
        let bogus_signature = vec![0u8; 64];
        let result = engine
            .submit_vote(
                &request.request_id,
                "A",
                Vote::Approve,
                kp.pk.as_ref(),
                SignatureAlgorithm::Ed25519,
                bogus_signature,
            )
            .await;
        assert!(matches!(result, Err(ApprovalError::SignatureInvalid)));
    }

    #[tokio::test]
    async fn ineligible_signer_is_rejected() {
        let engine = ApprovalEngine::new(Arc::new(PolicyStore::with_defaults()));
        let request = engine
            .create_request(OperationType::CredentialAccess, payload(), "requester", vec!["A".into()])
            .await
            .unwrap();
        let kp = ed25519_compact::KeyPair::generate();
        let sig = kp.sk.sign(request.signing_digest(), None);
        let result = engine
            .submit_vote(
                &request.request_id,
                "Z",
                Vote::Approve,
                kp.pk.as_ref(),
                SignatureAlgorithm::Ed25519,
                sig.as_ref().to_vec(),
            )
            .await;
        assert!(matches!(result, Err(ApprovalError::IneligibleApprover(_))));
    }

    #[tokio::test]
    async fn emergency_override_denied_without_policy_bypass() {
        let engine = ApprovalEngine::new(Arc::new(PolicyStore::with_defaults()));
        let request = engine
            .create_request(OperationType::CredentialDelete, payload(), "requester", vec!["A".into()])
            .await
            .unwrap();
        let mut caps = HashSet::new();
        caps.insert("emergency_approver".to_string());
        let result = engine.emergency_override(&request.request_id, &caps).await;
        assert!(matches!(result, Err(ApprovalError::EmergencyOverrideDenied)));
    }

    #[tokio::test]
    async fn emergency_override_with_policy_and_capability_approves_immediately() {
        let engine = ApprovalEngine::new(Arc::new(PolicyStore::with_defaults()));
        let request = engine
            .create_request(OperationType::CredentialAccess, payload(), "requester", vec!["A".into()])
            .await
            .unwrap();
        let mut caps = HashSet::new();
        caps.insert("emergency_approver".to_string());
        let request = engine.emergency_override(&request.request_id, &caps).await.unwrap();
        assert_eq!(request.status, ApprovalStatus::Approved);
        assert!(request.emergency_override);
    }

    #[tokio::test]
    async fn k_equals_one_approves_on_first_vote() {
        let engine = ApprovalEngine::new(Arc::new(PolicyStore::with_defaults()));
        let request = engine
            .create_request(OperationType::CredentialAccess, payload(), "requester", vec!["A".into()])
            .await
            .unwrap();
        let kp = ed25519_compact::KeyPair::generate();
        let sig = kp.sk.sign(request.signing_digest(), None);
        let request = engine
            .submit_vote(
                &request.request_id,
                "A",
                Vote::Approve,
                kp.pk.as_ref(),
                SignatureAlgorithm::Ed25519,
                sig.as_ref().to_vec(),
            )
            .await
            .unwrap();
        assert_eq!(request.status, ApprovalStatus::Approved);
    }

    struct NoopExecutor;

    #[async_trait]
    impl OperationExecutor for NoopExecutor {
        async fn execute(&self, _request: &ApprovalRequest) -> std::result::Result<String, String> {
            Ok("done".to_string())
        }
    }

    #[tokio::test]
    async fn execution_is_idempotent() {
        let engine = ApprovalEngine::new(Arc::new(PolicyStore::with_defaults()));
        engine
            .register_executor(OperationType::CredentialAccess, Arc::new(NoopExecutor))
            .await;
        let request = engine
            .create_request(OperationType::CredentialAccess, payload(), "requester", vec!["A".into()])
            .await
            .unwrap();
        let kp = ed25519_compact::KeyPair::generate();
        let sig = kp.sk.sign(request.signing_digest(), None);
        engine
            .submit_vote(
                &request.request_id,
                "A",
                Vote::Approve,
                kp.pk.as_ref(),
                SignatureAlgorithm::Ed25519,
                sig.as_ref().to_vec(),
            )
            .await
            .unwrap();

        let first = engine.execute(&request.request_id).await.unwrap();
        assert_eq!(first.status, ApprovalStatus::Executed);
        let second = engine.execute(&request.request_id).await.unwrap();
        assert_eq!(second.execution_outcome, first.execution_outcome);
    }

    #[tokio::test]
    async fn expiry_scan_transitions_pending_requests() {
        let engine = ApprovalEngine::new(Arc::new(PolicyStore::with_defaults()));
        let request = engine
            .create_request(OperationType::CredentialAccess, payload(), "requester", vec!["A".into()])
            .await
            .unwrap();
        {
            let mut requests = engine.requests.write().await;
            requests.get_mut(&request.request_id).unwrap().expires_at = Utc::now() - ChronoDuration::seconds(1);
        }
        let expired = engine.scan_expired().await;
        assert_eq!(expired, vec![request.request_id]);
    }
}
