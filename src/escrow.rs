//! EscrowEngine: custodial encrypted storage of credentials for
//! business-continuity recovery (spec §3, §4.4). Grounded on
//! `examples/original_source/src/vault/credential_escrow.py`'s escrow
//! and multi-step recovery lifecycle; the data-key generation/protection
//! steps it implements by hand collapse into `KeyOracle::generate_key` +
//! `KeyOracle::encrypt`/`decrypt` here, since the kernel's KeyOracle
//! contract (spec §6) already never exposes key material — there is no
//! separate "unseal" step to hand-roll.

use crate::eventsink::{EventSink, Outcome, Severity};
use crate::keyoracle::{KeyHandle, KeyOracle, KeyOracleError, KeyPurpose};
use crate::policy::PolicyStore;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum EscrowError {
    #[error("unauthorized recovery attempt by {0}")]
    UnauthorizedRecovery(String),

    #[error("recovery request expired")]
    RecoveryExpired,

    #[error("ciphertext tampered for escrow {0}")]
    CiphertextTampered(String),

    #[error("data key unavailable: {0}")]
    DataKeyUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflicting state: {0}")]
    ConflictState(String),

    #[error("policy not found for escrow class {0:?}")]
    PolicyNotFound(EscrowClass),
}

pub type Result<T> = std::result::Result<T, EscrowError>;

impl From<KeyOracleError> for EscrowError {
    fn from(e: KeyOracleError) -> Self {
        EscrowError::DataKeyUnavailable(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EscrowClass {
    Individual,
    Department,
    Emergency,
    Succession,
    Regulatory,
    Vendor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowStatus {
    Active,
    Recovered,
    Revoked,
    Expired,
    Tampered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryContact {
    pub name: String,
    pub channel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowedCredential {
    pub escrow_id: String,
    pub credential_id: String,
    pub owner_id: String,
    pub escrow_class: EscrowClass,
    pub ciphertext: Vec<u8>,
    pub data_key_handle: KeyHandle,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: EscrowStatus,
    pub recovery_contacts: Vec<RecoveryContact>,
    pub business_justification: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryStatus {
    Pending,
    Completed,
    Expired,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryRequest {
    pub recovery_id: String,
    pub escrow_id: String,
    pub requester_id: String,
    pub reason: String,
    pub emergency_override: bool,
    pub approvals_required: u32,
    pub approvals: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: RecoveryStatus,
    pub recovered_at: Option<DateTime<Utc>>,
}

struct RecoveredSlot {
    requester_id: String,
    plaintext: Zeroizing<Vec<u8>>,
    expires_at: DateTime<Utc>,
}

pub struct EscrowEngine {
    key_oracle: Arc<dyn KeyOracle>,
    event_sink: Option<Arc<dyn EventSink>>,
    policies: Arc<PolicyStore>,
    escrows: RwLock<HashMap<String, EscrowedCredential>>,
    recoveries: RwLock<HashMap<String, RecoveryRequest>>,
    recovered_slots: RwLock<HashMap<String, RecoveredSlot>>,
}

impl EscrowEngine {
    pub fn new(
        key_oracle: Arc<dyn KeyOracle>,
        event_sink: Option<Arc<dyn EventSink>>,
        policies: Arc<PolicyStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key_oracle,
            event_sink,
            policies,
            escrows: RwLock::new(HashMap::new()),
            recoveries: RwLock::new(HashMap::new()),
            recovered_slots: RwLock::new(HashMap::new()),
        })
    }

    async fn emit(&self, tag: &str, severity: Severity, outcome: Outcome, subject: Option<String>) {
        if let Some(sink) = &self.event_sink {
            let _ = sink.append("escrow", tag, severity, outcome, subject, HashMap::new()).await;
        }
    }

    pub async fn escrow(
        &self,
        credential_id: impl Into<String>,
        plaintext: &[u8],
        owner_id: impl Into<String>,
        class: EscrowClass,
        justification: impl Into<String>,
        contacts: Vec<RecoveryContact>,
    ) -> Result<EscrowedCredential> {
        let policy = self
            .policies
            .escrow_policy(class)
            .ok_or(EscrowError::PolicyNotFound(class))?;

        let handle = self.key_oracle.generate_key(KeyPurpose::DataEncryption).await?;
        let ciphertext = self.key_oracle.encrypt(&handle, plaintext).await?;

        let now = Utc::now();
        let escrow = EscrowedCredential {
            escrow_id: uuid::Uuid::new_v4().to_string(),
            credential_id: credential_id.into(),
            owner_id: owner_id.into(),
            escrow_class: class,
            ciphertext,
            data_key_handle: handle,
            created_at: now,
            expires_at: Some(now + ChronoDuration::days(policy.retention_days)),
            status: EscrowStatus::Active,
            recovery_contacts: contacts,
            business_justification: justification.into(),
        };

        self.escrows.write().await.insert(escrow.escrow_id.clone(), escrow.clone());
        self.emit("credential.escrowed", Severity::Info, Outcome::Success, Some(escrow.escrow_id.clone()))
            .await;
        Ok(escrow)
    }

    fn check_authorized(policy_roles: &[String], requester_roles: &[String]) -> bool {
        requester_roles.iter().any(|r| policy_roles.contains(r))
    }

    pub async fn initiate_recovery(
        &self,
        escrow_id: &str,
        requester_id: impl Into<String>,
        reason: impl Into<String>,
        emergency_override: bool,
        requester_roles: &[String],
        requester_capabilities: &HashSet<String>,
    ) -> Result<RecoveryRequest> {
        let requester_id = requester_id.into();
        let escrow = self
            .escrows
            .read()
            .await
            .get(escrow_id)
            .cloned()
            .ok_or_else(|| EscrowError::NotFound(escrow_id.to_string()))?;
        let policy = self
            .policies
            .escrow_policy(escrow.escrow_class)
            .ok_or(EscrowError::PolicyNotFound(escrow.escrow_class))?;

        if emergency_override {
            if !(policy.emergency_bypass && requester_capabilities.contains("emergency_approver")) {
                return Err(EscrowError::UnauthorizedRecovery(requester_id));
            }
        } else if !Self::check_authorized(&policy.authorized_roles, requester_roles) {
            return Err(EscrowError::UnauthorizedRecovery(requester_id));
        }

        let approvals_required = if emergency_override { 0 } else { policy.required_approvers };
        let now = Utc::now();
        let mut request = RecoveryRequest {
            recovery_id: uuid::Uuid::new_v4().to_string(),
            escrow_id: escrow_id.to_string(),
            requester_id,
            reason: reason.into(),
            emergency_override,
            approvals_required,
            approvals: Vec::new(),
            created_at: now,
            expires_at: now + ChronoDuration::hours(24),
            status: RecoveryStatus::Pending,
            recovered_at: None,
        };

        if emergency_override {
            self.emit(
                "recovery.emergency_override",
                Severity::Critical,
                Outcome::Success,
                Some(request.recovery_id.clone()),
            )
            .await;
        }

        self.recoveries.write().await.insert(request.recovery_id.clone(), request.clone());

        if approvals_required == 0 {
            request = self.complete_recovery(&request.recovery_id).await?;
        }

        Ok(request)
    }

    pub async fn approve_recovery(
        &self,
        recovery_id: &str,
        approver_id: &str,
        approver_roles: &[String],
    ) -> Result<RecoveryRequest> {
        let (escrow_class, mut request) = {
            let recoveries = self.recoveries.read().await;
            let request = recoveries
                .get(recovery_id)
                .cloned()
                .ok_or_else(|| EscrowError::NotFound(recovery_id.to_string()))?;
            let escrow = self
                .escrows
                .read()
                .await
                .get(&request.escrow_id)
                .cloned()
                .ok_or_else(|| EscrowError::NotFound(request.escrow_id.clone()))?;
            (escrow.escrow_class, request)
        };

        if request.status != RecoveryStatus::Pending {
            return Err(EscrowError::ConflictState(format!(
                "recovery {} is not pending",
                recovery_id
            )));
        }
        if Utc::now() >= request.expires_at {
            let mut recoveries = self.recoveries.write().await;
            if let Some(r) = recoveries.get_mut(recovery_id) {
                r.status = RecoveryStatus::Expired;
            }
            return Err(EscrowError::RecoveryExpired);
        }

        let policy = self
            .policies
            .escrow_policy(escrow_class)
            .ok_or(EscrowError::PolicyNotFound(escrow_class))?;
        if !Self::check_authorized(&policy.authorized_roles, approver_roles) {
            return Err(EscrowError::UnauthorizedRecovery(approver_id.to_string()));
        }
        if request.approvals.iter().any(|a| a == approver_id) {
            return Err(EscrowError::ConflictState("duplicate approval".into()));
        }

        request.approvals.push(approver_id.to_string());
        self.recoveries.write().await.insert(recovery_id.to_string(), request.clone());

        if request.approvals.len() as u32 >= request.approvals_required {
            request = self.complete_recovery(recovery_id).await?;
        }

        Ok(request)
    }

    async fn complete_recovery(&self, recovery_id: &str) -> Result<RecoveryRequest> {
        let mut request = self
            .recoveries
            .read()
            .await
            .get(recovery_id)
            .cloned()
            .ok_or_else(|| EscrowError::NotFound(recovery_id.to_string()))?;

        if request.status == RecoveryStatus::Completed {
            return Ok(request);
        }

        let escrow = self
            .escrows
            .read()
            .await
            .get(&request.escrow_id)
            .cloned()
            .ok_or_else(|| EscrowError::NotFound(request.escrow_id.clone()))?;

        let plaintext = match self.key_oracle.decrypt(&escrow.data_key_handle, &escrow.ciphertext).await {
            Ok(pt) => pt,
            Err(_) => {
                let mut escrows = self.escrows.write().await;
                if let Some(e) = escrows.get_mut(&escrow.escrow_id) {
                    e.status = EscrowStatus::Tampered;
                }
                drop(escrows);
                self.emit(
                    "escrow.ciphertext_tampered",
                    Severity::Critical,
                    Outcome::Failure,
                    Some(escrow.escrow_id.clone()),
                )
                .await;
                return Err(EscrowError::CiphertextTampered(escrow.escrow_id.clone()));
            }
        };

        self.key_oracle.destroy(&escrow.data_key_handle).await?;

        {
            let mut escrows = self.escrows.write().await;
            if let Some(e) = escrows.get_mut(&escrow.escrow_id) {
                e.status = EscrowStatus::Recovered;
            }
        }

        let now = Utc::now();
        request.status = RecoveryStatus::Completed;
        request.recovered_at = Some(now);
        self.recoveries.write().await.insert(recovery_id.to_string(), request.clone());

        self.recovered_slots.write().await.insert(
            recovery_id.to_string(),
            RecoveredSlot {
                requester_id: request.requester_id.clone(),
                plaintext: Zeroizing::new(plaintext),
                expires_at: now + ChronoDuration::hours(1),
            },
        );

        self.emit("recovery.completed", Severity::Medium, Outcome::Success, Some(recovery_id.to_string()))
            .await;

        Ok(request)
    }

    /// Releases the recovered plaintext exactly once to the original
    /// requester; the slot is destroyed whether or not the fetch
    /// succeeds, per spec §4.4.
    pub async fn fetch_recovered(&self, recovery_id: &str, requester_id: &str) -> Result<Vec<u8>> {
        let mut slots = self.recovered_slots.write().await;
        let slot = slots
            .remove(recovery_id)
            .ok_or_else(|| EscrowError::NotFound(recovery_id.to_string()))?;
        if Utc::now() >= slot.expires_at {
            return Err(EscrowError::RecoveryExpired);
        }
        if slot.requester_id != requester_id {
            return Err(EscrowError::UnauthorizedRecovery(requester_id.to_string()));
        }
        Ok(slot.plaintext.to_vec())
    }

    /// Sweeps escrows past `expires_at`: ciphertext is dropped and the
    /// KeyOracle handle destroyed.
    pub async fn sweep_expired(&self) -> Vec<String> {
        let now = Utc::now();
        let due: Vec<EscrowedCredential> = self
            .escrows
            .read()
            .await
            .values()
            .filter(|e| e.status == EscrowStatus::Active)
            .filter(|e| e.expires_at.map(|exp| now >= exp).unwrap_or(false))
            .cloned()
            .collect();

        let mut swept = Vec::new();
        for escrow in due {
            let _ = self.key_oracle.destroy(&escrow.data_key_handle).await;
            let mut escrows = self.escrows.write().await;
            if let Some(e) = escrows.get_mut(&escrow.escrow_id) {
                e.status = EscrowStatus::Expired;
                e.ciphertext.clear();
            }
            swept.push(escrow.escrow_id.clone());
        }
        swept
    }

    pub async fn get(&self, escrow_id: &str) -> Option<EscrowedCredential> {
        self.escrows.read().await.get(escrow_id).cloned()
    }
}
