//! IdentityStore: agent identities, pre-auth tokens, sessions, and their
//! lifecycle (spec §3, §4.1). Grounded on the teacher's `nonce_store.rs`
//! (hash-only persistence of secret material, constant-time validity
//! checks) and `crypto.rs` (keypair generation idiom), generalized from
//! "one secret type" to the full agent-identity lifecycle.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::sync::RwLock;
use zeroize::Zeroizing;

use crate::eventsink::{EventSink, Outcome, Severity};

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("pre-auth token invalid")]
    PreAuthInvalid,

    #[error("machine binding mismatch for identity {0}")]
    MachineBindingMismatch(String),

    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    #[error("identity not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {0}")]
    InvalidState(String),

    #[error("pre-auth token exhausted or already used")]
    ConflictExhausted,
}

pub type Result<T> = std::result::Result<T, IdentityError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    Pending,
    Approved,
    Active,
    Suspended,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub identity_id: String,
    pub agent_id: String,
    pub machine_id: String,
    pub agent_type: String,
    pub signing_public_key: Vec<u8>,
    pub exchange_public_key: Vec<u8>,
    pub key_fingerprint: [u8; 32],
    pub machine_binding: [u8; 32],
    pub status: AgentStatus,
    pub approver_id: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub tags: HashSet<String>,
    pub capabilities: HashSet<String>,
    pub created_at: DateTime<Utc>,
}

fn fingerprint_of(signing_pub: &[u8], exchange_pub: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(signing_pub);
    hasher.update(exchange_pub);
    hasher.finalize().into()
}

fn machine_binding_of(machine_id: &str, fingerprint: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(machine_id.as_bytes());
    hasher.update(b":");
    hasher.update(fingerprint);
    hasher.finalize().into()
}

impl AgentIdentity {
    /// Recomputes the binding and compares against the stored value.
    /// Spec §3: "machine_binding MUST match a fresh recomputation on
    /// every authentication".
    pub fn binding_is_valid(&self) -> bool {
        let recomputed = machine_binding_of(&self.machine_id, &self.key_fingerprint);
        recomputed.ct_eq(&self.machine_binding).into()
    }
}

/// Private key material, handed to the caller exactly once at
/// registration. The store never retains a copy.
pub struct KeyMaterial {
    pub signing_public_key: Vec<u8>,
    pub signing_private_key: Zeroizing<Vec<u8>>,
    pub exchange_public_key: Vec<u8>,
    pub exchange_private_key: Zeroizing<Vec<u8>>,
}

fn generate_key_material() -> std::result::Result<KeyMaterial, IdentityError> {
    let signing = ed25519_compact::KeyPair::generate();
    let exchange_secret = x25519_dalek::StaticSecret::random_from_rng(rand::rngs::OsRng);
    let exchange_public = x25519_dalek::PublicKey::from(&exchange_secret);
    Ok(KeyMaterial {
        signing_public_key: signing.pk.as_ref().to_vec(),
        signing_private_key: Zeroizing::new(signing.sk.as_ref().to_vec()),
        exchange_public_key: exchange_public.as_bytes().to_vec(),
        exchange_private_key: Zeroizing::new(exchange_secret.to_bytes().to_vec()),
    })
}

#[derive(Debug, Clone)]
pub struct PreAuthFlags {
    pub pre_approved: bool,
    pub ephemeral: bool,
    pub reusable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreAuthToken {
    pub token_id: String,
    #[serde(with = "hex_bytes")]
    pub token_hash: [u8; 32],
    pub prefix: String,
    pub issuer_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_uses: Option<u64>,
    pub uses: u64,
    pub tags: HashSet<String>,
    pub capabilities: HashSet<String>,
    pub pre_approved: bool,
    pub ephemeral: bool,
    pub reusable: bool,
    pub revoked: bool,
}

mod hex_bytes {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<[u8; 32], D::Error> {
        use serde::de::Error;
        let s = String::deserialize(d)?;
        let v = hex::decode(s).map_err(D::Error::custom)?;
        v.try_into().map_err(|_| D::Error::custom("expected 32 bytes"))
    }
}

impl PreAuthToken {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        if self.revoked {
            return false;
        }
        if let Some(expires_at) = self.expires_at {
            if now >= expires_at {
                return false;
            }
        }
        if let Some(max_uses) = self.max_uses {
            if self.uses >= max_uses {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    #[serde(with = "hex_bytes")]
    pub token_hash: [u8; 32],
    pub identity_id: String,
    pub machine_id: String,
    pub source_ip: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

fn random_token() -> (String, [u8; 32]) {
    let mut raw = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    let clear = hex::encode(raw);
    let mut hasher = Sha256::new();
    hasher.update(&raw);
    let hash: [u8; 32] = hasher.finalize().into();
    (clear, hash)
}

fn hash_token(clear: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(clear.as_bytes());
    hasher.finalize().into()
}

pub struct IdentityStore {
    identities: RwLock<HashMap<String, AgentIdentity>>,
    by_fingerprint: RwLock<HashMap<[u8; 32], String>>,
    pre_auth_tokens: RwLock<HashMap<[u8; 32], PreAuthToken>>,
    sessions: RwLock<HashMap<[u8; 32], Session>>,
    sessions_by_identity: RwLock<HashMap<String, Vec<[u8; 32]>>>,
    event_sink: Option<Arc<dyn EventSink>>,
}

impl IdentityStore {
    pub fn new(event_sink: Option<Arc<dyn EventSink>>) -> Arc<Self> {
        Arc::new(Self {
            identities: RwLock::new(HashMap::new()),
            by_fingerprint: RwLock::new(HashMap::new()),
            pre_auth_tokens: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            sessions_by_identity: RwLock::new(HashMap::new()),
            event_sink,
        })
    }

    async fn emit(&self, tag: &str, severity: Severity, outcome: Outcome, subject: Option<String>) {
        if let Some(sink) = &self.event_sink {
            let _ = sink
                .append("identity", tag, severity, outcome, subject, HashMap::new())
                .await;
        }
    }

    pub async fn issue_pre_auth(
        &self,
        issuer_id: impl Into<String>,
        ttl: Option<ChronoDuration>,
        max_uses: Option<u64>,
        tags: HashSet<String>,
        capabilities: HashSet<String>,
        flags: PreAuthFlags,
    ) -> (String, PreAuthToken) {
        let (clear, hash) = random_token();
        let now = Utc::now();
        let token = PreAuthToken {
            token_id: uuid::Uuid::new_v4().to_string(),
            token_hash: hash,
            prefix: clear[..8].to_string(),
            issuer_id: issuer_id.into(),
            created_at: now,
            expires_at: ttl.map(|d| now + d),
            max_uses,
            uses: 0,
            tags,
            capabilities,
            pre_approved: flags.pre_approved,
            ephemeral: flags.ephemeral,
            reusable: flags.reusable,
            revoked: false,
        };
        self.pre_auth_tokens.write().await.insert(hash, token.clone());
        self.emit("pre_auth.issued", Severity::Info, Outcome::Success, Some(token.token_id.clone()))
            .await;
        (clear, token)
    }

    /// Constant-time hash lookup; returns `Some` only if every validity
    /// predicate in spec §3 holds.
    pub async fn validate_pre_auth(&self, clear_token: &str) -> Option<PreAuthToken> {
        let hash = hash_token(clear_token);
        let tokens = self.pre_auth_tokens.read().await;
        let token = tokens.get(&hash)?;
        if token.is_valid(Utc::now()) {
            Some(token.clone())
        } else {
            None
        }
    }

    pub async fn register_agent(
        &self,
        machine_id: impl Into<String>,
        agent_type: impl Into<String>,
        pre_auth_clear: Option<&str>,
        requested_tags: HashSet<String>,
        requested_caps: HashSet<String>,
    ) -> Result<(AgentIdentity, KeyMaterial, Option<String>)> {
        let machine_id = machine_id.into();
        let agent_type = agent_type.into();

        let token = match pre_auth_clear {
            Some(clear) => {
                let hash = hash_token(clear);
                let mut tokens = self.pre_auth_tokens.write().await;
                let token = tokens.get_mut(&hash).ok_or(IdentityError::PreAuthInvalid)?;
                if !token.is_valid(Utc::now()) {
                    return Err(IdentityError::PreAuthInvalid);
                }
                if !token.reusable && token.uses > 0 {
                    return Err(IdentityError::ConflictExhausted);
                }
                token.uses += 1;
                if let Some(max_uses) = token.max_uses {
                    if token.uses > max_uses {
                        return Err(IdentityError::ConflictExhausted);
                    }
                }
                Some(token.clone())
            }
            None => None,
        };

        let key_material =
            generate_key_material().map_err(|e| IdentityError::KeyGenerationFailed(e.to_string()))?;
        let fingerprint = fingerprint_of(&key_material.signing_public_key, &key_material.exchange_public_key);
        let machine_binding = machine_binding_of(&machine_id, &fingerprint);

        let mut tags = requested_tags;
        let mut capabilities = requested_caps;
        if let Some(token) = &token {
            tags.extend(token.tags.iter().cloned());
            capabilities.extend(token.capabilities.iter().cloned());
        }

        let pre_approved = token.as_ref().map(|t| t.pre_approved).unwrap_or(false);
        let status = if pre_approved {
            AgentStatus::Active
        } else {
            AgentStatus::Pending
        };

        let identity = AgentIdentity {
            identity_id: uuid::Uuid::new_v4().to_string(),
            agent_id: format!("{}:{}:{}", machine_id, agent_type, Utc::now().timestamp()),
            machine_id,
            agent_type,
            signing_public_key: key_material.signing_public_key.clone(),
            exchange_public_key: key_material.exchange_public_key.clone(),
            key_fingerprint: fingerprint,
            machine_binding,
            status,
            approver_id: None,
            approved_at: None,
            tags,
            capabilities,
            created_at: Utc::now(),
        };

        self.identities
            .write()
            .await
            .insert(identity.identity_id.clone(), identity.clone());
        self.by_fingerprint
            .write()
            .await
            .insert(fingerprint, identity.identity_id.clone());

        self.emit(
            "agent.registered",
            Severity::Info,
            Outcome::Success,
            Some(identity.identity_id.clone()),
        )
        .await;

        let session_token = if status == AgentStatus::Active {
            Some(self.open_session(&identity.identity_id, None).await?)
        } else {
            None
        };

        Ok((identity, key_material, session_token))
    }

    pub async fn approve(
        &self,
        agent_identity_id: &str,
        approver_id: impl Into<String>,
        grant_tags: HashSet<String>,
        grant_caps: HashSet<String>,
    ) -> Result<AgentIdentity> {
        let mut identities = self.identities.write().await;
        let identity = identities
            .get_mut(agent_identity_id)
            .ok_or_else(|| IdentityError::NotFound(agent_identity_id.to_string()))?;
        if identity.status != AgentStatus::Pending {
            return Err(IdentityError::InvalidState(format!(
                "cannot approve identity in state {:?}",
                identity.status
            )));
        }
        identity.status = AgentStatus::Active;
        identity.approver_id = Some(approver_id.into());
        identity.approved_at = Some(Utc::now());
        identity.tags.extend(grant_tags);
        identity.capabilities.extend(grant_caps);
        let result = identity.clone();
        drop(identities);
        self.emit(
            "agent.approved",
            Severity::Info,
            Outcome::Success,
            Some(result.identity_id.clone()),
        )
        .await;
        Ok(result)
    }

    pub async fn revoke(&self, agent_identity_id: &str, actor_id: &str, reason: &str) -> Result<()> {
        let mut identities = self.identities.write().await;
        let identity = identities
            .get_mut(agent_identity_id)
            .ok_or_else(|| IdentityError::NotFound(agent_identity_id.to_string()))?;
        identity.status = AgentStatus::Revoked;
        drop(identities);

        if let Some(session_hashes) = self.sessions_by_identity.read().await.get(agent_identity_id) {
            let mut sessions = self.sessions.write().await;
            for hash in session_hashes {
                if let Some(session) = sessions.get_mut(hash) {
                    session.revoked = true;
                }
            }
        }

        let mut attrs = HashMap::new();
        attrs.insert("actor_id".to_string(), actor_id.to_string());
        attrs.insert("reason".to_string(), reason.to_string());
        if let Some(sink) = &self.event_sink {
            let _ = sink
                .append(
                    "identity",
                    "agent.revoked",
                    Severity::Medium,
                    Outcome::Success,
                    Some(agent_identity_id.to_string()),
                    attrs,
                )
                .await;
        }
        Ok(())
    }

    /// Revokes with critical severity, used when the caller has detected
    /// a machine-binding mismatch (spec §4.1 failure modes: fatal for the
    /// identity).
    pub async fn revoke_for_binding_mismatch(&self, agent_identity_id: &str) -> Result<()> {
        self.revoke(agent_identity_id, "system", "machine_binding_mismatch").await?;
        self.emit(
            "identity.machine_binding_mismatch",
            Severity::Critical,
            Outcome::Denied,
            Some(agent_identity_id.to_string()),
        )
        .await;
        Ok(())
    }

    pub async fn get_by_id(&self, identity_id: &str) -> Option<AgentIdentity> {
        self.identities.read().await.get(identity_id).cloned()
    }

    pub async fn get_by_fingerprint(&self, fingerprint: &[u8; 32]) -> Option<AgentIdentity> {
        let id = self.by_fingerprint.read().await.get(fingerprint).cloned()?;
        self.identities.read().await.get(&id).cloned()
    }

    pub async fn list(&self, status: Option<AgentStatus>, machine_id: Option<&str>) -> Vec<AgentIdentity> {
        self.identities
            .read()
            .await
            .values()
            .filter(|i| status.map(|s| i.status == s).unwrap_or(true))
            .filter(|i| machine_id.map(|m| i.machine_id == m).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub async fn open_session(&self, identity_id: &str, source_ip: Option<String>) -> Result<String> {
        let identity = self
            .identities
            .read()
            .await
            .get(identity_id)
            .cloned()
            .ok_or_else(|| IdentityError::NotFound(identity_id.to_string()))?;
        let (clear, hash) = random_token();
        let now = Utc::now();
        let session = Session {
            session_id: uuid::Uuid::new_v4().to_string(),
            token_hash: hash,
            identity_id: identity_id.to_string(),
            machine_id: identity.machine_id.clone(),
            source_ip,
            issued_at: now,
            expires_at: now + ChronoDuration::hours(12),
            revoked: false,
        };
        self.sessions.write().await.insert(hash, session);
        self.sessions_by_identity
            .write()
            .await
            .entry(identity_id.to_string())
            .or_default()
            .push(hash);
        Ok(clear)
    }

    /// Constant-time hash lookup plus status/expiry check, per spec §4.1.
    pub async fn validate_session(&self, clear_token: &str) -> Result<AgentIdentity> {
        let hash = hash_token(clear_token);
        let sessions = self.sessions.read().await;
        let session = sessions.get(&hash).ok_or(IdentityError::PreAuthInvalid)?;
        if session.revoked || Utc::now() >= session.expires_at {
            return Err(IdentityError::PreAuthInvalid);
        }
        let identity = self
            .identities
            .read()
            .await
            .get(&session.identity_id)
            .cloned()
            .ok_or_else(|| IdentityError::NotFound(session.identity_id.clone()))?;
        if identity.status != AgentStatus::Active {
            return Err(IdentityError::InvalidState("identity is not active".into()));
        }
        if !identity.binding_is_valid() {
            drop(sessions);
            self.revoke_for_binding_mismatch(&identity.identity_id).await?;
            return Err(IdentityError::MachineBindingMismatch(identity.identity_id));
        }
        Ok(identity)
    }
}
