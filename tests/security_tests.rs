//! Attack-simulation suite: black-box tests that drive `vault_kernel`
//! only through its public API, the way a hostile caller would, and
//! assert the kernel's stated guarantees actually hold end to end.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use vault_kernel::*;

fn payload(field: &str, value: &str) -> CanonicalPayload {
    CanonicalPayload::new().with_str(field, value)
}

/// An attacker who captures a valid approval signature for one request
/// tries to replay it against a different request. The signed digest
/// binds request_id + payload + requester + timestamp, so the signature
/// only verifies against the exact request it was produced for.
#[tokio::test]
async fn approval_signature_cannot_be_replayed_across_requests() {
    let engine = ApprovalEngine::new(Arc::new(PolicyStore::with_defaults()));

    let request_a = engine
        .create_request(
            OperationType::CredentialAccess,
            payload("credential_id", "cred-a"),
            "requester",
            vec!["signer".to_string()],
        )
        .await
        .unwrap();
    let request_b = engine
        .create_request(
            OperationType::CredentialAccess,
            payload("credential_id", "cred-b"),
            "requester",
            vec!["signer".to_string()],
        )
        .await
        .unwrap();
    assert_ne!(request_a.signing_digest(), request_b.signing_digest());

    let keypair = ed25519_compact::KeyPair::generate();
    let signature_for_a = keypair.sk.sign(request_a.signing_digest(), None);

    // Legitimate use against the request it was signed for succeeds.
    engine
        .submit_vote(
            &request_a.request_id,
            "signer",
            Vote::Approve,
            keypair.pk.as_ref(),
            SignatureAlgorithm::Ed25519,
            signature_for_a.as_ref().to_vec(),
        )
        .await
        .unwrap();

    // Replaying the same signature bytes against the other request fails:
    // they were never produced over request_b's digest.
    let replayed = engine
        .submit_vote(
            &request_b.request_id,
            "signer",
            Vote::Approve,
            keypair.pk.as_ref(),
            SignatureAlgorithm::Ed25519,
            signature_for_a.as_ref().to_vec(),
        )
        .await;
    assert!(matches!(replayed, Err(ApprovalError::SignatureInvalid)));
}

/// A single flipped bit in an otherwise-valid signature must be detected,
/// not silently tolerated by a loose comparison.
#[tokio::test]
async fn tampered_approval_signature_is_rejected() {
    let engine = ApprovalEngine::new(Arc::new(PolicyStore::with_defaults()));
    let request = engine
        .create_request(
            OperationType::CredentialAccess,
            payload("credential_id", "cred-1"),
            "requester",
            vec!["signer".to_string()],
        )
        .await
        .unwrap();

    let keypair = ed25519_compact::KeyPair::generate();
    let mut forged = keypair.sk.sign(request.signing_digest(), None).as_ref().to_vec();
    forged[0] ^= 0xFF;

    let result = engine
        .submit_vote(
            &request.request_id,
            "signer",
            Vote::Approve,
            keypair.pk.as_ref(),
            SignatureAlgorithm::Ed25519,
            forged,
        )
        .await;
    assert!(matches!(result, Err(ApprovalError::SignatureInvalid)));
}

/// AEAD tampering at the KeyOracle boundary must surface as a hard
/// decryption failure, never a silent decode of garbage plaintext. This
/// is the property `EscrowEngine::complete_recovery` relies on to flag
/// an escrow TAMPERED instead of returning corrupted data.
#[tokio::test]
async fn tampered_ciphertext_fails_decryption() {
    let oracle = SoftwareKeyOracle::new();
    let handle = oracle.generate_key(KeyPurpose::DataEncryption).await.unwrap();
    let mut ciphertext = oracle.encrypt(&handle, b"department service account password").await.unwrap();

    let last = ciphertext.len() - 1;
    ciphertext[last] ^= 0x01;

    let result = oracle.decrypt(&handle, &ciphertext).await;
    assert!(result.is_err(), "flipped ciphertext byte must fail AEAD verification");
}

/// A destroyed key handle can never be reused to decrypt data encrypted
/// under it, even though the caller still holds the (now-dangling)
/// handle value.
#[tokio::test]
async fn destroyed_key_cannot_decrypt_prior_ciphertext() {
    let oracle = SoftwareKeyOracle::new();
    let handle = oracle.generate_key(KeyPurpose::DataEncryption).await.unwrap();
    let ciphertext = oracle.encrypt(&handle, b"rotated credential").await.unwrap();
    oracle.destroy(&handle).await.unwrap();

    let result = oracle.decrypt(&handle, &ciphertext).await;
    assert!(matches!(result, Err(KeyOracleError::HandleNotFound(_))));
}

/// Constructs the scenario spec §4.1 calls fatal: an agent whose
/// `machine_id` no longer matches the one its binding was computed
/// against. `binding_is_valid` must catch this on every check, not just
/// at registration time.
#[tokio::test]
async fn forged_machine_id_fails_binding_recomputation() {
    let identity = IdentityStore::new(None);
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
    let (agent, _keys, _session) = identity
        .register_agent("laptop-17", "worker", Some(&clear_token), HashSet::new(), HashSet::new())
        .await
        .unwrap();
    assert!(agent.binding_is_valid());

    // An attacker who steals the key material and re-registers it to a
    // different machine_id would produce exactly this shape: the same
    // fingerprint, a different claimed machine_id, and therefore a
    // binding that doesn't recompute to the one that was issued.
    let mut impersonated = agent.clone();
    impersonated.machine_id = "attacker-host".to_string();
    assert!(!impersonated.binding_is_valid());
}

/// A revoked session must be rejected even though the bearer token
/// itself is still a structurally valid, correctly-hashed value.
#[tokio::test]
async fn revoked_session_token_is_rejected_despite_structural_validity() {
    let identity = IdentityStore::new(None);
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
        .register_agent("host-9", "worker", Some(&clear_token), HashSet::new(), HashSet::new())
        .await
        .unwrap();
    let session = session.unwrap();
    assert!(identity.validate_session(&session).await.is_ok());

    identity.revoke(&agent.identity_id, "security-team", "incident response").await.unwrap();
    let result = identity.validate_session(&session).await;
    assert!(result.is_err(), "revoked session must not validate");
}

/// A non-reusable pre-auth token is a single-use bootstrap credential:
/// a second registration attempt with the same clear token must fail,
/// the same way a replayed one-time password would.
#[tokio::test]
async fn single_use_pre_auth_token_cannot_be_replayed() {
    let identity = IdentityStore::new(None);
    let (clear_token, _pre_auth) = identity
        .issue_pre_auth(
            "bootstrap-issuer",
            None,
            None,
            HashSet::new(),
            HashSet::new(),
            PreAuthFlags { pre_approved: true, ephemeral: false, reusable: false },
        )
        .await;

    identity
        .register_agent("host-a", "worker", Some(&clear_token), HashSet::new(), HashSet::new())
        .await
        .unwrap();

    let replay = identity
        .register_agent("host-b", "worker", Some(&clear_token), HashSet::new(), HashSet::new())
        .await;
    assert!(matches!(replay, Err(IdentityError::ConflictExhausted)));
}

/// Shares captured by an attacker before a rotation keep reconstructing
/// the secret they were always bound to. Rotation marks the share set
/// ROTATED and starts a fresh polynomial for new shares, but it has no
/// way to make already-distributed share values forget the secret they
/// encode: only revoking the underlying credential at the system of
/// record retires them in practice.
#[tokio::test]
async fn rotation_does_not_retroactively_invalidate_captured_shares() {
    let engine = ShamirEngine::new();
    let holders = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    let (_meta, old_shares) = engine.split("db-password", b"original-password", 2, holders).await.unwrap();

    // Attacker captures two of the three original shares.
    let captured = vec![old_shares[0].clone(), old_shares[1].clone()];

    engine.rotate("db-password", b"rotated-password").await.unwrap();

    // The captured shares still combine to the value they were split
    // from, not the rotated one, and not nothing.
    let recovered = engine.combine(&captured).unwrap();
    assert_eq!(recovered, b"original-password".to_vec());
}

/// A department-class escrow recovery releases plaintext exactly once:
/// a second fetch against the same completed recovery must fail even
/// though the original requester is asking again.
#[tokio::test]
async fn recovered_plaintext_cannot_be_fetched_twice() {
    let policies = Arc::new(PolicyStore::with_defaults());
    let key_oracle = SoftwareKeyOracle::new();
    let escrow = EscrowEngine::new(key_oracle, None, policies);

    let escrowed = escrow
        .escrow("cred-9", b"shared secret", "owner-1", EscrowClass::Department, "handoff", vec![])
        .await
        .unwrap();

    let roles = vec!["vault_admin".to_string()];
    let recovery = escrow
        .initiate_recovery(&escrowed.escrow_id, "ops-lead", "handoff", false, &roles, &HashSet::new())
        .await
        .unwrap();
    escrow.approve_recovery(&recovery.recovery_id, "approver-1", &roles).await.unwrap();
    let recovery = escrow.approve_recovery(&recovery.recovery_id, "approver-2", &roles).await.unwrap();
    assert_eq!(recovery.status, RecoveryStatus::Completed);

    let first = escrow.fetch_recovered(&recovery.recovery_id, "ops-lead").await;
    assert!(first.is_ok());
    let second = escrow.fetch_recovered(&recovery.recovery_id, "ops-lead").await;
    assert!(second.is_err(), "a second fetch against the same recovery must not re-release plaintext");
}

/// A requester other than the one who opened the recovery cannot fetch
/// the released plaintext, even immediately after completion.
#[tokio::test]
async fn recovered_plaintext_is_bound_to_the_original_requester() {
    let policies = Arc::new(PolicyStore::with_defaults());
    let key_oracle = SoftwareKeyOracle::new();
    let escrow = EscrowEngine::new(key_oracle, None, policies);

    let escrowed = escrow
        .escrow("cred-10", b"another shared secret", "owner-1", EscrowClass::Department, "handoff", vec![])
        .await
        .unwrap();

    let roles = vec!["vault_admin".to_string()];
    let recovery = escrow
        .initiate_recovery(&escrowed.escrow_id, "ops-lead", "handoff", false, &roles, &HashSet::new())
        .await
        .unwrap();
    escrow.approve_recovery(&recovery.recovery_id, "approver-1", &roles).await.unwrap();
    let recovery = escrow.approve_recovery(&recovery.recovery_id, "approver-2", &roles).await.unwrap();

    let result = escrow.fetch_recovered(&recovery.recovery_id, "someone-else").await;
    assert!(matches!(result, Err(EscrowError::UnauthorizedRecovery(_))));
}

/// Sustained failed access followed by one success is the textbook
/// brute-force shape spec §4.5 names. The orchestrator's threat feed
/// must surface it as a high-risk insight the same turn it happens, not
/// on some later batch pass.
#[tokio::test]
async fn brute_force_login_pattern_surfaces_as_high_risk_insight_in_real_time() {
    let threat = ThreatEngine::new(Arc::new(PolicyStore::with_defaults()), None);
    let mut attrs = HashMap::new();
    attrs.insert("channel".to_string(), "api".to_string());

    for _ in 0..3 {
        threat
            .analyze_event(ObservedEvent {
                entity_id: "agent-under-attack".to_string(),
                entity_type: "agent".to_string(),
                kind: "credential_access".to_string(),
                occurred_at: chrono::Utc::now(),
                actor_id: Some("agent-under-attack".to_string()),
                resource_id: None,
                source_ip: Some("203.0.113.5".to_string()),
                outcome: Outcome::Failure,
                attributes: attrs.clone(),
            })
            .await;
    }

    let insights = threat
        .analyze_event(ObservedEvent {
            entity_id: "agent-under-attack".to_string(),
            entity_type: "agent".to_string(),
            kind: "credential_access".to_string(),
            occurred_at: chrono::Utc::now(),
            actor_id: Some("agent-under-attack".to_string()),
            resource_id: None,
            source_ip: Some("203.0.113.5".to_string()),
            outcome: Outcome::Success,
            attributes: attrs,
        })
        .await;

    assert!(insights.iter().any(|i| i.title == "Potential Brute-Force Pattern"));
}

/// Full pipeline: an attacker with a valid but revoked session attempts
/// a sensitive operation through the orchestrator and must be rejected
/// fail-closed, with an audit record left behind regardless.
#[tokio::test]
async fn orchestrator_rejects_operation_on_revoked_session() {
    let sink = InMemoryEventSink::new();
    let identity = IdentityStore::new(Some(sink.clone()));
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
        .register_agent("host-attacker-target", "worker", Some(&clear_token), HashSet::new(), HashSet::new())
        .await
        .unwrap();
    let session = session.unwrap();
    identity.revoke(&agent.identity_id, "security-team", "compromise suspected").await.unwrap();

    let policies = Arc::new(PolicyStore::with_defaults());
    let approval = ApprovalEngine::new(policies.clone());
    let threat = ThreatEngine::new(policies.clone(), None);
    let escrow = EscrowEngine::new(SoftwareKeyOracle::new(), Some(sink.clone()), policies.clone());
    let orchestrator = Orchestrator::new(identity, approval, policies, threat, escrow, Some(sink.clone()));

    let result = orchestrator
        .submit_operation(
            OperationType::CredentialAccess,
            payload("credential_id", "cred-1"),
            &session,
            vec!["approver-1".to_string()],
            None,
        )
        .await;
    assert!(result.is_err());

    let denials = sink.query_by_tag("operation.audit", 10).await.unwrap();
    assert!(denials.iter().any(|e| e.outcome == Outcome::Denied));
}
