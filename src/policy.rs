//! PolicyStore: read-mostly configuration of approval, escrow, and risk
//! policies (spec §2, §6 "Configuration surface"). Default policy values
//! are grounded on
//! `examples/original_source/src/vault/multisig_approval.py`'s
//! `initialize_approval_policies` and
//! `examples/original_source/src/vault/credential_escrow.py`'s
//! `initialize_escrow_policies`.

use crate::escrow::EscrowClass;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    CredentialAccess,
    CredentialCreate,
    CredentialUpdate,
    CredentialDelete,
    VaultConfigure,
    UserManage,
    BackupRestore,
    EmergencyRevoke,
    ShareRecover,
    HsmOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    pub operation_type: OperationType,
    pub required_approvals: u32,
    pub total_eligible: u32,
    pub eligible_roles: Vec<String>,
    pub timeout_hours: i64,
    pub emergency_bypass: bool,
    pub business_hours_only: bool,
    pub geographic_restrictions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowPolicy {
    pub escrow_class: EscrowClass,
    pub retention_days: i64,
    pub required_approvers: u32,
    pub authorized_roles: Vec<String>,
    pub notification_targets: Vec<String>,
    pub emergency_bypass: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskThresholds {
    pub hour_of_day_stddev_multiplier: f64,
    pub rapid_access_count: u32,
    pub rapid_access_window_minutes: i64,
    pub brute_force_failure_count: u32,
    pub brute_force_window_minutes: i64,
    pub privilege_change_count: u32,
    pub privilege_change_window_minutes: i64,
    pub insight_risk_threshold: f64,
    pub broadcast_risk_threshold: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            hour_of_day_stddev_multiplier: 2.5,
            rapid_access_count: 10,
            rapid_access_window_minutes: 5,
            brute_force_failure_count: 3,
            brute_force_window_minutes: 30,
            privilege_change_count: 2,
            privilege_change_window_minutes: 60,
            insight_risk_threshold: 0.5,
            broadcast_risk_threshold: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineParams {
    pub min_samples: u32,
    pub recent_ip_capacity: usize,
    pub refresh_cadence_minutes: i64,
    pub idle_invalidation_hours: i64,
}

impl Default for BaselineParams {
    fn default() -> Self {
        Self {
            min_samples: 50,
            recent_ip_capacity: 50,
            refresh_cadence_minutes: 60,
            idle_invalidation_hours: 24 * 7,
        }
    }
}

pub struct PolicyStore {
    approval_policies: HashMap<OperationType, ApprovalPolicy>,
    escrow_policies: HashMap<EscrowClass, EscrowPolicy>,
    risk_thresholds: RiskThresholds,
    baseline_params: BaselineParams,
}

fn policy(
    operation_type: OperationType,
    required_approvals: u32,
    total_eligible: u32,
    eligible_roles: &[&str],
    timeout_hours: i64,
    emergency_bypass: bool,
    business_hours_only: bool,
) -> ApprovalPolicy {
    ApprovalPolicy {
        operation_type,
        required_approvals,
        total_eligible,
        eligible_roles: eligible_roles.iter().map(|s| s.to_string()).collect(),
        timeout_hours,
        emergency_bypass,
        business_hours_only,
        geographic_restrictions: Vec::new(),
    }
}

fn escrow_policy(
    escrow_class: EscrowClass,
    retention_days: i64,
    required_approvers: u32,
    authorized_roles: &[&str],
    emergency_bypass: bool,
) -> EscrowPolicy {
    EscrowPolicy {
        escrow_class,
        retention_days,
        required_approvers,
        authorized_roles: authorized_roles.iter().map(|s| s.to_string()).collect(),
        notification_targets: Vec::new(),
        emergency_bypass,
    }
}

impl PolicyStore {
    /// Defaults mirror the original system's concrete per-operation and
    /// per-class policy table; a host is free to override any entry via
    /// `set_approval_policy` / `set_escrow_policy` before wiring the
    /// Orchestrator.
    pub fn with_defaults() -> Self {
        let mut approval_policies = HashMap::new();
        approval_policies.insert(
            OperationType::CredentialAccess,
            policy(OperationType::CredentialAccess, 1, 2, &["vault_admin", "security_officer"], 2, true, false),
        );
        approval_policies.insert(
            OperationType::CredentialCreate,
            policy(OperationType::CredentialCreate, 2, 3, &["vault_admin", "security_officer"], 4, true, false),
        );
        approval_policies.insert(
            OperationType::CredentialUpdate,
            policy(OperationType::CredentialUpdate, 2, 3, &["vault_admin", "security_officer"], 4, true, false),
        );
        approval_policies.insert(
            OperationType::CredentialDelete,
            policy(
                OperationType::CredentialDelete,
                3,
                5,
                &["vault_admin", "security_officer", "compliance_officer"],
                24,
                false,
                true,
            ),
        );
        approval_policies.insert(
            OperationType::VaultConfigure,
            policy(
                OperationType::VaultConfigure,
                5,
                7,
                &["vault_admin", "security_officer", "compliance_officer"],
                24,
                false,
                true,
            ),
        );
        approval_policies.insert(
            OperationType::UserManage,
            policy(OperationType::UserManage, 2, 3, &["vault_admin", "security_officer"], 8, true, false),
        );
        approval_policies.insert(
            OperationType::BackupRestore,
            policy(
                OperationType::BackupRestore,
                3,
                5,
                &["vault_admin", "security_officer", "compliance_officer"],
                24,
                false,
                true,
            ),
        );
        approval_policies.insert(
            OperationType::EmergencyRevoke,
            policy(OperationType::EmergencyRevoke, 1, 2, &["security_officer", "emergency_approver"], 1, true, false),
        );
        approval_policies.insert(
            OperationType::ShareRecover,
            policy(
                OperationType::ShareRecover,
                3,
                5,
                &["vault_admin", "security_officer", "compliance_officer"],
                24,
                true,
                false,
            ),
        );
        approval_policies.insert(
            OperationType::HsmOp,
            policy(OperationType::HsmOp, 2, 3, &["vault_admin", "security_officer"], 8, false, false),
        );

        let mut escrow_policies = HashMap::new();
        escrow_policies.insert(
            EscrowClass::Individual,
            escrow_policy(EscrowClass::Individual, 90, 1, &["vault_admin"], false),
        );
        escrow_policies.insert(
            EscrowClass::Department,
            escrow_policy(EscrowClass::Department, 180, 2, &["vault_admin", "security_officer"], false),
        );
        escrow_policies.insert(
            EscrowClass::Emergency,
            escrow_policy(EscrowClass::Emergency, 365, 1, &["security_officer", "emergency_approver"], true),
        );
        escrow_policies.insert(
            EscrowClass::Succession,
            escrow_policy(
                EscrowClass::Succession,
                365 * 3,
                3,
                &["vault_admin", "security_officer", "compliance_officer"],
                false,
            ),
        );
        escrow_policies.insert(
            EscrowClass::Regulatory,
            escrow_policy(
                EscrowClass::Regulatory,
                365 * 7,
                3,
                &["compliance_officer", "security_officer"],
                false,
            ),
        );
        escrow_policies.insert(
            EscrowClass::Vendor,
            escrow_policy(EscrowClass::Vendor, 365, 2, &["vault_admin", "security_officer"], false),
        );

        Self {
            approval_policies,
            escrow_policies,
            risk_thresholds: RiskThresholds::default(),
            baseline_params: BaselineParams::default(),
        }
    }

    pub fn approval_policy(&self, operation_type: OperationType) -> Option<&ApprovalPolicy> {
        self.approval_policies.get(&operation_type)
    }

    pub fn set_approval_policy(&mut self, op: OperationType, policy: ApprovalPolicy) {
        self.approval_policies.insert(op, policy);
    }

    pub fn escrow_policy(&self, class: EscrowClass) -> Option<&EscrowPolicy> {
        self.escrow_policies.get(&class)
    }

    pub fn set_escrow_policy(&mut self, class: EscrowClass, policy: EscrowPolicy) {
        self.escrow_policies.insert(class, policy);
    }

    pub fn risk_thresholds(&self) -> &RiskThresholds {
        &self.risk_thresholds
    }

    pub fn baseline_params(&self) -> &BaselineParams {
        &self.baseline_params
    }
}
