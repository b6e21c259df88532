//! ThreatEngine: per-entity behavioral baselines, real-time anomaly
//! detectors, and additive risk scoring (spec §3, §4.5). Grounded on
//! `examples/original_source/src/vault/threat_detection.py` for the
//! bounded event-buffer sizing, baseline bookkeeping (`min_samples`,
//! recent-IP capacity, refresh cadence), and severity bucketing this
//! module keeps — but NOT on its sklearn estimators
//! (`IsolationForest`/`MLPClassifier`/`DBSCAN`), which the long-term
//! statistical ML training Non-goal excludes. What remains is the
//! deterministic rule pipeline spec §4.5 names in full.

use crate::eventsink::{EventSink, Outcome, Severity};
use crate::policy::PolicyStore;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Global cap on buffered events across all entities (spec §4.5: "last
/// 10k globally"). Per-entity retention is age-bounded instead of
/// count-bounded (spec: "last 90 days per entity").
const GLOBAL_BUFFER_CAPACITY: usize = 10_000;

fn entity_retention() -> ChronoDuration {
    ChronoDuration::days(90)
}

/// A canonical security event as ThreatEngine consumes it (spec §4.5
/// input shape). Distinct from `eventsink::SecurityEvent`: this is the
/// pre-audit observation the Orchestrator constructs, not the
/// already-persisted record.
#[derive(Debug, Clone)]
pub struct ObservedEvent {
    pub entity_id: String,
    pub entity_type: String,
    pub kind: String,
    pub occurred_at: DateTime<Utc>,
    pub actor_id: Option<String>,
    pub resource_id: Option<String>,
    pub source_ip: Option<String>,
    pub outcome: Outcome,
    pub attributes: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InsightKind {
    Behavioral,
    Pattern,
    Risk,
    Trend,
    Correlation,
}

/// A risk-scored, human-readable conclusion produced by ThreatEngine
/// (spec §3 data model, verbatim field list).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityInsight {
    pub insight_id: String,
    pub kind: InsightKind,
    pub title: String,
    pub description: String,
    pub confidence: f64,
    pub risk: f64,
    pub evidence: Vec<String>,
    pub affected_entities: Vec<String>,
    pub recommendations: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub validated: bool,
    pub false_positive: bool,
}

#[derive(Debug, Clone)]
struct BehavioralBaseline {
    hour_mean: f64,
    hour_stddev: f64,
    day_of_week_histogram: [u32; 7],
    recent_ips: HashSet<String>,
    action_histogram: HashMap<String, u32>,
    sample_count: u32,
    computed_at: DateTime<Utc>,
}

struct EntityState {
    events: VecDeque<ObservedEvent>,
    baseline: Option<BehavioralBaseline>,
}

impl Default for EntityState {
    fn default() -> Self {
        Self { events: VecDeque::new(), baseline: None }
    }
}

fn recompute_baseline(events: &VecDeque<ObservedEvent>, ip_capacity: usize) -> BehavioralBaseline {
    let n = events.len() as f64;
    let hours: Vec<f64> = events.iter().map(|e| e.occurred_at.hour() as f64).collect();
    let hour_mean = hours.iter().sum::<f64>() / n;
    let variance = hours.iter().map(|h| (h - hour_mean).powi(2)).sum::<f64>() / n;
    let hour_stddev = variance.sqrt();

    let mut day_of_week_histogram = [0u32; 7];
    let mut action_histogram = HashMap::new();
    for event in events {
        day_of_week_histogram[event.occurred_at.weekday().num_days_from_monday() as usize] += 1;
        *action_histogram.entry(event.kind.clone()).or_insert(0) += 1;
    }

    let mut recent_ips = HashSet::new();
    for event in events.iter().rev() {
        if recent_ips.len() >= ip_capacity {
            break;
        }
        if let Some(ip) = &event.source_ip {
            recent_ips.insert(ip.clone());
        }
    }

    BehavioralBaseline {
        hour_mean,
        hour_stddev,
        day_of_week_histogram,
        recent_ips,
        action_histogram,
        sample_count: events.len() as u32,
        computed_at: Utc::now(),
    }
}

const PRIVILEGED_KINDS: [&str; 3] = ["admin", "create", "delete"];

fn is_high_privilege_kind(kind: &str) -> bool {
    PRIVILEGED_KINDS.contains(&kind)
        || matches!(
            kind,
            "vault_configure" | "user_manage" | "emergency_revoke" | "hsm_op" | "credential_delete"
        )
}

fn base_risk_for_kind(kind: &str) -> f64 {
    match kind {
        "credential_access" => 0.1,
        "credential_create" => 0.2,
        "credential_update" => 0.15,
        "credential_delete" => 0.3,
        "vault_configure" => 0.3,
        "user_manage" => 0.25,
        "backup_restore" => 0.3,
        "emergency_revoke" => 0.4,
        "share_recover" => 0.35,
        "hsm_op" => 0.25,
        "admin" => 0.25,
        "create" => 0.2,
        "delete" => 0.3,
        "permission_grant" => 0.2,
        _ => 0.1,
    }
}

fn insight(
    kind: InsightKind,
    title: impl Into<String>,
    description: impl Into<String>,
    confidence: f64,
    risk: f64,
    evidence: Vec<String>,
    affected_entities: Vec<String>,
    recommendations: Vec<String>,
) -> SecurityInsight {
    SecurityInsight {
        insight_id: uuid::Uuid::new_v4().to_string(),
        kind,
        title: title.into(),
        description: description.into(),
        confidence,
        risk,
        evidence,
        affected_entities,
        recommendations,
        created_at: Utc::now(),
        expires_at: None,
        validated: false,
        false_positive: false,
    }
}

/// Scores a single observed event into a `[0.0, 1.0]` risk value. The
/// kernel depends only on this trait, never on a concrete estimator, so a
/// host can swap in a trained model later without touching the detector
/// pipeline (the long-term statistical ML training itself stays out of
/// scope, per the Non-goal `threat.rs`'s module doc calls out).
pub trait RiskModel: Send + Sync {
    /// `new_ip` is true when `event.source_ip` is absent from the
    /// entity's baseline (or no baseline exists yet), per spec §4.5's
    /// "new-IP" additive factor.
    fn score(&self, event: &ObservedEvent, new_ip: bool) -> f64;
}

/// Default `RiskModel`: the additive scoring spec §4.5 defines in full
/// (base-by-kind plus off-hours, weekend, failure, high-privilege, and
/// new-IP terms, clamped to 1.0).
#[derive(Debug, Default, Clone, Copy)]
pub struct AdditiveRiskModel;

impl RiskModel for AdditiveRiskModel {
    fn score(&self, event: &ObservedEvent, new_ip: bool) -> f64 {
        let mut score = base_risk_for_kind(&event.kind);
        let hour = event.occurred_at.hour();
        if !(6..20).contains(&hour) {
            score += 0.2;
        }
        let weekday = event.occurred_at.weekday().num_days_from_monday();
        if weekday >= 5 {
            score += 0.1;
        }
        if event.outcome == Outcome::Failure {
            score += 0.2;
        }
        if is_high_privilege_kind(&event.kind) {
            score += 0.2;
        }
        if new_ip {
            score += 0.2;
        }
        score.min(1.0)
    }
}

pub struct ThreatEngine {
    policies: Arc<PolicyStore>,
    event_sink: Option<Arc<dyn EventSink>>,
    entities: RwLock<HashMap<String, EntityState>>,
    global_order: RwLock<VecDeque<String>>,
    global_count: AtomicU64,
    buffer_overrun_count: AtomicU64,
    last_insight_emitted: RwLock<HashMap<(String, String), DateTime<Utc>>>,
    risk_model: Arc<dyn RiskModel>,
}

fn entity_key(entity_type: &str, entity_id: &str) -> String {
    format!("{}:{}", entity_type, entity_id)
}

impl ThreatEngine {
    pub fn new(policies: Arc<PolicyStore>, event_sink: Option<Arc<dyn EventSink>>) -> Arc<Self> {
        Self::with_risk_model(policies, event_sink, Arc::new(AdditiveRiskModel))
    }

    /// As `new`, but with a caller-supplied `RiskModel` in place of the
    /// additive default.
    pub fn with_risk_model(
        policies: Arc<PolicyStore>,
        event_sink: Option<Arc<dyn EventSink>>,
        risk_model: Arc<dyn RiskModel>,
    ) -> Arc<Self> {
        Arc::new(Self {
            policies,
            event_sink,
            entities: RwLock::new(HashMap::new()),
            global_order: RwLock::new(VecDeque::new()),
            global_count: AtomicU64::new(0),
            buffer_overrun_count: AtomicU64::new(0),
            last_insight_emitted: RwLock::new(HashMap::new()),
            risk_model,
        })
    }

    pub fn buffer_overrun_count(&self) -> u64 {
        self.buffer_overrun_count.load(Ordering::Relaxed)
    }

    async fn emit_event(&self, tag: &str, severity: Severity, subject: Option<String>, attrs: HashMap<String, String>) {
        if let Some(sink) = &self.event_sink {
            let _ = sink.append("threat", tag, severity, Outcome::Success, subject, attrs).await;
        }
    }

    /// Stores the event in the per-entity ring buffer, evicting on the
    /// global cap (spec §4.5 `BUFFER_OVERRUN`) and trimming by age
    /// (90-day per-entity retention).
    async fn ingest(&self, event: ObservedEvent) -> String {
        let key = entity_key(&event.entity_type, &event.entity_id);
        let cutoff = event.occurred_at - entity_retention();

        let mut entities = self.entities.write().await;
        let state = entities.entry(key.clone()).or_default();
        state.events.push_back(event);
        while state.events.front().map(|e| e.occurred_at < cutoff).unwrap_or(false) {
            state.events.pop_front();
        }
        drop(entities);

        self.global_order.write().await.push_back(key.clone());
        if self.global_count.fetch_add(1, Ordering::Relaxed) + 1 > GLOBAL_BUFFER_CAPACITY as u64 {
            self.global_count.fetch_sub(1, Ordering::Relaxed);
            let mut order = self.global_order.write().await;
            if let Some(oldest_key) = order.pop_front() {
                let mut entities = self.entities.write().await;
                if let Some(state) = entities.get_mut(&oldest_key) {
                    state.events.pop_front();
                }
            }
            self.buffer_overrun_count.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(entity = %key, "threat engine buffer overrun, oldest event dropped");
        }

        key
    }

    async fn maybe_refresh_baseline(&self, key: &str, now: DateTime<Utc>) {
        let params = self.policies.baseline_params();
        let mut entities = self.entities.write().await;
        let Some(state) = entities.get_mut(key) else { return };

        let idle_expired = state
            .baseline
            .as_ref()
            .map(|baseline| now - baseline.computed_at > ChronoDuration::hours(params.idle_invalidation_hours))
            .unwrap_or(false);
        if idle_expired {
            state.baseline = None;
        }

        let needs_refresh = match &state.baseline {
            None => state.events.len() as u32 >= params.min_samples,
            Some(baseline) => {
                state.events.len() as u32 >= params.min_samples
                    && now - baseline.computed_at >= ChronoDuration::minutes(params.refresh_cadence_minutes)
            }
        };
        if needs_refresh {
            state.baseline = Some(recompute_baseline(&state.events, params.recent_ip_capacity));
        }
    }

    /// Nightly batch refresh hook (spec §4.5/§5: "long-running batch
    /// analysis... cancellable at well-defined checkpoints between
    /// windows"). `should_continue` is polled between entities, never
    /// mid-recomputation, and real-time detection never waits on this.
    pub async fn run_batch_refresh(&self, mut should_continue: impl FnMut() -> bool) {
        let keys: Vec<String> = self.entities.read().await.keys().cloned().collect();
        for key in keys {
            if !should_continue() {
                break;
            }
            self.maybe_refresh_baseline(&key, Utc::now()).await;
        }
    }

    fn detect_off_baseline_access_time(
        &self,
        baseline: Option<&BehavioralBaseline>,
        event: &ObservedEvent,
    ) -> Option<(String, SecurityInsight)> {
        let baseline = baseline?;
        if baseline.hour_stddev <= 0.0 {
            return None;
        }
        let hour = event.occurred_at.hour() as f64;
        let deviation = (hour - baseline.hour_mean).abs() / baseline.hour_stddev;
        let threshold = self.policies.risk_thresholds().hour_of_day_stddev_multiplier;
        if deviation <= threshold {
            return None;
        }
        let confidence = (deviation / 5.0).min(1.0);
        Some((
            "off_baseline_hour".to_string(),
            insight(
                InsightKind::Behavioral,
                "Off-Baseline Access Time",
                format!("Access at hour {} deviates {:.2} stddevs from the entity baseline", hour, deviation),
                confidence,
                confidence,
                vec![format!("event_kind={}", event.kind)],
                vec![event.entity_id.clone()],
                vec!["Confirm the access was authorized for this time window".to_string()],
            ),
        ))
    }

    fn detect_unfamiliar_ip(
        &self,
        baseline: Option<&BehavioralBaseline>,
        event: &ObservedEvent,
    ) -> Option<(String, SecurityInsight)> {
        let baseline = baseline?;
        let ip = event.source_ip.as_ref()?;
        if baseline.recent_ips.contains(ip) {
            return None;
        }
        Some((
            "unfamiliar_ip".to_string(),
            insight(
                InsightKind::Behavioral,
                "Unfamiliar Source IP",
                format!("Source IP {} is not among the entity's recent 50 distinct addresses", ip),
                0.8,
                0.8,
                vec![format!("source_ip={}", ip)],
                vec![event.entity_id.clone()],
                vec!["Verify the source network is expected for this identity".to_string()],
            ),
        ))
    }

    fn detect_rapid_fire(&self, events: &VecDeque<ObservedEvent>, event: &ObservedEvent) -> Option<(String, SecurityInsight)> {
        let thresholds = self.policies.risk_thresholds();
        let window = ChronoDuration::minutes(thresholds.rapid_access_window_minutes);
        let cutoff = event.occurred_at - window;
        let count = events
            .iter()
            .filter(|e| e.kind == "credential_access" && e.actor_id == event.actor_id && e.occurred_at > cutoff)
            .count() as u32;
        if count <= thresholds.rapid_access_count {
            return None;
        }
        Some((
            "rapid_fire_access".to_string(),
            insight(
                InsightKind::Pattern,
                "Rapid-Fire Credential Access",
                format!("{} credential accesses by the same actor within {} minutes", count, thresholds.rapid_access_window_minutes),
                0.9,
                0.9,
                vec![format!("count={}", count)],
                vec![event.entity_id.clone()],
                vec!["Rate-limit or temporarily suspend the actor pending review".to_string()],
            ),
        ))
    }

    fn detect_brute_force(&self, events: &VecDeque<ObservedEvent>, event: &ObservedEvent) -> Option<(String, SecurityInsight)> {
        if event.kind != "credential_access" || event.outcome != Outcome::Success {
            return None;
        }
        let thresholds = self.policies.risk_thresholds();
        let window = ChronoDuration::minutes(thresholds.brute_force_window_minutes);
        let cutoff = event.occurred_at - window;
        let failures = events
            .iter()
            .filter(|e| {
                e.kind == "credential_access"
                    && e.actor_id == event.actor_id
                    && e.outcome == Outcome::Failure
                    && e.occurred_at > cutoff
                    && e.occurred_at <= event.occurred_at
            })
            .count() as u32;
        if failures < thresholds.brute_force_failure_count {
            return None;
        }
        Some((
            "brute_force_pattern".to_string(),
            insight(
                InsightKind::Pattern,
                "Potential Brute-Force Pattern",
                format!("Successful access preceded by {} failures within {} minutes", failures, thresholds.brute_force_window_minutes),
                0.9,
                0.9,
                vec![format!("failure_count={}", failures)],
                vec![event.entity_id.clone()],
                vec!["Force credential rotation and notify the owning team".to_string()],
            ),
        ))
    }

    fn detect_off_hours_privileged(&self, event: &ObservedEvent) -> Option<(String, SecurityInsight)> {
        if !PRIVILEGED_KINDS.contains(&event.kind.as_str()) {
            return None;
        }
        let hour = event.occurred_at.hour();
        if !(0..6).contains(&hour) {
            return None;
        }
        Some((
            "off_hours_privileged".to_string(),
            insight(
                InsightKind::Pattern,
                "Off-Hours Administrative Activity",
                format!("Privileged action '{}' performed at hour {}", event.kind, hour),
                0.7,
                0.5,
                vec![format!("kind={}", event.kind)],
                vec![event.entity_id.clone()],
                vec!["Verify authorization for out-of-hours administrative activity".to_string()],
            ),
        ))
    }

    fn detect_rapid_privilege_change(
        &self,
        events: &VecDeque<ObservedEvent>,
        event: &ObservedEvent,
    ) -> Option<(String, SecurityInsight)> {
        if event.kind != "permission_grant" {
            return None;
        }
        let thresholds = self.policies.risk_thresholds();
        let window = ChronoDuration::minutes(thresholds.privilege_change_window_minutes);
        let cutoff = event.occurred_at - window;
        let subject = event.resource_id.clone().or_else(|| event.actor_id.clone());
        let count = events
            .iter()
            .filter(|e| {
                e.kind == "permission_grant"
                    && e.occurred_at > cutoff
                    && e.resource_id.clone().or_else(|| e.actor_id.clone()) == subject
            })
            .count() as u32;
        if count < thresholds.privilege_change_count {
            return None;
        }
        Some((
            "rapid_privilege_change".to_string(),
            insight(
                InsightKind::Pattern,
                "Rapid Privilege Change",
                format!("{} permission grants for the same subject within {} minutes", count, thresholds.privilege_change_window_minutes),
                0.9,
                0.9,
                vec![format!("grant_count={}", count)],
                vec![event.entity_id.clone()],
                vec!["Review recent permission grants for this subject".to_string()],
            ),
        ))
    }

    fn risk_score(&self, event: &ObservedEvent, baseline: Option<&BehavioralBaseline>) -> f64 {
        let new_ip = match (baseline, event.source_ip.as_ref()) {
            (Some(baseline), Some(ip)) => !baseline.recent_ips.contains(ip),
            (None, Some(_)) => true,
            (_, None) => false,
        };
        self.risk_model.score(event, new_ip)
    }

    /// Should emit iff the (actor, pattern_id) pair has not fired within
    /// the last hour (spec §8 scenario 5: "a subsequent identical event
    /// within the same hour does not produce a duplicate insight").
    async fn should_emit(&self, actor: &str, pattern_id: &str, now: DateTime<Utc>) -> bool {
        let mut last = self.last_insight_emitted.write().await;
        let key = (actor.to_string(), pattern_id.to_string());
        if let Some(previous) = last.get(&key) {
            if now - *previous < ChronoDuration::hours(1) {
                return false;
            }
        }
        last.insert(key, now);
        true
    }

    /// Runs the full spec §4.5 pipeline for a single observed event:
    /// ingestion, baseline maintenance, the six real-time detectors, and
    /// additive risk scoring. Returns the deduplicated insights raised.
    pub async fn analyze_event(&self, event: ObservedEvent) -> Vec<SecurityInsight> {
        let now = event.occurred_at;
        let key = self.ingest(event.clone()).await;
        self.maybe_refresh_baseline(&key, now).await;

        let (baseline, events_snapshot) = {
            let entities = self.entities.read().await;
            let state = entities.get(&key).expect("just ingested");
            if state.baseline.is_none() {
                tracing::debug!(entity = %key, "baseline unavailable, downgrading to pattern-only detection");
            }
            (state.baseline.clone(), state.events.clone())
        };

        let mut candidates: Vec<(String, SecurityInsight)> = Vec::new();
        candidates.extend(self.detect_off_baseline_access_time(baseline.as_ref(), &event));
        candidates.extend(self.detect_unfamiliar_ip(baseline.as_ref(), &event));
        candidates.extend(self.detect_rapid_fire(&events_snapshot, &event));
        candidates.extend(self.detect_brute_force(&events_snapshot, &event));
        candidates.extend(self.detect_off_hours_privileged(&event));
        candidates.extend(self.detect_rapid_privilege_change(&events_snapshot, &event));

        let risk_thresholds = self.policies.risk_thresholds();
        let overall_risk = self.risk_score(&event, baseline.as_ref());
        if overall_risk >= risk_thresholds.insight_risk_threshold {
            candidates.push((
                "risk_insight".to_string(),
                insight(
                    InsightKind::Risk,
                    "Elevated Risk Event",
                    format!("Event '{}' scored {:.2} risk", event.kind, overall_risk),
                    overall_risk,
                    overall_risk,
                    vec![format!("kind={}", event.kind)],
                    vec![event.entity_id.clone()],
                    vec!["Review the event in the context of recent entity activity".to_string()],
                ),
            ));
        }

        let actor = event.actor_id.clone().unwrap_or_else(|| "unknown".to_string());
        let mut accepted = Vec::new();
        for (pattern_id, candidate) in candidates {
            if !self.should_emit(&actor, &pattern_id, now).await {
                continue;
            }
            let severity = match candidate.risk {
                r if r >= risk_thresholds.broadcast_risk_threshold => Severity::High,
                r if r >= 0.5 => Severity::Medium,
                _ => Severity::Low,
            };
            let mut attrs = HashMap::new();
            attrs.insert("insight_id".to_string(), candidate.insight_id.clone());
            attrs.insert("pattern_id".to_string(), pattern_id.clone());
            attrs.insert("risk".to_string(), candidate.risk.to_string());
            attrs.insert("confidence".to_string(), candidate.confidence.to_string());
            self.emit_event("insight.raised", severity, Some(actor.clone()), attrs).await;

            if candidate.risk >= risk_thresholds.broadcast_risk_threshold {
                let mut broadcast_attrs = HashMap::new();
                broadcast_attrs.insert("insight_id".to_string(), candidate.insight_id.clone());
                self.emit_event("insight.broadcast", Severity::High, Some(actor.clone()), broadcast_attrs).await;
            }

            accepted.push(candidate);
        }

        accepted
    }
}
