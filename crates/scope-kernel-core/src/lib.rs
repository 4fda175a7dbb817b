use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ScopeError {
    #[error("scope token does not resolve a non-empty principal")]
    UnresolvedPrincipal,
}

/// Contextual dimensions that stay in the segment list even when they
/// numerically coincide with the principal's root id.
pub const CONTEXT_SEGMENT_KEYS: [&str; 4] = ["conversation", "plan", "project", "world"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalType {
    Agent,
    Persona,
    App,
    Tenant,
    None,
}

impl PrincipalType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Persona => "persona",
            Self::App => "app",
            Self::Tenant => "tenant",
            Self::None => "none",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "agent" => Some(Self::Agent),
            "persona" => Some(Self::Persona),
            "app" => Some(Self::App),
            "tenant" => Some(Self::Tenant),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

impl Display for PrincipalType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One normalized contextual key/value fact about a scope.
///
/// Keys are trimmed and ASCII-lowercased, values trimmed. A segment with an
/// empty key or value after normalization is *empty* and never enters a path.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ScopeSegment {
    key: String,
    value: String,
}

impl ScopeSegment {
    #[must_use]
    pub fn new(key: &str, value: &str) -> Self {
        Self { key: key.trim().to_ascii_lowercase(), value: value.trim().to_string() }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.key.is_empty() || self.value.is_empty()
    }

    #[must_use]
    pub fn canonical(&self) -> String {
        format!("{}={}", self.key, self.value)
    }
}

impl Display for ScopeSegment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// The resolved root steward of a scope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct ScopePrincipal {
    pub root_id: Uuid,
    pub principal_type: PrincipalType,
}

impl ScopePrincipal {
    pub const NONE: Self = Self { root_id: Uuid::nil(), principal_type: PrincipalType::None };

    #[must_use]
    pub fn new(root_id: Uuid, principal_type: PrincipalType) -> Self {
        Self { root_id, principal_type }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root_id.is_nil() || self.principal_type == PrincipalType::None
    }

    #[must_use]
    pub fn canonical(&self) -> String {
        format!("{}:{}", self.principal_type.as_str(), self.root_id)
    }
}

impl Display for ScopePrincipal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.principal_type.as_str(), self.root_id)
    }
}

/// Raw caller input: any subset of the platform's identity roots and
/// contextual dimensions.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScopeToken {
    pub tenant: Option<Uuid>,
    pub app: Option<Uuid>,
    pub persona: Option<Uuid>,
    pub agent: Option<Uuid>,
    pub conversation: Option<Uuid>,
    pub plan: Option<Uuid>,
    pub project: Option<Uuid>,
    pub world: Option<Uuid>,
}

impl ScopeToken {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots().iter().all(|(_, value)| value.is_none())
    }

    /// All eight identifier slots in fixed declaration order.
    #[must_use]
    pub fn slots(&self) -> [(&'static str, Option<Uuid>); 8] {
        [
            ("tenant", self.tenant),
            ("app", self.app),
            ("persona", self.persona),
            ("agent", self.agent),
            ("conversation", self.conversation),
            ("plan", self.plan),
            ("project", self.project),
            ("world", self.world),
        ]
    }

    /// Resolve the owning principal by strict precedence: agent, then
    /// persona, then app, then tenant. First match wins, no partial credit.
    #[must_use]
    pub fn resolve_principal(&self) -> ScopePrincipal {
        if let Some(agent) = self.agent {
            return ScopePrincipal::new(agent, PrincipalType::Agent);
        }
        if let Some(persona) = self.persona {
            return ScopePrincipal::new(persona, PrincipalType::Persona);
        }
        if let Some(app) = self.app {
            return ScopePrincipal::new(app, PrincipalType::App);
        }
        if let Some(tenant) = self.tenant {
            return ScopePrincipal::new(tenant, PrincipalType::Tenant);
        }
        ScopePrincipal::NONE
    }

    /// Candidate segments for this token given its resolved principal.
    ///
    /// A slot that restates the principal's (type, id) pair is skipped unless
    /// it is one of [`CONTEXT_SEGMENT_KEYS`], which name a different semantic
    /// axis than identity and are always included.
    #[must_use]
    pub fn candidate_segments(&self, principal: &ScopePrincipal) -> Vec<ScopeSegment> {
        let mut segments = Vec::new();
        for (key, value) in self.slots() {
            let Some(id) = value else {
                continue;
            };
            let restates_principal =
                principal.principal_type.as_str() == key && principal.root_id == id;
            if restates_principal && !CONTEXT_SEGMENT_KEYS.contains(&key) {
                continue;
            }
            segments.push(ScopeSegment::new(key, &id.to_string()));
        }
        segments
    }
}

/// Immutable canonical scope artifact: one principal plus a sorted,
/// deduplicated segment list and the derived canonical string.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct ScopePath {
    principal: ScopePrincipal,
    segments: Vec<ScopeSegment>,
    canonical: String,
}

impl ScopePath {
    /// The only constructor. Empty segments are dropped, the rest are sorted
    /// by (key, value) ordinal byte order and deduplicated, and the canonical
    /// string is built once.
    #[must_use]
    pub fn new(principal: ScopePrincipal, segments: Vec<ScopeSegment>) -> Self {
        let mut kept: Vec<ScopeSegment> =
            segments.into_iter().filter(|segment| !segment.is_empty()).collect();
        kept.sort();
        kept.dedup();
        let canonical = build_canonical(&principal, &kept);
        Self { principal, segments: kept, canonical }
    }

    #[must_use]
    pub fn from_token(token: &ScopeToken) -> Self {
        let principal = token.resolve_principal();
        let segments = token.candidate_segments(&principal);
        Self::new(principal, segments)
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::new(ScopePrincipal::NONE, Vec::new())
    }

    /// Copy-on-extend: a new path with one additional segment merged in.
    /// An empty segment is a no-op and returns a clone of self.
    #[must_use]
    pub fn with_segment(&self, segment: ScopeSegment) -> Self {
        if segment.is_empty() {
            return self.clone();
        }
        let mut segments = self.segments.clone();
        segments.push(segment);
        Self::new(self.principal, segments)
    }

    #[must_use]
    pub fn principal(&self) -> ScopePrincipal {
        self.principal
    }

    #[must_use]
    pub fn segments(&self) -> &[ScopeSegment] {
        &self.segments
    }

    #[must_use]
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.principal.is_empty() && self.segments.is_empty()
    }
}

impl Display for ScopePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical)
    }
}

fn build_canonical(principal: &ScopePrincipal, segments: &[ScopeSegment]) -> String {
    let mut canonical = principal.canonical();
    for segment in segments {
        canonical.push('/');
        canonical.push_str(&segment.canonical());
    }
    canonical
}

/// Storage-oriented projection of a scope path. Only constructible when the
/// source token resolves a non-empty principal.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScopePathProjection {
    pub canonical: String,
    pub principal_type: PrincipalType,
    pub principal_id: Option<Uuid>,
    pub segments: Vec<ScopeSegment>,
}

impl ScopePathProjection {
    /// # Errors
    /// Returns [`ScopeError::UnresolvedPrincipal`] when the token carries no
    /// identifier that can own the scope (contextual ids alone do not count).
    pub fn try_create(token: &ScopeToken) -> Result<Self, ScopeError> {
        Self::from_path(&ScopePath::from_token(token))
    }

    /// # Errors
    /// Returns [`ScopeError::UnresolvedPrincipal`] when the path's principal
    /// is empty.
    pub fn from_path(path: &ScopePath) -> Result<Self, ScopeError> {
        let principal = path.principal();
        if principal.is_empty() {
            return Err(ScopeError::UnresolvedPrincipal);
        }
        let principal_id = if principal.root_id.is_nil() { None } else { Some(principal.root_id) };
        Ok(Self {
            canonical: path.canonical().to_string(),
            principal_type: principal.principal_type,
            principal_id,
            segments: path.segments().to_vec(),
        })
    }

    /// Flatten segments to a key -> first-value map for column/attribute
    /// storage. Lossy on purpose: when two distinct dimensions collide on a
    /// key name, the first value in sorted order wins and the rest are
    /// silently dropped.
    #[must_use]
    pub fn segment_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        for segment in &self.segments {
            map.entry(segment.key().to_string()).or_insert_with(|| segment.value().to_string());
        }
        map
    }
}

/// Thin façade over [`ScopePath`] construction so call sites never re-derive
/// principal-precedence rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScopePathBuilder;

impl ScopePathBuilder {
    #[must_use]
    pub fn build(token: &ScopeToken) -> ScopePath {
        ScopePath::from_token(token)
    }

    /// `None` when nothing meaningful was built; callers treat that as
    /// "do not scope this record" rather than an error.
    #[must_use]
    pub fn try_build(token: &ScopeToken) -> Option<ScopePath> {
        let path = Self::build(token);
        if path.is_empty() {
            None
        } else {
            Some(path)
        }
    }

    /// Build from a token and merge in ad-hoc extra segments, e.g. a
    /// job-specific tag, in one construction pass.
    #[must_use]
    pub fn build_extended<I>(token: &ScopeToken, extra: I) -> ScopePath
    where
        I: IntoIterator<Item = ScopeSegment>,
    {
        let principal = token.resolve_principal();
        let mut segments = token.candidate_segments(&principal);
        segments.extend(extra);
        ScopePath::new(principal, segments)
    }
}

/// Extract a 128-bit identifier from a loosely-typed legacy metadata value.
///
/// Closed set of accepted shapes: a JSON string, or a structured-document
/// scalar node exported as `{"value": "<string>"}`. Anything else fails soft
/// to absent.
#[must_use]
pub fn uuid_from_value(value: &Value) -> Option<Uuid> {
    match value {
        Value::String(raw) => Uuid::parse_str(raw.trim()).ok(),
        Value::Object(map) => match map.get("value") {
            Some(Value::String(raw)) => Uuid::parse_str(raw.trim()).ok(),
            _ => None,
        },
        _ => None,
    }
}

fn normalize_metadata_key(key: &str) -> String {
    key.chars().filter(|ch| *ch != '_' && *ch != '-').collect::<String>().to_ascii_lowercase()
}

/// Reconstruct a [`ScopeToken`] from an untyped legacy metadata bag.
///
/// Key lookup is case- and separator-insensitive (`tenantId`, `tenant_id`
/// and `TenantID` all match). Malformed values are treated as absent; the
/// result is `None` only when no slot could be recovered at all.
#[must_use]
pub fn token_from_metadata(metadata: &serde_json::Map<String, Value>) -> Option<ScopeToken> {
    let mut token = ScopeToken::default();
    let mut recovered = false;
    for (raw_key, value) in metadata {
        let Some(id) = uuid_from_value(value) else {
            continue;
        };
        let slot = match normalize_metadata_key(raw_key).as_str() {
            "tenant" | "tenantid" => &mut token.tenant,
            "app" | "appid" => &mut token.app,
            "persona" | "personaid" => &mut token.persona,
            "agent" | "agentid" => &mut token.agent,
            "conversation" | "conversationid" => &mut token.conversation,
            "plan" | "planid" => &mut token.plan,
            "project" | "projectid" => &mut token.project,
            "world" | "worldid" => &mut token.world,
            _ => continue,
        };
        if slot.is_none() {
            *slot = Some(id);
        }
        recovered = true;
    }
    if recovered {
        Some(token)
    } else {
        None
    }
}

/// Cooperative cancellation flag checked between backfill batches and before
/// each widening retrieval query. Never interrupts mid-batch.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    inner: Arc<AtomicBool>,
}

impl CancellationFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }
}

const PRINCIPAL_HISTOGRAM: [PrincipalType; 5] = [
    PrincipalType::Agent,
    PrincipalType::Persona,
    PrincipalType::App,
    PrincipalType::Tenant,
    PrincipalType::None,
];

fn histogram_index(principal_type: PrincipalType) -> usize {
    match principal_type {
        PrincipalType::Agent => 0,
        PrincipalType::Persona => 1,
        PrincipalType::App => 2,
        PrincipalType::Tenant => 3,
        PrincipalType::None => 4,
    }
}

/// Process-lifetime scope observability: write counters, a principal-type
/// histogram, backfill totals, and a content-hash collision detector.
///
/// Constructed once at process start and injected; safe for unbounded
/// concurrent writers. [`ScopeDiagnostics::snapshot`] never blocks writers
/// and never exposes the live structures.
#[derive(Debug, Default)]
pub struct ScopeDiagnostics {
    legacy_writes: AtomicU64,
    path_writes: AtomicU64,
    collision_count: AtomicU64,
    backfill_updated: AtomicU64,
    backfill_skipped: AtomicU64,
    last_updated_unix: AtomicI64,
    last_collision_unix: AtomicI64,
    principal_counts: [AtomicU64; 5],
    collision_scopes: DashMap<String, String>,
}

impl ScopeDiagnostics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A write happened without scope metadata.
    pub fn record_legacy_write(&self) {
        self.legacy_writes.fetch_add(1, Ordering::Relaxed);
        stamp_now(&self.last_updated_unix);
    }

    /// A write happened with scope metadata attached.
    pub fn record_path_write(&self, principal_type: PrincipalType) {
        self.path_writes.fetch_add(1, Ordering::Relaxed);
        self.principal_counts[histogram_index(principal_type)].fetch_add(1, Ordering::Relaxed);
        stamp_now(&self.last_updated_unix);
    }

    /// Record the canonical scope last seen for a content hash. The same
    /// hash resolving to a different canonical is counted as a collision;
    /// latest canonical wins. Divergence is a diagnostic signal, never an
    /// error: it means the hash computation and the scope computation
    /// disagree about what counts as the same scope.
    pub fn observe_content_hash(&self, content_hash: &str, canonical: &str) {
        let previous =
            self.collision_scopes.insert(content_hash.to_string(), canonical.to_string());
        if let Some(previous) = previous {
            if previous != canonical {
                self.collision_count.fetch_add(1, Ordering::Relaxed);
                stamp_now(&self.last_collision_unix);
            }
        }
    }

    /// Fold one backfill invocation's counts into the cumulative totals.
    pub fn record_backfill(&self, updated: u64, skipped: u64) {
        self.backfill_updated.fetch_add(updated, Ordering::Relaxed);
        self.backfill_skipped.fetch_add(skipped, Ordering::Relaxed);
        stamp_now(&self.last_updated_unix);
    }

    /// Materialize an immutable point-in-time view. Consistent-enough for an
    /// observability surface; exact cross-field linearizability is not
    /// guaranteed.
    #[must_use]
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let mut principal_counts = BTreeMap::new();
        for principal_type in PRINCIPAL_HISTOGRAM {
            principal_counts.insert(
                principal_type.as_str().to_string(),
                self.principal_counts[histogram_index(principal_type)].load(Ordering::Relaxed),
            );
        }
        DiagnosticsSnapshot {
            legacy_writes: self.legacy_writes.load(Ordering::Relaxed),
            path_writes: self.path_writes.load(Ordering::Relaxed),
            principal_counts,
            collision_count: self.collision_count.load(Ordering::Relaxed),
            tracked_content_hashes: u64::try_from(self.collision_scopes.len())
                .unwrap_or(u64::MAX),
            backfill_updated: self.backfill_updated.load(Ordering::Relaxed),
            backfill_skipped: self.backfill_skipped.load(Ordering::Relaxed),
            last_updated: timestamp_from_unix(self.last_updated_unix.load(Ordering::Relaxed)),
            last_collision: timestamp_from_unix(self.last_collision_unix.load(Ordering::Relaxed)),
        }
    }
}

fn stamp_now(slot: &AtomicI64) {
    slot.store(OffsetDateTime::now_utc().unix_timestamp(), Ordering::Relaxed);
}

fn timestamp_from_unix(unix: i64) -> Option<OffsetDateTime> {
    if unix == 0 {
        return None;
    }
    OffsetDateTime::from_unix_timestamp(unix).ok()
}

/// Read-only diagnostics view for external reporting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub legacy_writes: u64,
    pub path_writes: u64,
    pub principal_counts: BTreeMap<String, u64>,
    pub collision_count: u64,
    pub tracked_content_hashes: u64,
    pub backfill_updated: u64,
    pub backfill_skipped: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_updated: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_collision: Option<OffsetDateTime>,
}
