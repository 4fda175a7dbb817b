use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use scope_kernel_core::{
    CancellationFlag, ScopeDiagnostics, ScopeError, ScopePathProjection, ScopeToken,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const META_SCOPE_PATH: &str = "scopePath";
pub const META_SCOPE_PRINCIPAL_TYPE: &str = "scopePrincipalType";
pub const META_SCOPE_PRINCIPAL_ID: &str = "scopePrincipalId";
pub const META_SCOPE_SEGMENTS: &str = "scopeSegments";
pub const META_CONTENT_HASH: &str = "contentHash";

/// Scope metadata attached to outbound vector documents: the canonical scope
/// fields plus flat per-identifier fields kept for backward-compatible
/// filtering.
///
/// # Errors
/// Returns [`ScopeError::UnresolvedPrincipal`] when the token cannot own a
/// scope.
pub fn scope_metadata(token: &ScopeToken) -> Result<BTreeMap<String, Value>, ScopeError> {
    let projection = ScopePathProjection::try_create(token)?;
    Ok(metadata_from_projection(&projection, token))
}

fn metadata_from_projection(
    projection: &ScopePathProjection,
    token: &ScopeToken,
) -> BTreeMap<String, Value> {
    let mut metadata = BTreeMap::new();
    metadata.insert(META_SCOPE_PATH.to_string(), Value::String(projection.canonical.clone()));
    metadata.insert(
        META_SCOPE_PRINCIPAL_TYPE.to_string(),
        Value::String(projection.principal_type.as_str().to_string()),
    );
    if let Some(principal_id) = projection.principal_id {
        metadata.insert(
            META_SCOPE_PRINCIPAL_ID.to_string(),
            Value::String(principal_id.to_string()),
        );
    }

    let mut segments = serde_json::Map::new();
    for (key, value) in projection.segment_map() {
        segments.insert(key, Value::String(value));
    }
    metadata.insert(META_SCOPE_SEGMENTS.to_string(), Value::Object(segments));

    for (key, value) in flat_fields(token) {
        if let Some(id) = value {
            metadata.insert(key.to_string(), Value::String(id.to_string()));
        }
    }
    metadata
}

fn flat_fields(token: &ScopeToken) -> [(&'static str, Option<Uuid>); 8] {
    [
        ("tenantId", token.tenant),
        ("appId", token.app),
        ("personaId", token.persona),
        ("agentId", token.agent),
        ("conversationId", token.conversation),
        ("planId", token.plan),
        ("projectId", token.project),
        ("worldId", token.world),
    ]
}

/// Content hash for write-time deduplication. Scope identifiers are folded
/// into the digest in a fixed order (tenant, app, agent, conversation,
/// project, world; each only when present) so identical content written
/// under different scopes produces different hashes. A hash that later
/// resolves to a different canonical scope is exactly what the collision
/// detector flags.
#[must_use]
pub fn scoped_content_hash(content: &str, token: &ScopeToken) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let ordered = [
        ("tenant", token.tenant),
        ("app", token.app),
        ("agent", token.agent),
        ("conversation", token.conversation),
        ("project", token.project),
        ("world", token.world),
    ];
    for (name, value) in ordered {
        if let Some(id) = value {
            hasher.update(name.as_bytes());
            hasher.update(id.as_bytes());
        }
    }
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Conjunction of equality constraints over document metadata. Keys may be
/// top-level (`scopePath`) or dotted into a nested object
/// (`scopeSegments.conversation`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchFilter {
    pub equals: Vec<(String, String)>,
}

impl SearchFilter {
    #[must_use]
    pub fn unfiltered() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.equals.push((key.to_string(), value.to_string()));
        self
    }

    #[must_use]
    pub fn matches(&self, metadata: &BTreeMap<String, Value>) -> bool {
        self.equals.iter().all(|(key, expected)| {
            metadata_value(metadata, key)
                .is_some_and(|value| matches!(value, Value::String(raw) if raw == expected))
        })
    }
}

fn metadata_value<'a>(metadata: &'a BTreeMap<String, Value>, key: &str) -> Option<&'a Value> {
    match key.split_once('.') {
        Some((head, tail)) => match metadata.get(head) {
            Some(Value::Object(nested)) => nested.get(tail),
            _ => None,
        },
        None => metadata.get(key),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexedDocument {
    pub id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
    pub metadata: BTreeMap<String, Value>,
}

/// Boundary to the vector backend: opaque metadata on write, equality
/// filters plus similarity ranking on read.
pub trait VectorIndex {
    /// # Errors
    /// Returns an error when the backend rejects the write.
    fn upsert(&mut self, document: IndexedDocument) -> Result<()>;

    /// # Errors
    /// Returns an error when the backend rejects the query.
    fn search(
        &self,
        embedding: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<SearchHit>>;
}

/// Reference index with deterministic cosine ranking; ties break by
/// ascending document id.
#[derive(Debug, Default)]
pub struct InMemoryVectorIndex {
    documents: BTreeMap<String, IndexedDocument>,
}

impl InMemoryVectorIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

impl VectorIndex for InMemoryVectorIndex {
    fn upsert(&mut self, document: IndexedDocument) -> Result<()> {
        self.documents.insert(document.id.clone(), document);
        Ok(())
    }

    fn search(
        &self,
        embedding: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let mut hits: Vec<SearchHit> = self
            .documents
            .values()
            .filter(|document| filter.matches(&document.metadata))
            .map(|document| SearchHit {
                id: document.id.clone(),
                score: cosine_similarity(embedding, &document.embedding),
                metadata: document.metadata.clone(),
            })
            .collect();
        hits.sort_by(|lhs, rhs| {
            rhs.score
                .partial_cmp(&lhs.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| lhs.id.cmp(&rhs.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

fn cosine_similarity(lhs: &[f32], rhs: &[f32]) -> f64 {
    let mut dot = 0.0_f64;
    let mut lhs_norm = 0.0_f64;
    let mut rhs_norm = 0.0_f64;
    for (a, b) in lhs.iter().zip(rhs.iter()) {
        dot += f64::from(*a) * f64::from(*b);
        lhs_norm += f64::from(*a) * f64::from(*a);
        rhs_norm += f64::from(*b) * f64::from(*b);
    }
    if lhs_norm == 0.0 || rhs_norm == 0.0 {
        return 0.0;
    }
    dot / (lhs_norm.sqrt() * rhs_norm.sqrt())
}

/// Write one scoped document: scope metadata and a scope-aware content hash
/// are attached, the write counters are bumped, and the hash/scope pair is
/// fed to the collision detector. Returns the content hash.
///
/// # Errors
/// Returns an error when the token resolves no principal or the backend
/// rejects the write.
pub fn write_document<I: VectorIndex>(
    index: &mut I,
    diagnostics: &ScopeDiagnostics,
    id: &str,
    content: &str,
    embedding: Vec<f32>,
    token: &ScopeToken,
) -> Result<String> {
    let projection = ScopePathProjection::try_create(token)?;
    let mut metadata = metadata_from_projection(&projection, token);
    let content_hash = scoped_content_hash(content, token);
    metadata.insert(META_CONTENT_HASH.to_string(), Value::String(content_hash.clone()));

    index.upsert(IndexedDocument {
        id: id.to_string(),
        content: content.to_string(),
        embedding,
        metadata,
    })?;

    diagnostics.record_path_write(projection.principal_type);
    diagnostics.observe_content_hash(&content_hash, &projection.canonical);
    Ok(content_hash)
}

/// Write one document without scope metadata (legacy path). Counted
/// separately so the migration's dual-write progress is visible.
///
/// # Errors
/// Returns an error when the backend rejects the write.
pub fn write_legacy_document<I: VectorIndex>(
    index: &mut I,
    diagnostics: &ScopeDiagnostics,
    id: &str,
    content: &str,
    embedding: Vec<f32>,
) -> Result<()> {
    index.upsert(IndexedDocument {
        id: id.to_string(),
        content: content.to_string(),
        embedding,
        metadata: BTreeMap::new(),
    })?;
    diagnostics.record_legacy_write();
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub embedding: Vec<f32>,
    pub k: usize,
    pub token: ScopeToken,
}

/// Similarity search with progressive scope widening.
///
/// The first query is restricted to the conversation dimension. When it
/// returns fewer than `k` hits and the token carries an agent id, a second
/// query restricted to the agent root fills exactly the remaining quota.
/// Results merge with first-occurrence-wins per document id, so the more
/// specific match survives. Cancellation is honored before the widening
/// query, never mid-query.
///
/// # Errors
/// Returns an error when the backend rejects a query.
pub fn scoped_search<I: VectorIndex>(
    index: &I,
    request: &SearchRequest,
    cancel: &CancellationFlag,
) -> Result<Vec<SearchHit>> {
    if request.token.conversation.is_none() && request.token.agent.is_none() {
        return index.search(&request.embedding, &SearchFilter::unfiltered(), request.k);
    }

    let mut merged: Vec<SearchHit> = Vec::new();
    let mut seen: BTreeSet<String> = BTreeSet::new();

    if let Some(conversation) = request.token.conversation {
        let filter = SearchFilter::unfiltered()
            .with("scopeSegments.conversation", &conversation.to_string());
        for hit in index.search(&request.embedding, &filter, request.k)? {
            if seen.insert(hit.id.clone()) {
                merged.push(hit);
            }
        }
    }

    if merged.len() >= request.k || cancel.is_cancelled() {
        merged.truncate(request.k);
        return Ok(merged);
    }

    if let Some(agent) = request.token.agent {
        let remaining = request.k - merged.len();
        let filter = SearchFilter::unfiltered()
            .with(META_SCOPE_PRINCIPAL_TYPE, "agent")
            .with(META_SCOPE_PRINCIPAL_ID, &agent.to_string());
        for hit in index.search(&request.embedding, &filter, remaining)? {
            if seen.insert(hit.id.clone()) {
                merged.push(hit);
            }
        }
    }

    merged.truncate(request.k);
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    fn fixture_uuid(input: &str) -> Uuid {
        match Uuid::parse_str(input) {
            Ok(id) => id,
            Err(err) => panic!("invalid fixture uuid {input}: {err}"),
        }
    }

    fn agent_id() -> Uuid {
        fixture_uuid("3fa85f64-5717-4562-b3fc-2c963f66afa6")
    }

    fn conversation_id() -> Uuid {
        fixture_uuid("9c858901-8a57-4791-81fe-4c455b099bc9")
    }

    fn agent_token() -> ScopeToken {
        ScopeToken {
            agent: Some(agent_id()),
            conversation: Some(conversation_id()),
            ..ScopeToken::default()
        }
    }

    fn must_write(
        index: &mut InMemoryVectorIndex,
        diagnostics: &ScopeDiagnostics,
        id: &str,
        content: &str,
        embedding: Vec<f32>,
        token: &ScopeToken,
    ) -> String {
        match write_document(index, diagnostics, id, content, embedding, token) {
            Ok(hash) => hash,
            Err(err) => panic!("write should succeed: {err}"),
        }
    }

    fn must_search(
        index: &InMemoryVectorIndex,
        request: &SearchRequest,
        cancel: &CancellationFlag,
    ) -> Vec<SearchHit> {
        match scoped_search(index, request, cancel) {
            Ok(hits) => hits,
            Err(err) => panic!("search should succeed: {err}"),
        }
    }

    #[test]
    fn metadata_carries_scope_and_flat_fields() {
        let metadata = match scope_metadata(&agent_token()) {
            Ok(metadata) => metadata,
            Err(err) => panic!("metadata should build: {err}"),
        };

        assert_eq!(
            metadata.get(META_SCOPE_PATH),
            Some(&Value::String(format!(
                "agent:{}/conversation={}",
                agent_id(),
                conversation_id()
            )))
        );
        assert_eq!(
            metadata.get(META_SCOPE_PRINCIPAL_TYPE),
            Some(&Value::String("agent".to_string()))
        );
        assert_eq!(
            metadata.get(META_SCOPE_PRINCIPAL_ID),
            Some(&Value::String(agent_id().to_string()))
        );
        match metadata.get(META_SCOPE_SEGMENTS) {
            Some(Value::Object(segments)) => {
                assert_eq!(
                    segments.get("conversation"),
                    Some(&Value::String(conversation_id().to_string()))
                );
            }
            other => panic!("scopeSegments should be an object, got {other:?}"),
        }
        assert_eq!(metadata.get("agentId"), Some(&Value::String(agent_id().to_string())));
        assert_eq!(
            metadata.get("conversationId"),
            Some(&Value::String(conversation_id().to_string()))
        );
        assert_eq!(metadata.get("tenantId"), None);
    }

    #[test]
    fn metadata_requires_a_principal() {
        let token =
            ScopeToken { conversation: Some(conversation_id()), ..ScopeToken::default() };
        assert_eq!(scope_metadata(&token), Err(ScopeError::UnresolvedPrincipal));
    }

    #[test]
    fn content_hash_is_stable_and_scope_sensitive() {
        let token = agent_token();
        let first = scoped_content_hash("same content", &token);
        let second = scoped_content_hash("same content", &token);
        assert_eq!(first, second);
        assert!(first.starts_with("sha256:"));

        let other_scope = ScopeToken {
            agent: Some(fixture_uuid("00000000-0000-0000-0000-00000000beef")),
            ..ScopeToken::default()
        };
        assert_ne!(first, scoped_content_hash("same content", &other_scope));
        assert_ne!(first, scoped_content_hash("different content", &token));
    }

    #[test]
    fn absent_identifiers_do_not_shift_the_hash_order() {
        // tenant+world vs tenant alone must differ even though the digest
        // only folds in present identifiers.
        let tenant = fixture_uuid("00000000-0000-0000-0000-000000000001");
        let world = fixture_uuid("00000000-0000-0000-0000-000000000002");
        let with_world =
            ScopeToken { tenant: Some(tenant), world: Some(world), ..ScopeToken::default() };
        let without_world = ScopeToken { tenant: Some(tenant), ..ScopeToken::default() };

        assert_ne!(
            scoped_content_hash("doc", &with_world),
            scoped_content_hash("doc", &without_world)
        );
    }

    #[test]
    fn write_document_feeds_diagnostics() {
        let mut index = InMemoryVectorIndex::new();
        let diagnostics = ScopeDiagnostics::new();
        must_write(&mut index, &diagnostics, "doc-1", "hello", vec![1.0, 0.0], &agent_token());

        let snapshot = diagnostics.snapshot();
        assert_eq!(snapshot.path_writes, 1);
        assert_eq!(snapshot.legacy_writes, 0);
        assert_eq!(snapshot.principal_counts.get("agent"), Some(&1));
        assert_eq!(snapshot.tracked_content_hashes, 1);
        assert_eq!(snapshot.collision_count, 0);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn legacy_write_counts_separately() {
        let mut index = InMemoryVectorIndex::new();
        let diagnostics = ScopeDiagnostics::new();
        if let Err(err) =
            write_legacy_document(&mut index, &diagnostics, "doc-1", "hello", vec![1.0])
        {
            panic!("legacy write should succeed: {err}");
        }

        let snapshot = diagnostics.snapshot();
        assert_eq!(snapshot.legacy_writes, 1);
        assert_eq!(snapshot.path_writes, 0);
    }

    #[test]
    fn filters_match_top_level_and_nested_keys() {
        let metadata = match scope_metadata(&agent_token()) {
            Ok(metadata) => metadata,
            Err(err) => panic!("metadata should build: {err}"),
        };

        let by_principal = SearchFilter::unfiltered()
            .with(META_SCOPE_PRINCIPAL_TYPE, "agent")
            .with(META_SCOPE_PRINCIPAL_ID, &agent_id().to_string());
        assert!(by_principal.matches(&metadata));

        let by_segment = SearchFilter::unfiltered()
            .with("scopeSegments.conversation", &conversation_id().to_string());
        assert!(by_segment.matches(&metadata));

        let mismatch = SearchFilter::unfiltered().with("scopeSegments.conversation", "other");
        assert!(!mismatch.matches(&metadata));

        let missing = SearchFilter::unfiltered().with("scopeSegments.plan", "anything");
        assert!(!missing.matches(&metadata));
    }

    #[test]
    fn in_memory_index_ranks_deterministically() {
        let mut index = InMemoryVectorIndex::new();
        let diagnostics = ScopeDiagnostics::new();
        // Same embedding: scores tie, ids break the tie ascending.
        for id in ["doc-b", "doc-a", "doc-c"] {
            must_write(&mut index, &diagnostics, id, "same", vec![1.0, 0.0], &agent_token());
        }

        let hits = match index.search(&[1.0, 0.0], &SearchFilter::unfiltered(), 10) {
            Ok(hits) => hits,
            Err(err) => panic!("search should succeed: {err}"),
        };
        let ids: Vec<&str> = hits.iter().map(|hit| hit.id.as_str()).collect();
        assert_eq!(ids, vec!["doc-a", "doc-b", "doc-c"]);
    }

    fn seeded_index(conversation_docs: usize, agent_docs: usize) -> InMemoryVectorIndex {
        let mut index = InMemoryVectorIndex::new();
        let diagnostics = ScopeDiagnostics::new();
        for n in 0..conversation_docs {
            must_write(
                &mut index,
                &diagnostics,
                &format!("conv-{n}"),
                "conversation doc",
                vec![1.0, 0.0],
                &agent_token(),
            );
        }
        for n in 0..agent_docs {
            // Agent-rooted but in other conversations.
            let token = ScopeToken {
                agent: Some(agent_id()),
                conversation: Some(Uuid::from_u128(0xAAAA + u128::try_from(n).unwrap_or(0))),
                ..ScopeToken::default()
            };
            must_write(
                &mut index,
                &diagnostics,
                &format!("agent-{n}"),
                "agent doc",
                vec![1.0, 0.0],
                &token,
            );
        }
        index
    }

    #[test]
    fn widening_fills_remaining_quota_from_agent_scope() {
        let index = seeded_index(3, 10);
        let request = SearchRequest { embedding: vec![1.0, 0.0], k: 8, token: agent_token() };
        let hits = must_search(&index, &request, &CancellationFlag::new());

        assert_eq!(hits.len(), 8);
        let conversation_hits =
            hits.iter().filter(|hit| hit.id.starts_with("conv-")).count();
        assert_eq!(conversation_hits, 3);

        let mut ids: Vec<&str> = hits.iter().map(|hit| hit.id.as_str()).collect();
        let before = ids.len();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), before);
    }

    #[test]
    fn widening_preserves_the_more_specific_match_on_overlap() {
        // Conversation-scoped docs are also agent-rooted, so the second query
        // can return them again; merge must keep the first occurrence.
        let index = seeded_index(2, 2);
        let request = SearchRequest { embedding: vec![1.0, 0.0], k: 10, token: agent_token() };
        let hits = must_search(&index, &request, &CancellationFlag::new());

        let ids: Vec<&str> = hits.iter().map(|hit| hit.id.as_str()).collect();
        let unique: BTreeSet<&str> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());
        assert!(hits.len() <= 4);
    }

    #[test]
    fn conversation_results_alone_satisfy_the_quota() {
        let index = seeded_index(5, 5);
        let request = SearchRequest { embedding: vec![1.0, 0.0], k: 3, token: agent_token() };
        let hits = must_search(&index, &request, &CancellationFlag::new());

        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|hit| hit.id.starts_with("conv-")));
    }

    #[test]
    fn cancellation_stops_before_the_widening_query() {
        let index = seeded_index(2, 10);
        let cancel = CancellationFlag::new();
        cancel.cancel();
        let request = SearchRequest { embedding: vec![1.0, 0.0], k: 8, token: agent_token() };
        let hits = must_search(&index, &request, &cancel);

        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|hit| hit.id.starts_with("conv-")));
    }

    #[test]
    fn tokens_without_scope_dimensions_search_unfiltered() {
        let index = seeded_index(2, 2);
        let request = SearchRequest {
            embedding: vec![1.0, 0.0],
            k: 10,
            token: ScopeToken::default(),
        };
        let hits = must_search(&index, &request, &CancellationFlag::new());

        assert_eq!(hits.len(), 4);
    }

    #[derive(Default)]
    struct RecordingIndex {
        inner: InMemoryVectorIndex,
        queries: RefCell<Vec<(SearchFilter, usize)>>,
    }

    impl VectorIndex for RecordingIndex {
        fn upsert(&mut self, document: IndexedDocument) -> Result<()> {
            self.inner.upsert(document)
        }

        fn search(
            &self,
            embedding: &[f32],
            filter: &SearchFilter,
            limit: usize,
        ) -> Result<Vec<SearchHit>> {
            self.queries.borrow_mut().push((filter.clone(), limit));
            self.inner.search(embedding, filter, limit)
        }
    }

    #[test]
    fn widening_issues_a_second_query_for_exactly_the_remaining_quota() {
        let mut index = RecordingIndex::default();
        let diagnostics = ScopeDiagnostics::new();
        for n in 0..3 {
            if let Err(err) = write_document(
                &mut index,
                &diagnostics,
                &format!("conv-{n}"),
                "doc",
                vec![1.0],
                &agent_token(),
            ) {
                panic!("write should succeed: {err}");
            }
        }

        let request = SearchRequest { embedding: vec![1.0], k: 8, token: agent_token() };
        if let Err(err) = scoped_search(&index, &request, &CancellationFlag::new()) {
            panic!("search should succeed: {err}");
        }

        let queries = index.queries.borrow();
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].1, 8);
        assert_eq!(
            queries[0].0,
            SearchFilter::unfiltered()
                .with("scopeSegments.conversation", &conversation_id().to_string())
        );
        assert_eq!(queries[1].1, 5);
        assert_eq!(
            queries[1].0,
            SearchFilter::unfiltered()
                .with(META_SCOPE_PRINCIPAL_TYPE, "agent")
                .with(META_SCOPE_PRINCIPAL_ID, &agent_id().to_string())
        );
    }
}
