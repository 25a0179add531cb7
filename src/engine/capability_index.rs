// Lucy Engine — Capability Index & Tool Retriever
//
// The "librarian" pattern: instead of dumping every integration tool schema
// into each LLM request, every workspace owns a BM25 index over its tool
// schemas. Each turn we score the user query against the index and bind only
// the top-K matching tools.
//
// Two-phase process:
//   Phase A — population (on integration connect, or when stale): fetch
//   tool schemas for all connected apps from the meta-broker and index them
//   with their app_slug.
//   Phase B — selection (every request, < 1 ms): BM25-score every indexed
//   tool against the query, return top-K schemas with scores.
//
// The retriever is a latency optimization: when the index is too small or
// the top score is weak, the agent falls back to the broker's SEARCH_TOOLS
// meta-tool instead of binding stale guesses.

use crate::atoms::constants::{INITIAL_K, MIN_INDEXED_TOOLS};
use crate::atoms::error::EngineResult;
use crate::atoms::types::ToolDefinition;
use async_trait::async_trait;
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

// ── BM25 parameters ────────────────────────────────────────────────────────

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

// ── Records ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct ToolRecord {
    app_slug: String,
    definition: ToolDefinition,
    tokens: Vec<String>,
    use_count: u64,
}

#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub tools: Vec<ToolDefinition>,
    pub top_score: f64,
}

/// Per-workspace BM25 index over tool schemas.
pub struct CapabilityIndex {
    records: Vec<ToolRecord>,
    stale: bool,
}

impl Default for CapabilityIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl CapabilityIndex {
    pub fn new() -> Self {
        CapabilityIndex {
            records: Vec::new(),
            stale: true,
        }
    }

    pub fn size(&self) -> usize {
        self.records.len()
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    /// Index tool schemas under an app slug. Deduplicates on
    /// (app_slug, tool_name); returns the number of newly added records.
    pub fn add_tools(&mut self, schemas: &[ToolDefinition], app_slug: &str) -> usize {
        let existing: HashSet<(String, String)> = self
            .records
            .iter()
            .map(|r| (r.app_slug.clone(), r.definition.name().to_string()))
            .collect();

        let mut added = 0;
        for schema in schemas {
            let key = (app_slug.to_string(), schema.name().to_string());
            if existing.contains(&key) {
                continue;
            }
            self.records.push(ToolRecord {
                app_slug: app_slug.to_string(),
                definition: schema.clone(),
                tokens: tokenize_schema(schema),
                use_count: 0,
            });
            added += 1;
        }
        if added > 0 {
            self.stale = false;
        }
        added
    }

    /// Increment the usage counter for a tool. Used as a ranking tiebreaker.
    pub fn record_usage(&mut self, tool_name: &str) {
        for record in &mut self.records {
            if record.definition.name() == tool_name {
                record.use_count += 1;
            }
        }
    }

    /// BM25-score the query against all records, optionally restricted to
    /// connected apps, and return the top-K schemas with the best score.
    pub fn retrieve(
        &self,
        query: &str,
        k: usize,
        connected_apps: Option<&HashSet<String>>,
    ) -> RetrievalResult {
        let candidates: Vec<&ToolRecord> = self
            .records
            .iter()
            .filter(|r| {
                connected_apps
                    .map(|apps| apps.contains(&r.app_slug))
                    .unwrap_or(true)
            })
            .collect();

        if candidates.is_empty() {
            return RetrievalResult { tools: Vec::new(), top_score: 0.0 };
        }

        let query_terms = tokenize(query);
        let n = candidates.len() as f64;
        let avgdl =
            candidates.iter().map(|r| r.tokens.len()).sum::<usize>() as f64 / n;

        // Document frequency per query term across the candidate set.
        let mut df: HashMap<&str, usize> = HashMap::new();
        for term in &query_terms {
            let count = candidates
                .iter()
                .filter(|r| r.tokens.iter().any(|t| t == term))
                .count();
            df.insert(term.as_str(), count);
        }

        let mut scored: Vec<(f64, u64, &ToolRecord)> = candidates
            .iter()
            .map(|record| {
                let dl = record.tokens.len() as f64;
                let mut score = 0.0;
                for term in &query_terms {
                    let tf = record.tokens.iter().filter(|t| *t == term).count() as f64;
                    if tf == 0.0 {
                        continue;
                    }
                    let dfi = df[term.as_str()] as f64;
                    let idf = ((n - dfi + 0.5) / (dfi + 0.5) + 1.0).ln();
                    let denom = tf + BM25_K1 * (1.0 - BM25_B + BM25_B * dl / avgdl.max(1.0));
                    score += idf * tf * (BM25_K1 + 1.0) / denom;
                }
                (score, record.use_count, *record)
            })
            .collect();

        // Highest score first; equal scores broken by historical usage.
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.1.cmp(&a.1))
        });

        let top_score = scored.first().map(|(s, _, _)| *s).unwrap_or(0.0);
        let tools = scored
            .into_iter()
            .take(k)
            .filter(|(score, _, _)| *score > 0.0)
            .map(|(_, _, r)| r.definition.clone())
            .collect();

        RetrievalResult { tools, top_score }
    }
}

// ── Tokenization ───────────────────────────────────────────────────────────

/// Lowercase word tokens from free text or identifiers. Snake_case and
/// punctuation both split.
fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| t.to_lowercase())
        .collect()
}

/// Tokens for a schema: name + description + parameter property names.
fn tokenize_schema(schema: &ToolDefinition) -> Vec<String> {
    let mut tokens = tokenize(schema.name());
    tokens.extend(tokenize(&schema.function.description));
    if let Some(props) = schema.function.parameters.get("properties").and_then(|p| p.as_object()) {
        for key in props.keys() {
            tokens.extend(tokenize(key));
        }
    }
    tokens
}

// ── Per-workspace registry ─────────────────────────────────────────────────

/// Holds one CapabilityIndex per workspace. Lookup creates lazily.
pub struct IndexRegistry {
    indexes: Mutex<HashMap<String, Arc<Mutex<CapabilityIndex>>>>,
}

impl Default for IndexRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexRegistry {
    pub fn new() -> Self {
        IndexRegistry {
            indexes: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, workspace_id: &str) -> Arc<Mutex<CapabilityIndex>> {
        let mut map = self.indexes.lock();
        map.entry(workspace_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CapabilityIndex::new())))
            .clone()
    }

    /// Drop the index for a workspace (forces a re-population).
    pub fn invalidate(&self, workspace_id: &str) {
        self.indexes.lock().remove(workspace_id);
    }
}

// ── Retriever ──────────────────────────────────────────────────────────────

/// Source of tool schemas during index population. Implemented by the
/// meta-broker client; swapped for a stub in tests.
#[async_trait]
pub trait ToolSchemaSource: Send + Sync {
    /// Fetch `(app_slug, schemas)` pairs for a set of connected apps.
    async fn fetch_app_tool_schemas(
        &self,
        workspace_id: &str,
        apps: &[String],
    ) -> EngineResult<Vec<(String, Vec<ToolDefinition>)>>;
}

/// Retrieves the K most relevant tool schemas for a user query.
pub struct TopKRetriever {
    registry: Arc<IndexRegistry>,
    source: Arc<dyn ToolSchemaSource>,
    populate_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TopKRetriever {
    pub fn new(registry: Arc<IndexRegistry>, source: Arc<dyn ToolSchemaSource>) -> Self {
        TopKRetriever {
            registry,
            source,
            populate_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Return top-K tool schemas with scores, or None if the index is not
    /// ready — the caller must fall back to meta-broker discovery.
    pub async fn retrieve(
        &self,
        workspace_id: &str,
        query: &str,
        connected_apps: Option<&HashSet<String>>,
        k: Option<usize>,
    ) -> EngineResult<Option<RetrievalResult>> {
        let index = self.registry.get(workspace_id);

        let needs_population = {
            let guard = index.lock();
            guard.is_stale() || guard.size() < MIN_INDEXED_TOOLS
        };
        if needs_population {
            let apps: Vec<String> = connected_apps
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default();
            self.populate(workspace_id, &apps).await?;
        }

        let guard = index.lock();
        if guard.size() < MIN_INDEXED_TOOLS {
            info!(
                "[retriever] Index too small for {} ({} < {}), falling back to broker discovery",
                workspace_id,
                guard.size(),
                MIN_INDEXED_TOOLS
            );
            return Ok(None);
        }

        let result = guard.retrieve(query, k.unwrap_or(INITIAL_K), connected_apps);
        info!(
            "[retriever] Top-{} for {}: {} tools, top_score={:.2}",
            k.unwrap_or(INITIAL_K),
            workspace_id,
            result.tools.len(),
            result.top_score
        );
        Ok(Some(result))
    }

    /// Increment a tool's usage counter after successful execution.
    pub fn record_tool_usage(&self, workspace_id: &str, tool_name: &str) {
        self.registry.get(workspace_id).lock().record_usage(tool_name);
    }

    /// Fetch schemas from the broker and index them. A per-workspace lock
    /// prevents duplicate fetches: a caller that finds the lock held returns
    /// zero additions and proceeds without re-fetching.
    pub async fn populate(&self, workspace_id: &str, apps: &[String]) -> EngineResult<usize> {
        if apps.is_empty() {
            return Ok(0);
        }

        let lock = {
            let mut locks = self.populate_locks.lock();
            locks
                .entry(workspace_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };

        let Ok(_guard) = lock.try_lock() else {
            return Ok(0);
        };

        let pairs = match self.source.fetch_app_tool_schemas(workspace_id, apps).await {
            Ok(pairs) => pairs,
            Err(e) => {
                warn!("[retriever] Population failed for {}: {}", workspace_id, e);
                return Ok(0);
            }
        };

        let index = self.registry.get(workspace_id);
        let mut guard = index.lock();
        let mut total_added = 0;
        for (app_slug, schemas) in &pairs {
            total_added += guard.add_tools(schemas, app_slug);
        }
        if total_added > 0 {
            info!(
                "[retriever] Indexed {} new tools for {} (total {})",
                total_added,
                workspace_id,
                guard.size()
            );
        }
        Ok(total_added)
    }

    pub fn invalidate(&self, workspace_id: &str) {
        self.registry.invalidate(workspace_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str, description: &str) -> ToolDefinition {
        ToolDefinition::function(
            name,
            description,
            json!({"type": "object", "properties": {"query": {"type": "string"}}}),
        )
    }

    fn seeded_index() -> CapabilityIndex {
        let mut index = CapabilityIndex::new();
        index.add_tools(
            &[
                tool("GOOGLECALENDAR_EVENTS_LIST", "List calendar events in a time range"),
                tool("GOOGLECALENDAR_EVENT_CREATE", "Create a calendar event"),
                tool("GMAIL_SEND_EMAIL", "Send an email message"),
                tool("GMAIL_FETCH_EMAILS", "Fetch recent email messages"),
            ],
            "googlecalendar",
        );
        index.add_tools(
            &[tool("GITHUB_LIST_ISSUES", "List issues in a repository")],
            "github",
        );
        index
    }

    #[test]
    fn test_bm25_ranks_relevant_first() {
        let index = seeded_index();
        let result = index.retrieve("what calendar events do I have today", 3, None);
        assert!(result.top_score > 0.0);
        assert!(result.tools[0].name().starts_with("GOOGLECALENDAR"));
    }

    #[test]
    fn test_dedup_per_app_and_tool() {
        let mut index = seeded_index();
        let before = index.size();
        let added = index.add_tools(
            &[tool("GMAIL_SEND_EMAIL", "Send an email message")],
            "googlecalendar",
        );
        assert_eq!(added, 0);
        assert_eq!(index.size(), before);
    }

    #[test]
    fn test_app_filter() {
        let index = seeded_index();
        let apps: HashSet<String> = ["github".to_string()].into_iter().collect();
        let result = index.retrieve("list issues", 5, Some(&apps));
        assert!(result
            .tools
            .iter()
            .all(|t| t.name().starts_with("GITHUB")));
    }

    #[test]
    fn test_usage_counter_breaks_ties() {
        let mut index = CapabilityIndex::new();
        index.add_tools(
            &[
                tool("LINEAR_ISSUE_CREATE", "Create an issue"),
                tool("JIRA_ISSUE_CREATE", "Create an issue"),
            ],
            "tracking",
        );
        index.record_usage("JIRA_ISSUE_CREATE");
        let result = index.retrieve("create issue", 2, None);
        assert_eq!(result.tools[0].name(), "JIRA_ISSUE_CREATE");
    }

    struct StubSource {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ToolSchemaSource for StubSource {
        async fn fetch_app_tool_schemas(
            &self,
            _workspace_id: &str,
            apps: &[String],
        ) -> EngineResult<Vec<(String, Vec<ToolDefinition>)>> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(apps
                .iter()
                .map(|app| {
                    (
                        app.clone(),
                        (0..6)
                            .map(|i| tool(&format!("{}_TOOL_{}", app.to_uppercase(), i), "does things"))
                            .collect(),
                    )
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_retriever_populates_then_retrieves() {
        let registry = Arc::new(IndexRegistry::new());
        let source = Arc::new(StubSource { calls: Default::default() });
        let retriever = TopKRetriever::new(registry, source.clone());

        let apps: HashSet<String> = ["linear".to_string()].into_iter().collect();
        let result = retriever
            .retrieve("W1", "linear tool 3", Some(&apps), None)
            .await
            .unwrap();
        assert!(result.is_some());
        assert_eq!(source.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retriever_none_when_index_too_small() {
        let registry = Arc::new(IndexRegistry::new());
        let source = Arc::new(StubSource { calls: Default::default() });
        let retriever = TopKRetriever::new(registry, source);

        // No connected apps — population is a no-op, index stays empty.
        let result = retriever.retrieve("W1", "anything", None, None).await.unwrap();
        assert!(result.is_none());
    }
}
