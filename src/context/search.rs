use serde_json::json;
use strsim::{jaro_winkler, normalized_levenshtein};

use crate::context::audit::AuditLog;
use crate::context::auth_ctx;
use crate::context::message::visibility_clause;
use crate::context::types::{now_ts, ContextError, Message};
use crate::context::validate;
use crate::db::Store;

/// Which slice of the visibility space a search covers. `All` is everything
/// the caller may see; the narrower scopes further restrict that set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchScope {
    #[default]
    All,
    Public,
    Private,
}

#[derive(Debug, serde::Deserialize)]
pub struct SearchOptions {
    pub fuzzy_threshold: Option<u8>,
    pub limit: Option<usize>,
    pub search_metadata: Option<bool>,
    pub search_scope: Option<SearchScope>,
    pub recency_window_hours: Option<f64>,
    pub max_rows_scanned: Option<i64>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            fuzzy_threshold: None,
            limit: None,
            search_metadata: None,
            search_scope: None,
            recency_window_hours: None,
            max_rows_scanned: None,
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct SearchResult {
    pub message: Message,
    pub score: u8,
    pub match_preview: String,
    pub relevance: &'static str,
}

/// Token-aware weighted-ratio similarity in [0, 100].
///
/// The score is the best of: whole-string edit similarity, token-sorted
/// similarity, and a symmetric best-token-alignment mean (each token matched
/// to its closest counterpart, weighted by length). Symmetric up to
/// tokenization; 100 means equal token multisets.
pub fn weighted_ratio(a: &str, b: &str) -> u8 {
    if a.is_empty() || b.is_empty() {
        return 0;
    }

    let full = normalized_levenshtein(a, b);

    let mut a_tokens: Vec<&str> = a.split_whitespace().collect();
    let mut b_tokens: Vec<&str> = b.split_whitespace().collect();
    if a_tokens.is_empty() || b_tokens.is_empty() {
        return (full * 100.0).round() as u8;
    }
    a_tokens.sort_unstable();
    b_tokens.sort_unstable();
    let sorted = normalized_levenshtein(&a_tokens.join(" "), &b_tokens.join(" "));

    let aligned = (token_alignment(&a_tokens, &b_tokens) + token_alignment(&b_tokens, &a_tokens)) / 2.0;

    let best = full.max(sorted).max(aligned);
    (best * 100.0).round().clamp(0.0, 100.0) as u8
}

/// Mean similarity of each `from` token to its best match in `to`,
/// weighted by token length so long informative tokens dominate.
fn token_alignment(from: &[&str], to: &[&str]) -> f64 {
    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    for token in from {
        let best = to
            .iter()
            .map(|candidate| jaro_winkler(token, candidate))
            .fold(0.0_f64, f64::max);
        let weight = token.len() as f64;
        weighted_sum += best * weight;
        weight_total += weight;
    }
    if weight_total == 0.0 {
        0.0
    } else {
        weighted_sum / weight_total
    }
}

fn relevance_label(score: u8) -> &'static str {
    match score {
        80..=100 => "high",
        60..=79 => "medium",
        _ => "low",
    }
}

fn preview(content: &str) -> String {
    let mut out: String = content.chars().take(150).collect();
    if content.chars().count() > 150 {
        out.push_str("...");
    }
    out
}

/// Fuzzy search over session messages: a visibility-aware SQL pre-filter
/// bounds the candidate set, then candidates are ranked in memory.
#[derive(Clone)]
pub struct SearchEngine {
    store: Store,
    audit: AuditLog,
    default_recency_hours: f64,
    default_max_rows: i64,
}

impl SearchEngine {
    pub fn new(
        store: Store,
        audit: AuditLog,
        default_recency_hours: f64,
        default_max_rows: i64,
    ) -> Self {
        Self {
            store,
            audit,
            default_recency_hours,
            default_max_rows,
        }
    }

    async fn candidates(
        &self,
        session_id: &str,
        scope: SearchScope,
        recency_hours: f64,
        max_rows: i64,
    ) -> Result<Vec<Message>, ContextError> {
        let caller = auth_ctx::current();
        let (clause, mut params) = visibility_clause(&caller);

        let mut sql = format!(
            "SELECT * FROM messages WHERE session_id = :session_id AND timestamp >= :cutoff AND {clause}"
        );
        params.push(("session_id", json!(session_id)));
        params.push(("cutoff", json!(now_ts() - recency_hours * 3600.0)));

        match scope {
            SearchScope::All => {}
            SearchScope::Public => {
                sql.push_str(" AND visibility = 'public'");
            }
            SearchScope::Private => {
                sql.push_str(" AND visibility = 'private' AND sender = :scope_sender");
                params.push(("scope_sender", json!(caller.agent_id)));
            }
        }

        sql.push_str(" ORDER BY timestamp DESC LIMIT :max_rows");
        params.push(("max_rows", json!(max_rows)));

        let rows = self.store.query(&sql, &params).await?;
        Ok(rows.iter().map(Message::from_row).collect())
    }

    pub async fn search_context(
        &self,
        session_id: &str,
        query: &str,
        opts: &SearchOptions,
    ) -> Result<Vec<SearchResult>, ContextError> {
        validate::validate_session_id(session_id)?;
        if query.trim().is_empty() {
            return Err(ContextError::Validation(
                "Search query must not be empty".to_string(),
            ));
        }
        let threshold = opts.fuzzy_threshold.unwrap_or(60).min(100);
        let limit = opts.limit.unwrap_or(10).clamp(1, 100);
        let search_metadata = opts.search_metadata.unwrap_or(true);
        let scope = opts.search_scope.unwrap_or_default();
        let recency_hours = opts
            .recency_window_hours
            .unwrap_or(self.default_recency_hours)
            .max(0.0);
        let max_rows = opts
            .max_rows_scanned
            .unwrap_or(self.default_max_rows)
            .clamp(1, 10_000);

        let candidates = self
            .candidates(session_id, scope, recency_hours, max_rows)
            .await?;

        let needle = query.to_lowercase();
        let mut scored: Vec<SearchResult> = Vec::new();
        let mut haystack = String::new();
        for message in candidates {
            // One reused buffer for the searchable string keeps the scan loop
            // at a single allocation per row (the lowercase pass).
            haystack.clear();
            haystack.push_str(&message.sender);
            haystack.push(' ');
            haystack.push_str(&message.content);
            if search_metadata {
                if let Some(serde_json::Value::Object(map)) = &message.metadata {
                    for value in map.values() {
                        if let serde_json::Value::String(s) = value {
                            haystack.push(' ');
                            haystack.push_str(s);
                        }
                    }
                }
            }
            let lowered = haystack.to_lowercase();

            let score = weighted_ratio(&needle, &lowered);
            if score >= threshold {
                scored.push(SearchResult {
                    match_preview: preview(&message.content),
                    relevance: relevance_label(score),
                    score,
                    message,
                });
            }
        }

        scored.sort_by(|a, b| b.score.cmp(&a.score).then(b.message.timestamp.total_cmp(&a.message.timestamp)));
        scored.truncate(limit);

        let caller = auth_ctx::current();
        self.audit.record(
            "context_searched",
            &caller.agent_id,
            Some(session_id),
            Some(json!({
                "query": query,
                "results": scored.len(),
                "threshold": threshold,
                "scope": format!("{scope:?}").to_lowercase(),
            })),
        );

        Ok(scored)
    }

    /// Exact-sender retrieval, visibility-aware, newest first.
    pub async fn search_by_sender(
        &self,
        session_id: &str,
        sender: &str,
        limit: Option<i64>,
    ) -> Result<Vec<Message>, ContextError> {
        validate::validate_session_id(session_id)?;
        validate::validate_agent_id(sender)?;
        let caller = auth_ctx::current();
        let (clause, mut params) = visibility_clause(&caller);

        let sql = format!(
            "SELECT * FROM messages
             WHERE session_id = :session_id AND sender = :sender AND {clause}
             ORDER BY timestamp DESC, id DESC LIMIT :limit"
        );
        params.push(("session_id", json!(session_id)));
        params.push(("sender", json!(sender)));
        params.push(("limit", json!(limit.unwrap_or(100).clamp(1, 1000))));

        let rows = self.store.query(&sql, &params).await?;
        Ok(rows.iter().map(Message::from_row).collect())
    }

    /// Messages within `[start_ts, end_ts]`, visibility-aware, oldest first.
    pub async fn search_by_timerange(
        &self,
        session_id: &str,
        start_ts: f64,
        end_ts: f64,
        limit: Option<i64>,
    ) -> Result<Vec<Message>, ContextError> {
        validate::validate_session_id(session_id)?;
        if end_ts < start_ts {
            return Err(ContextError::Validation(
                "end_ts must not precede start_ts".to_string(),
            ));
        }
        let caller = auth_ctx::current();
        let (clause, mut params) = visibility_clause(&caller);

        let sql = format!(
            "SELECT * FROM messages
             WHERE session_id = :session_id AND timestamp >= :start_ts AND timestamp <= :end_ts AND {clause}
             ORDER BY timestamp ASC, id ASC LIMIT :limit"
        );
        params.push(("session_id", json!(session_id)));
        params.push(("start_ts", json!(start_ts)));
        params.push(("end_ts", json!(end_ts)));
        params.push(("limit", json!(limit.unwrap_or(100).clamp(1, 1000))));

        let rows = self.store.query(&sql, &params).await?;
        Ok(rows.iter().map(Message::from_row).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::audit::AuditLog;
    use crate::context::auth_ctx::{with_auth, AuthContext};
    use crate::context::message::MessageLog;
    use crate::context::notify::NotificationHub;
    use crate::context::session::SessionRegistry;
    use crate::context::types::{Permission, Visibility};

    fn agent(agent_id: &str) -> AuthContext {
        AuthContext {
            agent_id: agent_id.to_string(),
            agent_type: "claude".to_string(),
            permissions: vec![Permission::Read, Permission::Write],
            authenticated: true,
            auth_method: Some("jwt".to_string()),
        }
    }

    #[test]
    fn identical_strings_score_100() {
        assert_eq!(weighted_ratio("fuzzy search", "fuzzy search"), 100);
    }

    #[test]
    fn token_order_does_not_matter() {
        let a = weighted_ratio("search fuzzy", "fuzzy search");
        assert_eq!(a, 100);
    }

    #[test]
    fn unrelated_strings_score_low() {
        assert!(weighted_ratio("fuzzy search performance", "the quick brown fox") < 60);
    }

    #[test]
    fn empty_inputs_score_zero() {
        assert_eq!(weighted_ratio("", "anything"), 0);
        assert_eq!(weighted_ratio("anything", ""), 0);
    }

    #[test]
    fn symmetric_modulo_tokenization() {
        let ab = weighted_ratio("agent memory ttl", "memory ttl sweep");
        let ba = weighted_ratio("memory ttl sweep", "agent memory ttl");
        assert_eq!(ab, ba);
    }

    #[test]
    fn preview_truncates_at_150() {
        let long = "y".repeat(400);
        let p = preview(&long);
        assert_eq!(p.chars().count(), 153);
        assert!(p.ends_with("..."));
        assert_eq!(preview("short"), "short");
    }

    async fn seeded_fixture() -> (SearchEngine, MessageLog, String) {
        let store = crate::db::Store::connect_memory().await.unwrap();
        let (audit, _rx) = AuditLog::new(store.clone());
        let sessions = SessionRegistry::new(store.clone(), audit.clone());
        let hub = NotificationHub::new();
        let log = MessageLog::new(store.clone(), sessions.clone(), audit.clone(), hub);
        let engine = SearchEngine::new(store, audit, 24.0, 1000);

        let session = with_auth(agent("a1"), sessions.create_session("seed", None))
            .await
            .unwrap();
        for content in [
            "the quick brown fox",
            "python async await",
            "FastMCP server",
            "agent memory TTL",
            "fuzzy search perf",
        ] {
            with_auth(
                agent("a1"),
                log.add_message(&session.id, content, Visibility::Public, None, None),
            )
            .await
            .unwrap();
        }
        (engine, log, session.id)
    }

    #[tokio::test]
    async fn fuzzy_search_ranks_the_right_message_first() {
        let (engine, _log, sid) = seeded_fixture().await;
        let results = with_auth(
            agent("a1"),
            engine.search_context(
                &sid,
                "fuzzy search performance",
                &SearchOptions {
                    fuzzy_threshold: Some(60),
                    limit: Some(5),
                    ..Default::default()
                },
            ),
        )
        .await
        .unwrap();

        assert!(!results.is_empty());
        let top = &results[0];
        assert_eq!(top.message.content, "fuzzy search perf");
        assert!(top.score >= 80, "expected high score, got {}", top.score);
        assert_eq!(top.relevance, "high");
        assert!(results.iter().all(|r| r.score >= 60));
    }

    #[tokio::test]
    async fn search_respects_visibility() {
        let (engine, log, sid) = seeded_fixture().await;
        with_auth(
            agent("a2"),
            log.add_message(&sid, "fuzzy search secret notes", Visibility::Private, None, None),
        )
        .await
        .unwrap();

        let as_a1 = with_auth(
            agent("a1"),
            engine.search_context(&sid, "fuzzy search secret notes", &SearchOptions::default()),
        )
        .await
        .unwrap();
        assert!(as_a1.iter().all(|r| r.message.sender != "a2"));

        let as_a2 = with_auth(
            agent("a2"),
            engine.search_context(&sid, "fuzzy search secret notes", &SearchOptions::default()),
        )
        .await
        .unwrap();
        assert!(as_a2.iter().any(|r| r.message.content == "fuzzy search secret notes"));
    }

    #[tokio::test]
    async fn scope_public_excludes_own_private() {
        let (engine, log, sid) = seeded_fixture().await;
        with_auth(
            agent("a1"),
            log.add_message(&sid, "fuzzy search private copy", Visibility::Private, None, None),
        )
        .await
        .unwrap();

        let results = with_auth(
            agent("a1"),
            engine.search_context(
                &sid,
                "fuzzy search",
                &SearchOptions {
                    search_scope: Some(SearchScope::Public),
                    fuzzy_threshold: Some(50),
                    ..Default::default()
                },
            ),
        )
        .await
        .unwrap();
        assert!(results.iter().all(|r| r.message.visibility == Visibility::Public));
    }

    #[tokio::test]
    async fn search_by_sender_filters() {
        let (engine, log, sid) = seeded_fixture().await;
        with_auth(
            agent("a2"),
            log.add_message(&sid, "from the other agent", Visibility::Public, None, None),
        )
        .await
        .unwrap();

        let results = with_auth(agent("a1"), engine.search_by_sender(&sid, "a2", None))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].sender, "a2");
    }

    #[tokio::test]
    async fn search_by_timerange_bounds() {
        let (engine, _log, sid) = seeded_fixture().await;
        let now = now_ts();
        let all = with_auth(
            agent("a1"),
            engine.search_by_timerange(&sid, now - 3600.0, now + 1.0, None),
        )
        .await
        .unwrap();
        assert_eq!(all.len(), 5);

        let none = with_auth(
            agent("a1"),
            engine.search_by_timerange(&sid, now - 7200.0, now - 3600.0, None),
        )
        .await
        .unwrap();
        assert!(none.is_empty());

        let err = with_auth(
            agent("a1"),
            engine.search_by_timerange(&sid, now, now - 10.0, None),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}
