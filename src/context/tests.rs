use serde_json::json;

use crate::context::auth_ctx::{with_auth, AuthContext};
use crate::context::memory::SetOptions;
use crate::context::message::MessageQuery;
use crate::context::search::SearchOptions;
use crate::context::types::{Permission, Visibility};
use crate::state::AppState;

fn agent(agent_id: &str, agent_type: &str, perms: Vec<Permission>) -> AuthContext {
    AuthContext {
        agent_id: agent_id.to_string(),
        agent_type: agent_type.to_string(),
        permissions: perms,
        authenticated: true,
        auth_method: Some("jwt".to_string()),
    }
}

fn writer(agent_id: &str) -> AuthContext {
    agent(agent_id, "claude", vec![Permission::Read, Permission::Write])
}

// ─────────────────────────────────────────────────────────
//  END-TO-END SCENARIOS
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn round_trip_message() {
    let (state, _mgr) = AppState::for_tests().await;

    let session = with_auth(writer("a1"), state.sessions.create_session("t", None))
        .await
        .unwrap();

    let message = with_auth(
        writer("a1"),
        state
            .messages
            .add_message(&session.id, "hello", Visibility::Public, None, None),
    )
    .await
    .unwrap();
    assert_eq!(message.id, 1);

    let fetched = with_auth(
        writer("a1"),
        state.messages.get_messages(
            &session.id,
            &MessageQuery {
                limit: Some(10),
                ..Default::default()
            },
        ),
    )
    .await
    .unwrap();
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].content, "hello");
    assert_eq!(fetched[0].visibility, Visibility::Public);
    assert_eq!(fetched[0].sender, "a1");
}

#[tokio::test]
async fn visibility_isolation_between_agents() {
    let (state, _mgr) = AppState::for_tests().await;
    let session = with_auth(writer("a1"), state.sessions.create_session("t", None))
        .await
        .unwrap();

    with_auth(
        writer("a1"),
        state
            .messages
            .add_message(&session.id, "hi all", Visibility::Public, None, None),
    )
    .await
    .unwrap();
    let secret = with_auth(
        writer("a1"),
        state
            .messages
            .add_message(&session.id, "shh", Visibility::Private, None, None),
    )
    .await
    .unwrap();

    let for_a2 = with_auth(
        writer("a2"),
        state.messages.get_messages(&session.id, &MessageQuery::default()),
    )
    .await
    .unwrap();
    assert!(for_a2.iter().all(|m| m.id != secret.id));

    let for_a1 = with_auth(
        writer("a1"),
        state.messages.get_messages(&session.id, &MessageQuery::default()),
    )
    .await
    .unwrap();
    assert!(for_a1.iter().any(|m| m.id == secret.id));
}

#[tokio::test]
async fn memory_ttl_expires_entries() {
    let (state, _mgr) = AppState::for_tests().await;

    with_auth(writer("a1"), async {
        state
            .memory
            .set_memory(
                "k",
                &json!({"x": 1}),
                SetOptions {
                    expires_in: Some(1),
                    overwrite: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    })
    .await;

    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    let err = with_auth(writer("a1"), state.memory.get_memory("k", None))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "MEMORY_NOT_FOUND");
}

#[tokio::test]
async fn fuzzy_search_ranks_and_thresholds() {
    let (state, _mgr) = AppState::for_tests().await;
    let session = with_auth(writer("a1"), state.sessions.create_session("seed", None))
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
            writer("a1"),
            state
                .messages
                .add_message(&session.id, content, Visibility::Public, None, None),
        )
        .await
        .unwrap();
    }

    let results = with_auth(
        writer("a1"),
        state.search.search_context(
            &session.id,
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
    assert_eq!(results[0].message.content, "fuzzy search perf");
    assert!(results[0].score >= 80);
    assert_eq!(results[0].relevance, "high");
    assert!(results.iter().all(|r| r.score >= 60));
}

#[tokio::test]
async fn token_refresh_preserves_identity() {
    let (state, _mgr) = AppState::for_tests().await;
    let session = with_auth(writer("a1"), state.sessions.create_session("t", None))
        .await
        .unwrap();

    // Authenticate and act under the first opaque token.
    let t1 = state
        .tokens
        .authenticate("a1", "claude", "test-api-key", &["read".into(), "write".into()])
        .await
        .unwrap();
    let claims1 = state.tokens.resolve(&t1.token).await.unwrap();
    let identity1 = AuthContext {
        agent_id: claims1.sub.clone(),
        agent_type: claims1.agent_type.clone(),
        permissions: claims1.permissions(),
        authenticated: true,
        auth_method: Some("opaque".to_string()),
    };
    with_auth(identity1, async {
        state
            .memory
            .set_memory(
                "k",
                &json!("v"),
                SetOptions {
                    scope: Some(session.id.clone()),
                    overwrite: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    })
    .await;

    // Refresh, then read back under the second token's identity.
    let t2 = state.tokens.refresh(&t1.token).await.unwrap();
    assert_ne!(t2.token, t1.token);
    let claims2 = state.tokens.resolve(&t2.token).await.unwrap();
    assert_eq!(claims2.sub, "a1");
    assert_eq!(claims2.perms, claims1.perms);

    let identity2 = AuthContext {
        agent_id: claims2.sub.clone(),
        agent_type: claims2.agent_type.clone(),
        permissions: claims2.permissions(),
        authenticated: true,
        auth_method: Some("opaque".to_string()),
    };
    let entry = with_auth(
        identity2,
        state.memory.get_memory("k", Some(&session.id)),
    )
    .await
    .unwrap();
    assert_eq!(entry.value, json!("v"));
}

#[tokio::test]
async fn global_memory_is_still_per_agent() {
    let (state, _mgr) = AppState::for_tests().await;

    with_auth(writer("a1"), async {
        state
            .memory
            .set_memory("shared", &json!(1), SetOptions { overwrite: true, ..Default::default() })
            .await
            .unwrap();
    })
    .await;

    let err = with_auth(writer("a2"), state.memory.get_memory("shared", None))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "MEMORY_NOT_FOUND");
}

// ─────────────────────────────────────────────────────────
//  UNIVERSAL INVARIANTS
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn repeated_reads_are_stable() {
    let (state, _mgr) = AppState::for_tests().await;
    let session = with_auth(writer("a1"), state.sessions.create_session("t", None))
        .await
        .unwrap();
    for content in ["one", "two", "three"] {
        with_auth(
            writer("a1"),
            state
                .messages
                .add_message(&session.id, content, Visibility::Public, None, None),
        )
        .await
        .unwrap();
    }

    let first = with_auth(
        writer("a1"),
        state.messages.get_messages(&session.id, &MessageQuery::default()),
    )
    .await
    .unwrap();
    let second = with_auth(
        writer("a1"),
        state.messages.get_messages(&session.id, &MessageQuery::default()),
    )
    .await
    .unwrap();

    let ids: Vec<i64> = first.iter().map(|m| m.id).collect();
    let ids_again: Vec<i64> = second.iter().map(|m| m.id).collect();
    assert_eq!(ids, ids_again);
    assert!(first.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[tokio::test]
async fn no_leakage_through_search_or_resources() {
    let (state, _mgr) = AppState::for_tests().await;
    let session = with_auth(writer("a1"), state.sessions.create_session("t", None))
        .await
        .unwrap();
    with_auth(
        writer("a1"),
        state
            .messages
            .add_message(&session.id, "private fuzzy data", Visibility::Private, None, None),
    )
    .await
    .unwrap();

    // Search as another agent must not surface it…
    let results = with_auth(
        writer("a2"),
        state
            .search
            .search_context(&session.id, "private fuzzy data", &SearchOptions::default()),
    )
    .await
    .unwrap();
    assert!(results.is_empty());

    // …and neither may the statistics' visible count.
    let stats = with_auth(writer("a2"), state.messages.session_statistics(&session.id))
        .await
        .unwrap();
    assert_eq!(stats["total"], 1);
    assert_eq!(stats["visible"], 0);
}

#[tokio::test]
async fn opaque_indirection_grants_same_permissions() {
    let (state, _mgr) = AppState::for_tests().await;
    let grant = state
        .tokens
        .authenticate("a1", "claude", "test-api-key", &["read".into(), "write".into()])
        .await
        .unwrap();
    let claims = state.tokens.resolve(&grant.token).await.unwrap();
    assert_eq!(claims.permissions(), grant.permissions);
}

#[tokio::test]
async fn memory_returns_latest_write() {
    let (state, _mgr) = AppState::for_tests().await;
    with_auth(writer("a1"), async {
        for n in 1..=3 {
            state
                .memory
                .set_memory("counter", &json!(n), SetOptions { overwrite: true, ..Default::default() })
                .await
                .unwrap();
        }
        let entry = state.memory.get_memory("counter", None).await.unwrap();
        assert_eq!(entry.value, json!(3));
    })
    .await;
}

#[tokio::test]
async fn lock_exclusivity_until_release() {
    let (state, _mgr) = AppState::for_tests().await;
    let session = with_auth(writer("a1"), state.sessions.create_session("t", None))
        .await
        .unwrap();

    with_auth(writer("a1"), async {
        state
            .locks
            .acquire(&session.id, crate::context::locks::LockType::Exclusive)
            .unwrap();
    })
    .await;

    let err = with_auth(writer("a2"), async {
        state
            .locks
            .acquire(&session.id, crate::context::locks::LockType::Write)
    })
    .await
    .unwrap_err();
    assert_eq!(err.code(), "SESSION_LOCKED");

    with_auth(writer("a1"), async { state.locks.release(&session.id).unwrap() }).await;

    with_auth(writer("a2"), async {
        state
            .locks
            .acquire(&session.id, crate::context::locks::LockType::Write)
            .unwrap();
    })
    .await;
}
