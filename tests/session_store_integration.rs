//! Integration coverage of the SQLite-backed `Store` against a real
//! temp-file database, exercising the full session/token/login-state
//! lifecycle rather than the in-process unit tests covering edge cases.

use gafaelfawr::handle::Handle;
use gafaelfawr::store::{LoginState, SessionRecord, Store, TokenIndexEntry};

fn temp_store() -> (Store, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("gafaelfawr.db");
    let store = Store::with_path(&path).expect("open store");
    (store, dir)
}

#[tokio::test]
async fn session_round_trips_and_expires() {
    let (store, _dir) = temp_store();
    let handle = Handle::new();
    let record = SessionRecord::new("signed-token".to_string(), Some("user@example.com".to_string()), 1000, 2000);

    store.store_session(&handle, record.clone(), 1000).await.expect("store session");
    let fetched = store.get_session(&handle).await.expect("get session");
    assert_eq!(fetched, Some(record));

    let removed = store.cleanup_expired_sessions(2500).await.expect("cleanup");
    assert_eq!(removed, 1);
    assert_eq!(store.get_session(&handle).await.expect("get after cleanup"), None);
}

#[tokio::test]
async fn token_index_lists_and_revokes_by_uid() {
    let (store, _dir) = temp_store();
    let handle = Handle::new();
    let record = SessionRecord::new("signed-token".to_string(), None, 1000, 999_999_999);
    let entry = TokenIndexEntry { handle_key: handle.key.clone(), scope: "read:all".to_string(), created: 1000, expires: 999_999_999 };

    store.issue_and_index("someuser", &handle, record, entry).await.expect("issue and index");

    let tokens = store.get_all_tokens("someuser").await.expect("list tokens");
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].handle_key, handle.key);

    let revoked = store.revoke_token("someuser", &handle.key).await.expect("revoke");
    assert!(revoked);
    assert!(store.get_all_tokens("someuser").await.expect("list after revoke").is_empty());
    assert_eq!(store.get_session(&handle).await.expect("session after revoke"), None);
}

#[tokio::test]
async fn login_state_is_single_use() {
    let (store, _dir) = temp_store();
    let state = LoginState { return_url: "/dashboard".to_string(), pkce_verifier: None, created_at: 1000 };

    store.put_login_state("csrf-state", state.clone(), 600, 1000).await.expect("put login state");
    let taken = store.take_login_state("csrf-state", 1100).await.expect("take login state");
    assert_eq!(taken, Some(state));

    let taken_again = store.take_login_state("csrf-state", 1100).await.expect("take again");
    assert_eq!(taken_again, None);
}

#[tokio::test]
async fn store_reports_healthy() {
    let (store, _dir) = temp_store();
    assert!(store.is_healthy().await);
}
