//! Change-request persistence and conditional transitions.

use chrono::{Duration, TimeZone, Utc};
use filemailer::store::{ChangeStatus, Registration, Store, StoreError, Transition};
use sqlx::sqlite::SqlitePoolOptions;

async fn store() -> Store {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory pool");
    Store::from_pool(pool).await.expect("schema applies")
}

async fn user(store: &Store, telegram_id: i64, email: &str) -> i64 {
    match store
        .register_telegram_user(telegram_id, "", email)
        .await
        .expect("register")
    {
        Registration::Created { user_id, .. } | Registration::AlreadyRegistered { user_id } => {
            user_id
        }
    }
}

#[tokio::test]
async fn insert_snapshots_current_email() {
    let store = store().await;
    let user_id = user(&store, 1, "a@x.com").await;
    let created = Utc::now();

    let request = store
        .insert_change_request(user_id, 555, "b@x.com", created)
        .await
        .expect("insert");

    assert_eq!(request.user_id, user_id);
    assert_eq!(request.requester_chat_id, 555);
    assert_eq!(request.old_email, "a@x.com");
    assert_eq!(request.new_email, "b@x.com");
    assert_eq!(request.status, ChangeStatus::Pending);
    assert!(request.processed_at.is_none());
    assert_eq!(
        request.created_at.timestamp_micros(),
        created.timestamp_micros()
    );

    let stored = store
        .change_request(request.id)
        .await
        .expect("lookup")
        .expect("exists");
    assert_eq!(stored, request);
}

#[tokio::test]
async fn insert_for_unknown_user_fails() {
    let store = store().await;
    let err = store
        .insert_change_request(99, 1, "b@x.com", Utc::now())
        .await
        .expect_err("no user");
    assert!(matches!(err, StoreError::UserNotFound(99)));
}

#[tokio::test]
async fn reject_is_applied_once() {
    let store = store().await;
    let user_id = user(&store, 1, "a@x.com").await;
    let request = store
        .insert_change_request(user_id, 1, "b@x.com", Utc::now())
        .await
        .expect("insert");

    let first_at = Utc::now();
    let first = store
        .reject_change_request(request.id, first_at)
        .await
        .expect("reject");
    let rejected = match first {
        Transition::Applied(r) => r,
        other => panic!("expected applied, got {other:?}"),
    };
    assert_eq!(rejected.status, ChangeStatus::Rejected);
    assert!(rejected.processed_at.is_some());

    let second = store
        .reject_change_request(request.id, first_at + Duration::seconds(5))
        .await
        .expect("second reject");
    match second {
        Transition::AlreadyProcessed(r) => assert_eq!(r, rejected),
        other => panic!("expected already processed, got {other:?}"),
    }
    assert_eq!(store.get_email(user_id).await.expect("email"), "a@x.com");
}

#[tokio::test]
async fn approve_moves_user_email() {
    let store = store().await;
    let user_id = user(&store, 1, "a@x.com").await;
    let request = store
        .insert_change_request(user_id, 1, "b@x.com", Utc::now())
        .await
        .expect("insert");

    let transition = store
        .approve_change_request(request.id, Utc::now())
        .await
        .expect("approve");
    assert!(matches!(transition, Transition::Applied(ref r) if r.status == ChangeStatus::Approved));
    assert_eq!(store.get_email(user_id).await.expect("email"), "b@x.com");

    let again = store
        .reject_change_request(request.id, Utc::now())
        .await
        .expect("reject after approve");
    assert!(matches!(again, Transition::AlreadyProcessed(ref r) if r.status == ChangeStatus::Approved));
}

#[tokio::test]
async fn approve_to_taken_email_leaves_request_pending() {
    let store = store().await;
    let alice = user(&store, 1, "a@x.com").await;
    user(&store, 2, "b@x.com").await;
    let request = store
        .insert_change_request(alice, 1, "b@x.com", Utc::now())
        .await
        .expect("insert");

    let err = store
        .approve_change_request(request.id, Utc::now())
        .await
        .expect_err("address is taken");
    assert!(matches!(err, StoreError::EmailTaken));

    let stored = store
        .change_request(request.id)
        .await
        .expect("lookup")
        .expect("exists");
    assert_eq!(stored.status, ChangeStatus::Pending);
    assert!(stored.processed_at.is_none());
    assert_eq!(store.get_email(alice).await.expect("email"), "a@x.com");
}

#[tokio::test]
async fn unknown_id_is_not_found() {
    let store = store().await;
    assert_eq!(
        store
            .approve_change_request(404, Utc::now())
            .await
            .expect("query"),
        Transition::NotFound
    );
    assert_eq!(
        store
            .reject_change_request(404, Utc::now())
            .await
            .expect("query"),
        Transition::NotFound
    );
}

#[tokio::test]
async fn pending_listing_is_newest_first() {
    let store = store().await;
    let user_id = user(&store, 1, "a@x.com").await;
    let base = Utc
        .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .expect("valid time");

    let oldest = store
        .insert_change_request(user_id, 1, "1@x.com", base)
        .await
        .expect("insert");
    let tie_a = store
        .insert_change_request(user_id, 1, "2@x.com", base + Duration::hours(1))
        .await
        .expect("insert");
    let tie_b = store
        .insert_change_request(user_id, 1, "3@x.com", base + Duration::hours(1))
        .await
        .expect("insert");
    let decided = store
        .insert_change_request(user_id, 1, "4@x.com", base + Duration::hours(2))
        .await
        .expect("insert");
    store
        .reject_change_request(decided.id, Utc::now())
        .await
        .expect("reject");

    let ids: Vec<i64> = store
        .pending_change_requests()
        .await
        .expect("list")
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec![tie_b.id, tie_a.id, oldest.id]);
}
