//! Change-request lifecycle: create, decide, and the terminal states.

use filemailer::approval::{ApprovalError, Decision};
use filemailer::error::FailureKind;
use filemailer::store::{ChangeRequest, ChangeStatus};

use crate::support::{register, Fixture, ADMIN_CHAT, ALICE_CHAT, ALICE_TG};

fn applied(decision: Decision) -> ChangeRequest {
    match decision {
        Decision::Applied(request) => request,
        Decision::Ignored => panic!("admin decision must not be ignored"),
    }
}

#[tokio::test]
async fn reject_scenario_keeps_email() {
    let fx = Fixture::new().await;
    // Six earlier requests from another user so this one gets id 7.
    register(&fx.store, 22, "bob", "bob@x.com").await;
    for n in 0..6 {
        fx.service
            .create_request(22, 220, &format!("bob{n}@x.com"))
            .await
            .expect("filler request");
    }

    let request = fx
        .service
        .create_request(ALICE_TG, ALICE_CHAT, "b@x.com")
        .await
        .expect("create");
    assert_eq!(request.id, 7);
    assert_eq!(request.status, ChangeStatus::Pending);
    assert_eq!(request.old_email, "a@x.com");
    assert_eq!(request.new_email, "b@x.com");

    let rejected = applied(fx.service.reject(7, ADMIN_CHAT).await.expect("reject"));
    assert_eq!(rejected.status, ChangeStatus::Rejected);
    assert_eq!(fx.store.get_email(fx.alice).await.expect("email"), "a@x.com");

    let last = fx.notifier.notices().pop().expect("requester notified");
    assert_eq!(last.chat_id, ALICE_CHAT);
    assert!(last.text.contains("rejected"));
}

#[tokio::test]
async fn admin_is_told_how_to_decide() {
    let fx = Fixture::new().await;
    let request = fx
        .service
        .create_request(ALICE_TG, ALICE_CHAT, "b@x.com")
        .await
        .expect("create");

    let notices = fx.notifier.notices();
    assert_eq!(notices.len(), 1);
    let notice = &notices[0];
    assert_eq!(notice.chat_id, ADMIN_CHAT);
    assert_eq!(notice.decide, Some(request.id));
    assert!(notice.text.contains("@alice"));
    assert!(notice.text.contains("a@x.com"));
    assert!(notice.text.contains("b@x.com"));
    assert!(notice.text.contains(&format!("/approve {}", request.id)));
    assert!(notice.text.contains(&format!("/reject {}", request.id)));
}

#[tokio::test]
async fn approve_round_trip() {
    let fx = Fixture::new().await;
    let request = fx
        .service
        .create_request(ALICE_TG, ALICE_CHAT, "b@x.com")
        .await
        .expect("create");

    let approved = applied(
        fx.service
            .approve(request.id, ADMIN_CHAT)
            .await
            .expect("approve"),
    );
    assert_eq!(approved.status, ChangeStatus::Approved);
    assert_eq!(approved.old_email, "a@x.com");
    assert_eq!(approved.new_email, "b@x.com");
    let processed = approved.processed_at.expect("processed timestamp");
    assert!(processed >= approved.created_at);
    assert_eq!(fx.store.get_email(fx.alice).await.expect("email"), "b@x.com");

    let last = fx.notifier.notices().pop().expect("requester notified");
    assert_eq!(last.chat_id, ALICE_CHAT);
    assert!(last.text.contains("b@x.com"));
    assert_eq!(last.decide, None);
}

#[tokio::test]
async fn stale_snapshot_is_kept() {
    let fx = Fixture::new().await;
    let first = fx
        .service
        .create_request(ALICE_TG, ALICE_CHAT, "b@x.com")
        .await
        .expect("create first");
    let second = fx
        .service
        .create_request(ALICE_TG, ALICE_CHAT, "c@x.com")
        .await
        .expect("create second");

    fx.service
        .approve(first.id, ADMIN_CHAT)
        .await
        .expect("approve first");
    let approved = applied(
        fx.service
            .approve(second.id, ADMIN_CHAT)
            .await
            .expect("approve second"),
    );

    assert_eq!(approved.old_email, "a@x.com");
    assert_eq!(approved.new_email, "c@x.com");
    assert_eq!(fx.store.get_email(fx.alice).await.expect("email"), "c@x.com");
}

#[tokio::test]
async fn repeated_decisions_are_already_processed() {
    let fx = Fixture::new().await;
    let request = fx
        .service
        .create_request(ALICE_TG, ALICE_CHAT, "b@x.com")
        .await
        .expect("create");
    let approved = applied(
        fx.service
            .approve(request.id, ADMIN_CHAT)
            .await
            .expect("approve"),
    );
    let notices_before = fx.notifier.notices().len();

    for approve in [true, false, true] {
        let outcome = if approve {
            fx.service.approve(request.id, ADMIN_CHAT).await
        } else {
            fx.service.reject(request.id, ADMIN_CHAT).await
        };
        let err = outcome.expect_err("already decided");
        assert_eq!(err.kind(), FailureKind::AlreadyProcessed);
        assert!(matches!(
            err,
            ApprovalError::AlreadyProcessed {
                status: ChangeStatus::Approved,
                ..
            }
        ));
    }

    let stored = fx
        .store
        .change_request(request.id)
        .await
        .expect("lookup")
        .expect("exists");
    assert_eq!(stored, approved);
    assert_eq!(fx.notifier.notices().len(), notices_before);
}

#[tokio::test]
async fn racing_decisions_apply_once() {
    let fx = Fixture::new().await;
    let request = fx
        .service
        .create_request(ALICE_TG, ALICE_CHAT, "b@x.com")
        .await
        .expect("create");

    let approver = fx.service.clone();
    let rejecter = fx.service.clone();
    let id = request.id;
    let (a, r) = tokio::join!(
        tokio::spawn(async move { approver.approve(id, ADMIN_CHAT).await }),
        tokio::spawn(async move { rejecter.reject(id, ADMIN_CHAT).await }),
    );
    let outcomes = [a.expect("approve task"), r.expect("reject task")];

    let wins = outcomes.iter().filter(|o| o.is_ok()).count();
    assert_eq!(wins, 1);
    let losses: Vec<&ApprovalError> = outcomes.iter().filter_map(|o| o.as_ref().err()).collect();
    assert_eq!(losses.len(), 1);
    assert_eq!(losses[0].kind(), FailureKind::AlreadyProcessed);

    let stored = fx
        .store
        .change_request(id)
        .await
        .expect("lookup")
        .expect("exists");
    let email = fx.store.get_email(fx.alice).await.expect("email");
    match stored.status {
        ChangeStatus::Approved => assert_eq!(email, "b@x.com"),
        ChangeStatus::Rejected => assert_eq!(email, "a@x.com"),
        ChangeStatus::Pending => panic!("request must be decided"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_decisions_on_shared_database_apply_once() {
    let tmp = tempfile::tempdir().expect("temp dir");
    let fx = Fixture::on_disk(&tmp.path().join("race.db")).await;

    for round in 0..20 {
        let request = fx
            .service
            .create_request(ALICE_TG, ALICE_CHAT, &format!("race{round}@x.com"))
            .await
            .expect("create");
        let id = request.id;
        let approver = fx.service.clone();
        let rejecter = fx.service.clone();
        let (a, r) = tokio::join!(
            tokio::spawn(async move { approver.approve(id, ADMIN_CHAT).await }),
            tokio::spawn(async move { rejecter.reject(id, ADMIN_CHAT).await }),
        );
        let outcomes = [a.expect("approve task"), r.expect("reject task")];

        assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1, "round {round}");
        for err in outcomes.iter().filter_map(|o| o.as_ref().err()) {
            assert_eq!(err.kind(), FailureKind::AlreadyProcessed, "round {round}");
        }

        let stored = fx
            .store
            .change_request(id)
            .await
            .expect("lookup")
            .expect("exists");
        let email = fx.store.get_email(fx.alice).await.expect("email");
        match stored.status {
            ChangeStatus::Approved => assert_eq!(email, format!("race{round}@x.com")),
            ChangeStatus::Rejected => assert_ne!(email, format!("race{round}@x.com")),
            ChangeStatus::Pending => panic!("round {round} left the request pending"),
        }
    }

    let pending = fx
        .service
        .list_pending(ADMIN_CHAT)
        .await
        .expect("list")
        .expect("admin sees the list");
    assert!(pending.is_empty());
}

#[tokio::test]
async fn unknown_id_is_not_found() {
    let fx = Fixture::new().await;
    let err = fx
        .service
        .approve(404, ADMIN_CHAT)
        .await
        .expect_err("unknown id");
    assert!(matches!(err, ApprovalError::NotFound(404)));
    assert_eq!(err.kind(), FailureKind::NotFound);

    let err = fx
        .service
        .reject(404, ADMIN_CHAT)
        .await
        .expect_err("unknown id");
    assert!(matches!(err, ApprovalError::NotFound(404)));
}

#[tokio::test]
async fn approving_a_taken_address_keeps_request_pending() {
    let fx = Fixture::new().await;
    register(&fx.store, 22, "bob", "b@x.com").await;
    let request = fx
        .service
        .create_request(ALICE_TG, ALICE_CHAT, "b@x.com")
        .await
        .expect("create");

    let err = fx
        .service
        .approve(request.id, ADMIN_CHAT)
        .await
        .expect_err("address taken");
    assert!(matches!(err, ApprovalError::EmailTaken));
    assert_eq!(err.kind(), FailureKind::Conflict);

    let stored = fx
        .store
        .change_request(request.id)
        .await
        .expect("lookup")
        .expect("exists");
    assert_eq!(stored.status, ChangeStatus::Pending);
    assert_eq!(fx.store.get_email(fx.alice).await.expect("email"), "a@x.com");

    // Still decidable.
    let rejected = applied(
        fx.service
            .reject(request.id, ADMIN_CHAT)
            .await
            .expect("reject"),
    );
    assert_eq!(rejected.status, ChangeStatus::Rejected);
}

#[tokio::test]
async fn unregistered_requester_is_refused() {
    let fx = Fixture::new().await;
    let err = fx
        .service
        .create_request(999, 999, "z@x.com")
        .await
        .expect_err("not registered");
    assert!(matches!(err, ApprovalError::NotRegistered));
    assert!(fx.notifier.notices().is_empty());
}

#[tokio::test]
async fn new_email_is_stored_verbatim() {
    let fx = Fixture::new().await;
    let request = fx
        .service
        .create_request(ALICE_TG, ALICE_CHAT, "not even an address")
        .await
        .expect("create");
    assert_eq!(request.new_email, "not even an address");
}
