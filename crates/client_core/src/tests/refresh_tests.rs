use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use tokio::sync::broadcast::error::TryRecvError;

use crate::{
    credentials::{Credential, CredentialStore},
    error::RefreshError,
    refresh::{RefreshCoordinator, SessionSignal, TerminationReason},
    test_support::{coordinator, seeded_store, wait_until, FakeAuthApi},
};

fn stale() -> Credential {
    Credential::new("access-1", "refresh-1")
}

#[tokio::test]
async fn concurrent_callers_share_a_single_exchange() {
    let auth = FakeAuthApi::slow(Duration::from_millis(50));
    let store = seeded_store("access-1");
    let coordinator = coordinator(Arc::clone(&store), Arc::clone(&auth));
    let mut signals = coordinator.subscribe();

    let failed = stale();
    let outcomes = join_all((0..5).map(|_| coordinator.ensure_fresh(&failed))).await;

    assert_eq!(auth.refresh_calls(), 1);
    for outcome in outcomes {
        assert_eq!(outcome.expect("refreshed").access_token, "access-2");
    }
    assert_eq!(store.access_token().as_deref(), Some("access-2"));
    assert_eq!(
        store.get().expect("credential").refresh_token,
        "refresh-2"
    );
    assert_eq!(signals.try_recv(), Ok(SessionSignal::CredentialRotated));
    assert_eq!(signals.try_recv(), Err(TryRecvError::Empty));
    assert!(!coordinator.is_refreshing());
}

#[tokio::test]
async fn superseded_credential_is_answered_without_exchange() {
    let auth = FakeAuthApi::new();
    let store = seeded_store("access-7");
    let coordinator = coordinator(Arc::clone(&store), Arc::clone(&auth));

    let fresh = coordinator.ensure_fresh(&stale()).await.expect("current");
    assert_eq!(fresh.access_token, "access-7");
    assert_eq!(auth.refresh_calls(), 0);
}

#[tokio::test]
async fn sequential_expiries_each_refresh_once() {
    let auth = FakeAuthApi::new();
    let store = seeded_store("access-1");
    let coordinator = coordinator(Arc::clone(&store), Arc::clone(&auth));

    let second = coordinator.ensure_fresh(&stale()).await.expect("first refresh");
    let third = coordinator.ensure_fresh(&second).await.expect("second refresh");

    assert_eq!(third.access_token, "access-3");
    assert_eq!(auth.refresh_calls(), 2);
}

#[tokio::test]
async fn failed_exchange_rejects_every_caller_and_clears_store() {
    let auth = FakeAuthApi::rejecting(401, Duration::from_millis(30));
    let store = seeded_store("access-1");
    let coordinator = coordinator(Arc::clone(&store), Arc::clone(&auth));
    let mut signals = coordinator.subscribe();

    let failed = stale();
    let outcomes = join_all((0..4).map(|_| coordinator.ensure_fresh(&failed))).await;

    assert_eq!(auth.refresh_calls(), 1);
    for outcome in outcomes {
        assert_eq!(outcome, Err(RefreshError::Rejected { status: 401 }));
    }
    assert!(store.is_empty());
    assert_eq!(
        signals.try_recv(),
        Ok(SessionSignal::SessionTerminated(TerminationReason::RefreshFailed(
            RefreshError::Rejected { status: 401 }
        )))
    );
}

#[tokio::test]
async fn exchange_that_outlives_the_timeout_fails() {
    let auth = FakeAuthApi::slow(Duration::from_millis(500));
    let store = seeded_store("access-1");
    let coordinator = RefreshCoordinator::new(
        Arc::clone(&store),
        auth,
        Duration::from_millis(20),
    );

    let outcome = coordinator.ensure_fresh(&stale()).await;
    assert_eq!(outcome, Err(RefreshError::Timeout(Duration::from_millis(20))));
    assert!(store.is_empty());
}

#[tokio::test]
async fn empty_store_reports_missing_credential() {
    let coordinator = RefreshCoordinator::new(
        Arc::new(CredentialStore::in_memory()),
        FakeAuthApi::new(),
        Duration::from_secs(1),
    );
    assert_eq!(
        coordinator.ensure_fresh(&stale()).await,
        Err(RefreshError::NoCredential)
    );
}

#[tokio::test]
async fn logout_cancels_parked_callers_and_discards_late_result() {
    let auth = FakeAuthApi::slow(Duration::from_millis(100));
    let store = seeded_store("access-1");
    let coordinator = coordinator(Arc::clone(&store), Arc::clone(&auth));
    let mut signals = coordinator.subscribe();

    let leader = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.ensure_fresh(&stale()).await }
    });
    wait_until("leader in flight", || coordinator.is_refreshing()).await;

    let followers: Vec<_> = (0..2)
        .map(|_| {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.ensure_fresh(&stale()).await })
        })
        .collect();
    wait_until("followers parked", || coordinator.pending_calls() == 3).await;

    coordinator.terminate(TerminationReason::Logout);

    for follower in followers {
        assert_eq!(follower.await.expect("join"), Err(RefreshError::Cancelled));
    }
    assert_eq!(leader.await.expect("join"), Err(RefreshError::Cancelled));
    assert!(store.is_empty());
    assert_eq!(auth.refresh_calls(), 1);
    assert_eq!(
        signals.try_recv(),
        Ok(SessionSignal::SessionTerminated(TerminationReason::Logout))
    );
    assert_eq!(signals.try_recv(), Err(TryRecvError::Empty));
}

#[tokio::test]
async fn abandoned_leader_does_not_strand_later_callers() {
    let auth = FakeAuthApi::slow(Duration::from_millis(100));
    let store = seeded_store("access-1");
    let coordinator = coordinator(Arc::clone(&store), Arc::clone(&auth));

    let leader = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.ensure_fresh(&stale()).await }
    });
    wait_until("leader in flight", || coordinator.is_refreshing()).await;
    leader.abort();
    assert!(leader.await.expect_err("aborted").is_cancelled());

    let next = tokio::time::timeout(Duration::from_secs(2), coordinator.ensure_fresh(&stale()))
        .await
        .expect("exchange still settles")
        .expect("refreshed");

    assert_eq!(next.access_token, "access-2");
    assert_eq!(auth.refresh_calls(), 1);
    assert!(!coordinator.is_refreshing());
    assert_eq!(store.access_token().as_deref(), Some("access-2"));
}

#[tokio::test]
async fn timed_out_caller_leaves_the_exchange_running() {
    let auth = FakeAuthApi::slow(Duration::from_millis(100));
    let store = seeded_store("access-1");
    let coordinator = coordinator(Arc::clone(&store), Arc::clone(&auth));

    let impatient =
        tokio::time::timeout(Duration::from_millis(10), coordinator.ensure_fresh(&stale())).await;
    assert!(impatient.is_err());

    wait_until("exchange settled", || !coordinator.is_refreshing()).await;
    assert_eq!(store.access_token().as_deref(), Some("access-2"));
    assert_eq!(coordinator.pending_calls(), 0);
}
