//! End-to-end runs of the client against the local simulator.

use casebox_client::{
    Client, ClientConfig, DrawController, DrawPhase, ErrorKind, FileTokenStore, MemoryTokenStore,
    OpenOutcome, SessionEvent, SessionStatus, TokenStore,
};
use casebox_simulator::{init_data, Api, RefreshMode, Simulator};
use std::{sync::Arc, time::Duration};

const USER: u64 = 501;

async fn serve(simulator: Arc<Simulator>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = Api::new(simulator).router();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}/api/v1")
}

fn config(base_url: &str, max_refresh_attempts: u32) -> ClientConfig {
    ClientConfig::default()
        .with_base_url(base_url)
        .with_max_refresh_attempts(max_refresh_attempts)
        .with_refresh_backoff(Duration::ZERO)
}

#[tokio::test]
async fn refresh_token_only_session_refreshes_once() {
    let simulator = Arc::new(Simulator::default());
    let base_url = serve(simulator.clone()).await;
    let tokens = simulator
        .login(&init_data(USER, "dana", None))
        .await
        .unwrap();

    let store = Arc::new(MemoryTokenStore::with_token(tokens.refresh_token.clone()));
    let client = Client::with_config(&config(&base_url, 3), store.clone()).unwrap();
    assert!(client.restore().unwrap());
    assert_eq!(client.status(), SessionStatus::Idle);
    let mut events = client.subscribe();

    let user = client.current_user().await.unwrap();
    assert_eq!(user.id, USER.to_string());
    assert_eq!(simulator.calls().refresh, 1);
    assert_eq!(client.status(), SessionStatus::Authenticated);
    assert!(matches!(events.try_recv(), Ok(SessionEvent::Authenticated)));

    // The rotated refresh token is persisted.
    let persisted = store.load().unwrap().unwrap();
    assert_ne!(persisted, tokens.refresh_token);

    client.current_user().await.unwrap();
    assert_eq!(simulator.calls().refresh, 1);
}

#[tokio::test]
async fn failing_refresh_expires_session_once() {
    let simulator = Arc::new(Simulator::default());
    let base_url = serve(simulator.clone()).await;
    let client =
        Client::with_config(&config(&base_url, 2), Arc::new(MemoryTokenStore::new())).unwrap();
    client.login(&init_data(USER, "dana", None)).await.unwrap();
    let mut events = client.subscribe();

    simulator.update_controls(|controls| controls.refresh = RefreshMode::Unavailable);
    simulator.invalidate_access_tokens().await;

    let requests: Vec<_> = (0..4)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.current_user().await })
        })
        .collect();
    for request in requests {
        let err = request.await.unwrap().unwrap_err();
        assert!(
            matches!(
                err.kind(),
                ErrorKind::AuthenticationFailure | ErrorKind::SessionExhausted
            ),
            "{err}"
        );
    }
    assert_eq!(simulator.calls().refresh, 2);
    assert_eq!(client.status(), SessionStatus::Expired);

    let mut expired = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SessionEvent::SessionExpired { .. }) {
            expired += 1;
        }
    }
    assert_eq!(expired, 1);

    // Terminal until the user logs in again.
    let err = client.list_cases().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SessionExhausted);
    assert_eq!(simulator.calls().refresh, 2);

    simulator.update_controls(|controls| controls.refresh = RefreshMode::Accept);
    client.login(&init_data(USER, "dana", None)).await.unwrap();
    assert_eq!(client.status(), SessionStatus::Authenticated);
    assert_eq!(client.list_cases().await.unwrap().len(), 2);
}

#[tokio::test]
async fn open_uses_latest_nonce() {
    let simulator = Arc::new(Simulator::default());
    let base_url = serve(simulator.clone()).await;
    let client = Client::new(&base_url).unwrap();
    client.login(&init_data(USER, "dana", None)).await.unwrap();
    simulator.set_nonce(USER, "starter", 5).await;

    let controller = DrawController::new(client, "starter");
    controller.enter().await.unwrap();
    controller.commit().await.unwrap();
    simulator.set_nonce(USER, "starter", 6).await;
    controller.refresh_definition().await.unwrap();

    let OpenOutcome::Drawn(_) = controller.open().await.unwrap() else {
        panic!("expected a draw");
    };
    // The server accepted the draw, so it carried nonce 7.
    let definition = controller.refresh_definition().await.unwrap();
    assert_eq!(definition.nonce, 7);
    controller.verify().await.unwrap();
    assert_eq!(controller.snapshot().phase, DrawPhase::Verified);
}

#[tokio::test]
async fn denied_admission_halts_before_commit() {
    let simulator = Arc::new(Simulator::default());
    simulator.update_controls(|controls| {
        controls.reserve_available = false;
        controls.reserve_reason = "reserve_exhausted".to_string();
    });
    let base_url = serve(simulator.clone()).await;
    let client = Client::new(&base_url).unwrap();
    client.login(&init_data(USER, "dana", None)).await.unwrap();

    let controller = DrawController::new(client, "premium");
    let mut snapshots = controller.subscribe();
    let admission = controller.enter().await.unwrap();
    assert!(!admission.spin);

    let snapshot = snapshots.borrow_and_update().clone();
    assert_eq!(snapshot.phase, DrawPhase::AdmissionChecked);
    assert!(!snapshot.can_play);
    assert_eq!(snapshot.admission_reason.as_deref(), Some("reserve_exhausted"));
    assert_eq!(
        controller.commit().await.unwrap_err().kind(),
        ErrorKind::AdmissionDenied
    );
    assert_eq!(simulator.calls().commit, 0);
}

#[tokio::test]
async fn session_survives_restart_through_file_store() {
    let simulator = Arc::new(Simulator::default());
    let base_url = serve(simulator.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");

    let first = Client::with_config(
        &config(&base_url, 3),
        Arc::new(FileTokenStore::new(&path)),
    )
    .unwrap();
    first.login(&init_data(USER, "dana", None)).await.unwrap();
    assert!(path.exists());

    let second = Client::with_config(
        &config(&base_url, 3),
        Arc::new(FileTokenStore::new(&path)),
    )
    .unwrap();
    assert!(second.restore().unwrap());
    assert_eq!(second.current_user().await.unwrap().id, USER.to_string());

    second.logout().unwrap();
    assert!(!path.exists());
    assert_eq!(second.status(), SessionStatus::Idle);
}
