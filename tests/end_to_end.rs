use anvil_crd::{ActionState, Hardware, HardwareSpec, HardwareTarget, InterfaceSpec, Template};
use anvil_runtime::{ContainerAdapter, MockEngine};
use anvil_server::{router, AppState};
use anvil_worker::{HttpClient, LocalClient, OrchestratorClient, Worker, WorkerConfig};
use anvil_workflow::{MemoryStore, Orchestrator, SqliteStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SINGLE_TASK: &str = r#"
version: "0.1"
name: single_task
global_timeout: 1800
tasks:
  - name: provision
    worker: "{{.device_1}}"
    volumes:
      - /dev:/dev
    actions:
      - name: wipe
        image: quay.io/tinkerbell/actions/wipe:latest
        timeout: 90
      - name: stream
        image: quay.io/tinkerbell/actions/image2disk:latest
        timeout: 600
        environment:
          DEST_DISK: /dev/sda
"#;

const TWO_MACHINES: &str = r#"
version: "0.1"
name: two_machines
tasks:
  - name: prepare
    worker: "{{.device_1}}"
    actions:
      - name: wipe
        image: alpine
      - name: partition
        image: alpine
  - name: verify
    worker: "{{.device_2}}"
    actions:
      - name: check
        image: alpine
"#;

async fn wait_until_finished(orchestrator: &Orchestrator, id: &str) {
    for _ in 0..500 {
        let context = orchestrator.get_workflow_context(id).await.unwrap();
        if context.is_finished() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("workflow {} did not finish", id);
}

fn spawn_worker(
    client: Arc<dyn OrchestratorClient>,
    engine: Arc<MockEngine>,
    worker_id: &str,
    cancel: &CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let worker = Worker::new(
        client,
        ContainerAdapter::new(engine),
        WorkerConfig::new(worker_id)
            .with_poll_interval(Duration::from_millis(10))
            .with_retries(3, Duration::from_millis(5)),
    )
    .unwrap();
    let cancel = cancel.clone();
    tokio::spawn(async move { worker.run(cancel).await.unwrap() })
}

#[tokio::test]
async fn test_single_task_two_actions() {
    let orchestrator = Arc::new(Orchestrator::new(Arc::new(MemoryStore::new())));
    orchestrator
        .put_template(Template::new("single", SINGLE_TASK))
        .await
        .unwrap();
    let devices: HashMap<String, String> =
        [("device_1".to_string(), "W1".to_string())].into_iter().collect();
    let id = orchestrator
        .create_workflow("single", HardwareTarget::Devices(devices))
        .await
        .unwrap();

    let engine = Arc::new(MockEngine::new());
    let cancel = CancellationToken::new();
    let handle = spawn_worker(
        Arc::new(LocalClient::new(orchestrator.clone())),
        engine.clone(),
        "W1",
        &cancel,
    );

    wait_until_finished(&orchestrator, &id).await;
    cancel.cancel();
    handle.await.unwrap();

    let details = orchestrator.get_workflow(&id).await.unwrap();
    assert_eq!(details.context.current_action_index, 1);
    assert_eq!(details.context.current_action_state, ActionState::StateSuccess);
    assert_eq!(details.progress_percent, 100);

    let states: Vec<(String, ActionState)> = orchestrator
        .get_workflow_events(&id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| (e.action_name, e.action_state))
        .collect();
    assert_eq!(
        states,
        vec![
            ("wipe".to_string(), ActionState::StateRunning),
            ("wipe".to_string(), ActionState::StateSuccess),
            ("stream".to_string(), ActionState::StateRunning),
            ("stream".to_string(), ActionState::StateSuccess),
        ]
    );

    let created = engine.created();
    assert_eq!(created.len(), 2);
    assert_eq!(created[0].volumes, vec!["/dev:/dev".to_string()]);
    assert_eq!(
        created[1].environment.get("DEST_DISK").map(String::as_str),
        Some("/dev/sda")
    );
    assert_eq!(engine.live_containers(), 0);
}

#[tokio::test]
async fn test_failed_action_halts_workflow() {
    let orchestrator = Arc::new(Orchestrator::new(Arc::new(MemoryStore::new())));
    orchestrator
        .put_template(Template::new("single", SINGLE_TASK))
        .await
        .unwrap();
    let devices: HashMap<String, String> =
        [("device_1".to_string(), "W1".to_string())].into_iter().collect();
    let id = orchestrator
        .create_workflow("single", HardwareTarget::Devices(devices))
        .await
        .unwrap();

    let engine = Arc::new(MockEngine::new().with_exit_code("wipe", 137));
    let cancel = CancellationToken::new();
    let handle = spawn_worker(
        Arc::new(LocalClient::new(orchestrator.clone())),
        engine.clone(),
        "W1",
        &cancel,
    );

    wait_until_finished(&orchestrator, &id).await;
    // Give the loop a few more polls to prove it leaves the workflow alone
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    handle.await.unwrap();

    let details = orchestrator.get_workflow(&id).await.unwrap();
    assert_eq!(details.context.current_action_index, 0);
    assert_eq!(details.context.current_action_state, ActionState::StateFailed);
    assert_eq!(details.progress_percent, 0);
    assert_eq!(engine.created().len(), 1);
}

#[tokio::test]
async fn test_two_workers_over_http_with_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(dir.path().join("anvil.db")).await.unwrap();
    let orchestrator = Arc::new(Orchestrator::new(Arc::new(store)));

    orchestrator
        .put_template(Template::new("two", TWO_MACHINES))
        .await
        .unwrap();
    orchestrator
        .put_hardware(Hardware::new(
            "rack-1",
            HardwareSpec::new("00:11:22:33:44:01")
                .with_interface(InterfaceSpec::new("00:11:22:33:44:02")),
        ))
        .await
        .unwrap();
    let id = orchestrator
        .create_workflow("two", HardwareTarget::Ref("rack-1".to_string()))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let app = router(AppState::new(orchestrator.clone(), cancel.clone()));
    let server = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await
                .unwrap();
        }
    });

    let url = format!("http://{}", address);
    let engine = Arc::new(MockEngine::new());
    let first = spawn_worker(
        Arc::new(HttpClient::new(&url).unwrap()),
        engine.clone(),
        "00:11:22:33:44:01",
        &cancel,
    );
    let second = spawn_worker(
        Arc::new(HttpClient::new(&url).unwrap()),
        engine.clone(),
        "00:11:22:33:44:02",
        &cancel,
    );

    wait_until_finished(&orchestrator, &id).await;
    cancel.cancel();
    first.await.unwrap();
    second.await.unwrap();
    server.await.unwrap();

    let details = orchestrator.get_workflow(&id).await.unwrap();
    assert_eq!(details.context.current_action_index, 2);
    assert_eq!(details.context.current_worker, "00:11:22:33:44:02");
    assert_eq!(details.context.current_action_state, ActionState::StateSuccess);
    assert_eq!(details.progress_percent, 100);

    let events = orchestrator.get_workflow_events(&id).await.unwrap();
    assert_eq!(events.len(), 6);
    assert!(events[..4].iter().all(|e| e.worker_id == "00:11:22:33:44:01"));
    assert!(events[4..].iter().all(|e| e.worker_id == "00:11:22:33:44:02"));
}
