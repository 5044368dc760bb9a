//! End-to-end scenarios: HTTP submission through worker dispatch to the
//! authenticated callback.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;

use briefly_ai::{GenerateError, ScriptedGenerator, StaticGeneratorFactory};
use briefly_core::JobId;
use briefly_infra::callback::{CallbackClient, InMemorySink, ResultSink};
use briefly_infra::config::AppConfig;
use briefly_infra::registry::seed_registry;
use briefly_infra::router::Router;
use briefly_infra::store::Store;
use briefly_infra::worker::{Worker, WorkerHandle, WorkerSettings};

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(store: Store) -> Self {
        let app = briefly_api::app::build_app(store);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

type Received = Arc<Mutex<Vec<(String, String)>>>;

/// Local stand-in for the producer's callback endpoint. Records the auth
/// header and raw body of every delivery.
async fn spawn_callback_receiver() -> (String, Received, tokio::task::JoinHandle<()>) {
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let state = Arc::clone(&received);

    let app = axum::Router::new().route(
        "/hook",
        axum::routing::post(move |headers: axum::http::HeaderMap, body: String| {
            let state = Arc::clone(&state);
            async move {
                let auth = headers
                    .get("x-internal-auth")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                state.lock().unwrap().push((auth, body));
                axum::http::StatusCode::OK
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind callback receiver");
    let url = format!("http://{}/hook", listener.local_addr().unwrap());
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (url, received, handle)
}

fn spawn_worker(store: &Store, generator: Arc<ScriptedGenerator>, sink: Arc<dyn ResultSink>) -> WorkerHandle {
    let router = Arc::new(Router::new(
        store.clone(),
        Arc::new(StaticGeneratorFactory(generator)),
    ));
    Worker::new(
        store.clone(),
        router,
        sink,
        WorkerSettings {
            poll_interval: Duration::from_millis(10),
            ..WorkerSettings::default()
        },
    )
    .spawn()
}

async fn wait_for_state(
    client: &reqwest::Client,
    base_url: &str,
    job_id: &str,
    state: &str,
) -> Value {
    // The queue is asynchronous by design; poll briefly until the worker
    // settles the job.
    let mut last = Value::Null;
    for _ in 0..500 {
        let res = client
            .get(format!("{}/jobs/{}", base_url, job_id))
            .send()
            .await
            .unwrap();
        last = res.json().await.unwrap();
        if last["state"] == state {
            return last;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job never reached state '{}': {}", state, last);
}

#[tokio::test]
async fn submit_process_callback_and_dedupe_on_success() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("queue.db")).await.unwrap();

    let secret = "e2e-secret-value";
    let config = AppConfig::from_vars(HashMap::from([
        ("INTERNAL_SECRET".to_string(), secret.to_string()),
        ("CALLBACK_URL".to_string(), "http://replaced.local/".to_string()),
        ("PRIMARY_API_KEY".to_string(), "key-1".to_string()),
    ]))
    .unwrap();
    seed_registry(&store, &config.providers).await.unwrap();

    let (callback_url, received, _cb) = spawn_callback_receiver().await;
    let generator = Arc::new(ScriptedGenerator::new(vec![Ok("SUMMARY".to_string())]));
    let sink = Arc::new(CallbackClient::new(
        callback_url,
        secret,
        Duration::from_secs(10),
    ));
    let worker = spawn_worker(&store, generator, sink);

    let srv = TestServer::spawn(store.clone()).await;
    let client = reqwest::Client::new();
    let submission = json!({
        "file_id": "doc-1",
        "payload": {"content": "a reasonably long body of text to summarize"},
    });

    let res = client
        .post(format!("{}/jobs", srv.base_url))
        .json(&submission)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::ACCEPTED);
    let submitted: Value = res.json().await.unwrap();
    let job_id = submitted["job_id"].as_str().unwrap().to_string();

    let done = wait_for_state(&client, &srv.base_url, &job_id, "succeeded").await;
    assert_eq!(done["result"], "SUMMARY");

    // The callback carried a verifiable signature over timestamp + body.
    let deliveries = received.lock().unwrap().clone();
    assert_eq!(deliveries.len(), 1);
    let (auth, body) = &deliveries[0];
    let (timestamp, mac) = auth.split_once('.').expect("auth header is ts.hex");
    let mut expected = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    expected.update(format!("{}.{}", timestamp, body).as_bytes());
    assert_eq!(mac, hex::encode(expected.finalize().into_bytes()));

    let body: Value = serde_json::from_str(body).unwrap();
    assert_eq!(body["fileId"], "doc-1");
    assert_eq!(body["summary"], "SUMMARY");
    assert_eq!(body["metadata"]["contentBlocks"], 1);
    assert!(body["metadata"]["processedAt"].is_string());

    // Resubmitting the identical work returns the stored result without a
    // second job row.
    let res = client
        .post(format!("{}/jobs", srv.base_url))
        .json(&submission)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::OK);
    let dup: Value = res.json().await.unwrap();
    assert_eq!(dup["status"], "already_completed");
    assert_eq!(dup["result"], "SUMMARY");
    assert_eq!(dup["job_id"].as_str().unwrap(), job_id);

    let stats: Value = client
        .get(format!("{}/queue/stats", srv.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["succeeded"], 1);
    assert_eq!(stats["queued"], 0);

    worker.shutdown().await;
}

#[tokio::test]
async fn failover_to_the_second_provider_records_both_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(&dir.path().join("queue.db")).await.unwrap();

    store
        .upsert_provider("alpha", "Alpha", "key-a", 1, true)
        .await
        .unwrap();
    store
        .upsert_provider("beta", "Beta", "key-b", 2, true)
        .await
        .unwrap();
    store
        .upsert_model("alpha/m", "alpha", "alpha-model", 10, 100, true)
        .await
        .unwrap();
    store
        .upsert_model("beta/m", "beta", "beta-model", 10, 100, true)
        .await
        .unwrap();

    let generator = Arc::new(ScriptedGenerator::new(vec![
        Err(GenerateError::classify(Some(503), "service unavailable")),
        Ok("OK".to_string()),
    ]));
    let sink = Arc::new(InMemorySink::new());
    let dyn_sink: Arc<dyn ResultSink> = sink.clone() as Arc<dyn ResultSink>;
    let worker = spawn_worker(&store, Arc::clone(&generator), dyn_sink);

    let srv = TestServer::spawn(store.clone()).await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/jobs", srv.base_url))
        .json(&json!({ "file_id": "doc-f", "payload": {"content": "failover body"} }))
        .send()
        .await
        .unwrap();
    let submitted: Value = res.json().await.unwrap();
    let job_id = submitted["job_id"].as_str().unwrap().to_string();

    let done = wait_for_state(&client, &srv.base_url, &job_id, "succeeded").await;
    assert_eq!(done["result"], "OK");
    assert_eq!(generator.calls(), vec!["alpha-model", "beta-model"]);

    // Attempt trail: alpha's failure first, beta's success second.
    let parsed: JobId = job_id.parse().unwrap();
    let attempts = store.list_attempts(parsed).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert!(!attempts[0].success);
    assert_eq!(attempts[0].provider_id.as_deref(), Some("alpha"));
    assert!(attempts[1].success);
    assert_eq!(attempts[1].provider_id.as_deref(), Some("beta"));

    // The 503 left alpha gated for the transient window.
    let now = chrono::Utc::now();
    let gated = store.list_gated_providers(now).await.unwrap();
    assert_eq!(gated.len(), 1);
    assert_eq!(gated[0].provider_id, "alpha");
    assert!(gated[0].until > now + chrono::Duration::minutes(14));
    assert!(gated[0].until < now + chrono::Duration::minutes(16));

    assert_eq!(sink.deliveries().len(), 1);
    worker.shutdown().await;
}
