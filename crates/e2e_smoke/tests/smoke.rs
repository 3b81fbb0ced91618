use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

type Bootstraps = Arc<Mutex<Vec<serde_json::Value>>>;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_gateway_filters_search_results_with_admin_managed_settings() {
    let log_buf = init_test_tracing();
    log_buf
        .lock()
        .expect("log lock should be available")
        .clear();

    let bootstraps: Bootstraps = Arc::new(Mutex::new(Vec::new()));
    let pdp_app = Router::new()
        .route("/v1/data/tbac/authz/allow", post(pdp_decision))
        .route("/v1/data/tbac/bootstrap", put(pdp_bootstrap))
        .route("/health", get(|| async { "ok" }))
        .with_state(bootstraps.clone());
    let (pdp_addr, pdp_shutdown, pdp_task) = spawn_server(pdp_app).await;

    let gateway_config = tbac_gateway::config::GatewayConfig::from_kv(&HashMap::from([
        ("TBAC_BIND_ADDR".to_string(), "127.0.0.1:0".to_string()),
        ("TBAC_PDP_URL".to_string(), format!("http://{}", pdp_addr)),
        ("TBAC_PDP_TIMEOUT_MS".to_string(), "2000".to_string()),
    ]))
    .expect("gateway config should be valid");

    let (gateway_addr, gateway_shutdown, gateway_task) = spawn_server(
        tbac_gateway::http::router(gateway_config)
            .await
            .expect("gateway router should init"),
    )
    .await;

    let client = reqwest::Client::new();
    wait_for_healthz(&client, gateway_addr).await;

    let ready = client
        .get(format!("http://{}/readyz", gateway_addr))
        .send()
        .await
        .expect("readyz should respond");
    assert_eq!(ready.status(), reqwest::StatusCode::OK);

    let filter_url = format!("http://{}/v1/search/filter", gateway_addr);
    let settings_url = format!("http://{}/_plugins/tbac/settings", gateway_addr);

    // Nothing configured yet: responses go through untouched.
    let untouched = post_filter(&client, &filter_url, "req_smoke_01").await;
    assert_eq!(untouched, search_exchange()["response"]);

    let rejected = client
        .put(&settings_url)
        .header("content-type", "text/plain")
        .body(settings_document(false).to_string())
        .send()
        .await
        .expect("put should respond");
    assert_eq!(rejected.status(), reqwest::StatusCode::NOT_ACCEPTABLE);

    put_settings(&client, &settings_url, false).await;

    let current: serde_json::Value = client
        .get(&settings_url)
        .send()
        .await
        .expect("get should respond")
        .json()
        .await
        .expect("settings should be json");
    assert_eq!(current["schemaPrefix"], "Acme");
    assert_eq!(current["skipHits"], false);
    assert_eq!(current["enabled"], true);
    assert!(current.get("version").is_none());
    assert_eq!(
        bootstraps.lock().expect("bootstrap lock").last(),
        Some(&serde_json::json!({ "CEDARLING_POLICY_STORE_ID": "store-1" }))
    );

    let filtered = post_filter(&client, &filter_url, "req_smoke_02").await;
    let ids: Vec<_> = filtered["hits"]["hits"]
        .as_array()
        .expect("hits should be an array")
        .iter()
        .filter_map(|hit| hit["_id"].as_str())
        .collect();
    assert_eq!(ids, vec!["public-1", "flaky-3", "public-4"]);
    assert_eq!(filtered["hits"]["total"]["value"], 4);
    assert_eq!(filtered["aggregations"], search_exchange()["response"]["aggregations"]);
    assert_eq!(filtered["ext"]["tbac"]["authorized_hits_count"], 3);
    let average = filtered["ext"]["tbac"]["average_decision_time"]
        .as_f64()
        .expect("average should be a number");
    assert!(average >= 0.0);
    assert!(filtered["took"].as_u64().expect("took should be a number") >= 11);

    put_settings(&client, &settings_url, true).await;
    let metrics_only = post_filter(&client, &filter_url, "req_smoke_03").await;
    assert_eq!(metrics_only["hits"]["hits"], serde_json::json!([]));
    assert_eq!(metrics_only["ext"]["tbac"]["authorized_hits_count"], 3);

    let metrics = client
        .get(format!("http://{}/metrics", gateway_addr))
        .send()
        .await
        .expect("metrics should respond")
        .text()
        .await
        .expect("metrics should be text");
    assert!(metrics.contains("tbac_gateway_decisions_total"));
    assert!(metrics.contains("tbac_gateway_settings_reloads_total"));

    let logs = String::from_utf8(log_buf.lock().expect("log lock").clone())
        .expect("logs should be utf-8");
    assert!(logs.contains("search.filter"));
    assert!(logs.contains("req_smoke_02"));
    assert!(logs.contains("policy decision failed"));

    let _ = gateway_shutdown.send(());
    let _ = pdp_shutdown.send(());
    let _ = gateway_task.await;
    let _ = pdp_task.await;
}

fn settings_document(skip_hits: bool) -> serde_json::Value {
    serde_json::json!({
        "enabled": true,
        "bootstrapProperties": { "CEDARLING_POLICY_STORE_ID": "store-1" },
        "searchActionName": "Acme::Action::\"Search\"",
        "schemaPrefix": "Acme",
        "skipHits": skip_hits
    })
}

fn search_exchange() -> serde_json::Value {
    serde_json::json!({
        "request": {
            "query": { "match": { "title": "quarterly" } },
            "ext": {
                "tbac": {
                    "tokens": { "access_token": "at-1", "id_token": "it-1" },
                    "context": { "network": "corp" }
                }
            }
        },
        "response": {
            "took": 11,
            "timed_out": false,
            "_shards": { "total": 1, "successful": 1, "skipped": 0, "failed": 0 },
            "hits": {
                "total": { "value": 4, "relation": "eq" },
                "max_score": 3.1,
                "hits": [
                    { "_index": "reports", "_id": "public-1", "_score": 3.1, "_source": { "level": "public" } },
                    { "_index": "reports", "_id": "restricted-2", "_score": 2.7, "_source": { "level": "restricted" } },
                    { "_index": "reports", "_id": "flaky-3", "_score": 1.9, "_source": { "level": "public" } },
                    { "_index": "reports", "_id": "public-4", "_score": 0.4, "_source": { "level": "public" } }
                ]
            },
            "aggregations": { "levels": { "buckets": [{ "key": "public", "doc_count": 3 }] } }
        }
    })
}

async fn put_settings(client: &reqwest::Client, url: &str, skip_hits: bool) {
    let resp = client
        .put(url)
        .json(&settings_document(skip_hits))
        .send()
        .await
        .expect("put should respond");
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let ack: serde_json::Value = resp.json().await.expect("ack should be json");
    assert_eq!(ack, serde_json::json!({ "acknowledged": true }));
}

async fn post_filter(client: &reqwest::Client, url: &str, request_id: &str) -> serde_json::Value {
    let resp = client
        .post(url)
        .header("x-tbac-request-id", request_id)
        .json(&search_exchange())
        .send()
        .await
        .expect("filter should respond");
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(
        resp.headers()
            .get("x-tbac-request-id")
            .and_then(|v| v.to_str().ok()),
        Some(request_id)
    );
    resp.json().await.expect("filtered response should be json")
}

async fn pdp_decision(
    Json(body): Json<serde_json::Value>,
) -> (StatusCode, Json<serde_json::Value>) {
    let input = body.get("input").cloned().unwrap_or(serde_json::json!({}));
    let resource = input.get("resource").cloned().unwrap_or_default();

    if resource.get("id").and_then(|v| v.as_str()) == Some("flaky-3") {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "code": "internal_error" })),
        );
    }

    let has_token = input
        .get("tokens")
        .and_then(|t| t.get("access_token"))
        .and_then(|v| v.as_str())
        .is_some();
    let well_formed = resource.get("type").and_then(|v| v.as_str()) == Some("Acme::reports")
        && resource.get("entity_type").and_then(|v| v.as_str()) == Some("resource");
    let public = resource.get("level").and_then(|v| v.as_str()) == Some("public");

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "result": { "allow": has_token && well_formed && public }
        })),
    )
}

async fn pdp_bootstrap(
    State(bootstraps): State<Bootstraps>,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    bootstraps.lock().expect("bootstrap lock").push(body);
    StatusCode::NO_CONTENT
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind should succeed");
    let addr = listener.local_addr().expect("local_addr should succeed");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
    });

    (addr, shutdown_tx, handle)
}

async fn wait_for_healthz(client: &reqwest::Client, addr: SocketAddr) {
    let url = format!("http://{}/healthz", addr);

    for _ in 0..50 {
        if let Ok(response) = client.get(&url).send().await
            && response.status().is_success()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    panic!("server did not become ready at {}", url);
}

#[derive(Clone)]
struct TestWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut lock = self
            .buf
            .lock()
            .map_err(|_| std::io::Error::other("log mutex poisoned"))?;
        lock.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn init_test_tracing() -> Arc<Mutex<Vec<u8>>> {
    static LOG_BUF: OnceLock<Arc<Mutex<Vec<u8>>>> = OnceLock::new();

    LOG_BUF
        .get_or_init(|| {
            let buf = Arc::new(Mutex::new(Vec::new()));
            let make_writer = {
                let buf = buf.clone();
                move || TestWriter { buf: buf.clone() }
            };

            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
                .with_ansi(false)
                .with_writer(make_writer)
                .finish();

            tracing::subscriber::set_global_default(subscriber)
                .expect("global tracing subscriber should be set once");

            buf
        })
        .clone()
}
