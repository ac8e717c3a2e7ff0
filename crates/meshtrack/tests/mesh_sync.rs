//! Two nodes on loopback, syncing over their real HTTP APIs.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use meshtrack::server::Node;
use meshtrack::{Config, Storage};

struct Running {
    addr: SocketAddr,
    cancel: CancellationToken,
}

impl Running {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn config(node_id: &str, known: &[(&str, String)]) -> Config {
    let mut config = Config::default();
    config.node.id = Some(node_id.to_string());
    config.sync.enabled = false;
    config.sync.request_timeout_secs = 2;
    config.sync.peer_timeout_secs = 5;
    for (peer, address) in known {
        config.peers.known.insert((*peer).to_string(), address.clone());
    }
    config
}

fn start(listener: TcpListener, config: Config) -> Running {
    let addr = listener.local_addr().unwrap();
    let storage = Arc::new(Storage::open_in_memory().unwrap());
    let node = Node::with_storage(config, storage).unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(node.serve(listener, cancel.clone()));
    Running { addr, cancel }
}

async fn pair() -> (Running, Running) {
    let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr_a = listener_a.local_addr().unwrap().to_string();
    let addr_b = listener_b.local_addr().unwrap().to_string();

    let a = start(listener_a, config("node-a", &[("node-b", addr_b)]));
    let b = start(listener_b, config("node-b", &[("node-a", addr_a)]));
    (a, b)
}

async fn post(client: &reqwest::Client, url: String, body: &Value) -> (u16, Value) {
    let resp = client.post(url).json(body).send().await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

async fn get(client: &reqwest::Client, url: String) -> Value {
    client.get(url).send().await.unwrap().json().await.unwrap()
}

fn report(entity_id: Uuid, created_at: i64) -> Value {
    json!({
        "entity_id": entity_id,
        "entity_type": "responder",
        "position": {"lat": 27.7172, "lon": 85.3240},
        "metadata": {"name": "Team 4"},
        "created_at": created_at,
    })
}

#[tokio::test]
async fn test_reports_converge_across_two_nodes() {
    let (a, b) = pair().await;
    let client = reqwest::Client::new();

    let (status, created) = post(&client, a.url("/api/locations/"), &report(Uuid::new_v4(), 1_000)).await;
    assert_eq!(status, 201);
    assert_eq!(created["data"]["node_id"], "node-a");

    let (status, cycle) = post(&client, a.url("/api/sync"), &json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(cycle["data"]["attempted"], 1);
    assert_eq!(cycle["data"]["succeeded"], 1);
    assert_eq!(cycle["data"]["pushed"], 1);
    assert_eq!(cycle["data"]["pulled"], 0);

    let latest = get(&client, b.url("/api/locations/latest")).await;
    assert_eq!(latest["count"], 1);
    assert_eq!(latest["data"][0]["node_id"], "node-a");
    assert_eq!(latest["data"][0]["id"], created["data"]["id"]);

    // B only holds A's report, so syncing back moves nothing new.
    let (_, cycle) = post(&client, b.url("/api/sync"), &json!({})).await;
    assert_eq!(cycle["data"]["succeeded"], 1);
    assert_eq!(cycle["data"]["total_records_transferred"], 0);

    let latest = get(&client, a.url("/api/locations/latest")).await;
    assert_eq!(latest["count"], 1);

    let peers = get(&client, a.url("/api/sync/peers")).await;
    assert_eq!(peers["data"][0]["peer_node_id"], "node-b");
    assert_eq!(peers["data"][0]["last_forward_sync_at"], 1_000);
}

#[tokio::test]
async fn test_pull_brings_peer_reports_home() {
    let (a, b) = pair().await;
    let client = reqwest::Client::new();

    let entity = Uuid::new_v4();
    for created_at in [2_000, 3_000] {
        let (status, _) = post(&client, b.url("/api/locations"), &report(entity, created_at)).await;
        assert_eq!(status, 201);
    }

    let (_, cycle) = post(&client, a.url("/api/sync"), &json!({})).await;
    assert_eq!(cycle["data"]["pulled"], 2);
    assert_eq!(cycle["data"]["pushed"], 0);

    let history = get(&client, a.url(&format!("/api/locations/history/{entity}"))).await;
    assert_eq!(history["count"], 2);
    assert_eq!(history["data"][0]["created_at"], 3_000);

    // A second cycle re-reads only the boundary row and stores nothing new.
    let (_, cycle) = post(&client, a.url("/api/sync"), &json!({})).await;
    assert_eq!(cycle["data"]["pulled"], 0);
    let history = get(&client, a.url(&format!("/api/locations/history/{entity}"))).await;
    assert_eq!(history["count"], 2);
}

#[tokio::test]
async fn test_unreachable_peer_is_reported_not_fatal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    // Grab a free port, then close it so nothing answers there.
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap().to_string();
    drop(dead);

    let a = start(listener, config("node-a", &[("node-gone", dead_addr)]));
    let client = reqwest::Client::new();

    let (status, cycle) = post(&client, a.url("/api/sync"), &json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(cycle["data"]["attempted"], 1);
    assert_eq!(cycle["data"]["succeeded"], 0);
    assert_eq!(cycle["data"]["errors"][0]["peer_id"], "node-gone");

    let health = get(&client, a.url("/api/health")).await;
    assert_eq!(health["status"], "healthy");
}
