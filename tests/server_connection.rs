// tests/server_connection.rs

mod common;
use crate::common::builders::ConfigFileBuilder;
use crate::common::fake_adapter::{FakeAdapter, FakeScript};
use crate::common::{harness, with_timeout};

use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{BufReader, DuplexStream, ReadHalf, WriteHalf};

use tracerelay::dap::framing;
use tracerelay::server::serve_connection;
use tracerelay::types::SessionStatus;

struct Client {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl Client {
    async fn send(&mut self, event: &str, data: Value) {
        framing::write_message(&mut self.writer, &json!({ "event": event, "data": data }))
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> Value {
        framing::read_message(&mut self.reader)
            .await
            .unwrap()
            .expect("server closed the stream")
    }

    /// Read until a message named `event` arrives; return everything read.
    async fn recv_until(&mut self, event: &str) -> Vec<Value> {
        let mut seen = Vec::new();
        loop {
            let msg = self.recv().await;
            let done = msg["event"] == event;
            seen.push(msg);
            if done {
                return seen;
            }
        }
    }
}

fn connect(
    pipeline: tracerelay::pipeline::Pipeline,
) -> (Client, tokio::task::JoinHandle<tracerelay::errors::Result<()>>) {
    let (client_end, server_end) = tokio::io::duplex(1024 * 1024);
    let server = tokio::spawn(serve_connection(server_end, pipeline));
    let (reader, writer) = tokio::io::split(client_end);
    (
        Client {
            reader: BufReader::new(reader),
            writer,
        },
        server,
    )
}

#[tokio::test]
async fn full_session_over_the_wire() {
    let cfg = ConfigFileBuilder::new().chunk_size(2).encrypt(false).build();
    let h = harness(&cfg, FakeAdapter::new(FakeScript::simple_program()));
    let (mut client, server) = connect(h.pipeline.clone());

    client
        .send(
            "debug:start",
            json!({"code": "int main(){}", "language": "cpp", "userId": "u-wire"}),
        )
        .await;
    let messages = with_timeout(client.recv_until("chunk:complete")).await;

    assert_eq!(messages[0]["event"], "session:created");
    assert_eq!(messages[0]["data"]["status"], "active");
    let session_id = messages[0]["data"]["sessionId"].as_str().unwrap().to_string();
    assert!(messages[0]["data"]["workerId"].is_string());

    let chunk_ids: Vec<u64> = messages
        .iter()
        .filter(|m| m["event"] == "chunk:ready")
        .map(|m| m["data"]["chunkId"].as_u64().unwrap())
        .collect();
    assert_eq!(chunk_ids, vec![0, 1, 2]);
    assert_eq!(messages.last().unwrap()["data"]["totalChunks"], 3);

    // Re-request a chunk after delivery.
    client.send("chunk:request", json!({"chunkId": 1})).await;
    let again = with_timeout(client.recv()).await;
    assert_eq!(again["event"], "chunk:ready");
    assert_eq!(again["data"]["chunkId"], 1);
    assert!(again["data"]["steps"].is_array());

    client.send("chunk:request", json!({"chunkId": 7})).await;
    let missing = with_timeout(client.recv()).await;
    assert_eq!(missing["event"], "session:error");
    assert_eq!(missing["data"]["kind"], "MalformedChunk");

    drop(client);
    with_timeout(server).await.unwrap().unwrap();

    let record = h.sessions.get_session(&session_id).unwrap().unwrap();
    assert_eq!(record.status, SessionStatus::Terminated);
}

#[tokio::test]
async fn commands_before_start_are_rejected() {
    let cfg = ConfigFileBuilder::new().encrypt(false).build();
    let h = harness(&cfg, FakeAdapter::new(FakeScript::simple_program()));
    let (mut client, server) = connect(h.pipeline.clone());

    client.send("debug:next", json!({})).await;
    let reply = with_timeout(client.recv()).await;
    assert_eq!(reply["event"], "session:error");
    assert_eq!(reply["data"]["kind"], "InvalidSessionState");

    client.send("debug:teleport", json!({})).await;
    let reply = with_timeout(client.recv()).await;
    assert_eq!(reply["event"], "session:error");

    drop(client);
    with_timeout(server).await.unwrap().unwrap();
    assert_eq!(h.adapter.spawns(), 0);
}

#[tokio::test]
async fn dropping_the_connection_pauses_a_running_session() {
    let cfg = ConfigFileBuilder::new().auto_step(false).encrypt(false).build();
    let h = harness(&cfg, FakeAdapter::new(FakeScript::simple_program()));
    let (mut client, server) = connect(h.pipeline.clone());

    client
        .send(
            "debug:start",
            json!({"code": "int main(){}", "language": "c", "userId": "u-drop"}),
        )
        .await;
    let created = with_timeout(client.recv_until("session:created")).await;
    let session_id = created.last().unwrap()["data"]["sessionId"]
        .as_str()
        .unwrap()
        .to_string();
    with_timeout(client.recv_until("stopped")).await;

    drop(client);
    with_timeout(server).await.unwrap().unwrap();

    let record = h.sessions.get_session(&session_id).unwrap().unwrap();
    assert_eq!(record.status, SessionStatus::Paused);
    assert_eq!(record.worker_id, None);
    assert_eq!(h.pipeline.pool().stats().await.busy, 0);
}

#[tokio::test]
async fn hangup_interrupts_a_stalled_adapter_request() {
    let cfg = ConfigFileBuilder::new()
        .request_timeout_ms(1_500)
        .encrypt(false)
        .build();
    let script = FakeScript::simple_program().silent_on("stackTrace");
    let h = harness(&cfg, FakeAdapter::new(script));
    let (mut client, server) = connect(h.pipeline.clone());

    client
        .send(
            "debug:start",
            json!({"code": "int main(){}", "language": "c", "userId": "u-stall"}),
        )
        .await;
    let created = with_timeout(client.recv_until("session:created")).await;
    let session_id = created.last().unwrap()["data"]["sessionId"]
        .as_str()
        .unwrap()
        .to_string();
    // Capturing this stop waits on the silent stackTrace.
    with_timeout(client.recv_until("stopped")).await;

    let dropped = tokio::time::Instant::now();
    drop(client);
    with_timeout(server).await.unwrap().unwrap();
    let took = dropped.elapsed();
    assert!(took < Duration::from_millis(500), "disconnect took {took:?}");

    let record = h.sessions.get_session(&session_id).unwrap().unwrap();
    assert_eq!(record.status, SessionStatus::Paused);
    assert_eq!(record.worker_id, None);
    assert_eq!(h.pipeline.pool().stats().await.busy, 0);
    assert_eq!(h.adapter.count("stackTrace"), 1);
}

#[tokio::test]
async fn hangup_while_provisioning_frees_the_slot() {
    let cfg = ConfigFileBuilder::new()
        .max_workers(1)
        .acquire_timeout_ms(10_000)
        .encrypt(false)
        .build();
    let h = harness(&cfg, FakeAdapter::new(FakeScript::simple_program()));
    h.provisioner.provision_delay(Duration::from_secs(10));
    let (mut client, server) = connect(h.pipeline.clone());

    client
        .send(
            "debug:start",
            json!({"code": "int main(){}", "language": "c", "userId": "u-early"}),
        )
        .await;
    with_timeout(async {
        while h.pipeline.pool().stats().await.provisioning == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    let dropped = tokio::time::Instant::now();
    drop(client);
    with_timeout(server).await.unwrap().unwrap();
    assert!(dropped.elapsed() < Duration::from_millis(500));

    with_timeout(async {
        while h.pipeline.pool().stats().await.provisioning != 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert_eq!(h.adapter.spawns(), 0);
}
