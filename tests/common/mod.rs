#![allow(dead_code)]

pub use tracerelay_test_utils::builders;
pub use tracerelay_test_utils::fake_adapter;
pub use tracerelay_test_utils::fake_provisioner;
pub use tracerelay_test_utils::{init_tracing, with_timeout};

use std::sync::Arc;

use tokio::sync::mpsc;
use tracerelay::config::ConfigFile;
use tracerelay::crypto::CryptoHelper;
use tracerelay::pipeline::{Flow, Pipeline, PipelineSettings, SessionContext};
use tracerelay::pool::WorkerPool;
use tracerelay::server::{ServerMessage, StartRequest};
use tracerelay::session::SessionManager;
use tracerelay::store::MemoryStore;
use tracerelay::types::Language;

use fake_adapter::FakeAdapter;
use fake_provisioner::FakeProvisioner;

pub const TEST_SECRET: &str = "integration-test-secret";

/// Pipeline wired to fakes, plus handles to inspect them.
pub struct Harness {
    pub pipeline: Pipeline,
    pub adapter: FakeAdapter,
    pub provisioner: FakeProvisioner,
    pub sessions: Arc<SessionManager>,
    pub crypto: Option<CryptoHelper>,
}

pub fn harness(cfg: &ConfigFile, adapter: FakeAdapter) -> Harness {
    init_tracing();
    let provisioner = FakeProvisioner::new();
    let pool = WorkerPool::new(cfg.pool.max_workers, Arc::new(provisioner.clone()));
    let sessions = Arc::new(SessionManager::new(Arc::new(MemoryStore::new()), None));
    let crypto = cfg
        .transport
        .encrypt
        .then(|| CryptoHelper::new(TEST_SECRET));
    let pipeline = Pipeline::new(
        pool,
        sessions.clone(),
        Arc::new(adapter.clone()),
        crypto.clone(),
        PipelineSettings::from_config(cfg),
    )
    .expect("pipeline");
    Harness {
        pipeline,
        adapter,
        provisioner,
        sessions,
        crypto,
    }
}

pub fn start_request(user: &str) -> StartRequest {
    StartRequest {
        code: "int main() { int x = 5; x = 6; return 0; }".to_string(),
        language: Language::C,
        user_id: user.to_string(),
        code_hash: None,
    }
}

/// Feed adapter events into the session the way a connection does, until
/// the trace is delivered or the session fails for good.
pub async fn drive(
    ctx: &mut SessionContext,
    out: &mpsc::UnboundedSender<ServerMessage>,
) -> tracerelay::errors::Result<()> {
    while !ctx.is_finished() {
        match ctx.next_event().await {
            Some(event) => match ctx.handle_event(event, out).await {
                Ok(Flow::Finished) => break,
                Ok(Flow::Continue) => {}
                Err(e) => ctx.on_error(e, out).await?,
            },
            None => ctx.adapter_closed(out).await?,
        }
    }
    Ok(())
}

/// Everything currently queued in the outbox.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
    let mut messages = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        messages.push(msg);
    }
    messages
}

pub fn event_names(messages: &[ServerMessage]) -> Vec<String> {
    messages.iter().map(|m| m.event_name().to_string()).collect()
}
