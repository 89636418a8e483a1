// src/server/connection.rs

//! One client connection.
//!
//! Three cooperating pieces:
//! - a reader task that turns framed bytes into `ClientMessage`s
//! - a writer task that frames every `ServerMessage` from the outbox
//! - the session loop, which owns the optional `SessionContext` and selects
//!   between client messages and adapter events
//!
//! The reader runs in its own task so the session loop only ever waits on
//! channels, which are safe to cancel inside `select!`. Handling one message
//! can wait on the adapter for a whole request timeout, so each handler
//! races the reader's hangup signal and is dropped when the client leaves.

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::dap::{Event, framing};
use crate::errors::{RelayError, Result};
use crate::pipeline::{Flow, Outbox, Pipeline, SessionContext};
use crate::server::messages::{ClientMessage, ServerMessage};

/// Serve one client until it disconnects.
pub async fn serve_connection<S>(stream: S, pipeline: Pipeline) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);

    let (in_tx, mut in_rx) = mpsc::channel::<Result<ClientMessage>>(32);
    let (hangup_tx, mut hangup) = oneshot::channel::<()>();
    let reader = tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        loop {
            let msg = match framing::read_message(&mut reader).await {
                Ok(Some(raw)) => ClientMessage::from_value(raw),
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "client stream unreadable");
                    break;
                }
            };
            if in_tx.send(msg).await.is_err() {
                break;
            }
        }
        let _ = hangup_tx.send(());
    });

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let envelope = match msg.to_envelope().and_then(|e| Ok(serde_json::to_value(e)?)) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "failed to encode server message");
                    continue;
                }
            };
            if let Err(e) = framing::write_message(&mut write_half, &envelope).await {
                debug!(error = %e, "client write failed; stopping writer");
                break;
            }
        }
    });

    let mut session: Option<SessionContext> = None;
    loop {
        let work = tokio::select! {
            incoming = in_rx.recv() => match incoming {
                Some(Ok(msg)) => Work::Client(msg),
                Some(Err(e)) => {
                    report(&out_tx, &e);
                    continue;
                }
                None => break,
            },
            event = next_event(&mut session) => Work::Adapter(event),
        };

        tokio::select! {
            () = perform(&pipeline, &mut session, work, &out_tx) => {}
            _ = &mut hangup => {
                debug!("client hung up mid-request; abandoning it");
                break;
            }
        }
    }

    if let Some(ctx) = session.take() {
        let session_id = ctx.session_id().to_string();
        if let Err(e) = ctx.disconnect().await {
            warn!(%session_id, error = %e, "disconnect cleanup failed");
        }
    }
    drop(out_tx);
    reader.abort();
    let _ = writer.await;
    info!("client connection closed");
    Ok(())
}

/// One unit of work for the session loop.
enum Work {
    Client(ClientMessage),
    /// `None`: the adapter stream closed.
    Adapter(Option<Event>),
}

async fn next_event(session: &mut Option<SessionContext>) -> Option<Event> {
    match session.as_mut() {
        Some(ctx) => ctx.next_event().await,
        None => std::future::pending().await,
    }
}

async fn perform(
    pipeline: &Pipeline,
    session: &mut Option<SessionContext>,
    work: Work,
    out: &Outbox,
) {
    let event = match work {
        Work::Client(msg) => return handle_client_message(pipeline, session, msg, out).await,
        Work::Adapter(event) => event,
    };
    let Some(ctx) = session.as_mut() else {
        return;
    };
    match event {
        Some(event) => match ctx.handle_event(event, out).await {
            Ok(Flow::Continue) | Ok(Flow::Finished) => {}
            Err(e) => {
                if let Err(e) = ctx.on_error(e, out).await {
                    report(out, &e);
                }
            }
        },
        None => {
            if let Err(e) = ctx.adapter_closed(out).await {
                report(out, &e);
            }
        }
    }
}

async fn handle_client_message(
    pipeline: &Pipeline,
    session: &mut Option<SessionContext>,
    msg: ClientMessage,
    out: &Outbox,
) {
    match (session.as_mut(), msg) {
        (None, ClientMessage::Start(request)) => {
            // Owned by the connection before the launch awaits anything, so a
            // hangup mid-launch still releases whatever got bound.
            let ctx = match pipeline.open(request).await {
                Ok(ctx) => session.insert(ctx),
                Err(e) => return report(out, &e),
            };
            match ctx.launch(out).await {
                Ok(()) => {
                    info!(session_id = %ctx.session_id(), worker_id = ?ctx.worker_id(), "session started");
                }
                Err(e) => {
                    *session = None;
                    report(out, &e);
                }
            }
        }
        (None, _) => report(
            out,
            &RelayError::InvalidSessionState("no session; send debug:start first".to_string()),
        ),
        (Some(ctx), msg) => {
            if let Err(e) = ctx.handle_client(msg, out).await {
                if let Err(e) = ctx.on_error(e, out).await {
                    report(out, &e);
                }
            }
        }
    }
}

fn report(out: &Outbox, err: &RelayError) {
    warn!(kind = err.kind(), error = %err, "session error");
    let _ = out.send(ServerMessage::error(err));
}
