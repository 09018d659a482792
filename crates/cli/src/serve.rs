//! Daemon mode – newline-delimited JSON requests over a Unix socket.
//!
//! One context stays resident for the life of the daemon, so engine state
//! carries over between requests and connections. On shutdown the daemon
//! stops accepting, lets open connections finish their current request and
//! drops the context, which deletes the extracted module.

use pbf_engine::types::*;
use pbf_engine::{CommandRegistry, PbfContext};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

pub async fn run_daemon(
    socket_path: PathBuf,
    ctx: Arc<PbfContext>,
    registry: Arc<CommandRegistry>,
) -> anyhow::Result<()> {
    // Remove stale socket if it exists
    let _ = std::fs::remove_file(&socket_path);

    let listener = UnixListener::bind(&socket_path).map_err(|e| {
        anyhow::anyhow!("cannot bind socket {}: {}", socket_path.display(), e)
    })?;
    tracing::info!(socket = %socket_path.display(), "pbfctl daemon listening");

    serve(listener, ctx, registry, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await;

    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}

/// Accept connections until `shutdown` resolves, then let every connection
/// finish the request it is handling. Each connection holds a clone of
/// `ctx`; all of them are released before this returns.
pub async fn serve(
    listener: UnixListener,
    ctx: Arc<PbfContext>,
    registry: Arc<CommandRegistry>,
    shutdown: impl Future<Output = ()>,
) {
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut connections = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    connections.spawn(serve_connection(
                        stream,
                        ctx.clone(),
                        registry.clone(),
                        stop_rx.clone(),
                    ));
                }
                Err(e) => tracing::warn!(error = %e, "accept error"),
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                log_join(joined);
            }
            _ = &mut shutdown => {
                tracing::info!(open = connections.len(), "shutting down daemon");
                break;
            }
        }
    }

    drop(listener);
    let _ = stop_tx.send(true);
    while let Some(joined) = connections.join_next().await {
        log_join(joined);
    }
    tracing::debug!(holders = Arc::strong_count(&ctx), "connections drained");
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::warn!(error = %e, "connection task failed");
    }
}

async fn serve_connection(
    stream: UnixStream,
    ctx: Arc<PbfContext>,
    registry: Arc<CommandRegistry>,
    mut stop: watch::Receiver<bool>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = tokio::select! {
            next = lines.next_line() => match next {
                Ok(Some(line)) => line,
                _ => break,
            },
            _ = stop.changed() => break,
        };
        let ctx = ctx.clone();
        let registry = registry.clone();
        // native calls block, keep them off the reactor
        let response =
            match tokio::task::spawn_blocking(move || handle_request(&line, &ctx, &registry)).await {
                Ok(r) => r,
                Err(e) => error_response("unknown".into(), ErrorCode::InternalError, e.to_string()),
            };
        let mut resp_json = serde_json::to_string(&response).unwrap_or_else(|_| "{}".into());
        resp_json.push('\n');
        if writer.write_all(resp_json.as_bytes()).await.is_err() {
            break;
        }
    }
}

fn error_response(id: String, code: ErrorCode, message: String) -> DaemonResponse {
    DaemonResponse {
        id,
        result: None,
        error: Some(ErrorInfo {
            code,
            message,
            details: serde_json::Value::Null,
        }),
    }
}

fn handle_request(line: &str, ctx: &PbfContext, registry: &CommandRegistry) -> DaemonResponse {
    let req: DaemonRequest = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            return error_response(
                "unknown".into(),
                ErrorCode::InvalidInput,
                format!("invalid JSON request: {}", e),
            );
        }
    };

    let result = match req.method.as_str() {
        "call" => {
            let cmd_name = req.params.get("cmd").and_then(|v| v.as_str()).unwrap_or("");
            let args = req
                .params
                .get("args")
                .cloned()
                .unwrap_or(serde_json::Value::Object(Default::default()));
            registry.execute(cmd_name, args, ctx)
        }
        "probe" => {
            let target = req
                .params
                .get("target")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            pbf_engine::probes::run_probe(target, ctx)
        }
        "doctor" => pbf_engine::doctor::run_doctor(ctx),
        other => {
            return error_response(
                req.id,
                ErrorCode::InvalidInput,
                format!("unknown method: {}", other),
            );
        }
    };

    DaemonResponse {
        id: req.id,
        result: Some(result),
        error: None,
    }
}
