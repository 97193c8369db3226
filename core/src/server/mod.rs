//! Newline-delimited JSON server
//!
//! Each request line is handled on its own task. Responses and async events
//! share one writer task so lines never interleave. `cancel` fires the
//! cancellation token of an in-flight request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::errors::InteropResult;
use crate::events::AsyncEvent;
use crate::service::InteropService;
use crate::session::{Breakpoint, DebugCommand};

pub mod protocol;

#[cfg(test)]
mod tests;

use protocol::*;

type InFlight = Arc<Mutex<HashMap<String, CancellationToken>>>;

/// Serve requests from stdin until it closes or a `shutdown` request arrives
pub async fn serve(config: Config) -> Result<()> {
    let service = Arc::new(InteropService::start(config)?);
    serve_io(service, tokio::io::stdin(), tokio::io::stdout()).await
}

pub async fn serve_io<R, W>(service: Arc<InteropService>, input: R, output: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_lines(out_rx, output));
    let forwarder = tokio::spawn(forward_events(service.clone(), out_tx.clone()));
    let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));
    info!("Server listening");

    let mut shutdown_id = None;
    let mut lines = BufReader::new(input).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read request")? {
        if line.trim().is_empty() {
            continue;
        }
        let request = match serde_json::from_str::<Request>(&line) {
            Ok(request) => request,
            Err(err) => {
                warn!("Malformed request: {}", err);
                let error = ErrorBody::new(PARSE_ERROR, format!("parse error: {}", err));
                let _ = out_tx.send(Outgoing::reply(Value::Null, Err(error)));
                continue;
            }
        };
        debug!(method = %request.method, id = %request.id, "Request received");

        match request.method.as_str() {
            "shutdown" => {
                shutdown_id = Some(request.id);
                break;
            }
            "cancel" => {
                let outcome = cancel(&in_flight, request.params);
                let _ = out_tx.send(Outgoing::reply(request.id, outcome));
            }
            _ => {
                let token = CancellationToken::new();
                let key = request.id.to_string();
                in_flight
                    .lock()
                    .map_err(|_| anyhow::anyhow!("In-flight table poisoned"))?
                    .insert(key.clone(), token.clone());

                let service = service.clone();
                let out_tx = out_tx.clone();
                let in_flight = in_flight.clone();
                tokio::spawn(async move {
                    let outcome = dispatch(&service, &request.method, request.params, token).await;
                    if let Ok(mut table) = in_flight.lock() {
                        table.remove(&key);
                    }
                    let _ = out_tx.send(Outgoing::reply(request.id, outcome));
                });
            }
        }
    }

    info!("Shutting down");
    service.shutdown().await?;
    forwarder.await.context("Event forwarder failed")?;
    if let Some(id) = shutdown_id {
        let _ = out_tx.send(Outgoing::reply(id, done()));
    }
    drop(out_tx);
    writer.await.context("Writer task failed")??;
    Ok(())
}

fn cancel(in_flight: &InFlight, params: Value) -> Result<Value, ErrorBody> {
    let params: CancelParams = serde_json::from_value(params).map_err(ErrorBody::invalid_params)?;
    let token = in_flight
        .lock()
        .ok()
        .and_then(|table| table.get(&params.id.to_string()).cloned());
    match token {
        Some(token) => {
            token.cancel();
            Ok(json!(true))
        }
        None => Ok(json!(false)),
    }
}

async fn forward_events(service: Arc<InteropService>, out_tx: mpsc::UnboundedSender<Outgoing>) {
    while let Some(event) = service.next_event().await {
        let last = matches!(event, AsyncEvent::Termination);
        if out_tx.send(Outgoing::Event { event }).is_err() || last {
            break;
        }
    }
    debug!("Event forwarding finished");
}

async fn write_lines<W>(mut rx: mpsc::UnboundedReceiver<Outgoing>, mut output: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let mut line = serde_json::to_vec(&message).context("Failed to encode message")?;
        line.push(b'\n');
        output.write_all(&line).await.context("Failed to write message")?;
        output.flush().await.context("Failed to flush output")?;
    }
    Ok(())
}

/* ===================== Dispatch ===================== */

fn params<T: DeserializeOwned>(value: Value) -> Result<T, ErrorBody> {
    serde_json::from_value(value).map_err(ErrorBody::invalid_params)
}

fn encode<T: Serialize>(result: InteropResult<T>) -> Result<Value, ErrorBody> {
    let value = result?;
    serde_json::to_value(value).map_err(|err| ErrorBody::new(EVAL_ERROR, err.to_string()))
}

fn done() -> Result<Value, ErrorBody> {
    Ok(Value::Null)
}

async fn dispatch(
    service: &InteropService,
    method: &str,
    raw: Value,
    token: CancellationToken,
) -> Result<Value, ErrorBody> {
    let cancel = Some(token);
    match method {
        "inspect" => {
            let p: ReferenceParams = params(raw)?;
            encode(service.inspect(p.reference, cancel).await)
        }
        "value_info" => {
            let p: ReferenceParams = params(raw)?;
            encode(service.value_info(p.reference, cancel).await)
        }
        "evaluate_as_text" => {
            let p: ReferenceParams = params(raw)?;
            encode(service.evaluate_as_text(p.reference, cancel).await)
        }
        "evaluate_as_boolean" => {
            let p: ReferenceParams = params(raw)?;
            encode(service.evaluate_as_boolean(p.reference, cancel).await)
        }
        "load_object_names" => {
            let p: ReferenceParams = params(raw)?;
            encode(service.load_object_names(p.reference, cancel).await)
        }
        "load_variables" => {
            let p: VariablesParams = params(raw)?;
            encode(
                service
                    .load_variables(p.reference, p.start, p.end, cancel)
                    .await,
            )
        }
        "load_parent_envs" => {
            let p: ReferenceParams = params(raw)?;
            encode(service.load_parent_envs(p.reference, cancel).await)
        }
        "equality_object" => {
            let p: ReferenceParams = params(raw)?;
            encode(service.equality_object(p.reference, cancel).await)
        }
        "distinct_strings" => {
            let p: ReferenceParams = params(raw)?;
            encode(service.distinct_strings(p.reference, cancel).await)
        }
        "register_handle" => {
            let p: ReferenceParams = params(raw)?;
            encode(service.register_handle(p.reference, cancel).await)
        }
        "clear_environment" => {
            let p: ReferenceParams = params(raw)?;
            encode(service.clear_environment(p.reference, cancel).await)
        }
        "set_value" => {
            let p: SetValueParams = params(raw)?;
            encode(service.set_value(p.target, p.source, cancel).await)
        }
        "execute_code" => {
            let p: CodeParams = params(raw)?;
            encode(service.execute_code(p.code, cancel).await)
        }
        "has_handle" => {
            let p: HandleParams = params(raw)?;
            encode(service.has_handle(p.handle).await)
        }
        "remove_handles" => {
            let p: HandlesParams = params(raw)?;
            encode(service.remove_handles(p.handles).await)
        }
        "last_error_stack" => encode(service.last_error_stack().await),
        "debug_stack" => encode(service.debug_stack().await),
        "is_busy" => Ok(json!(service.is_busy())),
        "state" => Ok(json!(service.state())),
        "send_line" => {
            let p: LineParams = params(raw)?;
            service.send_line(p.line);
            done()
        }
        "send_end_of_input" => {
            service.send_end_of_input();
            done()
        }
        "repl_execute" => {
            let p: ReplExecuteParams = params(raw)?;
            service.repl_execute(p.code, p.source, p.debug);
            done()
        }
        "interrupt" => {
            service.interrupt();
            done()
        }
        "debug_command" => {
            let command: DebugCommand = params(raw)?;
            service.debug_command(command);
            done()
        }
        "add_or_modify_breakpoint" => {
            let breakpoint: Breakpoint = params(raw)?;
            service.add_or_modify_breakpoint(breakpoint);
            done()
        }
        "remove_breakpoint" => {
            let p: PositionParams = params(raw)?;
            Ok(json!(service.remove_breakpoint(&p.position)))
        }
        "mute_breakpoints" => {
            let p: MuteParams = params(raw)?;
            service.mute_breakpoints(p.muted);
            done()
        }
        "client_request_finished" => {
            let p: RequestFinishedParams = params(raw)?;
            Ok(json!(service.client_request_finished(p.request_id)))
        }
        other => Err(ErrorBody::new(
            METHOD_NOT_FOUND,
            format!("method not found: {}", other),
        )),
    }
}
