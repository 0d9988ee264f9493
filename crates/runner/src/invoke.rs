//! Generic invocation of resolved methods

use futures::channel::oneshot;
use futures::{future, stream, Stream, StreamExt};
use prost_reflect::DynamicMessage;
use serde_json::Value;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tonic::client::Grpc;
use tonic::codec::Streaming;
use tonic::metadata::MetadataMap;
use tonic::transport::Channel;
use tracing::{debug, info};

use crate::codec::DynamicCodec;
use crate::descriptor::ResolvedMethod;
use crate::error::{RunnerError, RunnerResult};

/// Call shape derived from the two streaming flags of a method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingShape {
    Unary,
    ClientStream,
    ServerStream,
    BidiStream,
}

impl StreamingShape {
    pub fn from_flags(client_streaming: bool, server_streaming: bool) -> Self {
        match (client_streaming, server_streaming) {
            (false, false) => StreamingShape::Unary,
            (true, false) => StreamingShape::ClientStream,
            (false, true) => StreamingShape::ServerStream,
            (true, true) => StreamingShape::BidiStream,
        }
    }

    pub fn is_streaming(self) -> bool {
        self != StreamingShape::Unary
    }
}

/// Decode a JSON payload into request messages.
///
/// Unary methods take one object (empty text is the default message); every
/// streaming shape takes an array, and server streaming takes exactly one
/// element.
pub fn decode_payload(method: &ResolvedMethod, payload: &str) -> RunnerResult<Vec<DynamicMessage>> {
    let shape = method.shape();
    let payload = payload.trim();

    if shape == StreamingShape::Unary {
        if payload.is_empty() {
            return Ok(vec![DynamicMessage::new(method.input())]);
        }
        return match serde_json::from_str::<Value>(payload)? {
            value @ Value::Object(_) => Ok(vec![decode_message(method, value)?]),
            other => Err(RunnerError::Format(format!(
                "{} expects a JSON object, got {}",
                method.full_name(),
                crate::compare::type_name(&other)
            ))),
        };
    }

    let items = match serde_json::from_str::<Value>(payload) {
        Ok(Value::Array(items)) => items,
        _ => {
            return Err(RunnerError::Format(format!(
                "{} is a streaming method and expects a JSON array",
                method.full_name()
            )))
        }
    };

    if shape == StreamingShape::ServerStream && items.len() != 1 {
        return Err(RunnerError::Format(format!(
            "{} takes exactly one request message, got {}",
            method.full_name(),
            items.len()
        )));
    }

    items
        .into_iter()
        .map(|item| decode_message(method, item))
        .collect()
}

fn decode_message(method: &ResolvedMethod, value: Value) -> RunnerResult<DynamicMessage> {
    DynamicMessage::deserialize(method.input(), value).map_err(|e| {
        RunnerError::Decode(format!("{}: {}", method.input().full_name(), e))
    })
}

/// Invoke `method` on `channel` and return each reply as protobuf JSON.
///
/// The payload is decoded before any network traffic.
pub async fn invoke(
    channel: Channel,
    method: &ResolvedMethod,
    payload: &str,
    metadata: &MetadataMap,
    cancel: &CancellationToken,
) -> RunnerResult<Vec<String>> {
    let messages = decode_payload(method, payload)?;
    let path = method.path()?;
    let codec = DynamicCodec::new(method.output());
    let shape = method.shape();

    info!(method = method.full_name(), ?shape, messages = messages.len(), "invoking");

    let mut grpc = Grpc::new(channel);
    race(cancel, grpc.ready())
        .await?
        .map_err(|e| RunnerError::Connect {
            addr: path.to_string(),
            reason: e.to_string(),
        })?;

    match shape {
        StreamingShape::Unary => {
            let message = messages
                .into_iter()
                .next()
                .unwrap_or_else(|| DynamicMessage::new(method.input()));
            let response = race(cancel, grpc.unary(request(message, metadata), path, codec))
                .await?
                .map_err(RunnerError::transport)?;
            Ok(vec![render(&response.into_inner())?])
        }
        StreamingShape::ClientStream => {
            let (drained, _) = oneshot::channel();
            let outbound = outbound(messages, cancel.clone(), drained);
            let response = race(cancel, grpc.client_streaming(request(outbound, metadata), path, codec))
                .await?
                .map_err(RunnerError::transport)?;
            Ok(vec![render(&response.into_inner())?])
        }
        StreamingShape::ServerStream => {
            let message = messages
                .into_iter()
                .next()
                .ok_or_else(|| RunnerError::Format("missing request message".to_string()))?;
            let response = race(cancel, grpc.server_streaming(request(message, metadata), path, codec))
                .await?
                .map_err(RunnerError::transport)?;
            receive_all(response.into_inner(), cancel).await
        }
        StreamingShape::BidiStream => {
            let (drained, sent) = oneshot::channel();
            let outbound = outbound(messages, cancel.clone(), drained);
            let response = race(cancel, grpc.streaming(request(outbound, metadata), path, codec))
                .await?
                .map_err(RunnerError::transport)?;

            // receive only once every request has been handed to the transport
            let _ = race(cancel, sent).await?;
            receive_all(response.into_inner(), cancel).await
        }
    }
}

fn request<T>(message: T, metadata: &MetadataMap) -> tonic::Request<T> {
    let mut request = tonic::Request::new(message);
    *request.metadata_mut() = metadata.clone();
    request
}

/// Requests in declared order. Stops early once `cancel` fires and signals
/// `drained` when exhausted.
fn outbound(
    messages: Vec<DynamicMessage>,
    cancel: CancellationToken,
    drained: oneshot::Sender<()>,
) -> impl Stream<Item = DynamicMessage> + Send + 'static {
    let total = messages.len();
    let sends = stream::iter(messages.into_iter().enumerate())
        .take_while(move |_| future::ready(!cancel.is_cancelled()))
        .map(move |(index, message)| {
            debug!(index, total, "sending stream message");
            message
        });

    let done = stream::once(async move {
        let _ = drained.send(());
    })
    .filter_map(|_| future::ready(None::<DynamicMessage>));

    sends.chain(done)
}

async fn receive_all(
    mut inbound: Streaming<DynamicMessage>,
    cancel: &CancellationToken,
) -> RunnerResult<Vec<String>> {
    let mut responses = Vec::new();
    loop {
        match race(cancel, inbound.message()).await? {
            Ok(Some(message)) => responses.push(render(&message)?),
            Ok(None) => return Ok(responses),
            Err(status) => {
                return Err(RunnerError::Transport {
                    status,
                    partial: responses,
                })
            }
        }
    }
}

async fn race<F: Future>(cancel: &CancellationToken, fut: F) -> RunnerResult<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RunnerError::Cancelled),
        output = fut => Ok(output),
    }
}

fn render(message: &DynamicMessage) -> RunnerResult<String> {
    Ok(serde_json::to_string(message)?)
}
