//! In-process gRPC target shared by the integration tests

#![allow(dead_code)]

use futures::{stream, Stream, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::codec::{ProstCodec, Streaming};
use tonic::codegen::{empty_body, http, Body, BoxFuture, Context, Poll, Service, StdError};
use tonic::server::{
    ClientStreamingService, Grpc, NamedService, ServerStreamingService, StreamingService,
    UnaryService,
};
use tonic::transport::{Channel, Endpoint, Server};
use tonic::{Request, Response, Status};

pub const VERSION: &str = "v0.0.2";
pub const COMMIT: &str = "abc";
pub const TOKEN: &str = "Bearer token";

pub const SERVER_PROTO: &str = r#"
syntax = "proto3";

package server;

import "google/protobuf/empty.proto";
import "message.proto";

service Runner {
  rpc GetVersion(google.protobuf.Empty) returns (Version) {}
  rpc Upload(stream Msg) returns (Msg) {}
  rpc Watch(Msg) returns (stream Msg) {}
  rpc Chat(stream Msg) returns (stream Msg) {}
  rpc Hang(google.protobuf.Empty) returns (google.protobuf.Empty) {}
}

message Version {
  string version = 1;
  string commit = 2;
}
"#;

/// A second user file so reflection has to fetch a dependency by name
pub const MESSAGE_PROTO: &str = r#"
syntax = "proto3";

package server;

message Msg {
  int32 msgID = 1;
  string body = 2;
}
"#;

#[derive(Clone, PartialEq, prost::Message)]
pub struct Empty {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Version {
    #[prost(string, tag = "1")]
    pub version: String,
    #[prost(string, tag = "2")]
    pub commit: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Msg {
    #[prost(int32, tag = "1")]
    pub msg_id: i32,
    #[prost(string, tag = "2")]
    pub body: String,
}

type MsgStream = Pin<Box<dyn Stream<Item = Result<Msg, Status>> + Send + 'static>>;

/// `server.proto` and `message.proto` written to a temporary import root
pub struct ProtoDir {
    pub dir: TempDir,
}

impl ProtoDir {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("server.proto"), SERVER_PROTO).unwrap();
        std::fs::write(dir.path().join("message.proto"), MESSAGE_PROTO).unwrap();
        Self { dir }
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }

    pub fn file(&self) -> PathBuf {
        self.dir.path().join("server.proto")
    }

    pub fn descriptor_set(&self) -> prost_types::FileDescriptorSet {
        let mut compiler = protox::Compiler::new([self.dir.path()]).unwrap();
        compiler.include_imports(true);
        compiler.open_file("server.proto").unwrap();
        compiler.file_descriptor_set()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ServerOptions {
    pub reflection: bool,
    pub require_auth: bool,
}

/// A running target; shut down on drop
pub struct TestServer {
    pub addr: SocketAddr,
    pub proto: ProtoDir,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    pub async fn start(options: ServerOptions) -> Self {
        apitest_common::logging::init(false);

        let proto = ProtoDir::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let reflection = options.reflection.then(|| {
            tonic_reflection::server::Builder::configure()
                .register_file_descriptor_set(proto.descriptor_set())
                .build_v1()
                .unwrap()
        });

        let service = RunnerService {
            require_auth: options.require_auth,
        };
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let handle = tokio::spawn(async move {
            Server::builder()
                .add_service(service)
                .add_optional_service(reflection)
                .serve_with_incoming_shutdown(incoming(listener), async move {
                    token.cancelled().await
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            proto,
            shutdown,
            handle: Some(handle),
        }
    }

    pub async fn channel(&self) -> Channel {
        Endpoint::from_shared(format!("http://{}", self.addr))
            .unwrap()
            .connect()
            .await
            .unwrap()
    }

    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn incoming(
    listener: TcpListener,
) -> Pin<Box<dyn Stream<Item = std::io::Result<TcpStream>> + Send>> {
    Box::pin(stream::unfold(listener, |listener| async move {
        let accepted = listener.accept().await.map(|(socket, _)| socket);
        Some((accepted, listener))
    }))
}

#[derive(Debug, Clone, Default)]
struct RunnerService {
    require_auth: bool,
}

impl NamedService for RunnerService {
    const NAME: &'static str = "server.Runner";
}

impl<B> Service<http::Request<B>> for RunnerService
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::BoxBody>;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let require_auth = self.require_auth;
        match req.uri().path() {
            "/server.Runner/GetVersion" => Box::pin(async move {
                let mut grpc = Grpc::new(ProstCodec::default());
                Ok(grpc.unary(GetVersion { require_auth }, req).await)
            }),
            "/server.Runner/Upload" => Box::pin(async move {
                let mut grpc = Grpc::new(ProstCodec::default());
                Ok(grpc.client_streaming(Upload, req).await)
            }),
            "/server.Runner/Watch" => Box::pin(async move {
                let mut grpc = Grpc::new(ProstCodec::default());
                Ok(grpc.server_streaming(Watch, req).await)
            }),
            "/server.Runner/Chat" => Box::pin(async move {
                let mut grpc = Grpc::new(ProstCodec::default());
                Ok(grpc.streaming(Chat, req).await)
            }),
            "/server.Runner/Hang" => Box::pin(async move {
                let mut grpc = Grpc::new(ProstCodec::default());
                Ok(grpc.unary(Hang, req).await)
            }),
            _ => Box::pin(async move {
                let mut response = http::Response::new(empty_body());
                let headers = response.headers_mut();
                headers.insert("grpc-status", http::HeaderValue::from_static("12"));
                headers.insert(
                    http::header::CONTENT_TYPE,
                    http::HeaderValue::from_static("application/grpc"),
                );
                Ok(response)
            }),
        }
    }
}

struct GetVersion {
    require_auth: bool,
}

impl UnaryService<Empty> for GetVersion {
    type Response = Version;
    type Future = BoxFuture<Response<Version>, Status>;

    fn call(&mut self, request: Request<Empty>) -> Self::Future {
        let authorized = !self.require_auth
            || request
                .metadata()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                == Some(TOKEN);

        Box::pin(async move {
            if !authorized {
                return Err(Status::unauthenticated("invalid token"));
            }
            Ok(Response::new(Version {
                version: VERSION.to_string(),
                commit: COMMIT.to_string(),
            }))
        })
    }
}

/// Replies once with the message count and the joined bodies
struct Upload;

impl ClientStreamingService<Msg> for Upload {
    type Response = Msg;
    type Future = BoxFuture<Response<Msg>, Status>;

    fn call(&mut self, request: Request<Streaming<Msg>>) -> Self::Future {
        Box::pin(async move {
            let mut inbound = request.into_inner();
            let mut bodies = Vec::new();
            while let Some(msg) = inbound.message().await? {
                bodies.push(msg.body);
            }
            Ok(Response::new(Msg {
                msg_id: bodies.len() as i32,
                body: bodies.join(","),
            }))
        })
    }
}

/// Three messages counting up from the request id; body `fail` errors after
/// the first one
struct Watch;

impl ServerStreamingService<Msg> for Watch {
    type Response = Msg;
    type ResponseStream = MsgStream;
    type Future = BoxFuture<Response<MsgStream>, Status>;

    fn call(&mut self, request: Request<Msg>) -> Self::Future {
        let msg = request.into_inner();
        let mut items: Vec<Result<Msg, Status>> = (0..3)
            .map(|i| {
                Ok(Msg {
                    msg_id: msg.msg_id + i,
                    body: msg.body.clone(),
                })
            })
            .collect();
        if msg.body == "fail" {
            items.truncate(1);
            items.push(Err(Status::internal("watch failed")));
        }

        let stream: MsgStream = Box::pin(stream::iter(items));
        Box::pin(async move { Ok(Response::new(stream)) })
    }
}

/// Echoes every message
struct Chat;

impl StreamingService<Msg> for Chat {
    type Response = Msg;
    type ResponseStream = MsgStream;
    type Future = BoxFuture<Response<MsgStream>, Status>;

    fn call(&mut self, request: Request<Streaming<Msg>>) -> Self::Future {
        let stream: MsgStream = Box::pin(request.into_inner().map(|item| {
            item.map(|msg| Msg {
                msg_id: msg.msg_id,
                body: format!("echo: {}", msg.body),
            })
        }));
        Box::pin(async move { Ok(Response::new(stream)) })
    }
}

struct Hang;

impl UnaryService<Empty> for Hang {
    type Response = Empty;
    type Future = BoxFuture<Response<Empty>, Status>;

    fn call(&mut self, _request: Request<Empty>) -> Self::Future {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Response::new(Empty {}))
        })
    }
}
