//! `grpc.reflection.v1` client that assembles descriptor pools

use futures::channel::mpsc;
use prost::Message;
use prost_reflect::DescriptorPool;
use prost_types::FileDescriptorProto;
use protox::file::{ChainFileResolver, GoogleFileResolver};
use protox::Compiler;
use std::collections::{BTreeMap, HashSet};
use tonic::codec::{ProstCodec, Streaming};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;
use tonic::{Code, Status};
use tonic_reflection::pb::v1::server_reflection_request::MessageRequest;
use tonic_reflection::pb::v1::server_reflection_response::MessageResponse;
use tonic_reflection::pb::v1::{ServerReflectionRequest, ServerReflectionResponse};
use tracing::debug;

use crate::error::{RunnerError, RunnerResult};
use crate::protolib::BundledFileResolver;

const REFLECTION_PATH: &str = "/grpc.reflection.v1.ServerReflection/ServerReflectionInfo";

/// One reflection session over a single bidirectional stream
pub struct ReflectionClient {
    channel: Channel,
    outbound: mpsc::UnboundedSender<ServerReflectionRequest>,
    pending: Option<mpsc::UnboundedReceiver<ServerReflectionRequest>>,
    inbound: Option<Streaming<ServerReflectionResponse>>,
}

impl ReflectionClient {
    pub fn new(channel: Channel) -> Self {
        let (outbound, pending) = mpsc::unbounded();
        Self {
            channel,
            outbound,
            pending: Some(pending),
            inbound: None,
        }
    }

    /// Names of every service the peer exposes
    pub async fn list_services(&mut self) -> RunnerResult<Vec<String>> {
        match self.request(MessageRequest::ListServices(String::new())).await? {
            MessageResponse::ListServicesResponse(list) => {
                Ok(list.service.into_iter().map(|s| s.name).collect())
            }
            other => Err(unexpected(other)),
        }
    }

    /// Pool holding the file that declares `symbol` and all its dependencies
    pub async fn file_containing_symbol(&mut self, symbol: &str) -> RunnerResult<DescriptorPool> {
        let mut files = BTreeMap::new();
        self.fetch_symbol(symbol, &mut files).await?;
        self.fetch_dependencies(&mut files).await?;
        build_pool(files)
    }

    /// Pool holding every service the peer exposes, reflection excluded
    pub async fn all_services(&mut self) -> RunnerResult<DescriptorPool> {
        let mut files = BTreeMap::new();
        for service in self.list_services().await? {
            if service.starts_with("grpc.reflection.") {
                continue;
            }
            self.fetch_symbol(&service, &mut files).await?;
        }
        self.fetch_dependencies(&mut files).await?;
        build_pool(files)
    }

    async fn fetch_symbol(
        &mut self,
        symbol: &str,
        files: &mut BTreeMap<String, FileDescriptorProto>,
    ) -> RunnerResult<()> {
        debug!(symbol, "requesting file containing symbol");
        let response = self
            .request(MessageRequest::FileContainingSymbol(symbol.to_string()))
            .await
            .map_err(|e| not_found_as(e, symbol))?;
        collect_files(response, files)
    }

    async fn fetch_dependencies(
        &mut self,
        files: &mut BTreeMap<String, FileDescriptorProto>,
    ) -> RunnerResult<()> {
        loop {
            let missing: Vec<String> = files
                .values()
                .flat_map(|f| f.dependency.iter())
                .filter(|dep| !files.contains_key(*dep))
                .cloned()
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();

            if missing.is_empty() {
                return Ok(());
            }

            for dep in missing {
                if let Some(local) = well_known_files(&dep) {
                    for file in local {
                        files.entry(file.name().to_string()).or_insert(file);
                    }
                    continue;
                }

                debug!(file = %dep, "requesting dependency by name");
                let response = self
                    .request(MessageRequest::FileByFilename(dep.clone()))
                    .await
                    .map_err(|e| not_found_as(e, &dep))?;
                collect_files(response, files)?;

                if !files.contains_key(&dep) {
                    return Err(RunnerError::NotFound(format!("file {}", dep)));
                }
            }
        }
    }

    async fn request(&mut self, message: MessageRequest) -> RunnerResult<MessageResponse> {
        self.outbound
            .unbounded_send(ServerReflectionRequest {
                host: String::new(),
                message_request: Some(message),
            })
            .map_err(|_| RunnerError::transport(Status::unavailable("reflection stream closed")))?;

        if self.inbound.is_none() {
            self.open().await?;
        }

        let inbound = match self.inbound.as_mut() {
            Some(inbound) => inbound,
            None => return Err(RunnerError::transport(Status::internal("reflection stream not open"))),
        };

        let response = inbound
            .message()
            .await
            .map_err(status_error)?
            .ok_or_else(|| RunnerError::transport(Status::unavailable("reflection stream ended")))?;

        match response.message_response {
            Some(MessageResponse::ErrorResponse(err)) => {
                let code = Code::from(err.error_code);
                if code == Code::NotFound {
                    Err(RunnerError::NotFound(err.error_message))
                } else {
                    Err(RunnerError::transport(Status::new(code, err.error_message)))
                }
            }
            Some(message) => Ok(message),
            None => Err(RunnerError::transport(Status::internal("empty reflection response"))),
        }
    }

    async fn open(&mut self) -> RunnerResult<()> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| RunnerError::transport(Status::internal("reflection stream already used")))?;

        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready().await.map_err(|e| RunnerError::Connect {
            addr: String::new(),
            reason: e.to_string(),
        })?;

        let codec: ProstCodec<ServerReflectionRequest, ServerReflectionResponse> = ProstCodec::default();
        let response = grpc
            .streaming(
                tonic::Request::new(pending),
                PathAndQuery::from_static(REFLECTION_PATH),
                codec,
            )
            .await
            .map_err(status_error)?;

        self.inbound = Some(response.into_inner());
        Ok(())
    }
}

/// tonic peers end the stream with `NOT_FOUND` for an unknown symbol or
/// file instead of replying with an `ErrorResponse`
fn status_error(status: Status) -> RunnerError {
    match status.code() {
        Code::Unimplemented => RunnerError::ReflectionUnsupported(status.message().to_string()),
        Code::NotFound => RunnerError::NotFound(status.message().to_string()),
        _ => RunnerError::transport(status),
    }
}

fn not_found_as(err: RunnerError, what: &str) -> RunnerError {
    match err {
        RunnerError::NotFound(_) => RunnerError::NotFound(what.to_string()),
        other => other,
    }
}

fn unexpected(response: MessageResponse) -> RunnerError {
    RunnerError::transport(Status::internal(format!(
        "unexpected reflection response: {:?}",
        response
    )))
}

fn collect_files(
    response: MessageResponse,
    files: &mut BTreeMap<String, FileDescriptorProto>,
) -> RunnerResult<()> {
    let MessageResponse::FileDescriptorResponse(response) = response else {
        return Err(unexpected(response));
    };

    for bytes in response.file_descriptor_proto {
        let file = FileDescriptorProto::decode(bytes.as_slice())
            .map_err(|e| RunnerError::Decode(format!("file descriptor: {}", e)))?;
        files.entry(file.name().to_string()).or_insert(file);
    }
    Ok(())
}

/// Well-known and bundled files compiled locally instead of asking the peer
fn well_known_files(name: &str) -> Option<Vec<FileDescriptorProto>> {
    if !name.starts_with("google/protobuf/") && !BundledFileResolver::contains(name) {
        return None;
    }

    let mut resolver = ChainFileResolver::new();
    resolver.add(BundledFileResolver);
    resolver.add(GoogleFileResolver::new());

    let mut compiler = Compiler::with_file_resolver(resolver);
    compiler.include_imports(true);
    compiler.open_file(name).ok()?;
    Some(compiler.file_descriptor_set().file)
}

/// Add files so that every dependency precedes its dependents
fn build_pool(files: BTreeMap<String, FileDescriptorProto>) -> RunnerResult<DescriptorPool> {
    let mut pool = DescriptorPool::new();
    let mut added = HashSet::new();

    fn visit(
        name: &str,
        files: &BTreeMap<String, FileDescriptorProto>,
        added: &mut HashSet<String>,
        visiting: &mut HashSet<String>,
        pool: &mut DescriptorPool,
    ) -> RunnerResult<()> {
        if added.contains(name) {
            return Ok(());
        }
        if !visiting.insert(name.to_string()) {
            return Err(RunnerError::Decode(format!("import cycle through {}", name)));
        }

        let file = files
            .get(name)
            .ok_or_else(|| RunnerError::NotFound(format!("file {}", name)))?;
        for dep in &file.dependency {
            visit(dep, files, added, visiting, pool)?;
        }

        pool.add_file_descriptor_proto(file.clone())
            .map_err(|e| RunnerError::Decode(e.to_string()))?;
        added.insert(name.to_string());
        Ok(())
    }

    let mut visiting = HashSet::new();
    for name in files.keys() {
        visit(name, &files, &mut added, &mut visiting, &mut pool)?;
    }
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, deps: &[&str]) -> FileDescriptorProto {
        FileDescriptorProto {
            name: Some(name.to_string()),
            package: Some("pkg".to_string()),
            dependency: deps.iter().map(|d| d.to_string()).collect(),
            syntax: Some("proto3".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_status_error_mapping() {
        let err = status_error(Status::not_found("symbol 'server.Nope' not found"));
        assert!(matches!(err, RunnerError::NotFound(_)));
        assert!(matches!(
            not_found_as(err, "server.Nope"),
            RunnerError::NotFound(what) if what == "server.Nope"
        ));

        assert!(matches!(
            status_error(Status::unimplemented("")),
            RunnerError::ReflectionUnsupported(_)
        ));
        assert!(matches!(
            status_error(Status::unavailable("down")),
            RunnerError::Transport { .. }
        ));
    }

    #[test]
    fn test_build_pool_orders_dependencies() {
        let mut files = BTreeMap::new();
        files.insert("a.proto".to_string(), file("a.proto", &["b.proto"]));
        files.insert("b.proto".to_string(), file("b.proto", &["c.proto"]));
        files.insert("c.proto".to_string(), file("c.proto", &[]));

        let pool = build_pool(files).unwrap();
        assert_eq!(pool.files().len(), 3);
    }

    #[test]
    fn test_build_pool_missing_dependency() {
        let mut files = BTreeMap::new();
        files.insert("a.proto".to_string(), file("a.proto", &["gone.proto"]));
        assert!(matches!(build_pool(files), Err(RunnerError::NotFound(_))));
    }

    #[test]
    fn test_well_known_files_are_local() {
        let files = well_known_files("google/protobuf/empty.proto").unwrap();
        assert!(files.iter().any(|f| f.name() == "google/protobuf/empty.proto"));
        assert!(well_known_files("server.proto").is_none());

        let files = well_known_files("google/api/annotations.proto").unwrap();
        assert!(files.iter().any(|f| f.name() == "google/protobuf/descriptor.proto"));
    }
}
