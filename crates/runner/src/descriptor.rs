//! Runtime protobuf descriptor resolution

use apitest_common::RpcDesc;
use prost_reflect::{DescriptorPool, MessageDescriptor, MethodDescriptor};
use protox::file::{ChainFileResolver, GoogleFileResolver, IncludeFileResolver};
use protox::Compiler;
use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;
use tracing::{debug, info};

use crate::error::{RunnerError, RunnerResult};
use crate::invoke::StreamingShape;
use crate::protolib::{BundledFileResolver, InlineFileResolver, INLINE_FILE_NAME};
use crate::reflection::ReflectionClient;

/// A parsed `request.api` value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiName {
    /// Peer address when given as `host:port/pkg.Service/Method`
    pub host: Option<String>,
    /// Fully qualified service name
    pub service: String,
    pub method: String,
}

impl ApiName {
    /// Accepts `pkg.Service.Method`, `pkg.Service/Method`,
    /// `/pkg.Service/Method` and `host:port/pkg.Service/Method`
    pub fn parse(api: &str) -> RunnerResult<Self> {
        let invalid = || RunnerError::Format(format!("invalid api name {:?}", api));

        let (host, service, method) = if api.contains('/') {
            let parts: Vec<&str> = api.split('/').collect();
            match parts.as_slice() {
                ["", service, method] => (None, *service, *method),
                [host, service, method] => (Some(*host), *service, *method),
                [service, method] => (None, *service, *method),
                _ => return Err(invalid()),
            }
        } else {
            let (service, method) = api.rsplit_once('.').ok_or_else(invalid)?;
            (None, service, method)
        };

        if service.is_empty()
            || method.is_empty()
            || service.split('.').any(str::is_empty)
            || method.contains('.')
            || host.map_or(false, str::is_empty)
        {
            return Err(invalid());
        }

        Ok(Self {
            host: host.map(str::to_string),
            service: service.to_string(),
            method: method.to_string(),
        })
    }

    /// `pkg.Service.Method`
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.service, self.method)
    }

    /// `/pkg.Service/Method`
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }
}

impl fmt::Display for ApiName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name())
    }
}

/// Where descriptors come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcSource {
    /// Ask the target through `grpc.reflection.v1`
    ServerReflection,
    /// A serialized `FileDescriptorSet`, as a local path or http(s) URL
    CompiledSet(String),
    /// Proto source text
    InlineRaw(String),
    /// A proto file plus the roots its imports resolve against. `path` may be
    /// an http(s) URL of a single proto or of a zip archive; `?file=` names
    /// the entry inside an archive.
    FileWithImports {
        path: PathBuf,
        import_paths: Vec<PathBuf>,
    },
}

impl RpcSource {
    /// Pick one source. Precedence: reflection, compiled set, inline text,
    /// proto file.
    pub fn from_desc(desc: &RpcDesc) -> RunnerResult<Self> {
        if desc.server_reflection {
            Ok(RpcSource::ServerReflection)
        } else if !desc.proto_set.is_empty() {
            Ok(RpcSource::CompiledSet(desc.proto_set.clone()))
        } else if !desc.raw.trim().is_empty() {
            Ok(RpcSource::InlineRaw(desc.raw.clone()))
        } else if !desc.proto_file.is_empty() {
            Ok(RpcSource::FileWithImports {
                path: PathBuf::from(&desc.proto_file),
                import_paths: desc.import_path.iter().map(PathBuf::from).collect(),
            })
        } else {
            Err(RunnerError::MissingDescriptorSource)
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RpcSource::ServerReflection => "reflection",
            RpcSource::CompiledSet(_) => "protoset",
            RpcSource::InlineRaw(_) => "raw",
            RpcSource::FileWithImports { .. } => "protofile",
        }
    }
}

/// A method found in a descriptor pool
#[derive(Debug, Clone)]
pub struct ResolvedMethod {
    descriptor: MethodDescriptor,
}

impl ResolvedMethod {
    pub fn new(descriptor: MethodDescriptor) -> Self {
        Self { descriptor }
    }

    pub fn service_name(&self) -> String {
        self.descriptor.parent_service().full_name().to_string()
    }

    pub fn method_name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn full_name(&self) -> &str {
        self.descriptor.full_name()
    }

    pub fn input(&self) -> MessageDescriptor {
        self.descriptor.input()
    }

    pub fn output(&self) -> MessageDescriptor {
        self.descriptor.output()
    }

    pub fn streaming_client(&self) -> bool {
        self.descriptor.is_client_streaming()
    }

    pub fn streaming_server(&self) -> bool {
        self.descriptor.is_server_streaming()
    }

    pub fn shape(&self) -> StreamingShape {
        StreamingShape::from_flags(self.streaming_client(), self.streaming_server())
    }

    /// HTTP/2 path of the call
    pub fn path(&self) -> RunnerResult<PathAndQuery> {
        let path = format!("/{}/{}", self.service_name(), self.method_name());
        PathAndQuery::try_from(path.as_str())
            .map_err(|e| RunnerError::Format(format!("invalid method path {:?}: {}", path, e)))
    }

    pub fn descriptor(&self) -> &MethodDescriptor {
        &self.descriptor
    }
}

const ZIP_CONTENT_TYPE: &str = "application/zip";
const REMOTE_FILE_NAME: &str = "remote.proto";

/// A downloaded proto; `dir` is the import root and is removed on drop
struct RemoteProto {
    dir: TempDir,
    entry: PathBuf,
}

/// Loads descriptor pools and looks methods up in them
#[derive(Debug, Clone, Default)]
pub struct DescriptorResolver {
    http: reqwest::Client,
}

impl DescriptorResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `api` from `source`. `channel` is only used for server
    /// reflection.
    pub async fn resolve(
        &self,
        source: &RpcSource,
        api: &ApiName,
        channel: Option<&Channel>,
        cancel: &CancellationToken,
    ) -> RunnerResult<ResolvedMethod> {
        info!(api = %api, source = source.kind(), "resolving method descriptor");

        let pool = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RunnerError::Cancelled),
            pool = self.load_pool(source, Some(&api.service), channel) => pool?,
        };

        let method = find_method(&pool, api)?;
        debug!(
            method = method.full_name(),
            client_streaming = method.streaming_client(),
            server_streaming = method.streaming_server(),
            "resolved method"
        );
        Ok(method)
    }

    /// Every method the source declares
    pub async fn list_methods(
        &self,
        source: &RpcSource,
        channel: Option<&Channel>,
        cancel: &CancellationToken,
    ) -> RunnerResult<Vec<ResolvedMethod>> {
        let pool = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RunnerError::Cancelled),
            pool = self.load_pool(source, None, channel) => pool?,
        };

        Ok(pool
            .services()
            .filter(|s| !s.full_name().starts_with("grpc.reflection."))
            .flat_map(|s| s.methods().collect::<Vec<_>>())
            .map(ResolvedMethod::new)
            .collect())
    }

    /// `symbol` narrows what reflection fetches; `None` fetches every service
    async fn load_pool(
        &self,
        source: &RpcSource,
        symbol: Option<&str>,
        channel: Option<&Channel>,
    ) -> RunnerResult<DescriptorPool> {
        match source {
            RpcSource::FileWithImports { path, import_paths } => {
                let remote = match remote_url(path) {
                    Some(url) => Some(self.fetch_proto(url).await?),
                    None => None,
                };

                let mut import_paths = import_paths.clone();
                let path = match &remote {
                    Some(fetched) => {
                        import_paths.insert(0, fetched.dir.path().to_path_buf());
                        fetched.entry.clone()
                    }
                    None => path.clone(),
                };

                tokio::task::spawn_blocking(move || compile_file(&path, &import_paths))
                    .await
                    .map_err(|e| RunnerError::Compile(e.to_string()))?
            }
            RpcSource::InlineRaw(raw) => {
                let raw = raw.clone();
                tokio::task::spawn_blocking(move || compile_inline(raw))
                    .await
                    .map_err(|e| RunnerError::Compile(e.to_string()))?
            }
            RpcSource::CompiledSet(location) => self.load_compiled_set(location).await,
            RpcSource::ServerReflection => {
                let channel = channel.ok_or_else(|| RunnerError::Connect {
                    addr: String::new(),
                    reason: "server reflection needs an open channel".to_string(),
                })?;
                let mut client = ReflectionClient::new(channel.clone());
                match symbol {
                    Some(symbol) => client.file_containing_symbol(symbol).await,
                    None => client.all_services().await,
                }
            }
        }
    }

    async fn load_compiled_set(&self, location: &str) -> RunnerResult<DescriptorPool> {
        let bytes = if location.starts_with("http://") || location.starts_with("https://") {
            debug!(url = location, "downloading descriptor set");
            self.http
                .get(location)
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await?
                .to_vec()
        } else {
            tokio::fs::read(location).await?
        };

        DescriptorPool::decode(bytes.as_slice())
            .map_err(|e| RunnerError::Decode(format!("descriptor set {}: {}", location, e)))
    }

    /// Download a proto, or a zip of protos, into a temporary import root
    async fn fetch_proto(&self, url: &str) -> RunnerResult<RemoteProto> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| RunnerError::Format(format!("invalid proto url {:?}: {}", url, e)))?;

        info!(url, "start to download proto file");
        let response = self.http.get(parsed.clone()).send().await?.error_for_status()?;
        let is_zip = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |v| v.starts_with(ZIP_CONTENT_TYPE));
        let bytes = response.bytes().await?;
        let dir = tempfile::tempdir()?;

        if !is_zip {
            let name = parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .filter(|name| name.ends_with(".proto"))
                .unwrap_or(REMOTE_FILE_NAME)
                .to_string();
            let entry = dir.path().join(name);
            tokio::fs::write(&entry, &bytes).await?;
            return Ok(RemoteProto { dir, entry });
        }

        let file = parsed
            .query_pairs()
            .find(|(key, _)| key == "file")
            .map(|(_, value)| value.into_owned())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| RunnerError::Format(format!("query parameter file is empty in {:?}", url)))?;

        let root = dir.path().to_path_buf();
        tokio::task::spawn_blocking(move || extract_zip(&bytes, &root))
            .await
            .map_err(|e| RunnerError::Task(e.to_string()))??;

        let entry = dir.path().join(&file);
        if file.split('/').any(|part| part == "..") || !entry.starts_with(dir.path()) || !entry.is_file() {
            return Err(RunnerError::NotFound(format!("file {} in {}", file, url)));
        }
        debug!(entry = %entry.display(), "extracted proto archive");
        Ok(RemoteProto { dir, entry })
    }
}

fn remote_url(path: &Path) -> Option<&str> {
    path.to_str()
        .filter(|p| p.starts_with("http://") || p.starts_with("https://"))
}

fn extract_zip(bytes: &[u8], root: &Path) -> RunnerResult<()> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| RunnerError::Decode(format!("zip: {}", e)))?;

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| RunnerError::Decode(format!("zip entry: {}", e)))?;
        if file.is_dir() {
            continue;
        }

        let relative = file
            .enclosed_name()
            .ok_or_else(|| RunnerError::Format(format!("unsafe archive entry {}", file.name())))?;
        let target = root.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut file, &mut out)?;
    }
    Ok(())
}

/// Look up `service` then `method` in a pool
pub fn find_method(pool: &DescriptorPool, api: &ApiName) -> RunnerResult<ResolvedMethod> {
    let service = pool
        .get_service_by_name(&api.service)
        .ok_or_else(|| RunnerError::NotFound(format!("service {}", api.service)))?;

    let method = service.methods().find(|m| m.name() == api.method);
    method
        .map(ResolvedMethod::new)
        .ok_or_else(|| RunnerError::NotFound(format!("method {}", api.full_name())))
}

fn compile_file(path: &Path, import_paths: &[PathBuf]) -> RunnerResult<DescriptorPool> {
    let (entry, includes) = entry_point(path, import_paths);
    debug!(entry = %entry.display(), includes = includes.len(), "compiling proto file");

    let mut resolver = ChainFileResolver::new();
    for include in includes {
        resolver.add(IncludeFileResolver::new(include));
    }
    resolver.add(BundledFileResolver);
    resolver.add(GoogleFileResolver::new());

    compile(resolver, &entry)
}

fn compile_inline(raw: String) -> RunnerResult<DescriptorPool> {
    let mut resolver = ChainFileResolver::new();
    resolver.add(InlineFileResolver::new(raw));
    resolver.add(BundledFileResolver);
    resolver.add(GoogleFileResolver::new());

    compile(resolver, Path::new(INLINE_FILE_NAME))
}

fn compile(resolver: ChainFileResolver, entry: &Path) -> RunnerResult<DescriptorPool> {
    let mut compiler = Compiler::with_file_resolver(resolver);
    compiler.include_imports(true);
    compiler
        .open_file(entry)
        .map_err(|e| RunnerError::Compile(e.to_string()))?;
    Ok(compiler.descriptor_pool())
}

/// Decide which path to open and which roots to search.
///
/// A file outside every import root gets its own directory as the first root.
fn entry_point(path: &Path, import_paths: &[PathBuf]) -> (PathBuf, Vec<PathBuf>) {
    if import_paths.iter().any(|root| path.starts_with(root)) {
        return (path.to_path_buf(), import_paths.to_vec());
    }

    if let Some(root) = import_paths.iter().find(|root| root.join(path).is_file()) {
        return (root.join(path), import_paths.to_vec());
    }

    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut includes = Vec::with_capacity(import_paths.len() + 1);
    includes.push(parent);
    includes.extend(import_paths.iter().cloned());
    (path.to_path_buf(), includes)
}
