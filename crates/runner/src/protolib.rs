//! Proto files available to every compilation without an import path

use protox::file::{File, FileResolver};
use std::path::Path;

/// Name given to inline proto text
pub const INLINE_FILE_NAME: &str = "inline.proto";

const BUNDLED: &[(&str, &str)] = &[
    (
        "google/api/annotations.proto",
        include_str!("../proto/google/api/annotations.proto"),
    ),
    (
        "google/api/http.proto",
        include_str!("../proto/google/api/http.proto"),
    ),
];

/// Serves the bundled `google/api` protos.
///
/// Google well-known types come from `protox::file::GoogleFileResolver`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BundledFileResolver;

impl BundledFileResolver {
    pub fn contains(name: &str) -> bool {
        BUNDLED.iter().any(|(n, _)| *n == name)
    }
}

impl FileResolver for BundledFileResolver {
    fn open_file(&self, name: &str) -> Result<File, protox::Error> {
        match BUNDLED.iter().find(|(n, _)| *n == name) {
            Some((name, source)) => File::from_source(name, source),
            None => Err(protox::Error::file_not_found(name)),
        }
    }
}

/// Serves a single in-memory proto file under [`INLINE_FILE_NAME`]
#[derive(Debug, Clone)]
pub struct InlineFileResolver {
    source: String,
}

impl InlineFileResolver {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

impl FileResolver for InlineFileResolver {
    fn resolve_path(&self, path: &Path) -> Option<String> {
        (path == Path::new(INLINE_FILE_NAME)).then(|| INLINE_FILE_NAME.to_string())
    }

    fn open_file(&self, name: &str) -> Result<File, protox::Error> {
        if name == INLINE_FILE_NAME {
            File::from_source(name, &self.source)
        } else {
            Err(protox::Error::file_not_found(name))
        }
    }
}
