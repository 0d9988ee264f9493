//! Declarative test suite and test case model

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::Path;

use crate::Result;

/// A set of test cases sharing one target
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestSuite {
    pub name: String,

    /// Default target address, e.g. `localhost:7070`
    #[serde(default)]
    pub api: String,

    #[serde(default)]
    pub spec: ApiSpec,

    #[serde(default)]
    pub param: BTreeMap<String, String>,

    #[serde(default)]
    pub items: Vec<TestCase>,
}

impl TestSuite {
    /// Parse a suite from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Parse a suite from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Find a test case by name
    pub fn case(&self, name: &str) -> Option<&TestCase> {
        self.items.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiSpec {
    #[serde(default)]
    pub kind: String,

    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub rpc: Option<RpcDesc>,

    #[serde(default)]
    pub secure: Option<Secure>,
}

/// Where the protobuf descriptors of an RPC suite come from.
///
/// More than one field may be populated; the runner picks one source with a
/// fixed precedence (reflection, descriptor set, raw text, proto file).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcDesc {
    #[serde(default, alias = "import", skip_serializing_if = "Vec::is_empty")]
    pub import_path: Vec<String>,

    #[serde(default)]
    pub server_reflection: bool,

    #[serde(default, alias = "protofile", skip_serializing_if = "String::is_empty")]
    pub proto_file: String,

    #[serde(default, alias = "protoset", skip_serializing_if = "String::is_empty")]
    pub proto_set: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub raw: String,
}

/// Transport security options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Secure {
    #[serde(default)]
    pub insecure: bool,

    /// Path to the CA certificate (PEM) used to verify the peer
    #[serde(default)]
    pub cert: String,

    #[serde(default)]
    pub server_name: String,
}

/// A single test case
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Job>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Job>,

    pub request: Request,

    #[serde(default)]
    pub expect: Expect,
}

/// Expressions executed before or after a test case
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub items: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// `pkg.Service.Method`, `/pkg.Service/Method` or `host:port/pkg.Service/Method`
    pub api: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query: BTreeMap<String, QueryValue>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub header: BTreeMap<String, String>,

    #[serde(default)]
    pub body: RequestBody,

    /// Body file relative to the suite's data directory; replaces `body`
    #[serde(default, rename = "bodyFromFile", skip_serializing_if = "String::is_empty")]
    pub body_from_file: String,
}

impl Request {
    /// Case-insensitive header lookup
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.header
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Raw request body.
///
/// YAML may give either a string or a structured value; the latter is stored
/// as its JSON rendering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestBody(String);

impl RequestBody {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawBody {
    Text(String),
    Structured(serde_json::Value),
}

impl<'de> Deserialize<'de> for RequestBody {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match RawBody::deserialize(deserializer)? {
            RawBody::Text(text) => Ok(Self(text)),
            RawBody::Structured(serde_json::Value::Null) => Ok(Self::default()),
            RawBody::Structured(value) => serde_json::to_string(&value)
                .map(Self)
                .map_err(serde::de::Error::custom),
        }
    }
}

impl Serialize for RequestBody {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// A query parameter: a plain value or a value with validation metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryValue {
    Plain(#[serde(deserialize_with = "scalar_as_string")] String),
    Verified(QueryVerifier),
}

impl QueryValue {
    pub fn value(&self) -> &str {
        match self {
            QueryValue::Plain(v) => v,
            QueryValue::Verified(v) => &v.value,
        }
    }

    pub fn verifier(&self) -> Option<&QueryVerifier> {
        match self {
            QueryValue::Plain(_) => None,
            QueryValue::Verified(v) => Some(v),
        }
    }
}

fn scalar_as_string<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a scalar query value, got {}",
            other
        ))),
    }
}

/// Validation metadata attached to a query parameter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryVerifier {
    #[serde(default)]
    pub value: String,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub max: i64,

    #[serde(default)]
    pub min: i64,

    #[serde(default)]
    pub max_length: usize,

    #[serde(default)]
    pub min_length: usize,
}

/// The expected response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Expect {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,

    #[serde(default)]
    pub body: RequestBody,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub header: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub body_fields_expect: BTreeMap<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verify: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditional_verify: Vec<ConditionalVerify>,
}

/// Assertions gated by conditions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionalVerify {
    #[serde(default)]
    pub condition: Vec<String>,

    #[serde(default)]
    pub verify: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_grpc_suite() {
        let yaml = r#"
name: grpc-sample
api: localhost:7070
spec:
  kind: grpc
  rpc:
    import:
      - ./proto
    protofile: server.proto
items:
  - name: version
    request:
      api: /server.Runner/GetVersion
      header:
        Authorization: Bearer token
      query:
        page:
          value: "1"
          required: true
        size: 10
      body:
        name: linuxsuren
    expect:
      body: '{"version": "v1"}'
      bodyFieldsExpect:
        data.0.version: v1
      verify:
        - len(data) == 1
      conditionalVerify:
        - condition:
            - len(data) > 0
          verify:
            - data[0].version != ""
"#;
        let suite = TestSuite::from_yaml(yaml).unwrap();
        assert_eq!(suite.api, "localhost:7070");

        let rpc = suite.spec.rpc.as_ref().unwrap();
        assert_eq!(rpc.import_path, vec!["./proto".to_string()]);
        assert_eq!(rpc.proto_file, "server.proto");
        assert!(!rpc.server_reflection);

        let case = suite.case("version").unwrap();
        assert_eq!(case.request.header_value("authorization"), Some("Bearer token"));
        assert_eq!(case.request.body.as_str(), r#"{"name":"linuxsuren"}"#);

        let page = case.request.query["page"].verifier().unwrap();
        assert!(page.required);
        assert_eq!(page.value, "1");
        assert_eq!(case.request.query["size"], QueryValue::Plain("10".to_string()));

        assert_eq!(case.expect.verify.len(), 1);
        assert_eq!(case.expect.conditional_verify[0].condition.len(), 1);
        assert_eq!(case.expect.body_fields_expect["data.0.version"], "v1");
    }

    #[test]
    fn test_parse_suite_param_and_body_file() {
        let yaml = r#"
name: params
param:
  name: linuxsuren
items:
  - name: upload
    request:
      api: server.Runner.Upload
      bodyFromFile: data/upload.json
"#;
        let suite = TestSuite::from_yaml(yaml).unwrap();
        assert_eq!(suite.param["name"], "linuxsuren");

        let request = &suite.case("upload").unwrap().request;
        assert_eq!(request.body_from_file, "data/upload.json");
        assert!(request.body.is_empty());
    }

    #[test]
    fn test_parse_camel_case_rpc_fields() {
        let yaml = r#"
name: reflection
spec:
  rpc:
    serverReflection: true
    importPath: [a, b]
    protoSet: https://example.com/set.pb
"#;
        let suite = TestSuite::from_yaml(yaml).unwrap();
        let rpc = suite.spec.rpc.unwrap();
        assert!(rpc.server_reflection);
        assert_eq!(rpc.import_path.len(), 2);
        assert_eq!(rpc.proto_set, "https://example.com/set.pb");
    }

    #[test]
    fn test_streaming_body_keeps_array() {
        let yaml = r#"
name: stream
request:
  api: server.Runner.Upload
  body:
    - msgID: 1
    - msgID: 2
"#;
        let case: TestCase = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(case.request.body.as_str(), r#"[{"msgID":1},{"msgID":2}]"#);
        assert!(case.expect.verify.is_empty());
    }

    #[test]
    fn test_missing_body_is_empty() {
        let case: TestCase = serde_yaml::from_str("name: empty\nrequest:\n  api: a.B.C\n").unwrap();
        assert!(case.request.body.is_empty());
    }
}
