//! Request templating against the suite data context

use apitest_common::{Request, RequestBody};
use minijinja::Environment;
use serde_json::{Map, Value};
use std::path::Path;
use tracing::debug;

use crate::error::{RunnerError, RunnerResult};

/// Render `api`, every header value and `body` of a request.
///
/// `bodyFromFile` is read relative to `data_dir` and replaces `body` before
/// rendering. Templates use Jinja syntax, e.g. `{{ param.name }}` or
/// `{{ login.data[0].token }}` for the output of an earlier case.
pub async fn render_request(request: &Request, ctx: &Value, data_dir: &Path) -> RunnerResult<Request> {
    let mut rendered = request.clone();
    rendered.api = render("api", &request.api, ctx)?.trim().to_string();

    if !request.body_from_file.is_empty() {
        let path = data_dir.join(&request.body_from_file);
        debug!(path = %path.display(), "reading request body from file");
        let content = tokio::fs::read_to_string(&path).await?;
        rendered.body = RequestBody::new(content.trim());
    }

    for (name, value) in rendered.header.iter_mut() {
        *value = render(&format!("header {}", name), value.as_str(), ctx)?;
    }

    rendered.body = RequestBody::new(render("body", rendered.body.as_str(), ctx)?);
    Ok(rendered)
}

fn render(name: &str, source: &str, ctx: &Value) -> RunnerResult<String> {
    if !source.contains("{{") && !source.contains("{%") {
        return Ok(source.to_string());
    }

    let empty = Value::Object(Map::new());
    let ctx = if ctx.is_object() { ctx } else { &empty };

    Environment::new()
        .render_str(source, ctx)
        .map_err(|e| RunnerError::Render(format!("{} {:?}: {}", name, source, e)))
}
