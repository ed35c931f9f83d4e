//! Env value templating.
//!
//! Target environment entries may reference values only known at build
//! time. The expansion context is explicitly enumerated rather than
//! reflective; today it exposes a single function:
//!
//! - `{{ .Containers.IP "label" }}` - IPv4 address of the service
//!   container started under `label`.
//!
//! Text outside `{{ ... }}` passes through unchanged, so shell-ish
//! values like `postgres://u@host/db` need no escaping.

use std::collections::BTreeMap;

use thiserror::Error;

/// Errors raised during template expansion. All are fatal to the build.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
  #[error("unclosed template expression at position {0}")]
  Unclosed(usize),

  #[error("unknown template function: {0}")]
  UnknownFunction(String),

  #[error("malformed template expression: {0}")]
  Malformed(String),

  #[error("no container with label '{0}'")]
  UnknownLabel(String),
}

/// Values available to template expressions.
#[derive(Debug, Clone, Default)]
pub struct ExpansionContext {
  /// Container label -> IPv4 address.
  containers: BTreeMap<String, String>,
}

impl ExpansionContext {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_containers(containers: BTreeMap<String, String>) -> Self {
    Self { containers }
  }

  pub fn insert_container(&mut self, label: &str, ip: &str) {
    self.containers.insert(label.to_string(), ip.to_string());
  }

  fn container_ip(&self, label: &str) -> Result<&str, TemplateError> {
    self
      .containers
      .get(label)
      .map(String::as_str)
      .ok_or_else(|| TemplateError::UnknownLabel(label.to_string()))
  }
}

/// Expand all `{{ ... }}` expressions in `input`.
pub fn expand(input: &str, ctx: &ExpansionContext) -> Result<String, TemplateError> {
  let mut out = String::with_capacity(input.len());
  let mut rest = input;
  let mut offset = 0;

  while let Some(start) = rest.find("{{") {
    out.push_str(&rest[..start]);

    let after_open = &rest[start + 2..];
    let end = after_open
      .find("}}")
      .ok_or(TemplateError::Unclosed(offset + start))?;

    let expr = after_open[..end].trim();
    out.push_str(&eval(expr, ctx)?);

    offset += start + 2 + end + 2;
    rest = &after_open[end + 2..];
  }

  out.push_str(rest);
  Ok(out)
}

/// Expand a `KEY=VALUE` list into a map, templating only the values.
pub fn expand_env_entries(
  entries: &[String],
  ctx: &ExpansionContext,
) -> Result<BTreeMap<String, String>, TemplateError> {
  let mut vars = BTreeMap::new();
  for entry in entries {
    let (key, value) = entry
      .split_once('=')
      .ok_or_else(|| TemplateError::Malformed(format!("expected KEY=VALUE, got '{entry}'")))?;
    vars.insert(key.to_string(), expand(value, ctx)?);
  }
  Ok(vars)
}

/// Evaluate one expression body (the text between `{{` and `}}`).
fn eval(expr: &str, ctx: &ExpansionContext) -> Result<String, TemplateError> {
  let Some(args) = expr.strip_prefix(".Containers.IP") else {
    let function = expr.split_whitespace().next().unwrap_or(expr);
    return Err(TemplateError::UnknownFunction(function.to_string()));
  };

  let label = parse_quoted(args.trim())
    .ok_or_else(|| TemplateError::Malformed(expr.to_string()))?;

  ctx.container_ip(label).map(str::to_string)
}

/// Parse a double-quoted string, returning its contents.
fn parse_quoted(input: &str) -> Option<&str> {
  let inner = input.strip_prefix('"')?.strip_suffix('"')?;
  if inner.contains('"') {
    return None;
  }
  Some(inner)
}
