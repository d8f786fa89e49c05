//! Compose manifest parsing. Only the keys the core consumes are typed;
//! everything else passes through the raw document untouched (the rewriter
//! works on the `serde_yaml::Value` level for the same reason).

use crate::error::CoreError;
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Default)]
pub struct ComposeFile {
    pub name: Option<String>,
    pub services: BTreeMap<String, ComposeService>,
}

#[derive(Debug, Clone, Default)]
pub struct ComposeService {
    pub image: Option<String>,
    /// Container-side volume destinations, in manifest order.
    pub volumes: Vec<String>,
    pub env: HashMap<String, String>,
}

pub fn parse(manifest: &str) -> Result<ComposeFile, CoreError> {
    let doc: Value = serde_yaml::from_str(manifest)?;
    let root = doc
        .as_mapping()
        .ok_or_else(|| CoreError::Parse("compose manifest is not a mapping".into()))?;

    let mut out = ComposeFile {
        name: root.get("name").and_then(Value::as_str).map(String::from),
        services: BTreeMap::new(),
    };

    let Some(services) = root.get("services").and_then(Value::as_mapping) else {
        return Ok(out);
    };

    for (key, body) in services {
        let Some(name) = key.as_str() else { continue };
        let mut service = ComposeService {
            image: body
                .get("image")
                .and_then(Value::as_str)
                .map(String::from),
            ..Default::default()
        };

        if let Some(volumes) = body.get("volumes").and_then(Value::as_sequence) {
            for volume in volumes {
                if let Some(dest) = volume_destination(volume) {
                    service.volumes.push(dest);
                }
            }
        }

        if let Some(env) = body.get("environment") {
            service.env = parse_environment(env);
        }

        out.services.insert(name.to_string(), service);
    }

    Ok(out)
}

/// Container-side path of a volume declaration.
/// Short form `HOST:CONTAINER[:ro]` keeps CONTAINER, a bare path keeps
/// itself, long form keeps `target`.
fn volume_destination(volume: &Value) -> Option<String> {
    match volume {
        Value::String(s) => {
            let mut parts = s.split(':');
            let first = parts.next()?;
            Some(parts.next().unwrap_or(first).to_string())
        }
        Value::Mapping(m) => m.get("target").and_then(Value::as_str).map(String::from),
        _ => None,
    }
}

/// Environment in either list (`K=V`) or map form. Values are kept as
/// written; numbers and booleans are stringified.
pub fn parse_environment(env: &Value) -> HashMap<String, String> {
    let mut out = HashMap::new();
    match env {
        Value::Sequence(items) => {
            for item in items {
                let Some(s) = item.as_str() else { continue };
                match s.split_once('=') {
                    Some((k, v)) => out.insert(k.to_string(), v.to_string()),
                    None => out.insert(s.to_string(), String::new()),
                };
            }
        }
        Value::Mapping(m) => {
            for (k, v) in m {
                let Some(key) = k.as_str() else { continue };
                out.insert(key.to_string(), scalar_to_string(v));
            }
        }
        _ => {}
    }
    out
}

fn scalar_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
name: blog
services:
  db:
    image: postgres:16
    environment:
      POSTGRES_USER: app
      POSTGRES_PASSWORD: s3cret
      POSTGRES_PORT: 5432
    volumes:
      - pgdata:/var/lib/postgresql/data
  web:
    image: nginx:alpine
    environment:
      - "UPSTREAM=db:5432"
      - EMPTY=
      - BARE
    volumes:
      - ./site:/usr/share/nginx/html:ro
      - /var/cache/nginx
      - type: bind
        source: ./certs
        target: /etc/nginx/certs
    labels:
      custom.opaque.key: untouched
"#;

    #[test]
    fn test_parse_extracts_services() {
        let parsed = parse(MANIFEST).unwrap();
        assert_eq!(parsed.name.as_deref(), Some("blog"));
        assert_eq!(parsed.services.len(), 2);
        assert_eq!(
            parsed.services["db"].image.as_deref(),
            Some("postgres:16")
        );
    }

    #[test]
    fn test_volume_destinations() {
        let parsed = parse(MANIFEST).unwrap();
        assert_eq!(
            parsed.services["db"].volumes,
            vec!["/var/lib/postgresql/data"]
        );
        assert_eq!(
            parsed.services["web"].volumes,
            vec![
                "/usr/share/nginx/html",
                "/var/cache/nginx",
                "/etc/nginx/certs"
            ]
        );
    }

    #[test]
    fn test_environment_both_forms() {
        let parsed = parse(MANIFEST).unwrap();
        let db = &parsed.services["db"].env;
        assert_eq!(db["POSTGRES_USER"], "app");
        assert_eq!(db["POSTGRES_PORT"], "5432");
        let web = &parsed.services["web"].env;
        assert_eq!(web["UPSTREAM"], "db:5432");
        assert_eq!(web["EMPTY"], "");
        assert_eq!(web["BARE"], "");
    }

    #[test]
    fn test_malformed_manifest_is_parse_error() {
        let err = parse("services: {unclosed").unwrap_err();
        assert!(matches!(err, CoreError::Parse(_)));
        let err = parse("just a scalar").unwrap_err();
        assert!(matches!(err, CoreError::Parse(_)));
    }

    #[test]
    fn test_no_interpolation_at_parse_time() {
        let parsed = parse("services:\n  a:\n    environment:\n      K: ${UNSET:-x}\n").unwrap();
        assert_eq!(parsed.services["a"].env["K"], "${UNSET:-x}");
    }
}
