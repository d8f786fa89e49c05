//! Conflict rewriting of compose manifests. Each transformation is
//! syntactic, independent, and idempotent; the goal is a manifest that
//! deploys on any host and never blocks on side channels while the stack
//! is being rebuilt.

use crate::engine::ports::{next_free_port, PortProber, PORT_PROBE_CEILING};
use crate::engine::EngineClient;
use crate::error::CoreError;
use serde_yaml::{Mapping, Value};
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct RewriteOutcome {
    pub manifest: String,
    /// Human-readable remapping records, e.g. `db: 5432 → 5433`.
    pub remappings: Vec<String>,
    /// Resolved names of networks declared `external: true`.
    pub external_networks: Vec<String>,
}

/// Rewrite a manifest against the given host view. Pure; engine-side
/// effects (network creation) happen in [`apply_conflict_rewrite`].
pub fn rewrite_manifest(
    text: &str,
    prober: &mut dyn PortProber,
) -> Result<RewriteOutcome, CoreError> {
    let mut doc: Value =
        serde_yaml::from_str(text).map_err(|e| CoreError::RewriteFailed(e.to_string()))?;
    let root = doc
        .as_mapping_mut()
        .ok_or_else(|| CoreError::RewriteFailed("manifest is not a mapping".into()))?;

    let mut remappings = Vec::new();

    if let Some(services) = root.get_mut("services").and_then(Value::as_mapping_mut) {
        for (name, body) in services.iter_mut() {
            let service = name.as_str().unwrap_or_default().to_string();
            let Some(body) = body.as_mapping_mut() else { continue };

            rewrite_ports(&service, body, prober, &mut remappings);
            body.remove("container_name");
            strip_static_addresses(body);
            body.remove("healthcheck");
            relax_depends_on(body);
            body.remove("dns");
            body.remove("dns_search");
        }
    }

    let external_networks = collect_external_networks(root);

    let manifest =
        serde_yaml::to_string(&doc).map_err(|e| CoreError::RewriteFailed(e.to_string()))?;
    Ok(RewriteOutcome {
        manifest,
        remappings,
        external_networks,
    })
}

/// Rewrite and ensure external networks exist on the engine. Engine
/// errors while reading the published-port view downgrade to a warning
/// and a bind-only probe.
pub async fn apply_conflict_rewrite(
    engine: &dyn EngineClient,
    text: &str,
) -> Result<RewriteOutcome, CoreError> {
    let published = match engine.published_ports().await {
        Ok(ports) => ports,
        Err(e) => {
            tracing::warn!(error = %e, "engine port view unavailable, probing by bind only");
            HashSet::new()
        }
    };
    let mut prober = crate::engine::ports::HostProber::new(published);
    let outcome = rewrite_manifest(text, &mut prober)?;

    if !outcome.external_networks.is_empty() {
        let existing: HashSet<String> = engine.list_networks().await?.into_iter().collect();
        for net in &outcome.external_networks {
            if !existing.contains(net) {
                engine.create_network(net).await?;
                tracing::info!(network = %net, "created missing external network");
            }
        }
    }

    Ok(outcome)
}

fn rewrite_ports(
    service: &str,
    body: &mut Mapping,
    prober: &mut dyn PortProber,
    remappings: &mut Vec<String>,
) {
    let Some(ports) = body.get_mut("ports").and_then(Value::as_sequence_mut) else {
        return;
    };
    for entry in ports.iter_mut() {
        match entry {
            Value::String(s) => {
                if let Some(rewritten) = rewrite_short_mapping(service, s, prober, remappings) {
                    *s = rewritten;
                }
            }
            Value::Mapping(m) => rewrite_long_mapping(service, m, prober, remappings),
            _ => {}
        }
    }
}

/// `H:C`, `H:C/proto`, and `IP:H:C` forms. Ranges and anything else pass
/// through untouched.
fn rewrite_short_mapping(
    service: &str,
    mapping: &str,
    prober: &mut dyn PortProber,
    remappings: &mut Vec<String>,
) -> Option<String> {
    let parts: Vec<&str> = mapping.split(':').collect();
    let (ip, host, container) = match parts.as_slice() {
        [host, container] => (None, *host, *container),
        [ip, host, container] => (Some(*ip), *host, *container),
        _ => return None,
    };
    let host_port: u16 = host.parse().ok()?;
    let replacement = substitute_port(service, host_port, prober, remappings)?;
    Some(match ip {
        Some(ip) => format!("{ip}:{replacement}:{container}"),
        None => format!("{replacement}:{container}"),
    })
}

fn rewrite_long_mapping(
    service: &str,
    mapping: &mut Mapping,
    prober: &mut dyn PortProber,
    remappings: &mut Vec<String>,
) {
    let Some(published) = mapping.get("published") else {
        return;
    };
    let host_port: Option<u16> = match published {
        Value::Number(n) => n.as_u64().and_then(|v| u16::try_from(v).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    };
    let Some(host_port) = host_port else { return };
    if let Some(replacement) = substitute_port(service, host_port, prober, remappings) {
        mapping.insert(Value::from("published"), Value::from(replacement));
    }
}

/// Returns the substitute port if `host_port` is unavailable, None when it
/// can stay. Nothing free below the ceiling leaves the mapping alone.
fn substitute_port(
    service: &str,
    host_port: u16,
    prober: &mut dyn PortProber,
    remappings: &mut Vec<String>,
) -> Option<u16> {
    if prober.is_free(host_port) {
        return None;
    }
    if host_port >= PORT_PROBE_CEILING {
        tracing::warn!(service, host_port, "no probe range above conflicting port");
        return None;
    }
    match next_free_port(prober, host_port + 1) {
        Some(port) => {
            remappings.push(format!("{service}: {host_port} → {port}"));
            Some(port)
        }
        None => {
            tracing::warn!(service, host_port, "no free port found, leaving mapping");
            None
        }
    }
}

fn strip_static_addresses(body: &mut Mapping) {
    let Some(networks) = body.get_mut("networks").and_then(Value::as_mapping_mut) else {
        return;
    };
    for (_, attachment) in networks.iter_mut() {
        if let Some(attachment) = attachment.as_mapping_mut() {
            attachment.remove("ipv4_address");
            attachment.remove("ipv6_address");
        }
    }
}

/// `condition: service_healthy` would wait on healthchecks we just
/// deleted; downgrade to started.
fn relax_depends_on(body: &mut Mapping) {
    let Some(depends) = body.get_mut("depends_on").and_then(Value::as_mapping_mut) else {
        return;
    };
    for (_, dep) in depends.iter_mut() {
        let Some(dep) = dep.as_mapping_mut() else { continue };
        if dep.get("condition").and_then(Value::as_str) == Some("service_healthy") {
            dep.insert(Value::from("condition"), Value::from("service_started"));
        }
    }
}

fn collect_external_networks(root: &Mapping) -> Vec<String> {
    let Some(networks) = root.get("networks").and_then(Value::as_mapping) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for (key, body) in networks {
        let Some(net_name) = key.as_str() else { continue };
        let Some(body) = body.as_mapping() else { continue };
        let resolved = match body.get("external") {
            Some(Value::Bool(true)) => Some(
                body.get("name")
                    .and_then(Value::as_str)
                    .unwrap_or(net_name)
                    .to_string(),
            ),
            Some(Value::Mapping(ext)) => Some(
                ext.get("name")
                    .and_then(Value::as_str)
                    .unwrap_or(net_name)
                    .to_string(),
            ),
            Some(Value::String(s)) if s != "false" => Some(s.clone()),
            _ => None,
        };
        if let Some(name) = resolved {
            out.push(name);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ports::FakeProber;

    const MANIFEST: &str = r#"
services:
  db:
    image: postgres:16
    container_name: blog_db
    ports:
      - "5432:5432"
    networks:
      backend:
        ipv4_address: 172.20.0.10
        ipv6_address: fd00::10
    healthcheck:
      test: ["CMD", "pg_isready"]
    dns:
      - 1.1.1.1
    dns_search: example.internal
  web:
    image: nginx:alpine
    ports:
      - "127.0.0.1:8080:80"
      - target: 443
        published: 8443
    depends_on:
      db:
        condition: service_healthy
networks:
  backend: {}
  edge:
    external: true
  legacy:
    external:
      name: old-edge
"#;

    fn rewrite(busy: &[u16]) -> RewriteOutcome {
        let mut prober = FakeProber {
            busy: busy.iter().copied().collect(),
        };
        rewrite_manifest(MANIFEST, &mut prober).unwrap()
    }

    #[test]
    fn test_conflicting_ports_are_remapped() {
        let outcome = rewrite(&[5432, 8080]);
        assert!(outcome.manifest.contains("5433:5432"));
        assert!(outcome.manifest.contains("127.0.0.1:8081:80"));
        assert!(outcome.manifest.contains("published: 8443"));
        assert_eq!(
            outcome.remappings,
            vec!["db: 5432 → 5433", "web: 8080 → 8081"]
        );
    }

    #[test]
    fn test_free_ports_stay() {
        let outcome = rewrite(&[]);
        assert!(outcome.manifest.contains("5432:5432"));
        assert!(outcome.remappings.is_empty());
    }

    #[test]
    fn test_side_channels_are_erased() {
        let manifest = rewrite(&[]).manifest;
        for key in [
            "container_name",
            "healthcheck",
            "ipv4_address",
            "ipv6_address",
            "dns",
            "dns_search",
        ] {
            assert!(!manifest.contains(key), "{key} survived the rewrite");
        }
        assert!(manifest.contains("condition: service_started"));
    }

    #[test]
    fn test_external_networks_resolved() {
        let outcome = rewrite(&[]);
        assert_eq!(outcome.external_networks, vec!["edge", "old-edge"]);
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let first = rewrite(&[5432]);
        let mut prober = FakeProber {
            busy: [5432].into_iter().collect(),
        };
        let second = rewrite_manifest(&first.manifest, &mut prober).unwrap();
        assert_eq!(first.manifest, second.manifest);
    }

    #[test]
    fn test_long_form_published_conflict() {
        let outcome = rewrite(&[8443]);
        assert!(outcome.manifest.contains("published: 8444"));
        assert!(outcome.remappings.contains(&"web: 8443 → 8444".to_string()));
    }
}
