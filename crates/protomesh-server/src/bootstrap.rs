//! Initial resource loading
//!
//! A multi-document YAML file of `{kind, metadata, spec}` documents seeds the
//! in-memory config store at startup.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use tracing::info;

use protomesh_mesh::model::{Config, ResourceMetadata};
use protomesh_mesh::store::MemoryConfigStore;

const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Deserialize)]
struct ResourceDocument {
    kind: String,
    #[serde(default)]
    metadata: ResourceMetadata,
    #[serde(default)]
    spec: serde_json::Value,
}

/// Parse every non-empty document in `text`
pub fn parse_resources(text: &str) -> anyhow::Result<Vec<Config>> {
    let mut configs = Vec::new();
    for (index, document) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = serde_yaml::Value::deserialize(document)
            .with_context(|| format!("document {} is not valid YAML", index))?;
        if value.is_null() {
            continue;
        }
        let mut document: ResourceDocument = serde_yaml::from_value(value)
            .with_context(|| format!("document {} is not a resource", index))?;
        if document.metadata.namespace.is_empty() {
            document.metadata.namespace = DEFAULT_NAMESPACE.to_string();
        }
        if document.metadata.creation_timestamp == 0 {
            document.metadata.creation_timestamp = chrono::Utc::now().timestamp_millis();
        }
        configs.push(Config::from_document(
            &document.kind,
            document.metadata,
            document.spec,
        )?);
    }
    Ok(configs)
}

/// Load `path` into `store`, returning the number of resources applied
pub fn load_resources(path: &Path, store: &MemoryConfigStore) -> anyhow::Result<usize> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let configs = parse_resources(&text).with_context(|| format!("in {}", path.display()))?;
    let count = configs.len();
    for config in configs {
        store.apply(config);
    }
    info!(path = %path.display(), count, "Loaded bootstrap resources");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use protomesh_mesh::model::{ConfigKind, ServiceEntrySpec};

    use super::*;

    const RESOURCES: &str = r#"
kind: ServiceEntry
metadata:
  name: videopacket
  namespace: ns1
spec:
  hosts: [videopacket.ns1]
  ports:
    - number: 8000
      name: tcp-metaprotocol-videopacket
---
---
kind: DestinationRule
metadata:
  name: videopacket
spec:
  host: videopacket.ns1
"#;

    #[test]
    fn test_parse_skips_empty_documents() {
        let configs = parse_resources(RESOURCES).unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].kind(), ConfigKind::ServiceEntry);
        assert_eq!(configs[0].key(), "ns1/videopacket");

        let service = configs[0].typed::<ServiceEntrySpec>().unwrap();
        assert_eq!(service.spec.ports[0].number, 8000);
        assert!(service.metadata.creation_timestamp > 0);

        // Namespace defaults when omitted
        assert_eq!(configs[1].key(), "default/videopacket");
    }

    #[test]
    fn test_sample_resources_parse() {
        let configs = parse_resources(include_str!("../../../conf/resources.yml")).unwrap();
        let kinds: Vec<ConfigKind> = configs.iter().map(|config| config.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                ConfigKind::ApplicationProtocol,
                ConfigKind::ServiceEntry,
                ConfigKind::DestinationRule,
                ConfigKind::RoutePolicy,
            ]
        );
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = parse_resources("kind: Sidecar\nmetadata:\n  name: x\n").unwrap_err();
        assert!(format!("{:#}", err).contains("unknown kind"));
    }

    #[test]
    fn test_load_into_store() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(RESOURCES.as_bytes()).unwrap();
        let store = MemoryConfigStore::new();

        assert_eq!(load_resources(file.path(), &store).unwrap(), 2);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_missing_file() {
        let store = MemoryConfigStore::new();
        assert!(load_resources(Path::new("/nonexistent/resources.yml"), &store).is_err());
        assert!(store.is_empty());
    }
}
