//! Protocol tags and the application protocol registry

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::model::{ApplicationProtocolSpec, ConfigKind};
use crate::store::{list_typed, ConfigEvent, ConfigStore, EventKind};

/// Codec namespace for built-in application protocols
pub const CODEC_PREFIX: &str = "aeraki.meta_protocol.codec";

/// Application protocols known without any `ApplicationProtocol` resource
pub const BUILTIN_PROTOCOLS: [&str; 3] = ["dubbo", "thrift", "videopacket"];

/// Protocol tag parsed from a port name: `<transport>-<protocol>[-<suffix>]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortProtocol {
    pub transport: String,
    pub protocol: String,
    pub suffix: Option<String>,
}

impl PortProtocol {
    /// Parse a port name; names without a protocol segment yield `None`
    ///
    /// # Examples
    ///
    /// ```
    /// use protomesh_mesh::generator::PortProtocol;
    ///
    /// let tag = PortProtocol::parse("tcp-metaprotocol-videopacket").unwrap();
    /// assert_eq!(tag.protocol, "metaprotocol");
    /// assert_eq!(tag.suffix.as_deref(), Some("videopacket"));
    /// assert!(PortProtocol::parse("http").is_none());
    /// ```
    pub fn parse(port_name: &str) -> Option<Self> {
        let lowered = port_name.to_ascii_lowercase();
        let mut parts = lowered.splitn(3, '-');
        let transport = parts.next().filter(|s| !s.is_empty())?;
        let protocol = parts.next().filter(|s| !s.is_empty())?;
        let suffix = parts.next().filter(|s| !s.is_empty());

        Some(Self {
            transport: transport.to_string(),
            protocol: protocol.to_string(),
            suffix: suffix.map(str::to_string),
        })
    }
}

/// Application protocol to codec mapping
///
/// Created once at startup and shared by reference. Reads happen during
/// generation; writes come from `ApplicationProtocol` resources.
#[derive(Debug)]
pub struct ProtocolRegistry {
    codecs: RwLock<HashMap<String, String>>,
}

impl ProtocolRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            codecs: RwLock::new(HashMap::new()),
        }
    }

    /// Registry holding the built-in codecs
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        for protocol in BUILTIN_PROTOCOLS {
            registry.register(protocol, format!("{}.{}", CODEC_PREFIX, protocol));
        }
        registry
    }

    pub fn register(&self, protocol: impl Into<String>, codec: impl Into<String>) {
        let protocol = protocol.into().to_ascii_lowercase();
        let codec = codec.into();
        debug!(protocol = %protocol, codec = %codec, "Registered application protocol");
        self.codecs.write().insert(protocol, codec);
    }

    /// Remove a protocol; built-in protocols fall back to their default codec
    pub fn unregister(&self, protocol: &str) {
        let protocol = protocol.to_ascii_lowercase();
        let mut codecs = self.codecs.write();
        if BUILTIN_PROTOCOLS.contains(&protocol.as_str()) {
            codecs.insert(protocol.clone(), format!("{}.{}", CODEC_PREFIX, protocol));
        } else {
            codecs.remove(&protocol);
        }
    }

    pub fn codec(&self, protocol: &str) -> Option<String> {
        self.codecs
            .read()
            .get(&protocol.to_ascii_lowercase())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.codecs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.read().is_empty()
    }

    /// Load every `ApplicationProtocol` resource and follow later changes
    pub fn watch(self: &Arc<Self>, store: &dyn ConfigStore) {
        let declared = list_typed::<ApplicationProtocolSpec>(store, None);
        for resource in &declared {
            self.apply_spec(&resource.spec);
        }
        info!(count = declared.len(), "Loaded application protocols");

        let registry = self.clone();
        store.on_change(
            ConfigKind::ApplicationProtocol,
            Arc::new(move |event: &ConfigEvent| registry.handle_event(event)),
        );
    }

    fn handle_event(&self, event: &ConfigEvent) {
        let Some(config) = event.config() else {
            return;
        };
        let spec = match config.typed::<ApplicationProtocolSpec>() {
            Ok(resource) => resource.spec,
            Err(e) => {
                warn!(key = %config.key(), error = %e, "Ignoring application protocol event");
                return;
            }
        };

        match event.event {
            EventKind::Delete => self.unregister(&spec.protocol),
            EventKind::Add | EventKind::Update => {
                if let Some(prev) = &event.prev
                    && let Ok(prev) = prev.typed::<ApplicationProtocolSpec>()
                    && prev.spec.protocol != spec.protocol
                {
                    self.unregister(&prev.spec.protocol);
                }
                self.apply_spec(&spec);
            }
        }
    }

    fn apply_spec(&self, spec: &ApplicationProtocolSpec) {
        if spec.protocol.is_empty() || spec.codec.is_empty() {
            warn!(protocol = %spec.protocol, "Application protocol without protocol or codec ignored");
            return;
        }
        self.register(&spec.protocol, &spec.codec);
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Config, Resource};
    use crate::store::MemoryConfigStore;

    #[test]
    fn test_parse_port_protocol() {
        let tag = PortProtocol::parse("tcp-dubbo").unwrap();
        assert_eq!(tag.transport, "tcp");
        assert_eq!(tag.protocol, "dubbo");
        assert_eq!(tag.suffix, None);

        let tag = PortProtocol::parse("TCP-MetaProtocol-Video-Packet").unwrap();
        assert_eq!(tag.protocol, "metaprotocol");
        assert_eq!(tag.suffix.as_deref(), Some("video-packet"));

        assert!(PortProtocol::parse("").is_none());
        assert!(PortProtocol::parse("tcp-").is_none());
    }

    #[test]
    fn test_defaults() {
        let registry = ProtocolRegistry::with_defaults();
        assert_eq!(registry.len(), 3);
        assert_eq!(
            registry.codec("Dubbo").as_deref(),
            Some("aeraki.meta_protocol.codec.dubbo")
        );
        assert!(registry.codec("brpc").is_none());
    }

    #[test]
    fn test_unregister_restores_builtin() {
        let registry = ProtocolRegistry::with_defaults();
        registry.register("dubbo", "custom.dubbo");
        registry.register("brpc", "custom.brpc");

        registry.unregister("dubbo");
        registry.unregister("brpc");

        assert_eq!(
            registry.codec("dubbo").as_deref(),
            Some("aeraki.meta_protocol.codec.dubbo")
        );
        assert!(registry.codec("brpc").is_none());
    }

    #[test]
    fn test_watch_follows_store() {
        let store = MemoryConfigStore::new();
        let declare = |codec: &str| -> Config {
            Resource::new(
                "istio-system",
                "brpc",
                ApplicationProtocolSpec {
                    protocol: "brpc".to_string(),
                    codec: codec.to_string(),
                },
            )
            .into()
        };
        store.apply(declare("codec.brpc.v1"));

        let registry = Arc::new(ProtocolRegistry::with_defaults());
        registry.watch(&store);
        assert_eq!(registry.codec("brpc").as_deref(), Some("codec.brpc.v1"));

        store.apply(declare("codec.brpc.v2"));
        assert_eq!(registry.codec("brpc").as_deref(), Some("codec.brpc.v2"));

        store.delete(ConfigKind::ApplicationProtocol, "istio-system", "brpc");
        assert!(registry.codec("brpc").is_none());
    }
}
