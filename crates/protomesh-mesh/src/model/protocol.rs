//! Application protocol declaration

use serde::{Deserialize, Serialize};

/// Maps an application protocol carried over the meta protocol framework to
/// the codec the proxy uses to decode it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationProtocolSpec {
    /// Protocol name as it appears in port tags
    pub protocol: String,
    /// Codec name
    pub codec: String,
}
