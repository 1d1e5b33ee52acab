//! Version information for the bridge and the engine behind it.

use serde::Serialize;

use crate::bridge::protocol::OptionDecl;

/// Bridge version from Cargo.toml
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// What the engine reported about itself during the `uci` handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineIdentity {
    pub bridge: &'static str,
    /// `id name ...`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// `id author ...`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<OptionDecl>,
}

impl Default for EngineIdentity {
    fn default() -> Self {
        Self {
            bridge: BRIDGE_VERSION,
            name: None,
            author: None,
            options: Vec::new(),
        }
    }
}

impl EngineIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one `id` line. Unknown fields are ignored.
    pub fn record_id(&mut self, field: &str, value: String) {
        match field {
            "name" => self.name = Some(value),
            "author" => self.author = Some(value),
            _ => {}
        }
    }

    pub fn option(&self, name: &str) -> Option<&OptionDecl> {
        self.options
            .iter()
            .find(|o| o.name.eq_ignore_ascii_case(name))
    }
}
