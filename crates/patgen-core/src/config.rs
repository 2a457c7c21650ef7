use serde::{Deserialize, Serialize};

use crate::types::{Color, Resolution};

/// Static configuration of the generator process.
///
/// The protocol ports are fixed by the tools that speak them (PGen 85,
/// UPGCI 2100, discovery 1977); they are configurable here so tests can
/// bind ephemeral ports and unprivileged runs can remap PGen off port 85.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    #[serde(alias = "deviceName")]
    pub device_name: String,
    pub resolution: Resolution,
    #[serde(alias = "pgenPort")]
    pub pgen_port: u16,
    #[serde(alias = "upgciPort")]
    pub upgci_port: u16,
    #[serde(alias = "discoveryPort")]
    pub discovery_port: u16,
    /// Resolve/LightSpace server to connect out to; the client stays idle
    /// when unset.
    #[serde(alias = "resolveHost")]
    pub resolve_host: Option<String>,
    #[serde(alias = "resolvePort")]
    pub resolve_port: u16,
    /// Full-field color PGenerator falls back to on `TESTTEMPLATE`.
    #[serde(alias = "passivePattern")]
    pub passive_pattern: Option<Color>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            device_name: "PatGen".to_owned(),
            resolution: Resolution::FHD,
            pgen_port: 85,
            upgci_port: 2100,
            discovery_port: 1977,
            resolve_host: None,
            resolve_port: 20002,
            passive_pattern: None,
        }
    }
}
