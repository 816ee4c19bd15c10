//! Typed view of the `expose.*` service labels.
//!
//! Labels are parsed once per reconciliation pass into [`ExposeLabels`].
//!
//! | label | default when absent or empty |
//! |---|---|
//! | `expose` | routing disabled |
//! | `expose.host` | `<service name>.<default domain>` |
//! | `expose.port` | first published port |

use std::collections::BTreeMap;

use crate::error::LabelError;

pub const EXPOSE_LABEL: &str = "expose";
pub const EXPOSE_HOST_LABEL: &str = "expose.host";
pub const EXPOSE_PORT_LABEL: &str = "expose.port";

/// The labels the synchronizer recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposeLabel {
    Enable,
    Host,
    Port,
}

impl ExposeLabel {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Enable => EXPOSE_LABEL,
            Self::Host => EXPOSE_HOST_LABEL,
            Self::Port => EXPOSE_PORT_LABEL,
        }
    }
}

/// Target-port selector taken from `expose.port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSelector {
    Port(u16),
    /// The label is set but is not a port number.
    Invalid(String),
}

impl PortSelector {
    fn parse(raw: &str) -> Self {
        match raw.parse::<u16>() {
            Ok(port) if port > 0 => Self::Port(port),
            _ => Self::Invalid(raw.to_string()),
        }
    }

    pub fn port(&self) -> Result<u16, LabelError> {
        match self {
            Self::Port(port) => Ok(*port),
            Self::Invalid(value) => Err(LabelError::InvalidPort {
                value: value.clone(),
            }),
        }
    }
}

/// Routing configuration declared through service labels.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExposeLabels {
    /// Whether routing is enabled for the service.
    pub enabled: bool,

    /// Explicit host to match, overriding the synthesized default.
    pub host: Option<String>,

    /// Target port to route to when several ports are published.
    pub port: Option<PortSelector>,
}

impl ExposeLabels {
    pub fn parse(labels: &BTreeMap<String, String>) -> Self {
        let value = |label: ExposeLabel| {
            labels
                .get(label.key())
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        Self {
            enabled: value(ExposeLabel::Enable).map(parse_flag).unwrap_or(false),
            host: value(ExposeLabel::Host).map(str::to_string),
            port: value(ExposeLabel::Port).map(PortSelector::parse),
        }
    }
}

/// Interpret a boolean label value.
///
/// `false`, `0`, `no`, `off` (any case) and the empty string disable; every
/// other value enables.
pub fn parse_flag(raw: &str) -> bool {
    let raw = raw.trim();
    !(raw.is_empty()
        || ["false", "0", "no", "off"]
            .iter()
            .any(|v| raw.eq_ignore_ascii_case(v)))
}
