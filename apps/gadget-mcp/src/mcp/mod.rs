pub mod handlers;
pub mod protocol;
pub mod server;
pub mod tools;

use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::Deserialize;

/// What callers are allowed to do. Ordered: each level includes the ones below.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    #[default]
    Readonly,
    Readwrite,
    Admin,
}

impl AccessLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessLevel::Readonly => "readonly",
            AccessLevel::Readwrite => "readwrite",
            AccessLevel::Admin => "admin",
        }
    }

    pub fn can_modify_cluster(self) -> bool {
        self >= AccessLevel::Readwrite
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Stdio,
    Socket,
}

#[derive(Clone, Debug, Default)]
pub struct McpConfig {
    pub transport: Transport,
    pub socket: Option<PathBuf>,
    pub access_level: AccessLevel,
}

pub use server::{McpServer, McpServerHandle};

pub fn default_socket_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    Path::new(&home).join(".gadget-mcp").join("mcp.sock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_levels_are_ordered() {
        assert!(AccessLevel::Readonly < AccessLevel::Readwrite);
        assert!(AccessLevel::Readwrite < AccessLevel::Admin);
        assert!(!AccessLevel::Readonly.can_modify_cluster());
        assert!(AccessLevel::Admin.can_modify_cluster());
    }

    #[test]
    fn access_level_parses_from_cli_value() {
        assert_eq!(
            AccessLevel::from_str("readwrite", true).unwrap(),
            AccessLevel::Readwrite
        );
        assert!(AccessLevel::from_str("root", true).is_err());
    }
}
