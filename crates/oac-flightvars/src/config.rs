use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use oac_proto::{VariableId, VariableValue};
use serde::Deserialize;

pub const DEFAULT_PORT: u16 = 8642;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_BUFFER_BYTES: usize = 4096;

#[derive(Debug, Clone, Deserialize)]
pub struct FlightVarsConfig {
    pub client: Option<ClientConfig>,
    pub server: Option<ServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_peer_name")]
    pub peer_name: String,
    /// How long subscribe/unsubscribe wait for the peer's reply.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_buffer_bytes")]
    pub recv_buffer_bytes: usize,
    /// Also the largest frame the client will put on the wire.
    #[serde(default = "default_buffer_bytes")]
    pub send_buffer_bytes: usize,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            peer_name: default_peer_name(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            recv_buffer_bytes: DEFAULT_BUFFER_BYTES,
            send_buffer_bytes: DEFAULT_BUFFER_BYTES,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    #[serde(default = "default_server_name")]
    pub name: String,
    #[serde(default = "default_buffer_bytes")]
    pub recv_buffer_bytes: usize,
    #[serde(default = "default_buffer_bytes")]
    pub send_buffer_bytes: usize,
    /// Initial contents of the in-memory variable table.
    #[serde(default)]
    pub vars: Vec<VarEntry>,
}

impl ServerConfig {
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            name: default_server_name(),
            recv_buffer_bytes: DEFAULT_BUFFER_BYTES,
            send_buffer_bytes: DEFAULT_BUFFER_BYTES,
            vars: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VarEntry {
    pub id: VariableId,
    pub value: VariableValue,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_peer_name() -> String {
    format!("oac-flightvars-client/{}", env!("CARGO_PKG_VERSION"))
}

fn default_server_name() -> String {
    format!("oac-flightvars-server/{}", env!("CARGO_PKG_VERSION"))
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_buffer_bytes() -> usize {
    DEFAULT_BUFFER_BYTES
}

pub fn load_config(path: impl AsRef<Path>) -> Result<FlightVarsConfig> {
    let path = path.as_ref();
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    toml::from_str(&s).context("parse config toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_client_and_server_sections() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"
[client]
host = "127.0.0.1"
request_timeout_ms = 250

[server]
listen = "0.0.0.0:8642"
name = "test-server"

[[server.vars]]
id = "FSUIPC/Offset->0x200"
value = {{ type = "word", value = 1200 }}

[[server.vars]]
id = "lights->beacon"
value = {{ type = "boolean", value = true }}
"#
        )
        .unwrap();

        let cfg = load_config(f.path()).unwrap();
        let client = cfg.client.unwrap();
        assert_eq!(client.port, DEFAULT_PORT);
        assert_eq!(client.request_timeout(), Duration::from_millis(250));
        assert_eq!(client.recv_buffer_bytes, DEFAULT_BUFFER_BYTES);
        assert_eq!(client.endpoint(), "127.0.0.1:8642");

        let server = cfg.server.unwrap();
        assert_eq!(server.name, "test-server");
        assert_eq!(server.vars.len(), 2);
        assert_eq!(server.vars[0].id, VariableId::new("fsuipc/offset", "0x200"));
        assert_eq!(server.vars[0].value, VariableValue::Word(1200));
        assert_eq!(server.vars[1].value, VariableValue::Boolean(true));
    }

    #[test]
    fn rejects_malformed_variable_id() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(
            f,
            r#"
[server]
listen = "127.0.0.1:0"
[[server.vars]]
id = "no-separator"
value = {{ type = "byte", value = 1 }}
"#
        )
        .unwrap();
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_config("/nonexistent/flightvars.toml").unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/flightvars.toml"));
    }
}
