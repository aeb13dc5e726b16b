use std::collections::HashSet;

use anyhow::Result;
use oac_proto::codec::{is_representable_float, MAX_FIXED_FRAME_SIZE};
use oac_proto::VariableValue;

use crate::config::{ClientConfig, ServerConfig};

const MIN_BUFFER_BYTES: usize = 64;
const MAX_REQUEST_TIMEOUT_MS: u64 = 10 * 60 * 1000;

pub fn check_client(cfg: &ClientConfig) -> Result<()> {
    anyhow::ensure!(!cfg.host.trim().is_empty(), "client.host is empty");
    anyhow::ensure!(cfg.port != 0, "client.port must be non-zero");
    anyhow::ensure!(
        cfg.request_timeout_ms >= 1 && cfg.request_timeout_ms <= MAX_REQUEST_TIMEOUT_MS,
        "client.request_timeout_ms should be 1..={}",
        MAX_REQUEST_TIMEOUT_MS
    );
    check_buffers("client", cfg.recv_buffer_bytes, cfg.send_buffer_bytes)?;
    anyhow::ensure!(
        cfg.peer_name.len() + 16 <= cfg.send_buffer_bytes,
        "client.peer_name does not fit the send buffer"
    );
    Ok(())
}

pub fn check_server(cfg: &ServerConfig) -> Result<()> {
    check_buffers("server", cfg.recv_buffer_bytes, cfg.send_buffer_bytes)?;
    let mut seen = HashSet::new();
    for entry in &cfg.vars {
        anyhow::ensure!(seen.insert(&entry.id), "server.vars: duplicate variable {}", entry.id);
        if let VariableValue::Float(v) = entry.value {
            anyhow::ensure!(
                is_representable_float(v),
                "server.vars: {} = {} cannot be sent; floats must be positive and finite",
                entry.id,
                v
            );
        }
    }
    Ok(())
}

fn check_buffers(section: &str, recv: usize, send: usize) -> Result<()> {
    let min = MIN_BUFFER_BYTES.max(MAX_FIXED_FRAME_SIZE);
    anyhow::ensure!(recv >= min, "{}.recv_buffer_bytes too small; set >= {}", section, min);
    anyhow::ensure!(send >= min, "{}.send_buffer_bytes too small; set >= {}", section, min);
    Ok(())
}
