//! Runtime configuration for the orchestrator.

use std::path::PathBuf;

/// Default HTTP port when `PORT` is unset
pub const DEFAULT_PORT: u16 = 8080;

/// First port of the default gateway range
pub const DEFAULT_GATEWAY_PORT_START: u16 = 7681;

/// Last port of the default gateway range
pub const DEFAULT_GATEWAY_PORT_END: u16 = 7781;

/// Resolved configuration for a server run
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port
    pub port: u16,

    /// Remote mode: start the public tunnel and require auth for
    /// non-local requests
    pub remote: bool,

    /// Allow-list of selectable repository paths (empty = any repo)
    pub allowed_repos: Vec<PathBuf>,

    /// Inclusive port range handed to the gateway allocator
    pub gateway_ports: (u16, u16),

    /// Terminal multiplexer binary
    pub tmux_bin: String,

    /// Web-terminal binary
    pub ttyd_bin: String,

    /// Tunnel binary
    pub cloudflared_bin: String,

    /// Command sent into a freshly created window to start the agent
    pub agent_cmd: String,

    /// Preconfigured public URL for named tunnel mode
    pub named_tunnel: Option<NamedTunnel>,
}

/// Settings for a preconfigured (named) tunnel
#[derive(Debug, Clone)]
pub struct NamedTunnel {
    /// Tunnel name passed to `cloudflared tunnel run`
    pub name: String,

    /// Public URL the tunnel serves
    pub url: String,
}

impl Default for Config {
    fn default() -> Self {
        // Named mode needs both the tunnel name and its public URL
        let named_tunnel = match (
            std::env::var("CCMUX_TUNNEL_NAME"),
            std::env::var("CCMUX_TUNNEL_URL"),
        ) {
            (Ok(name), Ok(url)) => Some(NamedTunnel { name, url }),
            _ => None,
        };

        Self {
            port: DEFAULT_PORT,
            remote: false,
            allowed_repos: Vec::new(),
            gateway_ports: (DEFAULT_GATEWAY_PORT_START, DEFAULT_GATEWAY_PORT_END),
            tmux_bin: env_or("CCMUX_TMUX_BIN", "tmux"),
            ttyd_bin: env_or("CCMUX_TTYD_BIN", "ttyd"),
            cloudflared_bin: env_or("CCMUX_CLOUDFLARED_BIN", "cloudflared"),
            agent_cmd: env_or("CCMUX_AGENT_CMD", "claude"),
            named_tunnel,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(!config.remote);
        assert!(config.allowed_repos.is_empty());
        assert!(config.gateway_ports.0 < config.gateway_ports.1);
    }
}
