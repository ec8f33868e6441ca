use std::net::SocketAddr;
use std::path::PathBuf;

use abyss_shared::constants::DEFAULT_ALLOWED_PORT;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub media_root: PathBuf,
    pub allowed_ports: Vec<u16>,
    pub debug_mode: bool,
    pub http_addr: SocketAddr,
    pub db_path: Option<PathBuf>,
    pub ctl_socket: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            media_root: PathBuf::from("/opt"),
            allowed_ports: vec![DEFAULT_ALLOWED_PORT],
            debug_mode: false,
            http_addr: ([0, 0, 0, 0], 8080).into(),
            db_path: None,
            ctl_socket: std::env::temp_dir().join("abyss-ctl.sock"),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(root) = std::env::var("MEDIA_ROOT") {
            config.media_root = PathBuf::from(root);
        }

        if let Ok(ports) = std::env::var("ALLOWED_PORTS") {
            config.allowed_ports = parse_ports(&ports);
        }

        if let Ok(mode) = std::env::var("DEBUG_MODE") {
            config.debug_mode = mode == "Debug";
        }

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(path) = std::env::var("DB_PATH") {
            config.db_path = Some(PathBuf::from(path));
        }

        if let Ok(path) = std::env::var("CTL_SOCKET") {
            config.ctl_socket = PathBuf::from(path);
        }

        config
    }
}

/// Space-separated port list; malformed entries are skipped with a warning
/// and an empty result falls back to the default.
fn parse_ports(raw: &str) -> Vec<u16> {
    let mut ports = Vec::new();
    for part in raw.split_whitespace() {
        match part.parse::<u16>() {
            Ok(p) => ports.push(p),
            Err(_) => tracing::warn!(value = %part, "Skipping invalid entry in ALLOWED_PORTS"),
        }
    }
    if ports.is_empty() {
        vec![DEFAULT_ALLOWED_PORT]
    } else {
        ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.media_root, PathBuf::from("/opt"));
        assert_eq!(config.allowed_ports, vec![443]);
        assert!(!config.debug_mode);
    }

    #[test]
    fn parse_port_list() {
        assert_eq!(parse_ports("443 8080 22"), vec![443, 8080, 22]);
        assert_eq!(parse_ports("443 nope 22"), vec![443, 22]);
        assert_eq!(parse_ports("garbage"), vec![443]);
        assert_eq!(parse_ports(""), vec![443]);
    }
}
