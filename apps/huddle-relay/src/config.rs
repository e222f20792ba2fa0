use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

pub const DEFAULT_PORT: u16 = 8000;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: IpAddr,
    pub port: u16,
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env::var("HUDDLE_RELAY_HOST")
                .ok()
                .and_then(|h| h.parse().ok())
                .unwrap_or(defaults.host),
            port: env::var("HUDDLE_RELAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    fn clear() {
        unsafe {
            env::remove_var("HUDDLE_RELAY_HOST");
            env::remove_var("HUDDLE_RELAY_PORT");
        }
    }

    #[test]
    fn listens_on_8000_by_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear();
        let config = RelayConfig::from_env();
        assert_eq!(config.addr(), "0.0.0.0:8000".parse().unwrap());
    }

    #[test]
    fn port_and_host_come_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear();
        unsafe {
            env::set_var("HUDDLE_RELAY_PORT", "9100");
            env::set_var("HUDDLE_RELAY_HOST", "127.0.0.1");
        }
        let config = RelayConfig::from_env();
        assert_eq!(config.addr(), "127.0.0.1:9100".parse().unwrap());
        clear();
    }

    #[test]
    fn bad_port_falls_back() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear();
        unsafe {
            env::set_var("HUDDLE_RELAY_PORT", "eighty");
        }
        assert_eq!(RelayConfig::from_env().port, DEFAULT_PORT);
        clear();
    }
}
