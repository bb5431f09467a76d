use std::time::Duration;

use clap::Parser;

/// Command line and environment configuration for the proxy server.
#[derive(Parser, Debug, Clone)]
#[command(name = "rewrite-proxy")]
#[command(version, about = "Forward proxy that rewrites pages to route every link back through itself", long_about = None)]
pub struct Config {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0", env = "PROXY_BIND")]
    pub bind: String,

    /// Port to listen on (0 picks a free port)
    #[arg(short, long, default_value_t = 8000, env = "PORT")]
    pub port: u16,

    /// Ceiling for a whole upstream request, in seconds
    #[arg(long, default_value_t = 60, env = "PROXY_UPSTREAM_TIMEOUT")]
    pub upstream_timeout: u64,

    /// Ceiling for establishing an upstream connection, in seconds
    #[arg(long, default_value_t = 10, env = "PROXY_CONNECT_TIMEOUT")]
    pub connect_timeout: u64,

    /// Redirect hops followed before the last response is returned as-is
    #[arg(long, default_value_t = 10, env = "PROXY_MAX_REDIRECTS")]
    pub max_redirects: usize,

    /// Idle time after which a client session is evicted, in seconds
    #[arg(long, default_value_t = 3600, env = "PROXY_SESSION_TTL")]
    pub session_ttl: u64,

    /// How often idle sessions are swept, in seconds
    #[arg(long, default_value_t = 300, env = "PROXY_SWEEP_INTERVAL")]
    pub sweep_interval: u64,

    /// Emit logs as JSON lines
    #[arg(long, env = "PROXY_LOG_JSON")]
    pub log_json: bool,
}

impl Config {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval.max(1))
    }

    /// The configured port, or a free one when the port is 0.
    pub fn resolve_port(&self) -> Option<u16> {
        if self.port == 0 {
            portpicker::pick_unused_port()
        } else {
            Some(self.port)
        }
    }
}
