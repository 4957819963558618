use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

use crate::io::RetryPolicy;
use crate::server::ServerConfig;
use crate::zip::CompressionMethod;

const DEFAULT_LISTEN: &str = "0.0.0.0:4008";

#[derive(Parser, Debug)]
#[command(name = "zipstreamer")]
#[command(version)]
#[command(about = "Stream remote files to HTTP clients as a single ZIP archive", long_about = None)]
#[command(after_help = "Examples:\n  \
  zipstreamer                              listen on 0.0.0.0:4008\n  \
  zipstreamer --compression deflate        deflate every member\n  \
  PORT=8080 zipstreamer --log-json         listen on 0.0.0.0:8080, JSON logs")]
pub struct Cli {
    /// Address to listen on [default: 0.0.0.0:4008, or 0.0.0.0:$PORT]
    #[arg(long, env = "ZS_LISTEN", value_name = "ADDR")]
    pub listen: Option<String>,

    /// Compression method for archive members (store, deflate)
    #[arg(long, env = "ZS_COMPRESSION", default_value_t = CompressionMethod::Stored)]
    pub compression: CompressionMethod,

    /// Prefix that `zsid` is appended to when fetching list files
    #[arg(long, env = "ZS_URL_PREFIX", value_name = "URL")]
    pub listfile_url_prefix: Option<String>,

    /// Basic auth password sent with list file requests
    #[arg(long, env = "ZS_LISTFILE_BASIC_AUTH", value_name = "PASSWORD", hide_env_values = true)]
    pub listfile_basic_auth: Option<String>,

    /// Source URLs containing this marker are read through the S3 API
    /// (with the default AWS credential chain). Unset, every source is
    /// fetched over plain HTTP, so deployments serving private buckets
    /// must set it, e.g. to the bucket name.
    #[arg(long, env = "ZS_OBJECT_STORE_MARKER", value_name = "MARKER")]
    pub object_store_marker: Option<String>,

    /// Seconds a download link stays valid
    #[arg(long, env = "ZS_LINK_TTL_SECS", default_value_t = 60, value_name = "SECS")]
    pub link_ttl_secs: u64,

    /// Attempts per source before it is given up on
    #[arg(long, env = "ZS_FETCH_ATTEMPTS", default_value_t = 5, value_name = "N")]
    pub fetch_attempts: u32,

    /// Connect and read timeout for each fetch attempt
    #[arg(long, env = "ZS_FETCH_TIMEOUT_SECS", default_value_t = 30, value_name = "SECS")]
    pub fetch_timeout_secs: u64,

    /// Emit logs as JSON lines
    #[arg(long, env = "ZS_LOG_JSON")]
    pub log_json: bool,
}

impl Cli {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let port = std::env::var("PORT").ok();
        resolve_listen(self.listen.as_deref(), port.as_deref())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default().with_max_attempts(self.fetch_attempts)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn link_ttl(&self) -> Duration {
        Duration::from_secs(self.link_ttl_secs)
    }

    pub fn object_store_marker(&self) -> Option<&str> {
        self.object_store_marker.as_deref().filter(|m| !m.is_empty())
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            listfile_url_prefix: self.listfile_url_prefix.clone().filter(|p| !p.is_empty()),
            listfile_basic_auth: self.listfile_basic_auth.clone(),
        }
    }
}

fn resolve_listen(listen: Option<&str>, port: Option<&str>) -> Result<SocketAddr> {
    let addr = match (listen, port) {
        (Some(listen), _) => listen.to_string(),
        (None, Some(port)) if !port.is_empty() => format!("0.0.0.0:{port}"),
        _ => DEFAULT_LISTEN.to_string(),
    };
    addr.parse()
        .with_context(|| format!("invalid listen address `{addr}`"))
}
