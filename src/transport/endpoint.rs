//! Endpoint addresses: `tcp://host:port`, `ipc://path`, `inproc://name`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use super::TransportError;

/// Wildcard accepted for a TCP port, a TCP host, or an IPC path.
pub const WILDCARD: &str = "*";

/// Parsed endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP address. Port 0 means "any free port" when binding.
    Tcp { host: String, port: u16 },
    /// Unix domain socket path. `None` means "fresh temporary path" when binding.
    Ipc(Option<PathBuf>),
    /// In-process endpoint name.
    Inproc(String),
}

impl Endpoint {
    pub fn scheme(&self) -> &'static str {
        match self {
            Endpoint::Tcp { .. } => "tcp",
            Endpoint::Ipc(_) => "ipc",
            Endpoint::Inproc(_) => "inproc",
        }
    }

    /// True if the endpoint still has wildcards that only `bind` can resolve.
    pub fn is_wildcard(&self) -> bool {
        match self {
            Endpoint::Tcp { host, port } => *port == 0 || host == WILDCARD,
            Endpoint::Ipc(path) => path.is_none(),
            Endpoint::Inproc(_) => false,
        }
    }

    /// Host and port suitable for a socket bind (`*` becomes all interfaces).
    pub(crate) fn tcp_bind_addr(host: &str, port: u16) -> String {
        let host = if host == WILDCARD { "0.0.0.0" } else { host };
        if host.contains(':') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        }
    }

    /// Fresh socket path in the temporary directory.
    pub(crate) fn temp_ipc_path() -> PathBuf {
        std::env::temp_dir().join(format!(
            "hwmpipe-{}.sock",
            uuid::Uuid::new_v4().simple()
        ))
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransportError::InvalidEndpoint(s.to_string());
        let (scheme, address) = s.split_once("://").ok_or_else(invalid)?;
        if address.is_empty() {
            return Err(invalid());
        }

        match scheme {
            "tcp" => {
                let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
                let host = host.trim_start_matches('[').trim_end_matches(']');
                if host.is_empty() {
                    return Err(invalid());
                }
                let port = if port == WILDCARD {
                    0
                } else {
                    port.parse::<u16>().map_err(|_| invalid())?
                };
                Ok(Endpoint::Tcp {
                    host: host.to_string(),
                    port,
                })
            }
            "ipc" => {
                if address == WILDCARD {
                    Ok(Endpoint::Ipc(None))
                } else {
                    Ok(Endpoint::Ipc(Some(PathBuf::from(address))))
                }
            }
            "inproc" => Ok(Endpoint::Inproc(address.to_string())),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => {
                let port = if *port == 0 {
                    WILDCARD.to_string()
                } else {
                    port.to_string()
                };
                if host.contains(':') {
                    write!(f, "tcp://[{}]:{}", host, port)
                } else {
                    write!(f, "tcp://{}:{}", host, port)
                }
            }
            Endpoint::Ipc(Some(path)) => write!(f, "ipc://{}", path.display()),
            Endpoint::Ipc(None) => write!(f, "ipc://{}", WILDCARD),
            Endpoint::Inproc(name) => write!(f, "inproc://{}", name),
        }
    }
}
