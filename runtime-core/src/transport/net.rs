//! Host address discovery for published endpoints.

use tokio::net::lookup_host;

use crate::config::TransportConfig;
use crate::error::{Result, RuntimeError};

/// IP address other hosts can use to reach this process.
///
/// Uses the configured `bind_host` when set. Otherwise resolves the local
/// hostname and picks its first IPv4 address, falling back to loopback.
pub async fn host_ip(config: &TransportConfig) -> Result<String> {
    if let Some(host) = &config.bind_host {
        return Ok(host.clone());
    }

    let name = hostname::get()
        .map_err(|e| RuntimeError::transport_with_source("failed to read hostname", e))?
        .to_string_lossy()
        .to_string();

    let resolved = match lookup_host((name.as_str(), 0)).await {
        Ok(addrs) => addrs.filter(|a| a.is_ipv4()).map(|a| a.ip()).next(),
        Err(e) => {
            tracing::debug!(hostname = %name, error = %e, "hostname lookup failed");
            None
        }
    };

    Ok(resolved.map_or_else(|| "127.0.0.1".to_string(), |ip| ip.to_string()))
}

mod hostname {
    use std::ffi::OsString;

    pub fn get() -> std::io::Result<OsString> {
        #[cfg(unix)]
        {
            use std::os::unix::ffi::OsStringExt;
            let mut buf = vec![0u8; 256];
            // SAFETY: gethostname writes a null-terminated string into buf
            let ret = unsafe {
                ::libc::gethostname(buf.as_mut_ptr() as *mut ::libc::c_char, buf.len())
            };
            if ret != 0 {
                return Err(std::io::Error::last_os_error());
            }
            let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            buf.truncate(len);
            Ok(OsString::from_vec(buf))
        }

        #[cfg(not(unix))]
        {
            Ok(OsString::from("localhost"))
        }
    }
}
