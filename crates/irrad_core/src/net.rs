//! Port allocation and address checks.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::net::TcpListener;

use crate::error::{CoreError, CoreResult};

/// Bind a listener to a free port inside `[min, max]`.
///
/// The starting port is derived from the clock so concurrent processes on
/// one host spread across the range; from there the range is walked
/// linearly for at most `max_tries` attempts.
pub async fn bind_in_range(min: u16, max: u16, max_tries: u16) -> CoreResult<(TcpListener, u16)> {
    let span = u32::from(max - min) + 1;
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let start = seed % span;

    for attempt in 0..u32::from(max_tries).min(span) {
        let port = min + ((start + attempt) % span) as u16;
        if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)).await {
            return Ok((listener, port));
        }
    }

    Err(CoreError::PortsExhausted {
        min,
        max,
        tries: max_tries,
    })
}

/// Validate a `host:port` address string for channel subscriptions.
pub fn check_addr(addr: &str) -> CoreResult<&str> {
    let Some((host, port)) = addr.rsplit_once(':') else {
        return Err(CoreError::BadAddress(addr.to_string()));
    };
    if host.is_empty() || port.parse::<u16>().map(|p| p == 0).unwrap_or(true) {
        return Err(CoreError::BadAddress(addr.to_string()));
    }
    Ok(addr)
}

/// Format a `host:port` address a subscriber can connect to.
pub fn tcp_addr(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_inside_the_requested_range() {
        let (_listener, port) = bind_in_range(8000, 9000, 100).await.unwrap();
        assert!((8000..=9000).contains(&port));
    }

    #[tokio::test]
    async fn reports_exhaustion_when_the_range_is_taken() {
        // Occupy a single-port range, then ask for another bind in it.
        let (taken, port) = bind_in_range(18350, 18350, 1).await.unwrap();
        let result = bind_in_range(port, port, 3).await;
        drop(taken);
        assert!(matches!(result, Err(CoreError::PortsExhausted { .. })));
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(check_addr("localhost:8123").is_ok());
        assert!(check_addr("8123").is_err());
        assert!(check_addr(":8123").is_err());
        assert!(check_addr("localhost:notaport").is_err());
        assert!(check_addr("localhost:0").is_err());
    }
}
