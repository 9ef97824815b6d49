//! Blocking connection establishment with retry.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tracing::debug;

use simnet_core::address::extract_interface_and_port_string;
use simnet_core::{NetworkError, NetworkResult};

use crate::connection::{Connection, DEFAULT_BUFFER_SIZE};
use crate::factory::SocketFactory;

const MIN_PROGRESS: Duration = Duration::from_millis(100);
const RETRY_PAUSE: Duration = Duration::from_millis(200);
const GRACE_WAIT: Duration = Duration::from_millis(400);

/// Connects to `host:port`, retrying until connected or `timeout` elapses.
///
/// A zero `timeout` returns the connecting connection without waiting.
/// Each failed attempt is closed before the next one starts; at least two
/// attempts are made before giving up with [`NetworkError::Timeout`].
pub fn establish_connection(
    factory: &SocketFactory,
    handle: &Handle,
    host: &str,
    port: &str,
    timeout: Duration,
) -> NetworkResult<Arc<Connection>> {
    let mut connection = Connection::connect(factory, handle, host, port, DEFAULT_BUFFER_SIZE)?;
    if timeout.is_zero() {
        return Ok(connection);
    }

    let started = Instant::now();
    let mut wait = timeout;
    let mut previous_remaining = timeout;
    let mut attempts = 1;
    while !connection.wait_until_connected(Some(wait)) {
        let elapsed = started.elapsed();
        let expired = elapsed >= timeout;
        connection.close();
        if expired && attempts > 1 {
            debug!("Giving up on {}:{} after {} attempts", host, port, attempts);
            return Err(NetworkError::Timeout {
                operation: format!("connect to {host}:{port}"),
                timeout,
            });
        }

        let remaining = timeout.saturating_sub(elapsed);
        if previous_remaining.saturating_sub(remaining) < MIN_PROGRESS {
            thread::sleep(RETRY_PAUSE);
        }
        previous_remaining = remaining;
        wait = if expired { GRACE_WAIT } else { remaining };

        attempts += 1;
        connection = Connection::connect(factory, handle, host, port, DEFAULT_BUFFER_SIZE)?;
    }
    Ok(connection)
}

/// [`establish_connection`] for an `interface:port` address string.
pub fn establish_connection_to(
    factory: &SocketFactory,
    handle: &Handle,
    address: &str,
    timeout: Duration,
) -> NetworkResult<Arc<Connection>> {
    let (host, port) = extract_interface_and_port_string(address);
    establish_connection(factory, handle, &host, &port, timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::IoContext;

    #[test]
    fn test_connects_to_listening_port() {
        let ctx = IoContext::new("ops-connect").unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port().to_string();

        let connection = establish_connection(
            &SocketFactory::new(),
            &ctx.handle(),
            "127.0.0.1",
            &port,
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(connection.is_connected());
        connection.close();
    }

    #[test]
    fn test_times_out_without_listener() {
        let ctx = IoContext::new("ops-timeout").unwrap();
        let port = {
            let scratch = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            scratch.local_addr().unwrap().port()
        };

        let begun = Instant::now();
        let err = establish_connection_to(
            &SocketFactory::new(),
            &ctx.handle(),
            &format!("127.0.0.1:{port}"),
            Duration::from_millis(400),
        )
        .unwrap_err();
        assert!(matches!(err, NetworkError::Timeout { .. }));
        assert!(begun.elapsed() >= Duration::from_millis(400));
    }

    #[test]
    fn test_zero_timeout_returns_immediately() {
        let ctx = IoContext::new("ops-nowait").unwrap();
        let connection = establish_connection(
            &SocketFactory::new(),
            &ctx.handle(),
            "127.0.0.1",
            "1",
            Duration::ZERO,
        )
        .unwrap();
        assert!(!connection.wait_until_connected(Some(Duration::from_secs(2))));
        assert!(connection.has_connection_error());
        connection.close();
    }
}
