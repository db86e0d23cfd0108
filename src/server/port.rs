use std::net::TcpListener;

use log::{debug, warn};

use crate::config::PortPolicy;
use crate::error::RuntimeError;
use crate::server::registry::ServerRegistry;

/// How many ephemeral allocations to try before giving up when the OS keeps
/// handing back ports the registry still considers occupied.
const ALLOC_RETRIES: u32 = 8;

/// Ask the OS for an available ephemeral port.
///
/// Binds to port 0, reads back the assigned port and immediately closes the
/// socket. This is inherently racy: another process may claim the port before
/// our server binds it, so callers treat a later bind failure as recoverable
/// (allocate again), not fatal.
fn allocate_ephemeral() -> Result<u16, RuntimeError> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .map_err(|e| RuntimeError::PortAllocationFailure(e.to_string()))?;
    let port = listener
        .local_addr()
        .map_err(|e| RuntimeError::PortAllocationFailure(e.to_string()))?
        .port();
    drop(listener);
    Ok(port)
}

/// Allocate a port for a new server instance, honoring the configured policy
/// and the registry's port-uniqueness invariant: no two non-stopped instances
/// may share a port.
pub fn allocate_port(registry: &ServerRegistry, policy: PortPolicy) -> Result<u16, RuntimeError> {
    match policy {
        PortPolicy::Fixed(port) => {
            if registry.port_in_use(port) {
                return Err(RuntimeError::PortAllocationFailure(format!(
                    "fixed port {port} is already in use by a registered server"
                )));
            }
            Ok(port)
        }
        PortPolicy::Ephemeral => {
            for attempt in 0..ALLOC_RETRIES {
                let port = allocate_ephemeral()?;
                if !registry.port_in_use(port) {
                    debug!("Allocated port {} (attempt {})", port, attempt + 1);
                    return Ok(port);
                }
                warn!(
                    "OS handed back port {} which is already registered, retrying",
                    port
                );
            }
            Err(RuntimeError::PortAllocationFailure(format!(
                "no free port found after {ALLOC_RETRIES} attempts"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use tokio_util::sync::CancellationToken;

    use crate::artifacts::catalog::ArtifactRef;
    use crate::server::registry::{ServerInstance, ServerState};

    #[test]
    fn test_ephemeral_allocation_returns_bindable_port() {
        let registry = ServerRegistry::new();
        let port = allocate_port(&registry, PortPolicy::Ephemeral).unwrap();
        assert!(port > 0);
        // The port was released, so binding it again succeeds.
        TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    #[test]
    fn test_two_instances_never_share_a_port() {
        let registry = ServerRegistry::new();
        let first = allocate_port(&registry, PortPolicy::Ephemeral).unwrap();
        registry.register(
            ServerInstance {
                pid: 1,
                port: first,
                model: ArtifactRef::model("manas", "1.0"),
                runtime: ArtifactRef::runtime("python-common", "2025.1"),
                state: ServerState::Starting,
                started_at: Instant::now(),
                shutdown_token: String::new(),
            },
            CancellationToken::new(),
        );
        let second = allocate_port(&registry, PortPolicy::Ephemeral).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_fixed_port_refused_when_occupied() {
        let registry = ServerRegistry::new();
        registry.register(
            ServerInstance {
                pid: 1,
                port: 8002,
                model: ArtifactRef::model("manas", "1.0"),
                runtime: ArtifactRef::runtime("python-common", "2025.1"),
                state: ServerState::Healthy,
                started_at: Instant::now(),
                shutdown_token: String::new(),
            },
            CancellationToken::new(),
        );
        let err = allocate_port(&registry, PortPolicy::Fixed(8002)).unwrap_err();
        assert!(matches!(err, RuntimeError::PortAllocationFailure(_)));
        assert_eq!(allocate_port(&registry, PortPolicy::Fixed(8003)).unwrap(), 8003);
    }
}
