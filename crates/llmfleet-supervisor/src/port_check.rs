use std::{io::ErrorKind, net::TcpListener};

use crate::error::SpawnError;

/// Fails when some process on this host (ours or foreign) already listens on `port`.
pub fn ensure_host_port_free(host: &str, port: u16) -> Result<(), SpawnError> {
    match TcpListener::bind((host, port)) {
        Ok(l) => {
            drop(l);
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::AddrInUse => Err(SpawnError::PortBound { port }),
        Err(e) => {
            // Unresolvable hosts and similar are left to the server itself to report.
            tracing::debug!(%e, host, port, "host port pre-check inconclusive");
            Ok(())
        }
    }
}
