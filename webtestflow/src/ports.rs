//! TCP port discovery for stages that spawn listening processes.

use std::collections::BTreeSet;
use tokio::net::TcpListener;

use crate::errors::{Result, WebtestflowError};

/// The default floor for port searches.
pub const DEFAULT_START_PORT: u16 = 9528;

/// Finds a bindable TCP port at or above `start_port`, skipping `exclude`.
///
/// Candidates in the exclusion set are skipped without probing the OS, so a
/// contiguous run of leased ports costs no socket churn. Every other
/// candidate is probed by binding a listener, which is released immediately
/// on success. Any bind failure, not only address-in-use, advances the
/// search to the next candidate.
///
/// # Errors
///
/// Returns [`WebtestflowError::NoAvailablePort`] once the candidate would
/// exceed 65535.
pub async fn find_available_port(start_port: u16, exclude: &BTreeSet<u16>) -> Result<u16> {
    let mut candidate = u32::from(start_port);

    loop {
        while candidate <= 65535 && exclude.contains(&(candidate as u16)) {
            candidate += 1;
        }

        if candidate > 65535 {
            return Err(WebtestflowError::NoAvailablePort { start_port });
        }

        match TcpListener::bind(("0.0.0.0", candidate as u16)).await {
            Ok(listener) => {
                drop(listener);
                return Ok(candidate as u16);
            }
            Err(err) => {
                tracing::trace!(port = candidate, error = %err, "port probe failed, trying next");
                candidate += 1;
            }
        }
    }
}
