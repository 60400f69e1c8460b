//! Host-port allocation for project containers.
//!
//! Ports come from a fixed range shared by every project. A candidate is
//! only returned after a bind probe confirms nothing currently listens on
//! it; allocation gives up after a bounded number of attempts. The probe
//! cannot reserve the port, so two pipelines racing between probe and
//! container start can still collide; the bounded retry at the queue
//! level absorbs that.

use std::net::TcpListener;

use rand::Rng;

use crate::errors::DeployError;

pub const PORT_RANGE_START: u16 = 8000;
pub const PORT_RANGE_END: u16 = 9999;
const MAX_ATTEMPTS: u32 = 50;

/// Pick an unused host port in `[8000, 9999]`.
pub fn allocate_host_port() -> Result<u16, DeployError> {
    allocate_in(PORT_RANGE_START, PORT_RANGE_END, MAX_ATTEMPTS)
}

fn allocate_in(start: u16, end: u16, attempts: u32) -> Result<u16, DeployError> {
    let mut rng = rand::thread_rng();
    for _ in 0..attempts {
        let candidate = rng.gen_range(start..=end);
        if TcpListener::bind(("127.0.0.1", candidate)).is_ok() {
            return Ok(candidate);
        }
    }
    Err(DeployError::RunFailed(format!(
        "no free host port found in [{}, {}] after {} attempts",
        start, end, attempts
    )))
}
