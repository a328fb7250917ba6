//! Platform hooks - Memory reclamation hints and local port probing

use std::net::{Ipv4Addr, TcpListener};

use tracing::trace;

/// Ask the host runtime to hand freed memory back to the OS
///
/// Only a hint. Returns whether anything was actually released, which most
/// platforms cannot tell.
pub fn request_reclamation() -> bool {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        // SAFETY: malloc_trim has no preconditions and only touches allocator state.
        let released = unsafe { libc::malloc_trim(0) } != 0;
        trace!("malloc_trim released memory: {}", released);
        released
    }
    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    {
        trace!("No reclamation hook on this platform");
        false
    }
}

/// Check whether a local TCP port can be bound right now
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

/// First bindable TCP port at or above `min`
pub fn find_available_tcp_port(min: u16) -> Option<u16> {
    (min..=u16::MAX).find(|&port| is_port_available(port))
}
