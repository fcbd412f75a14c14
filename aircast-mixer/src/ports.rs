//! RTP port allocation.
//!
//! RTP wants an even port with the odd neighbor free for RTCP. Probing
//! binds both UDP ports and releases them immediately; the small window
//! between probe and FFmpeg start is tolerated (FFmpeg fails loudly and
//! the next convergence pass retries).

use rand::Rng;
use std::net::UdpSocket;

use aircast_core::{Error, Result};

const MAX_ATTEMPTS: usize = 10;

/// Pick a random even port in `[start, end]` whose `(port, port+1)` pair
/// binds, falling back to the ephemeral range.
pub fn allocate_rtp_port(start: u16, end: u16) -> Result<u16> {
    if start >= end {
        return Err(Error::InvalidInput(format!(
            "Invalid port range: {start}-{end}"
        )));
    }

    let mut rng = rand::thread_rng();
    // Even candidates whose odd neighbor also fits in the range
    let first_even = (start + 1) & !1;
    let last_even = (end - 1) & !1;
    if last_even < first_even {
        return Err(Error::InvalidInput(format!(
            "Port range {start}-{end} holds no RTP pair"
        )));
    }

    for _ in 0..MAX_ATTEMPTS {
        let offset = rng.gen_range(0..=u32::from((last_even - first_even) / 2));
        let port = first_even + 2 * offset as u16;
        if probe_pair(port) {
            return Ok(port);
        }
    }

    // Configured range exhausted; let the OS pick, then realign to even.
    for _ in 0..MAX_ATTEMPTS {
        let Ok(socket) = UdpSocket::bind(("0.0.0.0", 0)) else {
            continue;
        };
        let Ok(addr) = socket.local_addr() else {
            continue;
        };
        drop(socket);
        let port = addr.port() & !1;
        if port != 0 && probe_pair(port) {
            return Ok(port);
        }
    }

    Err(Error::Unavailable("No free RTP port pair found".to_string()))
}

fn probe_pair(port: u16) -> bool {
    if port == u16::MAX {
        return false;
    }
    let rtp = UdpSocket::bind(("0.0.0.0", port));
    let rtcp = UdpSocket::bind(("0.0.0.0", port + 1));
    rtp.is_ok() && rtcp.is_ok()
}
