use std::{io::ErrorKind, net::TcpListener};

use anyhow::Context;

/// Picks the port an engine process will listen on.
///
/// A non-zero `preferred` port is only checked for availability. Otherwise the OS hands
/// out an ephemeral port, skipping anything in `reserved` (ports already promised to the
/// same launch, like the server port when choosing a topic port).
pub fn allocate_tcp_port(preferred: u16, reserved: &[u16]) -> anyhow::Result<u16> {
    if preferred != 0 {
        if reserved.contains(&preferred) {
            anyhow::bail!("port {preferred} is already assigned to this launch");
        }
        match TcpListener::bind(("0.0.0.0", preferred)) {
            Ok(l) => {
                l.set_nonblocking(true).ok();
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                anyhow::bail!("port already in use: {preferred}");
            }
            Err(e) => {
                return Err(e).context(format!("bind port {preferred}"));
            }
        }
        return Ok(preferred);
    }

    for _ in 0..16 {
        let listener = TcpListener::bind(("0.0.0.0", 0)).context("bind ephemeral port")?;
        let port = listener.local_addr()?.port();
        if !reserved.contains(&port) {
            return Ok(port);
        }
    }
    anyhow::bail!("could not find a free port outside {reserved:?}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_port_skips_reserved() {
        let first = allocate_tcp_port(0, &[]).unwrap();
        let second = allocate_tcp_port(0, &[first]).unwrap();
        assert_ne!(first, second);
        assert_ne!(second, 0);
    }

    #[test]
    fn busy_preferred_port_is_rejected() {
        let held = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = held.local_addr().unwrap().port();
        let err = allocate_tcp_port(port, &[]).unwrap_err();
        assert!(err.to_string().contains("already in use"));
        drop(held);
        assert_eq!(allocate_tcp_port(port, &[]).unwrap(), port);
    }

    #[test]
    fn reserved_preferred_port_is_rejected() {
        assert!(allocate_tcp_port(4000, &[4000]).is_err());
    }
}
