//! # Bind With Retry
//!
//! Subscription endpoints listen on a port picked at random from a range.
//! A taken port is not an error: another random port is drawn and the bind
//! is retried. By default there is no attempt cap, so a saturated range keeps
//! the caller spinning. `BindPolicy::max_attempts` exists so tests (and
//! cautious deployments) can bound it.
//!
//! Ports below 1024 in the default range need privileges. A permission error
//! is therefore handled like a taken port.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use mio::net::TcpListener;
use rand::Rng;

use crate::error::{MonitorError, MonitorResult};

/// # Port Range
///
/// Inclusive range of candidate ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    /// Lowest port of the default subscription range.
    pub const DEFAULT_START: u16 = 1000;
    /// Highest port of the default subscription range.
    pub const DEFAULT_END: u16 = 65000;

    /// Validates and builds `start..=end`. Port 0 is not a candidate.
    pub fn new(start: u16, end: u16) -> MonitorResult<Self> {
        if start == 0 || start > end {
            return Err(MonitorError::InvalidPortRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// First candidate port.
    pub fn start(&self) -> u16 {
        self.start
    }

    /// Last candidate port (inclusive).
    pub fn end(&self) -> u16 {
        self.end
    }

    /// Whether `port` is inside the range.
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    /// Draws a uniformly distributed port from the range.
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> u16 {
        rng.random_range(self.start..=self.end)
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: Self::DEFAULT_START,
            end: Self::DEFAULT_END,
        }
    }
}

/// # Bind Policy
///
/// Where and how hard to look for a free port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindPolicy {
    /// Interface the listener binds to.
    pub ip: IpAddr,
    /// Candidate ports.
    pub range: PortRange,
    /// `None` retries forever.
    pub max_attempts: Option<usize>,
    /// Ports never handed out (e.g. the ingestion port).
    pub reserved: Vec<u16>,
}

impl Default for BindPolicy {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            range: PortRange::default(),
            max_attempts: None,
            reserved: Vec::new(),
        }
    }
}

fn port_unavailable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied
    )
}

/// # Bind With Retry
///
/// Draws ports from `policy.range` until a listener binds. Taken and
/// privileged ports (and reserved ones) trigger a fresh draw. Any other bind
/// error is returned immediately.
pub fn bind_with_retry<R>(policy: &BindPolicy, rng: &mut R) -> MonitorResult<(TcpListener, u16)>
where
    R: Rng + ?Sized,
{
    let mut attempts = 0usize;
    loop {
        if let Some(max) = policy.max_attempts {
            if attempts >= max {
                return Err(MonitorError::PortsExhausted {
                    start: policy.range.start(),
                    end: policy.range.end(),
                    attempts,
                });
            }
        }
        attempts += 1;

        let port = policy.range.pick(rng);
        if policy.reserved.contains(&port) {
            continue;
        }

        let addr = SocketAddr::new(policy.ip, port);
        match TcpListener::bind(addr) {
            Ok(listener) => {
                log::debug!("Bound {} after {} attempt(s)", addr, attempts);
                return Ok((listener, port));
            }
            Err(e) if port_unavailable(&e) => {
                log::trace!("Port {} unavailable ({}), drawing another", port, e);
            }
            Err(source) => return Err(MonitorError::Bind { addr, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn loopback_policy(range: PortRange, max_attempts: Option<usize>) -> BindPolicy {
        BindPolicy {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            range,
            max_attempts,
            reserved: Vec::new(),
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn test_port_range_validation() {
        assert!(PortRange::new(2000, 1000).is_err());
        assert!(PortRange::new(0, 10).is_err());
        let range = PortRange::new(5000, 5000).unwrap();
        assert!(range.contains(5000));
        assert!(!range.contains(5001));
        assert_eq!(PortRange::default().start(), 1000);
        assert_eq!(PortRange::default().end(), 65000);
    }

    #[test]
    fn test_pick_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        let range = PortRange::new(40000, 40010).unwrap();
        for _ in 0..500 {
            assert!(range.contains(range.pick(&mut rng)));
        }
    }

    #[test]
    fn test_binds_single_free_port() {
        let port = free_port();
        let policy = loopback_policy(PortRange::new(port, port).unwrap(), Some(3));
        let (listener, bound) = bind_with_retry(&policy, &mut StdRng::seed_from_u64(1)).unwrap();

        assert_eq!(bound, port);
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }

    #[test]
    fn test_taken_port_is_retried_until_cap() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let policy = loopback_policy(PortRange::new(port, port).unwrap(), Some(4));

        match bind_with_retry(&policy, &mut StdRng::seed_from_u64(2)) {
            Err(MonitorError::PortsExhausted { attempts, .. }) => assert_eq!(attempts, 4),
            other => panic!("expected PortsExhausted, got {:?}", other.map(|(_, p)| p)),
        }
    }

    #[test]
    fn test_reserved_ports_are_never_returned() {
        let port = free_port();
        let mut policy = loopback_policy(PortRange::new(port, port).unwrap(), Some(10));
        policy.reserved.push(port);

        assert!(matches!(
            bind_with_retry(&policy, &mut StdRng::seed_from_u64(3)),
            Err(MonitorError::PortsExhausted { .. })
        ));
    }
}
