//! Host port availability probing. A port counts as free only when a TCP
//! bind succeeds AND no container publishes it; if the engine view is
//! unavailable the caller falls back to the bind check alone.

use bollard::models::ContainerSummary;
use std::collections::HashSet;

/// Last probeable port. 65535 is never selected.
pub const PORT_PROBE_CEILING: u16 = 65534;

pub trait PortProber {
    fn is_free(&mut self, port: u16) -> bool;
}

/// Probes the live host: bind to 0.0.0.0 and consult the published set.
pub struct HostProber {
    published: HashSet<u16>,
}

impl HostProber {
    pub fn new(published: HashSet<u16>) -> Self {
        Self { published }
    }

    /// Mark a port taken so later probes in the same pass skip it.
    pub fn reserve(&mut self, port: u16) {
        self.published.insert(port);
    }
}

impl PortProber for HostProber {
    fn is_free(&mut self, port: u16) -> bool {
        !self.published.contains(&port) && tcp_bind_free(port)
    }
}

/// A bind that succeeds and closes cleanly means nothing is listening.
pub fn tcp_bind_free(port: u16) -> bool {
    std::net::TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// First free port at or above `desired`, scanning up to the ceiling.
pub fn next_free_port(prober: &mut dyn PortProber, desired: u16) -> Option<u16> {
    (desired..=PORT_PROBE_CEILING).find(|p| prober.is_free(*p))
}

/// Host ports published by the given containers.
pub fn collect_published(summaries: &[ContainerSummary]) -> HashSet<u16> {
    summaries
        .iter()
        .flat_map(|c| c.ports.iter().flatten())
        .filter_map(|p| p.public_port)
        .filter_map(|p| u16::try_from(p).ok())
        .collect()
}

/// Scripted prober for tests: every port in `busy` is taken.
#[cfg(test)]
pub(crate) struct FakeProber {
    pub busy: HashSet<u16>,
}

#[cfg(test)]
impl PortProber for FakeProber {
    fn is_free(&mut self, port: u16) -> bool {
        !self.busy.contains(&port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_free_port_skips_busy() {
        let mut prober = FakeProber {
            busy: [5432, 5433].into_iter().collect(),
        };
        assert_eq!(next_free_port(&mut prober, 5432), Some(5434));
    }

    #[test]
    fn test_probe_never_selects_65535() {
        let mut prober = FakeProber {
            busy: (65530..=65534).collect(),
        };
        assert_eq!(next_free_port(&mut prober, 65530), None);

        let mut prober = FakeProber {
            busy: (65530..65534).collect(),
        };
        assert_eq!(next_free_port(&mut prober, 65530), Some(65534));
    }

    #[test]
    fn test_collect_published() {
        let summary = ContainerSummary {
            ports: Some(vec![
                bollard::models::Port {
                    private_port: 80,
                    public_port: Some(8080),
                    ..Default::default()
                },
                bollard::models::Port {
                    private_port: 443,
                    public_port: None,
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };
        let published = collect_published(&[summary]);
        assert!(published.contains(&8080));
        assert_eq!(published.len(), 1);
    }
}
