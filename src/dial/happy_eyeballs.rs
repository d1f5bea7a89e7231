//! Dual-stack resolution and RFC 8305-style connection racing.

use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use futures_util::{stream::FuturesUnordered, StreamExt};
use tokio::net::TcpStream;

use super::options::DualStackOptions;
use crate::{
    error::{Error, ErrorKind, Result},
    options::Address,
    runtime::{resolver::AsyncResolver, stream::connect_socket},
};

/// Resolves a target to an ordered candidate list and races dial attempts
/// across it, returning the first socket to connect.
pub(crate) struct DualStackDialer {
    options: DualStackOptions,
    keep_alive: Option<Duration>,
    resolver: AsyncResolver,
}

impl DualStackDialer {
    pub(crate) fn new(options: DualStackOptions, keep_alive: Option<Duration>) -> Self {
        Self {
            options,
            keep_alive,
            resolver: AsyncResolver::new(),
        }
    }

    pub(crate) async fn connect(&self, address: &Address) -> Result<TcpStream> {
        let candidates = self.resolve(address).await?;
        let raced = if self.options.connection_racing {
            self.race(candidates).await
        } else {
            self.sequential(candidates).await
        };
        raced.map_err(|e| Error::new(e.kind.as_ref().clone().with_address(address.clone())))
    }

    /// Produces dial candidates in preference order. An IP literal
    /// short-circuits resolution; hostnames get concurrent per-family
    /// lookups under the combined resolution deadline.
    async fn resolve(&self, address: &Address) -> Result<Vec<SocketAddr>> {
        if let Some(ip) = address.ip() {
            return Ok(vec![SocketAddr::new(ip, address.port)]);
        }

        let lookup = async {
            let v4 = async {
                if self.options.ipv4_enabled {
                    self.resolver.lookup_v4(&address.host).await
                } else {
                    Ok(Vec::new())
                }
            };
            let v6 = async {
                if self.options.ipv6_enabled {
                    self.resolver.lookup_v6(&address.host).await
                } else {
                    Ok(Vec::new())
                }
            };
            tokio::join!(v4, v6)
        };

        let (v4, v6) = tokio::time::timeout(self.options.resolution_timeout, lookup)
            .await
            .map_err(|_| ErrorKind::DnsResolve {
                message: format!("resolution of \"{}\" timed out", address.host),
            })?;

        // A family that failed to resolve doesn't fail the dial as long as
        // the other produced endpoints.
        let (v4, v4_err) = split_lookup(v4);
        let (v6, v6_err) = split_lookup(v6);

        let (preferred, fallback) = if self.options.prefer_ipv6 {
            (v6, v4)
        } else {
            (v4, v6)
        };
        let candidates: Vec<SocketAddr> = preferred
            .into_iter()
            .chain(fallback)
            .map(|ip| SocketAddr::new(ip, address.port))
            .collect();

        if candidates.is_empty() {
            return Err(v4_err.or(v6_err).unwrap_or_else(|| {
                ErrorKind::DnsResolve {
                    message: format!("no addresses found for \"{}\"", address.host),
                }
                .into()
            }));
        }

        Ok(candidates)
    }

    async fn sequential(&self, candidates: Vec<SocketAddr>) -> Result<TcpStream> {
        let mut last_error = None;
        for candidate in candidates {
            match connect_socket(candidate, self.keep_alive).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(no_candidates))
    }

    /// Happy Eyeballs: the first candidate dials immediately, each later
    /// one after a stagger that doubles per start, capped to
    /// `max_concurrent_dials` in flight. The first success wins; dropping
    /// the remaining attempts closes their sockets before the winner is
    /// returned.
    async fn race(&self, candidates: Vec<SocketAddr>) -> Result<TcpStream> {
        let max_in_flight = self.options.max_concurrent_dials.max(1);
        let mut next = 0usize;
        let mut stagger = self.options.happy_eyeballs_delay;
        let mut last_error: Option<Error> = None;
        let mut in_flight = FuturesUnordered::new();

        if candidates.is_empty() {
            return Err(no_candidates());
        }
        in_flight.push(connect_socket(candidates[next], self.keep_alive));
        next += 1;

        let mut next_start = Box::pin(tokio::time::sleep(stagger));

        loop {
            tokio::select! {
                biased;

                outcome = in_flight.next(), if !in_flight.is_empty() => {
                    match outcome {
                        Some(Ok(stream)) => {
                            drop(in_flight);
                            return Ok(stream);
                        }
                        Some(Err(e)) => {
                            last_error = Some(e);
                            if in_flight.is_empty() {
                                if next >= candidates.len() {
                                    return Err(last_error.unwrap());
                                }
                                // Every attempt so far has failed; don't
                                // sit out the rest of the stagger.
                                in_flight.push(connect_socket(candidates[next], self.keep_alive));
                                next += 1;
                                stagger = stagger.saturating_mul(2);
                                next_start = Box::pin(tokio::time::sleep(stagger));
                            }
                        }
                        None => {}
                    }
                }

                _ = &mut next_start, if next < candidates.len() && in_flight.len() < max_in_flight => {
                    in_flight.push(connect_socket(candidates[next], self.keep_alive));
                    next += 1;
                    stagger = stagger.saturating_mul(2);
                    next_start = Box::pin(tokio::time::sleep(stagger));
                }
            }
        }
    }
}

fn split_lookup(result: Result<Vec<IpAddr>>) -> (Vec<IpAddr>, Option<Error>) {
    match result {
        Ok(ips) => (ips, None),
        Err(e) => (Vec::new(), Some(e)),
    }
}

fn no_candidates() -> Error {
    ErrorKind::DnsResolve {
        message: "no dial candidates".to_string(),
    }
    .into()
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::DualStackDialer;
    use crate::{dial::options::DualStackOptions, options::Address};

    fn dialer(options: DualStackOptions) -> DualStackDialer {
        DualStackDialer::new(options, None)
    }

    #[tokio::test]
    async fn connects_to_an_ip_literal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let stream = dialer(DualStackOptions::default())
            .connect(&Address::parse(format!("127.0.0.1:{}", port)).unwrap())
            .await
            .unwrap();
        assert_eq!(stream.peer_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn sequential_mode_falls_through_to_a_live_candidate() {
        let Ok(listener) = TcpListener::bind("[::1]:0").await else {
            // No IPv6 loopback in this environment.
            return;
        };
        let port = listener.local_addr().unwrap().port();

        // The v6 literal is the only candidate; sequential mode must reach it.
        let options = DualStackOptions::builder().connection_racing(false).build();
        let stream = dialer(options)
            .connect(&Address::parse(format!("[::1]:{}", port)).unwrap())
            .await
            .unwrap();
        assert!(stream.peer_addr().unwrap().is_ipv6());
    }

    #[tokio::test]
    async fn racing_surfaces_the_last_error_when_all_fail() {
        // Bind then drop to find a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = dialer(DualStackOptions::default())
            .connect(&Address::parse(format!("127.0.0.1:{}", port)).unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "network.refused");
        assert!(err.is_retryable());
    }
}
