//! Dual-stack listening: one socket per enabled family feeding a single
//! accept stream.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::atomic::{AtomicBool, Ordering},
};

use serde::Deserialize;
use tokio::{net::TcpListener, sync::mpsc};
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;

use crate::{
    conn::ManagedConnection,
    error::{Error, Result},
    options::{validate_host, AddressFamily},
    runtime,
};

/// Inbound connections waiting in the shared accept queue.
const ACCEPT_QUEUE_CAPACITY: usize = 10;

const BIND_BACKLOG: i32 = 128;

/// Options governing a [`DualStackListener`].
#[derive(Clone, Debug, TypedBuilder, Deserialize)]
#[builder(field_defaults(default))]
#[serde(default)]
#[non_exhaustive]
pub struct ListenerOptions {
    /// Bind an IPv4 socket.
    #[builder(default = true)]
    pub ipv4_enabled: bool,

    /// Bind an IPv6 socket.
    #[builder(default = true)]
    pub ipv6_enabled: bool,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Listens on IPv4 and IPv6 simultaneously, surfacing inbound connections
/// through a single [`accept`](Self::accept) stream.
#[derive(Debug)]
pub struct DualStackListener {
    addresses: HashMap<AddressFamily, SocketAddr>,
    primary: SocketAddr,
    conn_rx: tokio::sync::Mutex<mpsc::Receiver<ManagedConnection>>,
    err_rx: tokio::sync::Mutex<mpsc::Receiver<Error>>,
    token: CancellationToken,
    closed: AtomicBool,
}

impl DualStackListener {
    /// Binds to `target` with default options. `target` is `host:port`
    /// where an empty host (`":9000"`) binds the wildcard address of every
    /// enabled family; an IP literal binds that family only. Port 0 picks
    /// an ephemeral port shared by both sockets.
    pub async fn listen(target: impl AsRef<str>) -> Result<Self> {
        Self::listen_with_options(target, ListenerOptions::default()).await
    }

    /// Binds to `target` with explicit options.
    pub async fn listen_with_options(
        target: impl AsRef<str>,
        options: ListenerOptions,
    ) -> Result<Self> {
        let (binds, mut port) = bind_targets(target.as_ref(), &options)?;

        let mut listeners: Vec<(AddressFamily, TcpListener)> = Vec::new();
        let mut bind_error = None;
        for (family, ip) in binds {
            match bind_socket(SocketAddr::new(ip, port)) {
                Ok(listener) => {
                    if port == 0 {
                        // Later families share the ephemeral port the
                        // first bind received.
                        port = listener.local_addr()?.port();
                    }
                    listeners.push((family, listener));
                }
                Err(e) => {
                    tracing::warn!(%family, error = %e, "listener bind failed");
                    bind_error = Some(e);
                }
            }
        }
        if listeners.is_empty() {
            return Err(bind_error
                .unwrap_or_else(|| Error::validation("no address family enabled for listener")));
        }

        let mut addresses = HashMap::new();
        for (family, listener) in &listeners {
            addresses.insert(*family, listener.local_addr()?);
        }
        let primary = addresses
            .get(&AddressFamily::V4)
            .or_else(|| addresses.get(&AddressFamily::V6))
            .copied()
            .expect("at least one listener bound");

        let token = CancellationToken::new();
        let (conn_tx, conn_rx) = mpsc::channel(ACCEPT_QUEUE_CAPACITY);
        let (err_tx, err_rx) = mpsc::channel(ACCEPT_QUEUE_CAPACITY);

        for (family, listener) in listeners {
            spawn_accept_loop(family, listener, conn_tx.clone(), err_tx.clone(), token.clone());
        }

        tracing::debug!(?addresses, "listener bound");
        Ok(Self {
            addresses,
            primary,
            conn_rx: tokio::sync::Mutex::new(conn_rx),
            err_rx: tokio::sync::Mutex::new(err_rx),
            token,
            closed: AtomicBool::new(false),
        })
    }

    /// Waits for the next inbound connection or accept error, whichever
    /// arrives first. Returns `resource.closed` once the listener is
    /// closed.
    pub async fn accept(&self) -> Result<ManagedConnection> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::resource_closed("listener"));
        }

        let mut conn_rx = self.conn_rx.lock().await;
        let mut err_rx = self.err_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::resource_closed("listener")),
            Some(conn) = conn_rx.recv() => Ok(conn),
            Some(err) = err_rx.recv() => Err(err),
            else => Err(Error::resource_closed("listener")),
        }
    }

    /// The first bound address, preferring IPv4.
    pub fn local_addr(&self) -> SocketAddr {
        self.primary
    }

    /// Bound addresses keyed by family.
    pub fn addresses(&self) -> &HashMap<AddressFamily, SocketAddr> {
        &self.addresses
    }

    /// Stops both accept loops, closes the sockets, and closes any
    /// connections still queued. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.token.cancel();

        let mut conn_rx = self.conn_rx.lock().await;
        conn_rx.close();
        while let Some(conn) = conn_rx.recv().await {
            let _ = conn.close().await;
        }
        tracing::debug!("listener closed");
    }
}

fn spawn_accept_loop(
    family: AddressFamily,
    listener: TcpListener,
    conn_tx: mpsc::Sender<ManagedConnection>,
    err_tx: mpsc::Sender<Error>,
    token: CancellationToken,
) {
    runtime::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%family, %peer, "inbound connection accepted");
                    let conn = ManagedConnection::accepted(stream, peer);
                    if conn_tx.send(conn).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    if err_tx.send(e.into()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Resolves a listen target to per-family bind IPs and a port. Port 0 is
/// allowed here, unlike for dial targets.
fn bind_targets(
    target: &str,
    options: &ListenerOptions,
) -> Result<(Vec<(AddressFamily, IpAddr)>, u16)> {
    let (host, port_str) = match target.rsplit_once(':') {
        Some((host, port)) => (host.trim_end_matches(']').trim_start_matches('['), port),
        None => {
            return Err(Error::validation(format!(
                "invalid listen target \"{}\": expected host:port",
                target
            )))
        }
    };
    let port: u16 = port_str.parse().map_err(|_| {
        Error::validation(format!(
            "invalid listen target \"{}\": bad port \"{}\"",
            target, port_str
        ))
    })?;

    let mut binds = Vec::new();
    if host.is_empty() {
        if options.ipv4_enabled {
            binds.push((AddressFamily::V4, IpAddr::V4(Ipv4Addr::UNSPECIFIED)));
        }
        if options.ipv6_enabled {
            binds.push((AddressFamily::V6, IpAddr::V6(Ipv6Addr::UNSPECIFIED)));
        }
    } else if let Ok(ip) = host.parse::<IpAddr>() {
        let family = if ip.is_ipv4() {
            AddressFamily::V4
        } else {
            AddressFamily::V6
        };
        binds.push((family, ip));
    } else {
        validate_host(host)?;
        return Err(Error::validation(format!(
            "listen target \"{}\" must use an IP literal or an empty host",
            target
        )));
    }

    if binds.is_empty() {
        return Err(Error::validation(
            "no address family enabled for listener".to_string(),
        ));
    }
    Ok((binds, port))
}

/// Binds one socket with the options a dual-stack pair needs: reusable
/// addresses and, for IPv6, `V6ONLY` so the pair can coexist on one port.
fn bind_socket(address: SocketAddr) -> Result<TcpListener> {
    let domain = socket2::Domain::for_address(address);
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    if address.is_ipv6() {
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&address.into())?;
    socket.listen(BIND_BACKLOG)?;

    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener)?)
}

#[cfg(test)]
mod test {
    use tokio::net::TcpStream;

    use super::DualStackListener;
    use crate::options::AddressFamily;

    #[tokio::test]
    async fn accepts_from_both_families_on_one_port() {
        let listener = match DualStackListener::listen(":0").await {
            Ok(listener) => listener,
            Err(_) => return,
        };
        if !listener.addresses().contains_key(&AddressFamily::V6) {
            // Single-stack environment; parity is covered elsewhere.
            return;
        }
        let port = listener.local_addr().port();

        let _v4 = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let _v6 = TcpStream::connect(("::1", port)).await.unwrap();

        let first = listener.accept().await.unwrap();
        let second = listener.accept().await.unwrap();

        let families: Vec<AddressFamily> =
            vec![first.address().family, second.address().family];
        assert!(families.contains(&AddressFamily::V4));
        assert!(families.contains(&AddressFamily::V6));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_accept() {
        let listener = DualStackListener::listen("127.0.0.1:0").await.unwrap();
        listener.close().await;
        listener.close().await;

        let err = listener.accept().await.unwrap_err();
        assert_eq!(err.code(), "resource.closed");
    }

    #[tokio::test]
    async fn single_family_target_binds_one_socket() {
        let listener = DualStackListener::listen("127.0.0.1:0").await.unwrap();
        assert_eq!(listener.addresses().len(), 1);
        assert!(listener.local_addr().is_ipv4());

        let port = listener.local_addr().port();
        let _client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let conn = listener.accept().await.unwrap();
        assert_eq!(conn.address().family, AddressFamily::V4);
    }

    #[tokio::test]
    async fn rejects_hostname_targets() {
        let err = DualStackListener::listen("localhost:0").await.unwrap_err();
        assert_eq!(err.code(), "validation");
    }
}
