//! Name resolution split by address family so the dual-stack dialer can
//! order and race candidates itself.

use std::net::IpAddr;

use crate::error::Result;

#[cfg(feature = "dns-resolver")]
pub(crate) struct AsyncResolver {
    resolver: hickory_resolver::TokioResolver,
}

#[cfg(feature = "dns-resolver")]
impl AsyncResolver {
    pub(crate) fn new() -> Self {
        let resolver = match hickory_resolver::TokioResolver::builder_tokio() {
            Ok(builder) => builder.build(),
            // No usable system configuration; fall back to well-known
            // public recursors rather than failing every lookup.
            Err(_) => hickory_resolver::Resolver::builder_with_config(
                hickory_resolver::config::ResolverConfig::default(),
                hickory_resolver::name_server::TokioConnectionProvider::default(),
            )
            .build(),
        };

        Self { resolver }
    }

    pub(crate) async fn lookup_v4(&self, host: &str) -> Result<Vec<IpAddr>> {
        let lookup = self.resolver.ipv4_lookup(host).await?;
        Ok(lookup.iter().map(|a| IpAddr::V4(a.0)).collect())
    }

    pub(crate) async fn lookup_v6(&self, host: &str) -> Result<Vec<IpAddr>> {
        let lookup = self.resolver.ipv6_lookup(host).await?;
        Ok(lookup.iter().map(|aaaa| IpAddr::V6(aaaa.0)).collect())
    }
}

#[cfg(not(feature = "dns-resolver"))]
pub(crate) struct AsyncResolver;

#[cfg(not(feature = "dns-resolver"))]
impl AsyncResolver {
    pub(crate) fn new() -> Self {
        Self
    }

    pub(crate) async fn lookup_v4(&self, host: &str) -> Result<Vec<IpAddr>> {
        Ok(self.lookup(host).await?.filter(IpAddr::is_ipv4).collect())
    }

    pub(crate) async fn lookup_v6(&self, host: &str) -> Result<Vec<IpAddr>> {
        Ok(self.lookup(host).await?.filter(IpAddr::is_ipv6).collect())
    }

    async fn lookup(&self, host: &str) -> Result<impl Iterator<Item = IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0u16)).await?;
        Ok(addrs.map(|sockaddr| sockaddr.ip()))
    }
}
