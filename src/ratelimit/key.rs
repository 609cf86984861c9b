//! Rate key generation and handling.

use std::net::IpAddr;

/// Prefix for keys derived from a client network address.
pub const IP_NAMESPACE: &str = "ip";
/// Prefix for keys derived from a presented credential.
pub const TOKEN_NAMESPACE: &str = "token";

/// A key that uniquely identifies the entity being limited.
///
/// The namespace keeps address-based and credential-based identities from
/// colliding, so a credential that happens to look like an address still
/// gets its own counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey(String);

impl RateKey {
    /// Key for a client address. Ports are never part of the identity.
    pub fn ip(addr: IpAddr) -> Self {
        Self(format!("{}:{}", IP_NAMESPACE, addr))
    }

    /// Key for a presented credential.
    pub fn token(credential: &str) -> Self {
        Self(format!("{}:{}", TOKEN_NAMESPACE, credential))
    }

    /// Key from an already namespaced string.
    pub fn raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key as stored.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the counter record for this key.
    pub fn count_record(&self) -> String {
        format!("count:{}", self.0)
    }

    /// Name of the block record for this key.
    pub fn block_record(&self) -> String {
        format!("block:{}", self.0)
    }
}

impl std::fmt::Display for RateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_key_has_no_port() {
        let addr: std::net::SocketAddr = "10.0.0.7:51234".parse().unwrap();
        let key = RateKey::ip(addr.ip());

        assert_eq!(key.as_str(), "ip:10.0.0.7");
    }

    #[test]
    fn test_ipv6_key() {
        let addr: std::net::SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        let key = RateKey::ip(addr.ip());

        assert_eq!(key.as_str(), "ip:2001:db8::1");
    }

    #[test]
    fn test_namespaces_do_not_collide() {
        let ip = RateKey::ip("127.0.0.1".parse().unwrap());
        let token = RateKey::token("127.0.0.1");

        assert_ne!(ip, token);
        assert_eq!(token.to_string(), "token:127.0.0.1");
    }

    #[test]
    fn test_record_names() {
        let key = RateKey::token("abc");

        assert_eq!(key.count_record(), "count:token:abc");
        assert_eq!(key.block_record(), "block:token:abc");
    }
}
