//! Keys identifying rate limit buckets and idempotency records.
//!
//! The boundary resolves who the caller is; this module only turns that
//! information into stable string keys for the Counter Store.

use sha2::{Digest, Sha256};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

/// Caller information supplied by the boundary for each operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerContext {
    /// Network address of the client, if known.
    pub client_addr: Option<IpAddr>,
    /// Resolved, authenticated user id, if any.
    pub user_id: Option<String>,
}

impl CallerContext {
    pub fn anonymous(addr: IpAddr) -> Self {
        Self {
            client_addr: Some(addr),
            user_id: None,
        }
    }

    pub fn user(addr: Option<IpAddr>, user_id: impl Into<String>) -> Self {
        Self {
            client_addr: addr,
            user_id: Some(user_id.into()),
        }
    }
}

/// Client half of a rate limit key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClientId {
    Ip(String),
    User(String),
    Custom(String),
}

impl ClientId {
    fn from_addr(addr: Option<IpAddr>) -> Self {
        match addr {
            Some(ip) => ClientId::Ip(ip.to_string()),
            None => ClientId::Ip("unknown".to_string()),
        }
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientId::Ip(ip) => write!(f, "ip:{}", ip),
            ClientId::User(id) => write!(f, "user:{}", id),
            ClientId::Custom(s) => f.write_str(s),
        }
    }
}

/// Composite of a route and a client identifier. Immutable once formed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    route: Arc<str>,
    client: ClientId,
}

impl RateLimitKey {
    pub fn new(route: impl Into<Arc<str>>, client: ClientId) -> Self {
        Self {
            route: route.into(),
            client,
        }
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn client(&self) -> &ClientId {
        &self.client
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.route, self.client)
    }
}

/// Function deriving a custom client key from the caller context.
pub type KeyFn = Arc<dyn Fn(&CallerContext) -> String + Send + Sync>;

/// How the client half of a [`RateLimitKey`] is chosen.
#[derive(Clone, Default)]
pub enum KeyStrategy {
    /// Client network address.
    #[default]
    Ip,
    /// Authenticated user id; anonymous callers fall back to their address.
    User,
    /// Caller-supplied function.
    Custom(KeyFn),
}

impl KeyStrategy {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&CallerContext) -> String + Send + Sync + 'static,
    {
        KeyStrategy::Custom(Arc::new(f))
    }

    /// Resolve the client identifier for a caller.
    pub fn resolve(&self, caller: &CallerContext) -> ClientId {
        match self {
            KeyStrategy::Ip => ClientId::from_addr(caller.client_addr),
            KeyStrategy::User => match &caller.user_id {
                Some(id) => ClientId::User(id.clone()),
                None => ClientId::from_addr(caller.client_addr),
            },
            KeyStrategy::Custom(f) => ClientId::Custom(f(caller)),
        }
    }
}

impl fmt::Debug for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStrategy::Ip => f.write_str("Ip"),
            KeyStrategy::User => f.write_str("User"),
            KeyStrategy::Custom(_) => f.write_str("Custom(<fn>)"),
        }
    }
}

/// Whether idempotency keys are unique per user or across all users.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyScope {
    #[default]
    User,
    Global,
}

/// A client-supplied idempotency token bound to a route and scope.
///
/// The storage key is a bounded hash so arbitrarily long client tokens
/// never produce arbitrarily long store keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    route: String,
    scope: String,
    token: String,
}

impl IdempotencyKey {
    pub fn new(
        route: impl Into<String>,
        scope: IdempotencyScope,
        user_id: Option<&str>,
        token: impl Into<String>,
    ) -> Self {
        let scope = match scope {
            IdempotencyScope::Global => "global".to_string(),
            IdempotencyScope::User => format!("user:{}", user_id.unwrap_or("anon")),
        };
        Self {
            route: route.into(),
            scope,
            token: token.into(),
        }
    }

    /// Global-scope key, mostly useful in tests and internal jobs.
    pub fn global(route: impl Into<String>, token: impl Into<String>) -> Self {
        Self::new(route, IdempotencyScope::Global, None, token)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    /// Store key: `<prefix>:<32 hex chars of sha256(route:scope:token)>`.
    pub fn storage_key(&self, prefix: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.route.as_bytes());
        hasher.update(b":");
        hasher.update(self.scope.as_bytes());
        hasher.update(b":");
        hasher.update(self.token.as_bytes());
        let digest = hasher.finalize();

        let mut key = String::with_capacity(prefix.len() + 33);
        key.push_str(prefix);
        key.push(':');
        for byte in &digest[..16] {
            key.push_str(&format!("{:02x}", byte));
        }
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))
    }

    #[test]
    fn test_ip_strategy_is_default() {
        let caller = CallerContext::user(Some(addr()), "42");
        assert_eq!(
            KeyStrategy::default().resolve(&caller),
            ClientId::Ip("10.0.0.7".to_string())
        );
    }

    #[test]
    fn test_user_strategy_falls_back_to_ip() {
        let anon = CallerContext::anonymous(addr());
        assert_eq!(
            KeyStrategy::User.resolve(&anon).to_string(),
            "ip:10.0.0.7"
        );

        let known = CallerContext::user(Some(addr()), "42");
        assert_eq!(KeyStrategy::User.resolve(&known).to_string(), "user:42");
    }

    #[test]
    fn test_missing_address_is_unknown() {
        let caller = CallerContext::default();
        assert_eq!(KeyStrategy::Ip.resolve(&caller).to_string(), "ip:unknown");
    }

    #[test]
    fn test_custom_strategy() {
        let strategy = KeyStrategy::custom(|c| {
            format!("tenant:{}", c.user_id.as_deref().unwrap_or("none"))
        });
        let caller = CallerContext::user(None, "acme");
        let key = RateLimitKey::new("data.list", strategy.resolve(&caller));
        assert_eq!(key.to_string(), "data.list:tenant:acme");
    }

    #[test]
    fn test_storage_key_is_bounded_and_stable() {
        let key = IdempotencyKey::global("orders.create", "order-42");
        let a = key.storage_key("gov:idem");
        let b = key.storage_key("gov:idem");
        assert_eq!(a, b);
        assert_eq!(a.len(), "gov:idem:".len() + 32);

        let long = IdempotencyKey::global("orders.create", "x".repeat(10_000));
        assert_eq!(long.storage_key("gov:idem").len(), a.len());
    }

    #[test]
    fn test_user_scope_separates_users() {
        let alice = IdempotencyKey::new("pay", IdempotencyScope::User, Some("alice"), "k1");
        let bob = IdempotencyKey::new("pay", IdempotencyScope::User, Some("bob"), "k1");
        let anon = IdempotencyKey::new("pay", IdempotencyScope::User, None, "k1");
        assert_ne!(alice.storage_key("p"), bob.storage_key("p"));
        assert_ne!(alice.storage_key("p"), anon.storage_key("p"));

        let g1 = IdempotencyKey::new("pay", IdempotencyScope::Global, Some("alice"), "k1");
        let g2 = IdempotencyKey::new("pay", IdempotencyScope::Global, Some("bob"), "k1");
        assert_eq!(g1.storage_key("p"), g2.storage_key("p"));
    }

    #[test]
    fn test_routes_do_not_share_records() {
        let a = IdempotencyKey::global("orders.create", "k");
        let b = IdempotencyKey::global("payments.charge", "k");
        assert_ne!(a.storage_key("p"), b.storage_key("p"));
    }
}
