//! Request identity and counter key generation.

use std::fmt;
use std::net::IpAddr;

/// The key a request is rate limited by, typically the client address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestIdentity(String);

impl RequestIdentity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The store key holding this identity's counter.
    pub fn counter_key(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.0)
    }
}

impl fmt::Display for RequestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestIdentity {
    fn from(identity: &str) -> Self {
        Self::new(identity)
    }
}

impl From<String> for RequestIdentity {
    fn from(identity: String) -> Self {
        Self(identity)
    }
}

impl From<IpAddr> for RequestIdentity {
    fn from(addr: IpAddr) -> Self {
        Self(addr.to_string())
    }
}
