use std::{fmt, sync::Arc};

/// Crypto protocol recorded for connections that skipped encryption.
pub const NATIVE: &str = "native";

/// Cheaply cloneable protocol name, e.g. `/yamux/1.0.0`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolName(Arc<str>);

impl ProtocolName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProtocolName {
    fn from(name: &str) -> Self {
        ProtocolName(Arc::from(name))
    }
}

impl From<String> for ProtocolName {
    fn from(name: String) -> Self {
        ProtocolName(Arc::from(name))
    }
}

impl AsRef<str> for ProtocolName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for ProtocolName {
    fn eq(&self, other: &str) -> bool {
        *self.0 == *other
    }
}

impl PartialEq<&str> for ProtocolName {
    fn eq(&self, other: &&str) -> bool {
        *self.0 == **other
    }
}

impl fmt::Display for ProtocolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ProtocolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}
