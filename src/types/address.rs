use serde::{Deserialize, Serialize};
use std::fmt;

/// ProtocolAddress identifies a remote party as `(identifier, device id)`.
///
/// The string form `"id.deviceId"` doubles as the per-address lock
/// identifier and the storage key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolAddress {
    pub id: String,
    pub device_id: u32,
}

impl ProtocolAddress {
    /// Create a new address
    pub fn new(id: impl Into<String>, device_id: u32) -> Result<Self, crate::error::Error> {
        let id = id.into();
        if id.is_empty() || id.contains('.') {
            return Err(crate::error::Error::InvalidArgument(format!(
                "Invalid address identifier: {}",
                id
            )));
        }

        Ok(Self { id, device_id })
    }
}

impl fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.id, self.device_id)
    }
}

impl std::str::FromStr for ProtocolAddress {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, device) = s.rsplit_once('.').ok_or_else(|| {
            crate::Error::InvalidArgument(format!("Invalid address format: {}", s))
        })?;

        let device_id = device
            .parse()
            .map_err(|_| crate::Error::InvalidArgument(format!("Invalid device id in: {}", s)))?;

        Self::new(id, device_id)
    }
}
