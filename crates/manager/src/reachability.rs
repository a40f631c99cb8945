//! Connectivity status and per-direction network policies.

use std::fmt;
use std::sync::Arc;

use blobferry_model::TransferType;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Current connectivity, as reported by the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkStatus {
    /// Nothing reported yet. Treated as reachable.
    #[default]
    Unknown,
    Disconnected,
    WifiOrEthernet,
    Cellular,
}

impl NetworkStatus {
    pub fn is_reachable(self) -> bool {
        self != Self::Disconnected
    }

    /// Network type for policy checks. `Unknown` counts as wifi/ethernet.
    pub fn network_type(self) -> Option<NetworkType> {
        match self {
            Self::Disconnected => None,
            Self::Cellular => Some(NetworkType::Cellular),
            Self::Unknown | Self::WifiOrEthernet => Some(NetworkType::WifiOrEthernet),
        }
    }
}

impl fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown network",
            Self::Disconnected => "no network",
            Self::WifiOrEthernet => "wifi/ethernet",
            Self::Cellular => "cellular",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    WifiOrEthernet,
    Cellular,
}

/// Which networks a transfer direction may use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPolicy {
    #[serde(default = "default_transfer_over")]
    pub transfer_over: Vec<NetworkType>,
    /// Resume paused transfers when an allowed network appears.
    #[serde(default = "default_true")]
    pub auto_resume: bool,
}

fn default_transfer_over() -> Vec<NetworkType> {
    vec![NetworkType::WifiOrEthernet, NetworkType::Cellular]
}

fn default_true() -> bool {
    true
}

impl Default for NetworkPolicy {
    fn default() -> Self {
        Self {
            transfer_over: default_transfer_over(),
            auto_resume: true,
        }
    }
}

impl NetworkPolicy {
    /// Policy that only transfers over wifi/ethernet.
    pub fn wifi_only(auto_resume: bool) -> Self {
        Self {
            transfer_over: vec![NetworkType::WifiOrEthernet],
            auto_resume,
        }
    }

    pub fn allows(&self, status: NetworkStatus) -> bool {
        status
            .network_type()
            .is_some_and(|t| self.transfer_over.contains(&t))
    }
}

/// Shared connectivity signal. Clones observe the same status.
#[derive(Debug, Clone)]
pub struct Reachability {
    tx: Arc<watch::Sender<NetworkStatus>>,
}

impl Default for Reachability {
    fn default() -> Self {
        Self::new(NetworkStatus::Unknown)
    }
}

impl Reachability {
    pub fn new(initial: NetworkStatus) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn status(&self) -> NetworkStatus {
        *self.tx.borrow()
    }

    /// Reports a new status. Subscribers are only woken on change.
    pub fn set(&self, status: NetworkStatus) {
        self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }
}

/// Picks the policy for a transfer direction.
pub(crate) fn policy_for<'a>(
    transfer_type: TransferType,
    upload: &'a NetworkPolicy,
    download: &'a NetworkPolicy,
) -> &'a NetworkPolicy {
    match transfer_type {
        TransferType::Upload => upload,
        TransferType::Download => download,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_allows_everything_reachable() {
        let p = NetworkPolicy::default();
        assert!(p.allows(NetworkStatus::WifiOrEthernet));
        assert!(p.allows(NetworkStatus::Cellular));
        assert!(p.allows(NetworkStatus::Unknown));
        assert!(!p.allows(NetworkStatus::Disconnected));
    }

    #[test]
    fn wifi_only_rejects_cellular() {
        let p = NetworkPolicy::wifi_only(false);
        assert!(p.allows(NetworkStatus::WifiOrEthernet));
        assert!(!p.allows(NetworkStatus::Cellular));
    }

    #[test]
    fn set_only_notifies_on_change() {
        let r = Reachability::default();
        let mut rx = r.subscribe();
        r.set(NetworkStatus::Unknown);
        assert!(!rx.has_changed().unwrap());
        r.set(NetworkStatus::Cellular);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), NetworkStatus::Cellular);
        assert_eq!(r.status(), NetworkStatus::Cellular);
    }

    #[test]
    fn policy_serde() {
        let p: NetworkPolicy =
            serde_json::from_str(r#"{"transfer_over":["wifi_or_ethernet"]}"#).unwrap();
        assert_eq!(p, NetworkPolicy::wifi_only(true));
    }
}
