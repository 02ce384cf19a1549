//! Engine configuration.

use core::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::util::status::{invalid_argument, Status};

/// Default batching interval for commitment signatures
pub const DEFAULT_COMMIT_INTERVAL: Duration = Duration::from_millis(50);
/// Upper bound on the batching interval
pub const MAX_COMMIT_INTERVAL: Duration = Duration::from_secs(3600);
/// Default timeout waiting for the counterparty's revocation
pub const DEFAULT_PENDING_COMMIT_INTERVAL: Duration = Duration::from_secs(60);
/// Upper bound on the pending commit timeout
pub const MAX_PENDING_COMMIT_INTERVAL: Duration = Duration::from_secs(300);
/// Default update count that forces an immediate commitment
pub const DEFAULT_COMMIT_BATCH_SIZE: u32 = 10;
/// Default cap on concurrent HTLCs offered to a peer
pub const DEFAULT_REMOTE_MAX_HTLCS: u16 = 483;
/// Default cap on the CLTV expiry of outgoing HTLCs, about two weeks
pub const DEFAULT_MAX_OUTGOING_CLTV_EXPIRY: u32 = 2016;
/// Default cap on commitment fee plus dust exposure, 0.005 BTC
pub const DEFAULT_MAX_FEE_EXPOSURE_MSAT: u64 = 500_000_000;
/// Default time a queued forward may wait for its link before expiring
pub const DEFAULT_MAILBOX_DELIVERY_TIMEOUT: Duration = Duration::from_secs(60);
/// Default timeout for a quiescence negotiation to complete
pub const DEFAULT_QUIESCENCE_TIMEOUT: Duration = Duration::from_secs(60);

/// Tuning knobs for the switch and its links.
///
/// [`SwitchConfig::validate`] must pass before the switch is started.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SwitchConfig {
    /// Maximum time updates are batched before a commitment is signed
    pub commit_interval: Duration,
    /// How long to wait for a revocation before the peer is disconnected
    pub pending_commit_interval: Duration,
    /// Update count that forces an immediate commitment signature
    pub commit_batch_size: u32,
    /// Maximum concurrent HTLCs offered on a single channel
    pub remote_max_htlcs: u16,
    /// Reject forwards whose outgoing CLTV is more than this far in the
    /// future
    pub max_outgoing_cltv_expiry: u32,
    /// Cap on commitment fee plus dust exposure per channel
    pub max_fee_exposure_msat: u64,
    /// How long a queued forward may wait for an offline link
    pub mailbox_delivery_timeout: Duration,
    /// How long a quiescence negotiation may take before the peer is
    /// disconnected
    pub quiescence_timeout: Duration,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        SwitchConfig {
            commit_interval: DEFAULT_COMMIT_INTERVAL,
            pending_commit_interval: DEFAULT_PENDING_COMMIT_INTERVAL,
            commit_batch_size: DEFAULT_COMMIT_BATCH_SIZE,
            remote_max_htlcs: DEFAULT_REMOTE_MAX_HTLCS,
            max_outgoing_cltv_expiry: DEFAULT_MAX_OUTGOING_CLTV_EXPIRY,
            max_fee_exposure_msat: DEFAULT_MAX_FEE_EXPOSURE_MSAT,
            mailbox_delivery_timeout: DEFAULT_MAILBOX_DELIVERY_TIMEOUT,
            quiescence_timeout: DEFAULT_QUIESCENCE_TIMEOUT,
        }
    }
}

impl SwitchConfig {
    /// Check the configured values against their hard bounds
    pub fn validate(&self) -> Result<(), Status> {
        if self.commit_interval.is_zero() {
            return Err(invalid_argument("commit_interval must be positive"));
        }
        if self.commit_interval > MAX_COMMIT_INTERVAL {
            return Err(invalid_argument(format!(
                "commit_interval {:?} exceeds maximum {:?}",
                self.commit_interval, MAX_COMMIT_INTERVAL
            )));
        }
        if self.pending_commit_interval.is_zero() {
            return Err(invalid_argument("pending_commit_interval must be positive"));
        }
        if self.pending_commit_interval > MAX_PENDING_COMMIT_INTERVAL {
            return Err(invalid_argument(format!(
                "pending_commit_interval {:?} exceeds maximum {:?}",
                self.pending_commit_interval, MAX_PENDING_COMMIT_INTERVAL
            )));
        }
        if self.commit_batch_size == 0 {
            return Err(invalid_argument("commit_batch_size must be positive"));
        }
        if self.remote_max_htlcs == 0 || self.remote_max_htlcs > DEFAULT_REMOTE_MAX_HTLCS {
            return Err(invalid_argument(format!(
                "remote_max_htlcs {} out of range 1..={}",
                self.remote_max_htlcs, DEFAULT_REMOTE_MAX_HTLCS
            )));
        }
        if self.max_outgoing_cltv_expiry == 0 {
            return Err(invalid_argument("max_outgoing_cltv_expiry must be positive"));
        }
        if self.max_fee_exposure_msat == 0 {
            return Err(invalid_argument("max_fee_exposure_msat must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid_test() {
        SwitchConfig::default().validate().unwrap();
    }

    #[test]
    fn commit_interval_bounds_test() {
        let mut config = SwitchConfig::default();
        config.commit_interval = Duration::ZERO;
        assert!(config.validate().is_err());
        config.commit_interval = MAX_COMMIT_INTERVAL + Duration::from_secs(1);
        assert!(config.validate().is_err());
        config.commit_interval = MAX_COMMIT_INTERVAL;
        config.validate().unwrap();
    }

    #[test]
    fn remote_max_htlcs_bounds_test() {
        let mut config = SwitchConfig::default();
        config.remote_max_htlcs = 0;
        assert!(config.validate().is_err());
        config.remote_max_htlcs = DEFAULT_REMOTE_MAX_HTLCS + 1;
        assert!(config.validate().is_err());
    }
}
