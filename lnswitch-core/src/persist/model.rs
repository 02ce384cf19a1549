//! Serializable persistence models.

use serde_derive::{Deserialize, Serialize};

use crate::channel::{ChannelSetup, ChannelState};

/// Everything needed to restore a [`crate::channel::Channel`]
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelEntry {
    /// Negotiated parameters
    pub setup: ChannelSetup,
    /// Commitment machine state
    pub state: ChannelState,
}
