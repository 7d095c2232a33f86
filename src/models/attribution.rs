//! Attribution record model

use serde::{Deserialize, Serialize};

/// Everything known about one player's install attribution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributionRecord {
    pub open_id: String,
    /// The click credited with the install. Written at most once.
    pub click_id: Option<String>,
    pub impression_count: u64,
}

impl AttributionRecord {
    pub fn is_attributed(&self) -> bool {
        self.click_id.is_some()
    }
}

/// Result of an activation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activation {
    /// True when this activation recorded the player's click.
    pub is_new_user: bool,
}
