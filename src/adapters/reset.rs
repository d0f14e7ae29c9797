//! Chip reset adapter.
//!
//! - **`target_os = "espidf"`**: `esp_restart()`; never returns.
//! - **`not(target_os = "espidf")`**: records the request so host
//!   simulations can observe it.

use log::error;

use crate::app::events::ResetReason;
use crate::app::ports::ResetPort;

#[derive(Debug, Default)]
pub struct SystemReset {
    #[cfg(not(target_os = "espidf"))]
    last: Option<ResetReason>,
}

impl SystemReset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reason of the most recent simulated reset.
    #[cfg(not(target_os = "espidf"))]
    pub fn last(&self) -> Option<ResetReason> {
        self.last
    }
}

impl ResetPort for SystemReset {
    #[cfg(target_os = "espidf")]
    fn reset(&mut self, reason: ResetReason) {
        error!("reset: restarting ({reason:?})");
        unsafe { esp_idf_svc::sys::esp_restart() }
    }

    #[cfg(not(target_os = "espidf"))]
    fn reset(&mut self, reason: ResetReason) {
        error!("reset(sim): {reason:?}");
        self.last = Some(reason);
    }
}
