//! Run-wide settings handed to the flash and SRAM sequencers.

use std::time::Duration;

/// Fixed protocol delays.
///
/// Several of these have no status bit that reflects completion (the write
/// enable latch, reset release), so shortening them corrupts device state.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    /// How long RESET is held in each phase of the SRAM handshake
    pub reset_hold: Duration,
    /// Delay between CS edges and the command byte
    pub cs_setup: Duration,
    /// Settle time after write enable, power-down release and unlock
    pub command_settle: Duration,
    /// Pause between busy flag polls
    pub busy_poll_interval: Duration,
    /// Wait before sampling CDONE after the trailing clocks
    pub done_wait: Duration,
    /// Half of the RESET pulse issued by a reboot
    pub reboot_pulse: Duration,
    /// Time given to the operator to press or release the reset button
    pub manual_reset_pause: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            reset_hold: Duration::from_millis(250),
            cs_setup: Duration::from_millis(1),
            command_settle: Duration::from_millis(5),
            busy_poll_interval: Duration::from_micros(100),
            done_wait: Duration::from_millis(100),
            reboot_pulse: Duration::from_millis(100),
            manual_reset_pause: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
impl Timing {
    pub fn zero() -> Self {
        Self {
            reset_hold: Duration::ZERO,
            cs_setup: Duration::ZERO,
            command_settle: Duration::ZERO,
            busy_poll_interval: Duration::ZERO,
            done_wait: Duration::ZERO,
            reboot_pulse: Duration::ZERO,
            manual_reset_pause: Duration::ZERO,
        }
    }
}

/// Attempts allowed for a single page before the write is abandoned
pub const PAGE_RETRIES: u32 = 16;

#[derive(Debug, Clone, Copy)]
pub struct Settings {
    pub timing: Timing,
    /// Give up on the busy flag after this many polls. `None` waits forever.
    pub busy_poll_limit: Option<u32>,
    /// Turn a low CDONE or verify mismatches into errors instead of reports
    pub strict: bool,
    /// Prompt the operator to toggle reset by hand during SRAM configuration
    pub manual_reset: bool,
    pub page_retries: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            timing: Timing::default(),
            busy_poll_limit: None,
            strict: false,
            manual_reset: false,
            page_retries: PAGE_RETRIES,
        }
    }
}

#[cfg(test)]
impl Settings {
    pub fn instant() -> Self {
        Self {
            timing: Timing::zero(),
            ..Default::default()
        }
    }
}

pub fn delay(duration: Duration) {
    if !duration.is_zero() {
        spin_sleep::sleep(duration);
    }
}
