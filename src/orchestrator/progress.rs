// src/orchestrator/progress.rs

//! Monotonic install-request progress
//!
//! The plan an install request executes can shrink or grow between
//! iterations as downloads land and supersedence changes the graph. Reported
//! overall progress must never move backwards, so completed percent is
//! banked as a floor whenever the plan changes shape and all later progress
//! scales into the remaining range.

/// Work units per package install step
const INSTALL_UNITS: u64 = 100;
/// Work units per package acquisition step
const DOWNLOAD_UNITS: u64 = 100;

/// Overall progress accounting for one install request
#[derive(Debug, Default)]
pub struct InstallProgress {
    /// Percent banked from previous plan shapes; only ever rises
    floor: u8,
    /// Work units in the current plan shape
    total_units: u64,
    /// Completed units in the current plan shape
    done_units: u64,
    /// Partial units from in-flight downloads, folded in during waits
    download_units: u64,
}

impl InstallProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-weight for a new plan shape
    ///
    /// Current percent is banked as the new floor first, so progress stays
    /// monotonic even when the new plan is larger than the old one.
    pub fn rescale(&mut self, to_install: usize, missing: usize) {
        self.floor = self.overall_percent();
        self.total_units =
            to_install as u64 * INSTALL_UNITS + missing as u64 * DOWNLOAD_UNITS;
        self.done_units = 0;
        self.download_units = 0;
    }

    /// One package finished installing
    pub fn package_installed(&mut self) {
        self.done_units = (self.done_units + INSTALL_UNITS).min(self.total_units);
    }

    /// Fold in partial units from in-flight downloads
    ///
    /// Taken as a running maximum so a restarted transfer cannot pull the
    /// reported percent backwards within one plan shape.
    pub fn set_download_units(&mut self, units: u64) {
        self.download_units = self.download_units.max(units);
    }

    /// Units one missing package contributes while downloading
    pub fn download_units_per_package() -> u64 {
        DOWNLOAD_UNITS
    }

    /// Overall percent, scaled into the range above the banked floor
    pub fn overall_percent(&self) -> u8 {
        if self.total_units == 0 {
            return self.floor;
        }
        let units = (self.done_units + self.download_units).min(self.total_units);
        let raw = units * 100 / self.total_units;
        let scaled = self.floor as u64 + (100 - self.floor as u64) * raw / 100;
        scaled.min(100) as u8
    }
}
