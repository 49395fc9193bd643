// Node clock driven by the 1 s system tick

use tracing::{debug, info};

use crate::platform::ScannerSettings;

const SECONDS_PER_DAY: u32 = 24 * 60 * 60;

/// Wall time as far as the node knows it, plus the duty-cycle bookkeeping
/// that hangs off the tick.
#[derive(Debug, Clone)]
pub struct Clock {
    /// Seconds since midnight
    system_time: u32,
    /// Minutes since boot
    uptime: u32,
    /// Uptime before which the node stays idle
    wakeup: u32,
    period: u32,
    sleep_sum: u32,
    stale: bool,
    /// Monotonic milliseconds since boot, for list expiry
    elapsed_ms: u64,
    daytime_start: u32,
    nighttime_start: u32,
    day_period: u32,
    night_period: u32,
}

impl Clock {
    pub fn new(settings: &ScannerSettings) -> Self {
        Self {
            system_time: settings.daytime_start_secs,
            uptime: 1,
            wakeup: 0,
            period: settings.day_period_secs(),
            sleep_sum: 0,
            stale: true,
            elapsed_ms: 0,
            daytime_start: settings.daytime_start_secs,
            nighttime_start: settings.nighttime_start_secs,
            day_period: settings.day_period_secs(),
            night_period: settings.night_period_secs(),
        }
    }

    pub fn system_time(&self) -> u32 {
        self.system_time
    }

    pub fn uptime(&self) -> u32 {
        self.uptime
    }

    pub fn wakeup(&self) -> u32 {
        self.wakeup
    }

    pub fn period(&self) -> u32 {
        self.period
    }

    /// Seconds spent idle since boot
    pub fn sleep_sum(&self) -> u32 {
        self.sleep_sum
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    /// Time of day received from a peer, in milliseconds since midnight
    pub fn update_from_ms(&mut self, time_ms: u32) {
        self.system_time = (time_ms / 1000) % SECONDS_PER_DAY;
        self.stale = false;
        info!(system_time = self.system_time, "System time updated");
    }

    /// Stay idle for `minutes` from now
    pub fn set_idle_minutes(&mut self, minutes: u16) {
        self.wakeup = self.uptime + u32::from(minutes);
        debug!(wakeup = self.wakeup, "Idle requested");
    }

    /// Advance one second. Returns `true` when an idle node should wake up
    /// and scan.
    pub fn tick(&mut self, idle: bool) -> bool {
        self.elapsed_ms += 1000;
        self.system_time += 1;
        if self.system_time >= SECONDS_PER_DAY {
            self.system_time = 0;
            self.stale = true;
        }
        if self.system_time % 60 == 0 {
            self.uptime += 1;
        }
        if idle {
            self.sleep_sum += 1;
        }

        if self.system_time == self.daytime_start {
            self.period = self.day_period;
        } else if self.system_time == self.nighttime_start {
            self.period = self.night_period;
        }

        idle && self.system_time % self.period == 0 && self.wakeup < self.uptime
    }
}
