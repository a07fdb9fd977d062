//! Shared data model: devices, pricing and generation numbers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, FixedOffset, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Minutes in one day.
pub const MINUTES_PER_DAY: u32 = 24 * 60;

/// Monotonically increasing sequence number attached to produced records.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Generation(pub u64);

impl Generation {
    pub const ZERO: Generation = Generation(0);

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Per-producer generation source. The first generation handed out is 1.
#[derive(Debug, Default)]
pub struct GenerationCounter(AtomicU64);

impl GenerationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> Generation {
        Generation(self.0.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn current(&self) -> Generation {
        Generation(self.0.load(Ordering::SeqCst))
    }
}

/// How an incoming generation relates to the last one a consumer processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Newer than anything seen so far.
    Fresh,
    /// Equal to the last processed generation.
    Current,
    /// Older than the last processed generation; must be discarded.
    Stale,
}

/// Tracks the last processed generation for one input stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenerationTracker {
    last: Option<Generation>,
}

impl GenerationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify `generation` and advance the tracker when it is fresh.
    pub fn observe(&mut self, generation: Generation) -> Freshness {
        match self.last {
            Some(last) if generation < last => Freshness::Stale,
            Some(last) if generation == last => Freshness::Current,
            _ => {
                self.last = Some(generation);
                Freshness::Fresh
            }
        }
    }

    pub fn last(&self) -> Option<Generation> {
        self.last
    }
}

/// Device priority tier. Ordering is ascending: `Low` sorts first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

/// Usage-pattern tag that constrains when a device may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsagePattern {
    TemperatureDependent,
    ScheduleBased,
    Constant,
    Manual,
    EveningPeak,
}

impl UsagePattern {
    /// Whether the optimizer may move this device's operating window.
    ///
    /// Schedule-based devices additionally need an allowed window.
    pub fn is_shiftable(&self) -> bool {
        matches!(self, UsagePattern::Manual | UsagePattern::ScheduleBased)
    }
}

/// Half-open range of local hours `[start, end)`. Wraps past midnight when
/// `start > end`; `0..24` covers the whole day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourRange {
    pub start: u8,
    pub end: u8,
}

impl HourRange {
    pub fn new(start: u8, end: u8) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, hour: u8) -> bool {
        if self.start < self.end {
            hour >= self.start && hour < self.end
        } else {
            hour >= self.start || hour < self.end
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.start > 23 || self.end > 24 || self.start == self.end {
            return Err(Error::config(format!(
                "invalid hour range {}..{}",
                self.start, self.end
            )));
        }
        Ok(())
    }
}

impl fmt::Display for HourRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:00-{:02}:00", self.start, self.end)
    }
}

/// A device's default daily operating window in local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunWindow {
    /// Minute of the local day the window starts at.
    pub start_minute: u32,
    pub duration_minutes: u32,
}

impl RunWindow {
    pub fn new(start_minute: u32, duration_minutes: u32) -> Self {
        Self {
            start_minute,
            duration_minutes,
        }
    }

    pub fn at_hour(hour: u32, duration_minutes: u32) -> Self {
        Self::new(hour * 60, duration_minutes)
    }

    /// Whether `minute_of_day` falls inside the window, wrapping midnight.
    pub fn contains_minute(&self, minute_of_day: u32) -> bool {
        let offset = (minute_of_day + MINUTES_PER_DAY - self.start_minute) % MINUTES_PER_DAY;
        offset < self.duration_minutes
    }
}

/// A device record. The id is immutable and joins every other record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub power_watts: f64,
    pub priority: Priority,
    pub controllable: bool,
    #[serde(default)]
    pub is_on: bool,
    #[serde(default)]
    pub room: String,
    pub pattern: UsagePattern,
    #[serde(default = "default_efficiency")]
    pub efficiency_rating: String,
    /// Climate devices are driven by forecast demand and comfort bounds.
    #[serde(default)]
    pub hvac: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_window: Option<RunWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_window: Option<HourRange>,
    /// Cycle length used when a manual device is observed running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle_minutes: Option<u32>,
    /// Longest the device may be held off by a deferral.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_off_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_changed: Option<DateTime<Utc>>,
}

fn default_efficiency() -> String {
    "A".to_string()
}

impl Device {
    pub fn new(
        id: impl Into<String>,
        power_watts: f64,
        priority: Priority,
        controllable: bool,
        pattern: UsagePattern,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            power_watts,
            priority,
            controllable,
            is_on: false,
            room: String::new(),
            pattern,
            efficiency_rating: default_efficiency(),
            hvac: false,
            run_window: None,
            allowed_window: None,
            cycle_minutes: None,
            max_off_minutes: None,
            last_changed: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = room.into();
        self
    }

    pub fn with_efficiency(mut self, rating: impl Into<String>) -> Self {
        self.efficiency_rating = rating.into();
        self
    }

    pub fn with_hvac(mut self) -> Self {
        self.hvac = true;
        self
    }

    pub fn with_run_window(mut self, window: RunWindow) -> Self {
        self.run_window = Some(window);
        self
    }

    pub fn with_allowed_window(mut self, range: HourRange) -> Self {
        self.allowed_window = Some(range);
        self
    }

    pub fn with_cycle_minutes(mut self, minutes: u32) -> Self {
        self.cycle_minutes = Some(minutes);
        self
    }

    pub fn with_max_off_minutes(mut self, minutes: u32) -> Self {
        self.max_off_minutes = Some(minutes);
        self
    }

    pub fn with_state(mut self, is_on: bool) -> Self {
        self.is_on = is_on;
        self
    }

    pub fn is_critical(&self) -> bool {
        self.priority == Priority::Critical
    }

    /// Controllable and not critical.
    pub fn is_deferrable(&self) -> bool {
        self.controllable && !self.is_critical()
    }

    /// Devices the monitor samples.
    pub fn is_monitored(&self) -> bool {
        self.controllable || self.is_critical()
    }

    pub fn power_kw(&self) -> f64 {
        self.power_watts / 1000.0
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::config("device id must not be empty"));
        }
        if !self.power_watts.is_finite() || self.power_watts <= 0.0 {
            return Err(Error::config(format!(
                "device {} has non-positive power {}",
                self.id, self.power_watts
            )));
        }
        if let Some(window) = &self.run_window {
            if window.start_minute >= MINUTES_PER_DAY
                || window.duration_minutes == 0
                || window.duration_minutes > MINUTES_PER_DAY
            {
                return Err(Error::config(format!(
                    "device {} has an invalid run window",
                    self.id
                )));
            }
        }
        if let Some(range) = &self.allowed_window {
            range.validate()?;
        }
        Ok(())
    }
}

/// Pricing category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    OffPeak,
    Normal,
    Peak,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::OffPeak => "off_peak",
            Tier::Normal => "normal",
            Tier::Peak => "peak",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tariff range of the daily schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierRange {
    pub tier: Tier,
    pub start_hour: u8,
    pub end_hour: u8,
    /// Price per kWh.
    pub rate: f64,
}

impl TierRange {
    pub fn new(tier: Tier, start_hour: u8, end_hour: u8, rate: f64) -> Self {
        Self {
            tier,
            start_hour,
            end_hour,
            rate,
        }
    }

    pub fn hours(&self) -> HourRange {
        HourRange::new(self.start_hour, self.end_hour)
    }
}

/// Daily tiered tariff. Loaded once, read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingSchedule {
    pub ranges: Vec<TierRange>,
    #[serde(default)]
    pub base_fee_monthly: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "MAD".to_string()
}

impl PricingSchedule {
    pub fn new(ranges: Vec<TierRange>) -> Self {
        Self {
            ranges,
            base_fee_monthly: 0.0,
            currency: default_currency(),
        }
    }

    pub fn with_base_fee(mut self, fee: f64) -> Self {
        self.base_fee_monthly = fee;
        self
    }

    /// ONEE residential tariff used by the built-in household.
    pub fn moroccan_onee() -> Self {
        Self::new(vec![
            TierRange::new(Tier::OffPeak, 0, 6, 0.85),
            TierRange::new(Tier::Normal, 6, 16, 1.20),
            TierRange::new(Tier::Peak, 16, 22, 1.65),
            TierRange::new(Tier::Normal, 22, 24, 1.20),
        ])
        .with_base_fee(45.0)
    }

    pub fn range_at(&self, hour: u8) -> Option<&TierRange> {
        self.ranges.iter().find(|r| r.hours().contains(hour % 24))
    }

    pub fn tier_at(&self, hour: u8) -> Option<Tier> {
        self.range_at(hour).map(|r| r.tier)
    }

    pub fn rate_at(&self, hour: u8) -> Option<f64> {
        self.range_at(hour).map(|r| r.rate)
    }

    /// Ranges must not overlap and must cover all 24 hours.
    pub fn validate(&self) -> Result<()> {
        for range in &self.ranges {
            range.hours().validate()?;
            if !range.rate.is_finite() || range.rate <= 0.0 {
                return Err(Error::config(format!(
                    "tier {} at {} has non-positive rate",
                    range.tier,
                    range.hours()
                )));
            }
        }
        for hour in 0..24u8 {
            let covering = self
                .ranges
                .iter()
                .filter(|r| r.hours().contains(hour))
                .count();
            match covering {
                0 => {
                    return Err(Error::config(format!(
                        "pricing schedule does not cover hour {hour}"
                    )))
                }
                1 => {}
                _ => {
                    return Err(Error::config(format!(
                        "pricing ranges overlap at hour {hour}"
                    )))
                }
            }
        }
        if self.base_fee_monthly < 0.0 {
            return Err(Error::config("base fee must not be negative"));
        }
        Ok(())
    }
}

/// Local hour of day for a UTC timestamp.
pub fn local_hour(ts: DateTime<Utc>, offset: FixedOffset) -> u8 {
    ts.with_timezone(&offset).hour() as u8
}

/// Local minute of day for a UTC timestamp.
pub fn local_minute_of_day(ts: DateTime<Utc>, offset: FixedOffset) -> u32 {
    let local = ts.with_timezone(&offset);
    local.hour() * 60 + local.minute()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_tracker() {
        let mut tracker = GenerationTracker::new();
        assert_eq!(tracker.observe(Generation(2)), Freshness::Fresh);
        assert_eq!(tracker.observe(Generation(2)), Freshness::Current);
        assert_eq!(tracker.observe(Generation(1)), Freshness::Stale);
        assert_eq!(tracker.observe(Generation(5)), Freshness::Fresh);
        assert_eq!(tracker.last(), Some(Generation(5)));
    }

    #[test]
    fn test_generation_counter_starts_at_one() {
        let counter = GenerationCounter::new();
        assert_eq!(counter.current(), Generation::ZERO);
        assert_eq!(counter.next(), Generation(1));
        assert_eq!(counter.next(), Generation(2));
    }

    #[test]
    fn test_priority_orders_low_first() {
        let mut tiers = vec![Priority::Critical, Priority::Low, Priority::High, Priority::Medium];
        tiers.sort();
        assert_eq!(
            tiers,
            vec![Priority::Low, Priority::Medium, Priority::High, Priority::Critical]
        );
    }

    #[test]
    fn test_hour_range_wraps_midnight() {
        let night = HourRange::new(22, 6);
        assert!(night.contains(23));
        assert!(night.contains(0));
        assert!(night.contains(5));
        assert!(!night.contains(6));
        assert!(!night.contains(12));
    }

    #[test]
    fn test_run_window_contains_minute() {
        let window = RunWindow::at_hour(23, 90);
        assert!(window.contains_minute(23 * 60));
        assert!(window.contains_minute(20));
        assert!(!window.contains_minute(30));
    }

    #[test]
    fn test_onee_schedule_is_valid() {
        let pricing = PricingSchedule::moroccan_onee();
        pricing.validate().unwrap();
        assert_eq!(pricing.tier_at(3), Some(Tier::OffPeak));
        assert_eq!(pricing.tier_at(18), Some(Tier::Peak));
        assert_eq!(pricing.tier_at(23), Some(Tier::Normal));
        assert_eq!(pricing.rate_at(16), Some(1.65));
    }

    #[test]
    fn test_pricing_rejects_gap_and_overlap() {
        let gap = PricingSchedule::new(vec![TierRange::new(Tier::Normal, 0, 23, 1.0)]);
        assert!(gap.validate().is_err());

        let overlap = PricingSchedule::new(vec![
            TierRange::new(Tier::Normal, 0, 24, 1.0),
            TierRange::new(Tier::Peak, 18, 20, 2.0),
        ]);
        assert!(overlap.validate().is_err());
    }

    #[test]
    fn test_device_validation() {
        let ok = Device::new("washer", 800.0, Priority::Low, true, UsagePattern::Manual);
        ok.validate().unwrap();
        assert!(ok.is_deferrable());

        let bad = Device::new("", 800.0, Priority::Low, true, UsagePattern::Manual);
        assert!(bad.validate().is_err());

        let fridge =
            Device::new("fridge", 150.0, Priority::Critical, false, UsagePattern::Constant);
        assert!(fridge.is_monitored());
        assert!(!fridge.is_deferrable());
    }
}
