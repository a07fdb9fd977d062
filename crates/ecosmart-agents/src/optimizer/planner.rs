//! Cost-based load shifting.
//!
//! [`plan`] is a pure function of its input: the same forecast, pricing,
//! device set and clock always yield the same decision. All positions are
//! minutes relative to the forecast's first point, so the horizon is
//! `[0, 24 * 60)`.
//!
//! Devices are handled in three groups:
//! - HVAC devices follow forecast demand, curtailed in peak hours when the
//!   demand is small.
//! - Devices with a run window (configured, or a manual appliance observed
//!   running) are shifted out of peak hours when a cheaper feasible start
//!   exists.
//! - Everything else keeps its allowed window or current state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ecosmart_core::config::OptimizerConfig;
use ecosmart_core::model::MINUTES_PER_DAY;
use ecosmart_core::{
    DecisionInputs, DemandForecast, Device, DeviceAction, Error, Generation, OptimizationDecision,
    PricingSchedule, RationaleTag, Result, RunWindow, TargetAction, Tier, UsagePattern,
};

/// Costs closer than this are equal.
const COST_EPSILON: f64 = 1e-9;
/// Share of rated power above which a manual appliance counts as running.
const RUNNING_SHARE: f64 = 0.10;

/// Knobs that shape the plan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanSettings {
    /// Cap on the combined draw of shifted devices in any hour.
    pub max_deferred_load_watts: Option<f64>,
    /// Peak-hour HVAC demand below this is curtailed.
    pub curtail_below_w: f64,
}

impl From<&OptimizerConfig> for PlanSettings {
    fn from(config: &OptimizerConfig) -> Self {
        Self {
            max_deferred_load_watts: config.max_deferred_load_watts,
            curtail_below_w: config.curtail_below_w,
        }
    }
}

/// Everything one planning run depends on.
#[derive(Debug, Clone, Copy)]
pub struct PlanInput<'a> {
    pub generation: Generation,
    pub now: DateTime<Utc>,
    pub forecast: &'a DemandForecast,
    pub pricing: &'a PricingSchedule,
    pub devices: &'a [Device],
    /// Latest reading per device id.
    pub observed_watts: &'a HashMap<String, f64>,
    pub consumption: Option<Generation>,
    pub settings: &'a PlanSettings,
}

struct Horizon {
    start: DateTime<Utc>,
    first_hour: u8,
    slots: Vec<(Tier, f64)>,
    now: i64,
}

impl Horizon {
    fn new(
        forecast: &DemandForecast,
        pricing: &PricingSchedule,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let first = forecast
            .points
            .first()
            .ok_or_else(|| Error::validation("forecast has no points"))?;
        let slots = forecast
            .points
            .iter()
            .map(|point| {
                pricing
                    .range_at(point.hour)
                    .map(|range| (range.tier, range.rate))
                    .ok_or_else(|| Error::validation(format!("no tariff for hour {}", point.hour)))
            })
            .collect::<Result<Vec<_>>>()?;
        let len = slots.len() as i64 * 60;
        Ok(Self {
            start: first.starts_at,
            first_hour: first.hour,
            now: (now - first.starts_at).num_minutes().clamp(0, len - 1),
            slots,
        })
    }

    fn minutes(&self) -> i64 {
        self.slots.len() as i64 * 60
    }

    fn hour_at(&self, slot: usize) -> u8 {
        ((usize::from(self.first_hour) + slot) % 24) as u8
    }

    fn current_slot(&self) -> usize {
        (self.now / 60) as usize
    }

    fn at(&self, minute: i64) -> DateTime<Utc> {
        self.start + chrono::Duration::minutes(minute)
    }

    /// Slots overlapped by `[start, end)`, clipped to the horizon.
    fn slots_touched(&self, start: i64, end: i64) -> impl Iterator<Item = usize> {
        let first = start.max(0);
        let last = end.min(self.minutes());
        if first < last {
            (first / 60) as usize..((last + 59) / 60) as usize
        } else {
            0..0
        }
    }

    /// Energy cost of drawing `kw` over `[start, end)`.
    fn cost(&self, kw: f64, start: i64, end: i64) -> f64 {
        let mut cursor = start.max(0);
        let end = end.min(self.minutes());
        let mut total = 0.0;
        while cursor < end {
            let slot = (cursor / 60) as usize;
            let segment_end = ((slot as i64 + 1) * 60).min(end);
            total += kw * (segment_end - cursor) as f64 / 60.0 * self.slots[slot].1;
            cursor = segment_end;
        }
        total
    }

    fn touches_peak(&self, start: i64, end: i64) -> bool {
        self.slots_touched(start, end)
            .any(|slot| self.slots[slot].0 == Tier::Peak)
    }
}

/// A run of a device inside the horizon.
#[derive(Debug, Clone, Copy)]
struct Job {
    start: i64,
    duration: u32,
    /// Already running at `now`; never moved.
    running: bool,
    /// Derived from a live reading rather than a configured window.
    observed: bool,
}

impl Job {
    fn end(&self) -> i64 {
        self.start + i64::from(self.duration)
    }
}

fn job_for(
    device: &Device,
    horizon: &Horizon,
    observed_watts: &HashMap<String, f64>,
) -> Option<Job> {
    if let Some(window) = device.run_window {
        let day = i64::from(MINUTES_PER_DAY);
        let horizon_minute = i64::from(horizon.first_hour) * 60;
        let now_of_day = (horizon_minute + horizon.now) % day;
        let elapsed = (now_of_day - i64::from(window.start_minute)).rem_euclid(day);
        if elapsed < i64::from(window.duration_minutes) {
            // Inside the window but idle: the run has not started yet and
            // may still be moved.
            let running = is_running(device, observed_watts);
            return Some(Job {
                start: if running { horizon.now - elapsed } else { horizon.now },
                duration: window.duration_minutes,
                running,
                observed: false,
            });
        }
        let mut start = (i64::from(window.start_minute) - horizon_minute).rem_euclid(day);
        if start < horizon.now {
            start += day;
        }
        return Some(Job {
            start,
            duration: window.duration_minutes,
            running: false,
            observed: false,
        });
    }

    if device.pattern == UsagePattern::Manual {
        let cycle = device.cycle_minutes?;
        if drawing_power(device, observed_watts) {
            return Some(Job {
                start: horizon.now,
                duration: cycle,
                running: false,
                observed: true,
            });
        }
    }
    None
}

fn drawing_power(device: &Device, observed_watts: &HashMap<String, f64>) -> bool {
    observed_watts
        .get(&device.id)
        .is_some_and(|&watts| watts > device.power_watts * RUNNING_SHARE)
}

fn is_running(device: &Device, observed_watts: &HashMap<String, f64>) -> bool {
    device.is_on || drawing_power(device, observed_watts)
}

/// Whether the optimizer may move this device at all.
fn may_shift(device: &Device) -> bool {
    match device.pattern {
        UsagePattern::ScheduleBased => device.allowed_window.is_some(),
        pattern => pattern.is_shiftable(),
    }
}

struct Planned {
    action: DeviceAction,
    baseline_cost: f64,
    plan_cost: f64,
    shifted: bool,
}

struct Shifter<'a> {
    horizon: &'a Horizon,
    settings: &'a PlanSettings,
    /// Watts already shifted into each slot.
    deferred_load: Vec<f64>,
}

impl Shifter<'_> {
    fn place(&mut self, device: &Device, job: Job) -> Planned {
        let horizon = self.horizon;
        let kw = device.power_kw();
        let default_cost = horizon.cost(kw, job.start, job.end());
        let mut tags = Vec::new();
        if job.observed {
            tags.push(RationaleTag::ObservedRunning);
        }

        let movable =
            !job.running && may_shift(device) && horizon.touches_peak(job.start, job.end());
        if !movable {
            tags.push(RationaleTag::DefaultSchedule);
            return Planned {
                action: default_action(device, job, horizon, tags),
                baseline_cost: default_cost,
                plan_cost: default_cost,
                shifted: false,
            };
        }

        let mut best: Option<(i64, f64)> = None;
        let mut capped = false;
        for slot in 0..horizon.slots.len() as i64 {
            let start = slot * 60;
            let end = start + i64::from(job.duration);
            if end > horizon.minutes() {
                break;
            }
            if start < horizon.now || horizon.touches_peak(start, end) {
                continue;
            }
            if let Some(allowed) = device.allowed_window {
                if !horizon
                    .slots_touched(start, end)
                    .all(|s| allowed.contains(horizon.hour_at(s)))
                {
                    continue;
                }
            }
            if let Some(cap) = self.settings.max_deferred_load_watts {
                if horizon
                    .slots_touched(start, end)
                    .any(|s| self.deferred_load[s] + device.power_watts > cap)
                {
                    capped = true;
                    continue;
                }
            }
            let cost = horizon.cost(kw, start, end);
            match best {
                Some((_, best_cost)) if cost >= best_cost - COST_EPSILON => {}
                _ => best = Some((start, cost)),
            }
        }

        match best {
            Some((start, cost)) if cost < default_cost - COST_EPSILON => {
                let end = start + i64::from(job.duration);
                for slot in horizon.slots_touched(start, end) {
                    self.deferred_load[slot] += device.power_watts;
                }
                let all_off_peak = horizon
                    .slots_touched(start, end)
                    .all(|s| horizon.slots[s].0 == Tier::OffPeak);
                tags.push(RationaleTag::PeakAvoidance);
                tags.push(if all_off_peak {
                    RationaleTag::ShiftedToOffPeak
                } else {
                    RationaleTag::ShiftedToNormal
                });
                let slot = (start / 60) as usize;
                tracing::debug!(
                    device_id = %device.id,
                    from = %horizon.at(job.start).format("%H:%M"),
                    to = %horizon.at(start).format("%H:%M"),
                    saving = default_cost - cost,
                    "shifted out of peak"
                );
                Planned {
                    action: DeviceAction {
                        device_id: device.id.clone(),
                        action: TargetAction::DeferUntil {
                            resume_at: horizon.at(start),
                            run_minutes: job.duration,
                        },
                        window: Some(RunWindow::new(
                            u32::from(horizon.hour_at(slot)) * 60,
                            job.duration,
                        )),
                        tags,
                    },
                    baseline_cost: default_cost,
                    plan_cost: cost,
                    shifted: true,
                }
            }
            _ => {
                tags.push(RationaleTag::NoFeasibleShift);
                if capped {
                    tags.push(RationaleTag::LoadCapReached);
                }
                Planned {
                    action: default_action(device, job, horizon, tags),
                    baseline_cost: default_cost,
                    plan_cost: default_cost,
                    shifted: false,
                }
            }
        }
    }
}

fn default_action(
    device: &Device,
    job: Job,
    horizon: &Horizon,
    tags: Vec<RationaleTag>,
) -> DeviceAction {
    let action = if job.start <= horizon.now && horizon.now < job.end() {
        TargetAction::On
    } else {
        TargetAction::DeferUntil {
            resume_at: horizon.at(job.start),
            run_minutes: job.duration,
        }
    };
    DeviceAction {
        device_id: device.id.clone(),
        action,
        window: device.run_window,
        tags,
    }
}

/// Devices with neither a window to shift nor HVAC demand to follow.
fn steady(device: &Device, horizon: &Horizon) -> Planned {
    let kw = device.power_kw();
    let (on_now, cost) = match device.allowed_window {
        Some(allowed) => {
            let cost = (0..horizon.slots.len())
                .filter(|&s| allowed.contains(horizon.hour_at(s)))
                .map(|s| kw * horizon.slots[s].1)
                .sum::<f64>();
            (allowed.contains(horizon.hour_at(horizon.current_slot())), cost)
        }
        None if device.is_on => (true, horizon.cost(kw, 0, horizon.minutes())),
        None => (false, 0.0),
    };
    Planned {
        action: DeviceAction {
            device_id: device.id.clone(),
            action: if on_now {
                TargetAction::On
            } else {
                TargetAction::Off
            },
            window: None,
            tags: vec![RationaleTag::DefaultSchedule],
        },
        baseline_cost: cost,
        plan_cost: cost,
        shifted: false,
    }
}

/// Split forecast HVAC demand across HVAC devices in order, per slot.
fn hvac(
    devices: &[&Device],
    forecast: &DemandForecast,
    horizon: &Horizon,
    settings: &PlanSettings,
) -> Vec<Planned> {
    let mut planned: Vec<Planned> = devices
        .iter()
        .map(|device| Planned {
            action: DeviceAction {
                device_id: device.id.clone(),
                action: TargetAction::Off,
                window: None,
                tags: vec![RationaleTag::NoDemand],
            },
            baseline_cost: 0.0,
            plan_cost: 0.0,
            shifted: false,
        })
        .collect();

    let current = horizon.current_slot();
    for (slot, point) in forecast.points.iter().enumerate() {
        let (tier, rate) = horizon.slots[slot];
        let demand = point.hvac_demand_w();
        let curtailed = tier == Tier::Peak && demand < settings.curtail_below_w;
        let mut remaining = demand;
        for (device, entry) in devices.iter().zip(planned.iter_mut()) {
            let share = remaining.min(device.power_watts).max(0.0);
            remaining -= share;
            let cost = share / 1000.0 * rate;
            entry.baseline_cost += cost;
            if !curtailed {
                entry.plan_cost += cost;
            }
            if slot == current && share > 0.0 {
                if curtailed {
                    entry.action.tags = vec![RationaleTag::PeakCurtailment];
                } else {
                    entry.action.action = TargetAction::On;
                    entry.action.tags = vec![RationaleTag::ComfortDemand];
                }
            }
        }
    }
    planned
}

/// Compute one decision. Critical and uncontrollable devices are skipped.
pub fn plan(input: &PlanInput<'_>) -> Result<OptimizationDecision> {
    let horizon = Horizon::new(input.forecast, input.pricing, input.now)?;

    let mut candidates: Vec<&Device> = input.devices.iter().filter(|d| d.is_deferrable()).collect();
    candidates.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));

    let hvac_devices: Vec<&Device> = candidates.iter().copied().filter(|d| d.hvac).collect();
    let mut by_device: HashMap<&str, Planned> = hvac_devices
        .iter()
        .map(|d| d.id.as_str())
        .zip(hvac(&hvac_devices, input.forecast, &horizon, input.settings))
        .collect();

    let mut shifter = Shifter {
        horizon: &horizon,
        settings: input.settings,
        deferred_load: vec![0.0; horizon.slots.len()],
    };

    let mut actions = Vec::with_capacity(candidates.len());
    let mut baseline_cost = 0.0;
    let mut projected_cost = 0.0;
    let mut any_shifted = false;
    for device in &candidates {
        let planned = match by_device.remove(device.id.as_str()) {
            Some(planned) => planned,
            None => match job_for(device, &horizon, input.observed_watts) {
                Some(job) => shifter.place(device, job),
                None => steady(device, &horizon),
            },
        };
        baseline_cost += planned.baseline_cost;
        projected_cost += planned.plan_cost;
        any_shifted |= planned.shifted;
        actions.push(planned.action);
    }

    let mut tags = Vec::new();
    if any_shifted {
        tags.push(RationaleTag::PeakAvoidance);
    }
    if input.forecast.stale {
        tags.push(RationaleTag::StaleForecast);
    }

    Ok(OptimizationDecision {
        generation: input.generation,
        generated_at: input.now,
        horizon_start: horizon.start,
        actions,
        projected_cost,
        baseline_cost,
        projected_savings: baseline_cost - projected_cost,
        tags,
        inputs: DecisionInputs {
            forecast: input.forecast.generation,
            consumption: input.consumption,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ecosmart_core::{ForecastPoint, HourRange, Priority, TierRange, WeatherSource};

    fn forecast_from(start: DateTime<Utc>, first_hour: u8, temperature_c: f64) -> DemandForecast {
        let points = (0..24u32)
            .map(|offset| ForecastPoint {
                offset,
                hour: ((u32::from(first_hour) + offset) % 24) as u8,
                starts_at: start + chrono::Duration::hours(i64::from(offset)),
                temperature_c,
                humidity_pct: 50.0,
                cooling_demand_w: 0.0,
                heating_demand_w: 0.0,
                total_demand_w: 800.0,
            })
            .collect();
        DemandForecast {
            generation: Generation(1),
            generated_at: start,
            source: WeatherSource::Simulated,
            stale: false,
            points,
        }
    }

    fn washer() -> Device {
        Device::new("washing_machine", 800.0, Priority::Low, true, UsagePattern::Manual)
            .with_run_window(RunWindow::at_hour(18, 90))
            .with_cycle_minutes(90)
    }

    fn run(
        devices: &[Device],
        forecast: &DemandForecast,
        settings: &PlanSettings,
    ) -> OptimizationDecision {
        let pricing = PricingSchedule::moroccan_onee();
        let observed = HashMap::new();
        plan(&PlanInput {
            generation: Generation(7),
            now: forecast.points[0].starts_at,
            forecast,
            pricing: &pricing,
            devices,
            observed_watts: &observed,
            consumption: None,
            settings,
        })
        .unwrap()
    }

    #[test]
    fn test_window_cost_splits_by_hour() {
        let start = Utc.with_ymd_and_hms(2024, 7, 15, 12, 0, 0).unwrap();
        let horizon = Horizon::new(
            &forecast_from(start, 12, 25.0),
            &PricingSchedule::moroccan_onee(),
            start,
        )
        .unwrap();
        // 15:30-16:30 straddles normal and peak.
        let cost = horizon.cost(1.0, 210, 270);
        assert!((cost - (0.5 * 1.20 + 0.5 * 1.65)).abs() < 1e-9);
        assert!(horizon.touches_peak(210, 270));
        assert!(!horizon.touches_peak(0, 240));
    }

    #[test]
    fn test_washer_moves_to_midnight() {
        let start = Utc.with_ymd_and_hms(2024, 7, 15, 12, 0, 0).unwrap();
        let forecast = forecast_from(start, 12, 22.0);
        let decision = run(&[washer()], &forecast, &PlanSettings::default());

        let action = decision.action_for("washing_machine").unwrap();
        assert_eq!(
            action.action,
            TargetAction::DeferUntil {
                resume_at: Utc.with_ymd_and_hms(2024, 7, 16, 0, 0, 0).unwrap(),
                run_minutes: 90,
            }
        );
        assert_eq!(action.window, Some(RunWindow::at_hour(0, 90)));
        assert!(action.tags.contains(&RationaleTag::ShiftedToOffPeak));
        assert!((decision.projected_savings - 0.8 * 1.5 * (1.65 - 0.85)).abs() < 1e-9);
    }

    #[test]
    fn test_schedule_based_without_allowed_window_stays() {
        let start = Utc.with_ymd_and_hms(2024, 7, 15, 12, 0, 0).unwrap();
        let lights = Device::new(
            "led_lights",
            80.0,
            Priority::Medium,
            true,
            UsagePattern::ScheduleBased,
        )
        .with_run_window(RunWindow::at_hour(18, 300));
        let decision = run(&[lights], &forecast_from(start, 12, 22.0), &PlanSettings::default());
        let action = &decision.actions[0];
        assert!(action.tags.contains(&RationaleTag::DefaultSchedule));
        assert_eq!(decision.projected_savings, 0.0);
    }

    #[test]
    fn test_allowed_window_constrains_shift() {
        let start = Utc.with_ymd_and_hms(2024, 7, 15, 12, 0, 0).unwrap();
        // Only 12:00-18:00 allowed and 16:00+ is peak: the 60 minute job
        // can only move into 12:00-16:00, all at the normal rate.
        let device = Device::new(
            "dishwasher",
            1000.0,
            Priority::Low,
            true,
            UsagePattern::ScheduleBased,
        )
        .with_run_window(RunWindow::at_hour(17, 60))
        .with_allowed_window(HourRange::new(12, 18));
        let decision = run(&[device], &forecast_from(start, 12, 22.0), &PlanSettings::default());
        let action = &decision.actions[0];
        assert_eq!(
            action.action,
            TargetAction::DeferUntil {
                resume_at: start,
                run_minutes: 60
            }
        );
        assert!(action.tags.contains(&RationaleTag::ShiftedToNormal));
    }

    #[test]
    fn test_load_cap_limits_shifting() {
        let start = Utc.with_ymd_and_hms(2024, 7, 15, 12, 0, 0).unwrap();
        let settings = PlanSettings {
            max_deferred_load_watts: Some(500.0),
            curtail_below_w: 500.0,
        };
        let decision = run(&[washer()], &forecast_from(start, 12, 22.0), &settings);
        let action = &decision.actions[0];
        assert!(action.tags.contains(&RationaleTag::NoFeasibleShift));
        assert!(action.tags.contains(&RationaleTag::LoadCapReached));
        assert_eq!(decision.projected_savings, 0.0);
    }

    #[test]
    fn test_running_window_is_left_alone() {
        let start = Utc.with_ymd_and_hms(2024, 7, 15, 18, 0, 0).unwrap();
        let forecast = forecast_from(start, 18, 22.0);
        let pricing = PricingSchedule::moroccan_onee();
        let observed = HashMap::new();
        let devices = [washer().with_state(true)];
        let decision = plan(&PlanInput {
            generation: Generation(1),
            now: start + chrono::Duration::minutes(30),
            forecast: &forecast,
            pricing: &pricing,
            devices: &devices,
            observed_watts: &observed,
            consumption: None,
            settings: &PlanSettings::default(),
        })
        .unwrap();
        assert_eq!(decision.actions[0].action, TargetAction::On);
    }

    fn plan_at(
        devices: &[Device],
        forecast: &DemandForecast,
        pricing: &PricingSchedule,
        now: DateTime<Utc>,
        observed: &HashMap<String, f64>,
    ) -> OptimizationDecision {
        plan(&PlanInput {
            generation: Generation(1),
            now,
            forecast,
            pricing,
            devices,
            observed_watts: observed,
            consumption: None,
            settings: &PlanSettings::default(),
        })
        .unwrap()
    }

    #[test]
    fn test_idle_device_inside_window_is_still_shifted() {
        let pricing = PricingSchedule::moroccan_onee();
        let observed = HashMap::new();
        let midnight = Utc.with_ymd_and_hms(2024, 7, 16, 0, 0, 0).unwrap();
        let expected = TargetAction::DeferUntil {
            resume_at: midnight,
            run_minutes: 90,
        };

        // Replanning across the start of the configured window keeps the
        // same off-peak target instead of starting the idle washer.
        for hour in [17, 18, 19] {
            let start = Utc.with_ymd_and_hms(2024, 7, 15, hour, 0, 0).unwrap();
            let forecast = forecast_from(start, hour as u8, 22.0);
            let decision = plan_at(&[washer()], &forecast, &pricing, start, &observed);
            let action = &decision.actions[0];
            assert_eq!(action.action, expected, "planned at {hour}:00");
            assert!(action.tags.contains(&RationaleTag::ShiftedToOffPeak));
            assert!(decision.projected_savings > 0.0);
        }
    }

    #[test]
    fn test_metered_draw_marks_window_as_running() {
        let start = Utc.with_ymd_and_hms(2024, 7, 15, 18, 0, 0).unwrap();
        let forecast = forecast_from(start, 18, 22.0);
        let pricing = PricingSchedule::moroccan_onee();
        let observed = HashMap::from([("washing_machine".to_string(), 780.0)]);
        let now = start + chrono::Duration::minutes(10);
        let decision = plan_at(&[washer()], &forecast, &pricing, now, &observed);
        assert_eq!(decision.actions[0].action, TargetAction::On);
        assert!(decision.actions[0].tags.contains(&RationaleTag::DefaultSchedule));
    }

    #[test]
    fn test_equal_cost_targets_prefer_earliest_slot() {
        // Two separate off-peak bands at the same rate: 20:00-24:00 and
        // 00:00-02:00. Every start from 20:00 to 00:30 costs the same.
        let pricing = PricingSchedule::new(vec![
            TierRange::new(Tier::OffPeak, 0, 2, 0.85),
            TierRange::new(Tier::Normal, 2, 16, 1.20),
            TierRange::new(Tier::Peak, 16, 20, 1.65),
            TierRange::new(Tier::OffPeak, 20, 24, 0.85),
        ]);
        let start = Utc.with_ymd_and_hms(2024, 7, 15, 12, 0, 0).unwrap();
        let forecast = forecast_from(start, 12, 22.0);
        let decision = plan_at(&[washer()], &forecast, &pricing, start, &HashMap::new());
        assert_eq!(
            decision.actions[0].action,
            TargetAction::DeferUntil {
                resume_at: Utc.with_ymd_and_hms(2024, 7, 15, 20, 0, 0).unwrap(),
                run_minutes: 90,
            }
        );
    }

    #[test]
    fn test_same_input_gives_same_decision() {
        let start = Utc.with_ymd_and_hms(2024, 7, 15, 13, 0, 0).unwrap();
        let mut forecast = forecast_from(start, 13, 31.0);
        for point in &mut forecast.points {
            point.cooling_demand_w = 900.0;
        }
        let pricing = PricingSchedule::moroccan_onee();
        let devices = ecosmart_core::config::default_devices();
        let observed = HashMap::from([
            ("washing_machine".to_string(), 20.0),
            ("tv_entertainment".to_string(), 150.0),
        ]);
        let now = start + chrono::Duration::minutes(25);

        let first = plan_at(&devices, &forecast, &pricing, now, &observed);
        let second = plan_at(&devices, &forecast, &pricing, now, &observed);
        assert_eq!(first, second);
    }

    #[test]
    fn test_observed_manual_run_gets_cycle_window() {
        let start = Utc.with_ymd_and_hms(2024, 7, 15, 17, 0, 0).unwrap();
        let forecast = forecast_from(start, 17, 22.0);
        let pricing = PricingSchedule::moroccan_onee();
        let device = Device::new("dryer", 2000.0, Priority::Low, true, UsagePattern::Manual)
            .with_cycle_minutes(60);
        let observed = HashMap::from([("dryer".to_string(), 1900.0)]);
        let devices = [device];
        let decision = plan(&PlanInput {
            generation: Generation(1),
            now: start,
            forecast: &forecast,
            pricing: &pricing,
            devices: &devices,
            observed_watts: &observed,
            consumption: None,
            settings: &PlanSettings::default(),
        })
        .unwrap();
        let action = &decision.actions[0];
        assert!(action.tags.contains(&RationaleTag::ObservedRunning));
        assert!(action.tags.contains(&RationaleTag::ShiftedToOffPeak));
        // Midnight beats the normal-rate hours right after the peak band.
        assert_eq!(
            action.action,
            TargetAction::DeferUntil {
                resume_at: start + chrono::Duration::hours(7),
                run_minutes: 60
            }
        );
    }

    #[test]
    fn test_hvac_follows_demand_and_curtails_small_peak_loads() {
        let start = Utc.with_ymd_and_hms(2024, 7, 15, 17, 0, 0).unwrap();
        let mut forecast = forecast_from(start, 17, 30.0);
        forecast.points[0].cooling_demand_w = 300.0;
        let ac = Device::new(
            "living_room_ac",
            2000.0,
            Priority::High,
            true,
            UsagePattern::TemperatureDependent,
        )
        .with_hvac();
        let settings = PlanSettings {
            max_deferred_load_watts: None,
            curtail_below_w: 500.0,
        };
        let decision = run(&[ac.clone()], &forecast, &settings);
        assert_eq!(decision.actions[0].action, TargetAction::Off);
        assert_eq!(decision.actions[0].tags, vec![RationaleTag::PeakCurtailment]);
        assert!(decision.projected_savings > 0.0);

        forecast.points[0].cooling_demand_w = 1800.0;
        let decision = run(&[ac], &forecast, &settings);
        assert_eq!(decision.actions[0].action, TargetAction::On);
        assert_eq!(decision.actions[0].tags, vec![RationaleTag::ComfortDemand]);
    }

    #[test]
    fn test_ordering_and_critical_exclusion() {
        let start = Utc.with_ymd_and_hms(2024, 7, 15, 12, 0, 0).unwrap();
        let devices = ecosmart_core::config::default_devices();
        let decision = run(&devices, &forecast_from(start, 12, 28.0), &PlanSettings::default());
        assert!(decision.action_for("refrigerator").is_none());
        let ids: Vec<&str> = decision.actions.iter().map(|a| a.device_id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "tv_entertainment",
                "washing_machine",
                "led_lights",
                "bedroom_ac",
                "living_room_ac"
            ]
        );
    }
}
