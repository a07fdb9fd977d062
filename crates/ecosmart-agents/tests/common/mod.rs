//! Shared fixtures for the agent integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, DurationRound, Utc};
use ecosmart_core::{
    DecisionInputs, DemandForecast, Device, DeviceAction, EcoEvent, Envelope, EventBusReceiver,
    ExecutionReport, ForecastPoint, Generation, OptimizationDecision, Priority, RunWindow,
    TargetAction, UsagePattern, WeatherSource,
};

pub fn washer() -> Device {
    Device::new("washing_machine", 800.0, Priority::Low, true, UsagePattern::Manual)
        .with_run_window(RunWindow::at_hour(18, 90))
        .with_cycle_minutes(90)
        .with_max_off_minutes(12 * 60)
}

pub fn refrigerator() -> Device {
    Device::new("refrigerator", 150.0, Priority::Critical, false, UsagePattern::Constant)
        .with_state(true)
}

pub fn bedroom_ac() -> Device {
    Device::new("bedroom_ac", 1500.0, Priority::High, true, UsagePattern::ScheduleBased).with_hvac()
}

/// Start of the current hour.
pub fn this_hour() -> DateTime<Utc> {
    let now = Utc::now();
    now.duration_trunc(chrono::Duration::hours(1)).unwrap_or(now)
}

/// Flat 24-point forecast whose first point is labelled `first_hour`.
pub fn forecast(
    generation: u64,
    start: DateTime<Utc>,
    first_hour: u8,
    temperature_c: f64,
) -> DemandForecast {
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
        generation: Generation(generation),
        generated_at: start,
        source: WeatherSource::Simulated,
        stale: false,
        points,
    }
}

pub fn decision(generation: u64, actions: Vec<(&str, TargetAction)>) -> OptimizationDecision {
    let now = Utc::now();
    OptimizationDecision {
        generation: Generation(generation),
        generated_at: now,
        horizon_start: now,
        actions: actions
            .into_iter()
            .map(|(device_id, action)| DeviceAction {
                device_id: device_id.to_string(),
                action,
                window: None,
                tags: Vec::new(),
            })
            .collect(),
        projected_cost: 0.0,
        baseline_cost: 0.0,
        projected_savings: 0.0,
        tags: Vec::new(),
        inputs: DecisionInputs::default(),
    }
}

pub async fn next_envelope(rx: &mut EventBusReceiver) -> Arc<Envelope> {
    tokio::time::timeout(Duration::from_secs(3600), rx.recv())
        .await
        .expect("event before timeout")
        .expect("bus open")
}

pub async fn next_report(rx: &mut EventBusReceiver) -> ExecutionReport {
    loop {
        if let EcoEvent::ExecutionReport(report) = &next_envelope(rx).await.event {
            return report.clone();
        }
    }
}

pub async fn next_decision(rx: &mut EventBusReceiver) -> OptimizationDecision {
    loop {
        if let EcoEvent::OptimizationDecision(decision) = &next_envelope(rx).await.event {
            return decision.clone();
        }
    }
}
