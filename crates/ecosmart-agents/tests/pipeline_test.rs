//! End-to-end behaviour of the agent pipeline over the event bus.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Offset, Utc};
use common::*;
use ecosmart_agents::{
    Agent, AgentContext, AgentRuntime, ControllerAgent, EcoSystem, MonitorAgent, OptimizerAgent,
    WeatherAgent, WeatherFetcher, WeatherReading,
};
use ecosmart_core::config::{
    ControllerConfig, MonitorConfig, OptimizerConfig, RuntimeConfig, SafetyConfig, WeatherConfig,
};
use ecosmart_core::{
    AgentState, AnomalySeverity, EcoEvent, Error, EventBus, Generation, OutcomeResult,
    OverrideRequest, PricingSchedule, RationaleTag, RejectReason, ReportSource, SystemConfig,
    TargetAction, Topic, WeatherSource,
};
use ecosmart_devices::{registry, SimulatedHousehold};

#[tokio::test]
async fn test_washer_shifted_out_of_peak_and_executed() {
    let bus = EventBus::new();
    let (_d, mut decisions) = bus.receiver(Topic::Decision);
    let (_e, mut reports) = bus.receiver(Topic::Execution);

    let (writer, view) = registry(vec![washer(), refrigerator()]).unwrap();
    let household = Arc::new(SimulatedHousehold::new(view.clone(), 11));
    let optimizer = OptimizerAgent::new(
        OptimizerConfig {
            debounce_ms: 10,
            ..Default::default()
        },
        PricingSchedule::moroccan_onee(),
        view.clone(),
    );
    let controller = ControllerAgent::new(
        ControllerConfig::default(),
        SafetyConfig::default(),
        writer,
        household.clone(),
    );
    let mut optimizer = AgentRuntime::spawn(optimizer, bus.clone(), &RuntimeConfig::default());
    let mut controller = AgentRuntime::spawn(controller, bus.clone(), &RuntimeConfig::default());
    optimizer.start().await.unwrap();
    controller.start().await.unwrap();

    // Noon forecast: the washer's 18:00 run falls in the peak tier.
    let start = this_hour();
    bus.emit(EcoEvent::DemandForecast(forecast(1, start, 12, 22.0)), "weather")
        .unwrap();

    let decision = next_decision(&mut decisions).await;
    assert!(decision.action_for("refrigerator").is_none());
    let action = decision.action_for("washing_machine").unwrap();
    assert_eq!(
        action.action,
        TargetAction::DeferUntil {
            resume_at: start + chrono::Duration::hours(12),
            run_minutes: 90,
        }
    );
    assert!(action.tags.contains(&RationaleTag::ShiftedToOffPeak));
    assert!(decision.tags.contains(&RationaleTag::PeakAvoidance));
    assert!((decision.projected_savings - 0.96).abs() < 1e-9);
    assert_eq!(decision.inputs.forecast, Generation(1));

    let report = next_report(&mut reports).await;
    assert_eq!(report.decision_generation(), Some(decision.generation));
    assert_eq!(
        report.outcome_for("washing_machine").unwrap().result,
        OutcomeResult::Applied { changed: false }
    );
    assert_eq!(view.is_on("washing_machine"), Some(false));
    assert_eq!(view.is_on("refrigerator"), Some(true));
    assert!(household.commands().is_empty());

    controller.stop().await.unwrap();
    optimizer.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_override_blocks_plan_then_reverts() {
    let bus = EventBus::new();
    let (_e, mut reports) = bus.receiver(Topic::Execution);
    let (writer, view) = registry(vec![bedroom_ac()]).unwrap();
    let household = Arc::new(SimulatedHousehold::new(view.clone(), 2));
    let controller = ControllerAgent::new(
        ControllerConfig::default(),
        SafetyConfig::default(),
        writer,
        household.clone(),
    );
    let status = controller.view();
    let mut controller = AgentRuntime::spawn(controller, bus.clone(), &RuntimeConfig::default());
    controller.start().await.unwrap();
    let started = tokio::time::Instant::now();

    let request = OverrideRequest::new("bedroom_ac", true, Duration::from_secs(30 * 60));
    let request_id = request.request_id.clone();
    bus.emit(EcoEvent::OverrideRequest(request), "operator").unwrap();

    let report = next_report(&mut reports).await;
    assert_eq!(report.source, ReportSource::Override { request_id });
    assert_eq!(report.outcomes[0].result, OutcomeResult::Applied { changed: true });
    assert_eq!(view.is_on("bedroom_ac"), Some(true));
    assert_eq!(status.overrides().len(), 1);

    // The plan wants it off, but the override wins while active.
    bus.emit(
        EcoEvent::OptimizationDecision(decision(1, vec![("bedroom_ac", TargetAction::Off)])),
        "optimizer",
    )
    .unwrap();
    let report = next_report(&mut reports).await;
    assert_eq!(report.decision_generation(), Some(Generation(1)));
    assert_eq!(
        report.outcomes[0].reject_reason(),
        Some(&RejectReason::ManualOverride)
    );
    assert_eq!(view.is_on("bedroom_ac"), Some(true));

    let report = next_report(&mut reports).await;
    assert_eq!(
        report.source,
        ReportSource::OverrideExpired {
            device_id: "bedroom_ac".into()
        }
    );
    assert!(started.elapsed() >= Duration::from_secs(30 * 60));
    assert!(report.outcomes[0].is_applied());
    assert_eq!(view.is_on("bedroom_ac"), Some(false));
    assert!(status.overrides().is_empty());
    assert_eq!(household.commands().len(), 2);

    controller.stop().await.unwrap();
}

#[tokio::test]
async fn test_older_decision_is_superseded() {
    let bus = EventBus::new();
    let (_e, mut reports) = bus.receiver(Topic::Execution);
    let (writer, view) = registry(vec![bedroom_ac(), washer()]).unwrap();
    let household = Arc::new(SimulatedHousehold::new(view.clone(), 3));
    let controller = ControllerAgent::new(
        ControllerConfig::default(),
        SafetyConfig::default(),
        writer,
        household,
    );
    let status = controller.view();
    let mut controller = AgentRuntime::spawn(controller, bus.clone(), &RuntimeConfig::default());
    controller.start().await.unwrap();

    let newer = decision(2, vec![("bedroom_ac", TargetAction::On)]);
    let older = decision(
        1,
        vec![("bedroom_ac", TargetAction::Off), ("washing_machine", TargetAction::On)],
    );
    bus.emit(EcoEvent::OptimizationDecision(newer), "optimizer").unwrap();
    bus.emit(EcoEvent::OptimizationDecision(older), "optimizer").unwrap();

    let mut seen = Vec::new();
    while seen.len() < 2 {
        seen.push(next_report(&mut reports).await);
    }
    let stale = seen
        .iter()
        .find(|r| r.decision_generation() == Some(Generation(1)))
        .unwrap();
    assert_eq!(stale.outcomes.len(), 2);
    assert!(stale
        .outcomes
        .iter()
        .all(|o| o.reject_reason() == Some(&RejectReason::Superseded)));

    let executed = seen
        .iter()
        .find(|r| r.decision_generation() == Some(Generation(2)))
        .unwrap();
    assert!(executed.outcomes[0].is_applied());
    assert_eq!(view.is_on("bedroom_ac"), Some(true));
    assert_eq!(view.is_on("washing_machine"), Some(false));
    assert_eq!(status.active_generation(), Some(Generation(2)));

    controller.stop().await.unwrap();
}

#[tokio::test]
async fn test_repeated_decision_changes_nothing() {
    let bus = EventBus::new();
    let (_e, mut reports) = bus.receiver(Topic::Execution);
    let (writer, view) = registry(vec![bedroom_ac()]).unwrap();
    let household = Arc::new(SimulatedHousehold::new(view.clone(), 4));
    let controller = ControllerAgent::new(
        ControllerConfig::default(),
        SafetyConfig::default(),
        writer,
        household.clone(),
    );
    let mut controller = AgentRuntime::spawn(controller, bus.clone(), &RuntimeConfig::default());
    controller.start().await.unwrap();

    let on = vec![("bedroom_ac", TargetAction::On)];
    bus.emit(EcoEvent::OptimizationDecision(decision(1, on.clone())), "optimizer")
        .unwrap();
    let first = next_report(&mut reports).await;
    assert_eq!(first.outcomes[0].result, OutcomeResult::Applied { changed: true });

    bus.emit(EcoEvent::OptimizationDecision(decision(2, on)), "optimizer")
        .unwrap();
    let second = next_report(&mut reports).await;
    assert_eq!(second.decision_generation(), Some(Generation(2)));
    assert_eq!(second.outcomes[0].result, OutcomeResult::Applied { changed: false });
    assert_eq!(household.commands().len(), 1);

    controller.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_forecasts_within_debounce_coalesce() {
    let bus = EventBus::new();
    let (_d, mut decisions) = bus.receiver(Topic::Decision);
    let (_writer, view) = registry(vec![washer()]).unwrap();
    let optimizer = OptimizerAgent::new(
        OptimizerConfig::default(),
        PricingSchedule::moroccan_onee(),
        view,
    );
    let stats = optimizer.view();
    let mut optimizer = AgentRuntime::spawn(optimizer, bus.clone(), &RuntimeConfig::default());
    optimizer.start().await.unwrap();

    let start = this_hour();
    for generation in 1..=3 {
        bus.emit(
            EcoEvent::DemandForecast(forecast(generation, start, 12, 22.0)),
            "weather",
        )
        .unwrap();
    }

    let decision = next_decision(&mut decisions).await;
    assert_eq!(decision.inputs.forecast, Generation(3));

    // Arrives after a newer one was processed.
    bus.emit(EcoEvent::DemandForecast(forecast(2, start, 12, 22.0)), "weather")
        .unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;

    let stats = stats.stats();
    assert_eq!(stats.runs, 1);
    assert_eq!(stats.stale_inputs_discarded, 1);
    assert_eq!(stats.last_generation, Some(decision.generation));
    assert!(decisions.try_recv().is_none());

    optimizer.stop().await.unwrap();
}

struct FlakyWeather {
    calls: AtomicU32,
}

#[async_trait]
impl WeatherFetcher for FlakyWeather {
    async fn fetch(&self) -> ecosmart_core::Result<WeatherReading> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(WeatherReading {
                observed_at: Utc::now(),
                temperature_c: 31.5,
                humidity_pct: 40.0,
                solar_potential: 0.8,
            })
        } else {
            Err(Error::weather("upstream returned 503"))
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_weather_failures_degrade_and_serve_stale() {
    let bus = EventBus::new();
    let (_h, mut health) = bus.receiver(Topic::Health);
    let fetcher = Arc::new(FlakyWeather {
        calls: AtomicU32::new(0),
    });
    let weather = WeatherAgent::new(
        WeatherConfig {
            refresh_interval_ms: 1_000,
            ..Default::default()
        },
        Utc.fix(),
        Some(fetcher.clone()),
    );
    let outputs = weather.view();
    let mut weather = AgentRuntime::spawn(weather, bus.clone(), &RuntimeConfig::default());
    weather.start().await.unwrap();

    loop {
        if let EcoEvent::HealthStatus(status) = &next_envelope(&mut health).await.event {
            if status.agent == "weather" && status.state == AgentState::Degraded {
                assert_eq!(status.consecutive_failures, 3);
                break;
            }
        }
    }
    assert!(fetcher.calls.load(Ordering::SeqCst) >= 4);

    let snapshot = outputs.snapshot().unwrap();
    assert!(snapshot.stale);
    assert_eq!(snapshot.source, WeatherSource::Live);
    assert_eq!(snapshot.temperature_c, 31.5);
    let forecast = outputs.forecast().unwrap();
    assert!(forecast.stale);
    assert_eq!(forecast.points.len(), 24);

    weather.stop().await.unwrap();
}

#[tokio::test]
async fn test_anomaly_threshold_is_exclusive() {
    let bus = EventBus::new();
    let (_a, mut anomalies) = bus.receiver(Topic::Anomaly);
    let (_writer, view) = registry(vec![washer()]).unwrap();
    let household = Arc::new(SimulatedHousehold::new(view.clone(), 5));
    let mut monitor = MonitorAgent::new(MonitorConfig::default(), view, household.clone());
    let stats = monitor.view();
    let ctx = AgentContext::detached("monitor", bus.clone());

    household.set_reading("washing_machine", 1000.0);
    for _ in 0..3 {
        monitor.tick(&ctx).await.unwrap();
    }
    // Exactly 20 % above the baseline is not an anomaly.
    household.set_reading("washing_machine", 1200.0);
    monitor.tick(&ctx).await.unwrap();
    assert_eq!(stats.stats().anomalies, 0);

    // Baseline is now 1050; 1500 is about 43 % above it.
    household.set_reading("washing_machine", 1500.0);
    monitor.tick(&ctx).await.unwrap();
    assert_eq!(stats.stats().anomalies, 1);

    let envelope = next_envelope(&mut anomalies).await;
    let EcoEvent::Anomaly(anomaly) = &envelope.event else {
        panic!("expected an anomaly");
    };
    assert_eq!(anomaly.device_id, "washing_machine");
    assert_eq!(anomaly.baseline_watts, 1050.0);
    assert_eq!(anomaly.severity, AnomalySeverity::Medium);
    assert!(anomalies.try_recv().is_none());
    assert_eq!(stats.consumption_summary().total_watts, 1500.0);
}

#[tokio::test]
async fn test_full_pipeline_never_touches_critical_devices() {
    let mut config = SystemConfig::default();
    config.monitor.poll_interval_ms = 50;
    config.weather.refresh_interval_ms = 100;
    config.optimizer.debounce_ms = 20;

    let bus = EventBus::new();
    let (_e, mut reports) = bus.receiver(Topic::Execution);
    let mut system = EcoSystem::simulated(&config, bus, 42).unwrap();
    system.start().await.unwrap();

    let report = loop {
        let report = next_report(&mut reports).await;
        if matches!(report.source, ReportSource::Decision { .. }) {
            break report;
        }
    };
    assert!(report.outcome_for("refrigerator").is_none());
    let decision = system.optimizer().latest_decision().unwrap();
    assert!(decision.action_for("refrigerator").is_none());
    assert_eq!(system.registry().is_on("refrigerator"), Some(true));
    assert!(system.monitor().stats().readings > 0);
    assert!(system.weather().snapshot().is_some());

    let request = OverrideRequest::new("refrigerator", false, Duration::from_secs(60));
    system.submit_override(request).unwrap();
    let report = loop {
        let report = next_report(&mut reports).await;
        if matches!(report.source, ReportSource::Override { .. }) {
            break report;
        }
    };
    assert_eq!(
        report.outcomes[0].reject_reason(),
        Some(&RejectReason::NotControllable)
    );
    assert_eq!(system.registry().is_on("refrigerator"), Some(true));

    system.stop().await.unwrap();
    assert!(system.health().iter().all(|h| h.state == AgentState::Stopped));
}
