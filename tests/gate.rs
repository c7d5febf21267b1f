mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{RecordingSink, alarm_labels};
use soundgate::{
    ClassificationEvent, DecisionKind, DedupState, DetectionGate, Error, SinkSlot, Thresholds,
};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn gate_with_threshold(device_threshold: f32) -> DetectionGate {
    let thresholds = Thresholds::default();
    thresholds
        .set_device_threshold(device_threshold)
        .expect("valid threshold");
    DetectionGate::new(alarm_labels(), Arc::new(thresholds))
}

fn connected() -> (SinkSlot, RecordingSink) {
    let sink = RecordingSink::default();
    (SinkSlot::with_sink(Box::new(sink.clone())), sink)
}

fn event(scores: &[f32]) -> ClassificationEvent {
    ClassificationEvent::new(scores.to_vec())
}

#[tokio::test]
async fn confident_alarm_is_sent_and_recorded() -> anyhow::Result<()> {
    let gate = gate_with_threshold(0.6);
    let (slot, sink) = connected();
    let t = Instant::now();

    let d = gate.evaluate(&event(&[0.1, 0.9]), t, &slot).await?;
    assert_eq!(d.kind, DecisionKind::Sent);
    assert_eq!(d.label, "Alarm");
    assert_eq!(d.confidence, 0.9);
    assert_eq!(sink.sent(), ["Alarm"]);
    assert_eq!(
        gate.dedup_snapshot().await,
        DedupState {
            last_sent_command: Some("Alarm".to_owned()),
            last_sent_at: Some(t),
        }
    );
    Ok(())
}

#[tokio::test]
async fn repeat_inside_window_is_suppressed_and_after_window_is_sent() -> anyhow::Result<()> {
    let gate = gate_with_threshold(0.6);
    let (slot, sink) = connected();
    let t = Instant::now();

    assert_eq!(gate.evaluate(&event(&[0.1, 0.9]), t, &slot).await?.kind, DecisionKind::Sent);

    let d = gate.evaluate(&event(&[0.1, 0.9]), t + ms(1000), &slot).await?;
    assert_eq!(d.kind, DecisionKind::Suppressed);
    assert_eq!(gate.dedup_snapshot().await.last_sent_at, Some(t));

    let d = gate.evaluate(&event(&[0.1, 0.9]), t + ms(3500), &slot).await?;
    assert_eq!(d.kind, DecisionKind::Sent);
    assert_eq!(sink.sent(), ["Alarm", "Alarm"]);
    assert_eq!(gate.dedup_snapshot().await.last_sent_at, Some(t + ms(3500)));
    Ok(())
}

#[tokio::test]
async fn window_boundary_is_exactly_three_seconds() -> anyhow::Result<()> {
    let gate = gate_with_threshold(0.6);
    let (slot, _sink) = connected();
    let t = Instant::now();

    gate.evaluate(&event(&[0.1, 0.9]), t, &slot).await?;
    let d = gate.evaluate(&event(&[0.1, 0.9]), t + ms(2999), &slot).await?;
    assert_eq!(d.kind, DecisionKind::Suppressed);
    let d = gate.evaluate(&event(&[0.1, 0.9]), t + ms(3000), &slot).await?;
    assert_eq!(d.kind, DecisionKind::Sent);
    Ok(())
}

#[tokio::test]
async fn dominant_background_is_never_sent() -> anyhow::Result<()> {
    let gate = gate_with_threshold(0.0);
    let (slot, sink) = connected();

    let d = gate.evaluate(&event(&[0.95, 0.05]), Instant::now(), &slot).await?;
    assert_eq!(d.kind, DecisionKind::BackgroundSuppressed);
    assert_eq!(d.label, "Background Noise");
    assert!(sink.sent().is_empty());
    Ok(())
}

#[tokio::test]
async fn under_device_threshold_is_below_threshold() -> anyhow::Result<()> {
    let gate = DetectionGate::new(
        soundgate::Labels::new(["Alarm", "Background Noise"], "Background Noise")?,
        Arc::new(Thresholds::default()),
    );
    gate.thresholds().set_device_threshold(0.9)?;
    let (slot, sink) = connected();

    let d = gate.evaluate(&event(&[0.85, 0.15]), Instant::now(), &slot).await?;
    assert_eq!(d.kind, DecisionKind::BelowThreshold);
    assert_eq!(d.label, "Alarm");
    assert!(sink.sent().is_empty());
    Ok(())
}

#[tokio::test]
async fn floor_wins_even_with_a_zero_device_threshold() -> anyhow::Result<()> {
    let gate = gate_with_threshold(0.0);
    let (slot, sink) = connected();

    for scores in [[0.0f32, 0.19], [0.1, 0.1], [0.05, 0.15]] {
        let d = gate.evaluate(&event(&scores), Instant::now(), &slot).await?;
        assert_eq!(d.kind, DecisionKind::Inconclusive, "scores {scores:?}");
    }
    assert!(sink.sent().is_empty());

    // Exactly at the floor is no longer inconclusive.
    let d = gate.evaluate(&event(&[0.0, 0.2]), Instant::now(), &slot).await?;
    assert_eq!(d.kind, DecisionKind::Sent);
    Ok(())
}

#[tokio::test]
async fn threshold_changes_apply_to_the_next_event() -> anyhow::Result<()> {
    let gate = gate_with_threshold(0.6);
    let (slot, _sink) = connected();
    let t = Instant::now();

    gate.thresholds().set_device_threshold(0.95)?;
    let d = gate.evaluate(&event(&[0.1, 0.9]), t, &slot).await?;
    assert_eq!(d.kind, DecisionKind::BelowThreshold);

    gate.thresholds().set_device_threshold(0.5)?;
    let d = gate.evaluate(&event(&[0.1, 0.9]), t, &slot).await?;
    assert_eq!(d.kind, DecisionKind::Sent);
    Ok(())
}

#[tokio::test]
async fn failed_send_does_not_count_toward_dedup() -> anyhow::Result<()> {
    let gate = gate_with_threshold(0.6);
    let (slot, sink) = connected();
    let t = Instant::now();

    sink.set_failing(true);
    let d = gate.evaluate(&event(&[0.1, 0.9]), t, &slot).await?;
    assert_eq!(d.kind, DecisionKind::SendFailed);
    assert!(d.error.as_deref().is_some_and(|e| e.contains("device unplugged")));
    assert_eq!(gate.dedup_snapshot().await, DedupState::default());

    // A retry inside what would have been the window is attempted again.
    sink.set_failing(false);
    let d = gate.evaluate(&event(&[0.1, 0.9]), t + ms(500), &slot).await?;
    assert_eq!(d.kind, DecisionKind::Sent);
    assert_eq!(sink.sent(), ["Alarm"]);
    Ok(())
}

#[tokio::test]
async fn disconnected_slot_fails_immediately() -> anyhow::Result<()> {
    let gate = gate_with_threshold(0.6);
    let slot = SinkSlot::new();

    let d = gate.evaluate(&event(&[0.1, 0.9]), Instant::now(), &slot).await?;
    assert_eq!(d.kind, DecisionKind::SendFailed);
    assert_eq!(gate.dedup_snapshot().await, DedupState::default());
    Ok(())
}

#[tokio::test]
async fn different_labels_are_not_deduplicated() -> anyhow::Result<()> {
    let labels = soundgate::Labels::new(
        ["Background Noise", "Alarm", "Doorbell"],
        "Background Noise",
    )?;
    let gate = DetectionGate::new(labels, Arc::new(Thresholds::default()));
    let (slot, sink) = connected();
    let t = Instant::now();

    gate.evaluate(&event(&[0.0, 0.9, 0.1]), t, &slot).await?;
    gate.evaluate(&event(&[0.0, 0.1, 0.9]), t + ms(100), &slot).await?;
    // Alarm again: the last sent command is now Doorbell, so it goes out.
    gate.evaluate(&event(&[0.0, 0.9, 0.1]), t + ms(200), &slot).await?;
    assert_eq!(sink.sent(), ["Alarm", "Doorbell", "Alarm"]);
    Ok(())
}

#[tokio::test]
async fn manual_commands_share_the_duplicate_window() -> anyhow::Result<()> {
    let gate = gate_with_threshold(0.6);
    let (slot, sink) = connected();
    let t = Instant::now();

    let d = gate.dispatch_manual("Alarm", t, &slot).await;
    assert_eq!(d.kind, DecisionKind::Sent);
    assert_eq!(d.confidence, 1.0);

    let d = gate.evaluate(&event(&[0.1, 0.9]), t + ms(10), &slot).await?;
    assert_eq!(d.kind, DecisionKind::Suppressed);

    let d = gate.dispatch_manual("Alarm", t + ms(20), &slot).await;
    assert_eq!(d.kind, DecisionKind::Suppressed);
    assert_eq!(sink.sent(), ["Alarm"]);
    Ok(())
}

#[tokio::test]
async fn score_count_mismatch_is_surfaced_to_the_caller() {
    let gate = gate_with_threshold(0.6);
    let (slot, sink) = connected();

    let err = gate
        .evaluate(&event(&[0.1, 0.2, 0.7]), Instant::now(), &slot)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::ContractViolation {
            expected: 2,
            actual: 3
        }
    ));
    assert!(sink.sent().is_empty());
}

#[tokio::test]
async fn concurrent_evaluations_send_a_label_once() -> anyhow::Result<()> {
    let gate = Arc::new(gate_with_threshold(0.6));
    let (slot, sink) = connected();
    let slot = Arc::new(slot);
    let t = Instant::now();

    let mut handles = Vec::new();
    for i in 0..8 {
        let gate = Arc::clone(&gate);
        let slot = Arc::clone(&slot);
        handles.push(tokio::spawn(async move {
            gate.evaluate(&event(&[0.1, 0.9]), t + ms(i), &slot).await
        }));
    }

    let mut sent = 0;
    for handle in handles {
        if handle.await??.kind == DecisionKind::Sent {
            sent += 1;
        }
    }
    assert_eq!(sent, 1);
    assert_eq!(sink.sent(), ["Alarm"]);
    Ok(())
}

#[tokio::test]
async fn send_dropped_mid_flight_leaves_the_gate_usable() -> anyhow::Result<()> {
    let gate = gate_with_threshold(0.6);
    let (slot, sink) = connected();
    let t = Instant::now();

    sink.stall_next_send();
    let abandoned =
        tokio::time::timeout(ms(50), gate.evaluate(&event(&[0.1, 0.9]), t, &slot)).await;
    assert!(abandoned.is_err());
    assert_eq!(gate.dedup_snapshot().await, DedupState::default());
    assert!(slot.is_connected());

    let d = gate.evaluate(&event(&[0.1, 0.9]), t + ms(100), &slot).await?;
    assert_eq!(d.kind, DecisionKind::Sent);
    assert_eq!(sink.sent(), ["Alarm"]);

    let manual = gate.dispatch_manual("Doorbell", t + ms(200), &slot).await;
    assert_eq!(manual.kind, DecisionKind::Sent);
    Ok(())
}
