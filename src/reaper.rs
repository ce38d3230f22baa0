use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::observability;

/// Background task that drives the time-based completion rules.
pub async fn run_completion_sweep(engine: Arc<Engine>, every: Duration) {
    // interval() panics on a zero period.
    let mut interval = tokio::time::interval(every.max(Duration::from_secs(1)));
    loop {
        interval.tick().await;
        sweep_once(&engine).await;
    }
}

/// One pass over every appointment with due work. Returns how many signals
/// fired.
pub async fn sweep_once(engine: &Engine) -> usize {
    let started = Instant::now();
    let mut fired = 0;
    for id in engine.sweep_candidates() {
        match engine.timeout_check(id).await {
            Ok(signals) => fired += signals.len(),
            // Cancelled or deleted between the scan and the lock.
            Err(e) => debug!("sweep skip {id}: {e}"),
        }
    }
    metrics::histogram!(observability::SWEEP_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if fired > 0 {
        info!(business = engine.business_id(), signals = fired, "completion sweep");
    }
    fired
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    if engine.wal_appends_since_compact().await < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => true,
        Err(e) => {
            warn!(business = engine.business_id(), "WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineConfig, ManualClock, NewAppointment};
    use crate::model::*;
    use crate::notify::NotifyHub;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("appointd_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    const START: Ms = 1_772_445_600_000; // 2026-03-02 10:00 UTC

    async fn engine_with_booking(name: &str) -> (Engine, Arc<ManualClock>, Ulid) {
        let clock = Arc::new(ManualClock::new(START - HOUR));
        let engine = Engine::new(
            "salon",
            test_wal_path(name),
            Arc::new(NotifyHub::new()),
            EngineConfig::default(),
        )
        .unwrap()
        .with_clock(clock.clone());

        let staff = Ulid::new();
        let service = Ulid::new();
        engine.register_staff(staff, None).await.unwrap();
        engine
            .define_service(ServiceDefinition {
                id: service,
                name: None,
                duration: HOUR,
                prep_minutes: 0,
                cleanup_minutes: 0,
                price: 3000,
                deposit: 0,
                active: true,
            })
            .await
            .unwrap();
        let request = NewAppointment::single(Ulid::new(), Ulid::new(), staff, service, Span::new(START, START + HOUR));
        let appointment = engine.create_appointment(request, None).await.unwrap();
        engine.confirm_appointment(appointment.id, None).await.unwrap();
        (engine, clock, appointment.id)
    }

    #[tokio::test]
    async fn sweep_fires_completion_due_once() {
        let (engine, clock, id) = engine_with_booking("sweep_once.wal").await;
        assert_eq!(sweep_once(&engine).await, 0);

        clock.set(START + HOUR + 20 * MINUTE);
        assert_eq!(sweep_once(&engine).await, 1);
        assert_eq!(sweep_once(&engine).await, 0);
        assert!(engine.get_completion(id).unwrap().completion_due_sent_at.is_some());
    }

    #[tokio::test]
    async fn sweep_skips_cancelled() {
        let (engine, clock, id) = engine_with_booking("sweep_cancelled.wal").await;
        engine.cancel_appointment(id, "shop closed", None).await.unwrap();
        clock.set(START + DAY);
        assert_eq!(sweep_once(&engine).await, 0);
    }

    #[tokio::test]
    async fn compactor_respects_threshold() {
        let (engine, _, _) = engine_with_booking("compactor.wal").await;
        let appends = engine.wal_appends_since_compact().await;
        assert!(appends > 0);
        assert!(!compact_if_due(&engine, appends + 1).await);
        assert!(compact_if_due(&engine, appends).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }
}
