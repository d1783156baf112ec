//! Active session recorder
//!
//! A running session owns two periodic tasks: a UI tick publishing elapsed time
//! and a sampler appending telemetry. Finishing stops both through one signal,
//! waits for them, and commits the final workout state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::SyncSettings;
use crate::db::{on_store, Author, SyncStore, WriteMeta};
use crate::error::{Error, Result};
use crate::models::{EntityKind, FieldMap, RecordId, TelemetryPoint};
use crate::util::now_millis;

use super::events::{ChangeSource, EventBus, SyncEvent};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TelemetryReading {
    pub heart_rate: Option<f64>,
    /// Cumulative distance so far
    pub distance_m: Option<f64>,
}

/// Sensor feed sampled while a session runs.
pub trait TelemetrySource: Send + Sync + 'static {
    fn sample(&self) -> TelemetryReading;
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct SamplerSummary {
    samples: usize,
    distance_m: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FinishedSession {
    pub workout_id: RecordId,
    pub duration: Duration,
    pub samples: usize,
    pub distance_m: Option<f64>,
}

pub struct SessionRecorder<S> {
    store: Arc<S>,
    events: EventBus,
    ui_tick: Duration,
    sample_interval: Duration,
}

impl<S: SyncStore> SessionRecorder<S> {
    pub fn new(store: Arc<S>, events: EventBus, settings: &SyncSettings) -> Self {
        Self {
            store,
            events,
            ui_tick: settings.ui_tick,
            sample_interval: settings.sample_interval,
        }
    }

    /// Mark the workout started and spawn the tick and sampler tasks.
    pub async fn start(
        &self,
        workout_id: RecordId,
        source: Arc<dyn TelemetrySource>,
    ) -> Result<ActiveSession<S>> {
        let started_at = now_millis();
        on_store(&self.store, move |store| {
            store.transaction(Author::Local, |tx| {
                if !tx.exists(EntityKind::Workout, workout_id)? {
                    return Err(Error::NotFound(workout_id.to_string()));
                }
                tx.upsert(
                    EntityKind::Workout,
                    workout_id,
                    &fields(json!({"started_at": started_at, "updated_at": started_at})),
                    WriteMeta::Pending,
                )
            })
        })
        .await?;

        let started = Instant::now();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (elapsed_tx, elapsed_rx) = watch::channel(Duration::ZERO);

        let ticker = tokio::spawn(run_ticker(self.ui_tick, started, elapsed_tx, stop_rx.clone()));
        let sampler = tokio::spawn(run_sampler(
            Arc::clone(&self.store),
            self.sample_interval,
            workout_id,
            started,
            source,
            stop_rx,
        ));

        tracing::info!(%workout_id, "session started");
        Ok(ActiveSession {
            workout_id,
            started,
            stop: stop_tx,
            elapsed: elapsed_rx,
            ticker,
            sampler,
            store: Arc::clone(&self.store),
            events: self.events.clone(),
        })
    }
}

/// A running session. Dropping it without `finish` closes the stop channel, which
/// ends both tasks, but records nothing.
pub struct ActiveSession<S> {
    workout_id: RecordId,
    started: Instant,
    stop: watch::Sender<bool>,
    elapsed: watch::Receiver<Duration>,
    ticker: JoinHandle<()>,
    sampler: JoinHandle<SamplerSummary>,
    store: Arc<S>,
    events: EventBus,
}

impl<S: SyncStore> ActiveSession<S> {
    pub const fn workout_id(&self) -> RecordId {
        self.workout_id
    }

    /// Elapsed time as last published by the UI tick.
    pub fn elapsed(&self) -> watch::Receiver<Duration> {
        self.elapsed.clone()
    }

    /// Stop both tasks, then commit the final workout state.
    ///
    /// Returns only after the final write is committed. A failed task loses its
    /// samples but never the final state. Fails with `NotFound` if the workout
    /// was deleted while the session ran.
    pub async fn finish(self) -> Result<FinishedSession> {
        let workout_id = self.workout_id;
        let _ = self.stop.send(true);
        if let Err(error) = self.ticker.await {
            tracing::warn!(%workout_id, %error, "session tick task failed");
        }
        let summary = self.sampler.await.unwrap_or_else(|error| {
            tracing::warn!(%workout_id, %error, "session sampler failed, telemetry incomplete");
            SamplerSummary::default()
        });

        let duration = self.started.elapsed();
        let ended_at = now_millis();
        let mut update = fields(json!({
            "ended_at": ended_at,
            "duration_ms": duration_ms(duration),
            "is_completed": true,
            "updated_at": ended_at,
        }));
        if let Some(distance) = summary.distance_m {
            update.insert("distance_m".into(), json!(distance));
        }

        on_store(&self.store, move |store| {
            store.transaction(Author::Local, |tx| {
                if !tx.exists(EntityKind::Workout, workout_id)? {
                    return Err(Error::NotFound(workout_id.to_string()));
                }
                tx.upsert(EntityKind::Workout, workout_id, &update, WriteMeta::Pending)
            })
        })
        .await?;

        tracing::info!(
            %workout_id,
            duration_ms = duration_ms(duration),
            samples = summary.samples,
            "session finished"
        );
        self.events.publish(SyncEvent::RecordsChanged {
            source: ChangeSource::Local,
            roots: vec![(EntityKind::Workout, workout_id)],
        });

        Ok(FinishedSession {
            workout_id,
            duration,
            samples: summary.samples,
            distance_m: summary.distance_m,
        })
    }
}

async fn run_ticker(
    period: Duration,
    started: Instant,
    elapsed: watch::Sender<Duration>,
    mut stop: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = interval.tick() => {
                let _ = elapsed.send(started.elapsed());
            }
        }
    }
}

async fn run_sampler<S: SyncStore>(
    store: Arc<S>,
    period: Duration,
    workout_id: RecordId,
    started: Instant,
    source: Arc<dyn TelemetrySource>,
    mut stop: watch::Receiver<bool>,
) -> SamplerSummary {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut summary = SamplerSummary::default();
    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            _ = interval.tick() => {
                let reading = source.sample();
                let point = TelemetryPoint {
                    workout_id,
                    recorded_at: now_millis(),
                    elapsed_ms: duration_ms(started.elapsed()),
                    heart_rate: reading.heart_rate,
                    distance_m: reading.distance_m,
                };
                let stored = on_store(&store, move |store| {
                    store.transaction(Author::Local, |tx| tx.append_telemetry(&point))
                })
                .await;
                match stored {
                    Ok(()) => summary.samples += 1,
                    Err(error) => tracing::warn!(%workout_id, %error, "dropping telemetry sample"),
                }
                if reading.distance_m.is_some() {
                    summary.distance_m = reading.distance_m;
                }
            }
        }
    }
    summary
}

fn fields(value: serde_json::Value) -> FieldMap {
    match value {
        serde_json::Value::Object(map) => map,
        _ => FieldMap::new(),
    }
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
