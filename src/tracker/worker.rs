use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{CameraSettings, CameraTracker};
use crate::detect::CameraInput;
use crate::interaction::validate_name;
use crate::publish::{EventQueue, InteractionEvent};

/// Thread owning one camera shard.
///
/// Ticks on every input it receives and sweeps every `refresh` while the
/// feed is quiet. Stops once its sender is dropped.
pub struct CameraWorker {
    camera: String,
    tx: Sender<CameraInput>,
    join: JoinHandle<()>,
}

impl CameraWorker {
    pub fn spawn(settings: &CameraSettings, queue: EventQueue) -> Result<Self> {
        let tracker = CameraTracker::new(settings);
        let refresh = settings.refresh;
        let (tx, rx) = mpsc::channel();
        let join = std::thread::Builder::new()
            .name(format!("camera-{}", settings.name))
            .spawn(move || run_worker(rx, tracker, refresh, queue))
            .with_context(|| format!("spawn worker for camera {}", settings.name))?;
        log::info!(
            "{}: worker started ({} interactions, refresh {:?})",
            settings.name,
            settings.interactions.len(),
            refresh
        );
        Ok(Self {
            camera: settings.name.clone(),
            tx,
            join,
        })
    }

    pub fn camera(&self) -> &str {
        &self.camera
    }

    pub fn send(&self, input: CameraInput) -> Result<()> {
        self.tx
            .send(input)
            .map_err(|_| anyhow!("worker for camera {} has stopped", self.camera))
    }

    /// Close the input channel and wait for pending inputs to be processed.
    pub fn stop(self) -> Result<()> {
        let Self { camera, tx, join } = self;
        drop(tx);
        join.join()
            .map_err(|_| anyhow!("worker for camera {} panicked", camera))
    }
}

fn run_worker(
    rx: Receiver<CameraInput>,
    mut tracker: CameraTracker,
    refresh: Duration,
    queue: EventQueue,
) {
    let mut next_sweep = Instant::now() + refresh;
    loop {
        let wait = next_sweep.saturating_duration_since(Instant::now());
        match rx.recv_timeout(wait) {
            Ok(input) => {
                let now = crate::now_s();
                if tracker.ingest(input, now) {
                    emit(&queue, tracker.tick(now));
                    next_sweep = Instant::now() + refresh;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        // Rejected input must not postpone the sweep.
        if Instant::now() >= next_sweep {
            emit(&queue, tracker.tick(crate::now_s()));
            next_sweep = Instant::now() + refresh;
        }
    }
    log::info!("{}: worker stopped", tracker.camera());
}

fn emit(queue: &EventQueue, events: Vec<InteractionEvent>) {
    for event in events {
        let key = event.key();
        let state = event.state;
        if let Err(e) = queue.enqueue(event) {
            log::warn!("dropping {} {}: {}", key, state, e);
        }
    }
}

/// Dispatches inputs to per-camera workers.
///
/// Cameras missing from the configuration get a worker on first input when
/// a fallback template is set; otherwise their input is dropped.
pub struct CameraRouter {
    workers: HashMap<String, CameraWorker>,
    fallback: Option<CameraSettings>,
    queue: EventQueue,
    refused: HashMap<String, u64>,
}

impl CameraRouter {
    pub fn new(
        cameras: &[CameraSettings],
        fallback: Option<CameraSettings>,
        queue: EventQueue,
    ) -> Result<Self> {
        let mut workers = HashMap::new();
        for settings in cameras {
            workers.insert(
                settings.name.clone(),
                CameraWorker::spawn(settings, queue.clone())?,
            );
        }
        Ok(Self {
            workers,
            fallback,
            queue,
            refused: HashMap::new(),
        })
    }

    pub fn cameras(&self) -> impl Iterator<Item = &str> {
        self.workers.keys().map(String::as_str)
    }

    /// Hand input to its camera's worker, spawning one if allowed.
    ///
    /// Returns Ok(false) when the input was dropped for an unknown camera.
    pub fn route(&mut self, input: CameraInput) -> Result<bool> {
        let camera = input.camera().to_string();
        if !self.workers.contains_key(&camera) {
            let Some(template) = self.fallback.as_ref() else {
                let count = self.refused.entry(camera.clone()).or_insert(0);
                *count += 1;
                if *count == 1 {
                    log::warn!("ignoring detections for unconfigured camera {}", camera);
                }
                return Ok(false);
            };
            if let Err(e) = validate_name("camera", &camera) {
                log::warn!("ignoring detections: {}", e);
                return Ok(false);
            }
            let worker = CameraWorker::spawn(&template.renamed(&camera), self.queue.clone())?;
            log::info!("{}: discovered camera", camera);
            self.workers.insert(camera.clone(), worker);
        }
        match self.workers.get(&camera) {
            Some(worker) => worker.send(input).map(|_| true),
            None => Ok(false),
        }
    }

    /// Stop every worker after it drains its queue.
    pub fn shutdown(self) -> Result<()> {
        let mut failed = Vec::new();
        for (camera, worker) in self.workers {
            if let Err(e) = worker.stop() {
                log::error!("{}: {}", camera, e);
                failed.push(camera);
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("camera workers failed: {}", failed.join(", ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{Detection, DetectionBatch};
    use crate::geometry::BoundingBox;
    use crate::interaction::InteractionDefinition;
    use crate::publish::{EventPublisher, EventSink, EventState, PublishPolicy};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<InteractionEvent>>>,
    }

    impl EventSink for Recorder {
        fn publish(&mut self, event: &InteractionEvent) -> Result<()> {
            self.events
                .lock()
                .map_err(|_| anyhow!("recorder poisoned"))?
                .push(event.clone());
            Ok(())
        }
    }

    fn settings(name: &str) -> CameraSettings {
        let def = InteractionDefinition::new("cat_on_couch", ["cat"], ["couch"], 0.3, 0.0, 0.2)
            .expect("definition");
        let mut settings = CameraSettings::new(name, vec![Arc::new(def)]);
        settings.refresh = Duration::from_millis(20);
        settings
    }

    fn cat_on_couch() -> Vec<Detection> {
        vec![
            Detection::new("cat", BoundingBox::new(10.0, 10.0, 10.0, 10.0)),
            Detection::new("couch", BoundingBox::new(0.0, 0.0, 100.0, 40.0)),
        ]
    }

    fn batch(camera: &str, timestamp: Option<f64>, detections: Vec<Detection>) -> CameraInput {
        CameraInput::Batch(DetectionBatch {
            camera: camera.to_string(),
            timestamp,
            detections,
        })
    }

    fn overlapping(camera: &str) -> CameraInput {
        batch(camera, None, cat_on_couch())
    }

    fn wait_for(recorder: &Recorder, count: usize) -> Vec<InteractionEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let events = recorder.events.lock().expect("lock").clone();
            if events.len() >= count || Instant::now() > deadline {
                return events;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn sweep_ends_interaction_after_feed_goes_quiet() {
        let recorder = Recorder::default();
        let publisher =
            EventPublisher::spawn(recorder.clone(), PublishPolicy::default()).expect("publisher");
        let worker = CameraWorker::spawn(&settings("porch"), publisher.queue()).expect("worker");

        worker.send(overlapping("porch")).expect("send");
        worker.send(overlapping("porch")).expect("send");

        // No further input: only the periodic sweep can produce the OFF.
        let events = wait_for(&recorder, 2);
        worker.stop().expect("stop");
        publisher.shutdown().expect("shutdown");

        let states: Vec<_> = events.iter().map(|e| e.state).collect();
        assert_eq!(states, vec![EventState::On, EventState::Off]);
        assert!(events[1].timestamp - events[0].timestamp > 0.2);
    }

    #[test]
    fn rejected_batches_do_not_hold_off_the_sweep() {
        let recorder = Recorder::default();
        let publisher =
            EventPublisher::spawn(recorder.clone(), PublishPolicy::default()).expect("publisher");
        let worker = CameraWorker::spawn(&settings("porch"), publisher.queue()).expect("worker");

        worker.send(batch("porch", Some(100.0), cat_on_couch())).expect("send");
        worker.send(batch("porch", Some(100.0), cat_on_couch())).expect("send");

        // The producer clock jumped back: every later batch is out of order.
        let until = Instant::now() + Duration::from_millis(1500);
        while Instant::now() < until {
            worker.send(batch("porch", Some(1.0), Vec::new())).expect("send");
            std::thread::sleep(Duration::from_millis(10));
        }

        let events = wait_for(&recorder, 2);
        worker.stop().expect("stop");
        publisher.shutdown().expect("shutdown");

        let states: Vec<_> = events.iter().map(|e| e.state).collect();
        assert_eq!(states, vec![EventState::On, EventState::Off]);
    }

    #[test]
    fn router_spawns_fallback_workers_lazily() {
        let recorder = Recorder::default();
        let publisher =
            EventPublisher::spawn(recorder.clone(), PublishPolicy::default()).expect("publisher");
        let mut router =
            CameraRouter::new(&[], Some(settings("template")), publisher.queue()).expect("router");

        assert!(router.route(overlapping("garage")).expect("route"));
        assert!(!router.route(overlapping("bad/name")).expect("route"));
        assert_eq!(router.cameras().collect::<Vec<_>>(), vec!["garage"]);

        router.shutdown().expect("shutdown");
        publisher.shutdown().expect("shutdown");
    }

    #[test]
    fn router_without_fallback_drops_unknown_cameras() {
        let publisher =
            EventPublisher::spawn(Recorder::default(), PublishPolicy::default()).expect("publisher");
        let mut router =
            CameraRouter::new(&[settings("porch")], None, publisher.queue()).expect("router");

        assert!(router.route(overlapping("porch")).expect("route"));
        assert!(!router.route(overlapping("garage")).expect("route"));

        router.shutdown().expect("shutdown");
        publisher.shutdown().expect("shutdown");
    }
}
