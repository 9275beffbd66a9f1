//! The event correlator. Owns the `prompt_id -> PromptState` registry and the
//! single `current` pointer, and runs the one cooperative task that is the
//! sole mutator of both.
//!
//! Binary image frames carry no `prompt_id`; correlation is positional via
//! `current`, so all mutation after Subscribe happens on this single task —
//! see module docs on [`Tracker::run`].

use crate::notifier::{Notifier, WebhookPayload};
use bytes::Bytes;
use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("prompt ID {prompt_id} is already being tracked"))]
    AlreadyTracked { prompt_id: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// A lifecycle event from the engine, already translated from wire frames
/// by the engine client.
#[derive(Debug, Clone)]
pub enum Event {
    ExecutionStart { prompt_id: String },
    ExecutionFinished { prompt_id: String },
    ImageReceived { bytes: Bytes },
    Heartbeat { prompt_id: Option<String> },
}

/// The terminal outcome of one tracked prompt.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub success: bool,
    pub images: Vec<Bytes>,
    pub error: Option<String>,
}

impl GenerationOutcome {
    fn success(images: Vec<Bytes>) -> Self {
        Self {
            success: true,
            images,
            error: None,
        }
    }

    fn failure(error: String) -> Self {
        Self {
            success: false,
            images: Vec::new(),
            error: Some(error),
        }
    }
}

/// Why a prompt's tracking ended, used to build the failure diagnostic and
/// to decide whether to keep tracking `current`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FinalizeReason {
    /// A handler observed the completion predicate become true.
    Completed,
    TrackerTimeout,
    SupersededByNewPrompt,
    ShutdownDuringPrompt,
    /// The engine event channel closed (engine reader died).
    IncompleteImages,
}

impl std::fmt::Display for FinalizeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FinalizeReason::Completed => "Completed",
            FinalizeReason::TrackerTimeout => "TrackerTimeout",
            FinalizeReason::SupersededByNewPrompt => "SupersededByNewPrompt",
            FinalizeReason::ShutdownDuringPrompt => "ShutdownDuringPrompt",
            FinalizeReason::IncompleteImages => "IncompleteImages",
        };
        f.write_str(label)
    }
}

struct PromptState {
    images_expected: usize,
    images_received: Vec<Bytes>,
    execution_finished: bool,
    webhook_url: Option<String>,
    result_tx: Option<oneshot::Sender<GenerationOutcome>>,
}

impl PromptState {
    fn is_complete(&self) -> bool {
        self.execution_finished && self.images_received.len() == self.images_expected
    }
}

/// Correlates an interleaved stream of engine events to outstanding prompts.
///
/// Cheap to clone: the registry is behind an `Arc<Mutex<_>>` so that
/// [`Tracker::subscribe`] (called from request tasks) and [`Tracker::run`]
/// (the single event loop) can share it. Only `run` ever mutates a
/// [`PromptState`] after it has been inserted by `subscribe`.
#[derive(Clone)]
pub struct Tracker {
    registry: Arc<Mutex<HashMap<String, PromptState>>>,
    notifier: Arc<dyn Notifier>,
    idle_timeout: Duration,
}

impl Tracker {
    #[must_use]
    pub fn new(notifier: Arc<dyn Notifier>, idle_timeout: Duration) -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            notifier,
            idle_timeout,
        }
    }

    /// Register a new prompt for tracking and return the receiving end of
    /// its single-slot result rendezvous.
    ///
    /// # Errors
    /// Returns [`Error::AlreadyTracked`] if `prompt_id` is already registered;
    /// the registry is left unchanged.
    pub fn subscribe(
        &self,
        prompt_id: impl Into<String>,
        images_expected: usize,
        webhook_url: Option<String>,
    ) -> Result<oneshot::Receiver<GenerationOutcome>> {
        let prompt_id = prompt_id.into();
        let mut registry = self.lock_registry();

        ensure!(
            !registry.contains_key(&prompt_id),
            AlreadyTrackedSnafu {
                prompt_id: prompt_id.clone()
            }
        );

        let (result_tx, result_rx) = oneshot::channel();
        registry.insert(
            prompt_id,
            PromptState {
                images_expected,
                images_received: Vec::new(),
                execution_finished: false,
                webhook_url,
                result_tx: Some(result_tx),
            },
        );

        Ok(result_rx)
    }

    /// Drive the event-processing loop to completion. Consumes `self`
    /// because there is exactly one tracker loop per process.
    ///
    /// Terminates when `events` closes (engine reader died) or `shutdown`
    /// fires; in both cases the current prompt, if any, is finalized as a
    /// failure before returning.
    pub async fn run(self, mut events: mpsc::Receiver<Event>, mut shutdown: oneshot::Receiver<()>) {
        tracing::info!("tracker event loop started");
        let mut current: Option<String> = None;

        loop {
            let idle_active = current.is_some();
            let idle_timeout = self.idle_timeout;
            let idle = async move {
                if idle_active {
                    tokio::time::sleep(idle_timeout).await;
                } else {
                    std::future::pending::<()>().await;
                }
            };

            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    tracing::info!("tracker shutting down");
                    self.finalize_current(&mut current, FinalizeReason::ShutdownDuringPrompt).await;
                    return;
                }

                maybe_event = events.recv() => {
                    match maybe_event {
                        Some(event) => self.process_event(&mut current, event).await,
                        None => {
                            tracing::info!("tracker event channel closed");
                            self.finalize_current(&mut current, FinalizeReason::IncompleteImages).await;
                            return;
                        }
                    }
                }

                () = idle => {
                    tracing::warn!("tracker idle timeout; finalizing current prompt");
                    self.finalize_current(&mut current, FinalizeReason::TrackerTimeout).await;
                }
            }
        }
    }

    async fn process_event(&self, current: &mut Option<String>, event: Event) {
        match event {
            Event::ExecutionStart { prompt_id } => {
                self.finalize_current(current, FinalizeReason::SupersededByNewPrompt)
                    .await;

                let tracked = self.lock_registry().contains_key(&prompt_id);
                if tracked {
                    tracing::debug!(prompt_id = %prompt_id, "tracking started for new prompt");
                    *current = Some(prompt_id);
                } else {
                    tracing::warn!(prompt_id = %prompt_id, "execution_start for untracked prompt ID; ignored");
                }
            }

            Event::ImageReceived { bytes } => {
                let Some(prompt_id) = current.clone() else {
                    tracing::warn!("received binary data with no active prompt; dropped");
                    return;
                };

                let complete = {
                    let mut registry = self.lock_registry();
                    match registry.get_mut(&prompt_id) {
                        Some(state) => {
                            state.images_received.push(bytes);
                            state.is_complete()
                        }
                        None => {
                            tracing::warn!(prompt_id = %prompt_id, "image for no-longer-tracked prompt; dropped");
                            false
                        }
                    }
                };

                if complete {
                    self.finalize(current, &prompt_id, FinalizeReason::Completed)
                        .await;
                }
            }

            Event::ExecutionFinished { prompt_id: _ } => {
                let Some(prompt_id) = current.clone() else {
                    tracing::warn!("received finished event with no active prompt; dropped");
                    return;
                };

                let complete = {
                    let mut registry = self.lock_registry();
                    match registry.get_mut(&prompt_id) {
                        Some(state) => {
                            state.execution_finished = true;
                            state.is_complete()
                        }
                        None => false,
                    }
                };

                if complete {
                    self.finalize(current, &prompt_id, FinalizeReason::Completed)
                        .await;
                }
            }

            Event::Heartbeat { .. } => {
                // No state change; the idle timer is reset simply by having
                // received an event, handled by the loop in `run`.
            }
        }
    }

    /// Finalize `current`, if set, for a forced reason (supersession, timeout,
    /// shutdown, or channel closure). No-op if nothing is currently active.
    async fn finalize_current(&self, current: &mut Option<String>, reason: FinalizeReason) {
        if let Some(prompt_id) = current.clone() {
            self.finalize(current, &prompt_id, reason).await;
        }
    }

    /// Atomically finalize one prompt: compute the outcome, send it to the
    /// waiter, remove the registry entry, fire the webhook, and clear
    /// `current` if it still points at this prompt.
    async fn finalize(&self, current: &mut Option<String>, prompt_id: &str, reason: FinalizeReason) {
        let state = self.lock_registry().remove(prompt_id);

        let Some(mut state) = state else {
            // Already finalized (e.g. a duplicate finalize request); ignore.
            return;
        };

        let outcome = Self::compute_outcome(&state, reason);

        if let Some(tx) = state.result_tx.take() {
            // The receiver may have been dropped (caller disconnected); a
            // failed send is not an error here, only a discarded value.
            let _ = tx.send(outcome.clone());
        }

        if outcome.success {
            tracing::info!(prompt_id, "prompt finished successfully");
        } else {
            tracing::warn!(prompt_id, error = outcome.error.as_deref().unwrap_or(""), "prompt failed");
        }

        if let Some(webhook_url) = state.webhook_url.take() {
            self.notifier
                .notify(webhook_url, Self::to_webhook_payload(prompt_id, &outcome));
        }

        if current.as_deref() == Some(prompt_id) {
            *current = None;
        }
    }

    fn compute_outcome(state: &PromptState, reason: FinalizeReason) -> GenerationOutcome {
        if state.is_complete() {
            return GenerationOutcome::success(state.images_received.clone());
        }

        GenerationOutcome::failure(format!(
            "{reason}: expected {} image(s), got {} (execution_finished={})",
            state.images_expected,
            state.images_received.len(),
            state.execution_finished
        ))
    }

    fn to_webhook_payload(prompt_id: &str, outcome: &GenerationOutcome) -> WebhookPayload {
        if outcome.success {
            WebhookPayload::success(
                prompt_id.to_string(),
                outcome.images.iter().map(|img| crate::notifier::encode_image(img)).collect(),
            )
        } else {
            WebhookPayload::failure(
                prompt_id.to_string(),
                outcome.error.clone().unwrap_or_default(),
            )
        }
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, PromptState>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::Notifier as NotifierTrait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingNotifier {
        count: AtomicUsize,
    }

    impl NotifierTrait for RecordingNotifier {
        fn notify(&self, _url: String, _payload: WebhookPayload) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_tracker() -> (Tracker, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::default());
        let tracker = Tracker::new(notifier.clone(), Duration::from_millis(100));
        (tracker, notifier)
    }

    #[tokio::test]
    async fn happy_path_one_image() {
        let (tracker, notifier) = test_tracker();
        let rx = tracker
            .subscribe("A", 1, Some("http://hook".to_string()))
            .unwrap();

        let (tx, events) = mpsc::channel(100);
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();
        let run = tokio::spawn(tracker.run(events, shutdown_rx));

        tx.send(Event::ExecutionStart {
            prompt_id: "A".to_string(),
        })
        .await
        .unwrap();
        tx.send(Event::ImageReceived {
            bytes: Bytes::from_static(&[0x89, 0x50]),
        })
        .await
        .unwrap();
        tx.send(Event::ExecutionFinished {
            prompt_id: "A".to_string(),
        })
        .await
        .unwrap();

        let outcome = rx.await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.images, vec![Bytes::from_static(&[0x89, 0x50])]);

        drop(tx);
        run.await.unwrap();
        assert_eq!(notifier.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn finish_before_image_still_succeeds() {
        // ExecutionFinished arrives before the image.
        let (tracker, notifier) = test_tracker();
        let rx = tracker.subscribe("B", 1, None).unwrap();

        let (tx, events) = mpsc::channel(100);
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();
        let run = tokio::spawn(tracker.run(events, shutdown_rx));

        tx.send(Event::ExecutionStart {
            prompt_id: "B".to_string(),
        })
        .await
        .unwrap();
        tx.send(Event::ExecutionFinished {
            prompt_id: "B".to_string(),
        })
        .await
        .unwrap();
        tx.send(Event::ImageReceived {
            bytes: Bytes::from_static(&[0xFF]),
        })
        .await
        .unwrap();

        let outcome = rx.await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.images.len(), 1);

        drop(tx);
        run.await.unwrap();
        assert_eq!(notifier.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn idle_timeout_fails_with_diagnostic() {
        let (tracker, _notifier) = test_tracker();
        let rx = tracker.subscribe("C", 2, None).unwrap();

        let (tx, events) = mpsc::channel(100);
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();
        let run = tokio::spawn(tracker.run(events, shutdown_rx));

        tx.send(Event::ExecutionStart {
            prompt_id: "C".to_string(),
        })
        .await
        .unwrap();
        tx.send(Event::ImageReceived {
            bytes: Bytes::from_static(&[0x01]),
        })
        .await
        .unwrap();

        let outcome = rx.await.unwrap();
        assert!(!outcome.success);
        let err = outcome.error.unwrap();
        assert!(err.contains("expected 2"));
        assert!(err.contains("got 1"));

        drop(tx);
        run.await.unwrap();
    }

    #[tokio::test]
    async fn supersession_finalizes_previous_prompt_first() {
        let (tracker, _notifier) = test_tracker();
        let rx_d = tracker.subscribe("D", 1, None).unwrap();
        let rx_e = tracker.subscribe("E", 1, None).unwrap();

        let (tx, events) = mpsc::channel(100);
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();
        let run = tokio::spawn(tracker.run(events, shutdown_rx));

        tx.send(Event::ExecutionStart {
            prompt_id: "D".to_string(),
        })
        .await
        .unwrap();
        tx.send(Event::ExecutionStart {
            prompt_id: "E".to_string(),
        })
        .await
        .unwrap();

        let outcome_d = rx_d.await.unwrap();
        assert!(!outcome_d.success);
        assert!(outcome_d.error.unwrap().contains("SupersededByNewPrompt"));

        tx.send(Event::ImageReceived {
            bytes: Bytes::from_static(&[0x01]),
        })
        .await
        .unwrap();
        tx.send(Event::ExecutionFinished {
            prompt_id: "E".to_string(),
        })
        .await
        .unwrap();
        let outcome_e = rx_e.await.unwrap();
        assert!(outcome_e.success);

        drop(tx);
        run.await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_subscribe_fails_without_mutating_state() {
        let (tracker, _notifier) = test_tracker();
        let _rx = tracker.subscribe("F", 1, None).unwrap();
        let err = tracker.subscribe("F", 1, None).unwrap_err();
        assert!(matches!(err, Error::AlreadyTracked { prompt_id } if prompt_id == "F"));
    }

    #[tokio::test]
    async fn image_with_no_active_prompt_is_dropped_without_panic() {
        let (tracker, _notifier) = test_tracker();
        let (tx, events) = mpsc::channel(100);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let run = tokio::spawn(tracker.run(events, shutdown_rx));

        tx.send(Event::ImageReceived {
            bytes: Bytes::from_static(&[0x00]),
        })
        .await
        .unwrap();

        shutdown_tx.send(()).unwrap();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn zero_images_expected_with_finish_succeeds() {
        let (tracker, _notifier) = test_tracker();
        let rx = tracker.subscribe("Z", 0, None).unwrap();

        let (tx, events) = mpsc::channel(100);
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();
        let run = tokio::spawn(tracker.run(events, shutdown_rx));

        tx.send(Event::ExecutionStart {
            prompt_id: "Z".to_string(),
        })
        .await
        .unwrap();
        tx.send(Event::ExecutionFinished {
            prompt_id: "Z".to_string(),
        })
        .await
        .unwrap();

        let outcome = rx.await.unwrap();
        assert!(outcome.success);
        assert!(outcome.images.is_empty());

        drop(tx);
        run.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_fails_active_prompt() {
        let (tracker, _notifier) = test_tracker();
        let rx = tracker.subscribe("S", 1, None).unwrap();

        let (tx, events) = mpsc::channel(100);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let run = tokio::spawn(tracker.run(events, shutdown_rx));

        tx.send(Event::ExecutionStart {
            prompt_id: "S".to_string(),
        })
        .await
        .unwrap();

        shutdown_tx.send(()).unwrap();
        let outcome = rx.await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("ShutdownDuringPrompt"));

        run.await.unwrap();
    }
}
