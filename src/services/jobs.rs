use crate::core::config::AudioConfig;
use crate::core::events::{EventBus, StateEvent};
use crate::core::state::{AudioJob, AudioStatus, SharedState};
use crate::services::gateway::{AudioStatusItem, Gateway};
use crate::services::monitor::ProviderSnapshot;
use anyhow::{Context, Result};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

struct Poller {
    chapter: u32,
    handle: JoinHandle<()>,
}

/// Tracks per-(beat, provider) audio jobs and runs the shared status
/// poller for the current chapter. At most one poll is in flight at a
/// time; overlapping ticks are dropped, not queued.
pub struct JobOrchestrator {
    gateway: Arc<dyn Gateway>,
    state: SharedState,
    events: EventBus,
    poll_interval: Duration,
    max_polls: u32,
    in_flight: Arc<AtomicBool>,
    poller: Mutex<Option<Poller>>,
    providers: Option<watch::Receiver<ProviderSnapshot>>,
}

impl JobOrchestrator {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        state: SharedState,
        events: EventBus,
        config: &AudioConfig,
    ) -> Self {
        Self {
            gateway,
            state,
            events,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_polls: config.max_polls,
            in_flight: Arc::new(AtomicBool::new(false)),
            poller: Mutex::new(None),
            providers: None,
        }
    }

    /// Attach the live provider snapshot; without one, gating stays open.
    pub fn with_provider_gate(mut self, rx: watch::Receiver<ProviderSnapshot>) -> Self {
        self.providers = Some(rx);
        self
    }

    /// Request synthesis for one beat on one provider. Optimistically marks
    /// the job `generating`; a request-level failure goes straight to
    /// `error` (no job was created server-side). Preconditions (unwritten
    /// beat, provider not loaded) make this a no-op, matching the disabled
    /// controls they correspond to.
    pub async fn request_generation(
        &self,
        index: usize,
        provider: &str,
        force: bool,
    ) -> Result<()> {
        let chapter = {
            let st = self.state.lock().unwrap();
            if !st.is_written(index) {
                debug!("beat {} has no text, skipping audio request", index);
                return Ok(());
            }
            st.chapter
        };

        if let Some(rx) = &self.providers {
            if !rx.borrow().allows_tts(provider) {
                warn!("provider {} is not loaded, generation disabled", provider);
                return Ok(());
            }
        }

        let key = (index, provider.to_string());
        let structural = {
            let mut st = self.state.lock().unwrap();
            let fresh = !st.audio.contains_key(&key);
            let job = st.audio.entry(key.clone()).or_default();
            job.status = AudioStatus::Generating;
            fresh
        };
        self.events
            .emit(StateEvent::AudioChanged { chapter, structural });

        match self
            .gateway
            .request_audio(chapter, index, provider, force)
            .await
        {
            Ok(ack) => {
                if ack.status == AudioStatus::Ready {
                    // already synthesized and not forced; pick up the url
                    {
                        let mut st = self.state.lock().unwrap();
                        if let Some(job) = st.audio.get_mut(&key) {
                            job.status = AudioStatus::Ready;
                            job.exists = true;
                        }
                    }
                    self.events.emit(StateEvent::AudioChanged {
                        chapter,
                        structural: false,
                    });
                    if let Err(e) = self.refresh(chapter).await {
                        warn!("audio status refresh failed: {:#}", e);
                    }
                } else {
                    self.ensure_polling();
                }
                Ok(())
            }
            Err(e) => {
                {
                    let mut st = self.state.lock().unwrap();
                    if let Some(job) = st.audio.get_mut(&key) {
                        job.status = AudioStatus::Error;
                    }
                }
                self.events.emit(StateEvent::AudioChanged {
                    chapter,
                    structural: false,
                });
                Err(e).context("audio generation request failed")
            }
        }
    }

    /// One immediate status fetch for `chapter`, through the same
    /// re-entrancy guard as the poller.
    pub async fn refresh(&self, chapter: u32) -> Result<()> {
        poll_once(
            &self.gateway,
            &self.state,
            &self.events,
            &self.in_flight,
            chapter,
        )
        .await
        .map(|_| ())
    }

    /// Start the shared poller for the current chapter if any job is
    /// generating. Keyed by chapter: navigating restarts it (the old timer
    /// is cleared); a poller that already matches is left alone.
    pub fn ensure_polling(&self) {
        let (chapter, generating) = {
            let st = self.state.lock().unwrap();
            (st.chapter, st.any_generating())
        };
        if !generating {
            return;
        }

        let mut slot = self.poller.lock().unwrap();
        if let Some(p) = slot.as_ref() {
            if p.chapter == chapter && !p.handle.is_finished() {
                return;
            }
            p.handle.abort();
        }
        *slot = Some(Poller {
            chapter,
            handle: self.spawn_poller(chapter),
        });
    }

    pub fn is_polling(&self) -> bool {
        self.poller
            .lock()
            .unwrap()
            .as_ref()
            .map_or(false, |p| !p.handle.is_finished())
    }

    pub fn stop(&self) {
        if let Some(p) = self.poller.lock().unwrap().take() {
            p.handle.abort();
        }
    }

    /// Playback transitions are client-local refinements of `ready`; they
    /// never affect job completion and are replaced by the next status item
    /// for their key.
    pub fn set_playback(&self, index: usize, provider: &str, status: AudioStatus) {
        if !status.is_playable() {
            return;
        }
        let chapter = {
            let mut st = self.state.lock().unwrap();
            let chapter = st.chapter;
            match st.audio.get_mut(&(index, provider.to_string())) {
                Some(job) if job.status.is_playable() => job.status = status,
                _ => return,
            }
            chapter
        };
        self.events.emit(StateEvent::AudioChanged {
            chapter,
            structural: false,
        });
    }

    fn spawn_poller(&self, chapter: u32) -> JoinHandle<()> {
        let gateway = self.gateway.clone();
        let state = self.state.clone();
        let events = self.events.clone();
        let guard = self.in_flight.clone();
        let interval = self.poll_interval;
        let max_polls = self.max_polls;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first interval tick fires immediately; the optimistic
            // status gets a full interval before the first refresh
            ticker.tick().await;

            for _ in 0..max_polls {
                ticker.tick().await;
                match poll_once(&gateway, &state, &events, &guard, chapter).await {
                    Ok(true) => {}
                    Ok(false) => return,
                    Err(e) => warn!("audio status poll failed: {:#}", e),
                }
            }
            warn!(
                "audio polling gave up after {} ticks for chapter {}",
                max_polls, chapter
            );
        })
    }
}

impl Drop for JobOrchestrator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Returns whether polling should continue: the chapter is still current
/// and at least one job remains `generating`.
async fn poll_once(
    gateway: &Arc<dyn Gateway>,
    state: &SharedState,
    events: &EventBus,
    guard: &AtomicBool,
    chapter: u32,
) -> Result<bool> {
    if guard
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        debug!("audio poll already in flight, dropping tick");
        return Ok(true);
    }
    let fetched = gateway.audio_status(chapter).await;
    guard.store(false, Ordering::SeqCst);

    let items = fetched?;
    apply_items(state, events, chapter, &items);

    let st = state.lock().unwrap();
    Ok(st.chapter == chapter && st.any_generating())
}

/// Apply a status response atomically per item: each reported item fully
/// replaces the prior record for its key; unreported keys keep their last
/// known state. A response tagged for a chapter the user has left is
/// discarded whole.
fn apply_items(state: &SharedState, events: &EventBus, chapter: u32, items: &[AudioStatusItem]) {
    let (structural, changed) = {
        let mut st = state.lock().unwrap();
        if st.chapter != chapter {
            debug!("discarding stale audio status for chapter {}", chapter);
            return;
        }

        let mut structural = false;
        let mut changed = false;
        for item in items {
            let key = (item.beat_index, item.provider.clone());
            let next = AudioJob {
                exists: item.exists,
                status: item.status,
                url: item.url.clone(),
            };
            let prior = st.audio.get(&key).cloned();
            if prior.as_ref() == Some(&next) {
                continue;
            }
            // absent -> existing means new interactive controls
            if next.exists && !prior.map_or(false, |p| p.exists) {
                structural = true;
            }
            changed = true;
            st.audio.insert(key, next);
        }
        (structural, changed)
    };

    if changed {
        events.emit(StateEvent::AudioChanged { chapter, structural });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::new_shared_state;
    use crate::services::testutil::RecordingGateway;

    fn fast_config() -> AudioConfig {
        AudioConfig {
            poll_interval_ms: 10,
            max_polls: 50,
            ..Default::default()
        }
    }

    fn orchestrator_with(gateway: Arc<RecordingGateway>) -> (JobOrchestrator, SharedState) {
        let state = new_shared_state();
        state.lock().unwrap().beat_texts.insert(0, "Prose.".to_string());
        let jobs = JobOrchestrator::new(
            gateway,
            state.clone(),
            EventBus::new(),
            &fast_config(),
        );
        (jobs, state)
    }

    fn item(index: usize, provider: &str, status: AudioStatus, exists: bool) -> AudioStatusItem {
        AudioStatusItem {
            beat_index: index,
            provider: provider.to_string(),
            exists,
            status,
            url: if exists { "/wav".to_string() } else { String::new() },
        }
    }

    #[tokio::test]
    async fn request_failure_transitions_to_error() {
        let gateway = Arc::new(RecordingGateway::default());
        gateway.fail("request_audio");
        let (jobs, state) = orchestrator_with(gateway);

        let result = jobs.request_generation(0, "piper", false).await;
        assert!(result.is_err());

        let st = state.lock().unwrap();
        let job = st.audio.get(&(0, "piper".to_string())).unwrap();
        assert_eq!(job.status, AudioStatus::Error);
        assert!(!job.exists);
    }

    #[tokio::test]
    async fn request_marks_generating_and_polling_reaches_ready() {
        let gateway = Arc::new(RecordingGateway::default());
        gateway.set_audio_items(vec![item(0, "piper", AudioStatus::Ready, true)]);
        let (jobs, state) = orchestrator_with(gateway.clone());

        jobs.request_generation(0, "piper", false).await.unwrap();
        assert_eq!(
            state.lock().unwrap().audio[&(0, "piper".to_string())].status,
            AudioStatus::Generating
        );
        assert!(jobs.is_polling());

        // ready response arrives, poller drains within a tick or two
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if !jobs.is_polling() {
                break;
            }
        }
        assert!(!jobs.is_polling());

        let st = state.lock().unwrap();
        let job = &st.audio[&(0, "piper".to_string())];
        assert_eq!(job.status, AudioStatus::Ready);
        assert!(job.exists);
        assert_eq!(job.url, "/wav");
    }

    #[tokio::test]
    async fn unwritten_beat_is_a_no_op() {
        let gateway = Arc::new(RecordingGateway::default());
        let (jobs, state) = orchestrator_with(gateway.clone());

        jobs.request_generation(3, "piper", false).await.unwrap();

        assert!(state.lock().unwrap().audio.is_empty());
        assert!(gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn unloaded_provider_is_gated() {
        let gateway = Arc::new(RecordingGateway::default());
        let state = new_shared_state();
        state.lock().unwrap().beat_texts.insert(0, "Prose.".to_string());

        let (_tx, rx) = watch::channel(ProviderSnapshot {
            llm: vec![],
            tts: vec!["qwen".to_string()],
        });
        let jobs = JobOrchestrator::new(
            gateway.clone(),
            state.clone(),
            EventBus::new(),
            &fast_config(),
        )
        .with_provider_gate(rx);

        jobs.request_generation(0, "piper", false).await.unwrap();
        assert!(gateway.calls().is_empty());

        jobs.request_generation(0, "qwen", false).await.unwrap();
        assert!(!gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn stale_chapter_response_is_discarded() {
        let gateway = Arc::new(RecordingGateway::default());
        let (jobs, state) = orchestrator_with(gateway);
        state.lock().unwrap().chapter = 2;

        // a poll tagged for chapter 1 lands after navigation to chapter 2
        apply_items(
            &state,
            &EventBus::new(),
            1,
            &[item(0, "piper", AudioStatus::Ready, true)],
        );
        assert!(state.lock().unwrap().audio.is_empty());

        // the matching chapter applies
        apply_items(
            &state,
            &EventBus::new(),
            2,
            &[item(0, "piper", AudioStatus::Ready, true)],
        );
        assert_eq!(state.lock().unwrap().audio.len(), 1);
        drop(jobs);
    }

    #[tokio::test]
    async fn unreported_jobs_keep_last_known_state() {
        let gateway = Arc::new(RecordingGateway::default());
        let (jobs, state) = orchestrator_with(gateway);
        {
            let mut st = state.lock().unwrap();
            st.audio.insert(
                (1, "xtts".to_string()),
                AudioJob {
                    exists: true,
                    status: AudioStatus::Ready,
                    url: "/old".to_string(),
                },
            );
        }

        apply_items(
            &state,
            &EventBus::new(),
            1,
            &[item(0, "piper", AudioStatus::Generating, false)],
        );

        let st = state.lock().unwrap();
        assert_eq!(st.audio.len(), 2);
        assert_eq!(st.audio[&(1, "xtts".to_string())].url, "/old");
        drop(st);
        drop(jobs);
    }

    #[tokio::test]
    async fn exists_flip_is_structural_plain_update_is_not() {
        let gateway = Arc::new(RecordingGateway::default());
        let (jobs, state) = orchestrator_with(gateway);
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        apply_items(
            &state,
            &bus,
            1,
            &[item(0, "piper", AudioStatus::Generating, false)],
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            StateEvent::AudioChanged {
                chapter: 1,
                structural: false
            }
        );

        apply_items(&state, &bus, 1, &[item(0, "piper", AudioStatus::Ready, true)]);
        assert_eq!(
            rx.recv().await.unwrap(),
            StateEvent::AudioChanged {
                chapter: 1,
                structural: true
            }
        );
        drop(jobs);
    }

    #[tokio::test]
    async fn overlapping_tick_is_dropped() {
        let gateway = Arc::new(RecordingGateway::default());
        let (jobs, state) = orchestrator_with(gateway.clone());
        let guard = jobs.in_flight.clone();

        guard.store(true, Ordering::SeqCst);
        let still = poll_once(&jobs.gateway, &state, &jobs.events, &guard, 1)
            .await
            .unwrap();
        assert!(still, "a dropped tick must not stop the poller");
        assert!(gateway.calls().is_empty(), "no request while one is in flight");

        guard.store(false, Ordering::SeqCst);
        poll_once(&jobs.gateway, &state, &jobs.events, &guard, 1)
            .await
            .unwrap();
        assert_eq!(gateway.calls(), vec!["audio_status(1)".to_string()]);
    }

    #[tokio::test]
    async fn playback_toggles_only_on_playable_jobs() {
        let gateway = Arc::new(RecordingGateway::default());
        let (jobs, state) = orchestrator_with(gateway);
        {
            let mut st = state.lock().unwrap();
            st.audio.insert(
                (0, "piper".to_string()),
                AudioJob {
                    exists: true,
                    status: AudioStatus::Ready,
                    url: "/w".to_string(),
                },
            );
            st.audio.insert(
                (1, "piper".to_string()),
                AudioJob {
                    exists: false,
                    status: AudioStatus::Generating,
                    url: String::new(),
                },
            );
        }

        jobs.set_playback(0, "piper", AudioStatus::Playing);
        jobs.set_playback(1, "piper", AudioStatus::Playing);

        let st = state.lock().unwrap();
        assert_eq!(st.audio[&(0, "piper".to_string())].status, AudioStatus::Playing);
        assert_eq!(
            st.audio[&(1, "piper".to_string())].status,
            AudioStatus::Generating,
            "a generating job cannot enter playback"
        );
    }
}
