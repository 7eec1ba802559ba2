use crate::core::config::AudioConfig;
use crate::core::events::{EventBus, StateEvent};
use crate::core::state::{
    new_shared_state, PipelineStage, PipelineState, SharedState,
};
use crate::services::consistency::Invalidation;
use crate::services::gateway::{ChapterPlanRequest, CharacterPatch, Gateway};
use crate::services::jobs::JobOrchestrator;
use crate::services::monitor::ProviderSnapshot;
use anyhow::{Context, Result};
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Single source of truth for the aggregate pipeline state. Every user
/// intent is an async operation that either fully succeeds (state updated,
/// consistent) or fails (state unchanged, message surfaced). Preconditions
/// that correspond to disabled controls make an operation a silent no-op
/// rather than an error.
///
/// Beat mutations and navigation hold the intent lock for their duration:
/// an advisory, UI-level mutex mirrored by the `busy` flag, not a
/// server-side one.
pub struct PipelineManager {
    gateway: Arc<dyn Gateway>,
    state: SharedState,
    events: EventBus,
    jobs: JobOrchestrator,
    intent: tokio::sync::Mutex<()>,
}

impl PipelineManager {
    pub fn new(gateway: Arc<dyn Gateway>, audio: &AudioConfig) -> Self {
        let state = new_shared_state();
        let events = EventBus::new();
        let jobs = JobOrchestrator::new(gateway.clone(), state.clone(), events.clone(), audio);
        Self {
            gateway,
            state,
            events,
            jobs,
            intent: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_provider_gate(mut self, rx: watch::Receiver<ProviderSnapshot>) -> Self {
        self.jobs = self.jobs.with_provider_gate(rx);
        self
    }

    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    pub fn snapshot(&self) -> PipelineState {
        self.state.lock().unwrap().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    pub fn jobs(&self) -> &JobOrchestrator {
        &self.jobs
    }

    fn set_busy(&self, busy: bool) {
        self.state.lock().unwrap().busy = busy;
        self.events.emit(StateEvent::Busy(busy));
    }

    fn notice(&self, context: &str, err: &anyhow::Error) {
        warn!("{}: {:#}", context, err);
        self.events
            .emit(StateEvent::Notice(format!("{}: {}", context, err)));
    }

    /// Load the full persisted aggregate once and reconcile to the deepest
    /// completed stage. Partial data is fine; a transport failure is not.
    pub async fn bootstrap(&self) -> Result<PipelineStage> {
        let _guard = self.intent.lock().await;
        self.set_busy(true);
        let loaded = self.gateway.load_state(1).await;
        self.set_busy(false);

        let snap = match loaded {
            Ok(snap) => snap,
            Err(e) => {
                self.notice("Loading project state failed", &e);
                return Err(e);
            }
        };

        let (chapter, stage) = {
            let mut st = self.state.lock().unwrap();
            st.selected = snap.selected.clone();
            st.plot = snap.plot.clone();
            st.characters = snap.characters.clone();
            st.chapter = snap.chapter.max(1);
            st.beats = snap.beats.clone();
            st.beat_texts = snap.beat_texts_by_index();
            st.audio.clear();
            (st.chapter, st.stage())
        };

        if let Err(e) = self.jobs.refresh(chapter).await {
            warn!("audio status load failed during bootstrap: {:#}", e);
        }
        // adopt jobs the backend already has in flight
        self.jobs.ensure_polling();

        self.events.emit(StateEvent::Bootstrapped(stage));
        Ok(stage)
    }

    /// Replace the variation batch. A fresh refinement also unlocks
    /// re-selection.
    pub async fn refine(&self, genre: &str, idea: &str) -> Result<()> {
        let _guard = self.intent.lock().await;
        self.set_busy(true);
        let result = self.gateway.refine_idea(genre, idea).await;
        self.set_busy(false);

        match result {
            Ok(options) => {
                {
                    let mut st = self.state.lock().unwrap();
                    st.variations = options;
                    st.selected = None;
                }
                self.events.emit(StateEvent::VariationsReplaced);
                Ok(())
            }
            Err(e) => {
                self.notice("Idea refinement failed", &e);
                Err(e)
            }
        }
    }

    /// Select one of the current variations; outline and cast are
    /// untouched. A selection stays fixed until a new refinement runs.
    pub fn select_idea(&self, index: usize) {
        let selected = {
            let mut st = self.state.lock().unwrap();
            if st.selected.is_some() {
                debug!("select_idea: selection is fixed until a new refinement");
                false
            } else {
                match st.variations.get(index).cloned() {
                    Some(v) => {
                        st.selected = Some(v);
                        true
                    }
                    None => {
                        debug!("select_idea: index {} out of range", index);
                        false
                    }
                }
            }
        };
        if selected {
            self.events.emit(StateEvent::IdeaSelected);
        }
    }

    /// Replace the outline. Everything downstream (cast, plans, prose,
    /// audio) is invalidated together with the success, and the cursor
    /// returns to chapter 1.
    pub async fn generate_plot(&self) -> Result<()> {
        let _guard = self.intent.lock().await;
        let Some(selection) = self.state.lock().unwrap().selected.clone() else {
            debug!("generate_plot: no idea selected");
            return Ok(());
        };

        self.set_busy(true);
        let result = self.gateway.generate_plot(&selection).await;
        self.set_busy(false);

        match result {
            Ok(plot) => {
                {
                    let mut st = self.state.lock().unwrap();
                    Invalidation::PlotReplaced.apply(&mut st);
                    st.plot = Some(plot);
                }
                self.events.emit(StateEvent::PlotReplaced);
                self.events.emit(StateEvent::ChapterChanged(1));
                Ok(())
            }
            Err(e) => {
                self.notice("Plot generation failed", &e);
                Err(e)
            }
        }
    }

    /// Replace the roster; chapter plans are untouched.
    pub async fn generate_cast(&self) -> Result<()> {
        let _guard = self.intent.lock().await;
        let request = {
            let st = self.state.lock().unwrap();
            match (&st.selected, &st.plot) {
                (Some(sel), Some(plot)) => Some((
                    sel.title.clone(),
                    sel.genre.clone(),
                    plot.structure_analysis.clone(),
                )),
                _ => None,
            }
        };
        let Some((title, genre, summary)) = request else {
            debug!("generate_cast: outline or selection missing");
            return Ok(());
        };

        self.set_busy(true);
        let result = self
            .gateway
            .generate_characters(&title, &genre, &summary)
            .await;
        self.set_busy(false);

        match result {
            Ok(roster) => {
                self.state.lock().unwrap().characters = roster;
                self.events.emit(StateEvent::RosterReplaced);
                Ok(())
            }
            Err(e) => {
                self.notice("Character generation failed", &e);
                Err(e)
            }
        }
    }

    /// Deletion is server-authoritative: after it succeeds the roster is
    /// re-synced wholesale instead of patched locally.
    pub async fn delete_character(&self, id: i64) -> Result<()> {
        let _guard = self.intent.lock().await;
        self.set_busy(true);
        let result = self.delete_character_inner(id).await;
        self.set_busy(false);
        if let Err(e) = &result {
            self.notice("Deleting character failed", e);
        }
        result
    }

    async fn delete_character_inner(&self, id: i64) -> Result<()> {
        self.gateway.delete_character(id).await?;
        self.resync_roster().await
    }

    pub async fn update_character(&self, id: i64, patch: CharacterPatch) -> Result<()> {
        let _guard = self.intent.lock().await;
        self.set_busy(true);
        let result = self.update_character_inner(id, &patch).await;
        self.set_busy(false);
        if let Err(e) = &result {
            self.notice("Updating character failed", e);
        }
        result
    }

    async fn update_character_inner(&self, id: i64, patch: &CharacterPatch) -> Result<()> {
        self.gateway.update_character(id, patch).await?;
        self.resync_roster().await
    }

    async fn resync_roster(&self) -> Result<()> {
        let chapter = self.state.lock().unwrap().chapter;
        let snap = self.gateway.load_state(chapter).await?;
        self.state.lock().unwrap().characters = snap.characters;
        self.events.emit(StateEvent::RosterReplaced);
        Ok(())
    }

    /// Replace the current chapter's beat plan. The plan's own success is
    /// the commit point; the server-side prose wipe that follows is
    /// best-effort because the new plan is already authoritative.
    pub async fn plan_chapter(&self) -> Result<()> {
        let _guard = self.intent.lock().await;
        let request = {
            let st = self.state.lock().unwrap();
            match (&st.selected, &st.plot) {
                (Some(sel), Some(plot)) => {
                    plot.chapters
                        .iter()
                        .find(|c| c.number == st.chapter)
                        .map(|entry| ChapterPlanRequest {
                            chapter: st.chapter,
                            title: sel.title.clone(),
                            genre: sel.genre.clone(),
                            chapter_title: entry.title.clone(),
                            chapter_summary: entry.summary.clone(),
                            characters: st.characters.names(),
                        })
                }
                _ => None,
            }
        };
        let Some(request) = request else {
            debug!("plan_chapter: outline, selection or chapter entry missing");
            return Ok(());
        };

        self.set_busy(true);
        let result = self.plan_chapter_inner(&request).await;
        self.set_busy(false);
        if let Err(e) = &result {
            self.notice("Chapter planning failed", e);
        }
        result
    }

    async fn plan_chapter_inner(&self, request: &ChapterPlanRequest) -> Result<()> {
        let plan = self.gateway.plan_chapter(request).await?;
        {
            let mut st = self.state.lock().unwrap();
            Invalidation::PlanReplaced.apply(&mut st);
            st.beats = Some(plan);
        }
        self.events.emit(StateEvent::PlanReplaced {
            chapter: request.chapter,
        });

        if let Err(e) = self.gateway.clear_from(request.chapter, 0).await {
            warn!(
                "post-plan prose wipe failed for chapter {}: {:#}",
                request.chapter, e
            );
        }
        Ok(())
    }

    /// Write (or rewrite) one beat. A rewrite first discards everything
    /// causally downstream (server first, then locally) before the new
    /// text is requested, so the two sides never diverge even if the write
    /// itself fails afterwards.
    pub async fn write_beat(&self, index: usize) -> Result<()> {
        let _guard = self.intent.lock().await;
        let prepared = {
            let st = self.state.lock().unwrap();
            match &st.beats {
                Some(plan) if index < plan.beats.len() => {
                    Some((st.chapter, plan.beats.len(), st.is_written(index)))
                }
                _ => None,
            }
        };
        let Some((chapter, beat_count, rewriting)) = prepared else {
            debug!("write_beat: no plan loaded or index {} out of range", index);
            return Ok(());
        };

        self.set_busy(true);
        let result = self
            .write_beat_inner(chapter, index, beat_count, rewriting)
            .await;
        self.set_busy(false);
        if let Err(e) = &result {
            self.notice("Writing beat failed", e);
        }
        result
    }

    async fn write_beat_inner(
        &self,
        chapter: u32,
        index: usize,
        beat_count: usize,
        rewriting: bool,
    ) -> Result<()> {
        if rewriting {
            self.gateway
                .clear_from(chapter, index + 1)
                .await
                .context("clearing downstream beats")?;
            {
                let mut st = self.state.lock().unwrap();
                Invalidation::BeatRewritten { index }.apply(&mut st);
            }
            self.events.emit(StateEvent::BeatsInvalidated {
                chapter,
                from: index + 1,
            });
        }

        let text = self.gateway.write_beat(chapter, index).await?;
        self.state.lock().unwrap().beat_texts.insert(index, text);
        self.events
            .emit(StateEvent::BeatTextChanged { chapter, index });

        if index + 1 == beat_count {
            // chapter finished: summarize it for later generation steps
            let gateway = self.gateway.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.rebuild_continuity(chapter).await {
                    warn!("continuity rebuild failed for chapter {}: {:#}", chapter, e);
                }
            });
        }

        if let Err(e) = self.jobs.refresh(chapter).await {
            warn!("audio status refresh failed: {:#}", e);
        }
        Ok(())
    }

    pub async fn clear_beat(&self, index: usize) -> Result<()> {
        let _guard = self.intent.lock().await;
        let Some(chapter) = self.chapter_with_beat(index) else {
            return Ok(());
        };
        self.set_busy(true);
        let result = self.clear_beat_inner(chapter, index).await;
        self.set_busy(false);
        if let Err(e) = &result {
            self.notice("Clearing beat failed", e);
        }
        result
    }

    async fn clear_beat_inner(&self, chapter: u32, index: usize) -> Result<()> {
        self.gateway.clear_beat(chapter, index).await?;
        Invalidation::BeatCleared { index }.apply(&mut self.state.lock().unwrap());
        self.events
            .emit(StateEvent::BeatTextChanged { chapter, index });
        if let Err(e) = self.jobs.refresh(chapter).await {
            warn!("audio status refresh failed: {:#}", e);
        }
        Ok(())
    }

    pub async fn clear_from(&self, index: usize) -> Result<()> {
        let _guard = self.intent.lock().await;
        let Some(chapter) = self.chapter_with_beat(index) else {
            return Ok(());
        };
        self.set_busy(true);
        let result = self.clear_from_inner(chapter, index).await;
        self.set_busy(false);
        if let Err(e) = &result {
            self.notice("Clearing beats failed", e);
        }
        result
    }

    async fn clear_from_inner(&self, chapter: u32, index: usize) -> Result<()> {
        self.gateway.clear_from(chapter, index).await?;
        Invalidation::ClearedFrom { index }.apply(&mut self.state.lock().unwrap());
        self.events
            .emit(StateEvent::BeatsInvalidated { chapter, from: index });
        if let Err(e) = self.jobs.refresh(chapter).await {
            warn!("audio status refresh failed: {:#}", e);
        }
        Ok(())
    }

    fn chapter_with_beat(&self, index: usize) -> Option<u32> {
        let st = self.state.lock().unwrap();
        match &st.beats {
            Some(plan) if index < plan.beats.len() => Some(st.chapter),
            _ => {
                debug!("beat {} is outside the current plan", index);
                None
            }
        }
    }

    /// Bounded navigation: a target outside `[1, total]` is a no-op. Loads
    /// the chapter's persisted plan, prose and audio, replacing all
    /// chapter-scoped state.
    pub async fn goto_chapter(&self, chapter: u32) -> Result<()> {
        let _guard = self.intent.lock().await;
        let total = self.state.lock().unwrap().total_chapters() as u32;
        if chapter < 1 || chapter > total {
            debug!("goto_chapter: {} outside [1, {}]", chapter, total);
            return Ok(());
        }

        self.set_busy(true);
        let result = self.goto_chapter_inner(chapter).await;
        self.set_busy(false);
        if let Err(e) = &result {
            self.notice("Loading chapter failed", e);
        }
        result
    }

    async fn goto_chapter_inner(&self, chapter: u32) -> Result<()> {
        let snap = self.gateway.load_state(chapter).await?;
        {
            let mut st = self.state.lock().unwrap();
            st.chapter = chapter;
            st.beats = snap.beats.clone();
            st.beat_texts = snap.beat_texts_by_index();
            st.audio.clear();
        }
        // the old chapter's timer is cleared; a poll already in flight for
        // it will be discarded by its chapter tag
        self.jobs.stop();
        self.events.emit(StateEvent::ChapterChanged(chapter));

        if let Err(e) = self.jobs.refresh(chapter).await {
            warn!("audio status load failed for chapter {}: {:#}", chapter, e);
        }
        self.jobs.ensure_polling();
        Ok(())
    }

    /// Audio generation runs concurrently with other intents; it is gated
    /// and deduplicated by the orchestrator, not the intent lock.
    pub async fn request_audio(&self, index: usize, provider: &str, force: bool) -> Result<()> {
        if let Err(e) = self.jobs.request_generation(index, provider, force).await {
            self.notice("Audio generation failed", &e);
            return Err(e);
        }
        Ok(())
    }

    /// Wipe the project server-side, then locally.
    pub async fn reset_project(&self) -> Result<()> {
        let _guard = self.intent.lock().await;
        self.set_busy(true);
        let result = self.gateway.reset_project().await;
        self.set_busy(false);

        match result {
            Ok(()) => {
                self.jobs.stop();
                {
                    let mut st = self.state.lock().unwrap();
                    *st = PipelineState {
                        chapter: 1,
                        ..Default::default()
                    };
                }
                self.events
                    .emit(StateEvent::Bootstrapped(PipelineStage::Idea));
                Ok(())
            }
            Err(e) => {
                self.notice("Project reset failed", &e);
                Err(e)
            }
        }
    }
}
