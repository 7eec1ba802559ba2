//! Test doubles shared by the orchestration test modules.

use crate::core::state::{
    AudioStatus, ChapterPlan, CharacterRoster, IdeaVariation, PlotOutline,
};
use crate::services::gateway::{
    AggregateSnapshot, AudioAck, AudioStatusItem, ChapterPlanRequest, CharacterPatch, Gateway,
    ProjectInfo,
};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;

/// A gateway fake that records every call in order and returns programmable
/// canned responses. `fail("op")` makes that operation error.
#[derive(Debug)]
pub struct RecordingGateway {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    pub snapshot: Mutex<AggregateSnapshot>,
    pub variations: Mutex<Vec<IdeaVariation>>,
    pub plot: Mutex<PlotOutline>,
    pub roster: Mutex<CharacterRoster>,
    pub plan: Mutex<ChapterPlan>,
    pub beat_text: Mutex<String>,
    pub audio_ack: Mutex<AudioAck>,
    pub audio_items: Mutex<Vec<AudioStatusItem>>,
}

impl Default for RecordingGateway {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            snapshot: Mutex::new(AggregateSnapshot::default()),
            variations: Mutex::new(Vec::new()),
            plot: Mutex::new(PlotOutline::default()),
            roster: Mutex::new(CharacterRoster::default()),
            plan: Mutex::new(ChapterPlan::default()),
            beat_text: Mutex::new("Fresh prose.".to_string()),
            audio_ack: Mutex::new(AudioAck {
                ok: true,
                status: AudioStatus::Generating,
                provider: String::new(),
            }),
            audio_items: Mutex::new(Vec::new()),
        }
    }
}

impl RecordingGateway {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail(&self, op: &str) {
        self.failing.lock().unwrap().insert(op.to_string());
    }

    pub fn set_snapshot(&self, snapshot: AggregateSnapshot) {
        *self.snapshot.lock().unwrap() = snapshot;
    }

    pub fn set_audio_items(&self, items: Vec<AudioStatusItem>) {
        *self.audio_items.lock().unwrap() = items;
    }

    fn hit(&self, op: &str, repr: String) -> Result<()> {
        self.calls.lock().unwrap().push(repr);
        if self.failing.lock().unwrap().contains(op) {
            bail!("{} failed (mock)", op);
        }
        Ok(())
    }
}

#[async_trait]
impl Gateway for RecordingGateway {
    async fn load_state(&self, chapter: u32) -> Result<AggregateSnapshot> {
        self.hit("load_state", format!("load_state({})", chapter))?;
        Ok(self.snapshot.lock().unwrap().clone())
    }

    async fn refine_idea(&self, genre: &str, idea: &str) -> Result<Vec<IdeaVariation>> {
        self.hit("refine_idea", format!("refine_idea({},{})", genre, idea))?;
        Ok(self.variations.lock().unwrap().clone())
    }

    async fn generate_plot(&self, selection: &IdeaVariation) -> Result<PlotOutline> {
        self.hit("generate_plot", format!("generate_plot({})", selection.title))?;
        Ok(self.plot.lock().unwrap().clone())
    }

    async fn generate_characters(
        &self,
        title: &str,
        _genre: &str,
        _plot_summary: &str,
    ) -> Result<CharacterRoster> {
        self.hit("generate_characters", format!("generate_characters({})", title))?;
        Ok(self.roster.lock().unwrap().clone())
    }

    async fn delete_character(&self, id: i64) -> Result<()> {
        self.hit("delete_character", format!("delete_character({})", id))
    }

    async fn update_character(&self, id: i64, _patch: &CharacterPatch) -> Result<()> {
        self.hit("update_character", format!("update_character({})", id))
    }

    async fn plan_chapter(&self, req: &ChapterPlanRequest) -> Result<ChapterPlan> {
        self.hit("plan_chapter", format!("plan_chapter({})", req.chapter))?;
        Ok(self.plan.lock().unwrap().clone())
    }

    async fn write_beat(&self, chapter: u32, index: usize) -> Result<String> {
        self.hit("write_beat", format!("write_beat({},{})", chapter, index))?;
        Ok(self.beat_text.lock().unwrap().clone())
    }

    async fn clear_beat(&self, chapter: u32, index: usize) -> Result<()> {
        self.hit("clear_beat", format!("clear_beat({},{})", chapter, index))
    }

    async fn clear_from(&self, chapter: u32, index: usize) -> Result<()> {
        self.hit("clear_from", format!("clear_from({},{})", chapter, index))
    }

    async fn rebuild_continuity(&self, chapter: u32) -> Result<()> {
        self.hit("rebuild_continuity", format!("rebuild_continuity({})", chapter))
    }

    async fn request_audio(
        &self,
        chapter: u32,
        index: usize,
        provider: &str,
        force: bool,
    ) -> Result<AudioAck> {
        self.hit(
            "request_audio",
            format!("request_audio({},{},{},{})", chapter, index, provider, force),
        )?;
        Ok(self.audio_ack.lock().unwrap().clone())
    }

    async fn audio_status(&self, chapter: u32) -> Result<Vec<AudioStatusItem>> {
        self.hit("audio_status", format!("audio_status({})", chapter))?;
        Ok(self.audio_items.lock().unwrap().clone())
    }

    async fn reset_project(&self) -> Result<()> {
        self.hit("reset_project", "reset_project".to_string())
    }

    async fn list_projects(&self) -> Result<Vec<ProjectInfo>> {
        self.hit("list_projects", "list_projects".to_string())?;
        Ok(Vec::new())
    }

    async fn create_project(&self, title: &str, language: &str) -> Result<ProjectInfo> {
        self.hit(
            "create_project",
            format!("create_project({},{})", title, language),
        )?;
        Ok(ProjectInfo {
            id: "p1".to_string(),
            title: title.to_string(),
            language: language.to_string(),
        })
    }

    async fn delete_project(&self, id: &str) -> Result<()> {
        self.hit("delete_project", format!("delete_project({})", id))
    }
}
