use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct IdeaVariation {
    pub title: String,
    pub description: String,
    pub genre: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PlotChapter {
    pub number: u32,
    pub title: String,
    pub summary: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct PlotOutline {
    #[serde(default)]
    pub structure_analysis: String,
    #[serde(default)]
    pub chapters: Vec<PlotChapter>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CharacterCard {
    /// `None` until the server has persisted the card; deletion needs an id.
    #[serde(default)]
    pub id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub bio: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct CharacterRoster {
    #[serde(default)]
    pub protagonists: Vec<CharacterCard>,
    #[serde(default)]
    pub antagonists: Vec<CharacterCard>,
    #[serde(default)]
    pub supporting: Vec<CharacterCard>,
}

impl CharacterRoster {
    pub fn is_empty(&self) -> bool {
        self.protagonists.is_empty() && self.antagonists.is_empty() && self.supporting.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.protagonists
            .iter()
            .chain(&self.antagonists)
            .chain(&self.supporting)
            .map(|c| c.name.clone())
            .collect()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Beat {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct ChapterPlan {
    #[serde(default)]
    pub beats: Vec<Beat>,
}

/// Beat prose keyed by 0-based beat index. An entry that is empty after
/// trimming counts as unwritten.
pub type BeatTexts = HashMap<usize, String>;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AudioStatus {
    Generating,
    Ready,
    Error,
    Playing,
    Paused,
    #[default]
    #[serde(other)]
    Missing,
}

impl AudioStatus {
    /// Playback states are client-local refinements of `Ready`; for job
    /// completion purposes they count as done.
    pub fn is_playable(&self) -> bool {
        matches!(self, AudioStatus::Ready | AudioStatus::Playing | AudioStatus::Paused)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioJob {
    pub exists: bool,
    pub status: AudioStatus,
    pub url: String,
}

/// `(beat index, provider key)`; each provider tracks its own job per beat.
pub type AudioKey = (usize, String);

/// Which step of the pipeline to present, resolved from the deepest
/// completed stage of the persisted aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Idea,
    Plot,
    Cast,
    Beats,
    Write,
}

/// The aggregate client-visible state. Mutated only through the pipeline
/// manager's operations; everything else reads it.
#[derive(Debug, Clone, Default)]
pub struct PipelineState {
    pub variations: Vec<IdeaVariation>,
    pub selected: Option<IdeaVariation>,
    pub plot: Option<PlotOutline>,
    pub characters: CharacterRoster,
    /// 1-based chapter cursor; meaningful while an outline exists.
    pub chapter: u32,
    pub beats: Option<ChapterPlan>,
    pub beat_texts: BeatTexts,
    pub audio: HashMap<AudioKey, AudioJob>,
    /// Advisory UI mutex: set while a serialized intent is in flight.
    pub busy: bool,
}

impl PipelineState {
    pub fn total_chapters(&self) -> usize {
        self.plot.as_ref().map_or(0, |p| p.chapters.len())
    }

    pub fn beat_count(&self) -> usize {
        self.beats.as_ref().map_or(0, |p| p.beats.len())
    }

    pub fn is_written(&self, index: usize) -> bool {
        self.beat_texts
            .get(&index)
            .map_or(false, |t| !t.trim().is_empty())
    }

    pub fn any_generating(&self) -> bool {
        self.audio
            .values()
            .any(|j| j.status == AudioStatus::Generating)
    }

    pub fn stage(&self) -> PipelineStage {
        if self.beats.is_some() {
            PipelineStage::Write
        } else if !self.characters.is_empty() {
            PipelineStage::Beats
        } else if self.plot.is_some() {
            PipelineStage::Cast
        } else if self.selected.is_some() {
            PipelineStage::Plot
        } else {
            PipelineStage::Idea
        }
    }
}

/// Shared handle to the aggregate. Lock for short critical sections only;
/// never hold the guard across an `.await`.
pub type SharedState = Arc<Mutex<PipelineState>>;

pub fn new_shared_state() -> SharedState {
    Arc::new(Mutex::new(PipelineState {
        chapter: 1,
        ..Default::default()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outline(n: u32) -> PlotOutline {
        PlotOutline {
            structure_analysis: "three acts".to_string(),
            chapters: (1..=n)
                .map(|i| PlotChapter {
                    number: i,
                    title: format!("Chapter {}", i),
                    summary: String::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn empty_after_trim_is_unwritten() {
        let mut state = PipelineState::default();
        state.beat_texts.insert(0, "  \n ".to_string());
        state.beat_texts.insert(1, "Prose.".to_string());

        assert!(!state.is_written(0));
        assert!(state.is_written(1));
        assert!(!state.is_written(2));
    }

    #[test]
    fn stage_resolution_is_deepest_completed() {
        let mut state = PipelineState::default();
        assert_eq!(state.stage(), PipelineStage::Idea);

        state.selected = Some(IdeaVariation {
            title: "t".to_string(),
            description: "d".to_string(),
            genre: "g".to_string(),
        });
        assert_eq!(state.stage(), PipelineStage::Plot);

        state.plot = Some(outline(3));
        assert_eq!(state.stage(), PipelineStage::Cast);

        state.characters.protagonists.push(CharacterCard {
            id: Some(1),
            name: "Mara".to_string(),
            role: "lead".to_string(),
            bio: String::new(),
        });
        assert_eq!(state.stage(), PipelineStage::Beats);

        state.beats = Some(ChapterPlan { beats: vec![] });
        assert_eq!(state.stage(), PipelineStage::Write);
    }

    #[test]
    fn generating_detection_ignores_playback_states() {
        let mut state = PipelineState::default();
        state.audio.insert(
            (0, "piper".to_string()),
            AudioJob {
                exists: true,
                status: AudioStatus::Playing,
                url: "/a".to_string(),
            },
        );
        assert!(!state.any_generating());

        state.audio.insert(
            (1, "xtts".to_string()),
            AudioJob {
                exists: false,
                status: AudioStatus::Generating,
                url: String::new(),
            },
        );
        assert!(state.any_generating());
    }

    #[test]
    fn unknown_audio_status_decays_to_missing() {
        let status: AudioStatus = serde_json::from_str("\"done\"").unwrap();
        assert_eq!(status, AudioStatus::Missing);
        let status: AudioStatus = serde_json::from_str("\"ready\"").unwrap();
        assert_eq!(status, AudioStatus::Ready);
    }
}
