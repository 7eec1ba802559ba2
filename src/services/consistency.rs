use crate::core::state::{CharacterRoster, PipelineState};

/// Cascade policy between pipeline stages, expressed as pure rules over the
/// aggregate. Transport-free: callers decide when a rule is committed
/// (always together with the success that made the upstream artifact
/// authoritative, never speculatively).
///
/// Everything below plot level is scoped to the current chapter; audio
/// invalidation never crosses chapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invalidation {
    /// A new outline replaces the old one: roster, plan, prose and audio
    /// are all downstream. Resets the cursor to chapter 1.
    PlotReplaced,
    /// The current chapter was re-planned: its prose and audio are stale.
    PlanReplaced,
    /// Beat `index` is being rewritten: prose continuity assumes earlier
    /// beats are fixed, so everything strictly after it is discarded.
    BeatRewritten { index: usize },
    /// Beat `index` was cleared on its own.
    BeatCleared { index: usize },
    /// Beats `index..` were cleared.
    ClearedFrom { index: usize },
}

impl Invalidation {
    pub fn apply(&self, state: &mut PipelineState) {
        match *self {
            Invalidation::PlotReplaced => {
                state.characters = CharacterRoster::default();
                state.beats = None;
                state.beat_texts.clear();
                state.audio.clear();
                state.chapter = 1;
            }
            Invalidation::PlanReplaced => {
                state.beat_texts.clear();
                state.audio.clear();
            }
            Invalidation::BeatRewritten { index } => {
                state.beat_texts.retain(|&i, _| i <= index);
                state.audio.retain(|&(i, _), _| i <= index);
            }
            Invalidation::BeatCleared { index } => {
                state.beat_texts.remove(&index);
                state.audio.retain(|&(i, _), _| i != index);
            }
            Invalidation::ClearedFrom { index } => {
                state.beat_texts.retain(|&i, _| i < index);
                state.audio.retain(|&(i, _), _| i < index);
            }
        }
    }
}
