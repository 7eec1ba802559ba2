use crate::core::state::PipelineStage;
use tokio::sync::broadcast;

/// State-change notifications emitted by the pipeline manager and job
/// orchestrator. A rendering layer subscribes; the core has no DOM or
/// terminal dependency of its own.
#[derive(Debug, Clone, PartialEq)]
pub enum StateEvent {
    /// Full aggregate loaded; redraw everything and present this step.
    Bootstrapped(PipelineStage),
    VariationsReplaced,
    IdeaSelected,
    PlotReplaced,
    RosterReplaced,
    PlanReplaced { chapter: u32 },
    BeatTextChanged { chapter: u32, index: usize },
    /// Beats `from..` lost their prose/audio in `chapter`.
    BeatsInvalidated { chapter: u32, from: usize },
    /// Audio job map changed; `structural` means a job went from absent to
    /// existing and interactive controls must be rebuilt, not just relabeled.
    AudioChanged { chapter: u32, structural: bool },
    ChapterChanged(u32),
    Busy(bool),
    /// User-visible failure message; state was left at its last consistent
    /// value.
    Notice(String),
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StateEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.tx.subscribe()
    }

    /// Send errors just mean nobody is listening right now.
    pub fn emit(&self, event: StateEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
