use crate::core::state::{
    CharacterStates, FailureKind, Progress, RunState, StateUpdate, StepFailure, StoryBible,
};
use crate::services::agents;
use crate::services::llm::LlmClient;
use crate::services::store::ChapterStore;
use anyhow::Result;
use log::{info, warn};

/// Nodes one scene passes through, from PrepareScene to AccumulateScene.
pub const STEPS_PER_SCENE: usize = 5;

/// Every step of the generation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Node {
    UserInput,
    WorldBible,
    CharacterBible,
    OverallPlot,
    PrepareChapter,
    ChapterPlanner,
    PrepareScene,
    SceneGenerator,
    ConsistencyChecker,
    StateUpdater,
    AccumulateScene,
    SaveChapterOutput,
    FinalOutput,
}

/// The edge taken after `node` has produced `state`. `None` ends the
/// traversal.
pub fn next_node(node: Node, state: &RunState) -> Option<Node> {
    use Node::*;

    let failed = state.has_error();
    let scene_loop = || {
        if !failed && state.has_pending_scene() {
            PrepareScene
        } else {
            SaveChapterOutput
        }
    };

    match node {
        UserInput | WorldBible | CharacterBible | OverallPlot | PrepareChapter if failed => {
            Some(FinalOutput)
        }
        UserInput => Some(WorldBible),
        WorldBible => Some(CharacterBible),
        CharacterBible => Some(OverallPlot),
        OverallPlot => Some(PrepareChapter),
        PrepareChapter => Some(ChapterPlanner),
        ChapterPlanner | AccumulateScene => Some(scene_loop()),
        PrepareScene | SceneGenerator | StateUpdater if failed => Some(SaveChapterOutput),
        PrepareScene => Some(SceneGenerator),
        SceneGenerator => Some(ConsistencyChecker),
        ConsistencyChecker => Some(StateUpdater),
        StateUpdater => Some(AccumulateScene),
        SaveChapterOutput if failed => Some(FinalOutput),
        SaveChapterOutput | FinalOutput => None,
    }
}

/// Where a traversal goes once its step budget is spent: Phase 1 nodes end
/// the run, anything inside a chapter first saves the finished scenes.
pub fn exhausted_route(node: Node) -> Node {
    use Node::*;

    match node {
        UserInput | WorldBible | CharacterBible | OverallPlot | PrepareChapter | FinalOutput => {
            FinalOutput
        }
        ChapterPlanner | PrepareScene | SceneGenerator | ConsistencyChecker | StateUpdater
        | AccumulateScene | SaveChapterOutput => SaveChapterOutput,
    }
}

/// Result of driving the graph from one entry node to its end.
#[derive(Debug)]
pub struct Traversal {
    pub state: RunState,
    pub path: Vec<Node>,
}

/// Runs nodes one at a time against the injected collaborators.
pub struct Workflow<'a> {
    llm: &'a dyn LlmClient,
    store: &'a dyn ChapterStore,
    max_steps: usize,
}

impl<'a> Workflow<'a> {
    pub fn new(llm: &'a dyn LlmClient, store: &'a dyn ChapterStore, max_steps: usize) -> Self {
        Self {
            llm,
            store,
            max_steps,
        }
    }

    pub async fn step(&self, node: Node, state: &RunState) -> RunState {
        match node {
            Node::UserInput => agents::user_input(state),
            Node::WorldBible => agents::world_bible(state, self.llm).await,
            Node::CharacterBible => agents::character_bible(state, self.llm).await,
            Node::OverallPlot => agents::overall_plot(state, self.llm).await,
            Node::PrepareChapter => agents::prepare_chapter(state),
            Node::ChapterPlanner => agents::chapter_planner(state, self.llm).await,
            Node::PrepareScene => agents::prepare_scene(state),
            Node::SceneGenerator => agents::scene_generator(state, self.llm).await,
            Node::ConsistencyChecker => agents::consistency_checker(state),
            Node::StateUpdater => agents::state_updater(state),
            Node::AccumulateScene => agents::accumulate_scene(state),
            Node::SaveChapterOutput => agents::save_chapter_output(state, self.store).await,
            Node::FinalOutput => agents::final_output(state),
        }
    }

    /// Steps allowed for `state`: the configured base plus room for every
    /// planned scene of the current chapter.
    fn budget(&self, state: &RunState) -> usize {
        let scenes = state.chapter_scene_outline.as_ref().map_or(0, Vec::len);
        self.max_steps + STEPS_PER_SCENE * scenes
    }

    /// Drives the graph from `start` until a node has no successor.
    ///
    /// Running out of steps records a [`FailureKind::StepLimit`] failure and
    /// routes through [`exhausted_route`], so finished scenes are still saved.
    pub async fn traverse(&self, start: Node, mut state: RunState) -> Traversal {
        let mut path = Vec::new();
        let mut current = Some(start);
        let mut exhausted = false;

        while let Some(mut node) = current {
            let budget = self.budget(&state);
            if !exhausted && path.len() >= budget {
                exhausted = true;
                let message = format!(
                    "Step limit of {} reached before {:?} (chapter {}, scene {})",
                    budget,
                    node,
                    state.current_chapter_index + 1,
                    state.current_scene_index + 1
                );
                warn!("{}", message);
                state = state.merge(StateUpdate::failure(FailureKind::StepLimit, message));
                node = exhausted_route(node);
            }

            state = self.step(node, &state).await;
            path.push(node);
            if node == Node::OverallPlot && !state.has_error() {
                self.checkpoint_bible(&state).await;
            }
            current = next_node(node, &state);
        }

        Traversal { state, path }
    }

    /// Persists the bible as soon as Phase 1 is done.
    async fn checkpoint_bible(&self, state: &RunState) {
        let Some(bible) = StoryBible::from_state(state) else {
            return;
        };
        if let Err(e) = self.store.save_bible(&bible).await {
            warn!("Could not persist story bible: {:#}", e);
        }
    }
}

/// Asked between chapters whether the run should go on.
pub trait ChapterGate: Send + Sync {
    /// `finished` is the 1-based number of the chapter just written.
    fn should_continue(&self, finished: usize, total: usize) -> bool;
}

pub struct AlwaysContinue;

impl ChapterGate for AlwaysContinue {
    fn should_continue(&self, _finished: usize, _total: usize) -> bool {
        true
    }
}

/// The three concepts a fresh run starts from.
#[derive(Debug, Clone)]
pub struct RunInputs {
    pub world: String,
    pub character: String,
    pub premise: String,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunReport {
    /// 1-based numbers of chapters that finished without a failure.
    pub chapters_completed: Vec<usize>,
    /// Scenes persisted across all chapters, partial chapters included.
    pub scenes_written: usize,
    /// The failure that stopped the run.
    pub failure: Option<StepFailure>,
    pub debug_output: Option<String>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Generates a whole novel: Phase 1 and the first chapter in one traversal,
/// then one traversal per remaining chapter.
pub struct Novelist {
    llm: Box<dyn LlmClient>,
    store: Box<dyn ChapterStore>,
    gate: Box<dyn ChapterGate>,
    max_steps: usize,
}

impl Novelist {
    pub fn new(
        llm: Box<dyn LlmClient>,
        store: Box<dyn ChapterStore>,
        gate: Box<dyn ChapterGate>,
        max_steps: usize,
    ) -> Self {
        Self {
            llm,
            store,
            gate,
            max_steps,
        }
    }

    fn workflow(&self) -> Workflow<'_> {
        Workflow::new(self.llm.as_ref(), self.store.as_ref(), self.max_steps)
    }

    pub async fn run(&self, inputs: RunInputs) -> Result<RunReport> {
        let mut report = RunReport::default();
        let mut progress = Progress::default();
        self.store.save_progress(&progress).await?;

        let state = RunState::from_concepts(inputs.world, inputs.character, inputs.premise);
        let traversal = self.workflow().traverse(Node::UserInput, state).await;
        let state = traversal.state;

        let Some(bible) = StoryBible::from_state(&state) else {
            // Phase 1 did not complete, so there is nothing to continue from.
            report.failure = state.error;
            report.debug_output = state.debug_output;
            return Ok(report);
        };

        if !self.record_chapter(&mut report, &mut progress, &state).await? {
            return Ok(report);
        }
        let states = state
            .character_states
            .clone()
            .unwrap_or_else(|| bible.initial_states.clone());
        self.write_chapters(&bible, 1, states, report, true).await
    }

    /// Continues a story whose bible was persisted by an earlier run.
    /// `start` is the 0-based index of the first chapter to write.
    pub async fn resume(
        &self,
        bible: &StoryBible,
        start: usize,
        states: CharacterStates,
    ) -> Result<RunReport> {
        let total = bible.plot_outline.len();
        if start >= total {
            info!("All {} chapters are already written", total);
            return Ok(RunReport::default());
        }
        info!("Resuming at chapter {}/{}", start + 1, total);
        self.write_chapters(bible, start, states, RunReport::default(), false)
            .await
    }

    /// Writes chapters `start..` in order. Chapters already marked completed
    /// are skipped; the gate is asked only once this invocation has written
    /// a chapter.
    async fn write_chapters(
        &self,
        bible: &StoryBible,
        start: usize,
        mut states: CharacterStates,
        mut report: RunReport,
        mut wrote_any: bool,
    ) -> Result<RunReport> {
        let total = bible.plot_outline.len();
        let mut progress = self.store.load_progress().await?;

        for index in start..total {
            let number = index + 1;
            if progress.is_completed(number) {
                let scenes = self
                    .store
                    .load_chapter_scenes(number)
                    .await
                    .ok()
                    .flatten()
                    .map_or(0, |scenes| scenes.len());
                info!("Skipping completed chapter {} ({} scenes)", number, scenes);
                continue;
            }
            if wrote_any && !self.gate.should_continue(index, total) {
                info!("Stopping after chapter {} as requested", index);
                break;
            }

            states = self.load_previous_states(index, states).await;
            let state = bible.chapter_state(index, states.clone());
            let traversal = self.workflow().traverse(Node::PrepareChapter, state).await;
            wrote_any = true;

            if let Some(carried) = &traversal.state.character_states {
                states = carried.clone();
            }
            if !self
                .record_chapter(&mut report, &mut progress, &traversal.state)
                .await?
            {
                break;
            }
        }

        Ok(report)
    }

    /// States persisted by chapter `index` (1-based number of the previous
    /// chapter), or `fallback` when they cannot be read.
    async fn load_previous_states(
        &self,
        index: usize,
        fallback: CharacterStates,
    ) -> CharacterStates {
        if index == 0 {
            return fallback;
        }
        match self.store.load_chapter_state(index).await {
            Ok(Some(states)) => {
                info!("Loaded character state from chapter {}", index);
                states
            }
            Ok(None) => {
                warn!(
                    "No saved character state for chapter {}, using in-memory state",
                    index
                );
                fallback
            }
            Err(e) => {
                warn!(
                    "Could not load character state for chapter {}: {:#}. Using in-memory state",
                    index, e
                );
                fallback
            }
        }
    }

    /// Folds a finished chapter traversal into `report` and marks it in
    /// `progress` when it succeeded. Returns whether the run should go on.
    async fn record_chapter(
        &self,
        report: &mut RunReport,
        progress: &mut Progress,
        state: &RunState,
    ) -> Result<bool> {
        let number = state.current_chapter_index + 1;
        report.scenes_written += state.completed_chapter_prose.len();

        let go_on = match &state.error {
            None => {
                report.chapters_completed.push(number);
                progress.mark_completed(number);
                self.store.save_progress(progress).await?;
                true
            }
            Some(failure) if !failure.kind.is_fatal() => {
                warn!(
                    "Chapter {} ended early ({}), continuing with the next chapter",
                    number, failure
                );
                true
            }
            Some(failure) => {
                report.failure = Some(failure.clone());
                report.debug_output = state.debug_output.clone();
                false
            }
        };
        Ok(go_on)
    }
}
