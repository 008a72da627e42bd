//! End-to-end sessions against a scripted text generator.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use prompt_refiner::prompts::TEMPLATE_HEADER;
use prompt_refiner::providers::{GenerationRequest, TextGenerator};
use prompt_refiner::refine::{
    RefineError, RefinementController, RefinementEvent, RefinementSettings, SessionOutcome, Stage,
    StopReason, Termination, FALLBACK_CRITIQUE,
};
use prompt_refiner::retrieval::{NoRetrieval, PromptTemplate, Retriever, TemplateIndex};
use prompt_refiner::storage::MemoryStore;

const INPUT: &str = "write a one-paragraph product description";

#[derive(Clone, Copy)]
enum ReviewMode {
    Approve,
    Reject,
    Malformed,
}

/// Answers each stage from its preamble and records every call.
struct Scripted {
    review: ReviewMode,
    /// 1-based Generate call that fails, if any.
    fail_generate_on: Option<usize>,
    calls: Mutex<Vec<(Stage, String)>>,
}

impl Scripted {
    fn new(review: ReviewMode) -> Self {
        Self {
            review,
            fail_generate_on: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn failing_generate(review: ReviewMode, call: usize) -> Self {
        Self {
            fail_generate_on: Some(call),
            ..Self::new(review)
        }
    }

    fn stage_of(request: &GenerationRequest) -> Stage {
        if request.system.contains("is_complete") {
            Stage::Reflect
        } else if request.system.contains("prompt engineer") {
            Stage::Generate
        } else {
            Stage::Analyze
        }
    }

    fn calls(&self) -> Vec<(Stage, String)> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, stage: Stage) -> usize {
        self.calls().iter().filter(|(s, _)| *s == stage).count()
    }
}

#[async_trait]
impl TextGenerator for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, RefineError> {
        let stage = Self::stage_of(request);
        let nth = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((stage, request.user.clone()));
            calls.iter().filter(|(s, _)| *s == stage).count()
        };

        match stage {
            Stage::Analyze => Ok("product description for an online store".into()),
            Stage::Generate => {
                if self.fail_generate_on == Some(nth) {
                    Err(RefineError::provider("scripted", "upstream returned 500"))
                } else {
                    Ok(format!("draft {nth}"))
                }
            }
            Stage::Reflect => Ok(match self.review {
                ReviewMode::Approve => r#"{"critique":"looks good","is_complete":true}"#.into(),
                ReviewMode::Reject => format!(r#"{{"critique":"needs work {nth}","is_complete":false}}"#),
                ReviewMode::Malformed => "I think it is fine {not json".into(),
            }),
        }
    }
}

struct Run {
    events: Vec<RefinementEvent>,
    outcome: SessionOutcome,
    store: Arc<MemoryStore>,
}

async fn run_session(generator: Arc<Scripted>, retriever: Arc<dyn Retriever>) -> Run {
    let store = Arc::new(MemoryStore::new());
    let controller = Arc::new(RefinementController::new(
        generator,
        retriever,
        store.clone(),
        RefinementSettings::default(),
    ));

    let session = controller.start(INPUT);
    let events = session.events.collect().await;
    let outcome = session.handle.join().await.unwrap();
    Run {
        events,
        outcome,
        store,
    }
}

fn started(events: &[RefinementEvent]) -> Vec<Stage> {
    events
        .iter()
        .filter_map(|e| match e {
            RefinementEvent::StageStart { stage } => Some(*stage),
            _ => None,
        })
        .collect()
}

fn ended(events: &[RefinementEvent]) -> Vec<(Stage, u32)> {
    events
        .iter()
        .filter_map(|e| match e {
            RefinementEvent::StageEnd { stage, snapshot } => Some((*stage, snapshot.iteration_count())),
            _ => None,
        })
        .collect()
}

fn assert_single_init_and_terminal(events: &[RefinementEvent]) {
    assert!(matches!(events.first(), Some(RefinementEvent::Init { .. })));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, RefinementEvent::Init { .. }))
            .count(),
        1
    );
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert!(events.last().map(|e| e.is_terminal()).unwrap_or(false));
}

#[tokio::test]
async fn approval_on_first_pass_runs_three_stages() {
    let generator = Arc::new(Scripted::new(ReviewMode::Approve));
    let run = run_session(generator.clone(), Arc::new(NoRetrieval)).await;

    assert_single_init_and_terminal(&run.events);
    assert_eq!(
        started(&run.events),
        vec![Stage::Analyze, Stage::Generate, Stage::Reflect]
    );
    assert_eq!(run.events.last(), Some(&RefinementEvent::Done));
    assert_eq!(
        run.outcome.termination,
        Termination::Completed(StopReason::Approved)
    );
    assert_eq!(run.outcome.state.iteration_count(), 3);
    assert_eq!(run.outcome.state.improved_text(), "draft 1");
    assert!(run.outcome.state.is_complete());
    assert_eq!(generator.calls().len(), 3);
}

#[tokio::test]
async fn never_approved_stops_at_step_bound() {
    let generator = Arc::new(Scripted::new(ReviewMode::Reject));
    let run = run_session(generator.clone(), Arc::new(NoRetrieval)).await;

    assert_single_init_and_terminal(&run.events);
    assert_eq!(
        started(&run.events),
        vec![
            Stage::Analyze,
            Stage::Generate,
            Stage::Reflect,
            Stage::Generate,
            Stage::Reflect,
            Stage::Generate,
            Stage::Reflect,
        ]
    );
    assert_eq!(run.events.last(), Some(&RefinementEvent::Done));
    assert_eq!(
        run.outcome.termination,
        Termination::Completed(StopReason::StepLimit)
    );
    assert_eq!(run.outcome.state.iteration_count(), 7);
    assert_eq!(run.outcome.state.improved_text(), "draft 3");
    assert_eq!(run.outcome.state.critique(), "needs work 3");
    assert!(!run.outcome.state.is_complete());
    assert_eq!(generator.count(Stage::Generate), 3);
}

#[tokio::test]
async fn critique_feeds_the_next_generate_pass() {
    let generator = Arc::new(Scripted::new(ReviewMode::Reject));
    run_session(generator.clone(), Arc::new(NoRetrieval)).await;

    let briefs: Vec<String> = generator
        .calls()
        .into_iter()
        .filter(|(s, _)| *s == Stage::Generate)
        .map(|(_, user)| user)
        .collect();
    assert!(!briefs[0].contains("needs work"));
    assert!(briefs[1].contains("needs work 1"));
    assert!(briefs[2].contains("needs work 2"));
    assert!(briefs.iter().all(|b| b.contains(INPUT)));
}

#[tokio::test]
async fn malformed_review_falls_back_every_round() {
    let generator = Arc::new(Scripted::new(ReviewMode::Malformed));
    let run = run_session(generator, Arc::new(NoRetrieval)).await;

    assert_single_init_and_terminal(&run.events);
    assert_eq!(started(&run.events).len(), 7);
    assert_eq!(run.events.last(), Some(&RefinementEvent::Done));
    assert!(!run
        .events
        .iter()
        .any(|e| matches!(e, RefinementEvent::Error { .. })));

    for event in &run.events {
        if let RefinementEvent::StageEnd {
            stage: Stage::Reflect,
            snapshot,
        } = event
        {
            assert_eq!(snapshot.critique(), FALLBACK_CRITIQUE);
            assert!(!snapshot.is_complete());
        }
    }
    assert_eq!(
        run.outcome.termination,
        Termination::Completed(StopReason::StepLimit)
    );
}

#[tokio::test]
async fn generate_failure_in_round_two_ends_with_error() {
    let generator = Arc::new(Scripted::failing_generate(ReviewMode::Reject, 2));
    let run = run_session(generator.clone(), Arc::new(NoRetrieval)).await;

    assert_single_init_and_terminal(&run.events);
    assert!(!run.events.contains(&RefinementEvent::Done));
    assert!(matches!(
        run.events.last(),
        Some(RefinementEvent::Error { message }) if message.contains("upstream returned 500")
    ));
    assert_eq!(
        started(&run.events),
        vec![Stage::Analyze, Stage::Generate, Stage::Reflect, Stage::Generate]
    );
    assert_eq!(ended(&run.events).len(), 3);
    assert_eq!(generator.count(Stage::Reflect), 1);
    assert!(matches!(run.outcome.termination, Termination::Failed(_)));
    assert_eq!(run.outcome.state.improved_text(), "draft 1");
}

#[tokio::test]
async fn iteration_count_increases_by_one_per_stage() {
    let generator = Arc::new(Scripted::new(ReviewMode::Reject));
    let run = run_session(generator, Arc::new(NoRetrieval)).await;

    let counts: Vec<u32> = ended(&run.events).into_iter().map(|(_, n)| n).collect();
    assert_eq!(counts, (1..=7).collect::<Vec<u32>>());
}

#[tokio::test]
async fn tokens_arrive_inside_generate_stages() {
    let generator = Arc::new(Scripted::new(ReviewMode::Approve));
    let run = run_session(generator, Arc::new(NoRetrieval)).await;

    let mut open: Option<Stage> = None;
    for event in &run.events {
        match event {
            RefinementEvent::StageStart { stage } => open = Some(*stage),
            RefinementEvent::StageEnd { .. } => open = None,
            RefinementEvent::Token { stage, text } => {
                assert_eq!(*stage, Stage::Generate);
                assert_eq!(open, Some(Stage::Generate));
                assert_eq!(text, "draft 1");
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn every_stage_is_checkpointed() {
    let generator = Arc::new(Scripted::new(ReviewMode::Reject));
    let run = run_session(generator, Arc::new(NoRetrieval)).await;

    let records = run.store.records();
    assert_eq!(records.len(), 7);
    assert_eq!(
        records.iter().map(|r| r.iteration_count).collect::<Vec<_>>(),
        (0..7).collect::<Vec<u32>>()
    );
    let last = records.last().unwrap();
    assert_eq!(last.stage, Stage::Reflect);
    assert_eq!(last.improved_text.as_deref(), Some("draft 3"));
    assert_eq!(last.critique.as_deref(), Some("needs work 3"));
    assert!(records[0].improved_text.is_none());
}

#[tokio::test]
async fn matched_template_is_used_and_reported() {
    let index = TemplateIndex::new(vec![
        PromptTemplate {
            intent: "product description for an online store".into(),
            template: "You are an e-commerce copywriter...".into(),
        },
        PromptTemplate {
            intent: "debug a python stack trace".into(),
            template: "You are a senior Python engineer...".into(),
        },
    ]);
    let generator = Arc::new(Scripted::new(ReviewMode::Approve));
    let run = run_session(generator.clone(), Arc::new(index)).await;

    assert_eq!(
        run.outcome.state.retrieval_match(),
        Some("product description for an online store")
    );
    let (_, brief) = generator
        .calls()
        .into_iter()
        .find(|(s, _)| *s == Stage::Generate)
        .unwrap();
    assert!(brief.contains(TEMPLATE_HEADER));
    assert!(brief.contains("e-commerce copywriter"));
}

/// Analyzes instantly, then never finishes a draft.
struct StallingGenerate;

#[async_trait]
impl TextGenerator for StallingGenerate {
    fn name(&self) -> &str {
        "stalling"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, RefineError> {
        if Scripted::stage_of(request) == Stage::Generate {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok("product description for an online store".into())
    }
}

#[tokio::test(start_paused = true)]
async fn generate_timeout_ends_session_with_error() {
    let store = Arc::new(MemoryStore::new());
    let settings = RefinementSettings {
        call_timeout: Duration::from_secs(30),
        ..RefinementSettings::default()
    };
    let controller = Arc::new(RefinementController::new(
        Arc::new(StallingGenerate),
        Arc::new(NoRetrieval),
        store.clone(),
        settings,
    ));

    let session = controller.start(INPUT);
    let events = session.events.collect().await;
    let outcome = session.handle.join().await.unwrap();

    assert_single_init_and_terminal(&events);
    assert!(!events.contains(&RefinementEvent::Done));
    assert_eq!(started(&events), vec![Stage::Analyze, Stage::Generate]);
    assert_eq!(ended(&events), vec![(Stage::Analyze, 1)]);
    assert_eq!(
        events.last(),
        Some(&RefinementEvent::Error {
            message: "generate timed out after 30s".into()
        })
    );
    assert!(matches!(outcome.termination, Termination::Failed(_)));
    assert_eq!(store.records().len(), 1);
}
