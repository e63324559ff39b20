//! End-to-end plan execution with the real file-mode executor.
//!
//! Scripts are POSIX shell so the tests need only `sh`; collaborators and the
//! operator are scripted.

#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::time::Duration;

use stepwise::core::dependency::MissingDependency;
use stepwise::core::marker::DEFAULT_MARKER;
use stepwise::core::types::FailureKind;
use stepwise::engine::{
    AdvanceOutcome, Collaborators, EngineOptions, RecoveryDecision, RecoveryOutcome, StepEngine,
};
use stepwise::executor::ScriptExecutor;
use stepwise::io::artifacts::ArtifactStore;
use stepwise::io::installer::DependencyResolver;
use stepwise::io::interrupt::Interrupt;
use stepwise::io::system::SystemInfo;
use stepwise::signal::{SignalDetector, SignalOutcome};
use stepwise::test_support::{ScriptedAnalysis, ScriptedCodeGen, ScriptedOperator};

fn engine(dir: &Path) -> StepEngine {
    StepEngine::new(
        ArtifactStore::new(dir, "stepwise", "sh", "#"),
        SignalDetector::new(DEFAULT_MARKER),
        EngineOptions {
            comment_prefix: "#".to_string(),
            language: "POSIX shell".to_string(),
        },
        SystemInfo::detect(),
    )
}

fn executor(installer: &[&str]) -> ScriptExecutor {
    let resolver = DependencyResolver::new(
        MissingDependency::default(),
        installer.iter().map(|s| s.to_string()).collect(),
        Duration::from_secs(10),
    );
    ScriptExecutor::new(
        vec!["sh".to_string()],
        Vec::new(),
        "POSIX shell",
        resolver,
        Interrupt::new(),
    )
    .expect("executor")
}

fn advance(
    engine: &mut StepEngine,
    codegen: &ScriptedCodeGen,
    executor: &ScriptExecutor,
    analysis: &ScriptedAnalysis,
    operator: &mut ScriptedOperator,
) -> AdvanceOutcome {
    let mut collab = Collaborators {
        codegen,
        analysis,
        executor,
        operator,
    };
    engine.advance(&mut collab).expect("advance")
}

#[test]
fn additive_plan_builds_one_script_and_signals_an_image() {
    let temp = tempfile::tempdir().expect("tempdir");
    let shot = temp.path().join("shot.png");
    let mut engine = engine(temp.path());
    engine
        .load_plan(
            "make a picture",
            "1. Task: Create the image\n2. Task: Report the image\n   Additive_Code: Yes\n   Screenshot_Analysis_Signal: Yes\n",
        )
        .expect("plan");
    engine.confirm_plan().expect("confirm");

    let codegen = ScriptedCodeGen::new()
        .respond(&format!("printf png > '{}'", shot.display()))
        .respond(&format!("echo '{DEFAULT_MARKER} {}'", shot.display()));
    let executor = executor(&["true"]);
    let analysis = ScriptedAnalysis::new().answer("a tiny image");
    let mut operator = ScriptedOperator::new();

    let first = advance(&mut engine, &codegen, &executor, &analysis, &mut operator);
    assert_eq!(
        first,
        AdvanceOutcome::StepSucceeded {
            index: 0,
            signal: SignalOutcome::NoDispatch
        }
    );
    let target = engine.target().expect("target").to_path_buf();

    let second = advance(&mut engine, &codegen, &executor, &analysis, &mut operator);
    assert_eq!(
        second,
        AdvanceOutcome::StepSucceeded {
            index: 1,
            signal: SignalOutcome::Dispatched {
                path: shot.clone(),
                description: "a tiny image".to_string()
            }
        }
    );
    assert_eq!(engine.target(), Some(target.as_path()));
    let script = fs::read_to_string(&target).expect("read artifact");
    assert!(script.starts_with("# stepwise: step 1/2: Create the image\n"));
    assert!(script.contains("# stepwise: step 2/2: Report the image\n"));
    assert_eq!(analysis.requests().len(), 1);

    assert_eq!(
        advance(&mut engine, &codegen, &executor, &analysis, &mut operator),
        AdvanceOutcome::Completed
    );
}

#[test]
fn failing_step_is_repaired_then_verified() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut engine = engine(temp.path());
    engine
        .load_plan("say ok", "1. Task: Print ok\n")
        .expect("plan");
    engine.confirm_plan().expect("confirm");

    let codegen = ScriptedCodeGen::new()
        .respond("echo broken >&2; exit 3")
        .respond("echo ok");
    let executor = executor(&["true"]);
    let analysis = ScriptedAnalysis::new();
    let mut operator = ScriptedOperator::new();

    let outcome = advance(&mut engine, &codegen, &executor, &analysis, &mut operator);
    assert!(matches!(outcome, AdvanceOutcome::StepSucceeded { index: 0, .. }));
    assert_eq!(engine.buffer(), "echo ok");
    let requests = codegen.requests();
    assert_eq!(requests.len(), 2);
    assert!(
        requests[1]
            .error_feedback
            .as_deref()
            .is_some_and(|e| e.contains("broken"))
    );
}

#[test]
fn unrepaired_failure_waits_for_decision_then_skip_ends_plan() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut engine = engine(temp.path());
    engine
        .load_plan("fail", "1. Task: Always fail\n")
        .expect("plan");
    engine.confirm_plan().expect("confirm");

    // The repair round returns nothing, so no fix is adopted.
    let codegen = ScriptedCodeGen::new().respond("exit 4").respond("");
    let executor = executor(&["true"]);
    let analysis = ScriptedAnalysis::new();
    let mut operator = ScriptedOperator::new();

    let outcome = advance(&mut engine, &codegen, &executor, &analysis, &mut operator);
    assert!(matches!(outcome, AdvanceOutcome::Failed { index: 0, .. }));
    let failure = engine.plan().and_then(|p| p.failure.clone()).expect("failure");
    assert_eq!(failure.kind, FailureKind::Runtime);
    assert!(failure.code_snapshot.contains("exit 4"));

    assert_eq!(
        engine.recover(RecoveryDecision::Skip).expect("skip"),
        RecoveryOutcome::EndedViaSkip
    );
    assert!(engine.plan().is_none());
}

#[test]
fn installed_dependency_reruns_the_same_step() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut engine = engine(temp.path());
    engine
        .load_plan("fetch", "1. Task: Fetch a page\n")
        .expect("plan");
    engine.confirm_plan().expect("confirm");

    let codegen = ScriptedCodeGen::new()
        .respond("echo \"ModuleNotFoundError: No module named 'requests'\" >&2; exit 1")
        .respond("echo fetched");
    let executor = executor(&["true"]);
    let analysis = ScriptedAnalysis::new();
    let mut operator = ScriptedOperator::new().then_confirm(true);

    let outcome = advance(&mut engine, &codegen, &executor, &analysis, &mut operator);
    assert_eq!(
        outcome,
        AdvanceOutcome::RetryAfterInstall {
            index: 0,
            module: "requests".to_string()
        }
    );
    let plan = engine.plan().expect("plan");
    assert_eq!(plan.current_index, 0);
    assert!(plan.failure.is_none());

    let retried = advance(&mut engine, &codegen, &executor, &analysis, &mut operator);
    assert!(matches!(retried, AdvanceOutcome::StepSucceeded { index: 0, .. }));
    assert_eq!(codegen.requests().len(), 2);
}
