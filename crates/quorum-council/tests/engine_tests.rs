// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! End-to-end council engine tests against the scriptable mock launcher.

use std::sync::Arc;
use std::time::Duration;

use quorum_config::CreditConfig;
use quorum_core::approvals::ApprovalManager;
use quorum_core::credits::CreditService;
use quorum_core::mock::MockLauncher;
use quorum_core::process::{ChildLauncher, ProcessManager};
use quorum_council::{CouncilEngine, CouncilError};
use quorum_db::{AgentRow, CouncilRole, CouncilRow, CouncilStage, Store};

struct Fixture {
    store: Arc<Store>,
    launcher: Arc<MockLauncher>,
    engine: Arc<CouncilEngine>,
}

fn fixture() -> Fixture {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let launcher = Arc::new(MockLauncher::new());
    let mgr = ProcessManager::new(
        Arc::clone(&store),
        Arc::clone(&launcher) as Arc<dyn ChildLauncher>,
        Arc::new(ApprovalManager::new()),
        Arc::new(CreditService::new(
            Arc::clone(&store),
            CreditConfig::default(),
        )),
        Duration::from_secs(3600),
    );
    let engine = CouncilEngine::new(Arc::clone(&store), mgr);
    Fixture {
        store,
        launcher,
        engine,
    }
}

fn seed_agents(store: &Store, n: usize) -> Vec<String> {
    (0..n)
        .map(|i| {
            let id = format!("agent-{i}");
            store
                .create_agent(&AgentRow {
                    id: id.clone(),
                    name: format!("Agent {i}"),
                    model: String::new(),
                    default_project_id: None,
                    wallet_address: None,
                    algochat_enabled: true,
                    algochat_auto: false,
                    tool_permissions: None,
                    created_at: String::new(),
                })
                .unwrap();
            id
        })
        .collect()
}

fn seed_council(
    store: &Store,
    members: &[String],
    chairman: Option<&str>,
    rounds: u32,
) -> CouncilRow {
    let council = CouncilRow {
        id: "c1".to_string(),
        name: "Review Board".to_string(),
        description: String::new(),
        member_agent_ids: members.to_vec(),
        chairman_agent_id: chairman.map(str::to_string),
        discussion_rounds: rounds,
        created_at: String::new(),
    };
    store.create_council(&council).unwrap();
    council
}

/// Poll until `check` passes or a generous (virtual) deadline lapses.
async fn wait_until<F: Fn() -> bool>(check: F) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

async fn finish_member(f: &Fixture, session_id: &str, text: &str) {
    let child = f.launcher.handle(session_id);
    if !text.is_empty() {
        child
            .send_line(&format!(
                r#"{{"type":"assistant","message":{{"content":[{{"type":"text","text":"{text}"}}]}}}}"#
            ))
            .await;
    }
    child.send_line(r#"{"type":"session_exited","code":0}"#).await;
}

fn launch_stage(f: &Fixture, launch_id: &str) -> CouncilStage {
    f.store.get_launch(launch_id).unwrap().stage
}

#[tokio::test(start_paused = true)]
async fn launch_spawns_one_member_session_per_agent() {
    let f = fixture();
    let members = seed_agents(&f.store, 3);
    seed_council(&f.store, &members, None, 0);

    let started = f.engine.launch("c1", None, "What should we build?").await.unwrap();
    assert_eq!(started.session_ids.len(), 3);
    assert_eq!(launch_stage(&f, &started.launch_id), CouncilStage::Responding);

    let sessions = f.store.sessions_for_launch(&started.launch_id).unwrap();
    assert!(sessions
        .iter()
        .all(|s| s.council_role == Some(CouncilRole::Member)));
    // Every member got the identical prompt.
    for s in &sessions {
        let msgs = f.store.session_messages(&s.id).unwrap();
        assert_eq!(msgs[0].content, "What should we build?");
    }
}

#[tokio::test(start_paused = true)]
async fn unknown_council_is_404() {
    let f = fixture();
    let err = f.engine.launch("ghost", None, "q").await.unwrap_err();
    assert!(matches!(err, CouncilError::CouncilNotFound));
    assert_eq!(err.status(), 404);
}

#[tokio::test(start_paused = true)]
async fn chairman_outside_member_set_is_rejected() {
    let f = fixture();
    let members = seed_agents(&f.store, 2);
    seed_council(&f.store, &members, Some("outsider"), 0);
    let err = f.engine.launch("c1", None, "q").await.unwrap_err();
    assert!(matches!(err, CouncilError::ChairmanNotMember));
    assert_eq!(err.status(), 400);
}

#[tokio::test(start_paused = true)]
async fn review_prompts_exclude_each_reviewers_own_response() {
    let f = fixture();
    let members = seed_agents(&f.store, 3);
    seed_council(&f.store, &members, None, 0);
    let started = f.engine.launch("c1", None, "the question").await.unwrap();

    for (i, sid) in started.session_ids.iter().enumerate() {
        finish_member(&f, sid, &format!("Unique response {i}")).await;
    }

    // Members drained ⇒ auto-advance to review.
    wait_until(|| launch_stage(&f, &started.launch_id) == CouncilStage::Reviewing).await;
    let sessions = f.store.sessions_for_launch(&started.launch_id).unwrap();
    let reviewers: Vec<_> = sessions
        .iter()
        .filter(|s| s.council_role == Some(CouncilRole::Reviewer))
        .collect();
    assert_eq!(reviewers.len(), 3);

    let reviewer0 = reviewers.iter().find(|s| s.agent_id == "agent-0").unwrap();
    let prompt = &f.store.session_messages(&reviewer0.id).unwrap()[0].content;
    assert!(prompt.contains("Unique response 1"));
    assert!(prompt.contains("Unique response 2"));
    assert!(!prompt.contains("Unique response 0"));
}

#[tokio::test(start_paused = true)]
async fn aggregated_finish_with_no_responses_writes_fixed_string() {
    let f = fixture();
    let members = seed_agents(&f.store, 2);
    seed_council(&f.store, &members, None, 0);
    let started = f.engine.launch("c1", None, "q").await.unwrap();

    f.engine
        .finish_with_aggregated_synthesis(&started.launch_id)
        .unwrap();
    let launch = f.store.get_launch(&started.launch_id).unwrap();
    assert_eq!(launch.stage, CouncilStage::Complete);
    assert_eq!(
        launch.synthesis.as_deref(),
        Some("(No responses were produced by council members)")
    );
}

#[tokio::test(start_paused = true)]
async fn full_pipeline_chairman_synthesis() {
    let f = fixture();
    let members = seed_agents(&f.store, 2);
    seed_council(&f.store, &members, Some("agent-0"), 0);
    let started = f.engine.launch("c1", None, "meaning of life?").await.unwrap();

    for (i, sid) in started.session_ids.iter().enumerate() {
        finish_member(&f, sid, &format!("member view {i}")).await;
    }

    wait_until(|| launch_stage(&f, &started.launch_id) == CouncilStage::Reviewing).await;
    let reviewer_ids: Vec<String> = f
        .store
        .sessions_for_launch(&started.launch_id)
        .unwrap()
        .into_iter()
        .filter(|s| s.council_role == Some(CouncilRole::Reviewer))
        .map(|s| s.id)
        .collect();
    for (i, sid) in reviewer_ids.iter().enumerate() {
        finish_member(&f, sid, &format!("review view {i}")).await;
    }

    // Reviewers drained ⇒ chairman synthesis session.
    wait_until(|| launch_stage(&f, &started.launch_id) == CouncilStage::Synthesizing).await;
    let chairman = f
        .store
        .sessions_for_launch(&started.launch_id)
        .unwrap()
        .into_iter()
        .find(|s| s.council_role == Some(CouncilRole::Chairman))
        .expect("chairman session");
    assert_eq!(chairman.agent_id, "agent-0");

    finish_member(&f, &chairman.id, "The final synthesized answer is 42.").await;
    wait_until(|| launch_stage(&f, &started.launch_id) == CouncilStage::Complete).await;

    let launch = f.store.get_launch(&started.launch_id).unwrap();
    assert_eq!(
        launch.synthesis.as_deref(),
        Some("The final synthesized answer is 42.")
    );
}

#[tokio::test(start_paused = true)]
async fn discussion_rounds_run_before_review() {
    let f = fixture();
    let members = seed_agents(&f.store, 2);
    seed_council(&f.store, &members, None, 1);
    let started = f.engine.launch("c1", None, "debate this").await.unwrap();

    for (i, sid) in started.session_ids.iter().enumerate() {
        finish_member(&f, sid, &format!("opening {i}")).await;
    }

    // One discussion round follows the initial responses.
    wait_until(|| launch_stage(&f, &started.launch_id) == CouncilStage::Discussing).await;
    let round_ids: Vec<String> = f
        .store
        .sessions_for_launch(&started.launch_id)
        .unwrap()
        .into_iter()
        .filter(|s| {
            s.council_role == Some(CouncilRole::Member)
                && !started.session_ids.contains(&s.id)
        })
        .map(|s| s.id)
        .collect();
    assert_eq!(round_ids.len(), 2);

    // The round prompt carries the opening statements.
    let prompt = &f.store.session_messages(&round_ids[0]).unwrap()[0].content;
    assert!(prompt.contains("opening 0"));
    assert!(prompt.contains("opening 1"));

    for (i, sid) in round_ids.iter().enumerate() {
        finish_member(&f, sid, &format!("rebuttal {i}")).await;
    }

    // Round recorded, then review.
    wait_until(|| launch_stage(&f, &started.launch_id) == CouncilStage::Reviewing).await;
    let discussion = f.store.discussion_messages(&started.launch_id).unwrap();
    assert_eq!(discussion.len(), 2);
    assert!(discussion.iter().all(|m| m.round == 1));
    assert!(discussion.iter().any(|m| m.content == "rebuttal 0"));
}

#[tokio::test(start_paused = true)]
async fn review_from_terminal_stage_is_stage_violation() {
    let f = fixture();
    let members = seed_agents(&f.store, 2);
    seed_council(&f.store, &members, None, 0);
    let started = f.engine.launch("c1", None, "q").await.unwrap();
    f.engine
        .finish_with_aggregated_synthesis(&started.launch_id)
        .unwrap();

    let err = f.engine.trigger_review(&started.launch_id).await.unwrap_err();
    assert_eq!(err.status(), 400);
    assert!(err
        .to_string()
        .starts_with("Cannot start review from stage"));
}

#[tokio::test(start_paused = true)]
async fn synthesis_without_chairman_is_rejected() {
    let f = fixture();
    let members = seed_agents(&f.store, 2);
    seed_council(&f.store, &members, None, 0);
    let started = f.engine.launch("c1", None, "q").await.unwrap();

    // Force the launch into reviewing without driving the members.
    f.store
        .set_launch_stage(&started.launch_id, CouncilStage::Reviewing)
        .unwrap();
    let err = f
        .engine
        .trigger_synthesis(&started.launch_id, false, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CouncilError::NoChairman));
    assert!(err.to_string().contains("no chairman"));
}

#[tokio::test(start_paused = true)]
async fn synthesis_from_wrong_stage_is_rejected() {
    let f = fixture();
    let members = seed_agents(&f.store, 2);
    seed_council(&f.store, &members, Some("agent-0"), 0);
    let started = f.engine.launch("c1", None, "q").await.unwrap();

    let err = f
        .engine
        .trigger_synthesis(&started.launch_id, false, None)
        .await
        .unwrap_err();
    assert!(err.to_string().starts_with("Cannot synthesize from stage"));
}

#[tokio::test(start_paused = true)]
async fn spawn_failures_do_not_roll_back_the_stage() {
    let f = fixture();
    let members = seed_agents(&f.store, 2);
    seed_council(&f.store, &members, None, 0);

    f.launcher.fail_next_spawn();
    let started = f.engine.launch("c1", None, "q").await.unwrap();
    // One member failed to spawn; the launch proceeds with the survivor.
    assert_eq!(started.session_ids.len(), 1);
    assert_eq!(launch_stage(&f, &started.launch_id), CouncilStage::Responding);
}
