//! Property tests for channel keys, classification and the race itself.

mod common;

use std::time::Duration;

use proptest::prelude::*;

use cancelable_worker::runtime::ScriptedWorkload;
use cancelable_worker::{channel_key, classify, OutcomeStatus, RaceBranch, Task, TaskError};

use common::Harness;

// ─── Strategies ─────────────────────────────────────────────────────────────

fn arb_branch() -> impl Strategy<Value = RaceBranch> {
    prop::sample::select(vec![RaceBranch::Completed, RaceBranch::Cancelled])
}

fn arb_error() -> impl Strategy<Value = Option<TaskError>> {
    proptest::option::of(prop_oneof![
        "[a-z ]{0,20}".prop_map(|message| TaskError::Start { message }),
        "[a-z ]{0,20}".prop_map(|message| TaskError::Runtime { message }),
        "[a-z ]{0,20}".prop_map(|message| TaskError::Termination { message }),
    ])
}

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap()
}

// ─── Channel keys ───────────────────────────────────────────────────────────

proptest! {
    /// Distinct task ids never share a channel.
    #[test]
    fn channel_key_is_injective(a in ".{0,24}", b in ".{0,24}") {
        prop_assume!(a != b);
        prop_assert_ne!(channel_key(&a), channel_key(&b));
    }

    /// The key is a pure function of the id.
    #[test]
    fn channel_key_is_deterministic(id in ".{0,24}") {
        prop_assert_eq!(channel_key(&id), channel_key(&id));
        prop_assert!(channel_key(&id).as_str().ends_with(id.as_str()));
    }
}

// ─── Classification ─────────────────────────────────────────────────────────

proptest! {
    /// The status encodes exactly the branch and whether an error was seen.
    #[test]
    fn classify_is_total_and_faithful(branch in arb_branch(), error in arb_error()) {
        let status = classify(branch, error.as_ref());
        prop_assert_eq!(status.branch(), branch);
        prop_assert_eq!(status.has_error(), error.is_some());
        prop_assert!(OutcomeStatus::ALL.contains(&status));
    }
}

// ─── Race ───────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Cancel before exit means CANCELLED; no cancel means FINISHED.
    #[test]
    fn cancel_before_exit_always_cancels(run_secs in 2u64..120, cancel_secs in 1u64..120) {
        prop_assume!(cancel_secs != run_secs);
        let status = paused_runtime().block_on(async move {
            let h = Harness::new();
            h.script("p", ScriptedWorkload::runs_for(Duration::from_secs(run_secs)));
            let executor = h.executor.clone();
            let handle = tokio::spawn(async move { executor.execute_task(&Task::demo("p")).await });

            tokio::time::sleep(Duration::from_secs(cancel_secs)).await;
            h.executor.request_cancellation("p").await;
            let status = handle.await.unwrap().status();
            prop_assert_eq!(h.runtime.calls("p").terminate, 1);
            Ok(status)
        })?;

        if cancel_secs < run_secs {
            prop_assert!(status.is_cancelled(), "{}", status);
        } else {
            prop_assert_eq!(status, OutcomeStatus::Finished);
        }
    }
}
