//! Campaigns with real forked worker processes.
//!
//! Kept to a single test so no other test thread is running while the
//! campaign forks.

use statemgr::config::config::StateManagerConfig;
use statemgr::testing::program::PathEnd;
use statemgr::testing::{run_campaign, CampaignSpec};

fn spec(workers: usize, paths: Vec<PathEnd>) -> CampaignSpec {
    CampaignSpec {
        workers,
        paths,
        config: StateManagerConfig {
            timeout_secs: 0,
            poll_interval_ms: 5,
            max_processes: workers,
            ..Default::default()
        },
        max_steps: Some(100_000),
    }
}

#[test]
fn test_forked_campaigns() {
    // Successes spread over slots 0 and 2; slot 1 only exits.
    let outcome = run_campaign(&spec(
        3,
        vec![
            PathEnd::Succeed,
            PathEnd::Exit,
            PathEnd::Succeed,
            PathEnd::Succeed,
            PathEnd::Exit,
            PathEnd::Succeed,
        ],
    ))
    .unwrap();

    assert!(outcome.is_clean(), "unclean campaign: {:?}", outcome);
    assert_eq!(outcome.reports.len(), 3);
    assert_eq!(outcome.succeeded(), 4);
    assert_eq!(outcome.survivors(), 1);
    assert!(outcome.is_converged());
    assert!(!outcome.campaign_id.is_empty());

    // Both successes happen in slot 0 before the fork and are then dealt
    // to slots 1 and 2; slot 3 starts empty.
    let outcome = run_campaign(&spec(
        4,
        vec![PathEnd::Exit, PathEnd::Succeed, PathEnd::Succeed],
    ))
    .unwrap();
    assert!(outcome.is_clean(), "unclean campaign: {:?}", outcome);
    assert_eq!(outcome.reports.len(), 4);
    assert_eq!(outcome.succeeded(), 2);
    assert_eq!(outcome.survivors(), 1);
    assert!(outcome.is_converged());

    let outcome = run_campaign(&spec(2, vec![PathEnd::Exit, PathEnd::Exit, PathEnd::Exit])).unwrap();
    assert!(outcome.is_clean(), "unclean campaign: {:?}", outcome);
    assert_eq!(outcome.succeeded(), 0);
    assert_eq!(outcome.survivors(), 0);
    assert!(outcome.is_converged());
}
