use rtsync::inversion::{self, InversionConfig, LockStrategy};

#[test]
fn plain_lock_lets_medium_thread_delay_high() {
    let report = inversion::run(LockStrategy::Blocking, 11_000).unwrap();

    assert!(report.max_wait_h > 9_000, "H waited only {}", report.max_wait_h);
    assert!(report.threshold_exceeded >= 1);
}

#[test]
fn inheritance_bounds_high_wait() {
    let report = inversion::run(LockStrategy::Inheriting, 30_000).unwrap();

    assert!(report.max_wait_h <= InversionConfig::default().wait_threshold);
    assert_eq!(report.threshold_exceeded, 0);
    assert!(report.h_entries > 10);
    assert!(report.m_bursts >= 1);
}

#[test]
fn non_preemptible_section_bounds_release_latency() {
    let config = InversionConfig::default();
    let report = inversion::run(LockStrategy::NonPreemptible, 30_000).unwrap();

    assert_eq!(report.max_wait_h, 0);
    assert!(report.max_latency_h <= config.critical_section);
}

#[test]
fn inheritance_bound_ignores_medium_workload() {
    for medium_work in [1_000, 50_000] {
        let config = InversionConfig {
            medium_work,
            ..InversionConfig::default()
        };
        let critical_section = config.critical_section;
        let report = inversion::run_with(LockStrategy::Inheriting, 30_000, config).unwrap();

        assert!(
            report.max_wait_h <= critical_section,
            "medium_work {}: H waited {}",
            medium_work,
            report.max_wait_h
        );
        assert!(report.h_entries > 10);
    }
}
