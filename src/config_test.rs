use anyhow::Result;

use crate::config::Config;

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("ROLE".into(), "member-scheduler".into()),
        ("STORAGE_DATA_PATH".into(), "/usr/local/pulse-dispatch/data".into()),
        ("GAP_SECONDS".into(), "45".into()),
        ("SHORT_LEAD_MINUTES".into(), "2".into()),
        ("MAX_HORIZON_DAYS".into(), "30".into()),
        ("ELECTION_INTERVAL_SECONDS".into(), "120".into()),
        ("LEASE_DURATION_SECONDS".into(), "360".into()),
        ("IGNORE_DELETE_TTL_SECONDS".into(), "60".into()),
    ])?;

    assert!(config.rust_log == "error", "unexpected value parsed for RUST_LOG, got {}, expected {}", config.rust_log, "error");
    assert!(
        config.role == "member-scheduler",
        "unexpected value parsed for ROLE, got {}, expected {}",
        config.role,
        "member-scheduler"
    );
    assert!(
        config.storage_data_path == "/usr/local/pulse-dispatch/data",
        "unexpected value parsed for STORAGE_DATA_PATH, got {}, expected {}",
        config.storage_data_path,
        "/usr/local/pulse-dispatch/data"
    );
    assert!(config.gap_seconds == 45, "unexpected value parsed for GAP_SECONDS, got {}, expected {}", config.gap_seconds, 45);
    assert!(
        config.short_lead_minutes == 2,
        "unexpected value parsed for SHORT_LEAD_MINUTES, got {}, expected {}",
        config.short_lead_minutes,
        2
    );
    assert!(
        config.max_horizon_days == 30,
        "unexpected value parsed for MAX_HORIZON_DAYS, got {}, expected {}",
        config.max_horizon_days,
        30
    );
    assert!(
        config.election_interval_seconds == 120,
        "unexpected value parsed for ELECTION_INTERVAL_SECONDS, got {}, expected {}",
        config.election_interval_seconds,
        120
    );
    assert!(
        config.lease_duration_seconds == 360,
        "unexpected value parsed for LEASE_DURATION_SECONDS, got {}, expected {}",
        config.lease_duration_seconds,
        360
    );
    assert!(
        config.ignore_delete_ttl_seconds == 60,
        "unexpected value parsed for IGNORE_DELETE_TTL_SECONDS, got {}, expected {}",
        config.ignore_delete_ttl_seconds,
        60
    );

    Ok(())
}

#[test]
fn config_deserializes_from_sparse_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("ROLE".into(), "member-scheduler".into()),
        ("STORAGE_DATA_PATH".into(), "/usr/local/pulse-dispatch/data".into()),
    ])?;

    assert!(config.gap_seconds == 30, "unexpected default for GAP_SECONDS, got {}, expected {}", config.gap_seconds, 30);
    assert!(
        config.short_lead_minutes == 1,
        "unexpected default for SHORT_LEAD_MINUTES, got {}, expected {}",
        config.short_lead_minutes,
        1
    );
    assert!(
        config.max_horizon_days == 60,
        "unexpected default for MAX_HORIZON_DAYS, got {}, expected {}",
        config.max_horizon_days,
        60
    );
    assert!(
        config.election_interval_seconds == 60,
        "unexpected default for ELECTION_INTERVAL_SECONDS, got {}, expected {}",
        config.election_interval_seconds,
        60
    );
    assert!(
        config.lease_duration_seconds == 180,
        "unexpected default for LEASE_DURATION_SECONDS, got {}, expected {}",
        config.lease_duration_seconds,
        180
    );
    assert!(
        config.ignore_delete_ttl_seconds == 300,
        "unexpected default for IGNORE_DELETE_TTL_SECONDS, got {}, expected {}",
        config.ignore_delete_ttl_seconds,
        300
    );

    Ok(())
}

#[test]
fn config_requires_lease_longer_than_election_interval() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("ROLE".into(), "member-scheduler".into()),
        ("ELECTION_INTERVAL_SECONDS".into(), "300".into()),
        ("LEASE_DURATION_SECONDS".into(), "180".into()),
    ])?;

    let res = config.validate();
    assert!(res.is_err(), "expected validation error for lease shorter than election interval, got {:?}", res);

    Ok(())
}
