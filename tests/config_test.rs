use batchq::config::secrets::ExposeSecret;
use batchq::config::{Config, QueueOptions};
use batchq::model::Order;

#[test]
fn empty_toml_gives_defaults() {
    let config = Config::from_toml_str("").unwrap();
    assert_eq!(config.log_level, "info");
    assert!(config.otel_endpoint.is_none());

    let q = &config.queue;
    assert_eq!(q.batch_size, 1);
    assert_eq!(q.concurrent, 1);
    assert_eq!(q.order, Order::Fifo);
    assert_eq!(q.max_retries, 0);
    assert!(q.max_timeout().is_none());
    assert!(q.auto_resume);
    assert_eq!(q.store.kind, "memory");
    assert_eq!(q.store.table, "tasks");
}

#[test]
fn toml_sets_queue_and_store() {
    let config = Config::from_toml_str(
        r#"
        log_level = "debug"

        [queue]
        batch_size = 10
        batch_delay_ms = 250
        concurrent = 4
        order = "lifo"
        max_timeout_ms = 30000
        max_retries = 2

        [queue.store]
        kind = "postgres"
        url = "postgres://queue:hunter2@db/queue"
        table = "jobs"
        "#,
    )
    .unwrap();

    let q = &config.queue;
    assert_eq!(config.log_level, "debug");
    assert_eq!(q.batch_size, 10);
    assert_eq!(q.batch_delay().as_millis(), 250);
    assert_eq!(q.concurrent, 4);
    assert_eq!(q.order, Order::Filo);
    assert_eq!(q.max_timeout().map(|d| d.as_secs()), Some(30));
    assert_eq!(q.max_retries, 2);
    assert_eq!(q.store.kind, "postgres");
    assert_eq!(q.store.table, "jobs");

    let url = q.store.url.as_ref().unwrap();
    assert_eq!(url.expose_secret(), "postgres://queue:hunter2@db/queue");
    assert!(!format!("{:?}", q.store).contains("hunter2"));
}

#[test]
fn unknown_queue_fields_are_rejected() {
    let err = Config::from_toml_str("[queue]\nbatch_sise = 3\n").unwrap_err();
    assert!(err.to_string().contains("batch_sise"));
}

#[test]
fn validate_rejects_zero_sizes() {
    assert!(QueueOptions::default().validate().is_ok());
    for options in [
        QueueOptions {
            batch_size: 0,
            ..QueueOptions::default()
        },
        QueueOptions {
            concurrent: 0,
            ..QueueOptions::default()
        },
    ] {
        assert!(matches!(options.validate(), Err(batchq::Error::Config(_))));
    }
}

#[test]
fn config_file_is_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("batchq.toml");
    std::fs::write(&path, "[queue]\nconcurrent = 3\n").unwrap();
    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.queue.concurrent, 3);

    assert!(matches!(
        Config::from_file(dir.path().join("missing.toml")),
        Err(batchq::Error::Io(_))
    ));
}

// Environment variables are process-wide, so every env case lives in this
// one test.
#[test]
fn environment_overrides() {
    unsafe {
        std::env::set_var("BATCHQ_BATCH_SIZE", "8");
        std::env::set_var("BATCHQ_ORDER", "filo");
        std::env::set_var("BATCHQ_STORE", "sqlite");
        std::env::set_var("BATCHQ_STORE_PATH", "/tmp/batchq.db");
        std::env::set_var("LOG_LEVEL", "trace");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.queue.batch_size, 8);
    assert_eq!(config.queue.order, Order::Filo);
    assert_eq!(config.queue.store.kind, "sqlite");
    assert_eq!(config.queue.store.path.as_deref(), Some("/tmp/batchq.db"));
    assert_eq!(config.log_level, "trace");

    unsafe {
        std::env::set_var("BATCHQ_BATCH_SIZE", "many");
    }
    assert!(matches!(Config::from_env(), Err(batchq::Error::Config(_))));

    unsafe {
        std::env::set_var("BATCHQ_BATCH_SIZE", "0");
    }
    assert!(matches!(Config::from_env(), Err(batchq::Error::Config(_))));

    unsafe {
        std::env::set_var("BATCHQ_BATCH_SIZE", "4");
        std::env::set_var("BATCHQ_ORDER", "random");
    }
    assert!(matches!(Config::from_env(), Err(batchq::Error::Config(_))));

    unsafe {
        for name in [
            "BATCHQ_BATCH_SIZE",
            "BATCHQ_ORDER",
            "BATCHQ_STORE",
            "BATCHQ_STORE_PATH",
            "LOG_LEVEL",
        ] {
            std::env::remove_var(name);
        }
    }
}
