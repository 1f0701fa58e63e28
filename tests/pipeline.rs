//! End-to-end tests of the delivery pipeline: a real host server and real
//! agents talking mutually-authenticated TLS over localhost, backed by
//! in-memory SQLite stores.

use std::{
    net::{IpAddr, Ipv4Addr},
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use fleetlog::{
    agent::Agent,
    certificate,
    config::{agent as agent_config, host as host_config},
    database::{
        connect_sqlite_in_memory,
        host::{count_logs, LogRepository, Service, ServiceRepository},
        DatabaseLocation, SqlitePool,
    },
    host::Host,
    log::Record,
};

const PASSWORD: &str = "testpassword";
const VALIDITY: Duration = Duration::from_secs(60 * 60);

struct TestHost {
    port: u16,
    pool: SqlitePool,
    stop: tokio::sync::oneshot::Sender<()>,
    served: tokio::task::JoinHandle<()>,
}

impl TestHost {
    /// Spin up a host on an OS-assigned port (or a specific one when
    /// restarting) against the given store.
    async fn start(dir: &Path, pool: SqlitePool, port: u16) -> TestHost {
        let config = host_config::Config {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            certificate: dir.join("host.cert.pem"),
            private_key: dir.join("host.key.pem"),
            password: PASSWORD.to_string(),
            database: None,
            read_timeout: None,
        };
        certificate::ensure(&config.certificate, &config.private_key, VALIDITY)
            .await
            .unwrap();

        let host = Arc::new(Host::new(
            config,
            Arc::new(pool.clone()) as Arc<dyn ServiceRepository>,
            Arc::new(pool.clone()) as Arc<dyn LogRepository>,
        ));

        let (listener, acceptor) = host.listen().await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (errors, mut error_rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(error) = error_rx.recv().await {
                eprintln!("host error: {}", error);
            }
        });

        let (stop, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let served = tokio::spawn(async move {
            host.serve(listener, acceptor, errors, async {
                stop_rx.await.ok();
            })
            .await;
        });

        TestHost {
            port,
            pool,
            stop,
            served,
        }
    }

    fn endpoint(&self) -> String {
        format!("localhost:{}", self.port)
    }

    async fn shutdown(self) -> (SqlitePool, u16) {
        self.stop.send(()).ok();
        self.served.await.ok();
        (self.pool, self.port)
    }

    async fn service(&self, machine: &str, name: &str) -> Option<Service> {
        self.pool.get_by_name(machine, name).await.unwrap()
    }
}

async fn migrated_pool() -> SqlitePool {
    let pool = connect_sqlite_in_memory().await.unwrap();
    ServiceRepository::migrate(&pool).await.unwrap();
    pool
}

fn agent_settings(
    dir: &Path,
    endpoint: String,
    machine: &str,
    service: &str,
    password: &str,
) -> agent_config::Config {
    agent_config::Config {
        endpoint,
        certificate: dir.join("agent.cert.pem"),
        private_key: dir.join("agent.key.pem"),
        machine: machine.to_string(),
        service: service.to_string(),
        password: password.to_string(),
        wait_duration: Duration::from_millis(100),
        heartbeat_duration: Duration::from_millis(100),
        spool: Some(DatabaseLocation::Ephemeral),
    }
}

fn error_sink_for_test() -> fleetlog::agent::ErrorSink {
    let (errors, mut error_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(error) = error_rx.recv().await {
            eprintln!("agent error: {}", error);
        }
    });
    errors
}

async fn eventually<F, Fut>(what: &str, deadline: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let started = Instant::now();
    while started.elapsed() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for: {}", what);
}

#[tokio::test]
async fn delivers_a_log_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let host = TestHost::start(dir.path(), migrated_pool().await, 0).await;

    let agent = Arc::new(Agent::new(agent_settings(
        dir.path(),
        host.endpoint(),
        "M1",
        "S1",
        PASSWORD,
    )));
    let errors = error_sink_for_test();
    agent.start(&errors).await.unwrap();
    let supervisor = {
        let agent = Arc::clone(&agent);
        let errors = errors.clone();
        tokio::spawn(async move { agent.run(errors).await })
    };

    let written = agent
        .handle(&Record::new("X", "hello").with_context(serde_json::json!({"a": 1})))
        .await
        .unwrap();
    assert!(written > 0);

    let service = host.service("M1", "S1").await.expect("service registered");
    let pool = host.pool.clone();
    let service_id = service.id;
    eventually("log row to arrive", Duration::from_secs(3), || {
        let pool = pool.clone();
        async move { count_logs(&pool, service_id).await.unwrap() == 1 }
    })
    .await;

    let agent_for_check = Arc::clone(&agent);
    eventually("spool to drain", Duration::from_secs(3), move || {
        let agent = Arc::clone(&agent_for_check);
        async move { agent.pending().await.unwrap() == 0 }
    })
    .await;

    // Heartbeats advance liveness while the agent stays up.
    let seen_before = host.service("M1", "S1").await.unwrap().last_seen;
    let host_ref = &host;
    eventually("last_seen to advance", Duration::from_secs(3), || async {
        host_ref.service("M1", "S1").await.unwrap().last_seen > seen_before
    })
    .await;

    agent.close().await;
    supervisor.await.ok();
    host.shutdown().await;
}

#[tokio::test]
async fn wrong_password_is_rejected_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let host = TestHost::start(dir.path(), migrated_pool().await, 0).await;

    let agent = Agent::new(agent_settings(
        dir.path(),
        host.endpoint(),
        "M1",
        "S1",
        "notrightpassword",
    ));
    let errors = error_sink_for_test();

    let error = agent.start(&errors).await.unwrap_err();
    assert!(
        error.to_string().contains("Registration error"),
        "unexpected error: {}",
        error
    );

    // No identity was created for the rejected client.
    assert!(host.service("M1", "S1").await.is_none());

    agent.close().await;
    host.shutdown().await;
}

#[tokio::test]
async fn renaming_keeps_one_row_per_certificate() {
    let dir = tempfile::tempdir().unwrap();
    let host = TestHost::start(dir.path(), migrated_pool().await, 0).await;
    let errors = error_sink_for_test();

    // First run registers as (M1, S1).
    let first = Agent::new(agent_settings(
        dir.path(),
        host.endpoint(),
        "M1",
        "S1",
        PASSWORD,
    ));
    first.start(&errors).await.unwrap();
    first.close().await;

    // A restart with the same certificate but a new service label renames
    // the existing row.
    let second = Agent::new(agent_settings(
        dir.path(),
        host.endpoint(),
        "M1",
        "S2",
        PASSWORD,
    ));
    second.start(&errors).await.unwrap();
    second.close().await;

    assert!(host.service("M1", "S1").await.is_none());
    let renamed = host.service("M1", "S2").await.expect("renamed service");

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM services")
        .fetch_one(&host.pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
    assert_ne!(renamed.id, 0);

    host.shutdown().await;
}

#[tokio::test]
async fn new_certificate_rebinds_an_existing_identity() {
    let dir = tempfile::tempdir().unwrap();
    let host = TestHost::start(dir.path(), migrated_pool().await, 0).await;
    let errors = error_sink_for_test();

    let first_dir = dir.path().join("first");
    let second_dir = dir.path().join("second");
    std::fs::create_dir_all(&first_dir).unwrap();
    std::fs::create_dir_all(&second_dir).unwrap();

    let first = Agent::new(agent_settings(
        &first_dir,
        host.endpoint(),
        "M1",
        "S1",
        PASSWORD,
    ));
    first.start(&errors).await.unwrap();
    let original = host.service("M1", "S1").await.unwrap();
    first.close().await;

    // Same identity, different keypair: the row keeps its id and takes the
    // new fingerprint.
    let second = Arc::new(Agent::new(agent_settings(
        &second_dir,
        host.endpoint(),
        "M1",
        "S1",
        PASSWORD,
    )));
    second.start(&errors).await.unwrap();
    let supervisor = {
        let agent = Arc::clone(&second);
        let errors = errors.clone();
        tokio::spawn(async move { agent.run(errors).await })
    };

    let rebound = host.service("M1", "S1").await.unwrap();
    assert_eq!(rebound.id, original.id);
    assert_ne!(rebound.sig_hash, original.sig_hash);

    let expected = certificate::load(
        second_dir.join("agent.cert.pem"),
        second_dir.join("agent.key.pem"),
    )
    .await
    .unwrap();
    assert_eq!(rebound.sig_hash, expected.fingerprint());

    // Messages from the new certificate land on the same service id.
    second.handle(&Record::new("X", "after rebind")).await.unwrap();
    let pool = host.pool.clone();
    let service_id = original.id;
    eventually("rebound log to arrive", Duration::from_secs(3), || {
        let pool = pool.clone();
        async move { count_logs(&pool, service_id).await.unwrap() >= 1 }
    })
    .await;

    second.close().await;
    supervisor.await.ok();
    host.shutdown().await;
}

#[tokio::test]
async fn heartbeats_stop_when_the_agent_does() {
    let dir = tempfile::tempdir().unwrap();
    let host = TestHost::start(dir.path(), migrated_pool().await, 0).await;
    let errors = error_sink_for_test();

    let agent = Arc::new(Agent::new(agent_settings(
        dir.path(),
        host.endpoint(),
        "M1",
        "S1",
        PASSWORD,
    )));
    agent.start(&errors).await.unwrap();
    let supervisor = {
        let agent = Arc::clone(&agent);
        let errors = errors.clone();
        tokio::spawn(async move { agent.run(errors).await })
    };

    let seen_at_start = host.service("M1", "S1").await.unwrap().last_seen;
    let host_ref = &host;
    eventually("heartbeat to land", Duration::from_secs(3), || async {
        host_ref.service("M1", "S1").await.unwrap().last_seen > seen_at_start
    })
    .await;

    agent.close().await;
    supervisor.await.ok();

    // With the agent gone, liveness freezes.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let frozen = host.service("M1", "S1").await.unwrap().last_seen;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(host.service("M1", "S1").await.unwrap().last_seen, frozen);

    host.shutdown().await;
}

#[tokio::test]
async fn spooled_records_survive_a_host_restart() {
    let dir = tempfile::tempdir().unwrap();
    let host = TestHost::start(dir.path(), migrated_pool().await, 0).await;
    let endpoint = host.endpoint();
    let errors = error_sink_for_test();

    let agent = Arc::new(Agent::new(agent_settings(
        dir.path(),
        endpoint,
        "M1",
        "S1",
        PASSWORD,
    )));
    agent.start(&errors).await.unwrap();
    let supervisor = {
        let agent = Arc::clone(&agent);
        let errors = errors.clone();
        tokio::spawn(async move { agent.run(errors).await })
    };
    let service_id = host.service("M1", "S1").await.unwrap().id;

    // Take the host down and spool records into the void.
    let (pool, port) = host.shutdown().await;
    for i in 0..5 {
        agent
            .handle(&Record::new("X", format!("while down {}", i)))
            .await
            .unwrap();
    }
    assert_eq!(agent.pending().await.unwrap(), 5);

    // Bring the host back on the same endpoint and store; the supervisor
    // reconnects, re-registers, and drains the spool. Duplicates are
    // allowed, loss is not.
    let host = TestHost::start(dir.path(), pool, port).await;

    let pool = host.pool.clone();
    eventually("spooled records to drain", Duration::from_secs(10), || {
        let pool = pool.clone();
        let agent = Arc::clone(&agent);
        async move {
            count_logs(&pool, service_id).await.unwrap() >= 5
                && agent.pending().await.unwrap() == 0
        }
    })
    .await;

    agent.close().await;
    supervisor.await.ok();
    host.shutdown().await;
}
