//! End-to-end: a master with real listeners and a real worker subprocess.

use std::path::PathBuf;
use std::time::Duration;

use daq_master::config::Settings;
use daq_master::control::ControlClient;
use daq_master::master::Master;
use daq_master::messages::RunParams;
use daq_master::protocol::Value;
use daq_master::scheduler::now;
use daq_master::sync_struct::Subscriber;
use daq_master::MasterError;
use tempfile::TempDir;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(30);

fn settings(dir: &TempDir) -> Settings {
    let ddb = dir.path().join("ddb.json");
    std::fs::write(
        &ddb,
        r#"{
            "dds": {"driver": "mock_dds", "arguments": {"center_frequency": 3.0, "linewidth": 1.0}},
            "ttl": {"driver": "mock_ttl"}
        }"#,
    )
    .unwrap();

    let mut settings = Settings::default();
    settings.network.control_port = 0;
    settings.network.queue_port = 0;
    settings.network.timed_port = 0;
    settings.network.rt_results_port = 0;
    settings.network.parameters_port = 0;
    settings.databases.device_db = ddb;
    settings.databases.parameter_db = dir.path().join("pdb.json");
    settings.worker.program = Some(PathBuf::from(env!("CARGO_BIN_EXE_daq_master")));
    settings
}

#[tokio::test]
async fn test_submitted_run_updates_parameters() {
    let dir = tempfile::tempdir().unwrap();
    let master = Master::start(&settings(&dir)).await.unwrap();
    let addrs = master.addresses();

    let parameters = Subscriber::connect_value(addrs.parameters).await.unwrap();
    let rt_results = Subscriber::connect_value(addrs.rt_results).await.unwrap();
    let mut client = ControlClient::connect(addrs.control).await.unwrap();

    let params = RunParams::new("flopping").with_arguments(Value::from_pairs([
        ("npoints", Value::Int(7)),
        ("start", Value::Float(0.0)),
        ("stop", Value::Float(6.0)),
    ]));
    let rid = client.submit_queued(params, Some(30.0)).await.unwrap();
    assert_eq!(rid, 0);

    timeout(
        WAIT,
        parameters.wait_until(|p| p.get("flopping_peak") == Some(&Value::Float(3.0))),
    )
    .await
    .unwrap()
    .unwrap();
    timeout(
        WAIT,
        rt_results.wait_until(|r| {
            r.get("brightness")
                .and_then(Value::as_list)
                .is_some_and(|b| b.len() == 7)
        }),
    )
    .await
    .unwrap()
    .unwrap();

    parameters.close().await.unwrap();
    rt_results.close().await.unwrap();
    master.shutdown().await;
}

#[tokio::test]
async fn test_queue_is_published_and_drains() {
    let dir = tempfile::tempdir().unwrap();
    let master = Master::start(&settings(&dir)).await.unwrap();
    let addrs = master.addresses();

    let queue = Subscriber::connect_value(addrs.queue).await.unwrap();
    let mut client = ControlClient::connect(addrs.control).await.unwrap();

    let hang = RunParams::new("hang");
    let first = client.submit_queued(hang, None).await.unwrap();
    let second = client.submit_queued(RunParams::new("noop"), None).await.unwrap();
    assert_eq!((first, second), (0, 1));

    // The hanging run is executing and cannot be cancelled.
    timeout(WAIT, async {
        while master.scheduler().running() != Some(first) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    match client.cancel_queued(first).await {
        Err(MasterError::Cancellation(rid)) => assert_eq!(rid, first),
        other => panic!("unexpected outcome: {:?}", other),
    }
    client.cancel_queued(second).await.unwrap();

    timeout(
        WAIT,
        queue.wait_until(|q| q.as_list().is_some_and(|runs| runs.len() == 1)),
    )
    .await
    .unwrap()
    .unwrap();

    // Shutdown terminates the hanging worker.
    queue.close().await.unwrap();
    timeout(WAIT, master.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_due_timed_run_is_executed() {
    let dir = tempfile::tempdir().unwrap();
    let master = Master::start(&settings(&dir)).await.unwrap();
    let addrs = master.addresses();

    let mut client = ControlClient::connect(addrs.control).await.unwrap();

    let far = client
        .submit_timed(RunParams::new("noop"), None, Some(now() + 3600.0))
        .await
        .unwrap();
    let soon = client
        .submit_timed(RunParams::new("noop"), None, Some(now() + 0.2))
        .await
        .unwrap();
    assert_ne!(far, soon);
    let timed = Subscriber::connect_value(addrs.timed).await.unwrap();

    // The due entry leaves the timed table once it has been queued.
    timeout(
        WAIT,
        timed.wait_until(|t| t.as_dict().is_some_and(|entries| entries.len() == 1)),
    )
    .await
    .unwrap()
    .unwrap();
    client.cancel_timed(far).await.unwrap();
    assert!(client.cancel_timed(far).await.is_err());

    timed.close().await.unwrap();
    master.shutdown().await;
}
