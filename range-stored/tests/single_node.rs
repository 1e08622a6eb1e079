//! One daemon's worth of workers wired together over loopback: a write
//! submitted on the local request queue travels through the forwarder, the
//! datagram listener, and a full prepare/propose/learn round before being
//! applied and acknowledged back to the client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use range::api::RangeAPI;
use range::config::StoreDaemonConfig;
use range::error::CResult;
use range::store::Store;

use range_stored::client::WriteRequest;
use range_stored::heartbeat::Heartbeat;
use range_stored::listen::ListenServer;
use range_stored::mqserv::MQServer;
use range_stored::paxos::{Accepter, Learner, Proposer, Queues};
use range_stored::queue::AckListener;
use range_stored::replay;
use range_stored::worker;

#[test]
fn single_write_commits_through_the_whole_pipeline() -> CResult<()> {
    let store = Arc::new(Store::in_memory());

    // Bind the listener first on an ephemeral port; the node names itself
    // after the bound address so the role clusters resolve over loopback.
    let mut cfg = StoreDaemonConfig {
        node_id: String::new(),
        port: 0,
        stored_request_timeout: 3_000,
        reader_ack_timeout: 10_000,
        heartbeat_timeout: 500,
        stored_mq_name: format!("single-node-{}", rand::random::<u32>()),
        ..Default::default()
    };
    let (queues, receivers) = Queues::new();
    let listener =
        ListenServer::new(Arc::new(cfg.clone()), Arc::clone(&store), queues.clone())?;
    let node_id = format!("127.0.0.1:{}", listener.port()?);
    cfg.node_id = node_id.clone();
    let cfg = Arc::new(cfg);

    // A one-node cell: this node is proposer, accepter, and learner.
    replay::initialize_range_cluster(&cfg, &store, &[node_id.clone()])?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let errors = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    let mut spawn = |w: Box<dyn worker::Worker>| {
        handles.push(worker::spawn(w, Arc::clone(&shutdown), Arc::clone(&errors)));
    };

    spawn(Box::new(listener));
    spawn(Box::new(Proposer::new(
        Arc::clone(&cfg),
        Arc::clone(&store),
        receivers.proposer,
        Arc::clone(&shutdown),
    )));
    spawn(Box::new(Accepter::new(
        Arc::clone(&cfg),
        Arc::clone(&store),
        receivers.accepter,
        queues.clone(),
    )?));
    spawn(Box::new(Learner::new(Arc::clone(&cfg), Arc::clone(&store), receivers.learner)));
    spawn(Box::new(MQServer::new(Arc::clone(&cfg), Arc::clone(&store))));
    spawn(Box::new(Heartbeat::new(Arc::clone(&cfg), Arc::clone(&store))));
    drop(spawn);

    // Give the queue forwarder a moment to bind its socket.
    std::thread::sleep(Duration::from_millis(200));

    let mut wr = WriteRequest::new(Arc::clone(&cfg), "create_env");
    wr.add_arg("env1");
    let ack_listener = AckListener::bind(&cfg, wr.client_id())?;
    wr.send()?;

    // The learner answers on the local acknowledgment channel once the
    // write is applied.
    let ack = ack_listener.await_ack(wr.request_id(), cfg.reader_ack_timeout)?;
    assert!(ack.status, "write failed: {}", ack.reason);

    // The environment is queryable and the state advanced exactly once.
    let api = RangeAPI::new(Arc::clone(&store));
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let envs = api.all_environments()?.as_strings().unwrap();
        if envs.contains(&"env1".to_string()) {
            break;
        }
        assert!(Instant::now() < deadline, "env1 never appeared: {:?}", envs);
        std::thread::sleep(Duration::from_millis(50));
    }

    let (last_seq, last_entry) = store.txlog().last()?.expect("log entry expected");
    assert_eq!(last_entry.method, "create_env");
    assert_eq!(last_entry.args, vec!["env1"]);

    // Exactly one entry beyond the cluster bootstrap writes.
    let bootstrap_entries = 1 + 3 + 3; // env + three clusters + three hosts
    assert_eq!(last_seq, bootstrap_entries + 1);

    shutdown.store(true, Ordering::SeqCst);
    for handle in handles {
        handle.join();
    }
    assert!(errors.lock().unwrap().is_empty(), "worker errors: {:?}", errors.lock().unwrap());
    Ok(())
}
