//! A full slave lifecycle walk over a real TCP connection: `HELLO` ->
//! `IDLE` (assigned a build) -> `BUILT` (one file to send) -> `SENT`
//! (after the juggler notifies a match) -> `IDLE` again.

use std::sync::Arc;
use std::time::Duration;

use armfarm_core::{BuildStatus, BuildTarget, BuiltFile};
use armfarm_protocol::coordination::{TransferOutcome, TransferRegistry, TransferRouter};
use armfarm_protocol::{OracleReply, OracleRequest, OracleValue, SlaveReply, SlaveRequest};
use armfarm_seraph::Seraph;
use armfarm_slave_driver::SlaveDriver;
use armfarm_transport::Connection;
use chrono::Duration as ChronoDuration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

fn fake_oracle() -> Arc<Seraph> {
    let (tx, mut rx) = mpsc::channel::<armfarm_seraph::WorkItem>(32);
    tokio::spawn(async move {
        while let Some((req, reply_tx)) = rx.recv().await {
            let value = match req {
                OracleRequest::LogBuild { .. } => OracleValue::BuildId(42),
                _ => OracleValue::Ack,
            };
            let _ = reply_tx.send(OracleReply::Ok { value });
        }
    });
    Seraph::build(vec![tx])
}

async fn connect_to(addr: std::net::SocketAddr) -> Connection {
    let stream = TcpStream::connect(addr).await.unwrap();
    let peer = stream.peer_addr().unwrap();
    Connection::new(stream, peer)
}

#[tokio::test]
async fn hello_build_send_done_walks_back_to_idle() {
    let seraph = fake_oracle();
    let (build_tx, mut build_rx) = mpsc::channel(8);
    let (index_tx, mut index_rx) = mpsc::channel(8);
    let transfers = Arc::new(TransferRegistry::new());
    let router = Arc::new(TransferRouter::new());

    let driver = Arc::new(SlaveDriver::new(
        seraph,
        build_tx,
        index_tx,
        Arc::clone(&transfers),
        Arc::clone(&router),
        ChronoDuration::seconds(60),
        ChronoDuration::seconds(300),
        3,
    ));

    let listener = armfarm_transport::bind("127.0.0.1:0".parse().unwrap(), 8).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_driver = Arc::clone(&driver);
    tokio::spawn(async move {
        let conn = armfarm_transport::accept(&listener).await.unwrap();
        server_driver.handle_connection(conn).await;
    });

    // Stand in for the architect: answer the next build-queue request
    // with a single target, matching the `oneshot` contract Architect::run
    // would otherwise fulfil.
    tokio::spawn(async move {
        if let Some(reply_tx) = build_rx.recv().await {
            let _ = reply_tx.send(Some(BuildTarget::new("numpy", "1.0")));
        }
    });

    let mut conn = connect_to(addr).await;

    conn.write_message(&SlaveRequest::Hello {
        timeout_secs: 60,
        py_version_tag: "cp34".into(),
        abi_tag: "cp34m".into(),
        platform_tag: "linux_armv7l".into(),
    })
    .await
    .unwrap();
    let SlaveReply::Hello { slave_id } = conn.read_message().await.unwrap() else {
        panic!("expected HELLO reply");
    };
    assert_eq!(slave_id, 1);

    conn.write_message(&SlaveRequest::Idle { slave_id }).await.unwrap();
    let reply = conn.read_message().await.unwrap();
    let SlaveReply::Build { package, version } = reply else {
        panic!("expected BUILD reply, got {reply:?}");
    };
    assert_eq!(package, "numpy");
    assert_eq!(version, "1.0");

    let built_file = BuiltFile {
        filename: "numpy-1.0-cp34-cp34m-linux_armv7l.whl".into(),
        filesize: 1024,
        filehash: "deadbeef".into(),
        package_version_tag: "1.0".into(),
        py_version_tag: "cp34".into(),
        abi_tag: "cp34m".into(),
    };
    conn.write_message(&SlaveRequest::Built {
        slave_id,
        status: BuildStatus::Success,
        duration: 12.5,
        output: "built ok".into(),
        files: vec![built_file.clone()],
    })
    .await
    .unwrap();
    let reply = conn.read_message().await.unwrap();
    let SlaveReply::Send { filename } = reply else {
        panic!("expected SEND reply, got {reply:?}");
    };
    assert_eq!(filename, built_file.filename);
    assert!(transfers.lookup(slave_id).is_some(), "driver must announce the pending transfer");

    // Stand in for the file juggler: it would notify a match once the
    // chunked upload's hash checks out.
    router.notify(slave_id, TransferOutcome::Matched).await;

    conn.write_message(&SlaveRequest::Sent {
        slave_id,
        filename: built_file.filename.clone(),
    })
    .await
    .unwrap();
    let reply = conn.read_message().await.unwrap();
    assert!(matches!(reply, SlaveReply::Done), "expected DONE, got {reply:?}");

    let indexed = index_rx.recv().await.unwrap();
    assert!(matches!(indexed, armfarm_protocol::IndexRequest::Pkg { package } if package == "numpy"));

    conn.write_message(&SlaveRequest::Idle { slave_id }).await.unwrap();
    let reply = conn.read_message().await.unwrap();
    assert!(matches!(reply, SlaveReply::Sleep), "no more work queued, expect SLEEP");
}

#[tokio::test]
async fn idle_before_hello_gets_bye_and_disconnect() {
    let seraph = fake_oracle();
    let (build_tx, _build_rx) = mpsc::channel::<oneshot::Sender<Option<BuildTarget>>>(1);
    let (index_tx, _index_rx) = mpsc::channel(8);
    let driver = Arc::new(SlaveDriver::new(
        seraph,
        build_tx,
        index_tx,
        Arc::new(TransferRegistry::new()),
        Arc::new(TransferRouter::new()),
        ChronoDuration::seconds(60),
        ChronoDuration::seconds(300),
        3,
    ));

    let listener = armfarm_transport::bind("127.0.0.1:0".parse().unwrap(), 8).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let conn = armfarm_transport::accept(&listener).await.unwrap();
        driver.handle_connection(conn).await;
    });

    let mut conn = connect_to(addr).await;
    conn.write_message(&SlaveRequest::Idle { slave_id: 999 }).await.unwrap();
    let result = tokio::time::timeout(Duration::from_millis(500), conn.read_message::<SlaveReply>()).await;
    match result {
        Ok(Ok(reply)) => assert!(matches!(reply, SlaveReply::Bye)),
        Ok(Err(_)) => {}
        Err(_) => panic!("driver never answered an unregistered IDLE"),
    }
}
