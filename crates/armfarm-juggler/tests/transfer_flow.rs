//! End-to-end transfer over a real TCP socket, including the slave-side
//! HELLO back-off: if nothing arrives within the idle window the slave
//! resends `HELLO` rather than waiting forever for a dropped packet.

use std::sync::Arc;
use std::time::Duration;

use armfarm_juggler::Juggler;
use armfarm_protocol::coordination::{PendingTransfer, TransferRegistry, TransferRouter};
use armfarm_protocol::{TransferReply, TransferRequest};
use armfarm_transport::Connection;
use sha2::{Digest, Sha256};
use tokio::net::TcpStream;

/// Mirrors the slave's own upload loop: send `HELLO`, then answer every
/// `FETCH` with the requested slice until `DONE`. Resends `HELLO` if no
/// reply arrives within `hello_backoff` — a much shorter window than the
/// original's 5s so the test doesn't stall, but the same idea.
async fn simulate_slave_upload(
    conn: &mut Connection,
    slave_id: u64,
    data: &[u8],
    hello_backoff: Duration,
) -> TransferReply {
    conn.write_message(&TransferRequest::Hello { slave_id }).await.unwrap();
    loop {
        let reply = match tokio::time::timeout(hello_backoff, conn.read_message::<TransferReply>()).await {
            Ok(result) => result.unwrap(),
            Err(_elapsed) => {
                conn.write_message(&TransferRequest::Hello { slave_id }).await.unwrap();
                continue;
            }
        };
        match reply {
            TransferReply::Done | TransferReply::Error { .. } => return reply,
            TransferReply::Fetch { offset, size } => {
                let end = (offset as usize + size as usize).min(data.len());
                let chunk = data[offset as usize..end].to_vec();
                conn.write_message(&TransferRequest::Chunk { slave_id, offset, data: chunk })
                    .await
                    .unwrap();
            }
        }
    }
}

#[tokio::test]
async fn slave_style_client_completes_an_upload_over_tcp() {
    let dir = tempfile::tempdir().unwrap();
    let transfers = Arc::new(TransferRegistry::new());
    let router = Arc::new(TransferRouter::new());
    let data = b"a small built wheel, pretending to be bigger".to_vec();
    let mut hasher = Sha256::new();
    hasher.update(&data);
    let filehash = format!("{:x}", hasher.finalize());

    transfers.announce(
        1,
        PendingTransfer {
            package: "numpy".into(),
            filename: "numpy-1.0-cp34-cp34m-linux_armv7l.whl".into(),
            filesize: data.len() as i64,
            filehash,
        },
    );

    let juggler = Arc::new(Juggler::new(Arc::clone(&transfers), Arc::clone(&router), dir.path(), 8));
    let listener = armfarm_transport::bind("127.0.0.1:0".parse().unwrap(), 8).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let conn = armfarm_transport::accept(&listener).await.unwrap();
        juggler.handle_connection(conn).await;
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let peer = stream.peer_addr().unwrap();
    let mut conn = Connection::new(stream, peer);
    let outcome = simulate_slave_upload(&mut conn, 1, &data, Duration::from_millis(200)).await;
    assert!(matches!(outcome, TransferReply::Done));

    server.await.unwrap();

    let published = dir.path().join("simple").join("numpy").join("numpy-1.0-cp34-cp34m-linux_armv7l.whl");
    assert_eq!(tokio::fs::read(&published).await.unwrap(), data);
}
