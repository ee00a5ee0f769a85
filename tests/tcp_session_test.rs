mod common;

use common::Fixture;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tsync::digest::ChecksumDigest;
use tsync::error::SyncError;
use tsync::protocol::{self, Request, Response};
use tsync::sync::{AgentContext, SyncCoordinator};

/// Minimal receiver: accepts one connection and answers until the sender
/// hangs up. Returns every request plus the bytes of the last unit.
fn spawn_receiver(listener: TcpListener) -> JoinHandle<(Vec<Request>, Vec<u8>)> {
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut requests = Vec::new();
        let mut buf = Vec::new();

        while let Ok((msg_type, payload)) = protocol::read_frame(&mut stream).await {
            let request = Request::decode(msg_type, payload).unwrap();
            let response = match &request {
                Request::CheckIdentity { address, .. } => {
                    Response::Status { ok: address == "127.0.0.1" }
                }
                Request::InitTransfer { .. } => {
                    buf.clear();
                    Response::ok()
                }
                Request::SendChunk { data } => {
                    buf.extend_from_slice(data);
                    Response::ok()
                }
                Request::CheckDigest { .. } => Response::Digest {
                    digest: ChecksumDigest::of(&buf),
                },
                _ => Response::ok(),
            };
            requests.push(request);
            protocol::write_frame(&mut stream, &response.encode().unwrap())
                .await
                .unwrap();
        }
        (requests, buf)
    })
}

#[tokio::test]
async fn test_cycle_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let receiver = spawn_receiver(listener);

    let mut fixture = Fixture::new();
    fixture.config.server_ip = "127.0.0.1".to_string();
    fixture.config.server_port = port;
    fixture.write_file("root.sg1", "f.dat", b"0123456789");

    let ctx = Arc::new(AgentContext::new(fixture.config.clone()));
    let report = SyncCoordinator::new(ctx)
        .run_cycle()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.files_synced(), 1);

    let (requests, received) = receiver.await.unwrap();
    assert_eq!(received, b"0123456789");
    assert_eq!(
        requests
            .iter()
            .filter(|r| matches!(r, Request::SendChunk { .. }))
            .count(),
        3
    );
    assert_eq!(
        requests[1],
        Request::StartStorageGroup {
            name: "root.sg1".to_string()
        }
    );
    assert_eq!(requests.last(), Some(&Request::EndSession));
}

#[tokio::test]
async fn test_refused_connection_is_fatal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut fixture = Fixture::new();
    fixture.config.server_ip = "127.0.0.1".to_string();
    fixture.config.server_port = port;

    let ctx = Arc::new(AgentContext::new(fixture.config.clone()));
    let err = SyncCoordinator::new(ctx).run_cycle().await.unwrap_err();

    assert!(matches!(err, SyncError::Connect { .. }));
    assert!(err.is_fatal());
}
