// (c) 2025 The cachegw authors

//! End-to-end request/response tests over a real Unix socket

mod common;

use std::sync::Arc;

use common::{test_config, MemoryBackend};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;

use cachegw::server::Server;

struct Harness {
    backend: Arc<MemoryBackend>,
    socket_path: std::path::PathBuf,
    server: JoinHandle<anyhow::Result<()>>,
    shutdown: tokio_util::sync::CancellationToken,
    _dir: tempfile::TempDir,
}

impl Harness {
    async fn start(backend: MemoryBackend) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("gw.sock");
        let backend = Arc::new(backend);
        let server = Server::bind_with_backend(
            Arc::new(test_config(socket_path.clone())),
            Arc::clone(&backend) as Arc<dyn cachegw::backend::Backend>,
        )
        .await
        .unwrap();
        let shutdown = server.shutdown_token();
        Self {
            backend,
            socket_path,
            server: tokio::spawn(server.run()),
            shutdown,
            _dir: dir,
        }
    }

    async fn connect(&self) -> UnixStream {
        UnixStream::connect(&self.socket_path).await.unwrap()
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.server.await.unwrap().unwrap();
    }
}

async fn read_response(stream: &mut UnixStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

#[tokio::test]
async fn get_hit_streams_the_object() {
    let harness = Harness::start(MemoryBackend::with_object(&[0xAA, 0xBB], b"test data")).await;
    let mut client = harness.connect().await;

    client
        .write_all(&[0x01, 0x01, 0x02, 0x00, 0x81, 0x02, 0xAA, 0xBB])
        .await
        .unwrap();

    let response = read_response(&mut client, 18).await;
    let mut expected = vec![0x01, 0x02, 0x02, 0x80, 0x84, 0x01, 0x04, 0x82, 0x09];
    expected.extend_from_slice(b"test data");
    assert_eq!(response, expected);

    harness.stop().await;
}

#[tokio::test]
async fn get_miss_reports_no_file() {
    let harness = Harness::start(MemoryBackend::default()).await;
    let mut client = harness.connect().await;

    client
        .write_all(&[0x01, 0x01, 0x02, 0x00, 0x81, 0x02, 0xAA, 0xBB])
        .await
        .unwrap();

    let response = read_response(&mut client, 7).await;
    assert_eq!(response, [0x01, 0x01, 0x02, 0x80, 0x84, 0x01, 0x01]);

    harness.stop().await;
}

#[tokio::test]
async fn put_without_flags_does_not_overwrite() {
    let harness = Harness::start(MemoryBackend::with_object(&[0xAA, 0xBB], b"original")).await;
    let mut client = harness.connect().await;

    client
        .write_all(&[
            0x01, 0x02, 0x03, 0x00, 0x81, 0x02, 0xAA, 0xBB, 0x82, 0x03, 0x01, 0x02, 0x03,
        ])
        .await
        .unwrap();

    let response = read_response(&mut client, 7).await;
    assert_eq!(response, [0x01, 0x01, 0x03, 0x80, 0x84, 0x01, 0x04]);
    // Only-if-missing semantics: the stored object is untouched.
    assert_eq!(
        harness.backend.stored(&[0xAA, 0xBB]).unwrap(),
        b"original"
    );

    harness.stop().await;
}

#[tokio::test]
async fn put_with_overwrite_flag_replaces() {
    let harness = Harness::start(MemoryBackend::with_object(&[0xAA, 0xBB], b"original")).await;
    let mut client = harness.connect().await;

    client
        .write_all(&[
            0x01, 0x03, 0x03, 0x00, 0x81, 0x02, 0xAA, 0xBB, 0x82, 0x03, 0x01, 0x02, 0x03, 0x86,
            0x01, 0x01,
        ])
        .await
        .unwrap();

    let response = read_response(&mut client, 7).await;
    assert_eq!(response, [0x01, 0x01, 0x03, 0x80, 0x84, 0x01, 0x04]);
    assert_eq!(
        harness.backend.stored(&[0xAA, 0xBB]).unwrap(),
        [0x01, 0x02, 0x03]
    );

    harness.stop().await;
}

#[tokio::test]
async fn delete_then_get_misses() {
    let harness = Harness::start(MemoryBackend::with_object(&[0xAA, 0xBB], b"doomed")).await;
    let mut client = harness.connect().await;

    client
        .write_all(&[0x01, 0x01, 0x04, 0x00, 0x81, 0x02, 0xAA, 0xBB])
        .await
        .unwrap();
    let response = read_response(&mut client, 7).await;
    assert_eq!(response, [0x01, 0x01, 0x04, 0x80, 0x84, 0x01, 0x04]);

    client
        .write_all(&[0x01, 0x01, 0x02, 0x00, 0x81, 0x02, 0xAA, 0xBB])
        .await
        .unwrap();
    let response = read_response(&mut client, 7).await;
    assert_eq!(response, [0x01, 0x01, 0x02, 0x80, 0x84, 0x01, 0x01]);

    harness.stop().await;
}

#[tokio::test]
async fn setup_then_traffic_on_one_connection() {
    let harness = Harness::start(MemoryBackend::with_object(&[0xAA, 0xBB], b"hi")).await;
    let mut client = harness.connect().await;

    // Bare Setup: nothing proposed, so nothing to renegotiate.
    client.write_all(&[0x01, 0x00, 0x01, 0x00]).await.unwrap();
    let response = read_response(&mut client, 7).await;
    assert_eq!(response, [0x01, 0x01, 0x01, 0x80, 0x84, 0x01, 0x04]);

    client
        .write_all(&[0x01, 0x01, 0x02, 0x00, 0x81, 0x02, 0xAA, 0xBB])
        .await
        .unwrap();
    let response = read_response(&mut client, 11).await;
    assert_eq!(
        response,
        [0x01, 0x02, 0x02, 0x80, 0x84, 0x01, 0x04, 0x82, 0x02, b'h', b'i']
    );

    harness.stop().await;
}

#[tokio::test]
async fn malformed_frame_on_one_connection_leaves_others_untouched() {
    let harness = Harness::start(MemoryBackend::with_object(&[0xAA, 0xBB], b"survivor")).await;
    let mut victim = harness.connect().await;
    let mut bystander = harness.connect().await;

    // Non-canonical length encoding: the victim connection must die...
    victim
        .write_all(&[0x01, 0x01, 0x02, 0x00, 0x81, 0xFD, 0x02, 0x00])
        .await
        .unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(victim.read(&mut buf).await.unwrap(), 0);

    // ...while the bystander's request sails through.
    bystander
        .write_all(&[0x01, 0x01, 0x02, 0x00, 0x81, 0x02, 0xAA, 0xBB])
        .await
        .unwrap();
    let response = read_response(&mut bystander, 17).await;
    assert_eq!(&response[..7], &[0x01, 0x02, 0x02, 0x80, 0x84, 0x01, 0x04]);
    assert_eq!(&response[9..], b"survivor");

    harness.stop().await;
}

#[tokio::test]
async fn large_object_roundtrip() {
    // Big enough to span many reads and socket writes.
    let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
    let harness = Harness::start(MemoryBackend::default()).await;
    let mut client = harness.connect().await;

    // Store it with an overwrite Put.
    let mut request = vec![0x01, 0x03, 0x03, 0x00, 0x81, 0x02, 0xAA, 0xBB, 0x82, 0xFE];
    request.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    request.extend_from_slice(&payload);
    request.extend_from_slice(&[0x86, 0x01, 0x01]);
    client.write_all(&request).await.unwrap();
    let response = read_response(&mut client, 7).await;
    assert_eq!(response, [0x01, 0x01, 0x03, 0x80, 0x84, 0x01, 0x04]);

    // Read it back and compare.
    client
        .write_all(&[0x01, 0x01, 0x02, 0x00, 0x81, 0x02, 0xAA, 0xBB])
        .await
        .unwrap();
    let mut header = vec![0u8; 7 + 6]; // frame header + status + value field header (0xFE form)
    client.read_exact(&mut header).await.unwrap();
    assert_eq!(&header[..7], &[0x01, 0x02, 0x02, 0x80, 0x84, 0x01, 0x04]);
    assert_eq!(header[7], 0x82);
    assert_eq!(header[8], 0xFE);
    assert_eq!(
        u32::from_le_bytes(header[9..13].try_into().unwrap()) as usize,
        payload.len()
    );
    let mut echoed = vec![0u8; payload.len()];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, payload);

    harness.stop().await;
}
