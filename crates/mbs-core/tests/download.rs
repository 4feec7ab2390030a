use std::sync::Arc;
use std::time::Duration;

use mbs_core::{DownloadError, PackageDownloader, UpdateProgress, verify_sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn downloader() -> PackageDownloader {
    PackageDownloader::new(Duration::from_secs(5), Duration::from_secs(30))
        .expect("downloader should build")
}

fn drain(rx: &mut mpsc::Receiver<UpdateProgress>) -> Vec<UpdateProgress> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn download_streams_to_disk_and_reports_progress() {
    let server = MockServer::start().await;
    let payload = vec![7_u8; 64 * 1024];
    Mock::given(method("GET"))
        .and(path("/MBS.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let temp = tempfile::tempdir().expect("tempdir should be created");
    let destination = temp.path().join("nested/mbs_update.zip");
    let (tx, mut rx) = mpsc::channel(1024);

    let saved = downloader()
        .download(&format!("{}/MBS.zip", server.uri()), &destination, &tx)
        .await
        .expect("download should succeed");

    assert_eq!(saved, destination);
    assert_eq!(
        std::fs::read(&destination).expect("package should exist"),
        payload
    );

    let events = drain(&mut rx);
    assert!(!events.is_empty());
    assert_eq!(
        events.last(),
        Some(&UpdateProgress::Downloading {
            downloaded: payload.len() as u64,
            total: Some(payload.len() as u64),
        })
    );
}

#[tokio::test]
async fn http_error_removes_partial_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/MBS.zip"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let temp = tempfile::tempdir().expect("tempdir should be created");
    let destination = temp.path().join("mbs_update.zip");
    let (tx, _rx) = mpsc::channel(16);

    let error = downloader()
        .download(&format!("{}/MBS.zip", server.uri()), &destination, &tx)
        .await
        .expect_err("500 should fail");

    assert!(
        matches!(error, DownloadError::HttpStatus { status, .. } if status.as_u16() == 500),
        "{error:?}"
    );
    assert!(!destination.exists());
}

#[tokio::test]
async fn unwritable_destination_fails_before_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"unused".to_vec()))
        .expect(0)
        .mount(&server)
        .await;

    let temp = tempfile::tempdir().expect("tempdir should be created");
    let destination = temp.path().join("already-a-directory");
    std::fs::create_dir(&destination).expect("directory should be created");
    let (tx, _rx) = mpsc::channel(16);

    let error = downloader()
        .download(&format!("{}/MBS.zip", server.uri()), &destination, &tx)
        .await
        .expect_err("directory destination should fail");

    assert!(
        matches!(error, DownloadError::FileSystem { .. }),
        "{error:?}"
    );
}

/// Serves 400 of an advertised 1000 bytes and then stalls.
async fn spawn_stalling_server() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let address = listener.local_addr().expect("listener should have an address");

    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        let mut request = [0_u8; 2048];
        let _ = socket.read(&mut request).await;
        let head = "HTTP/1.1 200 OK\r\nContent-Length: 1000\r\nContent-Type: application/zip\r\n\r\n";
        let _ = socket.write_all(head.as_bytes()).await;
        let _ = socket.write_all(&[1_u8; 400]).await;
        let _ = socket.flush().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
    });

    format!("http://{address}/MBS.zip")
}

#[tokio::test]
async fn cancel_mid_transfer_removes_file_and_stops_progress() {
    let url = spawn_stalling_server().await;
    let temp = tempfile::tempdir().expect("tempdir should be created");
    let destination = temp.path().join("mbs_update.zip");
    let downloader = Arc::new(downloader());
    let (tx, mut rx) = mpsc::channel(64);

    let task = {
        let downloader = Arc::clone(&downloader);
        let destination = destination.clone();
        tokio::spawn(async move { downloader.download(&url, &destination, &tx).await })
    };

    let mut received = 0;
    while received < 400 {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("progress should arrive")
            .expect("channel should stay open");
        if let UpdateProgress::Downloading { downloaded, total } = event {
            assert_eq!(total, Some(1000));
            received = downloaded;
        }
    }

    downloader.cancel();
    downloader.cancel();

    let result = tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .expect("download should stop after cancel")
        .expect("download task should not panic");

    assert!(matches!(result, Err(DownloadError::Cancelled)), "{result:?}");
    assert!(!destination.exists(), "partial file should be removed");
    assert!(drain(&mut rx).is_empty(), "no progress after cancellation");
}

#[tokio::test]
async fn checksum_mismatch_deletes_package() {
    let temp = tempfile::tempdir().expect("tempdir should be created");
    let package = temp.path().join("mbs_update.zip");
    std::fs::write(&package, b"abc").expect("package should be written");

    verify_sha256(
        &package,
        "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD",
    )
    .await
    .expect("matching digest should verify");
    assert!(package.exists());

    let error = verify_sha256(&package, &"0".repeat(64))
        .await
        .expect_err("wrong digest should fail");
    assert!(
        matches!(error, DownloadError::ChecksumMismatch { .. }),
        "{error:?}"
    );
    assert!(!package.exists());
}

#[tokio::test]
async fn cancel_before_start_applies_to_the_next_download_only() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/MBS.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"package".to_vec()))
        .expect(1)
        .mount(&server)
        .await;
    let temp = tempfile::tempdir().expect("tempdir should be created");
    let destination = temp.path().join("mbs_update.zip");
    let downloader = downloader();
    let (tx, _rx) = mpsc::channel(64);
    let url = format!("{}/MBS.zip", server.uri());

    downloader.cancel();
    let first = downloader.download(&url, &destination, &tx).await;
    assert!(matches!(first, Err(DownloadError::Cancelled)), "{first:?}");
    assert!(!destination.exists());

    downloader
        .download(&url, &destination, &tx)
        .await
        .expect("a later download should not inherit the cancellation");
    assert_eq!(
        std::fs::read(&destination).expect("package should exist"),
        b"package"
    );
}

#[tokio::test]
async fn redirects_are_followed_to_the_package() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/releases/download/latest/MBS.zip"))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("Location", format!("{}/objects/MBS.zip", server.uri())),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/objects/MBS.zip"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"package".to_vec()))
        .expect(1)
        .mount(&server)
        .await;
    let temp = tempfile::tempdir().expect("tempdir should be created");
    let destination = temp.path().join("mbs_update.zip");
    let (tx, _rx) = mpsc::channel(64);

    downloader()
        .download(
            &format!("{}/releases/download/latest/MBS.zip", server.uri()),
            &destination,
            &tx,
        )
        .await
        .expect("redirected download should succeed");

    assert_eq!(
        std::fs::read(&destination).expect("package should exist"),
        b"package"
    );
}

#[tokio::test]
async fn endless_redirect_chain_is_a_network_error() {
    let server = MockServer::start().await;
    for hop in 0..30 {
        Mock::given(method("GET"))
            .and(path(format!("/hop/{hop}")))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("Location", format!("{}/hop/{}", server.uri(), hop + 1)),
            )
            .mount(&server)
            .await;
    }
    let temp = tempfile::tempdir().expect("tempdir should be created");
    let destination = temp.path().join("mbs_update.zip");
    let (tx, _rx) = mpsc::channel(64);

    let result = downloader()
        .download(&format!("{}/hop/0", server.uri()), &destination, &tx)
        .await;

    assert!(matches!(result, Err(DownloadError::Network { .. })), "{result:?}");
    assert!(!destination.exists());
    let requests = server
        .received_requests()
        .await
        .expect("request recording should be enabled");
    assert!(requests.len() > 1, "redirects should be followed");
    assert!(
        requests.len() <= 11,
        "the chain should stop after ten redirects, saw {} requests",
        requests.len()
    );
}
