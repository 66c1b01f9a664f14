use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};
use files_core::{DriveClient, DriveTransfer, JobId, PeerClient, PeerEntry};

#[tokio::test]
async fn copy_returns_job_id() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/jobs/copy"))
        .and(header("authorization", "Bearer test-token"))
        .and(body_json(json!({
            "src_drive": "alice",
            "src_path": "/a.txt",
            "dst_drive": "alice",
            "dst_path": "/b/a.txt"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "job_id": 42 })))
        .mount(&server)
        .await;

    let client = DriveClient::new(&server.uri(), "test-token").unwrap();
    let job = client
        .copy(DriveTransfer {
            src_drive: "alice",
            src_path: "/a.txt",
            dst_drive: "alice",
            dst_path: "/b/a.txt",
        })
        .await
        .unwrap();

    assert_eq!(job, JobId(42));
}

#[tokio::test]
async fn job_status_and_stats_are_decoded() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/jobs/7/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "finished": true,
            "success": false,
            "error": "boom"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/jobs/7/stats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "bytes": 5,
            "total_bytes": 10
        })))
        .mount(&server)
        .await;

    let client = DriveClient::new(&server.uri(), "test-token").unwrap();
    let status = client.job_status(JobId(7)).await.unwrap();
    let stats = client.job_stats(JobId(7)).await.unwrap();

    assert!(status.finished);
    assert_eq!(status.error.as_deref(), Some("boom"));
    assert_eq!(stats.bytes, 5);
    assert_eq!(stats.total_bytes, 10);
}

#[tokio::test]
async fn stat_maps_not_found_to_none() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/drives/alice/item"))
        .and(query_param("path", "/nope"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = DriveClient::new(&server.uri(), "test-token").unwrap();
    assert!(client.stat("alice", "/nope").await.unwrap().is_none());
}

#[tokio::test]
async fn peer_listing_reads_event_stream() {
    let server = MockServer::start().await;

    let body = concat!(
        "data: {\"path\":\"dir\",\"is_dir\":true}\n\n",
        "data: {\"path\":\"dir/a.txt\",\"size\":3}\n\n",
    );
    Mock::given(method("GET"))
        .and(path("/api/paste/stream"))
        .and(query_param("path", "/Home/dir/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .mount(&server)
        .await;

    let client = PeerClient::new(&server.uri(), "test-token").unwrap();
    let entries = client.list_tree("alice", "/Home/dir/").await.unwrap();

    assert_eq!(
        entries,
        vec![
            PeerEntry {
                path: "dir".into(),
                size: 0,
                is_dir: true
            },
            PeerEntry {
                path: "dir/a.txt".into(),
                size: 3,
                is_dir: false
            },
        ]
    );
}
