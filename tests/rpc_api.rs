mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::Harness;
use netbk::core::{BackupRequest, JobStatus};
use netbk::rpc::{
    ClientError, INVALID_PARAMS, JOB_NOT_FOUND, MethodHandler, RpcClient, RpcServer,
    VALIDATION_FAILED,
};
use netbk::web::WebServer;
use serde_json::{Value, json};
use tokio::net::TcpListener;

async fn start_rpc(h: &Harness) -> RpcClient {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = RpcServer::new(Arc::new(MethodHandler::new(h.ctx.clone())), addr);
    tokio::spawn(async move { server.start_on(listener).await });
    RpcClient::new(addr)
}

async fn start_http(h: &Harness) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = WebServer::new(Arc::new(MethodHandler::new(h.ctx.clone())), addr);
    tokio::spawn(async move { server.start_on(listener).await });
    addr
}

fn request(devices: &[&str]) -> BackupRequest {
    BackupRequest {
        device_ids: devices.iter().map(|d| d.to_string()).collect(),
        repository_id: 1,
        credential_id: 1,
        parallel_tasks: 2,
        write_timestamp_to_custom_field: false,
        timestamp_custom_field_name: None,
    }
}

#[tokio::test]
async fn backup_start_then_follow_job() {
    let h = Harness::simple().await;
    let client = start_rpc(&h).await;

    let started = client.start_backup(&request(&["r1", "r2", "r3"])).await.unwrap();
    assert_eq!(started.total_devices, 3);
    assert_eq!(started.status, JobStatus::Pending);

    let mut job = client.job(&started.job_id).await.unwrap();
    for _ in 0..200 {
        if job.record.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
        job = client.job(&started.job_id).await.unwrap();
    }

    assert_eq!(job.record.status, JobStatus::Completed);
    assert_eq!(job.record.result.unwrap().backed_up_count, 3);

    let progress = client.progress(&started.job_id).await.unwrap();
    assert_eq!((progress.processed, progress.total), (3, 3));

    let listed = client.jobs(10, Some(JobStatus::Completed)).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, started.job_id);
}

#[tokio::test]
async fn validation_error_reports_job_id() {
    let h = Harness::simple().await;
    let client = start_rpc(&h).await;

    let err = client.start_backup(&request(&[])).await.unwrap_err();
    let ClientError::Rpc(error) = err else {
        panic!("expected rpc error, got {err}");
    };
    assert_eq!(error.code, VALIDATION_FAILED);

    let job_id = error.data.unwrap()["job_id"].as_str().unwrap().to_string();
    let job = client.job(&job_id).await.unwrap();
    assert_eq!(job.record.status, JobStatus::Failed);
}

#[tokio::test]
async fn unknown_job_and_bad_params() {
    let h = Harness::simple().await;
    let client = start_rpc(&h).await;

    match client.job("nope").await {
        Err(ClientError::Rpc(e)) => assert_eq!(e.code, JOB_NOT_FOUND),
        other => panic!("unexpected: {other:?}"),
    }

    match client
        .call::<Value>("jobs.list", Some(json!({ "status": "exploded" })))
        .await
    {
        Err(ClientError::Rpc(e)) => assert_eq!(e.code, INVALID_PARAMS),
        other => panic!("unexpected: {other:?}"),
    }

    let status = client.status().await.unwrap();
    assert_eq!(status["simulation"], false);
    assert_eq!(status["repositories"], 1);
}

#[tokio::test]
async fn http_api_mirrors_rpc() {
    let h = Harness::simple().await;
    let addr = start_http(&h).await;
    let http = reqwest::Client::new();
    let base = format!("http://{addr}");

    let resp = http
        .post(format!("{base}/api/backups"))
        .json(&json!({ "device_ids": ["r1"], "repository_id": 1, "credential_id": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
    let body: Value = resp.json().await.unwrap();
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let resp = http
        .get(format!("{base}/api/jobs/{job_id}/progress"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let progress: Value = resp.json().await.unwrap();
    assert_eq!(progress["total"], 1);

    let resp = http
        .get(format!("{base}/api/jobs/does-not-exist"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

    let resp = http
        .post(format!("{base}/api/backups"))
        .json(&json!({ "device_ids": [], "repository_id": 1, "credential_id": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    let resp = http
        .get(format!("{base}/api/jobs?status=failed"))
        .send()
        .await
        .unwrap();
    let failed: Vec<Value> = resp.json().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0]["status"], "failed");
}
