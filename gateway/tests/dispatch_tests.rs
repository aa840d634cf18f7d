//! End-to-end dispatcher scenarios against a real Postgres instance,
//! exercising the scenarios the dispatcher's design notes call out.

mod support;

use serde_json::json;
use sqlx::PgPool;
use support::TestServer;

#[sqlx::test(migrations = "./migrations")]
async fn sign_in_then_authenticated_call_round_trips(pool: PgPool) -> Result<(), anyhow::Error> {
    let server = TestServer::spawn(pool).await?;
    let client = reqwest::Client::new();

    let sign_in = client
        .post(format!("{}/api/v1/sign/in", server.url()))
        .header("User-Agent", "integration-test/1.0")
        .json(&json!({"username": "alice", "password": "hunter2"}))
        .send()
        .await?;
    assert_eq!(sign_in.status(), 200);

    let cookies: Vec<_> = sign_in.cookies().collect();
    assert!(cookies.iter().any(|c| c.name() == "AWS-Session"));
    assert!(cookies.iter().any(|c| c.name() == "API-Key"));

    let session = cookies.iter().find(|c| c.name() == "AWS-Session").unwrap().value().to_string();
    let key = cookies.iter().find(|c| c.name() == "API-Key").unwrap().value().to_string();

    let call = client
        .post(format!("{}/api/v1/whoami", server.url()))
        .header("User-Agent", "integration-test/1.0")
        .header("Cookie", format!("AWS-Session={session}; API-Key={key}"))
        .json(&json!({}))
        .send()
        .await?;
    assert_eq!(call.status(), 200);

    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn authorization_header_takes_priority_over_session_cookies(
    pool: PgPool,
) -> Result<(), anyhow::Error> {
    let server = TestServer::spawn(pool).await?;
    let client = reqwest::Client::new();

    let sign_in = client
        .post(format!("{}/api/v1/sign/in", server.url()))
        .header("User-Agent", "integration-test/1.0")
        .json(&json!({"username": "alice", "password": "hunter2"}))
        .send()
        .await?;
    let cookies: Vec<_> = sign_in.cookies().collect();
    let session = cookies.iter().find(|c| c.name() == "AWS-Session").unwrap().value().to_string();
    let key = cookies.iter().find(|c| c.name() == "API-Key").unwrap().value().to_string();

    // A malformed Bearer token alongside valid session cookies must still
    // be rejected as a broken Bearer call, not silently fall back to the
    // valid SessionPair — the two schemes never mix (§4.1).
    let response = client
        .post(format!("{}/api/v1/whoami", server.url()))
        .header("User-Agent", "integration-test/1.0")
        .header("Authorization", "Bearer not-a-real-jwt")
        .header("Cookie", format!("AWS-Session={session}; API-Key={key}"))
        .json(&json!({}))
        .send()
        .await?;

    assert_eq!(response.status(), 400);
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn missing_user_agent_is_rejected(pool: PgPool) -> Result<(), anyhow::Error> {
    let server = TestServer::spawn(pool).await?;

    let response = reqwest::Client::new()
        .post(format!("{}/api/v1/sign/in", server.url()))
        .json(&json!({"username": "alice", "password": "hunter2"}))
        .send()
        .await?;

    assert_eq!(response.status(), 400);
    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn v2_call_is_deferred_to_a_job_ticket(pool: PgPool) -> Result<(), anyhow::Error> {
    let server = TestServer::spawn(pool).await?;
    let client = reqwest::Client::new();

    let sign_in = client
        .post(format!("{}/api/v1/sign/in", server.url()))
        .header("User-Agent", "integration-test/1.0")
        .json(&json!({"username": "alice", "password": "hunter2"}))
        .send()
        .await?;
    let cookies: Vec<_> = sign_in.cookies().collect();
    let session = cookies.iter().find(|c| c.name() == "AWS-Session").unwrap().value().to_string();
    let key = cookies.iter().find(|c| c.name() == "API-Key").unwrap().value().to_string();

    let posted = client
        .post(format!("{}/api/v2/whoami", server.url()))
        .header("User-Agent", "integration-test/1.0")
        .header("Cookie", format!("AWS-Session={session}; API-Key={key}"))
        .json(&json!({}))
        .send()
        .await?;
    assert_eq!(posted.status(), 202);

    let body: serde_json::Value = posted.json().await?;
    let job_id = body["jobid"].as_str().expect("jobid in body").to_string();
    assert_eq!(job_id.matches('-').count(), 6);

    let mut attempts = 0;
    loop {
        let drained = client
            .get(format!("{}/api/v2/{job_id}", server.url()))
            .send()
            .await?;
        match drained.status().as_u16() {
            204 if attempts < 20 => {
                attempts += 1;
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
            200 => break,
            other => panic!("unexpected status while draining: {other}"),
        }
    }

    let not_found = client
        .get(format!("{}/api/v2/{job_id}", server.url()))
        .send()
        .await?;
    assert_eq!(not_found.status(), 404);

    Ok(())
}

#[sqlx::test(migrations = "./migrations")]
async fn unknown_job_id_is_404(pool: PgPool) -> Result<(), anyhow::Error> {
    let server = TestServer::spawn(pool).await?;
    let response = reqwest::Client::new()
        .get(format!(
            "{}/api/v2/A0000-P0000-O0000-S0000-T0000-O0000-L0000",
            server.url()
        ))
        .send()
        .await?;
    assert_eq!(response.status(), 404);
    Ok(())
}
