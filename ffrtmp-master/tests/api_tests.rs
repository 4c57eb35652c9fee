use ffrtmp_master::api::make_app;
use ffrtmp_master::bootstrap::Services;
use ffrtmp_master::config::MasterServiceConfig;
use ffrtmp_master::service::background::admission_tick;
use http::StatusCode;
use poem::test::TestClient;
use poem::Route;
use serde_json::json;
use test_r::test;

test_r::enable!();

const API_KEY: &str = "test-api-key";

async fn make_test_app_with_tenants(extra_tenants: &[&str]) -> (TestClient<Route>, Services) {
    let mut tenants = ffrtmp_master::config::TenantsConfig {
        auto_provision: false,
        allow_default_tenant: true,
        ..Default::default()
    };
    for tenant in extra_tenants {
        tenants.tenants.insert(
            tenant.to_string(),
            ffrtmp_master::config::TenantConfig {
                name: tenant.to_string(),
                display_name: tenant.to_string(),
                is_active: true,
            },
        );
    }

    let config = MasterServiceConfig {
        api_key: API_KEY.to_string(),
        in_memory_store: true,
        tenants,
        ..Default::default()
    };
    let services = Services::new(&config).await.expect("services should build");
    let client = TestClient::new(make_app(&services));
    (client, services)
}

async fn make_test_app() -> (TestClient<Route>, Services) {
    make_test_app_with_tenants(&[]).await
}

fn job_body() -> serde_json::Value {
    json!({
        "scenario": "h264-1080p",
        "parameters": {"duration_sec": 10},
        "priority": "high",
        "queue": "live",
        "requiresGpu": false
    })
}

fn node_body() -> serde_json::Value {
    json!({
        "address": "10.1.2.3:9000",
        "nodeType": "server",
        "capabilities": {
            "cpuThreads": 16,
            "cpuModel": "test",
            "hasGpu": false,
            "gpuType": null,
            "ramBytes": 8589934592u64,
            "labels": {}
        },
        "maxConcurrent": 2
    })
}

#[test]
async fn healthcheck_needs_no_auth() {
    let (client, _) = make_test_app().await;

    let response = client.get("/healthz").send().await;
    response.assert_status_is_ok();

    let response = client.get("/health").send().await;
    response.assert_status_is_ok();
}

#[test]
async fn metrics_endpoint_needs_no_auth() {
    let (client, _) = make_test_app().await;
    ffrtmp_master::metrics::seed();

    let response = client.get("/metrics").send().await;
    response.assert_status_is_ok();
}

#[test]
async fn requests_without_key_are_unauthorized() {
    let (client, _) = make_test_app().await;

    let response = client.post("/v1/jobs").body_json(&job_body()).send().await;
    response.assert_status(StatusCode::UNAUTHORIZED);

    let response = client
        .post("/v1/jobs")
        .header("X-API-Key", "wrong-key")
        .body_json(&job_body())
        .send()
        .await;
    response.assert_status(StatusCode::UNAUTHORIZED);
}

#[test]
async fn unknown_tenant_is_rejected_and_nothing_stored() {
    let (client, services) = make_test_app().await;

    let response = client
        .post("/v1/jobs")
        .header("X-API-Key", API_KEY)
        .header("X-Tenant-ID", "ghost")
        .body_json(&job_body())
        .send()
        .await;
    response.assert_status(StatusCode::FORBIDDEN);

    let jobs = services
        .job_repo
        .list_pending(10)
        .await
        .expect("listing should work");
    assert!(jobs.is_empty());
}

#[test]
async fn full_job_lifecycle_over_http() {
    let (client, services) = make_test_app().await;

    // Register a worker.
    let response = client
        .post("/v1/nodes/register")
        .header("X-API-Key", API_KEY)
        .body_json(&node_body())
        .send()
        .await;
    response.assert_status_is_ok();
    let body = response.json().await;
    let node_id = body.value().object().get("nodeId").string().to_string();

    // Submit and admit a job.
    let response = client
        .post("/v1/jobs")
        .header("X-API-Key", API_KEY)
        .body_json(&job_body())
        .send()
        .await;
    response.assert_status_is_ok();
    let body = response.json().await;
    let job_id = body.value().object().get("jobId").string().to_string();
    assert_eq!(body.value().object().get("status").string(), "pending");

    admission_tick(
        services.job_repo.as_ref(),
        &ffrtmp_master::config::SchedulerConfig::default(),
    )
    .await
    .unwrap();

    // Claim.
    let response = client
        .get(format!("/v1/jobs/next?node_id={node_id}"))
        .header("X-API-Key", API_KEY)
        .send()
        .await;
    response.assert_status_is_ok();
    let body = response.json().await;
    assert_eq!(body.value().object().get("id").string(), job_id);
    assert_eq!(body.value().object().get("status").string(), "assigned");

    // Start.
    let response = client
        .post(format!("/v1/jobs/{job_id}/start"))
        .header("X-API-Key", API_KEY)
        .body_json(&json!({"nodeId": node_id}))
        .send()
        .await;
    response.assert_status_is_ok();

    // Result.
    let result_body = json!({
        "jobId": job_id,
        "nodeId": node_id,
        "result": {
            "status": "completed",
            "exitCode": 0,
            "error": null,
            "stderrTail": null,
            "exitReason": "success",
            "durationSeconds": 2.5,
            "outputBytes": 4096,
            "bandwidthMbps": 12.5,
            "slaMet": true
        }
    });
    let response = client
        .post("/v1/results")
        .header("X-API-Key", API_KEY)
        .body_json(&result_body)
        .send()
        .await;
    response.assert_status_is_ok();
    let body = response.json().await;
    assert!(body.value().object().get("applied").bool());

    // A duplicate result is acknowledged without applying.
    let response = client
        .post("/v1/results")
        .header("X-API-Key", API_KEY)
        .body_json(&result_body)
        .send()
        .await;
    response.assert_status_is_ok();
    let body = response.json().await;
    assert!(!body.value().object().get("applied").bool());

    // The job is terminal.
    let response = client
        .get(format!("/v1/jobs/{job_id}"))
        .header("X-API-Key", API_KEY)
        .send()
        .await;
    response.assert_status_is_ok();
    let body = response.json().await;
    assert_eq!(body.value().object().get("status").string(), "completed");
}

#[test]
async fn cross_tenant_reads_are_impossible() {
    let (client, _services) = make_test_app_with_tenants(&["other"]).await;

    // Submitted under the default tenant.
    let response = client
        .post("/v1/jobs")
        .header("X-API-Key", API_KEY)
        .body_json(&job_body())
        .send()
        .await;
    response.assert_status_is_ok();
    let body = response.json().await;
    let job_id = body.value().object().get("jobId").string().to_string();

    // The other tenant authenticates fine but cannot see the job.
    let response = client
        .get(format!("/v1/jobs/{job_id}"))
        .header("X-API-Key", API_KEY)
        .header("X-Tenant-ID", "other")
        .send()
        .await;
    response.assert_status(StatusCode::NOT_FOUND);

    let response = client
        .get("/v1/jobs")
        .header("X-API-Key", API_KEY)
        .header("X-Tenant-ID", "other")
        .send()
        .await;
    response.assert_status_is_ok();
    let body = response.json().await;
    assert_eq!(body.value().array().len(), 0);
}
