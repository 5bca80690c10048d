//! Integration tests for the comfyctl REST API.
//!
//! Each test boots the real router on an ephemeral port against an isolated
//! temp base directory containing a fake engine: `main.py` is a shell
//! script run through an overridden `/bin/sh` interpreter, and the
//! readiness budget is shortened so the optimistic-success path makes
//! startup deterministic without a real engine answering `/system_stats`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use comfyctl::api::{router, AppState};
use comfyctl::env::{builtin_engine_dir, Environment};
use comfyctl::settings::SettingsStore;

/// Test harness owning an isolated base directory and a running API server.
struct TestServer {
    _tmp: tempfile::TempDir,
    url: String,
    client: reqwest::Client,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with(Duration::from_millis(700)).await
    }

    async fn spawn_with(readiness: Duration) -> Self {
        let tmp = tempfile::tempdir().expect("create tempdir");
        let base = tmp.path().to_path_buf();
        let engine = builtin_engine_dir(&base);
        std::fs::create_dir_all(&engine).expect("create engine dir");
        std::fs::write(engine.join("main.py"), "sleep 30\n").expect("write fake engine");

        let mut environment = Environment::new(base.clone(), engine);
        environment.interpreter_override = Some(PathBuf::from("/bin/sh"));
        environment.readiness_timeout = readiness;
        environment.probe_interval = Duration::from_millis(100);
        environment.probe_request_timeout = Duration::from_millis(200);

        let settings = SettingsStore::new(base.join("settings.json"));
        let state = tokio::task::spawn_blocking(move || AppState::new(Arc::new(environment), settings))
            .await
            .expect("build app state off the async runtime thread");
        let app = router(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let url = format!("http://{}", listener.local_addr().expect("local addr"));
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve test app");
        });

        TestServer {
            _tmp: tmp,
            url,
            client: reqwest::Client::new(),
        }
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{path}", self.url))
            .send()
            .await
            .expect("GET")
    }

    async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}{path}", self.url))
            .json(&body)
            .send()
            .await
            .expect("POST")
    }

    async fn post_empty(&self, path: &str) -> reqwest::Response {
        self.client
            .post(format!("{}{path}", self.url))
            .send()
            .await
            .expect("POST")
    }

    async fn put(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .put(format!("{}{path}", self.url))
            .json(&body)
            .send()
            .await
            .expect("PUT")
    }

    async fn delete(&self, path: &str) -> reqwest::Response {
        self.client
            .delete(format!("{}{path}", self.url))
            .send()
            .await
            .expect("DELETE")
    }

    async fn delete_with_body(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .delete(format!("{}{path}", self.url))
            .json(&body)
            .send()
            .await
            .expect("DELETE")
    }

    /// Poll a job until it reaches a terminal state, recording every status
    /// observed on the way.
    async fn wait_for_job(&self, job_id: &str) -> (Value, Vec<String>) {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut observed = Vec::new();
        loop {
            let response = self.get(&format!("/jobs/{job_id}")).await;
            assert_eq!(response.status(), 200);
            let job: Value = response.json().await.expect("job json");
            let status = job["status"].as_str().expect("status").to_string();
            if observed.last() != Some(&status) {
                observed.push(status.clone());
            }
            if status == "completed" || status == "failed" {
                return (job, observed);
            }
            assert!(Instant::now() < deadline, "job {job_id} never finished");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

async fn json_of(response: reqwest::Response) -> Value {
    response.json().await.expect("json body")
}

// ── instances ─────────────────────────────────────────────────────────────

#[cfg(unix)]
#[tokio::test]
async fn instance_add_start_stop_remove_lifecycle() {
    let server = TestServer::spawn().await;

    let response = server
        .post(
            "/instances",
            json!({
                "gpu_device": "0",
                "gpu_label": "GPU 0",
                "port": 8188,
                "host": "127.0.0.1",
                "vram_mode": "normal",
                "extra_args": [],
            }),
        )
        .await;
    assert_eq!(response.status(), 201);
    let body = json_of(response).await;
    assert_eq!(body["instance_id"], "gpu0_8188");
    assert_eq!(body["status"], "stopped");
    assert_eq!(body["is_running"], false);
    assert_eq!(body["url"], "http://127.0.0.1:8188");

    let response = server.post_empty("/instances/gpu0_8188/start").await;
    assert_eq!(response.status(), 200);
    let body = json_of(response).await;
    assert_eq!(body["status"], "running");
    assert_eq!(body["is_running"], true);
    assert_eq!(body["url"], "http://127.0.0.1:8188");

    // A second start short-circuits.
    let response = server.post_empty("/instances/gpu0_8188/start").await;
    let body = json_of(response).await;
    assert_eq!(body["message"], "Already running");

    let response = server.post_empty("/instances/gpu0_8188/stop").await;
    assert_eq!(response.status(), 200);
    let body = json_of(response).await;
    assert_eq!(body["status"], "stopped");
    assert_eq!(body["is_running"], false);

    let response = server.delete("/instances/gpu0_8188").await;
    assert_eq!(response.status(), 200);
    assert_eq!(json_of(response).await["ok"], true);

    let body = json_of(server.get("/instances").await).await;
    assert_eq!(body["instances"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn add_rejects_port_collision_with_owner_in_message() {
    let server = TestServer::spawn().await;

    let response = server
        .post("/instances", json!({ "gpu_device": "0", "port": 8188 }))
        .await;
    assert_eq!(response.status(), 201);

    let response = server
        .post("/instances", json!({ "gpu_device": "1", "port": 8188 }))
        .await;
    assert_eq!(response.status(), 400);
    let body = json_of(response).await;
    assert_eq!(body["error"], "Port 8188 already in use by instance gpu0_8188");
}

#[tokio::test]
async fn cpu_device_coerces_vram_mode() {
    let server = TestServer::spawn().await;

    let response = server
        .post(
            "/instances",
            json!({ "gpu_device": "cpu", "port": 8189, "vram_mode": "normal" }),
        )
        .await;
    assert_eq!(response.status(), 201);
    let body = json_of(response).await;
    assert_eq!(body["instance_id"], "cpu_8189");
    assert_eq!(body["vram_mode"], "cpu");
    assert_eq!(body["gpu_device"], "cpu");
}

#[tokio::test]
async fn add_validates_port_and_extra_args() {
    let server = TestServer::spawn().await;

    let response = server.post("/instances", json!({ "port": 80 })).await;
    assert_eq!(response.status(), 400);
    assert_eq!(
        json_of(response).await["error"],
        "Port must be between 1024 and 65535."
    );

    let response = server
        .post(
            "/instances",
            json!({ "port": 8191, "extra_args": ["--lowvram"] }),
        )
        .await;
    assert_eq!(response.status(), 400);

    let response = server
        .post("/instances", json!({ "port": 8191, "vram_mode": "turbo" }))
        .await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn add_defaults_pick_next_available_port() {
    let server = TestServer::spawn().await;

    let first = json_of(server.post("/instances", json!({})).await).await;
    assert_eq!(first["port"], 8188);
    assert_eq!(first["instance_id"], "gpu0_8188");

    // Port accepted as a string too.
    let second = json_of(
        server
            .post("/instances", json!({ "port": "8189", "gpu_device": 1 }))
            .await,
    )
    .await;
    assert_eq!(second["port"], 8189);
    assert_eq!(second["instance_id"], "gpu1_8189");

    let third = json_of(server.post("/instances", json!({})).await).await;
    assert_eq!(third["port"], 8190);
}

#[tokio::test]
async fn instance_cap_is_enforced() {
    let server = TestServer::spawn().await;

    for port in 8188..8196u16 {
        let response = server.post("/instances", json!({ "port": port })).await;
        assert_eq!(response.status(), 201);
    }
    let response = server.post("/instances", json!({ "port": 9000 })).await;
    assert_eq!(response.status(), 400);
    assert_eq!(
        json_of(response).await["error"],
        "Maximum of 8 instances reached"
    );
}

#[tokio::test]
async fn unknown_instance_routes_return_404() {
    let server = TestServer::spawn().await;

    assert_eq!(server.post_empty("/instances/ghost/start").await.status(), 404);
    assert_eq!(server.post_empty("/instances/ghost/stop").await.status(), 404);
    assert_eq!(server.delete("/instances/ghost").await.status(), 404);
}

#[cfg(unix)]
#[tokio::test]
async fn start_all_runs_in_parallel() {
    let server = TestServer::spawn_with(Duration::from_secs(2)).await;

    for port in [8188u16, 8189, 8190] {
        let response = server.post("/instances", json!({ "port": port })).await;
        assert_eq!(response.status(), 201);
    }

    // Each start waits out the 2 s readiness budget; a serial run would
    // take at least 6 s.
    let begin = Instant::now();
    let response = server.post_empty("/instances/start-all").await;
    let elapsed = begin.elapsed();
    assert_eq!(response.status(), 200);
    let body = json_of(response).await;
    assert_eq!(body["started"], 3);
    assert_eq!(body["total"], 3);
    assert!(
        elapsed < Duration::from_secs(5),
        "start-all took {elapsed:?}, expected parallel execution"
    );

    let response = server.post_empty("/instances/stop-all").await;
    assert_eq!(response.status(), 200);
    assert_eq!(json_of(response).await["ok"], true);

    let body = json_of(server.get("/instances").await).await;
    assert_eq!(body["running_count"], 0);
    for instance in body["instances"].as_array().unwrap() {
        assert_eq!(instance["is_running"], false);
    }
}

#[tokio::test]
async fn batch_routes_are_not_parsed_as_ids() {
    let server = TestServer::spawn().await;

    // With no instances registered, the literal routes answer; an {id}
    // match would 404.
    let response = server.post_empty("/instances/start-all").await;
    assert_eq!(response.status(), 200);
    assert_eq!(json_of(response).await["message"], "No stopped instances");

    let response = server.post_empty("/instances/stop-all").await;
    assert_eq!(response.status(), 200);
    assert_eq!(json_of(response).await["message"], "No running instances");
}

// ── jobs ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn job_lifecycle_transitions_once_with_ordered_timestamps() {
    let server = TestServer::spawn().await;

    let response = server.post_empty("/nodes/update-all").await;
    assert_eq!(response.status(), 202);
    let accepted = json_of(response).await;
    let job_id = accepted["job_id"].as_str().expect("job_id").to_string();
    assert!(matches!(
        accepted["status"].as_str(),
        Some("pending") | Some("running")
    ));

    let (job, observed) = server.wait_for_job(&job_id).await;
    assert_eq!(job["status"], "completed");
    assert_eq!(job["operation"], "update_all_nodes");

    // No regressions: statuses only ever move forward.
    let order = ["pending", "running", "completed", "failed"];
    let indices: Vec<usize> = observed
        .iter()
        .map(|s| order.iter().position(|o| o == s).expect("known status"))
        .collect();
    let mut sorted = indices.clone();
    sorted.sort_unstable();
    assert_eq!(indices, sorted, "observed {observed:?}");

    let created = job["created_at"].as_f64().unwrap();
    let started = job["started_at"].as_f64().unwrap();
    let completed = job["completed_at"].as_f64().unwrap();
    assert!(created <= started && started <= completed);

    let jobs = json_of(server.get("/jobs").await).await;
    assert!(
        jobs["jobs"]
            .as_array()
            .unwrap()
            .iter()
            .any(|j| j["job_id"] == job_id.as_str())
    );
}

#[tokio::test]
async fn unknown_job_is_404() {
    let server = TestServer::spawn().await;
    let response = server.get("/jobs/deadbeef").await;
    assert_eq!(response.status(), 404);
    assert_eq!(json_of(response).await["error"], "Job deadbeef not found");
}

// ── install / update / purge ──────────────────────────────────────────────

#[tokio::test]
async fn update_without_git_checkout_fails_as_job() {
    let server = TestServer::spawn().await;

    // main.py exists, so validation passes; the worker then fails because
    // the fake engine dir is not a git checkout (or git pull finds no repo).
    let response = server.post_empty("/update").await;
    assert_eq!(response.status(), 202);
    let job_id = json_of(response).await["job_id"]
        .as_str()
        .unwrap()
        .to_string();
    let (job, _) = server.wait_for_job(&job_id).await;
    assert_eq!(job["status"], "failed");
    assert!(job["error"].as_str().is_some());
}

#[tokio::test]
async fn sage_attention_accepted_when_environment_ready() {
    let server = TestServer::spawn().await;
    // The harness overrides the interpreter, so the environment counts as
    // ready and the request is accepted.
    let response = server.post_empty("/install/sage-attention").await;
    assert_eq!(response.status(), 202);
    let job_id = json_of(response).await["job_id"]
        .as_str()
        .unwrap()
        .to_string();
    // `sh -m pip ...` fails; the worker converts that into a failed job.
    let (job, _) = server.wait_for_job(&job_id).await;
    assert_eq!(job["status"], "failed");
}

#[tokio::test]
async fn purge_parks_models_and_reports_ok() {
    let server = TestServer::spawn().await;

    // Give the fake engine a models tree to preserve.
    let body = json_of(server.get("/status").await).await;
    let engine_dir = PathBuf::from(body["comfyui_dir"].as_str().unwrap());
    let checkpoints = engine_dir.join("models").join("checkpoints");
    std::fs::create_dir_all(&checkpoints).unwrap();
    std::fs::write(checkpoints.join("model.safetensors"), b"weights").unwrap();

    let response = server.post_empty("/purge").await;
    assert_eq!(response.status(), 200);
    assert_eq!(json_of(response).await["ok"], true);

    // The checkout is gone (ready for a clean re-clone); the models tree
    // is parked under the base directory for the next install to restore.
    assert!(!engine_dir.exists());
    let parked = server._tmp.path().join("_models_backup");
    assert!(parked.join("checkpoints").join("model.safetensors").exists());

    // A second purge finds nothing installed.
    let response = server.post_empty("/purge").await;
    assert_eq!(response.status(), 400);
}

// ── status / settings / gpus ──────────────────────────────────────────────

#[tokio::test]
async fn status_reports_installation_and_instances() {
    let server = TestServer::spawn().await;
    server
        .post("/instances", json!({ "port": 8188 }))
        .await
        .error_for_status()
        .unwrap();

    let body = json_of(server.get("/status").await).await;
    assert_eq!(body["comfyui_installed"], true);
    assert_eq!(body["python_ready"], true);
    assert_eq!(body["instances_total"], 1);
    assert_eq!(body["instances_running"], 0);
    assert!(body["version"].as_str().is_some());

    let gpus = json_of(server.get("/gpus").await).await;
    assert!(gpus["gpus"].is_array());
}

#[tokio::test]
async fn settings_survive_read_modify_write() {
    let server = TestServer::spawn().await;

    let response = server.put("/settings", json!({ "theme": "dark" })).await;
    assert_eq!(response.status(), 200);
    let response = server
        .put("/settings", json!({ "auto_start": true }))
        .await;
    assert_eq!(response.status(), 200);

    let body = json_of(server.get("/settings").await).await;
    assert_eq!(body["theme"], "dark");
    assert_eq!(body["auto_start"], true);

    let response = server.put("/settings", json!(["not", "an", "object"])).await;
    assert_eq!(response.status(), 400);
}

// ── engine target ─────────────────────────────────────────────────────────

#[tokio::test]
async fn target_defaults_to_builtin_and_validates_switches() {
    let server = TestServer::spawn().await;

    let body = json_of(server.get("/comfyui/target").await).await;
    assert_eq!(body["active_dir"], body["builtin_dir"]);
    assert_eq!(body["is_external"], false);

    let response = server
        .put("/comfyui/target", json!({ "path": "/nonexistent/engine" }))
        .await;
    assert_eq!(response.status(), 400);

    let response = server.put("/comfyui/target", json!({})).await;
    assert_eq!(response.status(), 400);
    assert_eq!(json_of(response).await["error"], "'path' is required");
}

#[tokio::test]
async fn target_switch_rebuilds_managers() {
    let server = TestServer::spawn().await;

    let external = server._tmp.path().join("external-engine");
    std::fs::create_dir_all(&external).unwrap();
    std::fs::write(external.join("main.py"), "sleep 30\n").unwrap();

    let response = server
        .put(
            "/comfyui/target",
            json!({ "path": external.display().to_string() }),
        )
        .await;
    assert_eq!(response.status(), 200);

    let body = json_of(server.get("/comfyui/target").await).await;
    assert_eq!(body["active_dir"], external.display().to_string());
    assert_eq!(body["is_external"], true);

    let saved = json_of(server.get("/comfyui/saved").await).await;
    assert_eq!(saved["saved"][0], external.display().to_string());

    let response = server.post_empty("/comfyui/target/reset").await;
    assert_eq!(response.status(), 200);
    let body = json_of(server.get("/comfyui/target").await).await;
    assert_eq!(body["is_external"], false);
}

#[tokio::test]
async fn extra_dirs_roundtrip() {
    let server = TestServer::spawn().await;

    let response = server
        .post("/comfyui/extra-dirs", json!({ "path": "/mnt/models" }))
        .await;
    assert_eq!(response.status(), 200);
    let body = json_of(server.get("/comfyui/extra-dirs").await).await;
    assert_eq!(body["extra_dirs"][0], "/mnt/models");

    let response = server
        .delete_with_body("/comfyui/extra-dirs", json!({ "path": "/mnt/models" }))
        .await;
    assert_eq!(response.status(), 200);
    let body = json_of(server.get("/comfyui/extra-dirs").await).await;
    assert_eq!(body["extra_dirs"].as_array().unwrap().len(), 0);
}

// ── models / nodes ────────────────────────────────────────────────────────

#[tokio::test]
async fn model_registry_and_categories() {
    let server = TestServer::spawn().await;

    let body = json_of(server.get("/models/categories").await).await;
    assert!(
        body["categories"]
            .as_array()
            .unwrap()
            .iter()
            .any(|c| c == "checkpoints")
    );

    let body = json_of(server.get("/models/registry").await).await;
    assert!(body["count"].as_u64().unwrap() > 0);
    for model in body["models"].as_array().unwrap() {
        assert_eq!(model["status"], "missing");
    }

    let body = json_of(server.get("/models/registry?category=vae").await).await;
    for model in body["models"].as_array().unwrap() {
        assert_eq!(model["folder"], "vae");
    }

    let response = server.get("/models/registry/sdxl_base").await;
    assert_eq!(response.status(), 200);
    let body = json_of(response).await;
    assert_eq!(body["id"], "sdxl_base");
    assert!(body["description"].as_str().is_some());

    assert_eq!(server.get("/models/registry/nope").await.status(), 404);
}

#[tokio::test]
async fn model_download_validation() {
    let server = TestServer::spawn().await;

    let response = server.post("/models/download", json!({})).await;
    assert_eq!(response.status(), 400);
    assert_eq!(
        json_of(response).await["error"],
        "'model_ids' list is required"
    );

    let response = server
        .post("/models/download", json!({ "model_ids": ["bogus"] }))
        .await;
    assert_eq!(response.status(), 400);
    assert_eq!(json_of(response).await["error"], "Unknown model ID: bogus");
}

#[tokio::test]
async fn local_scan_sees_files_on_disk() {
    let server = TestServer::spawn().await;

    let body = json_of(server.get("/status").await).await;
    let engine_dir = PathBuf::from(body["comfyui_dir"].as_str().unwrap());
    let checkpoints = engine_dir.join("models").join("checkpoints");
    std::fs::create_dir_all(&checkpoints).unwrap();
    std::fs::write(checkpoints.join("model.safetensors"), b"weights").unwrap();

    let body = json_of(server.get("/models/local").await).await;
    assert_eq!(body["total"], 1);
    assert_eq!(
        body["models"]["checkpoints"][0]["name"],
        "model.safetensors"
    );

    let response = server.get("/models/search").await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn node_registry_and_removal() {
    let server = TestServer::spawn().await;

    let body = json_of(server.get("/nodes/registry").await).await;
    assert!(body["count"].as_u64().unwrap() > 0);
    assert!(body["categories"].as_array().unwrap().len() > 1);

    let body = json_of(server.get("/nodes/installed").await).await;
    assert_eq!(body["count"], 0);

    let response = server.post("/nodes/install", json!({ "node_ids": [] })).await;
    assert_eq!(response.status(), 400);
    let response = server
        .post("/nodes/install", json!({ "node_ids": ["bogus"] }))
        .await;
    assert_eq!(response.status(), 400);

    let response = server.delete("/nodes/NotInstalled").await;
    assert_eq!(response.status(), 200);
    assert_eq!(json_of(response).await["ok"], false);
}

// ── logs ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn logs_capture_tagged_activity() {
    let server = TestServer::spawn().await;

    server
        .post("/instances", json!({ "port": 8188 }))
        .await
        .error_for_status()
        .unwrap();

    let body = json_of(server.get("/logs").await).await;
    assert!(body["count"].as_u64().unwrap() >= 1);
    let entries = body["entries"].as_array().unwrap();
    assert!(
        entries
            .iter()
            .any(|e| e["message"].as_str().unwrap().contains("Added instance gpu0_8188"))
    );
    for entry in entries {
        assert!(entry["timestamp"].as_f64().is_some());
        assert!(entry["tag"].as_str().is_some());
    }

    // Tag filtering.
    let body = json_of(server.get("/logs?tag=server").await).await;
    for entry in body["entries"].as_array().unwrap() {
        assert_eq!(entry["tag"], "server");
    }
    let body = json_of(server.get("/logs?tag=install").await).await;
    assert_eq!(body["count"], 0);

    // Limit.
    let body = json_of(server.get("/logs?limit=1").await).await;
    assert_eq!(body["count"], 1);
}
