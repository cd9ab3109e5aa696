//! End-to-end document sync against a mock remote.
//!
//! Covers the empty-to-empty scenario: a local `# Hello` file uploads into
//! an empty remote document as a single level-1 heading block, and a
//! second run emits zero mutations.

use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use larksync::config::Config;
use larksync::gateway::FeishuGateway;
use larksync::sync::document::{DocumentSync, DocumentSyncOptions};
use larksync::sync::resource::ResourceIndex;
use larksync::sync::state::SyncState;

const DOC: &str = "dox_test";

fn ok_body(data: serde_json::Value) -> serde_json::Value {
    json!({ "code": 0, "msg": "success", "data": data })
}

fn test_config(cache_dir: &std::path::Path) -> Config {
    Config {
        feishu_app_id: "cli_test".into(),
        feishu_app_secret: "s3cret".into(),
        feishu_user_access_token: Some("u-test".into()),
        rate_limit_ms: 10,
        asset_cache_path: Some(cache_dir.join("assets_cache.json")),
        ..Default::default()
    }
}

async fn mount_meta(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/drive/v1/metas/batch_query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(json!({
            "metas": [{ "doc_token": DOC, "latest_modify_time": "1000" }],
        }))))
        .mount(server)
        .await;
}

#[tokio::test]
async fn empty_remote_receives_single_heading_block() {
    let server = MockServer::start().await;
    let vault = TempDir::new().unwrap();
    let md_path = vault.path().join("a.md");
    std::fs::write(&md_path, "# Hello\n").unwrap();

    mount_meta(&server).await;
    // Remote document is empty: only the page block exists.
    Mock::given(method("GET"))
        .and(path(format!("/docx/v1/documents/{DOC}/blocks")))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(json!({
            "items": [
                { "block_id": DOC, "block_type": 1, "page": { "elements": [] }, "children": [] },
            ],
        }))))
        .mount(&server)
        .await;
    // clear_document lists root children before deleting anything.
    Mock::given(method("GET"))
        .and(path(format!("/docx/v1/documents/{DOC}/blocks/{DOC}/children")))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(json!({ "items": [] }))))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/docx/v1/documents/{DOC}/blocks/{DOC}/children")))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(json!({ "children": [] }))))
        .expect(1)
        .mount(&server)
        .await;

    let config = test_config(vault.path());
    let gateway = FeishuGateway::with_base_url(&config, &server.uri());
    let state = SyncState::open(vault.path());
    let index = ResourceIndex::build(vault.path());
    let doc_sync = DocumentSync {
        gateway: &gateway,
        index: &index,
        state: Some(&state),
        vault_root: vault.path().to_path_buf(),
        batch_id: "20260801_000000".into(),
        diff_threshold: 15,
    };

    doc_sync
        .run(&md_path, DOC, DocumentSyncOptions::default())
        .await
        .unwrap();

    // The create request carried exactly one heading1 block with a single
    // "Hello" text run.
    let requests = server.received_requests().await.unwrap();
    let create = requests
        .iter()
        .find(|r| {
            r.method.as_str() == "POST"
                && r.url.path() == format!("/docx/v1/documents/{DOC}/blocks/{DOC}/children")
        })
        .expect("no block creation request sent");
    let body: serde_json::Value = serde_json::from_slice(&create.body).unwrap();
    let children = body["children"].as_array().unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0]["block_type"], json!(3));
    assert_eq!(
        children[0]["heading1"]["elements"],
        json!([{ "text_run": { "content": "Hello" } }])
    );

    // The state must know the mapping in both directions.
    let entry = state.get_by_path(&md_path).unwrap();
    assert_eq!(entry.token, DOC);
    assert_eq!(state.get_by_token(DOC).unwrap().0, "a.md");
}

#[tokio::test]
async fn second_run_with_converged_remote_sends_no_mutations() {
    let server = MockServer::start().await;
    let vault = TempDir::new().unwrap();
    let md_path = vault.path().join("a.md");
    std::fs::write(&md_path, "# Hello\n").unwrap();

    mount_meta(&server).await;
    // Remote already holds the converged heading block.
    Mock::given(method("GET"))
        .and(path(format!("/docx/v1/documents/{DOC}/blocks")))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(json!({
            "items": [
                { "block_id": DOC, "block_type": 1, "page": { "elements": [] },
                  "children": ["blk_h"] },
                { "block_id": "blk_h", "block_type": 3, "parent_id": DOC,
                  "heading1": { "elements": [{ "text_run": { "content": "Hello" } }] } },
            ],
        }))))
        .mount(&server)
        .await;
    // Any mutation request would be unmatched and fail the run; make that
    // explicit with zero-expectation mounts.
    Mock::given(method("POST"))
        .and(path(format!("/docx/v1/documents/{DOC}/blocks/{DOC}/children")))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(json!({}))))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path(format!("/docx/v1/documents/{DOC}/blocks/batch_update")))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(json!({}))))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!(
            "/docx/v1/documents/{DOC}/blocks/{DOC}/children/batch_delete"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(json!({}))))
        .expect(0)
        .mount(&server)
        .await;

    let config = test_config(vault.path());
    let gateway = FeishuGateway::with_base_url(&config, &server.uri());
    let state = SyncState::open(vault.path());
    let index = ResourceIndex::build(vault.path());
    let doc_sync = DocumentSync {
        gateway: &gateway,
        index: &index,
        state: Some(&state),
        vault_root: vault.path().to_path_buf(),
        batch_id: "20260801_000001".into(),
        diff_threshold: 15,
    };

    let outcome = doc_sync
        .run(&md_path, DOC, DocumentSyncOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome, larksync::sync::document::SyncOutcome::Unchanged);
}

#[tokio::test]
async fn newer_remote_downloads_and_backs_up_local_file() {
    let server = MockServer::start().await;
    let vault = TempDir::new().unwrap();
    let md_path = vault.path().join("a.md");
    std::fs::write(&md_path, "stale local text\n").unwrap();

    // Remote modification time far in the future (milliseconds).
    Mock::given(method("POST"))
        .and(path("/drive/v1/metas/batch_query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(json!({
            "metas": [{ "doc_token": DOC, "latest_modify_time": "99999999999999" }],
        }))))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/docx/v1/documents/{DOC}/blocks")))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_body(json!({
            "items": [
                { "block_id": DOC, "block_type": 1, "page": { "elements": [] },
                  "children": ["blk_t"] },
                { "block_id": "blk_t", "block_type": 2, "parent_id": DOC,
                  "text": { "elements": [{ "text_run": { "content": "fresh remote text" } }] } },
            ],
        }))))
        .mount(&server)
        .await;

    let config = test_config(vault.path());
    let gateway = FeishuGateway::with_base_url(&config, &server.uri());
    let state = SyncState::open(vault.path());
    let index = ResourceIndex::build(vault.path());
    let batch_id = "20260801_000002".to_string();
    let doc_sync = DocumentSync {
        gateway: &gateway,
        index: &index,
        state: Some(&state),
        vault_root: vault.path().to_path_buf(),
        batch_id: batch_id.clone(),
        diff_threshold: 15,
    };

    let outcome = doc_sync
        .run(&md_path, DOC, DocumentSyncOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome, larksync::sync::document::SyncOutcome::Downloaded);

    assert_eq!(
        std::fs::read_to_string(&md_path).unwrap(),
        "fresh remote text"
    );
    let backup = vault.path().join(format!("a.md.bak.{batch_id}"));
    assert_eq!(
        std::fs::read_to_string(&backup).unwrap(),
        "stale local text\n"
    );
}
