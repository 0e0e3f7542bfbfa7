//! API Integration Tests
//!
//! Tests the HTTP API endpoints with a real database, temporary upload and
//! persist directories, and stand-in language and embedding models.
//!
//! Tests are serialized because they share a global test pool and test settings.
//!
//! Note: The `more-di` DI framework doesn't support injecting custom pools.
//! We work around this by using `DatabaseConnection::set_test_pool()` to set
//! a global pool that the DI-created DatabaseConnection will use. Settings
//! follow the same pattern.

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode, header},
};
use di::{Injectable, ServiceCollection, inject, injectable};
use di_axum::RouterServiceProviderExtensions;
use doc_chat_api::{
    api,
    core::engine::DocumentChatEngineFactory,
    core::engine::index::IndexBuilder,
    core::engine::storage::StorageContextCache,
    core::services::DbConversationService,
    infrastructure::database::DatabaseConnection,
    infrastructure::llm::{Completion, CompletionRequest, LlmError},
    infrastructure::repositories::DbConversationRepository,
    infrastructure::settings::Settings,
    infrastructure::traits::{EmbeddingClient, LlmClient},
    infrastructure::vector_store::FileVectorStore,
};
use serde_json::{Value, json};
use serial_test::serial;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt;
use uuid::Uuid;

const ANSWER: &str = "The answer is 42.";

/// Counter for unique test database URIs
static TEST_DB_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Chat model that answers every request directly, without calling tools.
struct FixedAnswerLlm;

#[injectable(LlmClient)]
impl FixedAnswerLlm {
    #[inject]
    fn create() -> Self {
        FixedAnswerLlm
    }
}

#[async_trait]
impl LlmClient for FixedAnswerLlm {
    async fn complete(&self, _request: CompletionRequest) -> Result<Completion, LlmError> {
        Ok(Completion::text(ANSWER))
    }

    async fn stream(
        &self,
        _request: CompletionRequest,
        deltas: mpsc::Sender<String>,
    ) -> Result<Completion, LlmError> {
        for part in ANSWER.split_inclusive(' ') {
            let _ = deltas.send(part.to_owned()).await;
        }
        Ok(Completion::text(ANSWER))
    }
}

/// Embeds every text as its length, which is all the index build needs.
struct LengthEmbedder;

#[injectable(EmbeddingClient)]
impl LengthEmbedder {
    #[inject]
    fn create() -> Self {
        LengthEmbedder
    }
}

#[async_trait]
impl EmbeddingClient for LengthEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        Ok(texts.iter().map(|text| vec![text.len() as f32, 1.0]).collect())
    }
}

/// Directories backing one test; removed on drop.
struct TestDirs {
    upload: TempDir,
    persist: TempDir,
}

/// Setup test database with migrations and test settings
/// Uses in-memory SQLite for test isolation
async fn setup_test_env() -> (SqlitePool, TestDirs) {
    let db_num = TEST_DB_COUNTER.fetch_add(1, Ordering::SeqCst);
    // Use file URI format with shared cache - each test gets a unique DB
    let db_url = format!("sqlite:file:apitestdb{}?mode=memory&cache=shared", db_num);

    let pool = SqlitePool::connect(&db_url).await.unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();

    // Set this pool as the global test pool so DI uses it
    DatabaseConnection::set_test_pool(pool.clone());

    let dirs = TestDirs {
        upload: tempfile::tempdir().unwrap(),
        persist: tempfile::tempdir().unwrap(),
    };
    Settings::set_test_settings(Settings::for_directories(
        dirs.upload.path(),
        dirs.persist.path(),
    ));

    (pool, dirs)
}

/// Clean up after test
fn cleanup_test_env() {
    DatabaseConnection::clear_test_pool();
    Settings::clear_test_settings();
}

/// Create test app - uses the global test pool and settings set by setup_test_env()
fn create_test_app() -> axum::Router {
    let provider = ServiceCollection::new()
        .add(Settings::transient())
        .add(DatabaseConnection::transient())
        .add(FixedAnswerLlm::singleton())
        .add(LengthEmbedder::singleton())
        .add(FileVectorStore::singleton())
        .add(StorageContextCache::singleton())
        .add(IndexBuilder::singleton())
        .add(DbConversationRepository::scoped())
        .add(DbConversationService::scoped())
        .add(DocumentChatEngineFactory::scoped())
        .build_provider()
        .unwrap();

    axum::Router::new()
        .nest("/api", api::router())
        .with_provider(provider)
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn body_json(response: axum::response::Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

async fn get(app: axum::Router, uri: &str) -> axum::response::Response {
    app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn post_json(app: axum::Router, uri: &str, body: Value) -> axum::response::Response {
    app.oneshot(
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
    .unwrap()
}

async fn create_conversation(document_ids: &[&str]) -> Uuid {
    let response = post_json(
        create_test_app(),
        "/api/conversations",
        json!({ "document_ids": document_ids }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    json["id"].as_str().unwrap().parse().unwrap()
}

#[tokio::test]
#[serial]
async fn test_health() {
    let (_pool, _dirs) = setup_test_env().await;

    let response = get(create_test_app(), "/api/health").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({ "status": "ok" }));

    cleanup_test_env();
}

#[tokio::test]
#[serial]
async fn test_list_conversations_empty() {
    let (_pool, _dirs) = setup_test_env().await;

    let response = get(create_test_app(), "/api/conversations").await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["conversations"].as_array().unwrap().len(), 0);

    cleanup_test_env();
}

#[tokio::test]
#[serial]
async fn test_create_and_get_conversation() {
    let (_pool, _dirs) = setup_test_env().await;

    let conversation_id = create_conversation(&["apple_10k.pdf", "notes.txt"]).await;

    let response = get(
        create_test_app(),
        &format!("/api/conversations/{conversation_id}"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["id"], conversation_id.to_string());
    assert_eq!(json["documents"], json!(["apple_10k.pdf", "notes.txt"]));
    assert_eq!(json["messages"].as_array().unwrap().len(), 0);

    let response = get(create_test_app(), "/api/conversations").await;
    let json = body_json(response).await;
    assert_eq!(json["conversations"].as_array().unwrap().len(), 1);

    cleanup_test_env();
}

#[tokio::test]
#[serial]
async fn test_create_conversation_rejects_paths_outside_uploads() {
    let (_pool, _dirs) = setup_test_env().await;

    for document_id in ["../secret.txt", "/etc/passwd.txt", "dir/notes.md"] {
        let response = post_json(
            create_test_app(),
            "/api/conversations",
            json!({ "document_ids": ["notes.txt", document_id] }),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains(document_id));
    }

    // nothing was stored for the rejected requests
    let response = get(create_test_app(), "/api/conversations").await;
    let json = body_json(response).await;
    assert_eq!(json["conversations"].as_array().unwrap().len(), 0);

    cleanup_test_env();
}

#[tokio::test]
#[serial]
async fn test_get_nonexistent_conversation() {
    let (_pool, _dirs) = setup_test_env().await;

    let fake_conversation_id = Uuid::new_v4();
    let response = get(
        create_test_app(),
        &format!("/api/conversations/{fake_conversation_id}"),
    )
    .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert!(json["error"].as_str().unwrap().contains("not found"));

    let response = get(
        create_test_app(),
        &format!("/api/conversations/{fake_conversation_id}/messages"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    cleanup_test_env();
}

#[tokio::test]
#[serial]
async fn test_post_empty_message_rejected() {
    let (_pool, _dirs) = setup_test_env().await;

    let conversation_id = create_conversation(&[]).await;
    let response = post_json(
        create_test_app(),
        &format!("/api/conversations/{conversation_id}/messages"),
        json!({ "text": "   " }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    cleanup_test_env();
}

#[tokio::test]
#[serial]
async fn test_post_message_streams_answer_and_saves_it() {
    let (_pool, dirs) = setup_test_env().await;

    std::fs::write(
        dirs.upload.path().join("notes.txt"),
        "Revenue grew in the third quarter. Margins stayed flat.",
    )
    .unwrap();
    let conversation_id = create_conversation(&["notes.txt"]).await;

    let response = post_json(
        create_test_app(),
        &format!("/api/conversations/{conversation_id}/messages"),
        json!({ "text": "How did revenue develop?" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );

    let body = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(body.contains("event: new_message"));
    assert!(body.contains("event: sub_process"));
    assert!(body.contains("constructed_query_engine"));
    assert!(body.contains("event: message_part"));
    assert!(body.contains("event: message_done"));
    assert!(!body.contains("event: message_error"));

    // the index was built and persisted for the selected document
    assert!(dirs.persist.path().read_dir().unwrap().next().is_some());

    let response = get(
        create_test_app(),
        &format!("/api/conversations/{conversation_id}/messages"),
    )
    .await;
    let json = body_json(response).await;
    let messages = json["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[0]["content"], "How did revenue develop?");
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["status"], "SUCCESS");
    assert_eq!(messages[1]["content"], ANSWER);

    cleanup_test_env();
}

#[tokio::test]
#[serial]
async fn test_post_message_with_missing_document_marks_error() {
    let (_pool, _dirs) = setup_test_env().await;

    let conversation_id = create_conversation(&["missing.pdf"]).await;
    let response = post_json(
        create_test_app(),
        &format!("/api/conversations/{conversation_id}/messages"),
        json!({ "text": "Anything?" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(body.contains("event: message_error"));
    assert!(!body.contains("event: message_done"));

    let response = get(
        create_test_app(),
        &format!("/api/conversations/{conversation_id}/messages"),
    )
    .await;
    let json = body_json(response).await;
    let messages = json["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1]["status"], "ERROR");

    cleanup_test_env();
}

#[tokio::test]
#[serial]
async fn test_list_documents_sorted() {
    let (_pool, dirs) = setup_test_env().await;

    std::fs::write(dirs.upload.path().join("b.txt"), "b").unwrap();
    std::fs::write(dirs.upload.path().join("a.pdf"), "a").unwrap();
    std::fs::create_dir(dirs.upload.path().join("nested")).unwrap();

    let response = get(create_test_app(), "/api/documents").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({ "documents": ["a.pdf", "b.txt"] })
    );

    cleanup_test_env();
}

#[tokio::test]
#[serial]
async fn test_upload_then_download() {
    let (_pool, dirs) = setup_test_env().await;

    let boundary = "TESTBOUNDARY";
    let multipart_body = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"file\"; filename=\"report.txt\"\r\n\
         Content-Type: text/plain\r\n\r\n\
         quarterly numbers\r\n\
         --{boundary}--\r\n"
    );

    let response = create_test_app()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/upload")
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={boundary}"),
                )
                .body(Body::from(multipart_body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({ "message": "文件 report.txt 已上传成功." })
    );
    assert!(dirs.upload.path().join("report.txt").is_file());

    let response = get(create_test_app(), "/api/download/report.txt").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"report.txt\""
    );
    assert_eq!(body_bytes(response).await, b"quarterly numbers");

    cleanup_test_env();
}

#[tokio::test]
#[serial]
async fn test_upload_without_file_field() {
    let (_pool, _dirs) = setup_test_env().await;

    let boundary = "TESTBOUNDARY";
    let multipart_body = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"comment\"\r\n\r\n\
         no file here\r\n\
         --{boundary}--\r\n"
    );

    let response = create_test_app()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/upload")
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={boundary}"),
                )
                .body(Body::from(multipart_body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await, json!({ "error": "No file provided" }));

    cleanup_test_env();
}

#[tokio::test]
#[serial]
async fn test_download_missing_and_invalid_files() {
    let (_pool, _dirs) = setup_test_env().await;

    let response = get(create_test_app(), "/api/download/absent.pdf").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await, json!({ "error": "File not found" }));

    let response = get(create_test_app(), "/api/download/..secret").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await, json!({ "error": "Invalid file name" }));

    cleanup_test_env();
}
