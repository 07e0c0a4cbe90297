use fitrep_core::{LoginRequest, OriginPolicy, ProxyClient, ProxyError};
use serde::Deserialize;
use serde_json::json;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Debug, Deserialize, PartialEq)]
struct Summary {
    id: String,
}

fn client(server: &MockServer) -> ProxyClient {
    let policy = OriginPolicy::new([server.uri()], None);
    ProxyClient::new(&server.uri(), policy).unwrap()
}

#[tokio::test]
async fn save_evaluation_posts_envelope_and_parses_commit() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/evaluation/save"))
        .and(body_json(json!({
            "userEmail": "jdoe@example.com",
            "evaluation": { "id": "eval-1" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "filePath": "users/jdoe/evaluations/eval-1.yml",
            "commitSha": "c1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let response = client(&server)
        .save_evaluation("jdoe@example.com", &json!({ "id": "eval-1" }))
        .await
        .unwrap();

    assert_eq!(
        response.file_path.as_deref(),
        Some("users/jdoe/evaluations/eval-1.yml")
    );
    assert_eq!(response.commit_sha.as_deref(), Some("c1"));
}

#[tokio::test]
async fn ok_false_is_rejected() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/account/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": false,
            "error": "Invalid credentials"
        })))
        .mount(&server)
        .await;

    let err = client(&server)
        .login(&LoginRequest {
            email: "jdoe@example.com",
            password: "wrong",
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ProxyError::Rejected(message) if message == "Invalid credentials"));
}

#[tokio::test]
async fn load_user_returns_none_on_404() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/user/load"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "ok": false,
            "error": "Not found"
        })))
        .mount(&server)
        .await;

    let profile: Option<serde_json::Value> =
        client(&server).load_user("jdoe@example.com").await.unwrap();
    assert!(profile.is_none());
}

#[tokio::test]
async fn list_evaluations_deserializes_payload() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/evaluation/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "evaluations": [{ "id": "eval-1" }, { "id": "eval-2" }]
        })))
        .mount(&server)
        .await;

    let items: Vec<Summary> = client(&server)
        .list_evaluations("jdoe@example.com")
        .await
        .unwrap();
    assert_eq!(
        items,
        vec![
            Summary {
                id: "eval-1".into()
            },
            Summary {
                id: "eval-2".into()
            }
        ]
    );
}

#[tokio::test]
async fn disallowed_origin_never_reaches_the_network() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .expect(0)
        .mount(&server)
        .await;

    let policy = OriginPolicy::new(["https://api.fitrep.example"], None);
    let client = ProxyClient::new(&server.uri(), policy).unwrap();
    let err = client.logout().await.unwrap_err();

    assert!(matches!(err, ProxyError::OriginNotAllowed(_)));
    assert!(err.is_configuration());
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn server_errors_carry_backend_message() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/evaluation/delete"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({
            "ok": false,
            "error": "GitHub unavailable"
        })))
        .mount(&server)
        .await;

    let err = client(&server)
        .delete_evaluation("jdoe@example.com", "eval-1")
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert!(matches!(err, ProxyError::Api { body, .. } if body == "GitHub unavailable"));
}
