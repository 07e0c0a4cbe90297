use fitrep_core::{Repository, decode_content, encode_content};
use fitrep_sync::model::{
    Evaluation, EvaluationIndex, EvaluationIndexEntry, MarineInfo, Profile, ReportingSenior,
    SyncStatus,
};
use fitrep_sync::remote::{DirectRemoteClient, RemoteStore};
use serde_json::{Value, json};
use time::macros::datetime;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const LOGIN: &str = "jdoe@example.com";
const CONTENTS: &str = "/repos/acme/fitreps/contents";

fn client(server: &MockServer) -> DirectRemoteClient {
    DirectRemoteClient::with_base_url(
        &server.uri(),
        Repository::new("acme", "fitreps").with_branch("main"),
        "test-token",
    )
    .unwrap()
}

fn api_path(file: &str) -> String {
    format!("{CONTENTS}/{file}")
}

fn file_body(file: &str, sha: &str, content: &str) -> Value {
    json!({
        "type": "file",
        "encoding": "base64",
        "name": file.rsplit('/').next().unwrap(),
        "path": file,
        "sha": sha,
        "size": content.len(),
        "content": encode_content(content),
    })
}

fn write_body(file: &str, commit: &str) -> Value {
    json!({
        "content": { "path": file, "sha": format!("{commit}-blob") },
        "commit": { "sha": commit },
    })
}

fn evaluation(id: &str) -> Evaluation {
    let mut evaluation = Evaluation::new(
        id,
        MarineInfo {
            name: "Sgt Smith".into(),
            rank: "SGT".into(),
            ..Default::default()
        },
        ReportingSenior {
            name: "John Doe".into(),
            email: LOGIN.into(),
            rank: "CAPT".into(),
        },
    );
    evaluation.occasion = "annual".into();
    evaluation.completed_date = Some(datetime!(2024-05-01 12:00 UTC));
    evaluation
}

fn index_with(ids: &[&str]) -> EvaluationIndex {
    let mut index = EvaluationIndex::new(LOGIN);
    for id in ids {
        let file = format!("users/jdoe/evaluations/{id}.yml");
        index.upsert(EvaluationIndexEntry::for_evaluation(&evaluation(id), file));
    }
    index
}

/// Decoded file content of every write the server received for `file`.
async fn written_contents(server: &MockServer, file: &str) -> Vec<String> {
    let target = api_path(file);
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request: &&Request| {
            request.method.to_string() == "PUT" && request.url.path() == target
        })
        .map(|request| {
            let body: Value = serde_json::from_slice(&request.body).unwrap();
            decode_content(body["content"].as_str().unwrap()).unwrap()
        })
        .collect()
}

#[tokio::test]
async fn create_or_update_retries_once_with_fresh_digest_on_conflict() {
    let server = MockServer::start().await;
    let file = "users/jdoe.json";

    Mock::given(method("GET"))
        .and(path(api_path(file)))
        .respond_with(ResponseTemplate::new(200).set_body_json(file_body(file, "stale", "{}")))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(api_path(file)))
        .respond_with(ResponseTemplate::new(200).set_body_json(file_body(file, "fresh", "{}")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(api_path(file)))
        .and(body_partial_json(json!({ "sha": "stale" })))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "message": "users/jdoe.json does not match stale"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(api_path(file)))
        .and(body_partial_json(json!({ "sha": "fresh" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(write_body(file, "c2")))
        .expect(1)
        .mount(&server)
        .await;

    let commit = client(&server)
        .create_or_update(file, "{\"rsName\":\"John Doe\"}", "Update profile")
        .await
        .unwrap();

    assert_eq!(commit.commit_sha.as_deref(), Some("c2"));
}

#[tokio::test]
async fn create_or_update_gives_up_after_a_second_conflict() {
    let server = MockServer::start().await;
    let file = "users/jdoe.json";

    Mock::given(method("GET"))
        .and(path(api_path(file)))
        .respond_with(ResponseTemplate::new(200).set_body_json(file_body(file, "stale", "{}")))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(api_path(file)))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({ "message": "conflict" })))
        .expect(2)
        .mount(&server)
        .await;

    let err = client(&server)
        .create_or_update(file, "{}", "Update profile")
        .await
        .unwrap_err();

    assert!(err.is_conflict());
}

#[tokio::test]
async fn save_evaluation_writes_yaml_and_updates_index() {
    let server = MockServer::start().await;
    let eval_file = "users/jdoe/evaluations/e1.yml";
    let index_file = "users/jdoe/evaluations/index.json";

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(api_path(eval_file)))
        .respond_with(ResponseTemplate::new(201).set_body_json(write_body(eval_file, "c1")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(api_path(index_file)))
        .respond_with(ResponseTemplate::new(201).set_body_json(write_body(index_file, "c2")))
        .expect(1)
        .mount(&server)
        .await;

    let mut pending = evaluation("e1");
    pending.sync_status = SyncStatus::Pending;
    let outcome = client(&server).save_evaluation(LOGIN, &pending).await.unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.file_path.as_deref(), Some(eval_file));
    assert_eq!(outcome.commit_sha.as_deref(), Some("c1"));

    let yaml = written_contents(&server, eval_file).await;
    let stored: Evaluation = serde_yaml::from_str(&yaml[0]).unwrap();
    assert_eq!(stored.id, "e1");
    assert_eq!(stored.sync_status, SyncStatus::Synced);

    let json = written_contents(&server, index_file).await;
    let index: EvaluationIndex = serde_json::from_str(&json[0]).unwrap();
    assert_eq!(index.len(), 1);
    assert_eq!(index.get("e1").unwrap().file_path, eval_file);
}

#[tokio::test]
async fn list_evaluations_follows_the_index() {
    let server = MockServer::start().await;
    let index_file = "users/jdoe/evaluations/index.json";
    let eval_file = "users/jdoe/evaluations/e1.yml";
    let index = serde_json::to_string(&index_with(&["e1"])).unwrap();
    let yaml = serde_yaml::to_string(&evaluation("e1")).unwrap();

    Mock::given(method("GET"))
        .and(path(api_path(index_file)))
        .respond_with(ResponseTemplate::new(200).set_body_json(file_body(index_file, "i1", &index)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(api_path(eval_file)))
        .respond_with(ResponseTemplate::new(200).set_body_json(file_body(eval_file, "y1", &yaml)))
        .expect(1)
        .mount(&server)
        .await;

    let evaluations = client(&server).list_evaluations(LOGIN).await.unwrap();

    assert_eq!(evaluations.len(), 1);
    assert_eq!(evaluations[0].id, "e1");
    assert_eq!(evaluations[0].marine_info.name, "Sgt Smith");
}

#[tokio::test]
async fn list_evaluations_scans_directory_without_an_index() {
    let server = MockServer::start().await;
    let dir = "users/jdoe/evaluations";
    let eval_file = "users/jdoe/evaluations/e1.yml";
    let yaml = serde_yaml::to_string(&evaluation("e1")).unwrap();

    Mock::given(method("GET"))
        .and(path(api_path("users/jdoe/evaluations/index.json")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(api_path(dir)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "name": "e1.yml", "path": eval_file, "sha": "y1", "type": "file" },
            { "name": "notes.txt", "path": "users/jdoe/evaluations/notes.txt", "sha": "n1", "type": "file" },
            { "name": "archive", "path": "users/jdoe/evaluations/archive", "sha": "d1", "type": "dir" }
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(api_path(eval_file)))
        .respond_with(ResponseTemplate::new(200).set_body_json(file_body(eval_file, "y1", &yaml)))
        .expect(1)
        .mount(&server)
        .await;

    let evaluations = client(&server).list_evaluations(LOGIN).await.unwrap();

    assert_eq!(evaluations.len(), 1);
    assert_eq!(evaluations[0].id, "e1");
}

#[tokio::test]
async fn delete_evaluation_removes_file_and_index_entry() {
    let server = MockServer::start().await;
    let eval_file = "users/jdoe/evaluations/e1.yml";
    let index_file = "users/jdoe/evaluations/index.json";
    let index = serde_json::to_string(&index_with(&["e1", "e2"])).unwrap();

    Mock::given(method("GET"))
        .and(path(api_path(eval_file)))
        .respond_with(ResponseTemplate::new(200).set_body_json(file_body(eval_file, "y1", "id: e1")))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(api_path(eval_file)))
        .and(body_partial_json(json!({ "sha": "y1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": null,
            "commit": { "sha": "d1" }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(api_path(index_file)))
        .respond_with(ResponseTemplate::new(200).set_body_json(file_body(index_file, "i1", &index)))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(api_path(index_file)))
        .and(body_partial_json(json!({ "sha": "i1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(write_body(index_file, "c3")))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = client(&server).delete_evaluation(LOGIN, "e1").await.unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.commit_sha.as_deref(), Some("d1"));
    let json = written_contents(&server, index_file).await;
    let index: EvaluationIndex = serde_json::from_str(&json[0]).unwrap();
    assert!(index.get("e1").is_none());
    assert!(index.get("e2").is_some());
}

#[tokio::test]
async fn load_profile_returns_none_when_absent() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(api_path("users/jdoe.json")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    assert!(client(&server).load_profile(LOGIN).await.unwrap().is_none());
}

#[tokio::test]
async fn save_profile_writes_metadata_without_embedded_evaluations() {
    let server = MockServer::start().await;
    let file = "users/jdoe.json";

    Mock::given(method("GET"))
        .and(path(api_path(file)))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(api_path(file)))
        .respond_with(ResponseTemplate::new(201).set_body_json(write_body(file, "p1")))
        .expect(1)
        .mount(&server)
        .await;

    let mut profile = Profile::new("John Doe", LOGIN, "CAPT", datetime!(2024-01-01 0:00 UTC));
    profile.evaluations.push(evaluation("legacy"));
    client(&server).save_profile(&profile).await.unwrap();

    let json = written_contents(&server, file).await;
    let stored: Profile = serde_json::from_str(&json[0]).unwrap();
    assert_eq!(stored.rs_name, "John Doe");
    assert!(stored.evaluations.is_empty());
}
