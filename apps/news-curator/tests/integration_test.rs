use chrono::{TimeZone, Utc};
use news_curator::{run, Config, CuratorError, TopicOutcome};
use serial_test::serial;
use std::collections::HashMap;
use wiremock::matchers::{body_json, body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const GEMINI_PATH: &str = "/v1beta/models/gemini-2.5-pro:generateContent";

fn config_for(server: &MockServer, topics_json: &str, extra: &[(&str, &str)]) -> Config {
    let mut vars: HashMap<String, String> = HashMap::from([
        ("TOPICS_CONFIG".to_string(), topics_json.to_string()),
        ("SLACK_BOT_TOKEN".to_string(), "xoxb-test".to_string()),
        ("GEMINI_API_KEY".to_string(), "test-key".to_string()),
        ("GEMINI_BASE_URL".to_string(), server.uri()),
        ("SLACK_API_BASE_URL".to_string(), server.uri()),
    ]);
    for (k, v) in extra {
        vars.insert(k.to_string(), v.to_string());
    }
    Config::from_lookup(move |key| vars.get(key).cloned()).unwrap()
}

fn gemini_text(text: &str) -> serde_json::Value {
    serde_json::json!({
        "candidates": [{
            "content": {"role": "model", "parts": [{"text": text}]},
            "groundingMetadata": {
                "groundingChunks": [{"web": {"uri": "https://grounding.example/r/1", "title": "b.example"}}]
            }
        }]
    })
}

async fn mount_auth(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/auth.test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": true, "user_id": "U_BOT", "bot_id": "B_BOT"
        })))
        .mount(server)
        .await;
}

async fn mount_history(server: &MockServer, channel: &str, messages: serde_json::Value) {
    history_mock(channel, None, messages).mount(server).await;
}

fn history_mock(channel: &str, oldest: Option<&str>, messages: serde_json::Value) -> Mock {
    let mut builder = Mock::given(method("GET"))
        .and(path("/conversations.history"))
        .and(query_param("channel", channel));
    if let Some(oldest) = oldest {
        builder = builder.and(query_param("oldest", oldest));
    }
    builder.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "ok": true, "messages": messages, "has_more": false
    })))
}

async fn mount_post_ok(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/chat.postMessage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": true, "channel": "C", "ts": "1760745600.000100"
        })))
        .mount(server)
        .await;
}

async fn posted_bodies(server: &MockServer) -> Vec<serde_json::Value> {
    let requests: Vec<Request> = server.received_requests().await.unwrap();
    requests
        .iter()
        .filter(|r| r.url.path() == "/chat.postMessage")
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect()
}

fn section_texts(body: &serde_json::Value) -> Vec<String> {
    body["blocks"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|b| b["type"] == "section")
        .map(|b| b["text"]["text"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_previously_posted_items_are_not_reposted() {
    let server = MockServer::start().await;
    mount_auth(&server).await;
    // HISTORY_DAYS defaults to 3: 2026-10-18T00:00Z minus three days
    history_mock(
        "C1",
        Some("1792022400"),
        serde_json::json!([
            {
                "ts": "1760659200.000100",
                "bot_id": "B_BOT",
                "blocks": [{"type": "section", "text": {"type": "mrkdwn", "text": "*<https://a.example/x|Yesterday's story>*\n>old"}}]
            },
            {
                "ts": "1760659300.000100",
                "user": "U_HUMAN",
                "blocks": [{"type": "section", "text": {"type": "mrkdwn", "text": "*<https://b.example/y|Shared by a person>*"}}]
            }
        ]),
    )
    .expect(1)
    .mount(&server)
    .await;
    mount_post_ok(&server).await;

    Mock::given(method("POST"))
        .and(path(GEMINI_PATH))
        .and(body_string_contains("https://a.example/x"))
        .respond_with(ResponseTemplate::new(200).set_body_json(gemini_text(
            r#"```json
{"items": [
  {"title": "Yesterday's story", "summary": "again", "url": "https://a.example/x", "source": "A", "published_at": "2026-10-17"},
  {"title": "Fresh story", "summary": "new", "url": "https://b.example/y", "source": "B", "published_at": "2026-10-18"}
], "trend": "Things move fast."}
```"#,
        )))
        .expect(1)
        .mount(&server)
        .await;

    let config = config_for(
        &server,
        r#"[{"name": "生成AI", "channel_id": "C1", "header": "🤖 News"}]"#,
        &[],
    );
    let now = Utc.with_ymd_and_hms(2026, 10, 18, 0, 0, 0).unwrap();
    let report = run(&config, now).await.unwrap();

    assert!(report.is_success());
    assert!(matches!(report.topics[0].outcome, TopicOutcome::Posted { items: 1, .. }));

    let bodies = posted_bodies(&server).await;
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["channel"], "C1");
    assert_eq!(bodies[0]["text"], "🤖 News");
    let sections = section_texts(&bodies[0]);
    assert_eq!(sections[0], "*<https://b.example/y|Fresh story>*\n>new");
    assert!(sections.iter().all(|s| !s.contains("https://a.example/x")));
    assert!(sections[1].contains("Things move fast."));
}

#[tokio::test]
async fn test_failed_topic_does_not_block_others() {
    let server = MockServer::start().await;
    mount_auth(&server).await;
    mount_history(&server, "C1", serde_json::json!([])).await;
    mount_history(&server, "C2", serde_json::json!([])).await;
    mount_post_ok(&server).await;

    Mock::given(method("POST"))
        .and(path(GEMINI_PATH))
        .and(body_string_contains("Broken topic"))
        .respond_with(ResponseTemplate::new(429).set_body_string("RESOURCE_EXHAUSTED"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(GEMINI_PATH))
        .and(body_string_contains("Working topic"))
        .respond_with(ResponseTemplate::new(200).set_body_json(gemini_text(
            r#"{"items": [{"title": "Works", "url": "https://c.example/z"}]}"#,
        )))
        .expect(1)
        .mount(&server)
        .await;

    let config = config_for(
        &server,
        r#"[
            {"name": "Broken topic", "channel_id": "C1"},
            {"name": "Working topic", "channel_id": "C2"}
        ]"#,
        &[],
    );
    let report = run(&config, Utc::now()).await.unwrap();

    assert!(!report.is_success());
    assert!(matches!(
        report.topics[0].outcome,
        TopicOutcome::Failed(CuratorError::Generation(_))
    ));
    assert!(matches!(report.topics[1].outcome, TopicOutcome::Posted { .. }));

    let bodies = posted_bodies(&server).await;
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["channel"], "C2");
    assert_eq!(bodies[0]["text"], "Working topic ニュース");
}

#[tokio::test]
async fn test_history_read_failure_still_publishes() {
    let server = MockServer::start().await;
    mount_auth(&server).await;
    mount_post_ok(&server).await;

    Mock::given(method("GET"))
        .and(path("/conversations.history"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": false, "error": "missing_scope"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(GEMINI_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(gemini_text(
            r#"{"items": [{"title": "Works", "url": "https://c.example/z"}]}"#,
        )))
        .mount(&server)
        .await;

    let config = config_for(&server, r#"[{"name": "Rust", "channel_id": "C1"}]"#, &[]);
    let report = run(&config, Utc::now()).await.unwrap();

    assert!(report.is_success());
    assert_eq!(posted_bodies(&server).await.len(), 1);
}

#[tokio::test]
async fn test_publish_error_fails_topic() {
    let server = MockServer::start().await;
    mount_auth(&server).await;
    mount_history(&server, "C404", serde_json::json!([])).await;

    Mock::given(method("POST"))
        .and(path(GEMINI_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(gemini_text(
            r#"{"items": [{"title": "Works", "url": "https://c.example/z"}]}"#,
        )))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat.postMessage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": false, "error": "channel_not_found"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = config_for(&server, r#"[{"name": "Rust", "channel_id": "C404"}]"#, &[]);
    let report = run(&config, Utc::now()).await.unwrap();

    assert!(!report.is_success());
    match &report.topics[0].outcome {
        TopicOutcome::Failed(CuratorError::Publish(e)) => {
            assert!(e.to_string().contains("channel_not_found"))
        }
        other => panic!("expected publish failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_no_news_policy() {
    for (post_empty, expected_posts) in [("false", 0), ("true", 1)] {
        let server = MockServer::start().await;
        mount_auth(&server).await;
        mount_history(&server, "C1", serde_json::json!([])).await;
        mount_post_ok(&server).await;
        Mock::given(method("POST"))
            .and(path(GEMINI_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(gemini_text(
                "該当するニュースは見つかりませんでした",
            )))
            .mount(&server)
            .await;

        let config = config_for(
            &server,
            r#"[{"name": "Rust", "channel_id": "C1"}]"#,
            &[("POST_EMPTY_DIGEST", post_empty)],
        );
        let report = run(&config, Utc::now()).await.unwrap();
        assert!(report.is_success());

        let bodies = posted_bodies(&server).await;
        assert_eq!(bodies.len(), expected_posts, "POST_EMPTY_DIGEST={}", post_empty);
        for body in &bodies {
            assert_eq!(
                section_texts(body),
                vec!["No new items found in the past 24 hours.".to_string()]
            );
        }
    }
}

const IMAGE_PATH: &str = "/v1beta/models/gemini-2.5-flash-image:generateContent";

async fn mount_comic_story(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(GEMINI_PATH))
        .and(body_string_contains("yonkoma"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "candidates": [{"content": {"parts": [{"text":
                "1コマ目: ずんだもんが速報に飛びつく\n2コマ目: あんこもんが眉をひそめる\n3コマ目: 二人で議論\n4コマ目: 結局おやつの時間"
            }]}}]
        })))
        .expect(1)
        .mount(server)
        .await;
}

async fn mount_grounded_news(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(GEMINI_PATH))
        .and(body_string_contains("googleSearch"))
        .respond_with(ResponseTemplate::new(200).set_body_json(gemini_text(
            r#"{"items": [{"title": "Works", "url": "https://c.example/z"}], "trend": "Chips get cheaper."}"#,
        )))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_comic_is_uploaded_into_the_digest_thread() {
    let server = MockServer::start().await;
    mount_auth(&server).await;
    mount_history(&server, "C1", serde_json::json!([])).await;
    mount_post_ok(&server).await;
    mount_grounded_news(&server).await;
    mount_comic_story(&server).await;

    Mock::given(method("POST"))
        .and(path(IMAGE_PATH))
        .and(body_string_contains("\"responseModalities\":[\"IMAGE\"]"))
        .and(body_string_contains("Panel 4 (bottom, punchline): 結局おやつの時間"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "candidates": [{"content": {"parts": [{"inlineData": {"mimeType": "image/png", "data": "iVBORw0K"}}]}}]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files.getUploadURLExternal"))
        .and(query_param("filename", "comic.png"))
        .and(query_param("length", "6"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "ok": true,
            "upload_url": format!("{}/upload/F1", server.uri()),
            "file_id": "F1"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/upload/F1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/files.completeUploadExternal"))
        .and(body_json(serde_json::json!({
            "files": [{"id": "F1", "title": "Rust comic"}],
            "channel_id": "C1",
            "thread_ts": "1760745600.000100"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let config = config_for(
        &server,
        r#"[{"name": "Rust", "channel_id": "C1"}]"#,
        &[("GENERATE_MANGA", "true")],
    );
    let report = run(&config, Utc::now()).await.unwrap();

    assert!(report.is_success());
    assert!(matches!(
        report.topics[0].outcome,
        TopicOutcome::Posted {
            items: 1,
            illustrated: true,
            ..
        }
    ));
    assert_eq!(posted_bodies(&server).await.len(), 1);
}

#[tokio::test]
async fn test_failed_comic_leaves_the_digest_posted() {
    let server = MockServer::start().await;
    mount_auth(&server).await;
    mount_history(&server, "C1", serde_json::json!([])).await;
    mount_post_ok(&server).await;
    mount_grounded_news(&server).await;
    mount_comic_story(&server).await;

    Mock::given(method("POST"))
        .and(path(IMAGE_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_string("model does not support IMAGE"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files.getUploadURLExternal"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .expect(0)
        .mount(&server)
        .await;

    let config = config_for(
        &server,
        r#"[{"name": "Rust", "channel_id": "C1"}]"#,
        &[("GENERATE_MANGA", "true")],
    );
    let report = run(&config, Utc::now()).await.unwrap();

    assert!(report.is_success());
    assert!(matches!(
        report.topics[0].outcome,
        TopicOutcome::Posted {
            illustrated: false,
            ..
        }
    ));
    assert_eq!(posted_bodies(&server).await.len(), 1);
}

#[test]
#[serial]
fn test_invalid_descriptor_from_env_is_rejected() {
    std::env::set_var(
        "TOPICS_CONFIG",
        r#"[{"name": "A", "channel_id": "C1"}, {"name": "B"}]"#,
    );
    std::env::set_var("SLACK_BOT_TOKEN", "xoxb-test");
    std::env::set_var("GEMINI_API_KEY", "test-key");

    let result = Config::from_env();

    std::env::remove_var("TOPICS_CONFIG");
    std::env::remove_var("SLACK_BOT_TOKEN");
    std::env::remove_var("GEMINI_API_KEY");

    match result {
        Err(CuratorError::Config(msg)) => assert!(msg.contains("TOPICS_CONFIG[1]")),
        other => panic!("expected configuration error, got {:?}", other.map(|_| ())),
    }
}

#[test]
#[serial]
fn test_legacy_variables_from_env() {
    std::env::remove_var("TOPICS_CONFIG");
    std::env::set_var("CURATOR_TOPIC", "Rust");
    std::env::set_var("SLACK_CHANNEL_ID", "C9");
    std::env::set_var("SLACK_BOT_TOKEN", "xoxb-test");
    std::env::set_var("GEMINI_API_KEY", "test-key");

    let result = Config::from_env();

    for key in ["CURATOR_TOPIC", "SLACK_CHANNEL_ID", "SLACK_BOT_TOKEN", "GEMINI_API_KEY"] {
        std::env::remove_var(key);
    }

    let config = result.unwrap();
    assert_eq!(config.topics.len(), 1);
    assert_eq!(config.topics[0].destination_id, "C9");
}
