use axum::{
    extract::{ Path, State },
    http::{ header, HeaderMap, StatusCode },
    response::{ IntoResponse, Response },
    routing::post,
    Json,
    Router,
};
use futures::StreamExt;
use kisan_dost::chat::{ StreamAggregator, SubmitOutcome };
use kisan_dost::config::prompt::PromptConfig;
use kisan_dost::gateway::Gateway;
use kisan_dost::llm::chat::{ ChatSession, GeminiChatSession };
use kisan_dost::llm::diagnosis::{ DiagnosisClient, GeminiDiagnosisClient };
use kisan_dost::llm::{ build_http_client, GatewayError, LlmConfig };
use kisan_dost::models::diagnosis::ImageUpload;
use serde_json::{ json, Value };
use std::collections::VecDeque;
use std::sync::{ Arc, Mutex };

struct Recorded {
    call: String,
    api_key: Option<String>,
    body: Value,
}

#[derive(Clone, Default)]
struct FakeGemini {
    replies: Arc<Mutex<VecDeque<(StatusCode, &'static str, String)>>>,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl FakeGemini {
    fn reply(&self, status: StatusCode, content_type: &'static str, body: impl Into<String>) {
        self.replies.lock().unwrap().push_back((status, content_type, body.into()));
    }

    fn sse(&self, chunks: &[&str]) {
        let body: String = chunks
            .iter()
            .map(|text| {
                let payload = json!({
                    "candidates": [{ "content": { "role": "model", "parts": [{ "text": text }] } }]
                });
                format!("data: {}\r\n\r\n", payload)
            })
            .collect();
        self.reply(StatusCode::OK, "text/event-stream", body);
    }

    fn json_text(&self, text: &str) {
        let body = json!({
            "candidates": [{ "content": { "role": "model", "parts": [{ "text": text }] } }]
        });
        self.reply(StatusCode::OK, "application/json", body.to_string());
    }

    fn requests(&self) -> std::sync::MutexGuard<'_, Vec<Recorded>> {
        self.requests.lock().unwrap()
    }
}

async fn handle(
    State(fake): State<FakeGemini>,
    Path(call): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>
) -> Response {
    fake.requests.lock().unwrap().push(Recorded {
        call,
        api_key: headers
            .get("x-goog-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body,
    });
    let next = fake.replies.lock().unwrap().pop_front();
    match next {
        Some((status, content_type, body)) => (status, [(header::CONTENT_TYPE, content_type)], body).into_response(),
        None => (StatusCode::INTERNAL_SERVER_ERROR, "no reply queued").into_response(),
    }
}

async fn start_fake() -> (FakeGemini, LlmConfig) {
    let fake = FakeGemini::default();
    let app = Router::new().route("/v1beta/models/{call}", post(handle)).with_state(fake.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    let config = LlmConfig {
        api_key: Some("test-key".to_string()),
        model: "gemini-test".to_string(),
        base_url: format!("http://{}/v1beta", addr),
        ..LlmConfig::default()
    };
    (fake, config)
}

async fn collect(session: &GeminiChatSession, message: &str) -> Vec<Result<String, GatewayError>> {
    session.stream_reply(message).await.unwrap().collect().await
}

#[tokio::test]
async fn chat_streams_sse_chunks_and_remembers_the_exchange() {
    let (fake, config) = start_fake().await;
    let http = build_http_client(config.credential()).unwrap();
    let session = GeminiChatSession::new(http, &config, "You are Kisan AI.");

    fake.sse(&["Tomato", " prices are ₹20/kg."]);
    let chunks: Vec<String> = collect(&session, "What are tomato prices today?").await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert_eq!(chunks, vec!["Tomato", " prices are ₹20/kg."]);
    assert_eq!(session.turn_count(), 2);

    fake.sse(&["In Nashik, yes."]);
    collect(&session, "Same in Nashik?").await;

    let requests = fake.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].call, "gemini-test:streamGenerateContent");
    assert_eq!(requests[0].api_key.as_deref(), Some("test-key"));
    assert_eq!(requests[0].body["systemInstruction"]["parts"][0]["text"], "You are Kisan AI.");

    let contents = requests[1].body["contents"].as_array().unwrap();
    assert_eq!(contents.len(), 3);
    assert_eq!(contents[0]["role"], "user");
    assert_eq!(contents[1]["role"], "model");
    assert_eq!(contents[1]["parts"][0]["text"], "Tomato prices are ₹20/kg.");
    assert_eq!(contents[2]["parts"][0]["text"], "Same in Nashik?");
}

#[tokio::test]
async fn chat_http_error_surfaces_service_message() {
    let (fake, config) = start_fake().await;
    let http = build_http_client(config.credential()).unwrap();
    let session = GeminiChatSession::new(http, &config, "You are Kisan AI.");

    fake.reply(
        StatusCode::TOO_MANY_REQUESTS,
        "application/json",
        json!({ "error": { "code": 429, "message": "Quota exceeded", "status": "RESOURCE_EXHAUSTED" } }).to_string()
    );
    let items = collect(&session, "hello").await;
    assert_eq!(items.len(), 1);
    match &items[0] {
        Err(GatewayError::Transport(message)) => {
            assert!(message.contains("429"));
            assert!(message.contains("Quota exceeded"));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(session.turn_count(), 0);
}

#[tokio::test]
async fn malformed_stream_payload_is_a_decode_error() {
    let (fake, config) = start_fake().await;
    let http = build_http_client(config.credential()).unwrap();
    let session = GeminiChatSession::new(http, &config, "You are Kisan AI.");

    fake.reply(StatusCode::OK, "text/event-stream", "data: {\"candidates\": [\r\n\r\n");
    let items = collect(&session, "hello").await;
    assert!(matches!(items.last(), Some(Err(GatewayError::Decode(_)))));
    assert_eq!(session.turn_count(), 0);
}

#[tokio::test]
async fn aggregator_over_real_http_finalizes_reply() {
    let (fake, config) = start_fake().await;
    let http = build_http_client(config.credential()).unwrap();
    let gateway = Gateway::from_config(&config, http, &PromptConfig::default());
    let chat = StreamAggregator::new(Arc::new(gateway));

    fake.sse(&["Use ", "neem oil."]);
    let outcome = chat.submit("aphids on cotton").await;

    match outcome {
        SubmitOutcome::Finalized { content, .. } => assert_eq!(content, "Use neem oil."),
        other => panic!("unexpected {:?}", other),
    }
    let history = chat.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].content, "Use neem oil.");
}

#[tokio::test]
async fn diagnosis_sends_image_and_schema() {
    let (fake, config) = start_fake().await;
    let http = build_http_client(config.credential()).unwrap();
    let client = GeminiDiagnosisClient::new(http, &config, "Analyze the provided image of a plant leaf.");

    fake.json_text(
        r#"{"disease":"Leaf Blight","description":"Brown lesions","remedy":"- Remove affected leaves\n- Apply copper fungicide"}"#
    );
    let image = ImageUpload::new(vec![0xff, 0xd8, 0xff], "image/jpeg").unwrap();
    let result = client.diagnose(&image).await.unwrap();
    assert_eq!(result.disease, "Leaf Blight");
    assert_eq!(result.remedy, "- Remove affected leaves\n- Apply copper fungicide");

    let requests = fake.requests();
    assert_eq!(requests[0].call, "gemini-test:generateContent");
    let body = &requests[0].body;
    assert_eq!(body["contents"][0]["parts"][0]["inlineData"]["mimeType"], "image/jpeg");
    assert_eq!(body["contents"][0]["parts"][0]["inlineData"]["data"], "/9j/");
    assert_eq!(body["contents"][0]["parts"][1]["text"], "Analyze the provided image of a plant leaf.");
    assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
    assert_eq!(body["generationConfig"]["responseSchema"]["type"], "OBJECT");
}

#[tokio::test]
async fn diagnosis_with_wrong_shape_fails() {
    let (fake, config) = start_fake().await;
    let http = build_http_client(config.credential()).unwrap();
    let client = GeminiDiagnosisClient::new(http, &config, "Analyze.");

    fake.json_text(r#"{"disease":"Leaf Blight"}"#);
    let image = ImageUpload::new(vec![1], "image/png").unwrap();
    assert!(matches!(client.diagnose(&image).await, Err(GatewayError::Shape(_))));
}
