use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use base64::Engine as _;
use serde_json::Value;

pub const STUB_API_KEY: &str = "stub-key";

pub const STUB_ABSTRACT: &str = "Title: The Keeper of Gull Point\n\
Setting: a lighthouse on a storm-worn coast.\n\
Characters: Mara, the keeper; Tomas, a shipwrecked sailor.\n\
Chapter 1: Mara tends the light alone.\n\
Chapter 2: A storm drives Tomas onto the rocks.\n\
Chapter 3: The light fails and they relight it together.\n";

#[derive(Debug, Clone)]
pub struct GeminiStubConfig {
    pub planned_chapters: u32,
    /// Answer to the "last fully written chapter" question.
    pub written_chapters: u32,
    /// Number of chapter requests answered with a 500 before succeeding.
    pub failing_chapter_requests: usize,
}

impl Default for GeminiStubConfig {
    fn default() -> Self {
        Self {
            planned_chapters: 3,
            written_chapters: 0,
            failing_chapter_requests: 0,
        }
    }
}

#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub api_key: Option<String>,
    pub body: Value,
}

#[allow(dead_code)]
impl RecordedRequest {
    pub fn prompt(&self) -> &str {
        last_prompt(&self.body).unwrap_or("")
    }

    pub fn thought_signature(&self) -> Option<&str> {
        self.body
            .get("contents")?
            .as_array()?
            .last()?
            .pointer("/parts/0/thoughtSignature")?
            .as_str()
    }
}

pub struct GeminiStub {
    pub base_url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

#[allow(dead_code)]
impl GeminiStub {
    pub fn spawn(config: GeminiStubConfig) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start gemini stub server");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}/v1beta");

        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&requests);
        let chapter_requests = AtomicUsize::new(0);

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let mut request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                let path = request.url().to_string();
                let api_key = request
                    .headers()
                    .iter()
                    .find(|h| h.field.equiv("x-goog-api-key"))
                    .map(|h| h.value.as_str().to_owned());

                let mut raw = String::new();
                let body: Value = match request
                    .as_reader()
                    .read_to_string(&mut raw)
                    .ok()
                    .and_then(|_| serde_json::from_str(&raw).ok())
                {
                    Some(body) => body,
                    None => {
                        let _ = request.respond(error_response(400, "invalid json body"));
                        continue;
                    }
                };

                recorded
                    .lock()
                    .expect("lock recorded requests")
                    .push(RecordedRequest {
                        path: path.clone(),
                        api_key: api_key.clone(),
                        body: body.clone(),
                    });

                if request.method() != &tiny_http::Method::Post
                    || !path.starts_with("/v1beta/models/")
                {
                    let _ = request.respond(error_response(404, "not found"));
                    continue;
                }
                if api_key.is_none() {
                    let _ = request.respond(error_response(403, "missing api key"));
                    continue;
                }

                if path.ends_with(":countTokens") {
                    let _ = request.respond(json_response(
                        200,
                        &serde_json::json!({ "totalTokens": 1000 }),
                    ));
                    continue;
                }
                if !path.ends_with(":generateContent") {
                    let _ = request.respond(error_response(404, "unknown method"));
                    continue;
                }

                let prompt = last_prompt(&body).unwrap_or("").to_owned();
                let reply = if prompt.contains("Write a concise, compelling story writing plan") {
                    Reply::text(STUB_ABSTRACT, Some("abstract-signature"))
                } else if prompt.contains("return ONLY the total number of chapters") {
                    Reply::text(&format!("{}\n", config.planned_chapters), None)
                } else if prompt.contains("last *fully written* chapter") {
                    Reply::text(&config.written_chapters.to_string(), None)
                } else if let Some(chapter) = requested_chapter(&prompt) {
                    let seen = chapter_requests.fetch_add(1, Ordering::SeqCst);
                    if seen < config.failing_chapter_requests {
                        Reply::Failure
                    } else {
                        Reply::text(
                            &format!("Mara climbs the stairs in chapter {chapter}."),
                            Some(&format!("chapter-{chapter}-signature")),
                        )
                    }
                } else {
                    Reply::Failure
                };

                let response = match reply {
                    Reply::Text { text, signature } => {
                        json_response(200, &generate_body(&text, signature.as_deref()))
                    }
                    Reply::Failure => error_response(500, "stub failure"),
                };
                let _ = request.respond(response);
            }
        });

        Self {
            base_url,
            requests,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("lock recorded requests").clone()
    }

    pub fn chapter_prompts(&self) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.path.ends_with(":generateContent") && requested_chapter(r.prompt()).is_some())
            .collect()
    }
}

impl Drop for GeminiStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

enum Reply {
    Text {
        text: String,
        signature: Option<String>,
    },
    Failure,
}

impl Reply {
    fn text(text: &str, signature: Option<&str>) -> Self {
        Self::Text {
            text: text.to_owned(),
            signature: signature.map(str::to_owned),
        }
    }
}

pub fn encode_signature(raw: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(raw.as_bytes())
}

fn generate_body(text: &str, signature: Option<&str>) -> Value {
    let mut part = serde_json::json!({ "text": text });
    if let Some(signature) = signature {
        part["thoughtSignature"] = Value::String(encode_signature(signature));
    }
    serde_json::json!({
        "candidates": [
            {
                "content": {
                    "role": "model",
                    "parts": [
                        { "text": "thinking it over", "thought": true },
                        part
                    ]
                },
                "finishReason": "STOP"
            }
        ],
        "usageMetadata": {
            "promptTokenCount": 1000,
            "candidatesTokenCount": 500,
            "totalTokenCount": 1500
        }
    })
}

fn json_response(status: u16, body: &Value) -> tiny_http::Response<std::io::Cursor<Vec<u8>>> {
    let header = tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
        .expect("build header");
    tiny_http::Response::from_string(body.to_string())
        .with_status_code(status)
        .with_header(header)
}

fn error_response(status: u16, message: &str) -> tiny_http::Response<std::io::Cursor<Vec<u8>>> {
    json_response(
        status,
        &serde_json::json!({ "error": { "code": status, "message": message } }),
    )
}

fn last_prompt(body: &Value) -> Option<&str> {
    body.get("contents")?
        .as_array()?
        .last()?
        .pointer("/parts/0/text")?
        .as_str()
}

fn requested_chapter(prompt: &str) -> Option<u32> {
    let marker = "please write Chapter ";
    let start = prompt.find(marker)? + marker.len();
    let digits: String = prompt[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}
