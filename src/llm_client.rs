use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::AssistantConfig;
use crate::keywords::KeywordCategory;

/// Attached to the final event whenever the reply did not come from the primary strategy.
pub const FALLBACK_WARNING: &str = "AI服务暂时不可用，使用备用响应";

const DONE_SENTINEL: &str = "[DONE]";

/// Receives each reply fragment as soon as it is available.
pub type DeltaSink<'a> = dyn Fn(&str) + Send + Sync + 'a;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_url: String, api_key: Option<String>, model: String) -> Self {
        Self {
            api_url,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            model,
            temperature: 0.7,
            max_tokens: 1000,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &AssistantConfig) -> Self {
        let mut client = Self::new(
            config.llm_api_url.clone(),
            config.llm_api_key.clone(),
            config.llm_model.clone(),
        );
        client.temperature = config.llm_temperature;
        client.max_tokens = config.llm_max_tokens;
        client
    }

    pub fn has_credential(&self) -> bool {
        self.api_key.is_some()
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_url.trim_end_matches('/'))
    }

    fn request(&self, messages: &[Message], stream: bool) -> Result<reqwest::RequestBuilder> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("LLM API key is not configured"))?;

        let body = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream,
        };

        Ok(self
            .client
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", key))
            .json(&body))
    }

    /// One non-streaming completion.
    pub async fn complete(&self, messages: &[Message]) -> Result<String> {
        let response = self
            .request(messages, false)?
            .send()
            .await
            .context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("LLM API error {}: {}", status, body);
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("Empty choices in LLM response"))
    }

    /// Stream a completion, forwarding each content fragment to `on_delta`.
    ///
    /// Returns the concatenated text once the `[DONE]` sentinel arrives. Ending the body
    /// without the sentinel is an error.
    pub async fn stream(&self, messages: &[Message], on_delta: &DeltaSink<'_>) -> Result<String> {
        let mut response = self
            .request(messages, true)?
            .send()
            .await
            .context("Failed to send streaming LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Streaming LLM API error {}: {}", status, body);
        }

        let mut decoder = SseDecoder::default();
        let mut accumulator = StreamAccumulator::default();
        accumulator.begin();

        while let Some(chunk) = response
            .chunk()
            .await
            .context("Failed reading streaming chunk")?
        {
            for frame in decoder.feed(&chunk)? {
                accumulator.apply(frame, on_delta)?;
            }
            if accumulator.state() == StreamState::Completed {
                break;
            }
        }

        if accumulator.state() == StreamState::Streaming {
            for frame in decoder.finish()? {
                accumulator.apply(frame, on_delta)?;
            }
        }

        accumulator.finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    Data(String),
    Done,
}

/// Incremental SSE decoder over raw body bytes.
///
/// Bytes are buffered until a full line is available, so a multi-byte character split
/// across chunks is only decoded once both halves have arrived.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data: Option<String>,
}

impl SseDecoder {
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = std::str::from_utf8(&line).context("Stream line is not valid UTF-8")?;
            if let Some(frame) = self.process_line(line) {
                frames.push(frame);
            }
        }

        Ok(frames)
    }

    /// Flush whatever is left once the body has ended.
    pub fn finish(&mut self) -> Result<Vec<SseFrame>> {
        let mut frames = Vec::new();
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = std::str::from_utf8(&rest).context("Stream tail is not valid UTF-8")?;
            let line = line.trim_end_matches('\r');
            if let Some(frame) = self.process_line(line) {
                frames.push(frame);
            }
        }
        if let Some(frame) = self.dispatch() {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field == "data" {
            match self.data.as_mut() {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            }
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let data = self.data.take()?;
        if data.trim() == DONE_SENTINEL {
            Some(SseFrame::Done)
        } else {
            Some(SseFrame::Data(data))
        }
    }
}

/// `choices[0].delta.content` of one stream payload, if present.
pub fn parse_delta(payload: &str) -> Result<Option<String>> {
    let chunk: serde_json::Value = serde_json::from_str(payload)
        .with_context(|| format!("Failed to parse stream payload: {}", payload))?;
    Ok(chunk["choices"]
        .as_array()
        .and_then(|choices| choices.first())
        .and_then(|choice| choice["delta"]["content"].as_str())
        .filter(|content| !content.is_empty())
        .map(str::to_string))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamState {
    #[default]
    Idle,
    Streaming,
    Completed,
    Failed,
}

/// Tracks one streamed reply through `Idle -> Streaming -> Completed | Failed`.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    state: StreamState,
    text: String,
}

impl StreamAccumulator {
    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn begin(&mut self) {
        if self.state == StreamState::Idle {
            self.state = StreamState::Streaming;
        }
    }

    pub fn apply(&mut self, frame: SseFrame, on_delta: &DeltaSink<'_>) -> Result<()> {
        if self.state != StreamState::Streaming {
            return Ok(());
        }
        match frame {
            SseFrame::Done => {
                self.state = StreamState::Completed;
            }
            SseFrame::Data(payload) => match parse_delta(&payload) {
                Ok(Some(content)) => {
                    on_delta(&content);
                    self.text.push_str(&content);
                }
                Ok(None) => {}
                Err(e) => {
                    self.state = StreamState::Failed;
                    return Err(e);
                }
            },
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<String> {
        match self.state {
            StreamState::Completed => Ok(self.text),
            StreamState::Streaming => {
                self.state = StreamState::Failed;
                anyhow::bail!("Stream ended before the [DONE] sentinel")
            }
            StreamState::Idle => anyhow::bail!("Stream was never started"),
            StreamState::Failed => anyhow::bail!("Stream failed"),
        }
    }
}

/// Input for one reply attempt.
#[derive(Debug, Clone, Copy)]
pub struct ReplyRequest<'a> {
    pub messages: &'a [Message],
    pub user_message: &'a str,
}

/// One way of producing the assistant's reply.
#[async_trait]
pub trait ReplyStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Upper bound for one attempt; `None` means unbounded.
    fn timeout(&self) -> Option<Duration>;

    /// True for the static keyword-sniffed reply.
    fn is_canned(&self) -> bool {
        false
    }

    /// Produce the full reply, emitting it through `on_delta` as it becomes available.
    async fn generate(&self, request: ReplyRequest<'_>, on_delta: &DeltaSink<'_>) -> Result<String>;
}

pub struct StreamingStrategy {
    client: Arc<LlmClient>,
    timeout: Duration,
}

impl StreamingStrategy {
    pub fn new(client: Arc<LlmClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl ReplyStrategy for StreamingStrategy {
    fn name(&self) -> &'static str {
        "stream"
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn generate(&self, request: ReplyRequest<'_>, on_delta: &DeltaSink<'_>) -> Result<String> {
        self.client.stream(request.messages, on_delta).await
    }
}

pub struct CompletionStrategy {
    client: Arc<LlmClient>,
    timeout: Duration,
}

impl CompletionStrategy {
    pub fn new(client: Arc<LlmClient>, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl ReplyStrategy for CompletionStrategy {
    fn name(&self) -> &'static str {
        "completion"
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    async fn generate(&self, request: ReplyRequest<'_>, on_delta: &DeltaSink<'_>) -> Result<String> {
        let text = self.client.complete(request.messages).await?;
        if !text.is_empty() {
            on_delta(&text);
        }
        Ok(text)
    }
}

pub struct CannedStrategy;

#[async_trait]
impl ReplyStrategy for CannedStrategy {
    fn name(&self) -> &'static str {
        "canned"
    }

    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn is_canned(&self) -> bool {
        true
    }

    async fn generate(&self, request: ReplyRequest<'_>, on_delta: &DeltaSink<'_>) -> Result<String> {
        let text = canned_reply(request.user_message);
        on_delta(text);
        Ok(text.to_string())
    }
}

/// The category a canned reply is about, sniffed from the user's message.
pub fn canned_category(message: &str) -> Option<KeywordCategory> {
    const CUES: [(KeywordCategory, [&str; 2]); 4] = [
        (KeywordCategory::Reminder, ["提醒", "reminder"]),
        (KeywordCategory::Plan, ["计划", "plan"]),
        (KeywordCategory::Record, ["记录", "record"]),
        (KeywordCategory::Health, ["健康", "health"]),
    ];

    let lowered = message.to_lowercase();
    CUES.iter()
        .find(|(_, cues)| cues.iter().any(|cue| lowered.contains(*cue)))
        .map(|(category, _)| *category)
}

/// Static reply chosen by sniffing the user's message.
pub fn canned_reply(message: &str) -> &'static str {
    match canned_category(message) {
        Some(KeywordCategory::Reminder) => "我可以帮您创建提醒。请告诉我具体的提醒内容和时间。",
        Some(KeywordCategory::Plan) => "我可以帮您制定计划。请描述您想要实现的目标。",
        Some(KeywordCategory::Record) => "我已经记录了您的内容。您还需要添加标签吗？",
        Some(KeywordCategory::Health) => "我可以帮您记录健康数据。请告诉我具体的健康信息。",
        _ => "我理解了您的需求。作为您的个人AI助手，我可以帮您管理记录、提醒、计划和健康数据。请告诉我您需要什么帮助？",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplyOutcome {
    pub text: String,
    pub strategy: &'static str,
    pub canned: bool,
    pub warning: Option<String>,
    /// A failed attempt had already emitted deltas before this reply was produced.
    pub discarded_partial: bool,
}

/// Ordered list of reply strategies; the first that succeeds within its budget wins.
pub struct FallbackChain {
    strategies: Vec<Box<dyn ReplyStrategy>>,
}

impl FallbackChain {
    pub fn new(strategies: Vec<Box<dyn ReplyStrategy>>) -> Self {
        Self { strategies }
    }

    /// stream, then completion, then canned.
    pub fn standard(client: Arc<LlmClient>, config: &AssistantConfig) -> Self {
        Self::new(vec![
            Box::new(StreamingStrategy::new(client.clone(), config.stream_timeout())),
            Box::new(CompletionStrategy::new(client, config.completion_timeout())),
            Box::new(CannedStrategy),
        ])
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub async fn run(&self, request: ReplyRequest<'_>, on_delta: &DeltaSink<'_>) -> Result<ReplyOutcome> {
        let mut discarded_partial = false;
        for (index, strategy) in self.strategies.iter().enumerate() {
            let emitted = AtomicBool::new(false);
            let sink = |delta: &str| {
                emitted.store(true, Ordering::Relaxed);
                on_delta(delta);
            };
            let attempt = strategy.generate(request, &sink);
            let result = match strategy.timeout() {
                Some(limit) => match tokio::time::timeout(limit, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("timed out after {:?}", limit)),
                },
                None => attempt.await,
            };

            match result {
                Ok(text) => {
                    if index > 0 {
                        tracing::info!("Reply produced by fallback strategy '{}'", strategy.name());
                    }
                    return Ok(ReplyOutcome {
                        text,
                        strategy: strategy.name(),
                        canned: strategy.is_canned(),
                        warning: (index > 0).then(|| FALLBACK_WARNING.to_string()),
                        discarded_partial,
                    });
                }
                Err(e) => {
                    tracing::warn!("Reply strategy '{}' failed: {:#}", strategy.name(), e);
                    discarded_partial |= emitted.load(Ordering::Relaxed);
                }
            }
        }

        anyhow::bail!("All reply strategies failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collect_frames(chunks: &[&[u8]]) -> Vec<SseFrame> {
        let mut decoder = SseDecoder::default();
        let mut frames = Vec::new();
        for chunk in chunks {
            frames.extend(decoder.feed(chunk).unwrap());
        }
        frames.extend(decoder.finish().unwrap());
        frames
    }

    fn delta_payload(content: &str) -> String {
        serde_json::json!({ "choices": [{ "delta": { "content": content } }] }).to_string()
    }

    #[test]
    fn decoder_keeps_multibyte_characters_split_across_chunks() {
        let body = format!("data: {}\n\ndata: [DONE]\n\n", delta_payload("提醒我"));
        let bytes = body.as_bytes();
        // Split inside the three-byte encoding of the first character.
        let split = body.find("提").unwrap() + 1;

        let frames = collect_frames(&[&bytes[..split], &bytes[split..]]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], SseFrame::Data(delta_payload("提醒我")));
        assert_eq!(frames[1], SseFrame::Done);
    }

    #[test]
    fn decoder_ignores_comments_and_handles_crlf() {
        let frames = collect_frames(&[b": keep-alive\r\n\r\ndata: {\"a\":1}\r\n\r\n", b"data: [DONE]"]);
        assert_eq!(
            frames,
            vec![SseFrame::Data("{\"a\":1}".to_string()), SseFrame::Done]
        );
    }

    #[test]
    fn accumulator_concatenates_deltas_and_completes_on_sentinel() {
        let seen = Mutex::new(Vec::new());
        let sink = |d: &str| seen.lock().unwrap().push(d.to_string());
        let mut acc = StreamAccumulator::default();
        acc.begin();
        for piece in ["我可以", "帮您", "创建提醒"] {
            acc.apply(SseFrame::Data(delta_payload(piece)), &sink).unwrap();
        }
        acc.apply(SseFrame::Data("{\"choices\":[{\"delta\":{}}]}".to_string()), &sink)
            .unwrap();
        acc.apply(SseFrame::Done, &sink).unwrap();
        assert_eq!(acc.state(), StreamState::Completed);

        let text = acc.finish().unwrap();
        assert_eq!(text, "我可以帮您创建提醒");
        assert_eq!(seen.lock().unwrap().concat(), text);
    }

    #[test]
    fn accumulator_fails_on_bad_json_or_missing_sentinel() {
        let sink = |_: &str| {};
        let mut bad = StreamAccumulator::default();
        bad.begin();
        assert!(bad.apply(SseFrame::Data("{not json".to_string()), &sink).is_err());
        assert_eq!(bad.state(), StreamState::Failed);

        let mut truncated = StreamAccumulator::default();
        truncated.begin();
        truncated
            .apply(SseFrame::Data(delta_payload("半句")), &sink)
            .unwrap();
        assert!(truncated.finish().is_err());
    }

    #[test]
    fn canned_reply_sniffs_keywords_in_order() {
        assert!(canned_reply("提醒我开会").contains("创建提醒"));
        assert!(canned_reply("Make a PLAN").contains("制定计划"));
        assert!(canned_reply("记录一下").contains("已经记录"));
        assert!(canned_reply("health check").contains("健康数据"));
        assert!(canned_reply("你好").starts_with("我理解了您的需求"));
        assert_eq!(canned_category("提醒我制定计划"), Some(KeywordCategory::Reminder));
        assert_eq!(canned_category("你好"), None);
    }

    #[tokio::test]
    async fn missing_credential_fails_fast() {
        let client = LlmClient::new("http://127.0.0.1:9".to_string(), None, "m".to_string());
        assert!(!client.has_credential());
        let err = client.complete(&[Message::user("hi")]).await.unwrap_err();
        assert!(err.to_string().contains("API key"));
    }

    struct Failing;

    #[async_trait]
    impl ReplyStrategy for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn timeout(&self) -> Option<Duration> {
            None
        }
        async fn generate(&self, _: ReplyRequest<'_>, _: &DeltaSink<'_>) -> Result<String> {
            anyhow::bail!("boom")
        }
    }

    struct Hanging;

    #[async_trait]
    impl ReplyStrategy for Hanging {
        fn name(&self) -> &'static str {
            "hanging"
        }
        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_millis(20))
        }
        async fn generate(&self, _: ReplyRequest<'_>, _: &DeltaSink<'_>) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("late".to_string())
        }
    }

    #[tokio::test]
    async fn chain_falls_through_to_canned_with_warning() {
        let chain = FallbackChain::new(vec![
            Box::new(Hanging),
            Box::new(Failing),
            Box::new(CannedStrategy),
        ]);
        let seen = Mutex::new(String::new());
        let sink = |d: &str| seen.lock().unwrap().push_str(d);
        let request = ReplyRequest {
            messages: &[],
            user_message: "提醒我喝水",
        };

        let outcome = chain.run(request, &sink).await.unwrap();
        assert!(outcome.canned);
        assert_eq!(outcome.strategy, "canned");
        assert_eq!(outcome.warning.as_deref(), Some(FALLBACK_WARNING));
        assert_eq!(*seen.lock().unwrap(), outcome.text);
    }

    #[tokio::test]
    async fn standard_chain_degrades_to_canned_without_credential() {
        let client = Arc::new(LlmClient::new(
            "http://127.0.0.1:9".to_string(),
            None,
            "m".to_string(),
        ));
        let chain = FallbackChain::standard(client, &AssistantConfig::default());
        assert_eq!(chain.strategy_names(), vec!["stream", "completion", "canned"]);

        let request = ReplyRequest {
            messages: &[],
            user_message: "你好",
        };
        let outcome = chain.run(request, &|_: &str| {}).await.unwrap();
        assert!(outcome.canned);
        assert!(outcome.warning.is_some());
    }

    const SERVED_REPLY: &str = "好的，明天上午9点提醒您开会。";

    fn served_sse_body() -> Vec<u8> {
        let mut body = String::from(": keep-alive\n\n");
        for piece in ["好的，", "明天上午9点", "提醒您开会。"] {
            body.push_str(&format!("data: {}\n\n", delta_payload(piece)));
        }
        body.push_str("data: [DONE]\n\n");
        body.push_str(&format!("data: {}\n\n", delta_payload("ignored")));
        body.into_bytes()
    }

    async fn completions(axum::Json(body): axum::Json<serde_json::Value>) -> axum::response::Response {
        use axum::response::IntoResponse;

        if body["stream"] == true {
            // Five-byte pieces split most of the three-byte characters.
            let pieces: Vec<Result<Vec<u8>, std::convert::Infallible>> = served_sse_body()
                .chunks(5)
                .map(|piece| Ok(piece.to_vec()))
                .collect();
            (
                [(axum::http::header::CONTENT_TYPE, "text/event-stream")],
                axum::body::Body::from_stream(futures_util::stream::iter(pieces)),
            )
                .into_response()
        } else {
            axum::Json(serde_json::json!({
                "choices": [{ "message": { "role": "assistant", "content": SERVED_REPLY } }]
            }))
            .into_response()
        }
    }

    async fn unavailable() -> (axum::http::StatusCode, &'static str) {
        (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "overloaded")
    }

    async fn serve(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client_for(url: String) -> LlmClient {
        LlmClient::new(url, Some("test-key".to_string()), "m".to_string())
    }

    #[tokio::test]
    async fn streamed_deltas_concatenate_to_the_completion_text() {
        let url = serve(
            axum::Router::new().route("/chat/completions", axum::routing::post(completions)),
        )
        .await;
        let client = client_for(url);
        let messages = [Message::user("提醒我明天开会")];

        let seen = Mutex::new(Vec::new());
        let sink = |d: &str| seen.lock().unwrap().push(d.to_string());
        let streamed = client.stream(&messages, &sink).await.unwrap();
        let completed = client.complete(&messages).await.unwrap();

        let deltas = seen.into_inner().unwrap();
        assert_eq!(deltas.len(), 3);
        assert_eq!(deltas.concat(), completed);
        assert_eq!(streamed, completed);
        assert_eq!(completed, SERVED_REPLY);
    }

    #[tokio::test]
    async fn server_errors_fall_through_to_canned() {
        let url = serve(
            axum::Router::new().route("/chat/completions", axum::routing::post(unavailable)),
        )
        .await;
        let client = Arc::new(client_for(url));

        let err = client.stream(&[Message::user("hi")], &|_: &str| {}).await.unwrap_err();
        assert!(err.to_string().contains("500"));

        let chain = FallbackChain::standard(client, &AssistantConfig::default());
        let request = ReplyRequest {
            messages: &[],
            user_message: "帮我制定计划",
        };
        let outcome = chain.run(request, &|_: &str| {}).await.unwrap();
        assert!(outcome.canned);
        assert_eq!(outcome.text, canned_reply("帮我制定计划"));
        assert!(!outcome.discarded_partial);
    }
}
