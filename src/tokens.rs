//! Streaming token accounting.
//!
//! A [`TokenAccountant`] is created per proxied request. It classifies the
//! request's wire [`Dialect`] from the path, then consumes the response body
//! chunk by chunk through a line buffer, counting one output token per
//! content-bearing delta and picking up authoritative input/output counts
//! where the dialect reports them.
//!
//! Counts live in [`RequestCounters`], which is shared with the rate sampler
//! while the response streams, and fold into the process-wide
//! [`TokenTotals`] exactly once: authoritative corrections apply the signed
//! difference, never the raw value.

use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// Wire format of a request/response pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Newline-delimited JSON objects (`/api/chat`, `/api/generate`)
    OllamaNative,
    /// `data:` server-sent events with `choices[].delta`
    OpenAiChat,
    /// `event:`/`data:` pairs with content-block deltas
    AnthropicMessages,
    /// `event:`/`data:` pairs with typed `response.*` events
    OpenAiResponses,
}

impl Dialect {
    /// Classify a request path by prefix, matching whole segments only. The
    /// query string is ignored; `None` means the response is passed through
    /// without counting.
    pub fn classify(path: &str) -> Option<Self> {
        const PREFIXES: [(&str, Dialect); 5] = [
            ("/api/chat", Dialect::OllamaNative),
            ("/api/generate", Dialect::OllamaNative),
            ("/v1/chat/completions", Dialect::OpenAiChat),
            ("/v1/messages", Dialect::AnthropicMessages),
            ("/v1/responses", Dialect::OpenAiResponses),
        ];

        let path = path.split('?').next().unwrap_or(path);
        PREFIXES.into_iter().find_map(|(prefix, dialect)| {
            let rest = path.strip_prefix(prefix)?;
            (rest.is_empty() || rest.starts_with('/')).then_some(dialect)
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OllamaNative => "ollama",
            Self::OpenAiChat => "openai-chat",
            Self::AnthropicMessages => "anthropic",
            Self::OpenAiResponses => "openai-responses",
        }
    }
}

/// Process-wide cumulative token counts.
#[derive(Debug, Default)]
pub struct TokenTotals {
    input: AtomicU64,
    output: AtomicU64,
}

impl TokenTotals {
    /// `(input, output)` totals across all requests so far.
    pub fn counts(&self) -> (u64, u64) {
        (
            self.input.load(Ordering::Relaxed),
            self.output.load(Ordering::Relaxed),
        )
    }

    fn add_input(&self, n: u64) {
        self.input.fetch_add(n, Ordering::Relaxed);
        metrics::counter!("llmgate_tokens_input_total").increment(n);
    }

    fn apply_output(&self, delta: i64) {
        let _ = self
            .output
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_add_signed(delta))
            });
        if delta > 0 {
            metrics::counter!("llmgate_tokens_output_total").increment(delta as u64);
        }
    }
}

/// Per-request counters, safe to read while the parser is still writing.
#[derive(Debug)]
pub struct RequestCounters {
    start: Instant,
    input: AtomicU64,
    input_set: AtomicBool,
    output: AtomicU64,
    // Nanoseconds since `start`, offset by one so zero means "not yet".
    first_output: AtomicU64,
    last_output: AtomicU64,
    totals: Arc<TokenTotals>,
}

impl RequestCounters {
    fn new(totals: Arc<TokenTotals>) -> Self {
        Self {
            start: Instant::now(),
            input: AtomicU64::new(0),
            input_set: AtomicBool::new(false),
            output: AtomicU64::new(0),
            first_output: AtomicU64::new(0),
            last_output: AtomicU64::new(0),
            totals,
        }
    }

    pub fn input(&self) -> u64 {
        self.input.load(Ordering::Relaxed)
    }

    pub fn output(&self) -> u64 {
        self.output.load(Ordering::Relaxed)
    }

    /// Set the input count. Only the first call has any effect.
    fn set_input(&self, n: u64) {
        if self
            .input_set
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.input.store(n, Ordering::Relaxed);
            self.totals.add_input(n);
        }
    }

    fn add_output_token(&self) {
        let stamp = self.start.elapsed().as_nanos() as u64 + 1;
        let _ = self
            .first_output
            .compare_exchange(0, stamp, Ordering::AcqRel, Ordering::Acquire);
        self.last_output.store(stamp, Ordering::Relaxed);

        self.output.fetch_add(1, Ordering::Relaxed);
        self.totals.apply_output(1);
    }

    /// Replace the running output estimate with an authoritative count.
    fn correct_output(&self, authoritative: u64) {
        let previous = self.output.swap(authoritative, Ordering::AcqRel);
        let delta = authoritative as i64 - previous as i64;
        if delta != 0 {
            self.totals.apply_output(delta);
        }
    }

    fn first_output_secs(&self) -> Option<f64> {
        match self.first_output.load(Ordering::Acquire) {
            0 => None,
            stamp => Some((stamp - 1) as f64 / 1e9),
        }
    }

    /// Time to first output token.
    pub fn ttft_secs(&self) -> Option<f64> {
        self.first_output_secs()
    }

    /// Input tokens divided by time to first output token, 0 until both are known.
    pub fn input_rate(&self) -> f64 {
        let input = self.input();
        match self.first_output_secs() {
            Some(ttft) if input > 0 && ttft > 0.0 => input as f64 / ttft,
            _ => 0.0,
        }
    }

    /// Output tokens counted so far divided by the time since the first one.
    pub fn output_rate(&self) -> f64 {
        let Some(first) = self.first_output_secs() else {
            return 0.0;
        };
        let elapsed = self.start.elapsed().as_secs_f64() - first;
        if elapsed > 0.0 {
            self.output() as f64 / elapsed
        } else {
            0.0
        }
    }
}

/// Incremental parser for one response stream.
pub struct TokenAccountant {
    dialect: Option<Dialect>,
    buffer: Vec<u8>,
    last_event: Option<String>,
    counters: Arc<RequestCounters>,
}

impl TokenAccountant {
    pub fn new(path: &str, totals: Arc<TokenTotals>) -> Self {
        Self {
            dialect: Dialect::classify(path),
            buffer: Vec::new(),
            last_event: None,
            counters: Arc::new(RequestCounters::new(totals)),
        }
    }

    pub fn dialect(&self) -> Option<Dialect> {
        self.dialect
    }

    pub fn counters(&self) -> Arc<RequestCounters> {
        Arc::clone(&self.counters)
    }

    /// `(input, output)` for this request.
    pub fn counts(&self) -> (u64, u64) {
        (self.counters.input(), self.counters.output())
    }

    /// Append a chunk and process every complete line in the buffer.
    pub fn feed(&mut self, chunk: &[u8]) {
        let Some(dialect) = self.dialect else {
            return;
        };

        self.buffer.extend_from_slice(chunk);
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.process_line(dialect, &line);
        }
    }

    /// Process a trailing line left without a newline at end of stream.
    pub fn finish(&mut self) {
        let Some(dialect) = self.dialect else {
            return;
        };
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.process_line(dialect, &line);
        }
    }

    fn process_line(&mut self, dialect: Dialect, raw: &[u8]) {
        let Ok(line) = std::str::from_utf8(raw) else {
            return;
        };
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        match dialect {
            Dialect::OllamaNative => self.ollama_line(line),
            Dialect::OpenAiChat => self.openai_chat_line(line),
            Dialect::AnthropicMessages | Dialect::OpenAiResponses => {
                if let Some(event) = line.strip_prefix("event:") {
                    self.last_event = Some(event.trim().to_string());
                    return;
                }
                let Some(data) = sse_json(line) else {
                    return;
                };
                let event = data
                    .get("type")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| self.last_event.clone())
                    .unwrap_or_default();

                if dialect == Dialect::AnthropicMessages {
                    self.anthropic_event(&event, &data);
                } else {
                    self.responses_event(&event, &data);
                }
            }
        }
    }

    fn ollama_line(&self, line: &str) {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            return;
        };

        let message = value.get("message");
        let has_content = [
            message.and_then(|m| m.get("content")),
            message.and_then(|m| m.get("thinking")),
            value.get("response"),
            value.get("thinking"),
        ]
        .into_iter()
        .any(non_empty_str);
        if has_content {
            self.counters.add_output_token();
        }

        if value.get("done").and_then(Value::as_bool) == Some(true)
            && let Some(n) = value.get("prompt_eval_count").and_then(Value::as_u64)
        {
            self.counters.set_input(n);
        }
    }

    fn openai_chat_line(&self, line: &str) {
        let Some(value) = sse_json(line) else {
            return;
        };

        if let Some(choices) = value.get("choices").and_then(Value::as_array) {
            for choice in choices {
                let Some(delta) = choice.get("delta") else {
                    continue;
                };
                let text = [
                    delta.get("content"),
                    delta.get("reasoning_content"),
                    delta.get("reasoning"),
                ]
                .into_iter()
                .any(non_empty_str);
                let tool_args = delta
                    .get("tool_calls")
                    .and_then(Value::as_array)
                    .is_some_and(|calls| {
                        calls
                            .iter()
                            .any(|c| non_empty_str(c.pointer("/function/arguments")))
                    });
                if text || tool_args {
                    self.counters.add_output_token();
                }
            }
        }

        if let Some(n) = value.pointer("/usage/prompt_tokens").and_then(Value::as_u64) {
            self.counters.set_input(n);
        }
    }

    fn anthropic_event(&self, event: &str, data: &Value) {
        match event {
            "message_start" => {
                if let Some(n) = data
                    .pointer("/message/usage/input_tokens")
                    .and_then(Value::as_u64)
                {
                    self.counters.set_input(n);
                }
            }
            "content_block_delta" => {
                let Some(delta) = data.get("delta") else {
                    return;
                };
                let content = [
                    delta.get("text"),
                    delta.get("thinking"),
                    delta.get("partial_json"),
                ]
                .into_iter()
                .any(non_empty_str);
                if content {
                    self.counters.add_output_token();
                }
            }
            "message_delta" => {
                if let Some(n) = data.pointer("/usage/output_tokens").and_then(Value::as_u64) {
                    self.counters.correct_output(n);
                }
            }
            _ => {}
        }
    }

    fn responses_event(&self, event: &str, data: &Value) {
        const DELTA_SUFFIXES: [&str; 3] = [
            "output_text.delta",
            "reasoning_summary_text.delta",
            "function_call_arguments.delta",
        ];

        if DELTA_SUFFIXES.iter().any(|s| event.ends_with(s)) {
            if non_empty_str(data.get("delta")) {
                self.counters.add_output_token();
            }
        } else if event.ends_with("completed") {
            let usage = data.pointer("/response/usage");
            if let Some(n) = usage
                .and_then(|u| u.get("input_tokens"))
                .and_then(Value::as_u64)
            {
                self.counters.set_input(n);
            }
            if let Some(n) = usage
                .and_then(|u| u.get("output_tokens"))
                .and_then(Value::as_u64)
            {
                self.counters.correct_output(n);
            }
        }
    }
}

/// Parse the JSON payload of a `data:` line, ignoring the `[DONE]` sentinel.
fn sse_json(line: &str) -> Option<Value> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload == "[DONE]" {
        return None;
    }
    serde_json::from_str(payload).ok()
}

fn non_empty_str(value: Option<&Value>) -> bool {
    value
        .and_then(Value::as_str)
        .is_some_and(|s| !s.is_empty())
}
