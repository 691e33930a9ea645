use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use serde_json::Value;

use quill_core::provider::{
    CacheUsage, LlmProvider, ModelCost, ModelSpec, ProviderError, ProviderEvent, ProviderStream,
    StepStop, StreamOptions, StreamRequest, TokenUsage,
};

/// Pre-programmed responses for deterministic testing without API calls.
pub enum MockResponse {
    /// Yield a sequence of events.
    Stream(Vec<ProviderEvent>),
    /// Fail the `stream()` call itself.
    Error(ProviderError),
    /// Wait, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
    /// Yield events with a pause before each one; cancellation tests hang on
    /// these gaps.
    Paced(Duration, Vec<ProviderEvent>),
}

impl MockResponse {
    /// A one-step text completion with plausible usage numbers.
    pub fn text(text: &str) -> Self {
        Self::Stream(text_events(text, usage_for(text)))
    }

    /// A one-step text completion reporting the given usage.
    pub fn text_with_usage(text: &str, usage: TokenUsage) -> Self {
        Self::Stream(text_events(text, usage))
    }

    /// A step requesting one tool call.
    pub fn tool_call(call_id: &str, tool: &str, input: Value) -> Self {
        Self::Stream(vec![
            ProviderEvent::ToolCall {
                call_id: call_id.into(),
                tool: tool.into(),
                input,
            },
            ProviderEvent::StepFinish {
                usage: TokenUsage {
                    input: 12,
                    output: 4,
                    ..Default::default()
                },
                stop: StepStop::ToolUse,
            },
        ])
    }

    /// A stream that errors mid-flight instead of finishing the step.
    pub fn stream_error(error: ProviderError) -> Self {
        Self::Stream(vec![
            ProviderEvent::TextDelta { text: "par".into() },
            ProviderEvent::Error { error },
        ])
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

fn text_events(text: &str, usage: TokenUsage) -> Vec<ProviderEvent> {
    vec![
        ProviderEvent::TextDelta { text: text.into() },
        ProviderEvent::TextEnd,
        ProviderEvent::StepFinish {
            usage,
            stop: StepStop::EndTurn,
        },
    ]
}

fn usage_for(text: &str) -> TokenUsage {
    TokenUsage {
        input: 10,
        output: (text.len() as u64 / 4).max(1),
        reasoning: 0,
        cache: CacheUsage::default(),
    }
}

/// Mock provider that plays back responses in sequence.
pub struct MockProvider {
    spec: ModelSpec,
    responses: Mutex<VecDeque<MockResponse>>,
    calls: AtomicUsize,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self::with_spec(default_spec(), responses)
    }

    pub fn with_spec(spec: ModelSpec, responses: Vec<MockResponse>) -> Self {
        Self {
            spec,
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

pub fn default_spec() -> ModelSpec {
    ModelSpec {
        provider_id: "mock".into(),
        model_id: "mock-model".into(),
        context_limit: 200_000,
        output_limit: 32_000,
        cost: ModelCost {
            input: 3.0,
            output: 15.0,
            cache_read: 0.3,
            cache_write: 3.75,
        },
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    async fn stream(
        &self,
        _request: &StreamRequest,
        _options: &StreamOptions,
    ) -> Result<ProviderStream, ProviderError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let mut response = self
            .responses
            .lock()
            .pop_front()
            .ok_or_else(|| ProviderError::InvalidRequest("mock responses exhausted".into()))?;

        loop {
            match response {
                MockResponse::Stream(events) => {
                    return Ok(Box::pin(stream::iter(events)));
                }
                MockResponse::Error(error) => return Err(error),
                MockResponse::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    response = *inner;
                }
                MockResponse::Paced(gap, events) => {
                    let paced = stream::unfold(
                        (events.into_iter(), gap),
                        |(mut events, gap)| async move {
                            let event = events.next()?;
                            tokio::time::sleep(gap).await;
                            Some((event, (events, gap)))
                        },
                    );
                    return Ok(Box::pin(paced));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    async fn collect(stream: ProviderStream) -> Vec<ProviderEvent> {
        let mut stream = stream;
        let mut out = Vec::new();
        while let Some(event) = stream.next().await {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn text_response_shape() {
        let mock = MockProvider::new(vec![MockResponse::text("hello world")]);
        let stream = mock
            .stream(&StreamRequest::empty(), &StreamOptions::default())
            .await
            .unwrap();
        let events = collect(stream).await;

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], ProviderEvent::TextDelta { text } if text == "hello world"));
        assert!(matches!(events[1], ProviderEvent::TextEnd));
        match &events[2] {
            ProviderEvent::StepFinish { usage, stop } => {
                assert_eq!(*stop, StepStop::EndTurn);
                assert!(usage.output > 0);
            }
            other => panic!("expected StepFinish, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn responses_play_in_sequence() {
        let mock = MockProvider::new(vec![
            MockResponse::text("first"),
            MockResponse::text("second"),
        ]);
        let req = StreamRequest::empty();
        let opts = StreamOptions::default();

        mock.stream(&req, &opts).await.unwrap();
        assert_eq!(mock.call_count(), 1);
        mock.stream(&req, &opts).await.unwrap();
        assert_eq!(mock.call_count(), 2);

        let err = mock.stream(&req, &opts).await.err().unwrap();
        assert!(matches!(err, ProviderError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn error_response() {
        let mock = MockProvider::new(vec![MockResponse::Error(ProviderError::AuthFailed(
            "bad key".into(),
        ))]);
        let err = mock
            .stream(&StreamRequest::empty(), &StreamOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProviderError::AuthFailed(_)));
    }

    #[tokio::test]
    async fn delayed_response_waits() {
        let mock = MockProvider::new(vec![MockResponse::delayed(
            Duration::from_millis(50),
            MockResponse::text("after delay"),
        )]);
        let start = std::time::Instant::now();
        mock.stream(&StreamRequest::empty(), &StreamOptions::default())
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn paced_stream_spaces_events() {
        let mock = MockProvider::new(vec![MockResponse::Paced(
            Duration::from_millis(20),
            text_events("slow", TokenUsage::default()),
        )]);
        let stream = mock
            .stream(&StreamRequest::empty(), &StreamOptions::default())
            .await
            .unwrap();
        let start = std::time::Instant::now();
        let events = collect(stream).await;
        assert_eq!(events.len(), 3);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn spec_defaults() {
        let mock = MockProvider::new(vec![]);
        assert_eq!(mock.spec().provider_id, "mock");
        assert_eq!(mock.spec().context_limit, 200_000);
    }
}
