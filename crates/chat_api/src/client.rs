use std::collections::VecDeque;
use std::pin::Pin;

use futures_util::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response};

use crate::auth::{AuthHeaders, AuthProvider};
use crate::config::ChatApiConfig;
use crate::error::{parse_error_message, ChatApiError};
use crate::events::StreamFrame;
use crate::headers::build_headers;
use crate::payload::ChatRequest;
use crate::retry::{retry_delay, MAX_RETRIES};
use crate::sse::FrameDecoder;
use crate::url::normalize_completions_url;

/// Raw body chunks of a streamed response.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, ChatApiError>> + Send>>;

#[derive(Debug)]
pub struct ChatApiClient {
    http: Client,
    config: ChatApiConfig,
}

impl ChatApiClient {
    pub fn new(config: ChatApiConfig) -> Result<Self, ChatApiError> {
        let mut builder = Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().map_err(ChatApiError::from)?;
        Ok(Self { http, config })
    }

    pub fn endpoint(&self) -> String {
        normalize_completions_url(&self.config.base_url)
    }

    pub fn build_headers(&self, auth: &AuthHeaders) -> Result<HeaderMap, ChatApiError> {
        let headers = build_headers(auth)?;
        let mut out = HeaderMap::new();
        for (key, value) in headers {
            let name =
                HeaderName::from_bytes(key.as_bytes()).map_err(|_| ChatApiError::InvalidHeader {
                    name: key.clone(),
                    reason: "invalid header name",
                })?;
            let value = HeaderValue::from_str(&value).map_err(|_| ChatApiError::InvalidHeader {
                name: key.clone(),
                reason: "invalid header value",
            })?;
            out.insert(name, value);
        }
        Ok(out)
    }

    pub fn build_request(
        &self,
        request: &ChatRequest,
        auth: &AuthHeaders,
    ) -> Result<reqwest::RequestBuilder, ChatApiError> {
        let headers = self.build_headers(auth)?;
        let mut payload = request.clone();
        payload.stream = true;
        if payload.model.trim().is_empty() {
            payload.model = self.config.model.clone();
        }
        Ok(self.http.post(self.endpoint()).headers(headers).json(&payload))
    }

    /// Send one request and return its frame stream.
    ///
    /// A non-success status is an error carrying the parsed service message.
    pub async fn open_stream(
        &self,
        request: &ChatRequest,
        auth: &AuthHeaders,
    ) -> Result<FrameStream, ChatApiError> {
        let response = self.build_request(request, auth)?.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(FrameStream::from_response(response));
        }

        let body = response.text().await.unwrap_or_default();
        let message = parse_error_message(status, &body);
        tracing::debug!(%status, %message, "completion request rejected");
        Err(ChatApiError::Status { status, message })
    }

    /// Send a request, retrying once with freshly fetched credentials when
    /// the service answers with a non-success status.
    pub async fn open_stream_with_reauth(
        &self,
        request: &ChatRequest,
        auth: &dyn AuthProvider,
    ) -> Result<FrameStream, ChatApiError> {
        let mut attempt = 0;
        loop {
            let headers = auth.auth_headers(attempt > 0)?;
            match self.open_stream(request, &headers).await {
                Ok(stream) => return Ok(stream),
                Err(ChatApiError::Status { status, message }) if attempt < MAX_RETRIES => {
                    let delay = retry_delay(status.as_u16(), &message);
                    tracing::info!(
                        %status,
                        %message,
                        delay_ms = delay.as_millis() as u64,
                        "request rejected; re-authenticating and retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// Frames decoded from one streamed response, pulled one at a time.
///
/// The stream ends after the first terminal frame (`Finish` or `Done`).
pub struct FrameStream {
    bytes: ByteStream,
    decoder: FrameDecoder,
    queued: VecDeque<StreamFrame>,
    received_any: bool,
    finished: bool,
}

impl std::fmt::Debug for FrameStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameStream")
            .field("queued", &self.queued.len())
            .field("received_any", &self.received_any)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl FrameStream {
    pub fn new(bytes: ByteStream) -> Self {
        Self {
            bytes,
            decoder: FrameDecoder::default(),
            queued: VecDeque::new(),
            received_any: false,
            finished: false,
        }
    }

    /// Stream over fixed chunks, as if they arrived from the network in order.
    pub fn from_chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
        I::IntoIter: Send + 'static,
    {
        Self::new(Box::pin(futures_util::stream::iter(
            chunks.into_iter().map(Ok::<Vec<u8>, ChatApiError>),
        )))
    }

    fn from_response(response: Response) -> Self {
        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(ChatApiError::from));
        Self::new(Box::pin(bytes))
    }

    /// Next decoded frame, or `None` once the stream is over.
    ///
    /// A body that ends before any byte arrived is [`ChatApiError::EmptyResponse`];
    /// a body that ends in the middle of an undecodable frame is
    /// [`ChatApiError::StreamDecode`].
    pub async fn next_frame(&mut self) -> Result<Option<StreamFrame>, ChatApiError> {
        loop {
            if let Some(frame) = self.queued.pop_front() {
                if frame.is_terminal() {
                    self.finished = true;
                    self.queued.clear();
                }
                return Ok(Some(frame));
            }
            if self.finished {
                return Ok(None);
            }

            match self.bytes.next().await {
                Some(chunk) => {
                    let chunk = chunk?;
                    if !chunk.is_empty() {
                        self.received_any = true;
                    }
                    self.queued.extend(self.decoder.feed(&chunk)?);
                }
                None => {
                    self.finished = true;
                    if !self.received_any {
                        return Err(ChatApiError::EmptyResponse);
                    }
                    self.decoder.finish()?;
                    return Ok(None);
                }
            }
        }
    }

    /// Drain every remaining frame.
    pub async fn collect_frames(mut self) -> Result<Vec<StreamFrame>, ChatApiError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame().await? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::FrameStream;
    use crate::error::ChatApiError;
    use crate::events::StreamFrame;

    #[tokio::test]
    async fn empty_body_is_reported() {
        let stream = FrameStream::from_chunks(Vec::<Vec<u8>>::new());
        let error = stream.collect_frames().await.expect_err("empty body");
        assert!(matches!(error, ChatApiError::EmptyResponse));
    }

    #[tokio::test]
    async fn stream_stops_after_finish_frame() {
        let stream = FrameStream::from_chunks(vec![
            b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n".to_vec(),
            b"data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n".to_vec(),
            b"data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n\n".to_vec(),
        ]);
        let frames = stream.collect_frames().await.expect("frames");
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[1], StreamFrame::Finish { ref reason } if reason == "stop"));
    }

    #[tokio::test]
    async fn truncated_frame_at_end_of_body_is_a_decode_error() {
        let stream = FrameStream::from_chunks(vec![
            b"data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\ndata: {\"cho".to_vec(),
        ]);
        let error = stream.collect_frames().await.expect_err("truncated");
        assert!(matches!(error, ChatApiError::StreamDecode(_)));
    }
}
