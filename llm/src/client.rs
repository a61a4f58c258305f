use bytes::Bytes;
use futures::stream::Stream;
use futures::{
    StreamExt,
    stream::{self},
};
use reqwest::header::HeaderMap;
use serde::{Serialize, de::DeserializeOwned};
use std::{fmt::Debug, fmt::Display, pin::Pin};
use tracing::{Level, event, instrument};

use crate::error::TransportError;

#[derive(Clone)]
pub struct Client {
    client: reqwest::Client,
}

pub type BoxedStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

impl Default for Client {
    fn default() -> Self {
        Client {
            client: reqwest::Client::new(),
        }
    }
}

impl Client {
    pub fn with_headers(headers: HeaderMap) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;
        Ok(Client { client })
    }

    #[instrument(level = "trace", skip(self))]
    pub async fn get<U, T>(&self, url: U) -> Result<T, TransportError>
    where
        U: reqwest::IntoUrl + Debug,
        T: DeserializeOwned,
    {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status { status, body });
        }
        let text = response.text().await?;
        event!(Level::TRACE, response = text);

        Ok(serde_json::from_str::<T>(&text)?)
    }

    #[instrument(level = "trace", skip(self, request, process), fields(json_request = serde_json::to_string(request).unwrap_or_default()))]
    pub async fn post_stream<U, S, F, T>(
        &self,
        url: U,
        request: &S,
        process: F,
    ) -> Result<BoxedStream<Result<T, TransportError>>, TransportError>
    where
        U: reqwest::IntoUrl + Debug,
        S: Serialize + Sized,
        T: DeserializeOwned + Send + 'static,
        F: Fn(&str) -> Option<&str> + 'static + Send,
    {
        let response = self.client.post(url).json(&request).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            return Err(TransportError::Status { status, body });
        }

        Ok(decode_lines(response.bytes_stream(), process))
    }
}

/// Split a byte stream into newline-terminated lines and decode each line
/// that `process` accepts as JSON.
///
/// Lines may be split across chunks, including inside a multibyte character;
/// an unterminated trailing line is dropped. A line that is not valid UTF-8
/// yields a `Protocol` error. A read error ends the stream after yielding a
/// `Network` error.
pub fn decode_lines<B, E, F, T>(bytes: B, process: F) -> BoxedStream<Result<T, TransportError>>
where
    B: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display,
    F: Fn(&str) -> Option<&str> + 'static + Send,
    T: DeserializeOwned + Send + 'static,
{
    // Raw bytes are buffered until a full line arrives
    let buffered_stream = bytes.scan((Vec::<u8>::new(), false), move |(buffer, failed), chunk| {
        if *failed {
            return futures::future::ready(None);
        }

        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                *failed = true;
                return futures::future::ready(Some(vec![Err(TransportError::Network(
                    e.to_string(),
                ))]));
            }
        };

        buffer.extend_from_slice(&chunk);

        let mut messages: Vec<Result<T, TransportError>> = vec![];
        let mut line_start = 0;

        while let Some(offset) = buffer[line_start..].iter().position(|b| *b == b'\n') {
            let line = &buffer[line_start..line_start + offset];
            line_start += offset + 1;

            let line = match std::str::from_utf8(line) {
                Ok(line) => line,
                Err(e) => {
                    event!(Level::WARN, "stream line is not valid UTF-8");
                    messages.push(Err(TransportError::Protocol(e.to_string())));
                    continue;
                }
            };

            if let Some(processed) = process(line) {
                if !processed.trim().is_empty() {
                    match serde_json::from_str::<T>(processed) {
                        Ok(event) => messages.push(Ok(event)),
                        Err(e) => {
                            event!(Level::WARN, line = processed, "failed to parse stream line");
                            messages.push(Err(TransportError::Protocol(e.to_string())));
                        }
                    }
                }
            }
        }

        // Keep the incomplete line, which may end mid-character
        buffer.drain(..line_start);

        futures::future::ready(Some(messages))
    });

    Box::pin(buffered_stream.flat_map(stream::iter))
}
