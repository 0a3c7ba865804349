//! Stdio transport: newline-delimited JSON frames on stdout and stdin.
//!
//! Meant for local development and piping into other tools. Every frame is
//! `{"event": <channel>, "data": <payload>}`; there is no redelivery, so
//! acknowledgements are no-ops.

use crate::{Ack, Broker, BrokerError, BrokerFuture, Delivery};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::HashSet;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout},
    sync::{mpsc, Mutex},
};

/// Capacity of the delivery stream handed to the consumer.
const DELIVERY_BUFFER: usize = 64;

/// One frame on the wire.
#[derive(Debug, Deserialize, Serialize)]
struct Frame<'a> {
    /// Channel name.
    event: &'a str,
    /// Payload, passed through undecoded.
    #[serde(borrow)]
    data: &'a RawValue,
}

/// Owned counterpart of [`Frame`] for inbound lines.
#[derive(Debug, Deserialize)]
struct OwnedFrame {
    event: String,
    data: Box<RawValue>,
}

/// Broker transport over the process's stdio.
#[derive(Debug)]
pub struct StdioBroker {
    stdout: Mutex<Stdout>,
}

impl StdioBroker {
    /// Create a broker writing frames to stdout and reading them from stdin.
    pub fn new() -> Self {
        Self {
            stdout: Mutex::new(tokio::io::stdout()),
        }
    }

    fn encode(channel: &str, payload: &[u8]) -> Result<String, BrokerError> {
        let text = std::str::from_utf8(payload)
            .map_err(|source| BrokerError::publishing(Box::new(source)))?;
        let data: &RawValue = serde_json::from_str(text)
            .map_err(|source| BrokerError::publishing(Box::new(source)))?;

        serde_json::to_string(&Frame {
            event: channel,
            data,
        })
        .map_err(|source| BrokerError::publishing(Box::new(source)))
    }
}

impl Default for StdioBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker for StdioBroker {
    fn publish<'a>(&'a self, channel: &'a str, payload: &'a [u8]) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let mut line = Self::encode(channel, payload)?;
            line.push('\n');

            let mut stdout = self.stdout.lock().await;
            stdout
                .write_all(line.as_bytes())
                .await
                .map_err(|source| BrokerError::publishing(Box::new(source)))?;
            stdout
                .flush()
                .await
                .map_err(|source| BrokerError::publishing(Box::new(source)))
        })
    }

    fn subscribe<'a>(
        &'a self,
        channels: &'a [String],
    ) -> BrokerFuture<'a, mpsc::Receiver<Delivery>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
            let wanted: HashSet<String> = channels.iter().cloned().collect();

            tokio::spawn(async move {
                let mut lines = BufReader::new(tokio::io::stdin()).lines();

                loop {
                    let line = match lines.next_line().await {
                        Ok(Some(line)) => line,
                        Ok(None) => break,
                        Err(source) => {
                            tracing::warn!(error = %source, "reading stdin failed");

                            break;
                        }
                    };

                    if line.trim().is_empty() {
                        continue;
                    }

                    let frame: OwnedFrame = match serde_json::from_str(&line) {
                        Ok(frame) => frame,
                        Err(source) => {
                            tracing::warn!(error = %source, "malformed stdio frame");

                            continue;
                        }
                    };

                    if !wanted.contains(&frame.event) {
                        continue;
                    }

                    let delivery = Delivery {
                        channel: frame.event,
                        payload: frame.data.get().as_bytes().to_vec(),
                        ack: Ack::noop(),
                    };

                    if tx.send(delivery).await.is_err() {
                        break;
                    }
                }
            });

            Ok(rx)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{OwnedFrame, StdioBroker};
    use crate::Broker;
    use static_assertions::assert_impl_all;
    use std::fmt::Debug;

    assert_impl_all!(StdioBroker: Broker, Debug, Default, Send, Sync);

    #[test]
    fn frames_round_trip() {
        let line = StdioBroker::encode("MESSAGE_CREATE", br#"{"content":"hi"}"#).unwrap();
        assert_eq!(
            r#"{"event":"MESSAGE_CREATE","data":{"content":"hi"}}"#,
            line,
        );

        let decoded: OwnedFrame = serde_json::from_str(&line).unwrap();
        assert_eq!("MESSAGE_CREATE", decoded.event);
        assert_eq!(r#"{"content":"hi"}"#, decoded.data.get());
    }

    #[test]
    fn invalid_payload_is_rejected() {
        assert!(StdioBroker::encode("EVENT", b"not json").is_err());
    }
}
