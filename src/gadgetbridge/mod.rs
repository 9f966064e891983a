//! Gadgetbridge message engine
//!
//! Streaming reassembly of the line-framed companion protocol carried over
//! the transport channel, plus the outbound version and status messages.
//! Inbound frames are `0x10 <body> '\n'` where the body is either a
//! `GB(<json>)` command or a `setTime(..)setTimeZone(..)` clock update.

pub mod parse;
pub mod settime;

use serde::Serialize;
use std::sync::Arc;

use crate::ble::adapter::Clock;
use crate::ble::channel::{ChannelError, TransportChannel};
use parse::MessageHandler;

/// Start-of-frame control byte
pub const FRAME_START: u8 = 0x10;

/// Hard cap on one reassembled message body
pub const MAX_RECV_LEN: usize = 1000;

/// Receive-buffer assembly state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyState {
    /// Waiting for a start-of-frame marker
    Idle,
    /// Collecting body chunks until the trailing newline
    Accumulating,
}

/// Streaming frame reassembler. Exactly one assembly is in flight at a time;
/// a frame start while one is in progress is a protocol violation and the
/// partial content is discarded.
pub struct Decoder {
    state: AssemblyState,
    buf: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            state: AssemblyState::Idle,
            buf: Vec::with_capacity(MAX_RECV_LEN),
        }
    }

    pub fn state(&self) -> AssemblyState {
        self.state
    }

    /// Drop any partial assembly
    pub fn reset(&mut self) {
        self.state = AssemblyState::Idle;
        self.buf.clear();
    }

    /// Feed one inbound chunk. Returns the complete frame body (marker and
    /// trailing newline stripped) when this chunk finished a frame.
    pub fn consume(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
        if chunk.is_empty() {
            tracing::error!("Parsing error: received empty packet");
            return None;
        }

        let mut chunk = chunk;
        if chunk[0] == FRAME_START {
            if self.state != AssemblyState::Idle {
                tracing::error!(
                    "Parsing error: received new message before end of previous was found"
                );
            }
            self.buf.clear();
            self.state = AssemblyState::Accumulating;
            chunk = &chunk[1..];
        }

        match self.state {
            AssemblyState::Idle => {
                tracing::error!(
                    "Parsing error: received unknown packet: {}",
                    hex::encode(chunk)
                );
                None
            }
            AssemblyState::Accumulating => {
                let (body, done) = match chunk.last() {
                    Some(b'\n') => (&chunk[..chunk.len() - 1], true),
                    _ => (chunk, false),
                };
                if self.buf.len() + body.len() > MAX_RECV_LEN {
                    tracing::error!(
                        "Parsing error: data does not fit in {} bytes",
                        MAX_RECV_LEN
                    );
                    self.reset();
                    return None;
                }
                self.buf.extend_from_slice(body);
                if done {
                    self.state = AssemblyState::Idle;
                    let frame = self.buf.clone();
                    self.buf.clear();
                    Some(frame)
                } else {
                    None
                }
            }
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the decoder and routes completed frames to the envelope parsers
pub struct GadgetbridgeService {
    decoder: Decoder,
    clock: Arc<dyn Clock>,
    handler: Box<dyn MessageHandler>,
}

impl GadgetbridgeService {
    pub fn new(clock: Arc<dyn Clock>, handler: Box<dyn MessageHandler>) -> Self {
        Self {
            decoder: Decoder::new(),
            clock,
            handler,
        }
    }

    /// Build a service whose handler only logs the messages it receives
    pub fn with_default_handler(clock: Arc<dyn Clock>) -> Self {
        Self::new(clock, Box::new(parse::LogHandler))
    }

    /// Receive-side entry point, wired as the transport channel's callback
    pub fn consume(&mut self, data: &[u8]) {
        if let Some(frame) = self.decoder.consume(data) {
            self.dispatch(&frame);
        }
    }

    pub fn decoder_state(&self) -> AssemblyState {
        self.decoder.state()
    }

    /// Drop any partial frame (link loss)
    pub fn reset(&mut self) {
        self.decoder.reset();
    }

    fn dispatch(&mut self, frame: &[u8]) {
        let text = match std::str::from_utf8(frame) {
            Ok(text) => text,
            Err(_) => {
                tracing::error!(
                    "Parsing error: frame is not valid UTF-8: {}",
                    hex::encode(frame)
                );
                return;
            }
        };
        if let Some(body) = text.strip_prefix("GB(").and_then(|t| t.strip_suffix(')')) {
            parse::parse_gb(body, self.handler.as_mut());
        } else if text.starts_with("setTime(") {
            settime::parse_set_time(text, self.clock.as_ref());
        } else {
            tracing::error!(
                "Parsing error: received unknown command: {}",
                hex::encode(frame)
            );
        }
    }
}

/// Version announcement sent once the channel becomes ready
#[derive(Debug, Clone, Serialize)]
pub struct VersionMessage {
    pub t: &'static str,
    pub fw: String,
    pub hw: String,
}

impl VersionMessage {
    pub fn new(fw: &str, hw: &str) -> Self {
        Self {
            t: "ver",
            fw: fw.to_string(),
            hw: hw.to_string(),
        }
    }
}

/// Status heartbeat with battery level, voltage, and charging flag
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatusMessage {
    pub t: &'static str,
    pub bat: u8,
    pub volt: f32,
    pub chg: u8,
}

impl StatusMessage {
    pub fn new(bat: u8, volt: f32, charging: bool) -> Self {
        Self {
            t: "status",
            bat,
            volt,
            chg: u8::from(charging),
        }
    }
}

/// Send the firmware/hardware version announcement
pub async fn send_version(
    channel: &TransportChannel,
    fw: &str,
    hw: &str,
) -> Result<(), ChannelError> {
    send_line(channel, &VersionMessage::new(fw, hw)).await
}

/// Send one status heartbeat
pub async fn send_status(
    channel: &TransportChannel,
    bat: u8,
    volt: f32,
    charging: bool,
) -> Result<(), ChannelError> {
    send_line(channel, &StatusMessage::new(bat, volt, charging)).await
}

/// Outbound messages are single-line JSON objects terminated by a newline
async fn send_line<T: Serialize>(
    channel: &TransportChannel,
    message: &T,
) -> Result<(), ChannelError> {
    let mut line =
        serde_json::to_vec(message).map_err(|e| ChannelError::Encode(e.to_string()))?;
    line.push(b'\n');
    channel.send(&line).await
}
