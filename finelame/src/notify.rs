//! Diagnostics notifications from the data plane.
//!
//! The instrumentation program pushes tagged messages on a perf event
//! channel; they are decoded here and forwarded to the log sink. This path
//! is not part of the detection pipeline.

use aya::maps::perf::PerfEventArrayBuffer;
use aya::maps::MapData;
use bytes::BytesMut;
use log::{info, warn};
use std::{io, mem, ptr, time::Duration};
use tokio::io::unix::AsyncFd;

use finelame_common::{
    Notification, NOTIFY_KIND_FLOAT, NOTIFY_KIND_INT, NOTIFY_KIND_STR,
};

const SCRATCH_SLOTS: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text,
    Int(i64),
    Float(f64),
    Unknown(i32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub message: String,
    pub payload: Payload,
}

/// Interpret a raw notification. The 64-bit `load` is a union on the C
/// side; the tag picks the reading.
pub fn decode(raw: &Notification) -> Decoded {
    let len = (raw.msg_size as usize).min(raw.msg.len());
    let bytes = &raw.msg[..len];
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let message = String::from_utf8_lossy(&bytes[..end]).into_owned();

    let payload = match raw.kind {
        NOTIFY_KIND_STR => Payload::Text,
        NOTIFY_KIND_INT => Payload::Int(raw.load as i64),
        NOTIFY_KIND_FLOAT => Payload::Float(f64::from_bits(raw.load)),
        other => Payload::Unknown(other),
    };
    Decoded { message, payload }
}

fn log_notification(decoded: &Decoded) {
    match decoded.payload {
        Payload::Text => info!("str notification: {}", decoded.message),
        Payload::Int(value) => info!("int notification: {} {value}", decoded.message),
        Payload::Float(value) => info!("dbl notification: {} {value}", decoded.message),
        Payload::Unknown(tag) => info!("??? notification (tag {tag}): {}", decoded.message),
    }
}

/// Spawn one reader task per perf buffer; each decodes and logs until the
/// process exits.
pub fn start_listener(buffers: Vec<PerfEventArrayBuffer<MapData>>) {
    info!(
        "listening for data plane notifications on {} cpus",
        buffers.len()
    );
    for buffer in buffers {
        tokio::spawn(poll_buffer(buffer));
    }
}

async fn poll_buffer(buffer: PerfEventArrayBuffer<MapData>) {
    let mut buffer = match AsyncFd::new(buffer) {
        Ok(fd) => fd,
        Err(err) => {
            warn!("failed to register notification buffer: {err}");
            return;
        }
    };

    let mut scratch: Vec<BytesMut> = (0..SCRATCH_SLOTS)
        .map(|_| BytesMut::with_capacity(512))
        .collect();

    loop {
        let mut ready = match buffer.readable_mut().await {
            Ok(guard) => guard,
            Err(err) => {
                warn!("notification buffer wait failed: {err}");
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };

        let events = match ready.try_io(|inner| {
            inner
                .get_mut()
                .read_events(scratch.as_mut_slice())
                .map_err(io::Error::other)
        }) {
            Ok(Ok(events)) => events,
            Ok(Err(err)) => {
                ready.clear_ready();
                warn!("notification read failed: {err}");
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
            Err(_would_block) => {
                ready.clear_ready();
                continue;
            }
        };
        ready.clear_ready();

        for buf in scratch.iter_mut().take(events.read) {
            if buf.len() >= mem::size_of::<Notification>() {
                let raw: Notification =
                    unsafe { ptr::read_unaligned(buf.as_ptr() as *const Notification) };
                log_notification(&decode(&raw));
            }
            buf.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use finelame_common::NOTIFY_MSG_LEN;

    fn raw(kind: i32, message: &[u8], load: u64) -> Notification {
        let mut msg = [0u8; NOTIFY_MSG_LEN];
        msg[..message.len()].copy_from_slice(message);
        Notification {
            kind,
            _pad: 0,
            msg_size: message.len() as u64,
            msg,
            load,
        }
    }

    #[test]
    fn decodes_a_plain_string() {
        let decoded = decode(&raw(NOTIFY_KIND_STR, b"probe armed", 0));
        assert_eq!(decoded.message, "probe armed");
        assert_eq!(decoded.payload, Payload::Text);
    }

    #[test]
    fn decodes_an_integer_payload() {
        let decoded = decode(&raw(NOTIFY_KIND_INT, b"rid", (-7i64) as u64));
        assert_eq!(decoded.payload, Payload::Int(-7));
    }

    #[test]
    fn decodes_a_float_payload_through_the_union() {
        let decoded = decode(&raw(NOTIFY_KIND_FLOAT, b"load", 2.5f64.to_bits()));
        assert_eq!(decoded.payload, Payload::Float(2.5));
    }

    #[test]
    fn unknown_tags_survive_decoding() {
        let decoded = decode(&raw(42, b"??", 0));
        assert_eq!(decoded.payload, Payload::Unknown(42));
        assert_eq!(decoded.message, "??");
    }

    #[test]
    fn message_stops_at_the_first_nul() {
        let mut msg = [0u8; NOTIFY_MSG_LEN];
        msg[..5].copy_from_slice(b"ab\0cd");
        let notification = Notification {
            kind: NOTIFY_KIND_STR,
            _pad: 0,
            msg_size: NOTIFY_MSG_LEN as u64,
            msg,
            load: 0,
        };
        assert_eq!(decode(&notification).message, "ab");
    }

    #[test]
    fn oversized_msg_size_is_clamped() {
        let decoded = decode(&raw(NOTIFY_KIND_STR, b"x", 0));
        let mut oversized = raw(NOTIFY_KIND_STR, b"x", 0);
        oversized.msg_size = 1 << 20;
        assert_eq!(decode(&oversized).message, decoded.message);
    }
}
