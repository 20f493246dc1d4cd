//! Encoding of outbound requests and decoding of inbound frames.

use std::time::Duration;

use bytes::Buf;
use serde_json::{json, Value};

use super::{
    decode_series_id, ControlEvent, DataPayload, ExecuteRequest, PayloadValue, SeriesProperties,
    StreamMessage,
};
use crate::{DatasourceError, Result};

const HEADER_LEN: usize = 20;
const CHANNEL_NAME_LEN: usize = 16;
const DATA_MESSAGE_TYPE: u8 = 5;
const FLAG_COMPRESSED: u8 = 0x01;
const FLAG_JSON: u8 = 0x02;
const PAYLOAD_LEN: usize = 17;

const VALUE_TYPE_LONG: u8 = 1;
const VALUE_TYPE_DOUBLE: u8 = 2;
const VALUE_TYPE_INT: u8 = 3;

/// An inbound frame after decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Authenticated,
    /// Connection-level failure not tied to a channel.
    ConnectionError(String),
    Channel {
        channel: String,
        message: StreamMessage,
    },
    /// Connection-level chatter such as keep-alives.
    Unrouted(String),
}

pub fn encode_authenticate(token: &str) -> String {
    json!({ "type": "authenticate", "token": token }).to_string()
}

pub fn encode_execute(channel: &str, request: &ExecuteRequest) -> String {
    let mut body = json!({
        "type": "execute",
        "channel": channel,
        "program": request.program,
        "start": request.start.timestamp_millis(),
        "immediate": request.immediate,
        "compress": false,
    });
    if let Some(stop) = request.stop {
        body["stop"] = json!(stop.timestamp_millis());
    }
    if let Some(resolution) = request.resolution {
        body["resolution"] = json!(resolution.as_millis() as u64);
    }
    body.to_string()
}

pub fn encode_stop(channel: &str) -> String {
    json!({ "type": "stop", "channel": channel }).to_string()
}

pub fn decode_text(text: &str) -> Result<Frame> {
    let value: Value = serde_json::from_str(text)?;
    Ok(decode_json(&value, None))
}

fn decode_json(value: &Value, header_channel: Option<&str>) -> Frame {
    let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
    let channel = value
        .get("channel")
        .and_then(Value::as_str)
        .or(header_channel)
        .map(str::to_string);

    if kind == "authenticated" {
        return Frame::Authenticated;
    }

    let Some(channel) = channel else {
        return match kind {
            "error" => Frame::ConnectionError(error_text(value)),
            other => Frame::Unrouted(other.to_string()),
        };
    };

    let message = match kind {
        "control-message" => decode_control(value),
        "message" => decode_info(value),
        "metadata" => decode_metadata(value),
        "data" => decode_json_data(value),
        "error" => StreamMessage::TransportError(error_text(value)),
        other => StreamMessage::Other(other.to_string()),
    };
    Frame::Channel { channel, message }
}

fn error_text(value: &Value) -> String {
    let code = value.get("error").map(|e| match e {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    });
    let message = value.get("message").and_then(Value::as_str);
    match (code, message) {
        (Some(code), Some(message)) => format!("{}: {}", code, message),
        (Some(code), None) => code,
        (None, Some(message)) => message.to_string(),
        (None, None) => value.to_string(),
    }
}

fn decode_control(value: &Value) -> StreamMessage {
    let event = value.get("event").and_then(Value::as_str).unwrap_or_default();
    let event = match event {
        "END_OF_CHANNEL" => ControlEvent::EndOfChannel,
        "CHANNEL_ABORT" => ControlEvent::Abort,
        other => ControlEvent::Other(other.to_string()),
    };
    StreamMessage::Control(event)
}

fn decode_info(value: &Value) -> StreamMessage {
    let block = value.get("message").unwrap_or(&Value::Null);
    let code = block
        .get("messageCode")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let contents = block.get("contents").unwrap_or(&Value::Null);
    let millis = |key: &str| contents.get(key).and_then(as_millis);

    match code {
        "JOB_RUNNING_RESOLUTION" => match millis("resolutionMs") {
            Some(ms) => StreamMessage::Control(ControlEvent::ResolutionHint(ms)),
            None => StreamMessage::Other(code.to_string()),
        },
        "JOB_INITIAL_MAX_DELAY" => match millis("maxDelayMs") {
            Some(ms) => StreamMessage::Control(ControlEvent::MaxDelayHint(ms)),
            None => StreamMessage::Other(code.to_string()),
        },
        other => StreamMessage::Control(ControlEvent::Other(other.to_string())),
    }
}

fn as_millis(value: &Value) -> Option<Duration> {
    let ms = match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64))?,
        Value::String(s) => s.parse().ok()?,
        _ => return None,
    };
    Some(Duration::from_millis(ms))
}

fn decode_metadata(value: &Value) -> StreamMessage {
    let id = value
        .get("tsId")
        .and_then(Value::as_str)
        .and_then(decode_series_id);
    let properties = value
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_else(SeriesProperties::new);
    match id {
        Some(id) => StreamMessage::Metadata { id, properties },
        None => StreamMessage::Other("metadata without a valid tsId".to_string()),
    }
}

fn decode_json_data(value: &Value) -> StreamMessage {
    let timestamp_ms = value
        .get("logicalTimestampMs")
        .and_then(Value::as_i64)
        .unwrap_or_default();
    let payloads = value
        .get("data")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    let id = entry
                        .get("tsId")
                        .and_then(Value::as_str)
                        .and_then(decode_series_id)?;
                    let value = match entry.get("value") {
                        Some(Value::Number(n)) if n.is_i64() => {
                            PayloadValue::Long(n.as_i64().unwrap_or_default())
                        }
                        Some(Value::Number(n)) => {
                            PayloadValue::Double(n.as_f64().unwrap_or_default())
                        }
                        _ => PayloadValue::Unknown(0),
                    };
                    Some(DataPayload { id, value })
                })
                .collect()
        })
        .unwrap_or_default();
    StreamMessage::Data {
        timestamp_ms,
        payloads,
    }
}

pub fn decode_binary(frame: &[u8]) -> Result<Frame> {
    if frame.len() < HEADER_LEN {
        return Err(DatasourceError::Stream(format!(
            "Binary frame too short: {} bytes",
            frame.len()
        )));
    }
    let mut buf = frame;
    let _version = buf.get_u8();
    let message_type = buf.get_u8();
    let flags = buf.get_u8();
    let _reserved = buf.get_u8();
    let mut name = [0u8; CHANNEL_NAME_LEN];
    buf.copy_to_slice(&mut name);
    let channel = String::from_utf8_lossy(&name)
        .trim_end_matches('\0')
        .to_string();

    if flags & FLAG_COMPRESSED != 0 {
        return Ok(Frame::Channel {
            channel,
            message: StreamMessage::Other("compressed binary frame".to_string()),
        });
    }
    if flags & FLAG_JSON != 0 {
        let value: Value = serde_json::from_slice(buf)?;
        return Ok(decode_json(&value, Some(&channel)));
    }
    if message_type != DATA_MESSAGE_TYPE {
        return Ok(Frame::Channel {
            channel,
            message: StreamMessage::Other(format!("binary message type {}", message_type)),
        });
    }

    if buf.remaining() < 12 {
        return Err(DatasourceError::Stream("Truncated data frame header".to_string()));
    }
    let timestamp_ms = buf.get_u64() as i64;
    let count = buf.get_u32() as usize;
    if buf.remaining() < count * PAYLOAD_LEN {
        return Err(DatasourceError::Stream(format!(
            "Truncated data frame: {} payloads announced, {} bytes left",
            count,
            buf.remaining()
        )));
    }

    let mut payloads = Vec::with_capacity(count);
    for _ in 0..count {
        let value_type = buf.get_u8();
        let id = buf.get_u64();
        let mut raw = [0u8; 8];
        buf.copy_to_slice(&mut raw);
        let value = match value_type {
            VALUE_TYPE_LONG => PayloadValue::Long(i64::from_be_bytes(raw)),
            VALUE_TYPE_DOUBLE => PayloadValue::Double(f64::from_be_bytes(raw)),
            VALUE_TYPE_INT => {
                PayloadValue::Int(i32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]))
            }
            other => PayloadValue::Unknown(other),
        };
        payloads.push(DataPayload { id, value });
    }

    Ok(Frame::Channel {
        channel,
        message: StreamMessage::Data {
            timestamp_ms,
            payloads,
        },
    })
}

#[cfg(test)]
pub(crate) fn encode_data_frame(channel: &str, timestamp_ms: i64, payloads: &[(u8, u64, [u8; 8])]) -> Vec<u8> {
    use bytes::BufMut;

    let mut out = Vec::new();
    out.put_u8(1);
    out.put_u8(DATA_MESSAGE_TYPE);
    out.put_u8(0);
    out.put_u8(0);
    let mut name = [0u8; CHANNEL_NAME_LEN];
    name[..channel.len()].copy_from_slice(channel.as_bytes());
    out.put_slice(&name);
    out.put_u64(timestamp_ms as u64);
    out.put_u32(payloads.len() as u32);
    for (value_type, id, raw) in payloads {
        out.put_u8(*value_type);
        out.put_u64(*id);
        out.put_slice(raw);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn channel_message(frame: Frame) -> StreamMessage {
        match frame {
            Frame::Channel { message, .. } => message,
            other => panic!("expected a channel frame, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_execute_bounded() {
        let request = ExecuteRequest {
            program: "data('cpu').publish()".to_string(),
            start: Utc.timestamp_millis_opt(1_000).unwrap(),
            stop: Some(Utc.timestamp_millis_opt(61_000).unwrap()),
            resolution: Some(Duration::from_secs(10)),
            immediate: true,
        };
        let body: Value = serde_json::from_str(&encode_execute("R1", &request)).unwrap();
        assert_eq!(body["type"], "execute");
        assert_eq!(body["channel"], "R1");
        assert_eq!(body["start"], 1_000);
        assert_eq!(body["stop"], 61_000);
        assert_eq!(body["resolution"], 10_000);
        assert_eq!(body["immediate"], true);
    }

    #[test]
    fn test_encode_execute_unbounded_omits_stop_and_resolution() {
        let request = ExecuteRequest {
            program: "data('cpu').publish()".to_string(),
            start: Utc.timestamp_millis_opt(1_000).unwrap(),
            stop: None,
            resolution: None,
            immediate: false,
        };
        let body: Value = serde_json::from_str(&encode_execute("R2", &request)).unwrap();
        assert!(body.get("stop").is_none());
        assert!(body.get("resolution").is_none());
        assert_eq!(body["immediate"], false);
    }

    #[test]
    fn test_decode_control_and_hints() {
        let end = decode_text(r#"{"type":"control-message","channel":"R1","event":"END_OF_CHANNEL"}"#).unwrap();
        assert_eq!(channel_message(end), StreamMessage::Control(ControlEvent::EndOfChannel));

        let abort = decode_text(r#"{"type":"control-message","channel":"R1","event":"CHANNEL_ABORT"}"#).unwrap();
        assert_eq!(channel_message(abort), StreamMessage::Control(ControlEvent::Abort));

        let resolution = decode_text(
            r#"{"type":"message","channel":"R1","message":{"messageCode":"JOB_RUNNING_RESOLUTION","contents":{"resolutionMs":1000}}}"#,
        )
        .unwrap();
        assert_eq!(
            channel_message(resolution),
            StreamMessage::Control(ControlEvent::ResolutionHint(Duration::from_millis(1000)))
        );

        let delay = decode_text(
            r#"{"type":"message","channel":"R1","message":{"messageCode":"JOB_INITIAL_MAX_DELAY","contents":{"maxDelayMs":"2000"}}}"#,
        )
        .unwrap();
        assert_eq!(
            channel_message(delay),
            StreamMessage::Control(ControlEvent::MaxDelayHint(Duration::from_millis(2000)))
        );
    }

    #[test]
    fn test_decode_connection_level_frames() {
        assert_eq!(
            decode_text(r#"{"type":"authenticated","orgId":"abc"}"#).unwrap(),
            Frame::Authenticated
        );
        assert_eq!(
            decode_text(r#"{"type":"error","error":401,"message":"bad token"}"#).unwrap(),
            Frame::ConnectionError("401: bad token".to_string())
        );
        assert_eq!(
            decode_text(r#"{"type":"keep-alive"}"#).unwrap(),
            Frame::Unrouted("keep-alive".to_string())
        );
    }

    #[test]
    fn test_decode_unknown_channel_message() {
        let frame = decode_text(r#"{"type":"something-new","channel":"R3"}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Channel {
                channel: "R3".to_string(),
                message: StreamMessage::Other("something-new".to_string()),
            }
        );
    }

    #[test]
    fn test_decode_metadata() {
        let frame = decode_text(
            r#"{"type":"metadata","channel":"R1","tsId":"AAAAAKhPkMk","properties":{"sf_metric":"cpu","host":"a"}}"#,
        )
        .unwrap();
        match channel_message(frame) {
            StreamMessage::Metadata { id, properties } => {
                assert_eq!(id, 0xa84f_90c9);
                assert_eq!(properties["sf_metric"], "cpu");
                assert_eq!(properties["host"], "a");
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_decode_binary_data() {
        let frame = encode_data_frame(
            "R7",
            1_560_761_879_000,
            &[
                (VALUE_TYPE_DOUBLE, 42, 2.5f64.to_be_bytes()),
                (VALUE_TYPE_LONG, 43, 7i64.to_be_bytes()),
                (VALUE_TYPE_INT, 44, (-3i64).to_be_bytes()),
                (9, 45, [0xff; 8]),
            ],
        );
        let decoded = decode_binary(&frame).unwrap();
        assert_eq!(
            decoded,
            Frame::Channel {
                channel: "R7".to_string(),
                message: StreamMessage::Data {
                    timestamp_ms: 1_560_761_879_000,
                    payloads: vec![
                        DataPayload { id: 42, value: PayloadValue::Double(2.5) },
                        DataPayload { id: 43, value: PayloadValue::Long(7) },
                        DataPayload { id: 44, value: PayloadValue::Int(-3) },
                        DataPayload { id: 45, value: PayloadValue::Unknown(9) },
                    ],
                },
            }
        );
    }

    #[test]
    fn test_decode_binary_truncated() {
        let mut frame = encode_data_frame("R1", 1_000, &[(VALUE_TYPE_DOUBLE, 1, 1f64.to_be_bytes())]);
        frame.truncate(frame.len() - 4);
        assert!(decode_binary(&frame).is_err());
        assert!(decode_binary(&[1, 5, 0]).is_err());
    }

    #[test]
    fn test_decode_binary_json_flag_uses_header_channel() {
        let mut frame = encode_data_frame("R9", 0, &[]);
        frame.truncate(HEADER_LEN);
        frame[2] = FLAG_JSON;
        frame.extend_from_slice(br#"{"type":"control-message","event":"END_OF_CHANNEL"}"#);
        assert_eq!(
            decode_binary(&frame).unwrap(),
            Frame::Channel {
                channel: "R9".to_string(),
                message: StreamMessage::Control(ControlEvent::EndOfChannel),
            }
        );
    }
}
