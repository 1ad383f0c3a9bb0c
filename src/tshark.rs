//! tshark as a packet source: process control and `-T json` decoding.
//!
//! tshark emits every field as a string, nests layers under
//! `_source.layers`, and repeats a layer as an array when a frame carries it
//! more than once (tunnels). Addresses and ports are read from the innermost
//! IP and transport layers, the ones `frame.protocols` lists last, so that a
//! tunnelled flow is keyed by the traffic it carries.

use std::{
    borrow::Cow,
    fs,
    net::IpAddr,
    path::PathBuf,
    process::{Command, Stdio},
    str::FromStr,
    thread,
    time::{Duration, Instant},
};

use chrono::Local;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    capture::{CaptureError, PacketSource, SetupError},
    record::{PacketRecord, TcpFlags, Transport},
};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected a json array of packets, found {0}")]
    NotAnArray(&'static str),
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

type Layer = Map<String, Value>;

fn layer<'a>(layers: &'a Layer, name: &str) -> Option<&'a Layer> {
    match layers.get(name)? {
        Value::Object(layer) => Some(layer),
        Value::Array(repeated) => repeated.iter().find_map(Value::as_object),
        _ => None,
    }
}

fn innermost<'a>(layers: &'a Layer, name: &str) -> Option<&'a Layer> {
    match layers.get(name)? {
        Value::Object(layer) => Some(layer),
        Value::Array(repeated) => repeated.iter().rev().find_map(Value::as_object),
        _ => None,
    }
}

/// Picks whichever of `candidates` appears last in the frame's protocol
/// stack, or the first one present when tshark did not report the stack.
fn last_of<'c>(
    layers: &Layer,
    protocols: Option<&str>,
    candidates: &[&'c str],
) -> Option<&'c str> {
    let listed = protocols.and_then(|stack| {
        stack
            .split(':')
            .rev()
            .find_map(|proto| candidates.iter().copied().find(|c| *c == proto))
    });
    listed.or_else(|| candidates.iter().copied().find(|c| layers.contains_key(*c)))
}

fn field<'a>(layer: &'a Layer, name: &str) -> Option<&'a str> {
    match layer.get(name)? {
        Value::String(s) => Some(s),
        Value::Array(repeated) => repeated.iter().find_map(Value::as_str),
        _ => None,
    }
}

fn parsed<T: FromStr>(layer: &Layer, name: &str) -> Option<T> {
    field(layer, name)?.trim().parse().ok()
}

fn flag(layer: &Layer, name: &str) -> Option<bool> {
    field(layer, name).map(|v| matches!(v.trim(), "1" | "True" | "true"))
}

/// Reads a flag from `tcp.flags_tree`, or from the flat layout older
/// tshark versions use.
fn tcp_flag(tcp: &Layer, name: &str, bit: u16, bits: Option<u16>) -> bool {
    layer(tcp, "tcp.flags_tree")
        .and_then(|tree| flag(tree, name))
        .or_else(|| flag(tcp, name))
        .or_else(|| bits.map(|b| (b & bit) != 0))
        .unwrap_or(false)
}

fn hex_flags(tcp: &Layer) -> Option<u16> {
    let raw = field(tcp, "tcp.flags")?.trim();
    u16::from_str_radix(raw.trim_start_matches("0x"), 16).ok()
}

fn decode_tcp(tcp: &Layer) -> Option<Transport> {
    let bits = hex_flags(tcp);
    Some(Transport::Tcp {
        source_port: parsed(tcp, "tcp.srcport")?,
        dest_port: parsed(tcp, "tcp.dstport")?,
        flags: TcpFlags {
            fin: tcp_flag(tcp, "tcp.flags.fin", 0x01, bits),
            syn: tcp_flag(tcp, "tcp.flags.syn", 0x02, bits),
            rst: tcp_flag(tcp, "tcp.flags.reset", 0x04, bits),
            psh: tcp_flag(tcp, "tcp.flags.push", 0x08, bits),
            ack: tcp_flag(tcp, "tcp.flags.ack", 0x10, bits),
            urg: tcp_flag(tcp, "tcp.flags.urg", 0x20, bits),
        },
        window_size: parsed(tcp, "tcp.window_size_value"),
    })
}

fn decode_udp(udp: &Layer) -> Option<Transport> {
    Some(Transport::Udp {
        source_port: parsed(udp, "udp.srcport")?,
        dest_port: parsed(udp, "udp.dstport")?,
    })
}

/// Decodes one element of the tshark array. Anything missing stays `None`.
pub fn decode_packet(packet: &Value) -> PacketRecord {
    let mut record = PacketRecord {
        timestamp: f64::NAN,
        source_ip: None,
        dest_ip: None,
        protocol_id: None,
        length: 0,
        transport: None,
        stream_id: None,
    };
    let layers = match packet.pointer("/_source/layers").and_then(Value::as_object) {
        Some(layers) => layers,
        None => return record,
    };

    let frame = layer(layers, "frame");
    if let Some(frame) = frame {
        record.timestamp = parsed(frame, "frame.time_epoch").unwrap_or(f64::NAN);
        record.length = parsed(frame, "frame.len").unwrap_or(0);
    }
    let protocols = frame.and_then(|frame| field(frame, "frame.protocols"));

    match last_of(layers, protocols, &["ip", "ipv6"]) {
        Some("ip") => {
            if let Some(ip) = innermost(layers, "ip") {
                record.source_ip = parsed::<IpAddr>(ip, "ip.src");
                record.dest_ip = parsed::<IpAddr>(ip, "ip.dst");
                record.protocol_id = parsed(ip, "ip.proto");
            }
        }
        Some(_) => {
            if let Some(ip) = innermost(layers, "ipv6") {
                record.source_ip = parsed::<IpAddr>(ip, "ipv6.src");
                record.dest_ip = parsed::<IpAddr>(ip, "ipv6.dst");
                record.protocol_id = parsed(ip, "ipv6.nxt");
            }
        }
        None => {}
    }

    match last_of(layers, protocols, &["tcp", "udp"]) {
        Some("tcp") => {
            if let Some(tcp) = innermost(layers, "tcp") {
                record.transport = decode_tcp(tcp);
                record.stream_id = parsed(tcp, "tcp.stream");
            }
        }
        Some(_) => {
            if let Some(udp) = innermost(layers, "udp") {
                record.transport = decode_udp(udp);
                record.stream_id = parsed(udp, "udp.stream");
            }
        }
        None => {}
    }

    record
}

/// Decodes a whole `tshark -T json` document.
pub fn parse_packets(bytes: &[u8]) -> Result<Vec<PacketRecord>, ParseError> {
    let text = String::from_utf8_lossy(bytes);
    if let Cow::Owned(_) = text {
        warn!("capture output is not valid utf-8, invalid bytes replaced");
    }
    let document: Value = serde_json::from_str(&text)?;
    match document {
        Value::Array(packets) => Ok(packets.iter().map(decode_packet).collect()),
        other => Err(ParseError::NotAnArray(kind(&other))),
    }
}

/// Runs `tshark -i <interface> -a duration:<window> -T json` for each window.
pub struct TsharkSource {
    bin: PathBuf,
    interface: String,
    work_dir: PathBuf,
    /// Grace period on top of the window before the child is killed.
    timeout: Duration,
}

impl TsharkSource {
    pub fn new(
        bin: impl Into<PathBuf>,
        interface: impl Into<String>,
        work_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Result<Self, SetupError> {
        let bin = bin.into();
        let status = Command::new(&bin)
            .arg("-v")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| SetupError::ToolUnavailable {
                tool: bin.clone(),
                reason: e.to_string(),
            })?;
        if !status.success() {
            return Err(SetupError::ToolUnavailable {
                tool: bin,
                reason: format!("`-v` exited with {status}"),
            });
        }
        Ok(Self {
            bin,
            interface: interface.into(),
            work_dir: work_dir.into(),
            timeout,
        })
    }
}

impl PacketSource for TsharkSource {
    fn acquire(&mut self, window: Duration) -> Result<Vec<PacketRecord>, CaptureError> {
        let prefix = format!("capture_{}_", Local::now().format("%Y%m%d_%H%M%S"));
        // removed on drop, however this function returns
        let output = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".json")
            .tempfile_in(&self.work_dir)?;

        let mut child = Command::new(&self.bin)
            .arg("-i")
            .arg(&self.interface)
            .arg("-a")
            .arg(format!("duration:{}", window.as_secs().max(1)))
            .arg("-T")
            .arg("json")
            .stdin(Stdio::null())
            .stdout(Stdio::from(output.reopen()?))
            .stderr(Stdio::null())
            .spawn()?;

        let limit = window + self.timeout;
        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if started.elapsed() >= limit {
                if let Err(e) = child.kill() {
                    warn!(error = %e, "failed to kill tshark");
                }
                let _ = child.wait();
                return Err(CaptureError::Timeout(limit));
            }
            thread::sleep(POLL_INTERVAL);
        };
        if !status.success() {
            warn!(%status, "tshark exited unsuccessfully");
        }

        let bytes = fs::read(output.path())?;
        debug!(path = %output.path().display(), bytes = bytes.len(), "capture finished");
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(CaptureError::Empty);
        }
        Ok(parse_packets(&bytes)?)
    }

    fn describe(&self) -> String {
        format!("tshark on {}", self.interface)
    }
}
