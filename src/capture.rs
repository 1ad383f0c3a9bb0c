//! Packet acquisition: one capture window in, packet records out.

use std::{
    io,
    net::IpAddr,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use etherparse::{InternetSlice, SlicedPacket, TransportSlice};
use pcap::{Active, Capture, Device, Linktype, PacketHeader};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    record::{PacketRecord, TcpFlags, Transport, PROTO_TCP, PROTO_UDP},
    tshark::{self, ParseError},
};

/// libpcap read timeout, so the window deadline is checked even on a quiet
/// link.
const READ_TIMEOUT_MS: i32 = 500;

/// DLT_RAW as libpcap reports it; 14 on OpenBSD, 12 elsewhere.
const DLT_RAW: [Linktype; 2] = [Linktype(12), Linktype(14)];

#[derive(Debug, Error)]
#[error("unsupported link type {0}")]
pub struct UnsupportedLinktype(pub i32);

/// Failure to acquire one window. Never fatal for the driver.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture produced no output")]
    Empty,
    #[error("capture did not finish within {0:?}")]
    Timeout(Duration),
    #[error("failed to parse capture output: {0}")]
    Parse(#[from] ParseError),
    #[error("pcap: {0}")]
    Pcap(#[from] pcap::Error),
    #[error(transparent)]
    Linktype(#[from] UnsupportedLinktype),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("source has no more packets")]
    Exhausted,
}

/// Problems found before the first window; these stop the process.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("capture device {0:?} not found")]
    DeviceNotFound(String),
    #[error("capture tool {tool:?} is not usable: {reason}")]
    ToolUnavailable { tool: PathBuf, reason: String },
    #[error("pcap: {0}")]
    Pcap(#[from] pcap::Error),
    #[error(transparent)]
    Linktype(#[from] UnsupportedLinktype),
    #[error("capture file {path:?}: {source}")]
    File { path: PathBuf, source: io::Error },
}

pub trait PacketSource {
    /// Collects packets for roughly `window`.
    fn acquire(&mut self, window: Duration) -> Result<Vec<PacketRecord>, CaptureError>;

    fn describe(&self) -> String;
}

impl<S: PacketSource + ?Sized> PacketSource for Box<S> {
    fn acquire(&mut self, window: Duration) -> Result<Vec<PacketRecord>, CaptureError> {
        (**self).acquire(window)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// What sits in front of the IP header in a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Ethernet,
    Ip,
    /// A fixed-size pseudo header: Linux cooked capture or BSD loopback.
    Skip(usize),
}

impl Framing {
    fn of(linktype: Linktype) -> Result<Self, UnsupportedLinktype> {
        match linktype {
            Linktype::ETHERNET => Ok(Framing::Ethernet),
            Linktype::RAW | Linktype::IPV4 | Linktype::IPV6 => Ok(Framing::Ip),
            raw if DLT_RAW.contains(&raw) => Ok(Framing::Ip),
            Linktype::LINUX_SLL => Ok(Framing::Skip(16)),
            Linktype::LINUX_SLL2 => Ok(Framing::Skip(20)),
            Linktype::NULL | Linktype::LOOP => Ok(Framing::Skip(4)),
            Linktype(other) => Err(UnsupportedLinktype(other)),
        }
    }
}

fn timestamp(header: &PacketHeader) -> f64 {
    header.ts.tv_sec as f64 + header.ts.tv_usec as f64 / 1e6
}

/// Decodes one captured frame. Frames etherparse cannot slice come back
/// without layers and are rejected later by the keyer.
fn decode_frame(timestamp: f64, length: u32, data: &[u8], framing: Framing) -> PacketRecord {
    let mut record = PacketRecord {
        timestamp,
        source_ip: None,
        dest_ip: None,
        protocol_id: None,
        length,
        transport: None,
        stream_id: None,
    };

    let sliced = match framing {
        Framing::Ethernet => SlicedPacket::from_ethernet(data),
        Framing::Ip => SlicedPacket::from_ip(data),
        Framing::Skip(header) => match data.get(header..) {
            Some(packet) => SlicedPacket::from_ip(packet),
            None => return record,
        },
    };
    let sliced = match sliced {
        Ok(sliced) => sliced,
        Err(_) => return record,
    };

    // the header's own protocol field only names the transport when no
    // extension header sits in between
    let header_protocol = match sliced.ip {
        Some(InternetSlice::Ipv4(hdr, extensions)) => {
            record.source_ip = Some(IpAddr::from(hdr.source()));
            record.dest_ip = Some(IpAddr::from(hdr.destination()));
            extensions.is_empty().then(|| hdr.protocol())
        }
        Some(InternetSlice::Ipv6(hdr, extensions)) => {
            record.source_ip = Some(IpAddr::from(hdr.source()));
            record.dest_ip = Some(IpAddr::from(hdr.destination()));
            extensions.is_empty().then(|| hdr.next_header())
        }
        None => None,
    };

    record.transport = match sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => Some(Transport::Tcp {
            source_port: tcp.source_port(),
            dest_port: tcp.destination_port(),
            flags: TcpFlags {
                syn: tcp.syn(),
                ack: tcp.ack(),
                fin: tcp.fin(),
                rst: tcp.rst(),
                psh: tcp.psh(),
                urg: tcp.urg(),
            },
            window_size: Some(u32::from(tcp.window_size())),
        }),
        Some(TransportSlice::Udp(udp)) => Some(Transport::Udp {
            source_port: udp.source_port(),
            dest_port: udp.destination_port(),
        }),
        _ => None,
    };
    record.protocol_id = match record.transport {
        Some(Transport::Tcp { .. }) => Some(PROTO_TCP),
        Some(Transport::Udp { .. }) => Some(PROTO_UDP),
        None => header_protocol,
    };

    record
}

/// Live capture on a network device through libpcap.
pub struct PcapSource {
    device: Device,
}

impl PcapSource {
    pub fn new(device_name: &str) -> Result<Self, SetupError> {
        let device = Device::list()?
            .into_iter()
            .find(|device| device.name == device_name)
            .ok_or_else(|| SetupError::DeviceNotFound(device_name.to_string()))?;
        // fail now rather than on every window if we lack the privileges or
        // cannot read the device's framing
        let capture = Self::open(&device)?;
        let linktype = capture.get_datalink();
        Framing::of(linktype)?;
        drop(capture);
        info!(device = %device.name, linktype = linktype.0, "opened capture device");
        Ok(Self { device })
    }

    fn open(device: &Device) -> Result<Capture<Active>, pcap::Error> {
        Capture::from_device(device.clone())?
            .promisc(true)
            .timeout(READ_TIMEOUT_MS)
            .open()
    }
}

impl PacketSource for PcapSource {
    fn acquire(&mut self, window: Duration) -> Result<Vec<PacketRecord>, CaptureError> {
        let mut capture = Self::open(&self.device)?;
        let framing = Framing::of(capture.get_datalink())?;
        let deadline = Instant::now() + window;
        let mut records = Vec::new();

        while Instant::now() < deadline {
            match capture.next() {
                Ok(packet) => records.push(decode_frame(
                    timestamp(packet.header),
                    packet.header.len,
                    packet.data,
                    framing,
                )),
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        debug!(packets = records.len(), "pcap window closed");
        Ok(records)
    }

    fn describe(&self) -> String {
        format!("pcap device {}", self.device.name)
    }
}

/// Reads every frame of a pcap file.
pub fn read_pcap_file(path: &Path) -> Result<Vec<PacketRecord>, CaptureError> {
    let mut capture = Capture::from_file(path)?;
    let framing = Framing::of(capture.get_datalink())?;
    let mut records = Vec::new();
    loop {
        match capture.next() {
            Ok(packet) => records.push(decode_frame(
                timestamp(packet.header),
                packet.header.len,
                packet.data,
                framing,
            )),
            Err(pcap::Error::NoMorePackets) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(records)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Pcap,
    TsharkJson,
}

impl FileFormat {
    /// `.json` is tshark output, anything else is handed to libpcap.
    pub fn guess(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => FileFormat::TsharkJson,
            _ => FileFormat::Pcap,
        }
    }
}

/// A saved capture replayed as a single window.
pub struct FileSource {
    path: PathBuf,
    format: FileFormat,
    consumed: bool,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, format: FileFormat) -> Result<Self, SetupError> {
        let path = path.into();
        if let Err(source) = std::fs::metadata(&path) {
            return Err(SetupError::File { path, source });
        }
        if format == FileFormat::Pcap {
            Framing::of(Capture::from_file(&path)?.get_datalink())?;
        }
        Ok(Self {
            path,
            format,
            consumed: false,
        })
    }

    pub fn read(&self) -> Result<Vec<PacketRecord>, CaptureError> {
        match self.format {
            FileFormat::Pcap => read_pcap_file(&self.path),
            FileFormat::TsharkJson => {
                let bytes = std::fs::read(&self.path)?;
                if bytes.iter().all(u8::is_ascii_whitespace) {
                    return Err(CaptureError::Empty);
                }
                Ok(tshark::parse_packets(&bytes)?)
            }
        }
    }
}

impl PacketSource for FileSource {
    fn acquire(&mut self, _window: Duration) -> Result<Vec<PacketRecord>, CaptureError> {
        if self.consumed {
            return Err(CaptureError::Exhausted);
        }
        self.consumed = true;
        self.read()
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}
