use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::Packet;

use crate::decoder::{decode, DecoderConfig};
use crate::error::AppError;
use crate::lifecycle::{LifecycleState, State};
use crate::queue::EventQueue;

/// Read timeout used as the capture loop's "breakloop" facility: the
/// blocking read returns `Ok(None)` at least this often so the loop can
/// re-check `is_running()` and bound shutdown latency.
const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// Consecutive mid-run read failures after which the capture thread gives
/// up and self-escalates into `Stopping` rather than erroring forever.
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 10;

/// Abstraction over a live packet-capture device. Production code opens a
/// real NIC through `pnet`'s datalink channel; tests substitute a canned
/// sequence of frames. A `None` return means "no frame within the read
/// timeout", distinct from a genuine read error.
pub trait PacketSource: Send {
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, String>;
}

/// Opens an Ethernet datalink channel on the named interface via `pnet`.
pub struct PnetSource {
    rx: Box<dyn pnet::datalink::DataLinkReceiver>,
}

impl PnetSource {
    pub fn open(interface_name: &str) -> Result<Self, AppError> {
        let interface = pnet::datalink::interfaces()
            .into_iter()
            .find(|iface| iface.name == interface_name)
            .ok_or_else(|| {
                AppError::Capture(format!(
                    "no such interface '{}'",
                    interface_name
                ))
            })?;

        let config = pnet::datalink::Config {
            read_timeout: Some(READ_TIMEOUT),
            ..Default::default()
        };

        let channel = pnet::datalink::channel(&interface, config)
            .map_err(|e| {
                AppError::Capture(format!(
                    "failed to open interface '{}': {}",
                    interface_name, e
                ))
            })?;

        let rx = match channel {
            pnet::datalink::Channel::Ethernet(_tx, rx) => rx,
            _ => {
                return Err(AppError::Capture(
                    "unsupported link type: only Ethernet is supported"
                        .to_string(),
                ))
            }
        };

        Ok(PnetSource { rx })
    }
}

impl PacketSource for PnetSource {
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, String> {
        match self.rx.next() {
            Ok(frame) => Ok(Some(frame.to_vec())),
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                Ok(None)
            }
            Err(e) => Err(e.to_string()),
        }
    }
}

/// Strips Ethernet/IP/TCP headers off a captured frame and returns the TCP
/// source/destination ports and payload, if the frame parses as a
/// non-fragmented IPv4 or IPv6 segment carrying TCP with a non-empty
/// payload. Anything else (unknown ethertype, fragment, non-TCP, empty
/// payload, truncated header) yields `None` and is silently skipped.
fn extract_tcp_payload(frame: &[u8]) -> Option<(u16, u16, Vec<u8>)> {
    let eth = EthernetPacket::new(frame)?;

    match eth.get_ethertype() {
        EtherTypes::Ipv4 => {
            let ipv4 = Ipv4Packet::new(eth.payload())?;
            let more_fragments = ipv4.get_flags() & 0x1 != 0;
            if more_fragments || ipv4.get_fragment_offset() != 0 {
                return None;
            }
            if ipv4.get_next_level_protocol() != IpNextHeaderProtocols::Tcp {
                return None;
            }
            extract_tcp(ipv4.payload())
        }
        EtherTypes::Ipv6 => {
            let ipv6 = Ipv6Packet::new(eth.payload())?;
            if ipv6.get_next_header() != IpNextHeaderProtocols::Tcp {
                return None;
            }
            extract_tcp(ipv6.payload())
        }
        _ => None,
    }
}

fn extract_tcp(payload: &[u8]) -> Option<(u16, u16, Vec<u8>)> {
    let tcp = TcpPacket::new(payload)?;
    let body = tcp.payload();
    if body.is_empty() {
        return None;
    }
    Some((tcp.get_source(), tcp.get_destination(), body.to_vec()))
}

/// Owns the packet source for the lifetime of a capture session: pulls
/// frames in a tight loop, decodes them, and publishes events. The source
/// is opened synchronously in `start()` so an open failure is reported to
/// the caller before `start()` returns, per the bounded-failure contract.
pub struct CaptureEngine {
    state: Arc<LifecycleState>,
    queue: Arc<EventQueue>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CaptureEngine {
    pub fn new(queue: Arc<EventQueue>) -> Self {
        CaptureEngine {
            state: Arc::new(LifecycleState::new()),
            queue,
            handle: None,
        }
    }

    /// Opens the packet source via `open_source`, then spawns the capture
    /// thread and transitions `New -> Running`. `open_source` typically
    /// wraps `PnetSource::open`; tests pass a closure yielding a fake
    /// source instead.
    pub fn start<F>(
        &mut self, decoder_cfg: DecoderConfig, open_source: F,
    ) -> Result<(), AppError>
    where
        F: FnOnce() -> Result<Box<dyn PacketSource>, AppError>
            + Send
            + 'static,
    {
        if self.state.current() != State::New {
            log::warn!("CaptureEngine::start called twice; ignoring");
            return Ok(());
        }

        let source = open_source()?;

        if !self.state.check_and_set(State::New, State::Running) {
            log::warn!(
                "CaptureEngine::start raced with a concurrent start; ignoring"
            );
            return Ok(());
        }

        let state = self.state.clone();
        let queue = self.queue.clone();
        self.handle = Some(thread::spawn(move || {
            let mut decode_failures: u64 = 0;
            let mut consecutive_read_errors: u32 = 0;
            while state.is_running() {
                match source.next_frame() {
                    Ok(Some(frame)) => {
                        consecutive_read_errors = 0;
                        match extract_tcp_payload(&frame) {
                            Some((src_port, dst_port, payload)) => {
                                for event in decode(
                                    &payload,
                                    src_port,
                                    dst_port,
                                    &decoder_cfg,
                                ) {
                                    if !queue.produce(event) {
                                        log::trace!(
                                            "event queue full; dropping event"
                                        );
                                    }
                                }
                            }
                            None => {
                                decode_failures += 1;
                                log::trace!(
                                    "skipped unparseable frame (total {})",
                                    decode_failures
                                );
                            }
                        }
                    }
                    Ok(None) => {
                        // read timeout: loop back and re-check is_running
                    }
                    Err(e) => {
                        consecutive_read_errors += 1;
                        log::error!("packet source read error: {}", e);
                        if consecutive_read_errors >= MAX_CONSECUTIVE_READ_ERRORS
                        {
                            log::error!(
                                "{} consecutive packet source read errors; initiating shutdown",
                                consecutive_read_errors
                            );
                            state.check_and_set(State::Running, State::Stopping);
                            break;
                        }
                    }
                }
            }
        }));

        Ok(())
    }

    /// Transitions `Running -> Stopping` (a no-op if the capture thread has
    /// already self-escalated into `Stopping` after repeated read
    /// failures), waits for the capture thread to notice (bounded by
    /// `READ_TIMEOUT`), and joins it.
    pub fn shutdown(&mut self) {
        let transitioned =
            self.state.check_and_set(State::Running, State::Stopping);
        if !transitioned && self.state.current() != State::Stopping {
            log::warn!(
                "CaptureEngine::shutdown called before start, or twice; ignoring"
            );
            return;
        }
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
        if !self.state.check_and_set(State::Stopping, State::Terminated) {
            log::error!(
                "capture engine did not reach Terminated cleanly; observed {:?}",
                self.state.current()
            );
        }
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        let state = self.state.current();
        if state != State::Terminated && state != State::New {
            log::error!(
                "CaptureEngine dropped without clean shutdown; observed {:?}",
                state
            );
        }
    }
}
