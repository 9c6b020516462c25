//! Shared utilities for integration testing.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Notify;

use mux_relay::processor::h2::frame::{
    Frame, FrameHeader, Headers, PushPromise, Setting, Settings, HEADER_LEN, PREFACE,
};
use mux_relay::processor::h2::hpack::{HeaderDecoder, HeaderEncoder};
use mux_relay::processor::{ConnId, Hint, Processor};
use mux_relay::relay::{Action, BackendTarget, Connector, EngineConfig, RelayEngine};

pub fn client_addr() -> SocketAddr {
    "10.0.0.7:40000".parse().unwrap()
}

/// Resolves hints by host name only.
#[derive(Debug, Default)]
pub struct HostConnector {
    hosts: HashMap<String, SocketAddr>,
}

impl HostConnector {
    pub fn with(mut self, host: &str, addr: &str) -> Self {
        self.hosts.insert(host.to_string(), addr.parse().unwrap());
        self
    }
}

impl Connector for HostConnector {
    fn resolve(&self, _client: SocketAddr, hint: &Hint) -> Option<BackendTarget> {
        let host = hint.host.as_deref()?;
        self.hosts
            .get(host)
            .map(|addr| BackendTarget::new(host, *addr))
    }
}

/// Drives a `RelayEngine` entirely in memory: bytes go straight into input
/// buffers and are drained from output buffers.
pub struct Harness<P: Processor> {
    pub engine: RelayEngine<P>,
    pub connects: Vec<(ConnId, BackendTarget)>,
    pub actions: Vec<Action>,
}

impl<P: Processor> Harness<P> {
    pub fn new(processor: P, connector: impl Connector + 'static) -> Self {
        let engine = RelayEngine::new(
            Arc::new(processor),
            Arc::new(connector),
            client_addr(),
            EngineConfig::default(),
            Arc::new(Notify::new()),
        );
        let mut harness = Self {
            engine,
            connects: Vec::new(),
            actions: Vec::new(),
        };
        harness.engine.start();
        harness.collect();
        harness
    }

    fn collect(&mut self) {
        for action in self.engine.take_actions() {
            if let Action::Connect { id, target } = &action {
                self.connects.push((*id, target.clone()));
            }
            self.actions.push(action);
        }
    }

    pub fn backend(&self, host: &str) -> ConnId {
        self.engine
            .backend_ids()
            .into_iter()
            .find(|id| self.engine.backend_target(*id).is_some_and(|t| t.name == host))
            .unwrap_or_else(|| panic!("no backend opened for {host}"))
    }

    pub fn connect_all(&mut self) {
        for id in self.engine.backend_ids() {
            self.engine.on_connected(id);
        }
        self.collect();
    }

    pub fn receive(&mut self, conn: ConnId, data: &[u8]) {
        self.engine
            .input_mut(conn)
            .expect("connection is open")
            .extend_from_slice(data);
        self.engine.on_readable(conn);
        self.collect();
    }

    /// What the session task does when a pause handle was resumed.
    pub fn tick(&mut self) {
        self.engine.on_tick();
        self.collect();
    }

    pub fn remote_closed(&mut self, conn: ConnId) {
        self.engine.on_remote_closed(conn);
        self.collect();
    }

    /// Everything queued for `conn`, as its socket would have written it.
    pub fn drain(&mut self, conn: ConnId) -> Vec<u8> {
        let mut data = Vec::new();
        if let Some(out) = self.engine.output_mut(conn) {
            while let Some(chunk) = out.front() {
                let chunk = chunk.to_vec();
                out.advance(chunk.len());
                data.extend_from_slice(&chunk);
            }
        }
        self.engine.on_written(conn);
        self.collect();
        data
    }

    pub fn count(&self, action: &Action) -> usize {
        self.actions.iter().filter(|a| *a == action).count()
    }
}

pub fn headers(pairs: &[(&str, &str)]) -> Vec<(Vec<u8>, Vec<u8>)> {
    pairs
        .iter()
        .map(|(n, v)| (n.as_bytes().to_vec(), v.as_bytes().to_vec()))
        .collect()
}

pub fn request(authority: &str, path: &str) -> Vec<(Vec<u8>, Vec<u8>)> {
    headers(&[
        (":method", "GET"),
        (":scheme", "https"),
        (":authority", authority),
        (":path", path),
    ])
}

/// Client preface followed by an empty SETTINGS frame.
pub fn client_preface() -> Vec<u8> {
    client_preface_with(&[])
}

pub fn client_preface_with(params: &[(u16, u32)]) -> Vec<u8> {
    let mut dst = PREFACE.to_vec();
    dst.extend(settings_with(params));
    dst
}

pub fn settings() -> Vec<u8> {
    settings_with(&[])
}

pub fn settings_with(params: &[(u16, u32)]) -> Vec<u8> {
    encode(Frame::Settings(Settings {
        ack: false,
        params: params.iter().map(|(id, value)| Setting::new(*id, *value)).collect(),
    }))
}

pub fn encode(frame: Frame) -> Vec<u8> {
    frame.to_bytes().to_vec()
}

/// HEADERS carrying `fragment` as is.
pub fn headers_with_fragment(stream_id: u32, fragment: &[u8], end_headers: bool) -> Frame {
    Frame::Headers(Headers {
        stream_id,
        end_stream: false,
        end_headers,
        priority: None,
        pad_len: None,
        fragment: Bytes::copy_from_slice(fragment),
    })
}

pub fn headers_frame(
    encoder: &mut HeaderEncoder,
    stream_id: u32,
    list: &[(Vec<u8>, Vec<u8>)],
    end_stream: bool,
) -> Vec<u8> {
    Frame::Headers(Headers {
        stream_id,
        end_stream,
        end_headers: true,
        priority: None,
        pad_len: None,
        fragment: encoder.encode(list),
    })
    .to_bytes()
    .to_vec()
}

pub fn push_promise_frame(
    encoder: &mut HeaderEncoder,
    stream_id: u32,
    promised_id: u32,
    list: &[(Vec<u8>, Vec<u8>)],
) -> Vec<u8> {
    Frame::PushPromise(PushPromise {
        stream_id,
        end_headers: true,
        promised_id,
        pad_len: None,
        fragment: encoder.encode(list),
    })
    .to_bytes()
    .to_vec()
}

pub fn data_frame(stream_id: u32, payload: &[u8], end_stream: bool) -> Vec<u8> {
    Frame::Data {
        stream_id,
        flags: u8::from(end_stream),
        payload: Bytes::copy_from_slice(payload),
    }
    .to_bytes()
    .to_vec()
}

/// Split a byte stream into frames, skipping a leading client preface.
pub fn parse_frames(data: &[u8]) -> Vec<Frame> {
    let mut rest = data.strip_prefix(&PREFACE[..]).unwrap_or(data);
    let mut frames = Vec::new();
    while !rest.is_empty() {
        let header = FrameHeader::parse(rest).expect("frame header");
        let end = HEADER_LEN + header.length;
        let payload = Bytes::copy_from_slice(&rest[HEADER_LEN..end]);
        frames.push(Frame::decode(&header, payload).expect("frame payload"));
        rest = &rest[end..];
    }
    frames
}

/// Decoded header blocks in arrival order, keyed by the frame's stream id.
pub fn header_blocks(frames: &[Frame], decoder: &mut HeaderDecoder) -> Vec<(u32, Vec<(String, String)>)> {
    frames
        .iter()
        .filter_map(|frame| match frame {
            Frame::Headers(h) => Some((h.stream_id, &h.fragment)),
            Frame::PushPromise(p) => Some((p.stream_id, &p.fragment)),
            _ => None,
        })
        .map(|(stream_id, fragment)| {
            let list = decoder
                .decode(fragment)
                .expect("header block")
                .into_iter()
                .map(|(n, v)| {
                    (
                        String::from_utf8(n).unwrap(),
                        String::from_utf8(v).unwrap(),
                    )
                })
                .collect();
            (stream_id, list)
        })
        .collect()
}

pub fn value<'a>(list: &'a [(String, String)], name: &str) -> Option<&'a str> {
    list.iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

/// DATA payloads per stream id, concatenated.
pub fn data_by_stream(frames: &[Frame]) -> HashMap<u32, Vec<u8>> {
    let mut out: HashMap<u32, Vec<u8>> = HashMap::new();
    for frame in frames {
        if let Frame::Data {
            stream_id, payload, ..
        } = frame
        {
            out.entry(*stream_id).or_default().extend_from_slice(payload);
        }
    }
    out
}

/// Start a TCP backend that echoes everything it receives.
pub async fn start_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}
