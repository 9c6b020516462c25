//! Multiplexed sessions driven through the engine without sockets.

mod common;

use bytes::Bytes;
use common::*;
use mux_relay::processor::h2::frame::{Frame, FrameHeader, PrioritySpec, Setting, HEADER_LEN, PREFACE};
use mux_relay::processor::h2::hpack::{HeaderDecoder, HeaderEncoder, DEFAULT_TABLE_SIZE};
use mux_relay::processor::h2::H2Processor;
use mux_relay::processor::ConnId;
use mux_relay::relay::{Action, CloseReason};

fn status(code: &str) -> Vec<(Vec<u8>, Vec<u8>)> {
    headers(&[(":status", code)])
}

/// Client stream `stream_id` routed to a.example, both handshakes done and
/// every output drained.
fn open_stream(stream_id: u32) -> (Harness<H2Processor>, ConnId) {
    let connector = HostConnector::default().with("a.example", "10.0.1.1:8080");
    let mut h = Harness::new(H2Processor::default(), connector);
    let mut client = HeaderEncoder::literal_only();

    let mut input = client_preface();
    input.extend(headers_frame(&mut client, stream_id, &request("a.example", "/"), false));
    h.receive(ConnId::FRONTEND, &input);
    let a = h.backend("a.example");
    h.connect_all();
    h.drain(a);
    h.receive(a, &settings());
    h.drain(a);
    h.drain(ConnId::FRONTEND);
    (h, a)
}

fn assert_violation(h: &Harness<H2Processor>) {
    assert_eq!(h.engine.close_reason(), Some(CloseReason::ProtocolViolation));
    assert_eq!(h.count(&Action::Close(ConnId::FRONTEND)), 1);
}

fn client_session(input: &[u8]) -> Harness<H2Processor> {
    let connector = HostConnector::default().with("a.example", "10.0.1.1:8080");
    let mut h = Harness::new(H2Processor::default(), connector);
    h.receive(ConnId::FRONTEND, input);
    h
}

#[test]
fn streams_fan_out_to_backends_by_host() {
    let connector = HostConnector::default()
        .with("a.example", "10.0.1.1:8080")
        .with("b.example", "10.0.2.1:8080");
    let mut h = Harness::new(H2Processor::default(), connector);
    let mut client = HeaderEncoder::literal_only();

    let mut input = client_preface();
    input.extend(headers_frame(&mut client, 1, &request("a.example", "/one"), true));
    input.extend(headers_frame(&mut client, 3, &request("b.example", "/two"), true));
    h.receive(ConnId::FRONTEND, &input);

    assert_eq!(h.connects.len(), 2);
    let a = h.backend("a.example");
    let b = h.backend("b.example");
    h.connect_all();

    let to_a = h.drain(a);
    assert!(to_a.starts_with(PREFACE));
    let to_a = parse_frames(&to_a);
    assert!(matches!(&to_a[0], Frame::Settings(s) if !s.ack));
    let blocks = header_blocks(&to_a, &mut HeaderDecoder::new());
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].0, 1);
    assert_eq!(value(&blocks[0].1, ":authority"), Some("a.example"));
    assert_eq!(value(&blocks[0].1, ":path"), Some("/one"));
    assert_eq!(value(&blocks[0].1, "x-forwarded-for"), Some("10.0.0.7"));
    assert_eq!(value(&blocks[0].1, "x-client-port"), Some("40000"));

    let blocks = header_blocks(&parse_frames(&h.drain(b)), &mut HeaderDecoder::new());
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].0, 1);
    assert_eq!(value(&blocks[0].1, ":path"), Some("/two"));

    let mut server_a = HeaderEncoder::literal_only();
    let mut reply = settings();
    reply.extend(headers_frame(&mut server_a, 1, &status("200"), false));
    reply.extend(data_frame(1, b"alpha", true));
    h.receive(a, &reply);

    let mut server_b = HeaderEncoder::literal_only();
    let mut reply = settings();
    reply.extend(headers_frame(&mut server_b, 1, &status("404"), false));
    reply.extend(data_frame(1, b"bravo", true));
    h.receive(b, &reply);

    let frames = parse_frames(&h.drain(ConnId::FRONTEND));
    let blocks = header_blocks(&frames, &mut HeaderDecoder::new());
    assert_eq!(blocks.len(), 2);
    for (stream, list) in &blocks {
        let expected = if *stream == 1 { "200" } else { "404" };
        assert_eq!(value(list, ":status"), Some(expected), "stream {stream}");
    }
    let data = data_by_stream(&frames);
    assert_eq!(data[&1], b"alpha");
    assert_eq!(data[&3], b"bravo");
    assert!(!h.engine.is_closed());
}

#[test]
fn same_backend_address_shares_one_connection() {
    let connector = HostConnector::default()
        .with("a.example", "10.0.1.1:8080")
        .with("www.a.example", "10.0.1.1:8080");
    let mut h = Harness::new(H2Processor::default(), connector);
    let mut client = HeaderEncoder::literal_only();

    let mut input = client_preface();
    input.extend(headers_frame(&mut client, 1, &request("a.example", "/first"), true));
    input.extend(headers_frame(&mut client, 5, &request("www.a.example", "/second"), true));
    h.receive(ConnId::FRONTEND, &input);

    assert_eq!(h.connects.len(), 1);
    let a = h.backend("a.example");
    h.connect_all();

    let blocks = header_blocks(&parse_frames(&h.drain(a)), &mut HeaderDecoder::new());
    let paths: Vec<(u32, Option<&str>)> = blocks
        .iter()
        .map(|(stream, list)| (*stream, value(list, ":path")))
        .collect();
    assert_eq!(paths, vec![(1, Some("/first")), (3, Some("/second"))]);

    let mut server = HeaderEncoder::literal_only();
    let mut reply = settings();
    reply.extend(headers_frame(&mut server, 3, &status("200"), false));
    reply.extend(data_frame(3, b"second", true));
    reply.extend(headers_frame(&mut server, 1, &status("200"), false));
    reply.extend(data_frame(1, b"first", true));
    h.receive(a, &reply);

    let frames = parse_frames(&h.drain(ConnId::FRONTEND));
    let data = data_by_stream(&frames);
    assert_eq!(data[&1], b"first");
    assert_eq!(data[&5], b"second");
    assert!(!data.contains_key(&3));
}

#[test]
fn push_promise_gets_a_fresh_client_stream() {
    let connector = HostConnector::default().with("a.example", "10.0.1.1:8080");
    let mut h = Harness::new(H2Processor::default(), connector);
    let mut client = HeaderEncoder::literal_only();

    let mut input = client_preface();
    input.extend(headers_frame(&mut client, 1, &request("a.example", "/"), true));
    h.receive(ConnId::FRONTEND, &input);
    let a = h.backend("a.example");
    h.connect_all();
    h.drain(a);

    let mut server = HeaderEncoder::literal_only();
    let mut reply = settings();
    reply.extend(push_promise_frame(&mut server, 1, 4, &request("a.example", "/style.css")));
    reply.extend(headers_frame(&mut server, 1, &status("200"), false));
    reply.extend(headers_frame(&mut server, 4, &status("200"), false));
    reply.extend(data_frame(4, b"body{}", true));
    reply.extend(data_frame(1, b"<html>", true));
    h.receive(a, &reply);

    let frames = parse_frames(&h.drain(ConnId::FRONTEND));
    let promise = frames
        .iter()
        .find_map(|f| match f {
            Frame::PushPromise(p) => Some(p.clone()),
            _ => None,
        })
        .expect("push promise relayed");
    assert_eq!(promise.stream_id, 1);
    assert_eq!(promise.promised_id, 2);

    let blocks = header_blocks(&frames, &mut HeaderDecoder::new());
    assert_eq!(value(&blocks[0].1, ":path"), Some("/style.css"));
    assert!(blocks.iter().any(|(stream, _)| *stream == 2));

    let data = data_by_stream(&frames);
    assert_eq!(data[&2], b"body{}");
    assert_eq!(data[&1], b"<html>");
    assert!(!data.contains_key(&4));
}

#[test]
fn client_half_close_waits_for_every_backend() {
    let connector = HostConnector::default()
        .with("a.example", "10.0.1.1:8080")
        .with("b.example", "10.0.2.1:8080");
    let mut h = Harness::new(H2Processor::default(), connector);
    let mut client = HeaderEncoder::literal_only();

    let mut input = client_preface();
    input.extend(headers_frame(&mut client, 1, &request("a.example", "/upload"), false));
    input.extend(headers_frame(&mut client, 3, &request("b.example", "/upload"), false));
    input.extend(data_frame(1, b"x", true));
    input.extend(data_frame(3, b"y", true));
    h.receive(ConnId::FRONTEND, &input);
    h.remote_closed(ConnId::FRONTEND);
    assert!(h.actions.iter().all(|a| !matches!(a, Action::Close(_))));

    let a = h.backend("a.example");
    let b = h.backend("b.example");
    h.connect_all();
    assert_eq!(data_by_stream(&parse_frames(&h.drain(a)))[&1], b"x");
    assert_eq!(data_by_stream(&parse_frames(&h.drain(b)))[&1], b"y");
    assert_eq!(h.count(&Action::ShutdownWrite(a)), 1);
    assert_eq!(h.count(&Action::ShutdownWrite(b)), 1);

    let mut server = HeaderEncoder::literal_only();
    let mut reply = settings();
    reply.extend(headers_frame(&mut server, 1, &status("200"), false));
    reply.extend(data_frame(1, b"A", true));
    h.receive(a, &reply);
    h.remote_closed(a);
    assert!(!h.engine.is_closed());

    let mut server = HeaderEncoder::literal_only();
    let mut reply = settings();
    reply.extend(headers_frame(&mut server, 1, &status("200"), false));
    reply.extend(data_frame(1, b"B", true));
    h.receive(b, &reply);
    h.remote_closed(b);

    assert_eq!(h.engine.close_reason(), Some(CloseReason::HalfClosed));
    assert_eq!(h.count(&Action::Close(ConnId::FRONTEND)), 1);

    let data = data_by_stream(&parse_frames(&h.drain(ConnId::FRONTEND)));
    assert_eq!(data[&1], b"A");
    assert_eq!(data[&3], b"B");
}

#[test]
fn unknown_host_closes_the_session() {
    let connector = HostConnector::default().with("a.example", "10.0.1.1:8080");
    let mut h = Harness::new(H2Processor::default(), connector);
    let mut client = HeaderEncoder::literal_only();

    let mut input = client_preface();
    input.extend(headers_frame(&mut client, 1, &request("nowhere.example", "/"), true));
    h.receive(ConnId::FRONTEND, &input);

    assert!(h.connects.is_empty());
    assert_eq!(h.engine.close_reason(), Some(CloseReason::BackendUnavailable));
    assert_eq!(h.count(&Action::Close(ConnId::FRONTEND)), 1);
}

#[test]
fn malformed_client_header_blocks_close_the_session() {
    let blocks: [&[u8]; 5] = [
        &[0x3f],
        &[0x3f, 0xe1],
        &[0xff],
        &[0x00, 0x05, b'a'],
        &[0x00, 0x81, 0x00, 0x00],
    ];
    for block in blocks {
        let mut input = client_preface();
        input.extend(encode(headers_with_fragment(1, block, true)));
        let h = client_session(&input);
        assert!(h.connects.is_empty(), "{block:02x?}");
        assert_violation(&h);
    }
}

#[test]
fn malformed_backend_header_block_closes_the_session() {
    let (mut h, a) = open_stream(1);
    h.receive(a, &encode(headers_with_fragment(1, &[0x3f], true)));
    assert_violation(&h);
}

#[test]
fn ping_is_answered_where_it_arrives() {
    let (mut h, a) = open_stream(1);

    let mut input = encode(Frame::Ping {
        ack: false,
        opaque: *b"client-1",
    });
    input.extend(encode(Frame::Ping {
        ack: true,
        opaque: *b"ignored!",
    }));
    h.receive(ConnId::FRONTEND, &input);
    assert_eq!(
        parse_frames(&h.drain(ConnId::FRONTEND)),
        vec![Frame::Ping {
            ack: true,
            opaque: *b"client-1"
        }]
    );
    assert!(h.drain(a).is_empty());

    h.receive(
        a,
        &encode(Frame::Ping {
            ack: false,
            opaque: *b"server-1",
        }),
    );
    assert_eq!(
        parse_frames(&h.drain(a)),
        vec![Frame::Ping {
            ack: true,
            opaque: *b"server-1"
        }]
    );
    assert!(h.drain(ConnId::FRONTEND).is_empty());
}

#[test]
fn rst_stream_follows_the_stream_mapping() {
    let (mut h, a) = open_stream(3);

    h.receive(
        ConnId::FRONTEND,
        &encode(Frame::RstStream {
            stream_id: 3,
            error_code: 8,
        }),
    );
    assert_eq!(
        parse_frames(&h.drain(a)),
        vec![Frame::RstStream {
            stream_id: 1,
            error_code: 8
        }]
    );

    h.receive(
        ConnId::FRONTEND,
        &encode(Frame::RstStream {
            stream_id: 9,
            error_code: 8,
        }),
    );
    assert!(h.drain(a).is_empty());
    assert!(!h.engine.is_closed());

    h.receive(
        a,
        &encode(Frame::RstStream {
            stream_id: 1,
            error_code: 2,
        }),
    );
    assert_eq!(
        parse_frames(&h.drain(ConnId::FRONTEND)),
        vec![Frame::RstStream {
            stream_id: 3,
            error_code: 2
        }]
    );
}

#[test]
fn goaway_follows_the_stream_mapping() {
    let (mut h, a) = open_stream(3);

    h.receive(
        a,
        &encode(Frame::GoAway {
            last_stream_id: 1,
            error_code: 0,
            debug: Bytes::new(),
        }),
    );
    assert_eq!(
        parse_frames(&h.drain(ConnId::FRONTEND)),
        vec![Frame::GoAway {
            last_stream_id: 3,
            error_code: 0,
            debug: Bytes::new()
        }]
    );

    h.receive(
        ConnId::FRONTEND,
        &encode(Frame::GoAway {
            last_stream_id: 0,
            error_code: 0,
            debug: Bytes::new(),
        }),
    );
    assert!(h.drain(a).is_empty());

    h.receive(
        ConnId::FRONTEND,
        &encode(Frame::GoAway {
            last_stream_id: 3,
            error_code: 1,
            debug: Bytes::from_static(b"bye"),
        }),
    );
    assert_eq!(
        parse_frames(&h.drain(a)),
        vec![Frame::GoAway {
            last_stream_id: 1,
            error_code: 1,
            debug: Bytes::from_static(b"bye")
        }]
    );
    assert!(!h.engine.is_closed());
}

#[test]
fn priority_is_dropped() {
    let (mut h, a) = open_stream(3);
    let spec = PrioritySpec {
        dependency: 0,
        exclusive: false,
        weight: 200,
    };
    h.receive(ConnId::FRONTEND, &encode(Frame::Priority { stream_id: 3, spec }));
    h.receive(a, &encode(Frame::Priority { stream_id: 1, spec }));
    assert!(h.drain(a).is_empty());
    assert!(h.drain(ConnId::FRONTEND).is_empty());
    assert!(!h.engine.is_closed());
}

#[test]
fn connect_switches_the_session_to_a_tunnel() {
    let connector = HostConnector::default().with("a.example", "10.0.1.1:8080");
    let mut h = Harness::new(H2Processor::default(), connector);
    let mut client = HeaderEncoder::literal_only();

    let mut input = client_preface();
    let connect = headers(&[(":method", "CONNECT"), (":authority", "a.example")]);
    input.extend(headers_frame(&mut client, 1, &connect, false));
    h.receive(ConnId::FRONTEND, &input);
    let a = h.backend("a.example");
    h.connect_all();
    let blocks = header_blocks(&parse_frames(&h.drain(a)), &mut HeaderDecoder::new());
    assert_eq!(value(&blocks[0].1, ":method"), Some("CONNECT"));
    assert!(!h.engine.context().is_tunnel());

    let mut server = HeaderEncoder::literal_only();
    let mut reply = settings();
    reply.extend(headers_frame(&mut server, 1, &status("200"), false));
    h.receive(a, &reply);
    assert!(h.engine.context().is_tunnel());
    h.drain(a);

    let blocks = header_blocks(&parse_frames(&h.drain(ConnId::FRONTEND)), &mut HeaderDecoder::new());
    assert_eq!(value(&blocks[0].1, ":status"), Some("200"));

    // from here on bytes are relayed without framing
    h.receive(ConnId::FRONTEND, b"\x16\x03\x01 not a frame");
    assert_eq!(h.drain(a), b"\x16\x03\x01 not a frame");
    h.receive(a, b"raw reply");
    assert_eq!(h.drain(ConnId::FRONTEND), b"raw reply");
    assert!(!h.engine.is_closed());
}

#[test]
fn continuation_frames_complete_a_header_block() {
    let block = HeaderEncoder::literal_only().encode(&request("a.example", "/split"));
    let (first, second) = block.split_at(block.len() / 2);

    let mut input = client_preface();
    input.extend(encode(headers_with_fragment(1, first, false)));
    input.extend(encode(Frame::Continuation {
        stream_id: 1,
        end_headers: true,
        fragment: Bytes::copy_from_slice(second),
    }));
    let mut h = client_session(&input);
    let a = h.backend("a.example");
    h.connect_all();

    let blocks = header_blocks(&parse_frames(&h.drain(a)), &mut HeaderDecoder::new());
    assert_eq!(blocks.len(), 1);
    assert_eq!(value(&blocks[0].1, ":path"), Some("/split"));
}

#[test]
fn broken_continuation_sequences_close_the_session() {
    let block = HeaderEncoder::literal_only().encode(&request("a.example", "/"));

    // continuation on another stream
    let mut input = client_preface();
    input.extend(encode(headers_with_fragment(1, &block, false)));
    input.extend(encode(Frame::Continuation {
        stream_id: 3,
        end_headers: true,
        fragment: Bytes::new(),
    }));
    assert_violation(&client_session(&input));

    // another frame inside the block
    let mut input = client_preface();
    input.extend(encode(headers_with_fragment(1, &block, false)));
    input.extend(encode(Frame::Ping {
        ack: false,
        opaque: [0; 8],
    }));
    assert_violation(&client_session(&input));

    // block larger than any frame may carry
    let chunk = vec![0u8; 600_000];
    let mut input = client_preface();
    input.extend(encode(headers_with_fragment(1, &chunk, false)));
    input.extend(encode(Frame::Continuation {
        stream_id: 1,
        end_headers: false,
        fragment: Bytes::from(chunk),
    }));
    assert_violation(&client_session(&input));
}

#[test]
fn data_waits_for_backend_window() {
    let connector = HostConnector::default().with("a.example", "10.0.1.1:8080");
    let mut h = Harness::new(H2Processor::default(), connector);
    let mut client = HeaderEncoder::literal_only();

    let mut input = client_preface();
    input.extend(headers_frame(&mut client, 1, &request("a.example", "/upload"), false));
    h.receive(ConnId::FRONTEND, &input);
    let a = h.backend("a.example");
    h.connect_all();
    h.drain(a);
    h.receive(a, &settings_with(&[(Setting::INITIAL_WINDOW_SIZE, 10)]));
    h.drain(a);

    let body = [b'x'; 25];
    h.receive(ConnId::FRONTEND, &data_frame(1, &body, true));
    let mut relayed = h.drain(a);
    assert_eq!(relayed.len(), HEADER_LEN + 10);
    let header = FrameHeader::parse(&relayed).unwrap();
    assert_eq!((header.stream_id, header.length), (1, 25));
    assert!(!h.engine.wants_read(ConnId::FRONTEND));

    h.receive(
        a,
        &encode(Frame::WindowUpdate {
            stream_id: 1,
            increment: 100,
        }),
    );
    // the resumed client is read on the next tick
    assert!(h.drain(a).is_empty());
    h.tick();
    let rest = h.drain(a);
    assert_eq!(rest.len(), 15);

    relayed.extend(rest);
    assert_eq!(data_by_stream(&parse_frames(&relayed))[&1], body);
    assert!(h.engine.wants_read(ConnId::FRONTEND));
}

#[test]
fn backend_header_blocks_never_use_a_dynamic_table() {
    let connector = HostConnector::default().with("a.example", "10.0.1.1:8080");
    let mut h = Harness::new(H2Processor::default(), connector);
    let mut client = HeaderEncoder::new(DEFAULT_TABLE_SIZE);

    let mut input = client_preface_with(&[(Setting::HEADER_TABLE_SIZE, 65_536)]);
    for (stream_id, path) in [(1, "/one"), (3, "/two")] {
        let mut list = request("a.example", path);
        list.extend(headers(&[("x-trace", "abc123")]));
        input.extend(headers_frame(&mut client, stream_id, &list, true));
    }
    h.receive(ConnId::FRONTEND, &input);
    let a = h.backend("a.example");
    h.connect_all();

    let frames = parse_frames(&h.drain(a));
    let Frame::Settings(handshake) = &frames[0] else {
        panic!("backend handshake must start with SETTINGS");
    };
    assert_eq!(
        handshake.get(Setting::HEADER_TABLE_SIZE),
        Some(DEFAULT_TABLE_SIZE as u32)
    );
    // each block decodes on its own: nothing refers to a dynamic table
    let mut decoded = 0;
    for frame in &frames[1..] {
        for (_, list) in header_blocks(std::slice::from_ref(frame), &mut HeaderDecoder::new()) {
            assert_eq!(value(&list, "x-trace"), Some("abc123"));
            decoded += 1;
        }
    }
    assert_eq!(decoded, 2);

    let mut server = HeaderEncoder::new(DEFAULT_TABLE_SIZE);
    let response = headers(&[(":status", "200"), ("x-served-by", "alpha")]);
    let mut reply = settings();
    reply.extend(headers_frame(&mut server, 1, &response, true));
    reply.extend(headers_frame(&mut server, 3, &response, true));
    h.receive(a, &reply);

    let ctx = h.engine.context();
    assert_eq!(ctx.frontend_encoder().table_len(), 1);
    assert_eq!(ctx.frontend_encoder().max_table_size(), DEFAULT_TABLE_SIZE);
    assert_eq!(ctx.backend_encoder().table_size(), 0);
    assert_eq!(ctx.backend_encoder().max_table_size(), 0);

    let blocks = header_blocks(&parse_frames(&h.drain(ConnId::FRONTEND)), &mut HeaderDecoder::new());
    assert_eq!(blocks.len(), 2);
    for (_, list) in &blocks {
        assert_eq!(value(list, "x-served-by"), Some("alpha"));
    }
}
