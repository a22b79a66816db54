//! Behaviour every codec must share: chunk-boundary invariance, exact frame
//! consumption and error replies that correlate with the request.

use bytes::{BufMut, BytesMut};
use codec::{
    AppError, CodecKind, DecodeStatus, ErrorType, Metadata, MessageType, ResponseStatus, frames,
};
use proptest::prelude::*;

fn sample_request(kind: CodecKind, request_id: u64) -> BytesMut {
    match kind {
        CodecKind::Brpc => frames::brpc::request(request_id, "EchoService", "Echo", b"payload-bytes"),
        CodecKind::Trpc => frames::trpc::unary_request(
            request_id as u32,
            "trpc.test.echo",
            "/trpc.test.echo/Echo",
            b"payload-bytes",
        ),
        CodecKind::Dubbo => frames::dubbo::request(request_id, "com.example.Echo", "echo"),
    }
}

/// Feeds `bytes` to a fresh codec in the given chunk sizes and collects every
/// decoded message.
fn decode_in_chunks(kind: CodecKind, bytes: &[u8], chunks: &[usize]) -> Vec<Metadata> {
    let mut codec = kind.new_codec();
    let mut buffer = BytesMut::new();
    let mut decoded = Vec::new();
    let mut metadata = Metadata::new(MessageType::Request);
    let mut offset = 0;
    let mut sizes = chunks.iter().copied().cycle();
    while offset < bytes.len() {
        let size = sizes.next().unwrap_or(1).max(1);
        let end = (offset + size).min(bytes.len());
        buffer.extend_from_slice(&bytes[offset..end]);
        offset = end;
        loop {
            match codec.decode(&mut buffer, &mut metadata).unwrap() {
                DecodeStatus::Done => {
                    decoded.push(std::mem::replace(
                        &mut metadata,
                        Metadata::new(MessageType::Request),
                    ));
                    if buffer.is_empty() {
                        break;
                    }
                }
                DecodeStatus::WaitForData => break,
            }
        }
    }
    assert!(buffer.is_empty(), "no trailing bytes after the last frame");
    decoded
}

#[test]
fn brpc_header_then_body_scenario() {
    // 8 bytes of meta: correlation_id=5, compress_type=0, attachment_size=0, correlation_id=5.
    let meta = [0x20, 0x05, 0x18, 0x00, 0x28, 0x00, 0x20, 0x05];
    let body = [0xAAu8; 12];
    let mut frame = BytesMut::new();
    frame.put_slice(b"PRPC");
    frame.put_u32(20);
    frame.put_u32(8);
    frame.put_slice(&meta);
    frame.put_slice(&body);
    assert_eq!(frame.len(), 32);

    let mut codec = CodecKind::Brpc.new_codec();
    let mut metadata = Metadata::new(MessageType::Request);
    let mut buffer = BytesMut::from(&frame[..12]);
    assert_eq!(
        codec.decode(&mut buffer, &mut metadata).unwrap(),
        DecodeStatus::WaitForData
    );
    assert_eq!(buffer.len(), 12);

    buffer.extend_from_slice(&frame[12..]);
    assert_eq!(
        codec.decode(&mut buffer, &mut metadata).unwrap(),
        DecodeStatus::Done
    );
    assert_eq!(metadata.origin_message().len(), 32);
    assert_eq!(metadata.request_id(), 5);
    assert!(buffer.is_empty());
}

#[test]
fn every_error_type_round_trips_for_every_codec() {
    for kind in CodecKind::ALL {
        for error in ErrorType::ALL {
            let mut request_bytes = sample_request(kind, 4242);
            let mut request = Metadata::new(MessageType::Request);
            let mut codec = kind.new_codec();
            assert_eq!(
                codec.decode(&mut request_bytes, &mut request).unwrap(),
                DecodeStatus::Done
            );

            let mut reply = BytesMut::new();
            codec
                .on_error(&request, &AppError::new(error, "generated locally"), &mut reply)
                .unwrap();

            let mut response = Metadata::new(MessageType::Response);
            let mut response_codec = kind.new_codec();
            let status = response_codec.decode(&mut reply, &mut response).unwrap();
            assert_eq!(status, DecodeStatus::Done, "{kind} {error}");
            assert!(reply.is_empty(), "{kind} {error}: reply fully consumed");
            assert_eq!(
                response.response_status(),
                ResponseStatus::Error,
                "{kind} {error}"
            );
            assert_eq!(response.request_id(), 4242, "{kind} {error}");
        }
    }
}

#[test]
fn decoded_size_matches_declared_frame_size() {
    for kind in CodecKind::ALL {
        let frame = sample_request(kind, 9);
        let decoded = decode_in_chunks(kind, &frame, &[frame.len()]);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].origin_message().len(), frame.len());
        assert_eq!(decoded[0].message_size(), frame.len());
        assert_eq!(&decoded[0].origin_message()[..], &frame[..]);
    }
}

fn codec_kind() -> impl Strategy<Value = CodecKind> {
    prop_oneof![
        Just(CodecKind::Brpc),
        Just(CodecKind::Trpc),
        Just(CodecKind::Dubbo),
    ]
}

proptest! {
    #[test]
    fn chunk_boundaries_do_not_change_the_result(
        kind in codec_kind(),
        ids in prop::collection::vec(1u64..u64::from(u32::MAX), 1..5),
        chunks in prop::collection::vec(1usize..40, 1..8),
    ) {
        let mut stream = BytesMut::new();
        for id in &ids {
            stream.extend_from_slice(&sample_request(kind, *id));
        }

        let whole = decode_in_chunks(kind, &stream, &[stream.len()]);
        let chunked = decode_in_chunks(kind, &stream, &chunks);

        prop_assert_eq!(whole.len(), ids.len());
        prop_assert_eq!(chunked.len(), ids.len());
        for ((a, b), id) in whole.iter().zip(&chunked).zip(&ids) {
            prop_assert_eq!(a.request_id(), *id);
            prop_assert_eq!(b.request_id(), *id);
            prop_assert_eq!(a.message_type(), b.message_type());
            prop_assert_eq!(&a.origin_message()[..], &b.origin_message()[..]);
            prop_assert_eq!(a.headers(), b.headers());
        }
    }
}
