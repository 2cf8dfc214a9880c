//! End-to-end tests: a `Session` talking to the in-process emulator.

use std::time::Duration;

use desklink::emulator::{CrcPlacement, DeviceEmulator, Fault, TaskScript};
use desklink::error::{Direction, IntegrityFailure, TimeoutStage};
use desklink::protocol::{
    build_frame, decode_header, Endpoint, FrameBuffer, Method, Status, HEADER_SIZE,
};
use desklink::transfer::wire::EntryKind;
use desklink::{LinkError, PollPolicy, Session, SessionBuilder, TaskHandle, TaskOutcome};
use proptest::prelude::*;
use serde_json::json;
use tokio::io::DuplexStream;
use tokio::time::Instant;

fn session(emulator: &DeviceEmulator) -> Session<DuplexStream> {
    SessionBuilder::new()
        .transaction_timeout(Duration::from_secs(1))
        .chunk_timeout(Duration::from_secs(1))
        .attach(emulator.connect())
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

#[test]
fn test_header_for_small_object() {
    let payload = br#"{"abc":1}"#;
    let frame = build_frame(payload).unwrap();

    assert_eq!(&frame[..HEADER_SIZE], b"#000000009");
    assert_eq!(&frame[HEADER_SIZE..], payload);
}

#[tokio::test]
async fn test_download_requests_chunks_in_order() {
    let data = pattern(2500);
    let emulator = DeviceEmulator::builder()
        .chunk_size(1000)
        .file("/sys/user/logs.txt", data.clone())
        .build();
    let mut session = session(&emulator);

    let download = session.download("/sys/user/logs.txt").await.unwrap();
    assert_eq!(download.session.total_chunks, 3);
    assert_eq!(download.data, data);
    assert!(download.verified);

    let chunk_numbers: Vec<u64> = emulator
        .journal()
        .iter()
        .filter_map(|r| r.body.get("chunkNo").and_then(|n| n.as_u64()))
        .collect();
    assert_eq!(chunk_numbers, vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_task_finishes_after_two_sleeps() {
    let emulator = DeviceEmulator::builder()
        .task(Endpoint::BACKUP, "b-1", TaskScript::new().running(2).finished())
        .build();
    let mut session = SessionBuilder::new()
        .poll_policy(PollPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(10),
        ))
        .attach(emulator.connect());

    let begin = Instant::now();
    let outcome = session
        .wait_for_task(&TaskHandle::new(Endpoint::BACKUP, "b-1"))
        .await
        .unwrap();

    assert!(outcome.is_finished());
    assert_eq!(begin.elapsed(), Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_task_running_past_deadline_times_out() {
    let emulator = DeviceEmulator::builder()
        .task(Endpoint::RESTORE, "r-1", TaskScript::new().running(100))
        .build();
    let mut session = SessionBuilder::new()
        .poll_policy(PollPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(5),
        ))
        .attach(emulator.connect());

    let outcome = session
        .wait_for_task(&TaskHandle::new(Endpoint::RESTORE, "r-1"))
        .await
        .unwrap();

    match outcome {
        TaskOutcome::TimedOut { elapsed, .. } => assert!(elapsed >= Duration::from_secs(5)),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_foreign_rx_id_is_rejected() {
    let emulator = DeviceEmulator::builder()
        .chunk_size(1000)
        .file("/sys/user/logs.txt", pattern(2500))
        .build();
    let mut session = session(&emulator);
    let mut transfer = session.transfer();

    let grant = transfer.open_download("/sys/user/logs.txt").await.unwrap();
    let err = transfer.fetch_chunk(grant.id - 1, 1).await.unwrap_err();

    assert_eq!(err.status(), Some(Status::BAD_REQUEST));
    assert!(matches!(err, LinkError::Status { .. }));
}

#[tokio::test]
async fn test_corrupt_chunk_fails_checksum() {
    let emulator = DeviceEmulator::builder()
        .chunk_size(100)
        .crc_placement(CrcPlacement::FileInfo)
        .file("/f.bin", pattern(450))
        .fault(Fault::CorruptChunk { chunk_no: 3 })
        .build();
    let mut session = session(&emulator);

    let err = session.download("/f.bin").await.unwrap_err();
    assert!(matches!(
        err,
        LinkError::Integrity(IntegrityFailure::Checksum { .. })
    ));
}

#[tokio::test]
async fn test_upload_then_download() {
    let data = pattern(30_000);
    let emulator = DeviceEmulator::builder().chunk_size(4096).build();
    let mut session = session(&emulator);

    let upload = session.upload("/sys/user/tone.bin", &data).await.unwrap();
    assert_eq!(upload.session.total_chunks, 8);
    assert_eq!(emulator.file("/sys/user/tone.bin"), Some(data.clone()));

    let download = session.download("/sys/user/tone.bin").await.unwrap();
    assert_eq!(download.data, data);
    assert_eq!(download.checksum, upload.checksum);

    session.remove_file("/sys/user/tone.bin").await.unwrap();
    assert!(emulator.file("/sys/user/tone.bin").is_none());
    let err = session.remove_file("/sys/user/tone.bin").await.unwrap_err();
    assert_eq!(err.status(), Some(Status::NOT_FOUND));
}

#[tokio::test]
async fn test_mismatched_uuid_surfaces_correlation_error() {
    let emulator = DeviceEmulator::builder()
        .fault(Fault::MismatchedUuid { request: 1 })
        .build();
    let mut session = session(&emulator);

    let err = session
        .request(Endpoint::DEVICE_INFO, Method::Get, &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::CorrelationMismatch { .. }));

    // The session is still usable for the next request.
    let response = session
        .request(Endpoint::DEVICE_INFO, Method::Get, &json!({}))
        .await
        .unwrap();
    assert_eq!(response.status, Status::OK);
}

#[tokio::test]
async fn test_garbage_header() {
    let emulator = DeviceEmulator::builder()
        .fault(Fault::GarbageHeader { request: 1 })
        .build();
    let mut session = session(&emulator);

    let err = session
        .request(Endpoint::DEVICE_INFO, Method::Get, &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, LinkError::MalformedHeader(_)));
    assert!(err.is_fatal_to_session());

    // The device keeps answering, but the stream position is gone.
    for _ in 0..3 {
        let err = session
            .request(Endpoint::DEVICE_INFO, Method::Get, &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Desynchronized));
    }
}

#[tokio::test(start_paused = true)]
async fn test_late_answer_is_skipped_by_following_requests() {
    let data = pattern(700);
    let emulator = DeviceEmulator::builder()
        .chunk_size(256)
        .file("/sys/user/notes/a.txt", data.clone())
        .fault(Fault::Late { request: 1 })
        .build();
    let mut session = session(&emulator);

    let err = session
        .request(Endpoint::DEVICE_INFO, Method::Get, &json!({}))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LinkError::Timeout {
            stage: TimeoutStage::Header,
            ..
        }
    ));
    assert!(!err.is_fatal_to_session());

    // The first answer arrives in front of the second one and is dropped.
    let info = session
        .request(Endpoint::DEVICE_INFO, Method::Get, &json!({}))
        .await
        .unwrap();
    assert_eq!(info.status, Status::OK);

    let entries = session.list_dir("/sys/user/notes").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, EntryKind::RegularFile);
    assert_eq!(entries[0].file_size, 700);

    let download = session.download("/sys/user/notes/a.txt").await.unwrap();
    assert_eq!(download.data, data);
    assert_eq!(emulator.journal().len(), 7);
}

#[tokio::test]
async fn test_hangup_mid_download() {
    let emulator = DeviceEmulator::builder()
        .chunk_size(100)
        .file("/f.bin", pattern(300))
        .fault(Fault::Hangup { request: 3 })
        .build();
    let mut session = session(&emulator);

    let err = session.download("/f.bin").await.unwrap_err();
    match err {
        LinkError::Chunk {
            direction,
            chunk_no,
            total_chunks,
            source,
        } => {
            assert_eq!(direction, Direction::Download);
            assert_eq!(chunk_no, 2);
            assert_eq!(total_chunks, 3);
            assert!(matches!(*source, LinkError::Disconnected));
        }
        other => panic!("expected chunk failure, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_backup_task_with_see_other() {
    let emulator = DeviceEmulator::builder()
        .task_template(
            Endpoint::BACKUP,
            TaskScript::new()
                .running(1)
                .finished()
                .finished_status(Status::SEE_OTHER),
        )
        .build();
    let mut session = SessionBuilder::new()
        .poll_policy(PollPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(10),
        ))
        .attach(emulator.connect());

    let (task, outcome) = session.run_task(Endpoint::BACKUP, &json!({})).await.unwrap();
    assert_eq!(task.endpoint, Endpoint::BACKUP);
    assert!(outcome.is_finished());
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let first = DeviceEmulator::builder().file("/a", pattern(10)).build();
    let second = DeviceEmulator::builder().file("/b", pattern(20)).build();
    let mut a = session(&first);
    let mut b = session(&second);

    let (da, db) = tokio::join!(a.download("/a"), b.download("/b"));
    assert_eq!(da.unwrap().data.len(), 10);
    assert_eq!(db.unwrap().data.len(), 20);
}

proptest! {
    #[test]
    fn frame_roundtrip(payload in proptest::collection::vec(any::<u8>(), 0..4096), split in any::<prop::sample::Index>()) {
        let bytes = build_frame(&payload).unwrap();
        prop_assert_eq!(decode_header(&bytes[..HEADER_SIZE]).unwrap(), payload.len());

        let at = split.index(bytes.len() + 1);
        let mut buffer = FrameBuffer::new();
        let mut frames = buffer.push(&bytes[..at]).unwrap();
        frames.extend(buffer.push(&bytes[at..]).unwrap());

        prop_assert_eq!(frames.len(), 1);
        prop_assert_eq!(frames[0].payload(), &payload[..]);
        prop_assert!(buffer.is_empty());
    }
}
