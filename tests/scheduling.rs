//! Send scheduling: urgent preemption and round-robin fairness, observed on
//! the wire by a raw peer.

mod common;

use blip::transport::{InProcTransport, Transport, TransportRx};
use blip::{Connection, ConnectionConfig, MessageBuilder};
use common::{channel_delegate, parse_frame, RawFrame};
use rstest::rstest;

const MAX_FRAME: usize = 1024;

async fn read_frames_until_done(
    rx: &mut impl TransportRx,
    mut done: impl FnMut(&[RawFrame]) -> bool,
) -> Vec<RawFrame> {
    let mut frames = Vec::new();
    loop {
        let frame = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("frame within the deadline")
            .unwrap()
            .expect("open transport");
        frames.push(parse_frame(frame));
        if done(&frames) {
            return frames;
        }
    }
}

#[rstest]
#[tokio::test]
async fn urgent_messages_preempt_at_frame_boundaries() {
    let (a, b) = InProcTransport::pair(MAX_FRAME);
    let (a_delegate, _a_events) = channel_delegate();
    let (a_handle, _a_task) = Connection::spawn(a, a_delegate, ConnectionConfig::default());
    let (_b_tx, mut b_rx) = b.split();

    let mut big = MessageBuilder::new();
    big.no_reply(true);
    big.write(&vec![0x11u8; 100 * MAX_FRAME]);
    a_handle.send(big).unwrap();

    // Let the big message get under way before the urgent one shows up.
    let mut frames = read_frames_until_done(&mut b_rx, |frames| frames.len() == 2).await;
    assert!(frames.iter().all(|frame| frame.number == 1));

    let mut urgent = MessageBuilder::new();
    urgent.urgent(true).no_reply(true);
    urgent.write(b"out of band");
    a_handle.send(urgent).unwrap();

    frames.extend(
        read_frames_until_done(&mut b_rx, |frames| {
            frames
                .last()
                .is_some_and(|frame| frame.number == 1 && !frame.more_coming())
        })
        .await,
    );

    let urgent_at = frames
        .iter()
        .position(|frame| frame.number == 2)
        .expect("urgent frame on the wire");
    assert!(
        urgent_at < frames.len() - 1,
        "urgent frame must land before the big message finishes"
    );
    assert!(!frames[urgent_at].more_coming(), "small message is one frame");
    // The preempted message resumes and completes afterwards.
    assert!(frames[urgent_at + 1..].iter().all(|frame| frame.number == 1));
}

#[rstest]
#[tokio::test]
async fn equal_priority_messages_round_robin_per_frame() {
    let (a, b) = InProcTransport::pair(MAX_FRAME);
    let (a_delegate, _a_events) = channel_delegate();
    let (connection, a_handle) = Connection::new(a, a_delegate, ConnectionConfig::default());
    let (_b_tx, mut b_rx) = b.split();

    // Queue both before the actor starts so they contend from frame one.
    for _ in 0..2 {
        let mut message = MessageBuilder::new();
        message.no_reply(true);
        message.write(&vec![0x22u8; 4 * MAX_FRAME]);
        a_handle.send(message).unwrap();
    }
    let _a_task = tokio::spawn(connection.run());

    let frames = read_frames_until_done(&mut b_rx, |frames| frames.len() == 6).await;
    let numbers: Vec<u64> = frames.iter().map(|frame| frame.number).collect();
    assert_eq!(
        numbers,
        vec![1, 2, 1, 2, 1, 2],
        "every window of two frames covers both messages"
    );
}
