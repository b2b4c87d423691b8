//! End-to-end scenarios for the message plane, driven on the host with
//! scripted controller ports and a scripted guest.

mod common;

use core::sync::atomic::Ordering;

use common::{
    leak_system, GuestBehavior, ScriptRuntime, ScriptRx, ScriptTx, SignalPin,
};
use embassy_futures::block_on;
use embedded_can::Frame as _;
use embassy_futures::join::join;

use tconnector::arbiter::ArbiterTimedOut;
use tconnector::codec::{unpack_id, FrameCodec, LoweredFrames, SingleFrameCodec};
use tconnector::config::BROADCAST_ADDRESS;
use tconnector::controller::ControllerConfig;
use tconnector::frame::CanFrame;
use tconnector::guest::GuestHost;
use tconnector::message::NmeaMessage;
use tconnector::mode::{Mode, ModeSupervisor};
use tconnector::rx::RxWorker;
use tconnector::tx::TxWorker;

fn frame_for(msg: &NmeaMessage) -> CanFrame {
    let mut codec = SingleFrameCodec::new();
    let mut frames = LoweredFrames::new();
    codec
        .lower(msg, BROADCAST_ADDRESS, 0, &mut frames)
        .expect("single-frame message");
    frames[0]
}

#[test]
fn s1_passive_forward_crosses_controllers() {
    let system = leak_system();
    let inbound = NmeaMessage::new(0, 6, 129025, 2, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

    let mut rx_worker = RxWorker::new(
        ScriptRx::new([frame_for(&inbound)]),
        SingleFrameCodec::new(),
        0,
        ControllerConfig::default(),
        &system.rx_queue,
        &system.stats.controllers[0],
        &system.stats.heartbeats.rx[0],
    );
    let mut runtime = ScriptRuntime::new([GuestBehavior::ForwardTo(1)]);
    let log = runtime.log();

    block_on(async {
        rx_worker.open().await;
        rx_worker.step().await;
        assert_eq!(system.rx_queue.depth(), 1);
        assert_eq!(system.stats.controllers[0].received.load(Ordering::Relaxed), 1);

        let mut guest = GuestHost::start(
            &mut runtime,
            &[],
            system.host_env(),
            &system.rx_queue,
            &system.mode,
            &system.stats.guest,
            &system.stats.heartbeats.guest,
        )
        .unwrap();
        guest.step().await;
        assert_eq!(system.tx_queues[1].depth(), 1);
        assert_eq!(log.borrow().send_results, vec![1]);

        let (tx_link, wire) = ScriptTx::new();
        let mut tx_worker = TxWorker::new(
            tx_link,
            SingleFrameCodec::new(),
            1,
            &system.tx_queues[1],
            &system.stats.controllers[1],
            &system.stats.heartbeats.tx[1],
        );
        tx_worker.step().await;

        assert_eq!(system.stats.controllers[1].sent.load(Ordering::Relaxed), 1);
        let wire = wire.borrow();
        assert_eq!(wire.len(), 1);
        let parts = unpack_id(wire[0].raw_id());
        assert_eq!(parts.pgn, 129025);
        assert_eq!(parts.priority, 6);
        assert_eq!(parts.source, 2);
        assert_eq!(wire[0].data(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    });
}

#[test]
fn s2_backpressure_rejects_at_the_edge() {
    let system = leak_system();
    let env = system.host_env();
    let payload = [0x42u8; 8];

    for _ in 0..100 {
        assert_eq!(env.send_msg(0, 6, 129025, 2, &payload), 1);
    }
    assert_eq!(system.tx_queues[0].depth(), 100);

    // 101st send: the queue never drains, so the bounded push times out.
    assert_eq!(env.send_msg(0, 6, 129025, 2, &payload), 0);
    assert_eq!(system.stats.guest.rejected_sends.load(Ordering::Relaxed), 1);
    assert_eq!(system.stats.guest.accepted_sends.load(Ordering::Relaxed), 100);
    assert_eq!(system.tx_queues[0].depth(), 100);
}

#[test]
fn s3_self_echo_never_reaches_the_guest() {
    let system = leak_system();
    let echo = NmeaMessage::new(0, 6, 129025, 14, &[9]).unwrap();
    let mut rx_worker = RxWorker::new(
        ScriptRx::new([frame_for(&echo)]),
        SingleFrameCodec::new(),
        0,
        ControllerConfig::default(),
        &system.rx_queue,
        &system.stats.controllers[0],
        &system.stats.heartbeats.rx[0],
    );
    block_on(async {
        rx_worker.open().await;
        rx_worker.step().await;
    });
    assert_eq!(system.rx_queue.depth(), 0);
    assert_eq!(system.stats.controllers[0].received.load(Ordering::Relaxed), 0);
    assert_eq!(system.stats.controllers[0].rx_dropped.load(Ordering::Relaxed), 0);
}

#[test]
fn s4_idle_workers_keep_their_heartbeats() {
    let system = leak_system();
    let mut rx_worker = RxWorker::new(
        ScriptRx::new([]),
        SingleFrameCodec::new(),
        1,
        ControllerConfig::default(),
        &system.rx_queue,
        &system.stats.controllers[1],
        &system.stats.heartbeats.rx[1],
    );
    let (tx_link, _wire) = ScriptTx::new();
    let mut tx_worker = TxWorker::new(
        tx_link,
        SingleFrameCodec::new(),
        2,
        &system.tx_queues[2],
        &system.stats.controllers[2],
        &system.stats.heartbeats.tx[2],
    );
    block_on(async {
        rx_worker.open().await;
        join(
            async {
                for _ in 0..3 {
                    rx_worker.step().await;
                }
            },
            async {
                for _ in 0..3 {
                    tx_worker.step().await;
                }
            },
        )
        .await;
    });
    assert!(system.stats.heartbeats.rx[1].count() >= 3);
    assert!(system.stats.heartbeats.tx[2].count() >= 3);
}

#[test]
fn s5_mode_change_reaches_the_next_activation() {
    let system = leak_system();
    let msb = SignalPin::new(false);
    let lsb = SignalPin::new(false);
    let mut supervisor = ModeSupervisor::new(
        msb.clone(),
        lsb.clone(),
        &system.mode,
        &system.stats.heartbeats.mode,
    );

    let mut runtime = ScriptRuntime::new([GuestBehavior::Nop]);
    let log = runtime.log();

    block_on(async {
        // (MSB, LSB) = (1, 0)
        msb.drive(true);
        supervisor.step().await;
        assert_eq!(system.mode.get(), Mode::AttackA);

        system
            .rx_queue
            .push_back(
                NmeaMessage::new(0, 6, 129025, 2, &[1]).unwrap(),
                tconnector::config::PUSH_TIMEOUT,
            )
            .await
            .unwrap();
        let mut guest = GuestHost::start(
            &mut runtime,
            &[],
            system.host_env(),
            &system.rx_queue,
            &system.mode,
            &system.stats.guest,
            &system.stats.heartbeats.guest,
        )
        .unwrap();
        guest.step().await;
    });
    assert_eq!(log.borrow().modes, vec![b'2']);
}

#[test]
fn s6_guest_trap_is_not_fatal() {
    let system = leak_system();
    let mut runtime = ScriptRuntime::new([GuestBehavior::Trap, GuestBehavior::ForwardTo(1)]);
    let log = runtime.log();

    block_on(async {
        for byte in [1u8, 2] {
            system
                .rx_queue
                .push_back(
                    NmeaMessage::new(0, 6, 129025, 2, &[byte]).unwrap(),
                    tconnector::config::PUSH_TIMEOUT,
                )
                .await
                .unwrap();
        }
        let mut guest = GuestHost::start(
            &mut runtime,
            &[],
            system.host_env(),
            &system.rx_queue,
            &system.mode,
            &system.stats.guest,
            &system.stats.heartbeats.guest,
        )
        .unwrap();
        guest.step().await;
        assert_eq!(system.stats.guest.traps.load(Ordering::Relaxed), 1);
        // Same instance, next activation runs normally.
        guest.step().await;
    });
    assert_eq!(system.stats.guest.activations.load(Ordering::Relaxed), 2);
    assert_eq!(system.tx_queues[1].depth(), 1);
    assert_eq!(log.borrow().activations, 2);
}

#[test]
fn fifo_holds_per_tx_queue() {
    let system = leak_system();
    let env = system.host_env();
    assert_eq!(env.send_msg(0, 6, 129025, 2, &[1]), 1);
    assert_eq!(env.send_msg(0, 6, 129025, 2, &[2]), 1);

    let (tx_link, wire) = ScriptTx::new();
    let mut tx_worker = TxWorker::new(
        tx_link,
        SingleFrameCodec::new(),
        0,
        &system.tx_queues[0],
        &system.stats.controllers[0],
        &system.stats.heartbeats.tx[0],
    );
    block_on(async {
        tx_worker.step().await;
        tx_worker.step().await;
    });
    let wire = wire.borrow();
    assert_eq!(wire.len(), 2);
    assert_eq!(wire[0].data(), &[1]);
    assert_eq!(wire[1].data(), &[2]);
}

#[test]
fn tx_arbiter_miss_requeues_the_message_once() {
    let system = leak_system();
    let env = system.host_env();
    assert_eq!(env.send_msg(0, 6, 129025, 2, &[7]), 1);

    let (tx_link, wire) = ScriptTx::with_outcomes([Err(ArbiterTimedOut)]);
    let mut tx_worker = TxWorker::new(
        tx_link,
        SingleFrameCodec::new(),
        0,
        &system.tx_queues[0],
        &system.stats.controllers[0],
        &system.stats.heartbeats.tx[0],
    );
    block_on(async {
        tx_worker.step().await;
        let counters = &system.stats.controllers[0];
        assert_eq!(counters.tx_arbiter_missed.load(Ordering::Relaxed), 1);
        assert_eq!(counters.sent.load(Ordering::Relaxed), 0);
        assert_eq!(system.tx_queues[0].depth(), 1);

        tx_worker.step().await;
        assert_eq!(counters.sent.load(Ordering::Relaxed), 1);
        assert_eq!(system.tx_queues[0].depth(), 0);
    });
    assert_eq!(wire.borrow().len(), 1);
}

#[test]
fn rx_drop_accounting_balances() {
    let system = leak_system();
    let frames: Vec<CanFrame> = (0..105u8)
        .map(|index| frame_for(&NmeaMessage::new(0, 6, 129025, 2, &[index]).unwrap()))
        .collect();
    let mut rx_worker = RxWorker::new(
        ScriptRx::new(frames),
        SingleFrameCodec::new(),
        0,
        ControllerConfig::default(),
        &system.rx_queue,
        &system.stats.controllers[0],
        &system.stats.heartbeats.rx[0],
    );
    block_on(async {
        rx_worker.open().await;
        // 105 frames at up to 16 per quantum
        for _ in 0..7 {
            rx_worker.step().await;
        }
    });
    let counters = &system.stats.controllers[0];
    let received = counters.received.load(Ordering::Relaxed);
    let dropped = counters.rx_dropped.load(Ordering::Relaxed);
    assert_eq!(received, 105);
    assert_eq!(system.rx_queue.depth(), 100);
    assert_eq!(dropped, 5);
    assert_eq!(received, system.rx_queue.depth() as u32 + dropped);
}

#[test]
fn open_failure_kills_only_that_pair() {
    let system = leak_system();
    let mut rx_worker = RxWorker::new(
        ScriptRx::broken(),
        SingleFrameCodec::new(),
        2,
        ControllerConfig::default(),
        &system.rx_queue,
        &system.stats.controllers[2],
        &system.stats.heartbeats.rx[2],
    );
    let (tx_link, wire) = ScriptTx::new();
    let mut tx_worker = TxWorker::new(
        tx_link,
        SingleFrameCodec::new(),
        2,
        &system.tx_queues[2],
        &system.stats.controllers[2],
        &system.stats.heartbeats.tx[2],
    );
    block_on(async {
        rx_worker.open().await;
        assert!(system.stats.controllers[2].is_dead());
        rx_worker.step().await;
        tx_worker.step().await;
    });
    // Both workers idled but stayed live; nothing moved.
    assert!(system.stats.heartbeats.rx[2].count() >= 1);
    assert!(system.stats.heartbeats.tx[2].count() >= 1);
    assert_eq!(system.rx_queue.depth(), 0);
    assert!(wire.borrow().is_empty());
    // The other controllers are untouched.
    assert!(!system.stats.controllers[0].is_dead());
}

#[test]
fn send_msg_validates_its_inputs() {
    let system = leak_system();
    let env = system.host_env();

    assert_eq!(env.send_msg(3, 6, 129025, 2, &[1]), 0);
    assert_eq!(env.send_msg(-1, 6, 129025, 2, &[1]), 0);
    assert_eq!(env.send_msg(0, 6, -5, 2, &[1]), 0);
    assert_eq!(env.send_msg(0, 6, 0x40000, 2, &[1]), 0);
    let oversize = [0u8; 224];
    assert_eq!(env.send_msg(0, 6, 129025, 2, &oversize), 0);

    assert_eq!(system.stats.guest.rejected_sends.load(Ordering::Relaxed), 5);
    assert_eq!(system.stats.guest.accepted_sends.load(Ordering::Relaxed), 0);
    for queue in &system.tx_queues {
        assert_eq!(queue.depth(), 0);
    }
}
