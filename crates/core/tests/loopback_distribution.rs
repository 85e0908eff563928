use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use statesync_core::transport::LoopbackTransport;
use statesync_core::{
    DistributionConfig, Domain, DomainContext, StatePayload, StateReceiveDomain, StateSendDomain,
    Transport, TransportKind, Vec3, STATE_TOPIC,
};

const PORT: u16 = 10100;

fn config() -> DistributionConfig {
    DistributionConfig::sender_defaults().with_transport(TransportKind::Loopback)
}

struct Link {
    transport: LoopbackTransport,
    sender: StateSendDomain<Vec3>,
    receiver: StateReceiveDomain<Vec3>,
}

fn link() -> Link {
    let transport = LoopbackTransport::new();
    let root = DomainContext::new("app");

    let mut receiver = StateReceiveDomain::<Vec3>::with_transport(Arc::new(transport.clone()));
    receiver.configure(PORT, "0.0.0.0", 1400).unwrap();
    receiver.initialize(Some(&root)).unwrap();

    let mut sender = StateSendDomain::<Vec3>::with_transport(Arc::new(transport.clone()));
    sender.configure_with(config()).unwrap();
    sender.initialize(Some(&root)).unwrap();

    Link {
        transport,
        sender,
        receiver,
    }
}

#[test]
fn end_to_end_single_update() {
    let mut link = link();
    link.sender
        .state()
        .unwrap()
        .replace(Vec3::new(1.0, 2.0, 3.0))
        .unwrap();

    link.sender.tick().unwrap();
    link.receiver.tick().unwrap();

    assert_eq!(*link.receiver.lock_state().unwrap(), Vec3::new(1.0, 2.0, 3.0));
    assert_eq!(link.receiver.new_states(), 1);

    link.receiver.tick().unwrap();
    assert_eq!(link.receiver.new_states(), 0);
    assert_eq!(*link.receiver.lock_state().unwrap(), Vec3::new(1.0, 2.0, 3.0));
}

#[test]
fn latest_send_wins_across_a_sequence() {
    let mut link = link();
    let outgoing = link.sender.state().unwrap();
    let incoming = link.receiver.state().unwrap();

    for step in 1..=5 {
        let value = Vec3::new(step as f64, 0.0, -(step as f64));
        outgoing.replace(value).unwrap();
        link.sender.tick().unwrap();
        link.receiver.tick().unwrap();
        assert_eq!(incoming.snapshot().unwrap(), value);
        assert_eq!(incoming.new_states(), 1);
    }
}

#[test]
fn two_arrivals_between_ticks_keep_only_the_second() {
    let mut link = link();
    let outgoing = link.sender.state().unwrap();

    outgoing.replace(Vec3::new(1.0, 1.0, 1.0)).unwrap();
    link.sender.tick().unwrap();
    outgoing.replace(Vec3::new(2.0, 2.0, 2.0)).unwrap();
    link.sender.tick().unwrap();
    link.receiver.tick().unwrap();

    assert_eq!(*link.receiver.lock_state().unwrap(), Vec3::new(2.0, 2.0, 2.0));
    assert_eq!(link.receiver.new_states(), 1);
    let stats = link.receiver.stats();
    assert_eq!(stats.datagrams, 2);
    assert_eq!(stats.overwritten, 1);
    assert_eq!(stats.adopted, 1);
}

#[test]
fn received_bytes_are_identical_to_sent_bytes() {
    let mut link = link();
    let value = Vec3::new(f64::MAX, -0.0, f64::EPSILON);
    link.sender.state().unwrap().replace(value).unwrap();

    link.sender.tick().unwrap();
    link.receiver.tick().unwrap();

    let received = link.receiver.state().unwrap().snapshot().unwrap();
    assert_eq!(received.encode(), value.encode());
}

#[test]
fn size_mismatch_leaves_state_untouched() {
    let mut link = link();
    link.sender
        .state()
        .unwrap()
        .replace(Vec3::new(3.0, 2.0, 1.0))
        .unwrap();
    link.sender.tick().unwrap();
    link.receiver.tick().unwrap();

    let mut rogue = link.transport.open_sender(&config()).unwrap();
    rogue.send(STATE_TOPIC, &[0xAB; 20]).unwrap();
    link.receiver.tick().unwrap();

    assert_eq!(link.receiver.new_states(), 0);
    assert_eq!(*link.receiver.lock_state().unwrap(), Vec3::new(3.0, 2.0, 1.0));
    assert_eq!(link.receiver.stats().rejected, 1);

    link.receiver.tick().unwrap();
    assert_eq!(link.receiver.new_states(), 0);
}

#[test]
fn locked_reads_never_observe_a_torn_state() {
    let mut link = link();
    let incoming = link.receiver.state().unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let reader = {
        let done = done.clone();
        thread::spawn(move || {
            let mut reads = 0u64;
            while !done.load(Ordering::Acquire) {
                let state = incoming.lock().unwrap();
                assert!(
                    state.x == state.y && state.y == state.z,
                    "torn read: {:?}",
                    *state
                );
                reads += 1;
            }
            reads
        })
    };

    let outgoing = link.sender.state().unwrap();
    for i in 0..2_000 {
        let v = i as f64;
        outgoing.replace(Vec3::new(v, v, v)).unwrap();
        link.sender.tick().unwrap();
        link.receiver.tick().unwrap();
    }
    done.store(true, Ordering::Release);

    assert!(reader.join().unwrap() > 0);
    assert_eq!(*link.receiver.lock_state().unwrap(), Vec3::new(1999.0, 1999.0, 1999.0));
}

#[test]
fn shared_handle_is_visible_to_the_application() {
    let transport = LoopbackTransport::new();
    let app_view = statesync_core::StateHandle::new(Vec3::default());

    let mut receiver = StateReceiveDomain::<Vec3>::with_transport(Arc::new(transport.clone()));
    receiver.configure(PORT, "0.0.0.0", 1400).unwrap();
    receiver.set_state_pointer(app_view.clone());
    receiver.initialize(Some(&DomainContext::new("app"))).unwrap();

    let mut sender = StateSendDomain::<Vec3>::with_transport(Arc::new(transport));
    sender.configure_with(config()).unwrap();
    sender.initialize(None).unwrap();
    sender.state().unwrap().replace(Vec3::new(6.0, 6.0, 6.0)).unwrap();

    sender.tick().unwrap();
    receiver.tick().unwrap();

    assert_eq!(app_view.snapshot().unwrap(), Vec3::new(6.0, 6.0, 6.0));
    assert_eq!(app_view.new_states(), 1);
}
