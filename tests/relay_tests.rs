// Integration tests for the broker over the loopback transport

mod test_utils;

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use test_utils::*;
use wsrelay::relay::*;

fn loopback_broker(limits: Limits) -> (Broker, LoopbackController) {
    let mut broker = Broker::new(BrokerConfig {
        limits,
        ..Default::default()
    });
    let (transport, controller) = LoopbackTransport::new();
    broker.start_with(transport).unwrap();
    (broker, controller)
}

#[test]
fn test_receive_mode() {
    let (mut broker, controller) = loopback_broker(fast_limits());

    let client = controller.connect();
    assert!(wait_until(WAIT, || broker.client_count() == 1));

    controller.send(client, "ping");
    let message = broker.receive(WAIT).unwrap();
    assert_eq!(message.text(), Some("ping"));

    assert!(broker.send("pong", message.connection_id));
    assert!(controller.wait_for_messages(client, 1, WAIT));
    assert_eq!(controller.messages(client), vec![b"pong".to_vec()]);

    broker.stop();
    assert!(!broker.is_running());
    assert_eq!(broker.client_count(), 0);
}

#[test]
fn test_callback_mode() {
    let received = Arc::new(Mutex::new(Vec::new()));

    let mut broker = Broker::new(BrokerConfig {
        limits: fast_limits(),
        ..Default::default()
    });
    {
        let received = received.clone();
        broker.set_message_callback(move |id, payload| {
            received.lock().push((id, payload.to_vec()));
        });
    }
    let (transport, controller) = LoopbackTransport::new();
    broker.start_with(transport).unwrap();

    let client = controller.connect();
    controller.send_fragment(client, "hel", true, false);
    controller.send_fragment(client, "lo", false, true);

    assert!(wait_until(WAIT, || received.lock().len() == 1));
    let (id, payload) = received.lock()[0].clone();
    assert_eq!(payload, b"hello");
    assert!(!id.is_broadcast());

    // Callback mode consumes everything; receive has nothing to give
    assert!(broker.receive(Duration::from_millis(20)).is_none());

    broker.stop();
}

#[test]
fn test_callback_panic_keeps_dispatcher_alive() {
    let received = Arc::new(Mutex::new(Vec::new()));

    let mut broker = Broker::new(BrokerConfig {
        limits: fast_limits(),
        ..Default::default()
    });
    {
        let received = received.clone();
        broker.set_message_callback(move |_id, payload| {
            if payload == b"boom" {
                panic!("callback failure");
            }
            received.lock().push(payload.to_vec());
        });
    }
    let (transport, controller) = LoopbackTransport::new();
    broker.start_with(transport).unwrap();

    let client = controller.connect();
    controller.send(client, "boom");
    controller.send(client, "after");

    assert!(wait_until(WAIT, || received.lock().len() == 1));
    assert_eq!(received.lock()[0], b"after");
    assert!(broker.is_running());

    broker.stop();
}

#[test]
fn test_echo_through_handle() {
    let mut broker = Broker::new(BrokerConfig {
        limits: fast_limits(),
        ..Default::default()
    });
    let handle = broker.handle();
    broker.set_message_callback(move |id, payload| {
        handle.send(payload.to_vec(), id);
    });

    let (transport, controller) = LoopbackTransport::new();
    broker.start_with(transport).unwrap();

    let a = controller.connect();
    let b = controller.connect();
    controller.send(a, "from a");
    controller.send(b, "from b");

    assert!(controller.wait_for_messages(a, 1, WAIT));
    assert!(controller.wait_for_messages(b, 1, WAIT));
    assert_eq!(controller.messages(a), vec![b"from a".to_vec()]);
    assert_eq!(controller.messages(b), vec![b"from b".to_vec()]);

    broker.stop();
}

#[test]
fn test_broadcast_reaches_every_client() {
    let (mut broker, controller) = loopback_broker(fast_limits());

    let clients: Vec<_> = (0..3).map(|_| controller.connect()).collect();
    assert!(wait_until(WAIT, || broker.client_count() == 3));

    assert!(broker.send("news", ConnectionId::BROADCAST));
    for client in &clients {
        assert!(controller.wait_for_messages(*client, 1, WAIT));
        assert_eq!(controller.messages(*client), vec![b"news".to_vec()]);
    }

    broker.stop();
}

#[test]
fn test_large_message_is_chunked() {
    let limits = Limits {
        max_chunk: 16,
        ..fast_limits()
    };
    let (mut broker, controller) = loopback_broker(limits);

    let client = controller.connect();
    assert!(wait_until(WAIT, || broker.client_count() == 1));

    let payload: Vec<u8> = (0..100u8).collect();
    assert!(broker.send(payload.clone(), ConnectionId::BROADCAST));
    assert!(controller.wait_for_messages(client, 1, WAIT));

    let frames = controller.frames(client);
    assert_eq!(frames.len(), 7);
    assert!(frames[0].first);
    assert!(frames[6].last);
    assert!(frames.iter().all(|f| f.data.len() <= 16));
    assert_eq!(controller.messages(client), vec![payload]);

    broker.stop();
}

#[test]
fn test_admission_limit() {
    let limits = Limits {
        max_clients: 1,
        ..fast_limits()
    };
    let (mut broker, controller) = loopback_broker(limits);

    let first = controller.connect();
    assert!(wait_until(WAIT, || broker.client_count() == 1));

    let second = controller.connect();
    assert!(wait_until(WAIT, || controller.is_closed(second)));
    assert!(!controller.is_closed(first));
    assert_eq!(broker.client_count(), 1);

    // A slot frees up once the first client leaves
    controller.disconnect(first);
    assert!(wait_until(WAIT, || broker.client_count() == 0));
    let third = controller.connect();
    assert!(wait_until(WAIT, || broker.client_count() == 1));
    assert!(!controller.is_closed(third));

    broker.stop();
}

#[test]
fn test_restart_gets_fresh_session() {
    let (mut broker, controller) = loopback_broker(fast_limits());
    let client = controller.connect();
    assert!(wait_until(WAIT, || broker.client_count() == 1));
    controller.send(client, "old");
    std::thread::sleep(Duration::from_millis(30));
    broker.stop();

    let (transport, controller) = LoopbackTransport::new();
    broker.start_with(transport).unwrap();
    assert!(broker.is_running());
    assert_eq!(broker.client_count(), 0);

    let client = controller.connect();
    controller.send(client, "new");
    let message = broker.receive(WAIT).unwrap();
    assert_eq!(message.text(), Some("new"));

    broker.stop();
}

#[test]
fn test_registry_ids_are_fresh() {
    let registry = Registry::new(2);

    let a = registry.admit(TransportHandle(1)).unwrap();
    let b = registry.admit(TransportHandle(2)).unwrap();
    assert_ne!(a, b);
    assert!(matches!(
        registry.admit(TransportHandle(3)),
        Err(BrokerError::AdmissionRejected { capacity: 2 })
    ));

    assert!(registry.evict(a));
    assert!(!registry.evict(a));
    let c = registry.admit(TransportHandle(3)).unwrap();
    assert_ne!(c, a);
    assert_ne!(c, b);
    assert_eq!(registry.ids().len(), 2);
    assert!(registry.lookup(a).is_none());
}
