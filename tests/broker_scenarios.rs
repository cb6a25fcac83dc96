//! End-to-end broker scenarios over mock pipelines and a scripted USB source
//!
//! Run with: cargo test --test broker_scenarios

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use uvcbroker::testing::{CollectingCallback, CountingTarget, MockPipelineFactory, ScriptedPermissionSource};
use uvcbroker::{
    Broker, BrokerConfig, BrokerError, ClientCallback, DeviceIdentity, SessionEvent, TargetId, UsbEvent,
};

fn device(n: u8) -> DeviceIdentity {
    DeviceIdentity::new(0x046d, 0x0825, format!("/dev/bus/usb/001/{:03}", n)).with_serial(format!("SN{}", n))
}

fn setup(source: ScriptedPermissionSource, timeout_ms: u64) -> (Arc<Broker>, Arc<ScriptedPermissionSource>, Arc<MockPipelineFactory>) {
    let mut config = BrokerConfig::default();
    config.broker.select_timeout_ms = timeout_ms;
    let source = Arc::new(source);
    let factory = Arc::new(MockPipelineFactory::default());
    let broker = Broker::new(config, source.clone(), factory.clone());
    source.deliver_to(&broker);
    (broker, source, factory)
}

#[test]
fn test_delayed_grant_then_shared_session_then_staged_release() {
    let (broker, source, factory) = setup(ScriptedPermissionSource::granting(Duration::from_millis(50)), 2000);
    let camera = device(2);

    let first = Arc::new(CollectingCallback::new());
    let client1 = broker.control_client(first.clone());
    let started = Instant::now();
    let key = client1.select(&camera).unwrap();
    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(40), "returned before the grant: {:?}", waited);
    assert!(waited < Duration::from_millis(2000));
    assert_eq!(key, camera.key());
    assert_eq!(source.requests().len(), 1);

    let second = Arc::new(CollectingCallback::new());
    let client2 = broker.control_client(second.clone());
    assert_eq!(client2.select(&camera).unwrap(), key);
    assert_eq!(source.requests().len(), 1, "second select must not ask again");

    let session = broker.registry().get(&key).unwrap().unwrap();
    assert_eq!(session.client_count(), 2);

    // Both subscribers see pipeline events.
    client1.connect(&key).unwrap();
    assert!(first.saw(&SessionEvent::Connected));
    assert!(second.saw(&SessionEvent::Connected));

    client1.release(&key).unwrap();
    assert!(broker.is_selected(&key));
    assert_eq!(session.client_count(), 1);
    assert_eq!(factory.pipeline(0).stats().release, 0);

    client2.release(&key).unwrap();
    assert!(!broker.is_selected(&key));
    assert!(session.is_released());
    assert_eq!(factory.pipeline(0).stats().release, 1);
    // Unsubscribed before teardown.
    assert!(!second.saw(&SessionEvent::Released));
}

#[test]
fn test_never_granted_select_times_out_without_entry() {
    let (broker, source, factory) = setup(ScriptedPermissionSource::ignoring(), 200);
    let camera = device(3);
    let cb: Arc<dyn ClientCallback> = Arc::new(CollectingCallback::new());

    let started = Instant::now();
    let err = broker.select(&camera, &cb).unwrap_err();
    assert!(matches!(err, BrokerError::Timeout(_)), "got {:?}", err);
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(!broker.registry().contains(&camera.key()));
    assert_eq!(source.requests().len(), 1);
    assert_eq!(factory.created(), 0);
}

#[test]
fn test_release_all_during_blocked_select_ends_in_timeout() {
    let (broker, _source, factory) = setup(ScriptedPermissionSource::ignoring(), 300);
    let other = device(4);
    broker
        .handle_usb_event(UsbEvent::PermissionGranted(other.clone()))
        .unwrap();

    let waiter = {
        let broker = broker.clone();
        thread::spawn(move || {
            let cb: Arc<dyn ClientCallback> = Arc::new(CollectingCallback::new());
            broker.select(&device(5), &cb)
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert_eq!(broker.release_all().unwrap(), 1);
    assert_eq!(factory.pipeline(0).stats().release, 1);

    let result = waiter.join().unwrap();
    assert!(matches!(result, Err(BrokerError::Timeout(_))), "got {:?}", result);
    assert!(broker.registry().is_empty());
}

#[test]
fn test_concurrent_selects_share_one_session_released_once() {
    const CLIENTS: usize = 8;
    let (broker, _source, factory) = setup(ScriptedPermissionSource::granting(Duration::from_millis(50)), 2000);
    let camera = device(6);
    let start = Arc::new(Barrier::new(CLIENTS));
    let selected = Arc::new(Barrier::new(CLIENTS));

    let handles: Vec<_> = (0..CLIENTS)
        .map(|_| {
            let broker = broker.clone();
            let camera = camera.clone();
            let start = start.clone();
            let selected = selected.clone();
            thread::spawn(move || {
                let client = broker.control_client(Arc::new(CollectingCallback::new()));
                start.wait();
                let key = client.select(&camera).unwrap();
                selected.wait();
                client.release(&key).unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(factory.created(), 1);
    assert_eq!(factory.pipeline(0).stats().release, 1);
    assert!(!broker.is_selected(&camera.key()));
}

#[test]
fn test_redundant_transitions_are_silent() {
    let (broker, _source, factory) = setup(ScriptedPermissionSource::ignoring(), 100);
    let camera = device(7);
    broker
        .handle_usb_event(UsbEvent::PermissionGranted(camera.clone()))
        .unwrap();
    let key = camera.key();
    let watcher = Arc::new(CollectingCallback::new());
    let client = broker.control_client(watcher.clone());
    client.select(&camera).unwrap();

    client.disconnect(&key).unwrap();
    client.stop_recording(&key).unwrap();
    assert!(!client.is_connected(&key));
    assert!(!client.is_recording(&key));
    assert!(watcher.events().is_empty());
    assert_eq!(factory.pipeline(0).stats().stop_recording, 0);

    client.start_recording(&key).unwrap();
    client.start_recording(&key).unwrap();
    assert!(client.is_recording(&key));
    assert_eq!(factory.pipeline(0).stats().start_recording, 1);
    assert_eq!(watcher.events().len(), 1);
}

#[test]
fn test_removing_unknown_target_changes_nothing() {
    let (broker, _source, factory) = setup(ScriptedPermissionSource::ignoring(), 100);
    let camera = device(8);
    broker
        .handle_usb_event(UsbEvent::PermissionGranted(camera.clone()))
        .unwrap();
    let key = camera.key();
    let client = broker.control_client(Arc::new(CollectingCallback::new()));
    client.select(&camera).unwrap();
    client
        .add_surface(&key, TargetId(1), Arc::new(CountingTarget::default()), true)
        .unwrap();

    client.remove_surface(&key, TargetId(42)).unwrap();

    let session = broker.registry().get(&key).unwrap().unwrap();
    assert_eq!(session.target_ids(), vec![TargetId(1)]);
    assert_eq!(factory.pipeline(0).stats().remove_target, 0);
    assert!(broker.is_selected(&key));
}

#[test]
fn test_denied_permission_wakes_every_waiter() {
    let (broker, _source, _factory) = setup(ScriptedPermissionSource::denying(Duration::from_millis(80)), 2000);

    let waiters: Vec<_> = (10..13u8)
        .map(|n| {
            let broker = broker.clone();
            thread::spawn(move || {
                let cb: Arc<dyn ClientCallback> = Arc::new(CollectingCallback::new());
                let started = Instant::now();
                (broker.select(&device(n), &cb), started.elapsed())
            })
        })
        .collect();

    for w in waiters {
        let (result, waited) = w.join().unwrap();
        assert!(matches!(result, Err(BrokerError::PermissionDenied(_))), "got {:?}", result);
        assert!(waited < Duration::from_millis(2000));
    }
    assert!(broker.registry().is_empty());
}

#[test]
fn test_shutdown_releases_everything() {
    let (broker, _source, factory) = setup(ScriptedPermissionSource::ignoring(), 100);
    for n in 20..23u8 {
        broker
            .handle_usb_event(UsbEvent::PermissionGranted(device(n)))
            .unwrap();
    }
    let client = broker.control_client(Arc::new(CollectingCallback::new()));
    client.select(&device(20)).unwrap();
    client.connect(&device(20).key()).unwrap();

    broker.shutdown().unwrap();

    assert!(broker.registry().is_empty());
    assert_eq!(factory.created(), 3);
    assert_eq!(factory.total_releases(), 3);
}

#[test]
fn test_dropped_client_callback_no_longer_pins_session() {
    let (broker, _source, factory) = setup(ScriptedPermissionSource::ignoring(), 100);
    let camera = device(30);
    broker
        .handle_usb_event(UsbEvent::PermissionGranted(camera.clone()))
        .unwrap();

    {
        let client = broker.control_client(Arc::new(CollectingCallback::new()));
        client.select(&camera).unwrap();
        assert_eq!(broker.registry().get(&camera.key()).unwrap().unwrap().client_count(), 1);
    }

    // The client went away without releasing; unbinding reaps the idle session.
    assert_eq!(broker.unbind().unwrap(), 1);
    assert!(!broker.is_selected(&camera.key()));
    assert_eq!(factory.pipeline(0).stats().release, 1);
}
