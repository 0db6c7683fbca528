//! ---
//! aasb_section: "02-messaging-ipc-data-model"
//! aasb_subsection: "tests"
//! aasb_type: "source"
//! aasb_scope: "test"
//! aasb_description: "Routing, correlation and codec properties over a linked broker pair."
//! aasb_version: "v0.0.0-prealpha"
//! aasb_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use aasb_msg::{
    decode, encode, BrokerConfig, Disposition, Envelope, InMemoryTransport, LoopbackTransport,
    MessageBroker, ReplyError,
};
use parking_lot::Mutex;

fn linked_brokers() -> (MessageBroker, MessageBroker) {
    let (platform, engine) = InMemoryTransport::pair();
    let config = BrokerConfig {
        default_reply_timeout: Duration::from_secs(1),
        expiry_interval: Duration::from_millis(10),
    };
    let platform = MessageBroker::builder(Arc::new(platform))
        .config(config.clone())
        .build()
        .expect("platform broker");
    let engine = MessageBroker::builder(Arc::new(engine))
        .config(config)
        .build()
        .expect("engine broker");
    (platform, engine)
}

fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    check()
}

/// Publishes a marker and waits for it. Delivery is in wire order, so every
/// envelope published before the marker has been dispatched once it arrives.
fn flush(sender: &MessageBroker, receiver: &MessageBroker) {
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let marker = receiver.subscribe_scoped("Test", "Flush", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    sender.publish("Test", "Flush", "{}").expect("flush marker");
    assert!(eventually(|| seen.load(Ordering::SeqCst) == 1), "flush marker lost");
    drop(marker);
}

#[test]
fn every_matching_handler_runs_once_in_registration_order() {
    let (platform, engine) = linked_brokers();
    let log = Arc::new(Mutex::new(Vec::new()));
    for index in 0..5usize {
        let log = log.clone();
        platform.subscribe("Navigation", "StartNavigation", move |envelope| {
            log.lock().push((envelope.message_id.clone(), index));
            Ok(())
        });
    }

    let ids: Vec<String> = (0..3)
        .map(|n| {
            engine
                .publish("Navigation", "StartNavigation", format!(r#"{{"leg":{n}}}"#))
                .expect("publish")
        })
        .collect();
    flush(&engine, &platform);

    let log = log.lock();
    let expected: Vec<(String, usize)> = ids
        .iter()
        .flat_map(|id| (0..5).map(move |index| (id.clone(), index)))
        .collect();
    assert_eq!(*log, expected);
}

#[test]
fn handlers_for_other_pairs_never_fire() {
    let (platform, engine) = linked_brokers();
    let pairs = [
        ("Navigation", "StartNavigation"),
        ("Navigation", "CancelNavigation"),
        ("AlexaClient", "StartNavigation"),
        ("AlexaClient", "GetState"),
    ];
    let counts: Vec<Arc<AtomicUsize>> = pairs
        .iter()
        .map(|(topic, action)| {
            let count = Arc::new(AtomicUsize::new(0));
            let hits = count.clone();
            platform.subscribe(*topic, *action, move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            count
        })
        .collect();

    for (target, (topic, action)) in pairs.iter().enumerate() {
        engine.publish(*topic, *action, "{}").expect("publish");
        flush(&engine, &platform);
        for (index, count) in counts.iter().enumerate() {
            let expected = usize::from(index <= target);
            assert_eq!(
                count.load(Ordering::SeqCst),
                expected,
                "pair {index} after publishing to pair {target}"
            );
        }
    }
}

#[test]
fn only_the_exact_reply_id_resolves_a_waiter() {
    let transport = Arc::new(LoopbackTransport::new());
    let broker = MessageBroker::new(transport.clone()).expect("broker");
    let waiter = broker
        .request("AlexaClient", "GetState", "{}", Some(Duration::from_secs(5)))
        .expect("request");
    let request = decode(&transport.recv().expect("request sent")).expect("decode");
    let dispatcher = broker.dispatcher();

    let strangers = [
        Envelope::new("AlexaClient", "GetState", "{}").with_reply_to("someone-else"),
        Envelope::new("AlexaClient", "GetState", "{}").with_reply_to(format!("{}x", request.message_id)),
        Envelope::new("AlexaClient", "GetState", "{}"),
        Envelope::new("AlexaClient", "GetState", "{}").with_message_id(request.message_id.clone()),
    ];
    for stranger in &strangers {
        assert_ne!(
            dispatcher.dispatch_inbound(&encode(stranger).expect("encode")),
            Disposition::Correlated
        );
        assert!(!waiter.is_resolved());
    }

    let reply = Envelope::reply_to(&request, r#"{"state":"IDLE"}"#);
    assert_eq!(
        dispatcher.dispatch_inbound(&encode(&reply).expect("encode")),
        Disposition::Correlated
    );
    assert_eq!(waiter.wait().expect("reply"), reply);
}

#[test]
fn resolved_requests_cannot_resolve_again() {
    let transport = Arc::new(LoopbackTransport::new());
    let broker = MessageBroker::builder(transport.clone())
        .config(BrokerConfig {
            default_reply_timeout: Duration::from_millis(20),
            expiry_interval: Duration::ZERO,
        })
        .build()
        .expect("broker");
    let dispatcher = broker.dispatcher();

    // resolved by a reply
    let waiter = broker
        .request("AlexaClient", "GetState", "{}", Some(Duration::from_secs(5)))
        .expect("request");
    let request = decode(&transport.recv().expect("sent")).expect("decode");
    let reply = encode(&Envelope::reply_to(&request, "{}")).expect("encode");
    assert_eq!(dispatcher.dispatch_inbound(&reply), Disposition::Correlated);
    assert_ne!(dispatcher.dispatch_inbound(&reply), Disposition::Correlated);
    waiter.wait().expect("first reply wins");

    // resolved by a timeout
    let waiter = broker
        .request("AlexaClient", "GetState", "{}", None)
        .expect("request");
    let request = decode(&transport.recv().expect("sent")).expect("decode");
    assert!(matches!(waiter.wait(), Err(ReplyError::Timeout { .. })));
    let late = encode(&Envelope::reply_to(&request, "{}")).expect("encode");
    assert_ne!(dispatcher.dispatch_inbound(&late), Disposition::Correlated);

    assert_eq!(broker.metrics().unmatched_replies, 2);
    assert_eq!(broker.pending_requests(), 0);
}

#[test]
fn valid_envelopes_survive_the_codec() {
    let payloads = [
        "",
        "{}",
        r#"{"state":"IDLE"}"#,
        r#"[1,2,3]"#,
        "42",
        "true",
        "null",
        "\"quoted\"",
        " {\"padded\":true} ",
        "plain text",
        "{not json",
        "line\nbreak \u{1F697} unicode",
    ];
    for (index, payload) in payloads.iter().enumerate() {
        let mut envelope = Envelope::new("Navigation", "StartNavigation", *payload)
            .with_message_id(format!("m{index}"));
        if index % 2 == 1 {
            envelope = envelope.with_reply_to(format!("r{index}"));
        }
        let bytes = encode(&envelope).expect("encode");
        assert_eq!(decode(&bytes).expect("decode"), envelope, "payload {payload:?}");
    }
}

#[test]
fn failing_handler_does_not_starve_the_next_one() {
    let (platform, engine) = linked_brokers();
    let delivered = Arc::new(Mutex::new(Vec::new()));
    platform.subscribe("Navigation", "StartNavigation", |_| {
        anyhow::bail!("navigation provider offline")
    });
    platform.subscribe("Navigation", "StartNavigation", |_| {
        panic!("navigation provider crashed")
    });
    let sink = delivered.clone();
    platform.subscribe("Navigation", "StartNavigation", move |envelope| {
        sink.lock().push(envelope.message_id.clone());
        Ok(())
    });

    let first = engine
        .publish("Navigation", "StartNavigation", "{}")
        .expect("publish");
    let second = engine
        .publish("Navigation", "StartNavigation", "{}")
        .expect("publish");
    flush(&engine, &platform);

    assert_eq!(*delivered.lock(), vec![first, second]);
    assert_eq!(platform.metrics().handler_failures, 4);
}

#[test]
fn replies_cross_the_link() {
    let (platform, engine) = linked_brokers();
    let engine = Arc::new(engine);
    let responder = Arc::downgrade(&engine);
    engine.subscribe("AlexaClient", "GetState", move |request| {
        if let Some(engine) = responder.upgrade() {
            engine.reply(request, r#"{"state":"LISTENING"}"#)?;
        }
        Ok(())
    });

    let reply = platform
        .publish_and_await_reply("AlexaClient", "GetState", "{}", None)
        .expect("reply");
    assert_eq!(reply.payload, r#"{"state":"LISTENING"}"#);
    assert_eq!(platform.metrics().correlated, 1);
}
