mod common;

use common::{counter, marks, tape};
use ripplebus::{BusEvent, Emission, EventBus, Subscription};
use serde_json::json;
use std::cell::RefCell;
use std::rc::Rc;

#[test]
fn test_register_allocates_monotonic_ids() {
    let bus = EventBus::new();
    let first = bus.on(1, |_| {});
    let second = bus.on(1, |_| {});
    let third = bus.register(5, 2, false, |_| {});
    assert!(first.id() < second.id());
    assert!(second.id() < third.id());
    assert_eq!(bus.handler_count(0, 1), 2);
    assert_eq!(bus.handler_count(5, 2), 1);
}

#[test]
fn test_emit_delivers_payload_and_context() {
    let bus = EventBus::new();
    let received = Rc::new(RefCell::new(Vec::new()));
    let sink = received.clone();
    bus.on(3, move |event| sink.borrow_mut().push(event.clone()));

    bus.emit(
        Emission::new(3)
            .with_payload(json!({ "delta": 2 }))
            .with_context(json!("ui")),
    );

    let received = received.borrow();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].channel, 3);
    assert_eq!(received[0].scope, 0);
    assert_eq!(received[0].payload, Some(json!({ "delta": 2 })));
    assert_eq!(received[0].context, Some(json!("ui")));
}

#[test]
fn test_handlers_run_in_registration_order() {
    let bus = EventBus::new();
    let tape = tape();
    for mark in 1..=3 {
        let tape = tape.clone();
        bus.on(1, move |_| tape.borrow_mut().push(mark));
    }
    bus.emit(Emission::new(1));
    assert_eq!(marks(&tape), vec![1, 2, 3]);
}

#[test]
fn test_scopes_are_isolated() {
    let bus = EventBus::new();
    let hits = counter();
    let seen = hits.clone();
    bus.register(1, 4, false, move |_| seen.set(seen.get() + 1));

    bus.emit(Emission::new(4));
    assert_eq!(hits.get(), 0);

    bus.emit(Emission::new(4).with_scope(1));
    assert_eq!(hits.get(), 1);
}

#[test]
fn test_catch_all_receives_other_channels() {
    let bus = EventBus::new();
    let channels = Rc::new(RefCell::new(Vec::new()));
    let seen = channels.clone();
    bus.on(EventBus::CATCH_ALL, move |event| {
        seen.borrow_mut().push(event.channel)
    });

    bus.emit(Emission::new(10));
    bus.emit(Emission::new(11).with_payload(json!(1)));

    // The delivered record names the original channel, not the catch-all.
    assert_eq!(*channels.borrow(), vec![10, 11]);
}

#[test]
fn test_catch_all_runs_after_channel_handlers() {
    let bus = EventBus::new();
    let tape = tape();
    let first = tape.clone();
    bus.on(2, move |_| first.borrow_mut().push(1));
    let second = tape.clone();
    bus.on(EventBus::CATCH_ALL, move |_| second.borrow_mut().push(2));

    bus.emit(Emission::new(2));
    assert_eq!(marks(&tape), vec![1, 2]);
}

#[test]
fn test_emission_to_catch_all_channel_delivers_once() {
    let bus = EventBus::new();
    let hits = counter();
    let seen = hits.clone();
    bus.on(EventBus::CATCH_ALL, move |_| seen.set(seen.get() + 1));

    bus.emit(Emission::new(EventBus::CATCH_ALL));
    assert_eq!(hits.get(), 1);
}

#[test]
fn test_off_detaches_handler() {
    let bus = EventBus::new();
    let hits = counter();
    let seen = hits.clone();
    let sub = bus.on(1, move |_| seen.set(seen.get() + 1));

    assert!(sub.off());
    bus.emit(Emission::new(1));
    assert_eq!(hits.get(), 0);
    assert_eq!(bus.handler_count(0, 1), 0);

    // Idempotent.
    assert!(!sub.off());
}

#[test]
fn test_off_after_clear_is_noop() {
    let bus = EventBus::new();
    let sub = bus.on(1, |_| {});
    bus.clear();
    assert!(!sub.off());
    assert_eq!(bus.handler_count(0, 1), 0);
}

#[test]
fn test_clear_drops_handlers_and_queues() {
    let bus = EventBus::new();
    let hits = counter();
    let seen = hits.clone();
    bus.on(1, move |_| seen.set(seen.get() + 1));
    bus.on(EventBus::CATCH_ALL, |_| {});

    bus.clear();
    bus.emit(Emission::new(1));
    assert_eq!(hits.get(), 0);

    // The bus stays usable after a clear.
    let seen = hits.clone();
    bus.on(1, move |_| seen.set(seen.get() + 1));
    bus.emit(Emission::new(1));
    assert_eq!(hits.get(), 1);
}

#[test]
fn test_clear_inside_a_handler_spares_the_delivery_in_flight() {
    let bus = Rc::new(EventBus::new());
    let tape = tape();

    let wiper = bus.clone();
    let first = tape.clone();
    bus.on(1, move |_| {
        first.borrow_mut().push(1);
        wiper.clear();
    });
    let second = tape.clone();
    bus.on(1, move |_| second.borrow_mut().push(2));

    // The delivery already captured both handlers; clearing the registry
    // mid-flight does not cut the second one off.
    bus.emit(Emission::new(1));
    assert_eq!(marks(&tape), vec![1, 2]);

    // Once the flight lands the registry really is empty.
    bus.emit(Emission::new(1));
    assert_eq!(marks(&tape), vec![1, 2]);
}

#[test]
fn test_single_transaction_reaches_oldest_handler_only() {
    let bus = EventBus::new();
    let tape = tape();
    let first = tape.clone();
    bus.register(1, 6, false, move |_| first.borrow_mut().push(1));
    let second = tape.clone();
    bus.register(1, 6, false, move |_| second.borrow_mut().push(2));

    bus.emit(Emission::new(6).with_scope(1).single_transaction());
    assert_eq!(marks(&tape), vec![1]);
}

#[test]
fn test_single_transaction_without_handler_skips_silently() {
    let bus = EventBus::new();
    let hits = counter();
    let seen = hits.clone();
    bus.register(1, 7, false, move |_| seen.set(seen.get() + 1));

    // Wrong scope: no slot, no delivery, no panic.
    bus.emit(Emission::new(7).single_transaction());
    assert_eq!(hits.get(), 0);

    // The bus keeps dispatching afterwards.
    bus.emit(Emission::new(7).with_scope(1).single_transaction());
    assert_eq!(hits.get(), 1);
}

#[test]
fn test_single_transaction_skip_suppresses_catch_all() {
    let bus = EventBus::new();
    let hits = counter();
    let seen = hits.clone();
    bus.on(EventBus::CATCH_ALL, move |_| seen.set(seen.get() + 1));

    bus.emit(Emission::new(9).single_transaction());
    assert_eq!(hits.get(), 0);

    // With a slot present the catch-all phase runs as usual.
    bus.on(9, |_| {});
    bus.emit(Emission::new(9).single_transaction());
    assert_eq!(hits.get(), 1);
}

#[test]
fn test_once_detaches_after_first_delivery() {
    let bus = EventBus::new();
    let hits = counter();
    let seen = hits.clone();
    bus.once(2, move |_| seen.set(seen.get() + 1));

    bus.emit(Emission::new(2));
    assert_eq!(bus.handler_count(0, 2), 0);

    bus.emit(Emission::new(2));
    assert_eq!(hits.get(), 1);
}

#[test]
fn test_once_catch_all() {
    let bus = EventBus::new();
    let hits = counter();
    let seen = hits.clone();
    bus.once(EventBus::CATCH_ALL, move |_| seen.set(seen.get() + 1));

    bus.emit(Emission::new(4));
    bus.emit(Emission::new(5));
    assert_eq!(hits.get(), 1);
}

#[test]
fn test_once_single_transaction() {
    let bus = EventBus::new();
    let hits = counter();
    let seen = hits.clone();
    bus.once(3, move |_| seen.set(seen.get() + 1));

    bus.emit(Emission::new(3).single_transaction());
    bus.emit(Emission::new(3).single_transaction());
    assert_eq!(hits.get(), 1);
}

#[test]
fn test_reentrant_prioritized_emissions_run_newest_first() {
    let bus = Rc::new(EventBus::new());
    let tape = tape();

    let reentrant = bus.clone();
    let first = tape.clone();
    bus.on(1, move |_| {
        reentrant.emit(Emission::new(2).prioritized());
        first.borrow_mut().push(1);
    });
    let reentrant = bus.clone();
    let second = tape.clone();
    bus.on(2, move |_| {
        reentrant.emit(Emission::new(3).prioritized());
        second.borrow_mut().push(2);
    });
    let third = tape.clone();
    bus.on(3, move |_| third.borrow_mut().push(3));

    bus.emit(Emission::new(1));
    assert_eq!(marks(&tape), vec![3, 2, 1]);
}

#[test]
fn test_reentrant_plain_emissions_run_in_arrival_order() {
    let bus = Rc::new(EventBus::new());
    let tape = tape();

    let reentrant = bus.clone();
    let first = tape.clone();
    bus.on(1, move |_| {
        reentrant.emit(Emission::new(2));
        first.borrow_mut().push(1);
    });
    let reentrant = bus.clone();
    let second = tape.clone();
    bus.on(2, move |_| {
        reentrant.emit(Emission::new(3));
        second.borrow_mut().push(2);
    });
    let third = tape.clone();
    bus.on(3, move |_| third.borrow_mut().push(3));

    bus.emit(Emission::new(1));
    assert_eq!(marks(&tape), vec![1, 2, 3]);
}

#[test]
fn test_prioritized_emissions_preempt_queued_plain_work() {
    let bus = Rc::new(EventBus::new());
    let tape = tape();

    let reentrant = bus.clone();
    let first = tape.clone();
    bus.on(1, move |_| {
        reentrant.emit(Emission::new(2));
        reentrant.emit(Emission::new(3).prioritized());
        reentrant.emit(Emission::new(4).prioritized());
        first.borrow_mut().push(1);
    });
    for channel in 2..=4 {
        let tape = tape.clone();
        bus.on(channel, move |event| tape.borrow_mut().push(event.channel));
    }

    bus.emit(Emission::new(1));
    // Prioritized work runs newest-first, ahead of the queued plain emission.
    assert_eq!(marks(&tape), vec![1, 4, 3, 2]);
}

#[test]
fn test_handler_registered_mid_delivery_waits_for_next_emission() {
    let bus = Rc::new(EventBus::new());
    let hits = counter();

    let reentrant = bus.clone();
    let seen = hits.clone();
    bus.on(1, move |_| {
        let seen = seen.clone();
        reentrant.on(1, move |_| seen.set(seen.get() + 1));
    });

    bus.emit(Emission::new(1));
    assert_eq!(hits.get(), 0);

    bus.emit(Emission::new(1));
    assert_eq!(hits.get(), 1);
}

#[test]
fn test_handler_removed_mid_delivery_is_skipped() {
    let bus = Rc::new(EventBus::new());
    let tape = tape();
    let victim: Rc<RefCell<Option<Subscription>>> = Rc::new(RefCell::new(None));

    let doomed = victim.clone();
    let first = tape.clone();
    bus.on(1, move |_| {
        first.borrow_mut().push(1);
        if let Some(sub) = doomed.borrow().as_ref() {
            sub.off();
        }
    });
    let second = tape.clone();
    *victim.borrow_mut() = Some(bus.on(1, move |_| second.borrow_mut().push(2)));
    let third = tape.clone();
    bus.on(1, move |_| third.borrow_mut().push(3));

    bus.emit(Emission::new(1));
    assert_eq!(marks(&tape), vec![1, 3]);
}

#[test]
fn test_emit_without_handlers_is_noop() {
    let bus = EventBus::new();
    bus.emit(Emission::new(42));

    // The queues drained; later traffic flows normally.
    let hits = counter();
    let seen = hits.clone();
    bus.on(42, move |_| seen.set(seen.get() + 1));
    bus.emit(Emission::new(42));
    assert_eq!(hits.get(), 1);
}

#[test]
fn test_event_record_round_trips_through_serde() {
    let event = BusEvent {
        channel: 12,
        scope: 1,
        context: Some(json!("sync")),
        payload: Some(json!({ "count": 3 })),
    };
    let encoded = serde_json::to_string(&event).unwrap();
    let decoded: BusEvent = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, event);

    // Optional parts are omitted on the wire and default back in.
    let bare: BusEvent = serde_json::from_str(r#"{"channel":5,"scope":0}"#).unwrap();
    assert_eq!(bare.payload, None);
    assert_eq!(bare.context, None);
}
