use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use jetstream_model::model::ParentLink;
use jetstream_model::model_class;
use jetstream_model::value::PropertyValue;

model_class! {
    pub struct Person {
        first: string,
        last: string,
        age: int,
        partner: reference,
        friends: array,
    }
    composites {
        display <- [first, last],
    }
}

/// A fresh object holds the tag defaults for every declared property.
#[test]
fn fresh_object_holds_defaults() {
    let p = Person::new();
    assert_eq!(p.first(), "");
    assert_eq!(p.age(), 0);
    assert!(p.partner().is_none());
    assert!(p.friends().is_empty());
}

/// Typed accessors round-trip through the dynamic property surface.
#[test]
fn typed_accessors_round_trip() {
    let p = Person::new();
    p.set_first("Ada");
    p.set_age(36);
    assert_eq!(p.first(), "Ada");
    assert_eq!(p.age(), 36);
    assert_eq!(
        p.model().value("first"),
        PropertyValue::String("Ada".to_owned())
    );
}

/// Setting a property to its current value fires no observation.
#[test]
fn equal_set_is_a_noop() {
    let p = Person::new();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    p.model().on_change().listen("test", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    p.set_age(36);
    p.set_age(36);
    // One observation for `age`; `display` does not depend on it.
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

/// Listeners fire in registration order; removal by key drops every
/// registration under that key.
#[test]
fn observers_fire_in_order_and_remove_by_key() {
    let p = Person::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    let o = order.clone();
    p.model().on_change().listen("a", move |_| {
        o.lock().unwrap().push("a");
    });
    let o = order.clone();
    p.model().on_change().listen("b", move |_| {
        o.lock().unwrap().push("b");
    });

    p.set_age(1);
    assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);

    p.model().on_change().remove_listener("a");
    p.set_age(2);
    assert_eq!(*order.lock().unwrap(), vec!["a", "b", "b"]);
}

/// Changing a composite source fires the derived property too, with no
/// stored value attached.
#[test]
fn composite_source_fires_derived() {
    let p = Person::new();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    p.model().on_change().listen("test", move |change| {
        sink.lock()
            .unwrap()
            .push((change.property, change.new.is_some()));
    });

    p.set_first("A");
    let seen = events.lock().unwrap().clone();
    assert_eq!(seen, vec![("first", true), ("display", false)]);
}

/// Back-references stay consistent with forward references: adding a
/// reference inserts a parent entry, replacing or clearing removes exactly
/// one.
#[test]
fn parent_links_follow_references() {
    let a = Person::new();
    let b = Person::new();
    let c = Person::new();

    a.set_partner(Some(b.model()));
    assert_eq!(
        b.model().parents(),
        vec![ParentLink {
            parent: a.uuid(),
            property: "partner",
        }]
    );

    a.set_partner(Some(c.model()));
    assert!(b.model().parents().is_empty());
    assert_eq!(c.model().parents().len(), 1);

    a.set_partner(None);
    assert!(c.model().parents().is_empty());
}

/// Collection membership deltas fire add/remove observations and maintain
/// one parent entry per live link.
#[test]
fn collection_deltas_fire_and_track_parents() {
    let p = Person::new();
    let b = Person::new();
    let c = Person::new();
    let deltas = Arc::new(Mutex::new(Vec::new()));
    let sink = deltas.clone();
    p.model().on_collection().listen("test", move |change| {
        sink.lock()
            .unwrap()
            .push((change.added.clone(), change.removed.clone()));
    });

    p.set_friends(&[b.model().clone(), c.model().clone()]);
    p.set_friends(&[c.model().clone()]);

    let seen = deltas.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], (vec![b.uuid(), c.uuid()], vec![]));
    assert_eq!(seen[1], (vec![], vec![b.uuid()]));

    assert!(b.model().parents().is_empty());
    assert_eq!(c.model().parents().len(), 1);
}

/// Reordering a collection is a change (the list is ordered) but not a
/// membership delta.
#[test]
fn collection_reorder_changes_without_delta() {
    let p = Person::new();
    let b = Person::new();
    let c = Person::new();
    p.set_friends(&[b.model().clone(), c.model().clone()]);

    let changes = Arc::new(AtomicUsize::new(0));
    let deltas = Arc::new(AtomicUsize::new(0));
    let n = changes.clone();
    p.model().on_change().listen("test", move |_| {
        n.fetch_add(1, Ordering::SeqCst);
    });
    let n = deltas.clone();
    p.model().on_collection().listen("test", move |_| {
        n.fetch_add(1, Ordering::SeqCst);
    });

    p.set_friends(&[c.model().clone(), b.model().clone()]);
    assert_eq!(changes.load(Ordering::SeqCst), 1);
    assert_eq!(deltas.load(Ordering::SeqCst), 0);
}

/// Identity is the UUID: wrappers over the same model object compare equal.
#[test]
fn identity_is_the_uuid() {
    let p = Person::new();
    let same = Person::from(p.model().clone());
    assert_eq!(p.uuid(), same.uuid());
    assert_eq!(p.model(), same.model());

    let other = Person::new();
    assert_ne!(p.model(), other.model());
}

/// The dynamic surface rejects unknown names and mismatched tags.
#[test]
fn dynamic_set_validates_schema() {
    let p = Person::new();
    assert!(
        p.model()
            .set_value("nope", PropertyValue::Int(1))
            .is_err()
    );
    assert!(
        p.model()
            .set_value("age", PropertyValue::Bool(true))
            .is_err()
    );
    assert!(p.model().try_value("nope").is_none());
}
