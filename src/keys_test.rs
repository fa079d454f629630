use crate::keys::{self, EntityKind};

#[test]
fn keys_embed_the_entity_kind() {
  // Same name, same correlation key, different kinds: never the same key.
  let accumulation = keys::guard(EntityKind::Accumulation, "orders", "k1");
  let join = keys::guard(EntityKind::Join, "orders", "k1");
  assert_ne!(accumulation, join);
  assert!(accumulation.contains("accumulation"));
  assert!(join.contains("join"));
}

#[test]
fn key_families_do_not_collide() {
  let name = "orders";
  let key = "k1";
  let all = [
    keys::partial(EntityKind::Accumulation, name, key),
    keys::guard(EntityKind::Accumulation, name, key),
    keys::first_seen(EntityKind::Accumulation, name, key),
    keys::lock(EntityKind::Accumulation, name, key),
    keys::slot(EntityKind::Join, name, key, "src"),
  ];
  for (i, a) in all.iter().enumerate() {
    for b in all.iter().skip(i + 1) {
      assert_ne!(a, b);
    }
  }
}

#[test]
fn all_keys_are_namespaced() {
  assert!(keys::stream(EntityKind::Router, "jobs").starts_with(keys::NAMESPACE));
  assert!(keys::timeout_queue(EntityKind::Join, "j").starts_with(keys::NAMESPACE));
  assert!(keys::partial(EntityKind::Accumulation, "a", "k").starts_with(keys::NAMESPACE));
}

#[test]
fn stream_names_are_per_source() {
  assert_ne!(
    keys::stream(EntityKind::Router, "a"),
    keys::stream(EntityKind::Router, "b")
  );
}
