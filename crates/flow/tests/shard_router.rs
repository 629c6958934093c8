use std::collections::BTreeSet;

use flow::shard::{ShardId, ShardOwnership, ShardRouter, ShardSet};
use uuid::Uuid;

#[test]
fn shard_of_is_sha256_hex_prefix_of_canonical_id() {
  let nil = Uuid::nil();
  let dns = Uuid::parse_str("6ba7b810-9dad-11d1-80b4-00c04fd430c8").unwrap();

  assert_eq!(ShardRouter::new(2).unwrap().shard_of(&nil).as_str(), "12");
  assert_eq!(ShardRouter::new(4).unwrap().shard_of(&nil).as_str(), "12b9");
  assert_eq!(ShardRouter::new(1).unwrap().shard_of(&dns).as_str(), "e");
  assert_eq!(ShardRouter::new(3).unwrap().shard_of(&dns).as_str(), "e58");
}

#[test]
fn shard_of_is_pure_across_router_instances() {
  let a = ShardRouter::new(2).unwrap();
  let b = ShardRouter::new(2).unwrap();
  for _ in 0..100 {
    let id = Uuid::new_v4();
    let s = a.shard_of(&id);
    assert_eq!(s, b.shard_of(&id));
    assert_eq!(s, a.shard_of(&id));
    assert_eq!(s.as_str().len(), 2);
  }
}

#[test]
fn prefix_len_out_of_range_is_rejected() {
  assert!(ShardRouter::new(0).is_err());
  assert!(ShardRouter::new(5).is_err());
  assert_eq!(ShardRouter::new(3).unwrap().shard_count(), 4096);
  assert_eq!(ShardRouter::default().all_shards().count(), 256);
}

#[test]
fn shard_set_parses_all_range_and_list() {
  let router = ShardRouter::default();
  assert_eq!(ShardSet::parse("all", 2).unwrap(), ShardSet::All);

  let range = ShardSet::parse("00-7f", 2).unwrap();
  assert!(range.contains(&ShardId::parse("00", 2).unwrap()));
  assert!(range.contains(&ShardId::parse("7f", 2).unwrap()));
  assert!(!range.contains(&ShardId::parse("80", 2).unwrap()));
  assert_eq!(range.shards(&router).len(), 128);
  // la forma mostrada conserva el ancho del prefijo y se vuelve a leer
  assert_eq!(range.to_string(), "00-7f");
  assert_eq!(ShardSet::parse(&range.to_string(), 2).unwrap(), range);
  assert_eq!(ShardSet::parse("0000-00ff", 4).unwrap().to_string(), "0000-00ff");

  let list = ShardSet::parse("00, 1A,ff", 2).unwrap();
  assert_eq!(list.shards(&router).len(), 3);
  assert!(list.contains(&ShardId::parse("1a", 2).unwrap()));
  assert_eq!(list.to_string(), "00,1a,ff");

  assert!(ShardSet::parse("7f-00", 2).is_err());
  assert!(ShardSet::parse("zz", 2).is_err());
  assert!(ShardSet::parse("abc", 2).is_err());
}

#[test]
fn ownership_replace_returns_previous_set() {
  let own = ShardOwnership::new(ShardSet::parse("00-0f", 2).unwrap());
  let s05 = ShardId::parse("05", 2).unwrap();
  let s20 = ShardId::parse("20", 2).unwrap();
  assert!(own.owns(&s05));
  assert!(!own.owns(&s20));

  let mut explicit = BTreeSet::new();
  explicit.insert(s20.clone());
  let previous = own.replace(ShardSet::Explicit(explicit));
  assert_eq!(previous,
             ShardSet::Range { start: ShardId::parse("00", 2).unwrap(),
                               end: ShardId::parse("0f", 2).unwrap() });
  assert!(!own.owns(&s05));
  assert!(own.owns(&s20));
}
