use pretty_assertions::assert_eq;
use tempfile::tempdir;

use super::{file_config, payload};
use crate::config::{AsyncWriteConfig, EngineKind, StoreConfig};
use crate::engine::{Engine, EngineExt};
use crate::error::StoreError;
use crate::open_engine;
use crate::serializer::{BincodeSerializer, StringSerializer};

const KINDS: [EngineKind; 3] = [EngineKind::Direct, EngineKind::Wal, EngineKind::AppendOnly];

fn async_config() -> AsyncWriteConfig {
    AsyncWriteConfig {
        queue_size: 8,
        flush_interval_ms: 5,
    }
}

/// Behaviour every engine shares, whatever its commit model.
fn exercise(engine: &dyn Engine) {
    let s = StringSerializer;
    let a = engine.put(&"one".to_string(), &s).unwrap();
    let b = engine.put_bytes(&payload(80_000, 5)).unwrap();
    assert_ne!(a, b);
    assert_eq!(engine.get(a, &s).unwrap().as_deref(), Some("one"));

    engine.update(a, &"uno".to_string(), &s).unwrap();
    assert!(!engine
        .compare_and_swap(a, Some(&"one".to_string()), &"eins".to_string(), &s)
        .unwrap());
    assert!(engine
        .compare_and_swap(a, Some(&"uno".to_string()), &"un".to_string(), &s)
        .unwrap());
    assert_eq!(engine.get(a, &s).unwrap().as_deref(), Some("un"));

    engine.delete(b).unwrap();
    assert_eq!(engine.get_bytes(b).unwrap(), None);

    let empty = engine.put_bytes(b"").unwrap();
    assert_eq!(engine.get_bytes(empty).unwrap(), Some(Vec::new()));

    let reserved = engine.preallocate().unwrap();
    assert_eq!(engine.get_bytes(reserved).unwrap(), None);
    engine.update_bytes(reserved, b"filled").unwrap();
    assert_eq!(engine.get_bytes(reserved).unwrap().unwrap(), b"filled");

    engine.commit().unwrap();
}

#[test]
fn test_every_engine_in_memory() {
    for kind in KINDS {
        let engine = open_engine(&StoreConfig::memory().with_engine(kind)).unwrap();
        exercise(engine.as_ref());
        let gone = engine.put_bytes(b"gone").unwrap();
        engine.delete(gone).unwrap();
        assert!(matches!(engine.delete(gone), Err(StoreError::AlreadyDeleted(_))));
        engine.close().unwrap();
        assert!(engine.is_closed());
        assert!(matches!(engine.get_bytes(1), Err(StoreError::Closed)));
    }
}

#[test]
fn test_every_engine_with_async_writes() {
    for kind in KINDS {
        let config = StoreConfig::memory()
            .with_engine(kind)
            .with_async_write(async_config());
        let engine = open_engine(&config).unwrap();
        exercise(engine.as_ref());
        engine.close().unwrap();
    }
}

#[test]
fn test_every_engine_on_files() {
    for kind in KINDS {
        let dir = tempdir().unwrap();
        let config = file_config(dir.path()).with_engine(kind);
        let s = StringSerializer;
        let recid;
        {
            let engine = open_engine(&config).unwrap();
            recid = engine.put(&format!("{kind:?}"), &s).unwrap();
            engine.commit().unwrap();
            engine.close().unwrap();
        }
        let engine = open_engine(&config).unwrap();
        assert_eq!(engine.get(recid, &s).unwrap(), Some(format!("{kind:?}")));
    }
}

#[test]
fn test_async_writes_reach_disk() {
    let dir = tempdir().unwrap();
    let config = file_config(dir.path());
    let recids: Vec<_>;
    {
        let engine = open_engine(&config.clone().with_async_write(async_config())).unwrap();
        recids = (0..100)
            .map(|i| engine.put_bytes(&payload(50 + i, i as u64)).unwrap())
            .collect();
        engine.commit().unwrap();
        engine.close().unwrap();
    }
    let engine = open_engine(&config).unwrap();
    for (i, recid) in recids.into_iter().enumerate() {
        assert_eq!(engine.get_bytes(recid).unwrap().unwrap(), payload(50 + i, i as u64));
    }
}

#[test]
fn test_named_recids_persist() {
    for kind in KINDS {
        let dir = tempdir().unwrap();
        let config = file_config(dir.path()).with_engine(kind);
        let recid;
        {
            let engine = open_engine(&config).unwrap();
            assert_eq!(engine.get_named_recid("users").unwrap(), None);
            recid = engine.put_bytes(b"user table").unwrap();
            engine.set_named_recid("users", Some(recid)).unwrap();
            engine.set_named_recid("orders", Some(recid + 1)).unwrap();
            engine.set_named_recid("orders", None).unwrap();
            engine.commit().unwrap();
        }
        let engine = open_engine(&config).unwrap();
        assert_eq!(engine.get_named_recid("users").unwrap(), Some(recid), "{kind:?}");
        assert_eq!(engine.get_named_recid("orders").unwrap(), None);
    }
}

#[test]
fn test_rollback_support() {
    let direct = open_engine(&StoreConfig::memory().with_engine(EngineKind::Direct)).unwrap();
    assert!(!direct.can_rollback());
    assert!(matches!(direct.rollback(), Err(StoreError::Unsupported(_))));

    for kind in [EngineKind::Wal, EngineKind::AppendOnly] {
        let engine = open_engine(&StoreConfig::memory().with_engine(kind)).unwrap();
        assert!(engine.can_rollback());
        let kept = engine.put_bytes(b"kept").unwrap();
        engine.commit().unwrap();
        let lost = engine.put_bytes(b"lost").unwrap();
        engine.rollback().unwrap();
        assert_eq!(engine.get_bytes(kept).unwrap().unwrap(), b"kept");
        assert_eq!(engine.get_bytes(lost).unwrap(), None, "{kind:?}");
    }
}

#[test]
fn test_read_only_engines_reject_writes() {
    for kind in KINDS {
        let dir = tempdir().unwrap();
        let config = file_config(dir.path()).with_engine(kind);
        {
            let engine = open_engine(&config).unwrap();
            engine.put_bytes(b"frozen").unwrap();
            engine.commit().unwrap();
        }
        let engine = open_engine(&config.clone().with_read_only(true)).unwrap();
        assert!(engine.is_read_only());
        assert!(matches!(engine.put_bytes(b"x"), Err(StoreError::ReadOnly)), "{kind:?}");
        assert!(matches!(engine.preallocate(), Err(StoreError::ReadOnly)));
    }
}

#[test]
fn test_structured_values() {
    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Order {
        id: u64,
        lines: Vec<(String, u32)>,
        note: Option<String>,
    }

    let engine = open_engine(&StoreConfig::memory()).unwrap();
    let ser = BincodeSerializer::<Order>::new();
    let mut order = Order {
        id: 7,
        lines: vec![("widget".into(), 3)],
        note: None,
    };
    let recid = engine.put(&order, &ser).unwrap();

    order.lines.push(("gadget".into(), 1));
    order.note = Some("rush".into());
    engine.update(recid, &order, &ser).unwrap();
    engine.commit().unwrap();
    assert_eq!(engine.get(recid, &ser).unwrap(), Some(order));
}

#[test]
fn test_invalid_recids() {
    for kind in KINDS {
        let engine = open_engine(&StoreConfig::memory().with_engine(kind)).unwrap();
        assert!(matches!(engine.get_bytes(0), Err(StoreError::InvalidRecid(0))), "{kind:?}");
        assert_eq!(engine.get_bytes(1_000_000).unwrap(), None);
        assert!(matches!(
            engine.update_bytes(1_000_000, b"x"),
            Err(StoreError::InvalidRecid(_))
        ));
    }
}
