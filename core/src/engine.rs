//! The record engine contract shared by every store variant and decorator.

use std::collections::BTreeMap;

use tracing::trace;

use crate::error::{StoreError, StoreResult};
use crate::serializer::{Serializer, to_bytes};

/// Stable identifier of one logical record.
pub type Recid = u64;

/// Holds the name → recid directory.
pub const RECID_NAME_CATALOG: Recid = 1;
/// Reserved for a serializer registry kept by higher layers.
pub const RECID_CLASS_CATALOG: Recid = 2;
/// Last engine-reserved recid.
pub const RECID_LAST_RESERVED: Recid = 7;
/// First recid handed out by `put`.
pub const RECID_FIRST: Recid = RECID_LAST_RESERVED + 1;

/// Comparison callback for [`Engine::compare_and_swap_bytes`].
///
/// Receives the current payload (`None` for an absent or null record) and
/// decides whether the swap goes ahead.
pub type CasCheck<'a> = &'a mut dyn FnMut(Option<&[u8]>) -> StoreResult<bool>;

/// Byte-level record engine.
///
/// Every method takes `&self`; implementations serialize access internally.
pub trait Engine: Send + Sync {
    /// Store a new record and return its recid.
    fn put_bytes(&self, data: &[u8]) -> StoreResult<Recid>;

    /// Read a record. Absent, null and deleted records all read as `None`.
    fn get_bytes(&self, recid: Recid) -> StoreResult<Option<Vec<u8>>>;

    /// Replace the payload of an existing record. The recid never changes.
    fn update_bytes(&self, recid: Recid, data: &[u8]) -> StoreResult<()>;

    /// Run `check` against the current payload and, if it returns true,
    /// replace it with `data`, all under one write lock.
    fn compare_and_swap_bytes(
        &self,
        recid: Recid,
        check: CasCheck<'_>,
        data: &[u8],
    ) -> StoreResult<bool>;

    /// Free the record's space; its recid may be handed out again.
    fn delete(&self, recid: Recid) -> StoreResult<()>;

    /// Reserve a recid that holds no value yet.
    fn preallocate(&self) -> StoreResult<Recid>;

    fn commit(&self) -> StoreResult<()>;

    /// Discard uncommitted changes; engines without a journal fail with
    /// [`StoreError::Unsupported`].
    fn rollback(&self) -> StoreResult<()>;

    fn close(&self) -> StoreResult<()>;

    fn can_rollback(&self) -> bool;

    fn is_read_only(&self) -> bool;

    fn is_closed(&self) -> bool;

    /// Look up a named record in the directory kept at [`RECID_NAME_CATALOG`].
    fn get_named_recid(&self, name: &str) -> StoreResult<Option<Recid>> {
        let catalog = decode_catalog(self.get_bytes(RECID_NAME_CATALOG)?.as_deref())?;
        Ok(catalog.get(name).copied())
    }

    /// Bind `name` to `recid`, or remove the binding when `recid` is `None`.
    fn set_named_recid(&self, name: &str, recid: Option<Recid>) -> StoreResult<()> {
        loop {
            let current = self.get_bytes(RECID_NAME_CATALOG)?;
            let mut catalog = decode_catalog(current.as_deref())?;
            match recid {
                Some(r) => catalog.insert(name.to_string(), r),
                None => catalog.remove(name),
            };
            let encoded = bincode::serialize(&catalog)?;

            let mut unchanged =
                |now: Option<&[u8]>| -> StoreResult<bool> { Ok(now == current.as_deref()) };
            if self.compare_and_swap_bytes(RECID_NAME_CATALOG, &mut unchanged, &encoded)? {
                return Ok(());
            }
            trace!(name, "Name catalog changed concurrently, retrying");
        }
    }
}

fn decode_catalog(data: Option<&[u8]>) -> StoreResult<BTreeMap<String, Recid>> {
    match data {
        None | Some([]) => Ok(BTreeMap::new()),
        Some(bytes) => Ok(bincode::deserialize(bytes)?),
    }
}

/// Typed access on top of any [`Engine`].
pub trait EngineExt: Engine {
    fn put<T, S>(&self, value: &T, serializer: &S) -> StoreResult<Recid>
    where
        S: Serializer<T> + ?Sized,
    {
        self.put_bytes(&to_bytes(serializer, value)?)
    }

    fn get<T, S>(&self, recid: Recid, serializer: &S) -> StoreResult<Option<T>>
    where
        S: Serializer<T> + ?Sized,
    {
        self.get_bytes(recid)?
            .map(|bytes| serializer.deserialize(&bytes))
            .transpose()
    }

    fn update<T, S>(&self, recid: Recid, value: &T, serializer: &S) -> StoreResult<()>
    where
        S: Serializer<T> + ?Sized,
    {
        self.update_bytes(recid, &to_bytes(serializer, value)?)
    }

    /// Replace the value with `new` if it currently equals `expected`
    /// (`None` matches an absent or null record).
    fn compare_and_swap<T, S>(
        &self,
        recid: Recid,
        expected: Option<&T>,
        new: &T,
        serializer: &S,
    ) -> StoreResult<bool>
    where
        T: PartialEq,
        S: Serializer<T> + ?Sized,
    {
        let data = to_bytes(serializer, new)?;
        let mut check = |current: Option<&[u8]>| -> StoreResult<bool> {
            match (current, expected) {
                (None, None) => Ok(true),
                (Some(bytes), Some(expected)) => Ok(serializer.deserialize(bytes)? == *expected),
                _ => Ok(false),
            }
        };
        self.compare_and_swap_bytes(recid, &mut check, &data)
    }
}

impl<E: Engine + ?Sized> EngineExt for E {}

/// Guard shared by engines: fail on closed or read-only stores.
pub(crate) fn check_writable(closed: bool, read_only: bool) -> StoreResult<()> {
    if closed {
        return Err(StoreError::Closed);
    }
    if read_only {
        return Err(StoreError::ReadOnly);
    }
    Ok(())
}
