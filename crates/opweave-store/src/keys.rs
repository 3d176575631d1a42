//! Fixed-width key codec for the object keyspace.
//!
//! Layout (widths in bytes):
//!
//! ```text
//! index key:  prefix(4) | entity_id(32) | id(32)              = 68
//! data key:   prefix(4) | entity_id(32) | id(32) | ts_be(8)   = 76
//! ```
//!
//! The index key points at the newest data key; data keys carry the update
//! timestamp so historical versions coexist until pruned. Any slice that
//! does not decode to these widths is rejected with `Error::InvalidKey`.

use opweave_types::{Error, Id, Result, Timestamp};

/// Byte width of a keyspace type prefix.
pub const SIZE_PREFIX: usize = 4;

const SIZE_ID: usize = 32;
const SIZE_TS: usize = 8;

/// Width of an index key.
pub const SIZE_IDX_KEY: usize = SIZE_PREFIX + SIZE_ID + SIZE_ID;

/// Width of a versioned data key.
pub const SIZE_DATA_KEY: usize = SIZE_IDX_KEY + SIZE_TS;

/// Build the index key `{prefix}{entity_id}{id}`.
pub fn idx_key(prefix: &[u8; SIZE_PREFIX], entity_id: &Id, id: &Id) -> Vec<u8> {
    let mut key = Vec::with_capacity(SIZE_IDX_KEY);
    key.extend_from_slice(prefix);
    key.extend_from_slice(entity_id.as_bytes());
    key.extend_from_slice(id.as_bytes());
    key
}

/// Build the versioned data key `{prefix}{entity_id}{id}{update_ts}`.
pub fn data_key(prefix: &[u8; SIZE_PREFIX], entity_id: &Id, id: &Id, ts: Timestamp) -> Vec<u8> {
    let mut key = Vec::with_capacity(SIZE_DATA_KEY);
    key.extend_from_slice(prefix);
    key.extend_from_slice(entity_id.as_bytes());
    key.extend_from_slice(id.as_bytes());
    key.extend_from_slice(&ts.as_millis().to_be_bytes());
    key
}

/// Decode a data key back into `(entity_id, id, update_ts)`.
pub fn parse_data_key(key: &[u8]) -> Result<(Id, Id, Timestamp)> {
    if key.len() != SIZE_DATA_KEY {
        return Err(Error::InvalidKey(key.len()));
    }
    let entity_id = Id::from_slice(&key[SIZE_PREFIX..SIZE_PREFIX + SIZE_ID])?;
    let id = Id::from_slice(&key[SIZE_PREFIX + SIZE_ID..SIZE_IDX_KEY])?;
    let mut ts_bytes = [0u8; SIZE_TS];
    ts_bytes.copy_from_slice(&key[SIZE_IDX_KEY..]);
    let ts = Timestamp::from_millis(u64::from_be_bytes(ts_bytes));
    Ok((entity_id, id, ts))
}

/// Reduce a data key to its index key.
pub fn data_key_to_idx_key(key: &[u8]) -> Result<Vec<u8>> {
    if key.len() != SIZE_DATA_KEY {
        return Err(Error::InvalidKey(key.len()));
    }
    Ok(key[..SIZE_IDX_KEY].to_vec())
}
