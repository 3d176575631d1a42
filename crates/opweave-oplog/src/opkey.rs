//! Operational keys and rotation.
//!
//! An entity's members encrypt traffic under a shared operational key that
//! is rotated rather than long-lived. Key material is derived by hashing
//! (seed, entity, iteration); the iteration count is bounded so a colliding
//! derived id fails loudly instead of looping. Rotation is two oplogs:
//! `CreateOpKey` opens the new key's chain and `RevokeOpKey` closes the
//! prior one, leaving exactly one Alive key per entity.

use crate::auth::MasterLedger;
use crate::engine::ApplyOp;
use crate::record::{Category, OpCode, Oplog};
use opweave_store::{ObjectCore, ObjectStore, Replicated};
use opweave_types::{Error, Hasher, Id, Keypair, Result, Status, Timestamp};
use serde::{Deserialize, Serialize};

/// Derivation attempts before giving up on a non-colliding key id.
pub const MAX_DERIVE_ITER: u32 = 10;

/// A derived operational key record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpKeyInfo {
    pub core: ObjectCore,
    /// 32 bytes of derived symmetric material.
    pub key: [u8; 32],
}

impl Replicated for OpKeyInfo {
    const PREFIX: [u8; 4] = *b".okd";
    const IDX_PREFIX: [u8; 4] = *b".okx";

    fn core(&self) -> &ObjectCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ObjectCore {
        &mut self.core
    }
}

impl ApplyOp for OpKeyInfo {
    fn from_genesis(log: &Oplog) -> Result<Self> {
        if log.op != OpCode::CreateOpKey {
            return Err(Error::Validation("op-key genesis must be CreateOpKey".into()));
        }
        let key = key_extra_material(log)?;
        let mut core = ObjectCore::new(
            log.obj_id,
            log.entity_id,
            log.creator_id,
            log.create_ts,
            log.id,
        );
        core.set_status(Status::Alive)?;
        Ok(OpKeyInfo { core, key })
    }

    fn apply(&mut self, log: &Oplog) -> Result<()> {
        match log.op {
            OpCode::RevokeOpKey => self.core.set_status(Status::Deleted),
            other => Err(Error::Validation(format!(
                "op {:?} not valid for an op-key record",
                other
            ))),
        }
    }
}

/// Hash (seed, entity, iteration) into 32 bytes of key material.
pub fn derive_material(seed: &[u8], entity_id: &Id, iteration: u32) -> [u8; 32] {
    let mut h = Hasher::new();
    h.update(seed);
    h.update(entity_id.as_bytes());
    h.update(&iteration.to_be_bytes());
    *h.finalize().as_bytes()
}

/// Derive a fresh (id, material) pair, bumping the iteration while the
/// derived id collides with an existing one. Exhausting the budget is a
/// hard error rather than a spin.
pub fn derive_op_key(
    seed: &[u8],
    entity_id: &Id,
    ts: Timestamp,
    taken: &[Id],
) -> Result<(Id, [u8; 32])> {
    for iteration in 0..MAX_DERIVE_ITER {
        let material = derive_material(seed, entity_id, iteration);
        let id = Id::derive(&material, ts, entity_id.as_bytes());
        if !taken.contains(&id) {
            return Ok((id, material));
        }
    }
    Err(Error::Validation("op-key derivation budget exhausted".into()))
}

/// The `key_extra` payload carrying derived key material.
pub fn material_extra(material: &[u8; 32]) -> serde_json::Value {
    serde_json::json!({ "opkey": hex_encode(material) })
}

/// Extract the derived key material a CreateOpKey oplog carries.
pub fn key_extra_material(log: &Oplog) -> Result<[u8; 32]> {
    let extra = log
        .key_extra
        .as_ref()
        .ok_or_else(|| Error::Validation("missing key_extra".into()))?;
    let hex = extra
        .get("opkey")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Validation("key_extra has no opkey".into()))?;
    hex_decode(hex).ok_or_else(|| Error::Validation("malformed opkey material".into()))
}

/// The single current key: the newest Alive record, if any.
pub async fn current_op_key(
    store: &ObjectStore<OpKeyInfo>,
    entity_id: &Id,
) -> Result<Option<OpKeyInfo>> {
    let keys = store.list_entity(entity_id).await?;
    Ok(keys
        .into_iter()
        .filter(|k| k.core.status == Status::Alive)
        .max_by_key(|k| k.core.id))
}

/// Build the signed oplogs for one rotation: a CreateOpKey for the freshly
/// derived key, plus a RevokeOpKey chained onto the prior key if one is
/// Alive. `master` both creates and authorizes; co-signatures from other
/// masters are appended by the caller before submission.
pub fn rotation_logs(
    master: &Keypair,
    ledger: &MasterLedger,
    entity_id: Id,
    prior: Option<&OpKeyInfo>,
    seed: &[u8],
    taken: &[Id],
    ts: Timestamp,
) -> Result<Vec<Oplog>> {
    let master_log = ledger
        .head_log()
        .ok_or_else(|| Error::Validation("no master chain to authorize under".into()))?;

    let (key_id, material) = derive_op_key(seed, &entity_id, ts, taken)?;
    let mut create = Oplog::new(
        key_id,
        entity_id,
        Category::OpKey,
        OpCode::CreateOpKey,
        None,
        master_log,
        master.id(),
        ts,
        Some(material_extra(&material)),
    );
    create.sign_creator(master);
    create.sign_master(master);

    let mut logs = vec![create];
    if let Some(prior) = prior.filter(|p| p.core.status == Status::Alive) {
        let mut revoke = Oplog::new(
            prior.core.id,
            entity_id,
            Category::OpKey,
            OpCode::RevokeOpKey,
            prior.core.update_log_id,
            master_log,
            master.id(),
            ts,
            None,
        );
        revoke.sign_creator(master);
        revoke.sign_master(master);
        logs.push(revoke);
    }
    Ok(logs)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hex_decode(hex: &str) -> Option<[u8; 32]> {
    if hex.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let s = std::str::from_utf8(chunk).ok()?;
        out[i] = u8::from_str_radix(s, 16).ok()?;
    }
    Some(out)
}
