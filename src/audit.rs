//! Exportable audit snapshot.
//!
//! Pure aggregation over the current tip, the latest anchor and a freshly
//! computed Merkle root. The `seal` is a SHA-256 digest of the serialized
//! body so a downloaded proof can be checked for accidental or casual edits.
//! It is not a signature.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::anchor::Anchor;
use crate::error::LedgerError;
use crate::ledger::{current_timestamp, Ledger, Tip};
use crate::merkle::sha256_hex;

pub const AUDIT_PROOF_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditProofBody {
    pub version: u32,
    pub generated_at: String,
    pub block_count: u64,
    pub tip: Option<Tip>,
    pub latest_anchor: Option<Anchor>,
    pub current_merkle_root: Option<String>,
    pub merkle_window: usize,
    pub merkle_block_count: Option<u64>,
    /// `None` unless both the anchor root and the current root exist.
    pub merkle_roots_match: Option<bool>,
    pub chain_valid: bool,
}

impl AuditProofBody {
    fn digest(&self) -> Result<String, LedgerError> {
        let encoded = serde_json::to_string(self)?;
        Ok(sha256_hex(encoded.as_bytes()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditProof {
    #[serde(flatten)]
    pub body: AuditProofBody,
    pub seal: String,
}

impl AuditProof {
    pub fn seal(body: AuditProofBody) -> Result<Self, LedgerError> {
        let seal = body.digest()?;
        Ok(AuditProof { body, seal })
    }

    /// Recomputes the seal over the body.
    pub fn verify_seal(&self) -> bool {
        matches!(self.body.digest(), Ok(digest) if digest == self.seal)
    }

    pub fn to_json_pretty(&self) -> Result<String, LedgerError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, LedgerError> {
        Ok(serde_json::from_str(json)?)
    }
}

impl Ledger {
    /// Builds an audit proof. Reads only; an empty ledger yields a proof with
    /// no tip and no Merkle root. The chain check and the Merkle root both
    /// stop at the tip read here, so concurrent appends cannot skew them.
    pub fn generate_audit_proof(&self) -> Result<AuditProof, LedgerError> {
        let _guard = self.maintenance.read();
        // Anchor first: whatever it covers is at or below the tip read next.
        let latest_anchor = self.latest_anchor()?;
        let tip = self.tip()?;

        let (chain, (current_merkle_root, merkle_block_count)) = match &tip {
            Some(tip) => (
                self.verify_chain_through(tip.current_index)?,
                self.merkle_snapshot(tip.current_index)?,
            ),
            None => (self.verify_chain()?, (None, None)),
        };

        let merkle_roots_match = match (
            latest_anchor.as_ref().and_then(|a| a.merkle_root.as_deref()),
            current_merkle_root.as_deref(),
        ) {
            (Some(anchored), Some(current)) => Some(anchored == current),
            _ => None,
        };

        let proof = AuditProof::seal(AuditProofBody {
            version: AUDIT_PROOF_VERSION,
            generated_at: current_timestamp(),
            block_count: chain.block_count,
            tip,
            latest_anchor,
            current_merkle_root,
            merkle_window: self.settings().merkle_window,
            merkle_block_count,
            merkle_roots_match,
            chain_valid: chain.valid,
        })?;

        info!(
            block_count = proof.body.block_count,
            merkle_roots_match = ?proof.body.merkle_roots_match,
            seal = %proof.seal,
            "ledger.audit_proof"
        );
        Ok(proof)
    }
}
