//! Canonical fingerprinting of pipe invocations.
//!
//! A fingerprint is a Sha256 digest over the pipe identity and the
//! normalized arguments. It is the sole deduplication key: two calls with
//! equal fingerprints are the same work. Graph references are resolved by
//! the caller into [`FingerprintAtom`]s first so this module needs no
//! access to storage: a resource contributes the fingerprint of its
//! producing task plus its output ordinal, a file resource contributes its
//! recorded md5 (never its path).

use sha2::{Digest, Sha256};

use crate::entity::PipeIdentity;
use crate::value::Value;

/// One bound argument, resolved to its fingerprint-relevant content.
#[derive(Debug, Clone, PartialEq)]
pub enum FingerprintAtom {
    /// A literal value, hashed by canonical encoding.
    Value(Value),
    /// A resource, hashed by provenance: who produced it and at which
    /// output position.
    TaskOutput { fingerprint: String, ordinal: u32 },
    /// A file resource, hashed by its content digest at registration.
    FileDigest(String),
}

/// Digest the invocation `(identity, atoms)` to a hex fingerprint.
pub fn fingerprint(identity: &PipeIdentity, atoms: &[FingerprintAtom]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"pipe\0");
    hasher.update(identity.canonical().as_bytes());
    for atom in atoms {
        match atom {
            FingerprintAtom::Value(value) => {
                hasher.update(b"\0val\0");
                hasher.update(value.canonical_bytes());
            }
            FingerprintAtom::TaskOutput {
                fingerprint,
                ordinal,
            } => {
                hasher.update(b"\0out\0");
                hasher.update(fingerprint.as_bytes());
                hasher.update(ordinal.to_le_bytes());
            }
            FingerprintAtom::FileDigest(md5) => {
                hasher.update(b"\0file\0");
                hasher.update(md5.as_bytes());
            }
        }
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident() -> PipeIdentity {
        PipeIdentity::named("stats", "normalize")
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let atoms = vec![
            FingerprintAtom::Value(Value::Int(1)),
            FingerprintAtom::FileDigest("d41d8cd98f00b204e9800998ecf8427e".into()),
        ];
        assert_eq!(fingerprint(&ident(), &atoms), fingerprint(&ident(), &atoms));
    }

    #[test]
    fn test_fingerprint_depends_on_identity() {
        let atoms = [FingerprintAtom::Value(Value::Int(1))];
        let other = PipeIdentity::named("stats", "denormalize");
        assert_ne!(fingerprint(&ident(), &atoms), fingerprint(&other, &atoms));
    }

    #[test]
    fn test_fingerprint_depends_on_argument_order() {
        let ab = [
            FingerprintAtom::Value(Value::Int(1)),
            FingerprintAtom::Value(Value::Int(2)),
        ];
        let ba = [
            FingerprintAtom::Value(Value::Int(2)),
            FingerprintAtom::Value(Value::Int(1)),
        ];
        assert_ne!(fingerprint(&ident(), &ab), fingerprint(&ident(), &ba));
    }

    #[test]
    fn test_resource_atom_uses_provenance_not_value() {
        // The same ordinal under different producing fingerprints differs.
        let from_a = [FingerprintAtom::TaskOutput {
            fingerprint: "aaaa".into(),
            ordinal: 0,
        }];
        let from_b = [FingerprintAtom::TaskOutput {
            fingerprint: "bbbb".into(),
            ordinal: 0,
        }];
        assert_ne!(fingerprint(&ident(), &from_a), fingerprint(&ident(), &from_b));
    }
}
