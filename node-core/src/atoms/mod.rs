//! Atomic classification and bonding
//!
//! Raw payload bytes decompose into bit atoms; bit atoms bond into byte
//! atoms and byte atoms into KB/MB/GB/TB aggregates at a fixed 1024:1 ratio.
//! Every bit materializes one atom per particle family (24 per byte, 8 per
//! particle); the atom whose particle matches `bit_index mod 3` is the
//! canonical one the fission pipeline turns into a shard, the other two
//! exist in the bonded hierarchy and the frequency ledgers.

pub mod frequency;

use crate::types::{Address, Particle, Timestamp};
use frequency::{mean_frequency, FrequencySource};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use frequency::{bounce_rate, round2, BounceEntry, FREQ_MAX, FREQ_MIN};

/// Bit atoms bonded per particle at byte level.
pub const BITS_PER_PARTICLE: usize = 8;
/// Total bit atoms bonded into one byte atom.
pub const BITS_PER_BYTE_ATOM: usize = 24;
/// Children per aggregate above byte level.
pub const BOND_RATIO: usize = 1024;

#[derive(Error, Debug)]
pub enum AtomError {
    #[error("Insufficient atoms for bond: needed {needed}, got {got}")]
    InsufficientAtoms { needed: usize, got: usize },
    #[error("Atom hash mismatch at byte {byte_index} bit {bit_index}")]
    HashMismatch { byte_index: u64, bit_index: u8 },
    #[error("Bond violation: {0}")]
    BondViolation(String),
    #[error("Cannot classify an empty payload")]
    EmptyPayload,
}

/// Deterministic shard id for a bit atom's coordinates under an address.
pub fn shard_id_for(address: &str, particle: Particle, byte_index: u64, bit_index: u8) -> String {
    atomvault_pqc::sha256_hex(
        format!("shard:{address}:{particle}:{byte_index}:{bit_index}").as_bytes(),
    )
}

/// The smallest unit: one bit of payload under one particle family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitAtom {
    pub bit: u8,
    pub particle: Particle,
    pub frequency: f64,
    pub byte_index: u64,
    pub bit_index: u8,
    pub hash: String,
}

impl BitAtom {
    pub fn new(bit: u8, particle: Particle, byte_index: u64, bit_index: u8, frequency: f64) -> Self {
        let hash = Self::compute_hash(bit, particle, byte_index, bit_index);
        Self {
            bit,
            particle,
            frequency,
            byte_index,
            bit_index,
            hash,
        }
    }

    pub fn compute_hash(bit: u8, particle: Particle, byte_index: u64, bit_index: u8) -> String {
        atomvault_pqc::sha256_hex(format!("{bit}:{particle}:{byte_index}:{bit_index}").as_bytes())
    }

    /// True when this atom's particle is the canonical one for its position.
    pub fn is_canonical(&self) -> bool {
        self.particle == Particle::for_bit_index(self.bit_index)
    }

    pub fn weight(&self) -> u64 {
        1
    }
}

/// Recompute a bit atom's hash and compare.
pub fn validate_atom(atom: &BitAtom) -> Result<(), AtomError> {
    let expected = BitAtom::compute_hash(atom.bit, atom.particle, atom.byte_index, atom.bit_index);
    if expected != atom.hash {
        return Err(AtomError::HashMismatch {
            byte_index: atom.byte_index,
            bit_index: atom.bit_index,
        });
    }
    if atom.bit > 1 {
        return Err(AtomError::BondViolation(format!(
            "bit value {} out of range",
            atom.bit
        )));
    }
    Ok(())
}

/// Level of an aggregate atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateKind {
    Byte,
    Kilobyte,
    Megabyte,
    Gigabyte,
    Terabyte,
}

impl AggregateKind {
    /// The level bonded directly below this one, if any.
    pub fn child_kind(&self) -> Option<AggregateKind> {
        match self {
            AggregateKind::Byte => None,
            AggregateKind::Kilobyte => Some(AggregateKind::Byte),
            AggregateKind::Megabyte => Some(AggregateKind::Kilobyte),
            AggregateKind::Gigabyte => Some(AggregateKind::Megabyte),
            AggregateKind::Terabyte => Some(AggregateKind::Gigabyte),
        }
    }
}

/// Children of an aggregate: bit atoms at byte level, aggregates above.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AggregateChildren {
    Bits(Vec<BitAtom>),
    Aggregates(Vec<AggregateAtom>),
}

impl AggregateChildren {
    pub fn len(&self) -> usize {
        match self {
            AggregateChildren::Bits(v) => v.len(),
            AggregateChildren::Aggregates(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn frequencies(&self) -> Vec<f64> {
        match self {
            AggregateChildren::Bits(v) => v.iter().map(|a| a.frequency).collect(),
            AggregateChildren::Aggregates(v) => v.iter().map(|a| a.frequency).collect(),
        }
    }

    pub fn total_weight(&self) -> u64 {
        match self {
            AggregateChildren::Bits(v) => v.iter().map(BitAtom::weight).sum(),
            AggregateChildren::Aggregates(v) => v.iter().map(|a| a.atomic_weight).sum(),
        }
    }
}

/// A bonded aggregate: byte, KB, MB, GB or TB atom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateAtom {
    pub kind: AggregateKind,
    pub index: u64,
    pub timestamp: Timestamp,
    pub atomic_weight: u64,
    pub frequency: f64,
    pub children: AggregateChildren,
}

impl AggregateAtom {
    /// Bond the 24 bit atoms of one payload byte: 8 atoms per particle, in
    /// bit_index order, all sharing `byte_index`.
    pub fn bond_byte(byte_index: u64, bits: Vec<BitAtom>) -> Result<Self, AtomError> {
        if bits.len() != BITS_PER_BYTE_ATOM {
            return Err(AtomError::InsufficientAtoms {
                needed: BITS_PER_BYTE_ATOM,
                got: bits.len(),
            });
        }
        for particle in Particle::ALL {
            let of_particle: Vec<&BitAtom> =
                bits.iter().filter(|a| a.particle == particle).collect();
            if of_particle.len() != BITS_PER_PARTICLE {
                return Err(AtomError::BondViolation(format!(
                    "byte atom needs {BITS_PER_PARTICLE} {particle} atoms, got {}",
                    of_particle.len()
                )));
            }
            for (i, atom) in of_particle.iter().enumerate() {
                if atom.bit_index != i as u8 {
                    return Err(AtomError::BondViolation(format!(
                        "{particle} atoms out of bit_index order at position {i}"
                    )));
                }
            }
        }
        if bits.iter().any(|a| a.byte_index != byte_index) {
            return Err(AtomError::BondViolation(
                "bit atom bonded into foreign byte".into(),
            ));
        }

        let frequencies: Vec<f64> = bits.iter().map(|a| a.frequency).collect();
        let frequency = mean_frequency(&frequencies).expect("24 children");
        Ok(Self {
            kind: AggregateKind::Byte,
            index: byte_index,
            timestamp: crate::types::now_ts(),
            atomic_weight: bits.iter().map(BitAtom::weight).sum(),
            frequency,
            children: AggregateChildren::Bits(bits),
        })
    }

    /// Bond exactly [`BOND_RATIO`] aggregates of the level below into one
    /// atom of `kind`.
    pub fn bond(kind: AggregateKind, index: u64, children: Vec<AggregateAtom>) -> Result<Self, AtomError> {
        let child_kind = kind.child_kind().ok_or_else(|| {
            AtomError::BondViolation("byte atoms bond bit atoms, not aggregates".into())
        })?;
        if children.len() != BOND_RATIO {
            return Err(AtomError::InsufficientAtoms {
                needed: BOND_RATIO,
                got: children.len(),
            });
        }
        if let Some(wrong) = children.iter().find(|c| c.kind != child_kind) {
            return Err(AtomError::BondViolation(format!(
                "{kind:?} atom cannot bond a {:?} child",
                wrong.kind
            )));
        }

        let frequencies: Vec<f64> = children.iter().map(|c| c.frequency).collect();
        let frequency = mean_frequency(&frequencies).expect("1024 children");
        Ok(Self {
            kind,
            index,
            timestamp: crate::types::now_ts(),
            atomic_weight: children.iter().map(|c| c.atomic_weight).sum(),
            frequency,
            children: AggregateChildren::Aggregates(children),
        })
    }
}

/// Check an aggregate's bond: child count, particle composition at byte
/// level, weight sum and frequency derivation.
pub fn validate_bond(parent: &AggregateAtom) -> Result<(), AtomError> {
    match (&parent.kind, &parent.children) {
        (AggregateKind::Byte, AggregateChildren::Bits(bits)) => {
            if bits.len() != BITS_PER_BYTE_ATOM {
                return Err(AtomError::InsufficientAtoms {
                    needed: BITS_PER_BYTE_ATOM,
                    got: bits.len(),
                });
            }
            for particle in Particle::ALL {
                let count = bits.iter().filter(|a| a.particle == particle).count();
                if count != BITS_PER_PARTICLE {
                    return Err(AtomError::BondViolation(format!(
                        "byte atom holds {count} {particle} atoms"
                    )));
                }
            }
            for atom in bits {
                validate_atom(atom)?;
            }
        }
        (kind, AggregateChildren::Aggregates(children)) => {
            let expected = kind.child_kind().ok_or_else(|| {
                AtomError::BondViolation("byte atom holding aggregate children".into())
            })?;
            if children.len() != BOND_RATIO {
                return Err(AtomError::InsufficientAtoms {
                    needed: BOND_RATIO,
                    got: children.len(),
                });
            }
            if children.iter().any(|c| c.kind != expected) {
                return Err(AtomError::BondViolation("mixed child levels".into()));
            }
        }
        (_, AggregateChildren::Bits(_)) => {
            return Err(AtomError::BondViolation(
                "aggregate above byte holding bit atoms".into(),
            ));
        }
    }

    let expected_freq =
        mean_frequency(&parent.children.frequencies()).ok_or_else(|| AtomError::BondViolation(
            "aggregate with no children".into(),
        ))?;
    if (expected_freq - parent.frequency).abs() > 1e-9 {
        return Err(AtomError::BondViolation(format!(
            "frequency {} does not match derived {}",
            parent.frequency, expected_freq
        )));
    }
    if parent.children.total_weight() != parent.atomic_weight {
        return Err(AtomError::BondViolation(format!(
            "weight {} does not match child sum {}",
            parent.atomic_weight,
            parent.children.total_weight()
        )));
    }
    Ok(())
}

/// The bonded hierarchy of one classified payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtomHierarchy {
    pub address: Address,
    pub byte_atoms: Vec<AggregateAtom>,
    pub kilobyte_atoms: Vec<AggregateAtom>,
    pub megabyte_atoms: Vec<AggregateAtom>,
    pub gigabyte_atoms: Vec<AggregateAtom>,
    pub terabyte_atoms: Vec<AggregateAtom>,
}

impl AtomHierarchy {
    /// All bit atoms, in (byte_index, particle, bit_index) order.
    pub fn bit_atoms(&self) -> impl Iterator<Item = &BitAtom> {
        self.byte_atoms.iter().flat_map(|b| {
            let bits: &[BitAtom] = match &b.children {
                AggregateChildren::Bits(bits) => bits,
                AggregateChildren::Aggregates(_) => &[],
            };
            bits.iter()
        })
    }

    /// The canonical bit atoms (one per payload bit) that become shards.
    pub fn canonical_bits(&self) -> impl Iterator<Item = &BitAtom> {
        self.bit_atoms().filter(|a| a.is_canonical())
    }

    pub fn payload_len(&self) -> usize {
        self.byte_atoms.len()
    }
}

/// Decompose `payload` into the full atomic hierarchy under `address`.
///
/// Each payload byte yields 24 bit atoms (8 per particle, MSB first) bonded
/// into one byte atom; full groups of 1024 bond upward. Partial upper groups
/// are left unbonded at their own level.
pub fn classify(address: &Address, payload: &[u8]) -> Result<AtomHierarchy, AtomError> {
    if payload.is_empty() {
        return Err(AtomError::EmptyPayload);
    }
    let freq = FrequencySource::new(address.clone());

    let mut byte_atoms = Vec::with_capacity(payload.len());
    for (byte_index, byte) in payload.iter().enumerate() {
        let byte_index = byte_index as u64;
        let mut bits = Vec::with_capacity(BITS_PER_BYTE_ATOM);
        // Group by particle, bit_index ascending: the layout bond_byte checks
        for particle in Particle::ALL {
            for bit_index in 0..BITS_PER_PARTICLE as u8 {
                let bit = (byte >> (7 - bit_index)) & 1;
                let shard_id = shard_id_for(address, particle, byte_index, bit_index);
                let frequency = freq.for_shard(&shard_id);
                bits.push(BitAtom::new(bit, particle, byte_index, bit_index, frequency));
            }
        }
        byte_atoms.push(AggregateAtom::bond_byte(byte_index, bits)?);
    }

    let kilobyte_atoms = bond_full_groups(AggregateKind::Kilobyte, &byte_atoms)?;
    let megabyte_atoms = bond_full_groups(AggregateKind::Megabyte, &kilobyte_atoms)?;
    let gigabyte_atoms = bond_full_groups(AggregateKind::Gigabyte, &megabyte_atoms)?;
    let terabyte_atoms = bond_full_groups(AggregateKind::Terabyte, &gigabyte_atoms)?;

    Ok(AtomHierarchy {
        address: address.clone(),
        byte_atoms,
        kilobyte_atoms,
        megabyte_atoms,
        gigabyte_atoms,
        terabyte_atoms,
    })
}

fn bond_full_groups(
    kind: AggregateKind,
    children: &[AggregateAtom],
) -> Result<Vec<AggregateAtom>, AtomError> {
    let mut out = Vec::new();
    for (index, group) in children.chunks_exact(BOND_RATIO).enumerate() {
        out.push(AggregateAtom::bond(kind, index as u64, group.to_vec())?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_address() -> Address {
        "atm1000102030405060708090a0b0c0d0e0f10111213".to_string()
    }

    #[test]
    fn test_classify_counts() {
        let hierarchy = classify(&test_address(), b"hi").unwrap();
        assert_eq!(hierarchy.byte_atoms.len(), 2);
        assert_eq!(hierarchy.bit_atoms().count(), 48);
        assert_eq!(hierarchy.canonical_bits().count(), 16);
        assert!(hierarchy.kilobyte_atoms.is_empty());
    }

    #[test]
    fn test_classify_is_deterministic() {
        let a = classify(&test_address(), &[0xAB, 0xCD]).unwrap();
        let b = classify(&test_address(), &[0xAB, 0xCD]).unwrap();
        let fa: Vec<f64> = a.bit_atoms().map(|x| x.frequency).collect();
        let fb: Vec<f64> = b.bit_atoms().map(|x| x.frequency).collect();
        assert_eq!(fa, fb);
    }

    #[test]
    fn test_classify_empty_rejected() {
        assert!(matches!(
            classify(&test_address(), b""),
            Err(AtomError::EmptyPayload)
        ));
    }

    #[test]
    fn test_bits_reconstruct_byte() {
        let hierarchy = classify(&test_address(), &[0b1010_0110]).unwrap();
        let mut byte = 0u8;
        for atom in hierarchy.canonical_bits() {
            byte |= atom.bit << (7 - atom.bit_index);
        }
        assert_eq!(byte, 0b1010_0110);
    }

    #[test]
    fn test_byte_bond_is_valid() {
        let hierarchy = classify(&test_address(), b"x").unwrap();
        let byte_atom = &hierarchy.byte_atoms[0];
        validate_bond(byte_atom).unwrap();
        assert_eq!(byte_atom.atomic_weight, 24);

        let frequencies = byte_atom.children.frequencies();
        assert_eq!(
            byte_atom.frequency,
            mean_frequency(&frequencies).unwrap()
        );
    }

    #[test]
    fn test_tampered_atom_detected() {
        let hierarchy = classify(&test_address(), b"x").unwrap();
        let mut atom = hierarchy.bit_atoms().next().unwrap().clone();
        atom.bit ^= 1;
        assert!(validate_atom(&atom).is_err());
    }

    #[test]
    fn test_bond_requires_exact_ratio() {
        let hierarchy = classify(&test_address(), b"ab").unwrap();
        let result = AggregateAtom::bond(
            AggregateKind::Kilobyte,
            0,
            hierarchy.byte_atoms.clone(),
        );
        assert!(matches!(
            result,
            Err(AtomError::InsufficientAtoms { needed: 1024, got: 2 })
        ));
    }

    #[test]
    fn test_bond_byte_rejects_short_set() {
        let bits: Vec<BitAtom> = (0..8u8)
            .map(|i| BitAtom::new(0, Particle::for_bit_index(i), 0, i, 10.0))
            .collect();
        assert!(matches!(
            AggregateAtom::bond_byte(0, bits),
            Err(AtomError::InsufficientAtoms { .. })
        ));
    }
}
