//! Grumpkin keys for voters and the coordinator.
//!
//! Grumpkin's base field is the BN256 scalar field, so a public key is a
//! pair of `Fr` coordinates and fits directly into Poseidon inputs and
//! message payloads. Private keys are 32 opaque bytes reduced into the
//! curve's scalar field on use; the bytes are zeroized on drop.

use std::fmt;

use anyhow::{anyhow, ensure, Context, Result};
use group::{prime::PrimeCurveAffine, Curve, Group};
use halo2curves_axiom::{
    ff::{Field, PrimeField},
    grumpkin::{Fr as Scalar, G1Affine, G1},
    CurveAffine,
};
use rand::{CryptoRng, RngCore};
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{fr_from_bytes, fr_to_bytes, fr_to_u128, hash5, reduce_be_bytes, Fr};

pub const PRIV_KEY_PREFIX: &str = "macisk.";
pub const PUB_KEY_PREFIX: &str = "macipk.";

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivKey {
    raw: [u8; 32],
}

#[derive(Clone, Copy)]
pub struct PubKey {
    point: G1Affine,
}

#[derive(Clone)]
pub struct Keypair {
    pub priv_key: PrivKey,
    pub pub_key: PubKey,
}

/// ECDH output: the affine coordinates of `sk * other_pk`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SharedKey {
    pub x: Fr,
    pub y: Fr,
}

/// Schnorr signature over a single field element.
///
/// `s` lives in the Grumpkin scalar field, which is wider than `Fr`, so it
/// is carried as two 128-bit limbs when embedded in a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature {
    pub r: (Fr, Fr),
    pub s_lo: Fr,
    pub s_hi: Fr,
}

impl PrivKey {
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut raw = [0u8; 32];
        rng.fill_bytes(&mut raw);
        Self { raw }
    }

    pub fn from_bytes(raw: [u8; 32]) -> Self {
        Self { raw }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.raw
    }

    pub fn scalar(&self) -> Scalar {
        reduce_be_bytes(&self.raw)
    }

    pub fn serialize(&self) -> Zeroizing<String> {
        Zeroizing::new(format!("{}{}", PRIV_KEY_PREFIX, hex::encode(self.raw)))
    }

    pub fn deserialize(encoded: &str) -> Result<Self> {
        let body = encoded
            .trim()
            .strip_prefix(PRIV_KEY_PREFIX)
            .ok_or_else(|| anyhow!("private key must start with '{}'", PRIV_KEY_PREFIX))?;
        let decoded = Zeroizing::new(hex::decode(body).context("private key is not valid hex")?);
        ensure!(
            decoded.len() == 32,
            "private key must be 32 bytes, got {}",
            decoded.len()
        );
        let mut raw = [0u8; 32];
        raw.copy_from_slice(&decoded);
        Ok(Self { raw })
    }

    pub fn public_key(&self) -> PubKey {
        PubKey {
            point: (G1::generator() * self.scalar()).to_affine(),
        }
    }

    pub fn shared_key(&self, other: &PubKey) -> SharedKey {
        let point = (G1::from(other.point) * self.scalar()).to_affine();
        let (x, y) = affine_xy(&point);
        SharedKey { x, y }
    }

    pub fn sign(&self, message: Fr) -> Signature {
        let sk = self.scalar();
        let pk = self.public_key();

        let mut nonce_input = Zeroizing::new([0u8; 64]);
        nonce_input[..32].copy_from_slice(&self.raw);
        nonce_input[32..].copy_from_slice(&fr_to_bytes(&message));
        let nonce_digest = blake3::hash(nonce_input.as_ref());
        let k: Scalar = reduce_be_bytes(nonce_digest.as_bytes());

        let r_point = (G1::generator() * k).to_affine();
        let r = affine_xy(&r_point);
        let e = challenge(r, &pk, message);
        let s = k + e * sk;

        let (s_lo, s_hi) = split_scalar(&s);
        Signature { r, s_lo, s_hi }
    }
}

impl fmt::Debug for PrivKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivKey(<redacted>)")
    }
}

impl PubKey {
    pub fn from_xy(x: Fr, y: Fr) -> Result<Self> {
        let point = G1Affine::from_xy(x, y)
            .into_option()
            .ok_or_else(|| anyhow!("public key is not a point on the curve"))?;
        ensure!(
            !bool::from(point.is_identity()),
            "public key is the point at infinity"
        );
        Ok(Self { point })
    }

    pub fn xy(&self) -> (Fr, Fr) {
        affine_xy(&self.point)
    }

    pub fn x(&self) -> Fr {
        self.xy().0
    }

    pub fn y(&self) -> Fr {
        self.xy().1
    }

    pub fn hash(&self) -> Fr {
        let (x, y) = self.xy();
        crate::hash2(x, y)
    }

    pub fn serialize(&self) -> String {
        let (x, y) = self.xy();
        let mut bytes = Vec::with_capacity(64);
        bytes.extend_from_slice(&fr_to_bytes(&x));
        bytes.extend_from_slice(&fr_to_bytes(&y));
        format!("{}{}", PUB_KEY_PREFIX, hex::encode(bytes))
    }

    pub fn deserialize(encoded: &str) -> Result<Self> {
        let body = encoded
            .trim()
            .strip_prefix(PUB_KEY_PREFIX)
            .ok_or_else(|| anyhow!("public key must start with '{}'", PUB_KEY_PREFIX))?;
        let bytes = hex::decode(body).context("public key is not valid hex")?;
        ensure!(
            bytes.len() == 64,
            "public key must be 64 bytes, got {}",
            bytes.len()
        );
        let mut x = [0u8; 32];
        let mut y = [0u8; 32];
        x.copy_from_slice(&bytes[..32]);
        y.copy_from_slice(&bytes[32..]);
        Self::from_xy(fr_from_bytes(&x)?, fr_from_bytes(&y)?)
    }

    pub fn verify(&self, message: Fr, signature: &Signature) -> bool {
        let Ok(s) = join_scalar(signature.s_lo, signature.s_hi) else {
            return false;
        };
        let Some(r_point) = G1Affine::from_xy(signature.r.0, signature.r.1).into_option() else {
            return false;
        };
        let e = challenge(signature.r, self, message);
        let lhs = G1::generator() * s;
        let rhs = G1::from(r_point) + G1::from(self.point) * e;
        lhs == rhs
    }
}

impl PartialEq for PubKey {
    fn eq(&self, other: &Self) -> bool {
        self.xy() == other.xy()
    }
}

impl Eq for PubKey {}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({})", self.serialize())
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

impl Serialize for PubKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&PubKey::serialize(self))
    }
}

impl<'de> Deserialize<'de> for PubKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        PubKey::deserialize(&raw).map_err(D::Error::custom)
    }
}

impl Keypair {
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self::from_priv(PrivKey::random(rng))
    }

    pub fn from_priv(priv_key: PrivKey) -> Self {
        let pub_key = priv_key.public_key();
        Self { priv_key, pub_key }
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("pub_key", &self.pub_key)
            .finish_non_exhaustive()
    }
}

fn affine_xy(point: &G1Affine) -> (Fr, Fr) {
    // The identity has no affine coordinates; it maps to (0, 0).
    point
        .coordinates()
        .into_option()
        .map(|c| (*c.x(), *c.y()))
        .unwrap_or((Fr::ZERO, Fr::ZERO))
}

fn challenge(r: (Fr, Fr), pk: &PubKey, message: Fr) -> Scalar {
    let (px, py) = pk.xy();
    let digest = hash5([r.0, r.1, px, py, message]);
    reduce_be_bytes(&crate::fr_to_be_bytes(&digest))
}

fn split_scalar(s: &Scalar) -> (Fr, Fr) {
    let repr = s.to_repr();
    let bytes = repr.as_ref();
    let mut lo = [0u8; 16];
    let mut hi = [0u8; 16];
    lo.copy_from_slice(&bytes[..16]);
    hi.copy_from_slice(&bytes[16..32]);
    (
        Fr::from_u128(u128::from_le_bytes(lo)),
        Fr::from_u128(u128::from_le_bytes(hi)),
    )
}

fn join_scalar(lo: Fr, hi: Fr) -> Result<Scalar> {
    let lo = fr_to_u128(&lo)?;
    let hi = fr_to_u128(&hi)?;
    let mut repr = <Scalar as PrimeField>::Repr::default();
    repr.as_mut()[..16].copy_from_slice(&lo.to_le_bytes());
    repr.as_mut()[16..32].copy_from_slice(&hi.to_le_bytes());
    Scalar::from_repr(repr)
        .into_option()
        .ok_or_else(|| anyhow!("signature scalar out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn private_key_round_trips_through_text() {
        let mut rng = StdRng::seed_from_u64(7);
        let key = PrivKey::random(&mut rng);
        let encoded = key.serialize();
        assert!(encoded.starts_with(PRIV_KEY_PREFIX));
        let decoded = PrivKey::deserialize(&encoded).unwrap();
        assert_eq!(decoded.as_bytes(), key.as_bytes());
        assert!(PrivKey::deserialize("macisk.zz").is_err());
        assert!(PrivKey::deserialize("deadbeef").is_err());
    }

    #[test]
    fn public_key_round_trips_and_is_on_curve() {
        let mut rng = StdRng::seed_from_u64(8);
        let pair = Keypair::random(&mut rng);
        let encoded = pair.pub_key.serialize();
        assert_eq!(PubKey::deserialize(&encoded).unwrap(), pair.pub_key);
        assert!(PubKey::from_xy(Fr::from(1u64), Fr::from(1u64)).is_err());
    }

    #[test]
    fn ecdh_is_symmetric() {
        let mut rng = StdRng::seed_from_u64(9);
        let alice = Keypair::random(&mut rng);
        let bob = Keypair::random(&mut rng);
        assert_eq!(
            alice.priv_key.shared_key(&bob.pub_key),
            bob.priv_key.shared_key(&alice.pub_key)
        );
    }

    #[test]
    fn signatures_verify_only_for_signer_and_message() {
        let mut rng = StdRng::seed_from_u64(10);
        let signer = Keypair::random(&mut rng);
        let other = Keypair::random(&mut rng);
        let message = Fr::from(123_456u64);
        let signature = signer.priv_key.sign(message);
        assert!(signer.pub_key.verify(message, &signature));
        assert!(!signer.pub_key.verify(message + Fr::ONE, &signature));
        assert!(!other.pub_key.verify(message, &signature));
    }

    #[test]
    fn debug_output_hides_private_key() {
        let key = PrivKey::from_bytes([0xab; 32]);
        assert_eq!(format!("{:?}", key), "PrivKey(<redacted>)");
    }
}
