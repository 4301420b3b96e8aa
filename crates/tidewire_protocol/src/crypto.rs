//! Authenticated encryption and signing primitives.
//!
//! - packets are sealed with ChaCha20-Poly1305, using the packet sequence
//!   number as the nonce
//! - the secret section of a connect token is sealed with XChaCha20-Poly1305,
//!   using a random nonce
//! - connect tokens are signed with Ed25519

use {
    chacha20poly1305::{
        ChaCha20Poly1305, Key, KeyInit, Nonce, Tag, XChaCha20Poly1305, XNonce,
        aead::AeadInPlace,
    },
    core::fmt,
    derive_more::{Display, Error},
    ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey},
    rand::{RngCore, rngs::OsRng},
    sha2::{Digest, Sha512},
};

/// Length of a [`SymmetricKey`].
pub const KEY_SIZE: usize = 32;

/// Length of the authentication tag appended to sealed data.
pub const TAG_SIZE: usize = 16;

/// Length of an XChaCha20-Poly1305 nonce.
pub const XNONCE_SIZE: usize = 24;

/// Length of an Ed25519 signature.
pub const SIGNATURE_SIZE: usize = 64;

const TOKEN_KEY_CONTEXT: &[u8] = b"tidewire connect token key";

/// Sealed data failed authentication, or a signature did not verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
#[display("authentication failed")]
pub struct CryptoError;

/// Key for sealing and opening data with ChaCha20-Poly1305.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    /// Generates a random key from the OS random number generator.
    #[must_use]
    pub fn generate() -> Self {
        let mut key = [0; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Creates a key from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Gets the raw bytes of this key.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Secret key used to sign connect tokens, shared between the token issuer
/// and the servers.
#[derive(Clone)]
pub struct SecretKey(SigningKey);

/// Public half of a [`SecretKey`], used to verify connect token signatures.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

/// Generates a random signing key pair.
#[must_use]
pub fn sign_keygen() -> (PublicKey, SecretKey) {
    let secret = SecretKey(SigningKey::generate(&mut OsRng));
    (secret.public_key(), secret)
}

impl SecretKey {
    /// Creates a key from its 32-byte seed.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; KEY_SIZE]) -> Self {
        Self(SigningKey::from_bytes(bytes))
    }

    /// Gets the 32-byte seed of this key.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; KEY_SIZE] {
        self.0.to_bytes()
    }

    /// Gets the public half of this key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }

    /// Signs `msg`.
    #[must_use]
    pub fn sign(&self, msg: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.0.sign(msg).to_bytes()
    }

    /// Derives the key which seals the secret section of connect tokens.
    pub(crate) fn token_key(&self) -> SymmetricKey {
        let hash = Sha512::new()
            .chain_update(TOKEN_KEY_CONTEXT)
            .chain_update(self.0.to_bytes())
            .finalize();
        let mut key = [0; KEY_SIZE];
        key.copy_from_slice(&hash[..KEY_SIZE]);
        SymmetricKey(key)
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("SecretKey").field(&self.public_key()).finish()
    }
}

impl PublicKey {
    /// Creates a key from its 32-byte encoding.
    ///
    /// # Errors
    ///
    /// Errors if the bytes are not a valid Ed25519 public key.
    pub fn from_bytes(bytes: &[u8; KEY_SIZE]) -> Result<Self, CryptoError> {
        VerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|_| CryptoError)
    }

    /// Gets the 32-byte encoding of this key.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; KEY_SIZE] {
        self.0.to_bytes()
    }

    /// Checks that `signature` is a valid signature of `msg` by the secret
    /// half of this key.
    ///
    /// # Errors
    ///
    /// Errors if the signature does not verify.
    pub fn verify(&self, msg: &[u8], signature: &[u8; SIGNATURE_SIZE]) -> Result<(), CryptoError> {
        self.0
            .verify_strict(msg, &Signature::from_bytes(signature))
            .map_err(|_| CryptoError)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PublicKey(")?;
        for byte in &self.0.to_bytes()[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

fn nonce(seq: u64) -> [u8; 12] {
    let mut nonce = [0; 12];
    nonce[4..].copy_from_slice(&seq.to_be_bytes());
    nonce
}

fn to_tag(tag: &Tag) -> [u8; TAG_SIZE] {
    let mut out = [0; TAG_SIZE];
    out.copy_from_slice(tag);
    out
}

/// Encrypts `buf` in place with ChaCha20-Poly1305, authenticating it along
/// with `ad`, and returns the tag.
///
/// The nonce is 4 zero bytes followed by `seq` in big-endian, so `seq` must
/// never be reused with the same key.
///
/// # Errors
///
/// Errors if `buf` is too large to encrypt.
pub fn seal(
    key: &SymmetricKey,
    seq: u64,
    ad: &[u8],
    buf: &mut [u8],
) -> Result<[u8; TAG_SIZE], CryptoError> {
    ChaCha20Poly1305::new(Key::from_slice(&key.0))
        .encrypt_in_place_detached(Nonce::from_slice(&nonce(seq)), ad, buf)
        .map(|tag| to_tag(&tag))
        .map_err(|_| CryptoError)
}

/// Reverses [`seal`], decrypting `buf` in place.
///
/// # Errors
///
/// Errors if the data, `ad`, or `tag` were tampered with, or a different key
/// or nonce was used. `buf` is left in an unspecified state in this case.
pub fn open(
    key: &SymmetricKey,
    seq: u64,
    ad: &[u8],
    buf: &mut [u8],
    tag: &[u8; TAG_SIZE],
) -> Result<(), CryptoError> {
    ChaCha20Poly1305::new(Key::from_slice(&key.0))
        .decrypt_in_place_detached(Nonce::from_slice(&nonce(seq)), ad, buf, Tag::from_slice(tag))
        .map_err(|_| CryptoError)
}

/// Like [`seal`], but with XChaCha20-Poly1305 and a caller-provided 24-byte
/// nonce, which can safely be random.
///
/// # Errors
///
/// Errors if `buf` is too large to encrypt.
pub fn seal_x(
    key: &SymmetricKey,
    nonce: &[u8; XNONCE_SIZE],
    ad: &[u8],
    buf: &mut [u8],
) -> Result<[u8; TAG_SIZE], CryptoError> {
    XChaCha20Poly1305::new(Key::from_slice(&key.0))
        .encrypt_in_place_detached(XNonce::from_slice(nonce), ad, buf)
        .map(|tag| to_tag(&tag))
        .map_err(|_| CryptoError)
}

/// Reverses [`seal_x`], decrypting `buf` in place.
///
/// # Errors
///
/// See [`open`].
pub fn open_x(
    key: &SymmetricKey,
    nonce: &[u8; XNONCE_SIZE],
    ad: &[u8],
    buf: &mut [u8],
    tag: &[u8; TAG_SIZE],
) -> Result<(), CryptoError> {
    XChaCha20Poly1305::new(Key::from_slice(&key.0))
        .decrypt_in_place_detached(XNonce::from_slice(nonce), ad, buf, Tag::from_slice(tag))
        .map_err(|_| CryptoError)
}

/// Fills `buf` with bytes from the OS random number generator.
pub fn random_bytes(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

#[cfg(test)]
mod tests {
    #![expect(clippy::unwrap_used, reason = "testing")]

    use super::*;

    #[test]
    fn seal_open() {
        let key = SymmetricKey::generate();
        let mut buf = *b"hello world";
        let tag = seal(&key, 5, b"ad", &mut buf).unwrap();
        assert_ne!(b"hello world", &buf);

        open(&key, 5, b"ad", &mut buf, &tag).unwrap();
        assert_eq!(b"hello world", &buf);
    }

    #[test]
    fn open_rejects_wrong_inputs() {
        let key = SymmetricKey::generate();
        let sealed = {
            let mut buf = *b"secret";
            let tag = seal(&key, 1, b"ad", &mut buf).unwrap();
            (buf, tag)
        };

        let attempt = |key: &SymmetricKey, seq, ad: &[u8]| {
            let (mut buf, tag) = sealed;
            open(key, seq, ad, &mut buf, &tag)
        };
        assert_eq!(Ok(()), attempt(&key, 1, b"ad"));
        assert_eq!(Err(CryptoError), attempt(&key, 2, b"ad"));
        assert_eq!(Err(CryptoError), attempt(&key, 1, b"da"));
        assert_eq!(Err(CryptoError), attempt(&SymmetricKey::generate(), 1, b"ad"));
    }

    #[test]
    fn seal_open_x() {
        let key = SymmetricKey::generate();
        let mut nonce = [0; XNONCE_SIZE];
        random_bytes(&mut nonce);
        let mut buf = [7; 64];
        let tag = seal_x(&key, &nonce, &[], &mut buf).unwrap();
        open_x(&key, &nonce, &[], &mut buf, &tag).unwrap();
        assert_eq!([7; 64], buf);
    }

    #[test]
    fn sign_verify() {
        let (public, secret) = sign_keygen();
        let signature = secret.sign(b"token");
        public.verify(b"token", &signature).unwrap();
        assert_eq!(Err(CryptoError), public.verify(b"tokem", &signature));

        let (other, _) = sign_keygen();
        assert_eq!(Err(CryptoError), other.verify(b"token", &signature));
    }

    #[test]
    fn token_key_is_deterministic() {
        let secret = SecretKey::from_bytes(&[3; KEY_SIZE]);
        let again = SecretKey::from_bytes(&secret.to_bytes());
        assert_eq!(secret.token_key(), again.token_key());
        assert_ne!(
            secret.token_key(),
            SecretKey::from_bytes(&[4; KEY_SIZE]).token_key()
        );
    }
}
