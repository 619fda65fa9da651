//! NaCl-box-style authenticated encryption used to seal and open signed
//! groups. Detached mode keeps the wire format's `nonce`/`tag`/`inner_bytes`
//! layout exactly as [`Value::SignedGroup`](crate::fact::Value::SignedGroup)
//! defines it: the tag lives outside the encrypted payload rather than
//! appended to it.

use crate::error::CryptoError;
use crypto_box::{
    aead::{generic_array::GenericArray, AeadInPlace},
    PublicKey, SalsaBox, SecretKey,
};
use rand_core::{OsRng, RngCore};
use wireguard_control::Key;

/// Wraps a local private key for sealing facts to, and opening facts from,
/// other peers. Cheap to construct; does no I/O.
pub struct Signer {
    secret: SecretKey,
    public: Key,
}

impl Signer {
    pub fn new(private_key: &Key) -> Self {
        let secret = SecretKey::from(private_key.0);
        let public = private_key.get_public();
        Signer { secret, public }
    }

    pub fn public_key(&self) -> &Key {
        &self.public
    }

    /// Encrypts `plaintext` in place for `recipient`. Returns the nonce and
    /// detached tag that, together with the now-ciphertext `plaintext`, form
    /// a complete `SignedGroup` value.
    pub fn seal_for(&self, recipient: &Key, plaintext: &mut [u8]) -> Result<([u8; 24], [u8; 16]), CryptoError> {
        let their_public = PublicKey::from(recipient.0);
        let salsa_box = SalsaBox::new(&their_public, &self.secret);

        let mut nonce_bytes = [0u8; 24];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = GenericArray::clone_from_slice(&nonce_bytes);

        let tag = salsa_box
            .encrypt_in_place_detached(&nonce, b"", plaintext)
            .map_err(|e| CryptoError::CryptoFailure(e.to_string()))?;

        let mut tag_bytes = [0u8; 16];
        tag_bytes.copy_from_slice(&tag);
        Ok((nonce_bytes, tag_bytes))
    }

    /// Opens a sealed payload from `sender` in place. Returns `Ok(false)`
    /// (buffer left untouched by intent, though AEAD failure may still
    /// scramble it) when the tag fails to verify; an `Err` means the
    /// primitive itself could not run, not that the message is forged.
    pub fn open_from(
        &self,
        sender: &Key,
        nonce: &[u8; 24],
        tag: &[u8; 16],
        ciphertext: &mut [u8],
    ) -> Result<bool, CryptoError> {
        let their_public = PublicKey::from(sender.0);
        let salsa_box = SalsaBox::new(&their_public, &self.secret);
        let nonce = GenericArray::clone_from_slice(nonce);
        let tag = GenericArray::clone_from_slice(tag);

        Ok(salsa_box
            .decrypt_in_place_detached(&nonce, b"", ciphertext, &tag)
            .is_ok())
    }
}
