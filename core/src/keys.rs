//! Keys objects and the encrypted secret-key files next to them.
//!
//! A `Keys` object is a versioned object carrying an owner's public
//! encryption and sign keys. The matching secrets live outside the
//! addressable object space, in the private area under names derived from
//! the Keys object's hash. Each payload is sealed with a zero nonce under a
//! key that encrypts exactly one message: a fresh random file key per
//! write, itself wrapped under the master key with a random nonce.

use crate::error::{Error, Result};
use crate::hash::{Hash, IdHash};
use crate::recipe::{ItemType, Recipe, RecipeRule};
use crate::store::{Area, Db};
use crate::value::{Link, Obj, Value};
use chacha20poly1305::aead::{Aead, NewAead};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{PublicKey, SecretKey, Signature, Signer, Verifier};

pub const KEYS_TYPE: &str = "Keys";

/// Recipe of the versioned `Keys` object; registered at init.
pub fn keys_recipe() -> Recipe {
    Recipe::new(
        KEYS_TYPE,
        vec![
            RecipeRule::new("owner", ItemType::ReferenceToId {
                allowed: ["*".to_string()].into_iter().collect(),
            })
            .id(),
            RecipeRule::new("publicKey", ItemType::String {
                regexp: Some("^[0-9a-f]{64}$".into()),
            }),
            RecipeRule::new("publicSignKey", ItemType::String {
                regexp: Some("^[0-9a-f]{64}$".into()),
            }),
        ],
    )
}

/// Builds a `Keys` object for an owner.
pub fn keys_object(owner: IdHash, public_key: &[u8; 32], public_sign_key: &[u8; 32]) -> Obj {
    Obj::new(KEYS_TYPE)
        .with("owner", Value::Reference(Link::Id(owner)))
        .with("publicKey", Value::String(hex::encode(public_key)))
        .with("publicSignKey", Value::String(hex::encode(public_sign_key)))
}

/// An ed25519 signing keypair, stored as its 32-byte seed.
#[derive(Clone, Copy)]
pub struct Keypair([u8; 32]);

impl Keypair {
    pub fn generate() -> Self {
        let mut secret = [0; 32];
        getrandom::getrandom(&mut secret).expect("system rng");
        Self(secret)
    }

    pub fn from_bytes(secret: [u8; 32]) -> Self {
        Self(secret)
    }

    fn to_keypair(self) -> ed25519_dalek::Keypair {
        let secret = SecretKey::from_bytes(&self.0).expect("32-byte seed");
        let public = PublicKey::from(&secret);
        ed25519_dalek::Keypair { secret, public }
    }

    pub fn public(&self) -> [u8; 32] {
        self.to_keypair().public.to_bytes()
    }

    pub fn secret(&self) -> [u8; 32] {
        self.0
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.to_keypair().sign(message).to_bytes()
    }
}

pub fn verify(public: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> bool {
    let Ok(public) = PublicKey::from_bytes(public) else {
        return false;
    };
    let signature = Signature::from(*signature);
    public.verify(message, &signature).is_ok()
}

/// The symmetric master key handed over by the keychain collaborator.
#[derive(Clone, Copy)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    pub fn generate() -> Self {
        let mut key = [0; 32];
        getrandom::getrandom(&mut key).expect("system rng");
        Self(key)
    }

    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self(key)
    }
}

const ZERO_NONCE: [u8; 12] = [0; 12];
const WRAP_NONCE_LEN: usize = 12;
const WRAPPED_KEY_LEN: usize = 32 + 16;

fn seal(master: &MasterKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut file_key = [0; 32];
    getrandom::getrandom(&mut file_key).map_err(|e| Error::internal(e.to_string()))?;
    let mut wrap_nonce = [0; WRAP_NONCE_LEN];
    getrandom::getrandom(&mut wrap_nonce).map_err(|e| Error::internal(e.to_string()))?;

    let wrapped = ChaCha20Poly1305::new(Key::from_slice(&master.0))
        .encrypt(Nonce::from_slice(&wrap_nonce), file_key.as_ref())
        .map_err(|_| Error::internal("key wrap failed"))?;
    // the file key seals exactly this one message
    let sealed = ChaCha20Poly1305::new(Key::from_slice(&file_key))
        .encrypt(Nonce::from_slice(&ZERO_NONCE), plaintext)
        .map_err(|_| Error::internal("seal failed"))?;

    let mut out = Vec::with_capacity(WRAP_NONCE_LEN + wrapped.len() + sealed.len());
    out.extend_from_slice(&wrap_nonce);
    out.extend_from_slice(&wrapped);
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn open(master: &MasterKey, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < WRAP_NONCE_LEN + WRAPPED_KEY_LEN {
        return Err(Error::internal("truncated secret key file"));
    }
    let (wrap_nonce, rest) = data.split_at(WRAP_NONCE_LEN);
    let (wrapped, sealed) = rest.split_at(WRAPPED_KEY_LEN);
    let file_key = ChaCha20Poly1305::new(Key::from_slice(&master.0))
        .decrypt(Nonce::from_slice(wrap_nonce), wrapped)
        .map_err(|_| Error::internal("wrong master key"))?;
    ChaCha20Poly1305::new(Key::from_slice(&file_key))
        .decrypt(Nonce::from_slice(&ZERO_NONCE), sealed)
        .map_err(|_| Error::internal("corrupt secret key file"))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SecretKind {
    Encrypt,
    Sign,
}

impl SecretKind {
    fn suffix(&self) -> &'static str {
        match self {
            Self::Encrypt => "encrypt",
            Self::Sign => "sign",
        }
    }
}

fn file_name(keys_hash: &Hash, kind: SecretKind) -> String {
    format!("{}.{}", keys_hash.to_hex(), kind.suffix())
}

/// Writes both secret keys for an imported keypair into the private area.
pub fn write_secret_keys(
    db: &Db,
    keys_hash: &Hash,
    encrypt_secret: &[u8],
    sign_secret: &[u8],
    master: &MasterKey,
) -> Result<()> {
    for (kind, secret) in [
        (SecretKind::Encrypt, encrypt_secret),
        (SecretKind::Sign, sign_secret),
    ] {
        let sealed = seal(master, secret)?;
        db.store()
            .write(Area::Private, &file_name(keys_hash, kind), &sealed)?;
    }
    Ok(())
}

/// Reads and unseals one secret key.
pub fn read_secret_key(
    db: &Db,
    keys_hash: &Hash,
    kind: SecretKind,
    master: &MasterKey,
) -> Result<Vec<u8>> {
    let sealed = db.store().read(Area::Private, &file_name(keys_hash, kind))?;
    open(master, &sealed)
}

/// Re-encrypts both secret-key files under a new master key. The previous
/// files are kept as `.bak` until every rewrite succeeded, then removed.
pub fn change_password(
    db: &Db,
    keys_hash: &Hash,
    old: &MasterKey,
    new: &MasterKey,
) -> Result<()> {
    let kinds = [SecretKind::Encrypt, SecretKind::Sign];
    for kind in kinds {
        let name = file_name(keys_hash, kind);
        let sealed = db.store().read(Area::Private, &name)?;
        db.store()
            .write(Area::Private, &format!("{name}.bak"), &sealed)?;
        let secret = open(old, &sealed)?;
        db.store().write(Area::Private, &name, &seal(new, &secret)?)?;
    }
    for kind in kinds {
        db.store()
            .remove(Area::Private, &format!("{}.bak", file_name(keys_hash, kind)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let pair = Keypair::generate();
        let sig = pair.sign(b"message");
        assert!(verify(&pair.public(), b"message", &sig));
        assert!(!verify(&pair.public(), b"other", &sig));
    }

    #[test]
    fn seal_is_randomized_but_opens() {
        let master = MasterKey::generate();
        let a = seal(&master, b"secret").unwrap();
        let b = seal(&master, b"secret").unwrap();
        assert_ne!(a, b);
        assert_eq!(open(&master, &a).unwrap(), b"secret");
        assert_eq!(open(&master, &b).unwrap(), b"secret");
        assert!(open(&MasterKey::generate(), &a).is_err());
    }

    #[test]
    fn secret_key_files_round_trip() {
        let db = Db::memory().unwrap();
        let master = MasterKey::generate();
        let sign = Keypair::generate();
        let owner = IdHash::digest(b"person");
        let keys = keys_object(owner, &[7; 32], &sign.public());
        let stored = db.store_versioned_object(&keys).unwrap();

        write_secret_keys(&db, &stored.hash, &[9; 32], &sign.secret(), &master).unwrap();
        assert_eq!(
            read_secret_key(&db, &stored.hash, SecretKind::Encrypt, &master).unwrap(),
            [9; 32]
        );
        assert_eq!(
            read_secret_key(&db, &stored.hash, SecretKind::Sign, &master).unwrap(),
            sign.secret()
        );
    }

    #[test]
    fn password_change_rewrites_and_cleans_up() {
        let db = Db::memory().unwrap();
        let old = MasterKey::generate();
        let new = MasterKey::generate();
        let keys_hash = Hash::digest(b"keys");
        write_secret_keys(&db, &keys_hash, &[1; 32], &[2; 32], &old).unwrap();

        change_password(&db, &keys_hash, &old, &new).unwrap();
        assert_eq!(
            read_secret_key(&db, &keys_hash, SecretKind::Encrypt, &new).unwrap(),
            [1; 32]
        );
        assert!(read_secret_key(&db, &keys_hash, SecretKind::Sign, &old).is_err());
        // no .bak files remain
        let leftovers = db.store().list(Area::Private).unwrap();
        assert!(leftovers.iter().all(|n| !n.ends_with(".bak")));
    }
}
