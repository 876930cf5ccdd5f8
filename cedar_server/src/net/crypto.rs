//! Login encryption: the server's RSA keypair, and the per-connection
//! AES-128/CFB-8 stream pair.

use aes::{
  cipher::{AsyncStreamCipher, NewCipher},
  Aes128,
};
use asn1::{Tag, WriteBuf, WriteResult};
use cfb8::Cfb8;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rsa::{traits::PublicKeyParts, RsaPrivateKey};

/// Generates the keypair clients encrypt their shared secret against. Only
/// done once, at startup.
pub fn generate_key() -> rsa::Result<RsaPrivateKey> { RsaPrivateKey::new(&mut OsRng, 1024) }

/// The encrypt and decrypt halves of a connection's cipher. The two contexts
/// are strictly separate, and each is guarded by its own mutex. Callers get
/// the cipher through a closure so that the critical section can cover both
/// the transform and whatever has to stay in sync with it: encrypt-and-
/// enqueue on the way out, decrypt-and-buffer on the way in. Anything less
/// desyncs the peer's stream.
#[derive(Default)]
pub struct Cipher {
  encrypt: Mutex<Option<Cfb8<Aes128>>>,
  decrypt: Mutex<Option<Cfb8<Aes128>>>,
}

impl Cipher {
  pub fn new() -> Self { Cipher::default() }

  /// Enables both directions. The 16 byte shared secret is used as both the
  /// key and the IV.
  pub fn enable(&self, secret: &[u8; 16]) {
    *self.encrypt.lock() =
      Some(Cfb8::new_from_slices(secret, secret).expect("16 byte key and iv"));
    *self.decrypt.lock() =
      Some(Cfb8::new_from_slices(secret, secret).expect("16 byte key and iv"));
  }

  pub fn enabled(&self) -> bool { self.encrypt.lock().is_some() }

  /// Runs `f` while holding the encryption lock. `f` receives the cipher (or
  /// None when encryption is off) and must enqueue the transformed bytes
  /// before returning.
  pub fn with_encrypt<R>(&self, f: impl FnOnce(Option<&mut Cfb8<Aes128>>) -> R) -> R {
    let mut lock = self.encrypt.lock();
    f(lock.as_mut())
  }

  /// Runs `f` while holding the decryption lock. `f` must buffer the
  /// transformed bytes before returning.
  pub fn with_decrypt<R>(&self, f: impl FnOnce(Option<&mut Cfb8<Aes128>>) -> R) -> R {
    let mut lock = self.decrypt.lock();
    f(lock.as_mut())
  }
}

/// An ASN.1 `BIT STRING`. Need this because the constructor is private in the
/// asn1 crate.
struct BitString<'a> {
  data:    &'a [u8],
  padding: u8,
}

impl asn1::SimpleAsn1Writable for BitString<'_> {
  const TAG: Tag = Tag::primitive(0x03);

  fn write_data(&self, dest: &mut WriteBuf) -> WriteResult {
    dest.push_byte(self.padding)?;
    dest.push_slice(self.data)?;
    Ok(())
  }
}

fn write_big_uint(w: &mut asn1::Writer, int: &rsa::BigUint) -> WriteResult {
  let mut bytes = int.to_bytes_be();
  let mut tmp = vec![];
  // asn1 BigUint requires the first byte to be a 0, to disambiguate from
  // negative values
  let out = if bytes[0] & 0x80 != 0 {
    tmp.push(0);
    tmp.append(&mut bytes);
    asn1::BigUint::new(tmp.as_ref()).expect("leading zero was just prepended")
  } else {
    asn1::BigUint::new(&bytes).expect("value has no leading zeros")
  };
  w.write_element(&out)
}

/// DER-encodes the public half of the key, the way the encryption request
/// packet wants it.
pub fn encode_public_key(key: &RsaPrivateKey) -> Vec<u8> {
  asn1::write(|w| {
    w.write_element(&asn1::SequenceWriter::new(&|w| {
      // A sequence containing the algorithm used.
      w.write_element(&asn1::SequenceWriter::new(&|w| {
        w.write_element(
          &asn1::ObjectIdentifier::from_string("1.2.840.113549.1.1.1")
            .expect("rsaEncryption oid is valid"),
        )?;
        w.write_element(&()) // NULL value
      }))?;
      // A bitstring containing the N and E of the key
      let inner = asn1::write(|w| {
        w.write_element(&asn1::SequenceWriter::new(&|w| {
          write_big_uint(w, key.n())?;
          write_big_uint(w, key.e())
        }))
      })?;
      w.write_element(&BitString { data: &inner, padding: 0 })
    }))
  })
  .expect("public key encoding cannot fail")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cipher_pair_round_trips() {
    let secret = [7u8; 16];
    let server = Cipher::new();
    let client = Cipher::new();
    server.enable(&secret);
    client.enable(&secret);

    // Two writes on one side must decrypt as one stream on the other.
    let mut a = b"hello ".to_vec();
    let mut b = b"world".to_vec();
    server.with_encrypt(|c| c.unwrap().encrypt(&mut a));
    server.with_encrypt(|c| c.unwrap().encrypt(&mut b));
    assert_ne!(a, b"hello ");
    let mut stream = a;
    stream.extend(b);
    client.with_decrypt(|c| c.unwrap().decrypt(&mut stream));
    assert_eq!(stream, b"hello world");
  }

  #[test]
  fn directions_are_independent() {
    let secret = [3u8; 16];
    let c = Cipher::new();
    c.enable(&secret);
    // Decrypting our own fresh ciphertext works because the two contexts
    // don't share state.
    let mut data = b"sync check".to_vec();
    c.with_encrypt(|e| e.unwrap().encrypt(&mut data));
    c.with_decrypt(|d| d.unwrap().decrypt(&mut data));
    assert_eq!(data, b"sync check");
  }

  #[test]
  fn der_structure() {
    let key = generate_key().unwrap();
    let der = encode_public_key(&key);
    // 0x30 starts a DER SEQUENCE.
    assert_eq!(der[0], 0x30);
    assert!(der.len() > 100);
  }
}
