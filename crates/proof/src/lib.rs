// SPDX-FileCopyrightText: Copyright © 2022-2026 Chef Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Publisher and package proofs
//!
//! A publisher proof binds a publisher name to an RSA public key, signed
//! by the root certificate authority. A package proof binds a (publisher,
//! package, revision) triple to the SHA-512 of the pack file, signed by
//! the publisher key. SHA-512 with RSA PKCS#1 v1.5 is the only accepted
//! scheme; anything else fails verification.

use std::io::Read;
use std::path::Path;

use rsa::RsaPublicKey;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use x509_cert::Certificate;
use x509_cert::der::{DecodePem, Encode};

pub use self::store::Store;

pub mod store;

/// The root certificate trusted by every chef install, baked into the
/// binary at build time
pub const ROOT_CERTIFICATE_PEM: &str = include_str!("../data/root-ca.pem");

const DIGEST_CHUNK: usize = 1024 * 1024;

/// Binds a publisher name to a public key, signed by the root authority
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherProof {
    pub publisher: String,
    /// DER encoded RSA public key (PKCS#1)
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,
    /// Root authority signature over [`publisher_message`]
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

/// Binds (publisher, package, revision) to the pack digest, signed by the
/// publisher key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageProof {
    pub publisher: String,
    pub package: String,
    pub revision: u64,
    /// SHA-512 of the pack file
    #[serde(with = "hex_bytes")]
    pub digest: Vec<u8>,
    /// Publisher signature over [`package_message`]
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

/// The bytes a publisher proof signature covers
pub fn publisher_message(publisher: &str, public_key: &[u8]) -> Vec<u8> {
    let mut message = publisher.as_bytes().to_vec();
    message.push(0);
    message.extend(public_key);
    message
}

/// The bytes a package proof signature covers
pub fn package_message(publisher: &str, package: &str, revision: u64, digest: &[u8]) -> Vec<u8> {
    let mut message = publisher.as_bytes().to_vec();
    message.push(0);
    message.extend(package.as_bytes());
    message.push(0);
    message.extend(revision.to_be_bytes());
    message.extend(digest);
    message
}

/// The root authority's verification key, extracted from its X.509
/// certificate
pub struct RootAuthority {
    key: RsaPublicKey,
}

impl RootAuthority {
    /// Parse the compiled-in root certificate
    pub fn compiled_in() -> Result<Self, Error> {
        Self::from_certificate_pem(ROOT_CERTIFICATE_PEM)
    }

    /// Extract the RSA key from a PEM encoded X.509 certificate
    pub fn from_certificate_pem(pem: &str) -> Result<Self, Error> {
        let certificate = Certificate::from_pem(pem.as_bytes()).map_err(|_| Error::MalformedCertificate)?;
        let spki = certificate
            .tbs_certificate
            .subject_public_key_info
            .to_der()
            .map_err(|_| Error::MalformedCertificate)?;
        let key = RsaPublicKey::from_public_key_der(&spki).map_err(|_| Error::MalformedCertificate)?;

        Ok(Self { key })
    }

    /// Build from an already-parsed key
    pub fn new(key: RsaPublicKey) -> Self {
        Self { key }
    }

    /// Validate a publisher proof against the root authority. On success
    /// the publisher's verification key is returned for package checks.
    pub fn verify_publisher(&self, proof: &PublisherProof) -> Result<RsaPublicKey, Error> {
        let message = publisher_message(&proof.publisher, &proof.public_key);
        verify_signature(&self.key, &message, &proof.signature)?;

        RsaPublicKey::from_pkcs1_der(&proof.public_key).map_err(|_| Error::MalformedKey)
    }
}

/// Full package verification: publisher chain, recorded digest against
/// the pack file content, and the publisher's signature
pub fn verify_package(
    root: &RootAuthority,
    publisher_proof: &PublisherProof,
    package_proof: &PackageProof,
    pack: &Path,
) -> Result<(), Error> {
    if publisher_proof.publisher != package_proof.publisher {
        return Err(Error::PublisherMismatch);
    }

    let publisher_key = root.verify_publisher(publisher_proof)?;

    let digest = digest_file(pack)?;
    if digest.as_slice() != package_proof.digest.as_slice() {
        return Err(Error::DigestMismatch);
    }

    let message = package_message(
        &package_proof.publisher,
        &package_proof.package,
        package_proof.revision,
        &package_proof.digest,
    );
    verify_signature(&publisher_key, &message, &package_proof.signature)
}

/// SHA-512 of a file, streamed in 1 MiB chunks
pub fn digest_file(path: &Path) -> Result<Vec<u8>, Error> {
    let mut file = fs_err::File::open(path)?;
    let mut hasher = Sha512::new();
    let mut buffer = vec![0u8; DIGEST_CHUNK];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hasher.finalize().to_vec())
}

fn verify_signature(key: &RsaPublicKey, message: &[u8], signature: &[u8]) -> Result<(), Error> {
    let signature = Signature::try_from(signature).map_err(|_| Error::SignatureMismatch)?;

    VerifyingKey::<Sha512>::new(key.clone())
        .verify(message, &signature)
        .map_err(|_| Error::SignatureMismatch)
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no proof recorded for publisher")]
    UnknownPublisher,
    #[error("no proof recorded for package revision")]
    UnknownPackage,
    #[error("package proof names a different publisher")]
    PublisherMismatch,
    #[error("pack digest does not match its proof")]
    DigestMismatch,
    #[error("signature verification failed")]
    SignatureMismatch,
    #[error("malformed root certificate")]
    MalformedCertificate,
    #[error("malformed publisher key")]
    MalformedKey,
    #[error("io")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors caused by missing records rather than bad material
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::UnknownPublisher | Error::UnknownPackage)
    }
}

#[cfg(test)]
mod tests {
    use rsa::RsaPrivateKey;
    use rsa::pkcs1::EncodeRsaPublicKey;
    use rsa::pkcs1v15::SigningKey;
    use rsa::signature::{SignatureEncoding, Signer};

    use super::*;

    fn keypair() -> (RsaPrivateKey, RsaPublicKey) {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public = RsaPublicKey::from(&private);
        (private, public)
    }

    fn sign(key: &RsaPrivateKey, message: &[u8]) -> Vec<u8> {
        SigningKey::<Sha512>::new(key.clone()).sign(message).to_vec()
    }

    struct Fixture {
        root: RootAuthority,
        publisher_proof: PublisherProof,
        publisher_key: RsaPrivateKey,
    }

    fn fixture() -> Fixture {
        let (root_private, root_public) = keypair();
        let (publisher_private, publisher_public) = keypair();

        let public_key = publisher_public.to_pkcs1_der().unwrap().into_vec();
        let signature = sign(&root_private, &publisher_message("greenhouse", &public_key));

        Fixture {
            root: RootAuthority::new(root_public),
            publisher_proof: PublisherProof {
                publisher: "greenhouse".into(),
                public_key,
                signature,
            },
            publisher_key: publisher_private,
        }
    }

    fn package_proof_for(fixture: &Fixture, pack: &Path) -> PackageProof {
        let digest = digest_file(pack).unwrap();
        let signature = sign(
            &fixture.publisher_key,
            &package_message("greenhouse", "editor", 3, &digest),
        );

        PackageProof {
            publisher: "greenhouse".into(),
            package: "editor".into(),
            revision: 3,
            digest,
            signature,
        }
    }

    #[test]
    fn valid_publisher_verifies() {
        let fixture = fixture();

        assert!(fixture.root.verify_publisher(&fixture.publisher_proof).is_ok());
    }

    #[test]
    fn tampered_publisher_key_fails() {
        let fixture = fixture();
        let mut proof = fixture.publisher_proof.clone();
        proof.public_key[10] ^= 0xFF;

        assert!(matches!(
            fixture.root.verify_publisher(&proof),
            Err(Error::SignatureMismatch)
        ));
    }

    #[test]
    fn valid_package_verifies() {
        let fixture = fixture();
        let dir = tempfile::tempdir().unwrap();
        let pack = dir.path().join("editor.pack");
        fs_err::write(&pack, b"pack bytes").unwrap();

        let package_proof = package_proof_for(&fixture, &pack);

        assert!(verify_package(&fixture.root, &fixture.publisher_proof, &package_proof, &pack).is_ok());
    }

    #[test]
    fn flipped_pack_byte_fails_with_digest_mismatch() {
        let fixture = fixture();
        let dir = tempfile::tempdir().unwrap();
        let pack = dir.path().join("editor.pack");
        fs_err::write(&pack, b"pack bytes").unwrap();

        let package_proof = package_proof_for(&fixture, &pack);

        let mut bytes = fs_err::read(&pack).unwrap();
        bytes[0] ^= 0xFF;
        fs_err::write(&pack, bytes).unwrap();

        assert!(matches!(
            verify_package(&fixture.root, &fixture.publisher_proof, &package_proof, &pack),
            Err(Error::DigestMismatch)
        ));
    }

    #[test]
    fn streamed_digest_matches_one_shot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let content = vec![0xA5u8; 3 * 1024 * 1024 + 17];
        fs_err::write(&path, &content).unwrap();

        assert_eq!(digest_file(&path).unwrap(), Sha512::digest(&content).to_vec());
    }
}
