//! Key material and decryption helpers shared by the unit tests.

use std::sync::OnceLock;

use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    hash::MessageDigest,
    pkcs7::{Pkcs7, Pkcs7Flags},
    pkey::{PKey, Private},
    rsa::Rsa,
    x509::{X509Builder, X509NameBuilder, X509},
};

pub struct SmimeIdentity {
    pub key: PKey<Private>,
    pub certificate: X509,
    pub certificate_pem: String,
}

/// Returns a self-signed RSA certificate and its private key, generated once.
pub fn smime_identity() -> &'static SmimeIdentity {
    static IDENTITY: OnceLock<SmimeIdentity> = OnceLock::new();
    IDENTITY.get_or_init(|| {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "a@example.com").unwrap();
        let name = name.build();

        let mut builder = X509Builder::new().unwrap();
        builder.set_version(2).unwrap();
        let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
        builder.set_serial_number(&serial).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(365).unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        let certificate = builder.build();

        let certificate_pem = String::from_utf8(certificate.to_pem().unwrap()).unwrap();
        SmimeIdentity {
            key,
            certificate,
            certificate_pem,
        }
    })
}

/// Decrypts DER encoded PKCS#7 enveloped-data with the identity's private key.
pub fn decrypt_smime(der: &[u8], identity: &SmimeIdentity) -> Vec<u8> {
    Pkcs7::from_der(der)
        .unwrap()
        .decrypt(&identity.key, &identity.certificate, Pkcs7Flags::empty())
        .unwrap()
}

#[cfg(feature = "pgp")]
pub use self::pgp::*;

#[cfg(feature = "pgp")]
mod pgp {
    use std::{io::Read, sync::OnceLock};

    use sequoia_openpgp::{
        cert::CertBuilder,
        crypto::SessionKey,
        packet::{PKESK, SKESK},
        parse::{
            stream::{DecryptionHelper, DecryptorBuilder, MessageStructure, VerificationHelper},
            Parse,
        },
        policy::{Policy, StandardPolicy},
        serialize::SerializeInto,
        types::SymmetricAlgorithm,
        Cert, Fingerprint, KeyHandle,
    };

    pub struct PgpIdentity {
        pub secret: Cert,
        pub public_armored: String,
    }

    /// Returns a general purpose OpenPGP key, generated once.
    pub fn pgp_identity() -> &'static PgpIdentity {
        static IDENTITY: OnceLock<PgpIdentity> = OnceLock::new();
        IDENTITY.get_or_init(|| {
            let (secret, _revocation) = CertBuilder::general_purpose(None, Some("a@example.com"))
                .generate()
                .unwrap();
            let public_armored = String::from_utf8(secret.armored().to_vec().unwrap()).unwrap();
            PgpIdentity {
                secret,
                public_armored,
            }
        })
    }

    struct Helper<'a> {
        policy: &'a dyn Policy,
        secret: &'a Cert,
    }

    impl VerificationHelper for Helper<'_> {
        fn get_certs(&mut self, _ids: &[KeyHandle]) -> sequoia_openpgp::Result<Vec<Cert>> {
            Ok(Vec::new())
        }

        fn check(&mut self, _structure: MessageStructure) -> sequoia_openpgp::Result<()> {
            Ok(())
        }
    }

    impl DecryptionHelper for Helper<'_> {
        fn decrypt<D>(
            &mut self,
            pkesks: &[PKESK],
            _skesks: &[SKESK],
            sym_algo: Option<SymmetricAlgorithm>,
            mut decrypt: D,
        ) -> sequoia_openpgp::Result<Option<Fingerprint>>
        where
            D: FnMut(SymmetricAlgorithm, &SessionKey) -> bool,
        {
            let key = self
                .secret
                .keys()
                .unencrypted_secret()
                .with_policy(self.policy, None)
                .for_transport_encryption()
                .next()
                .unwrap()
                .key()
                .clone();
            let mut pair = key.into_keypair()?;
            for pkesk in pkesks {
                if let Some((algo, session_key)) = pkesk.decrypt(&mut pair, sym_algo) {
                    if decrypt(algo, &session_key) {
                        break;
                    }
                }
            }
            Ok(None)
        }
    }

    /// Decrypts an OpenPGP message with the identity's secret key.
    pub fn decrypt_pgp(ciphertext: &[u8], identity: &PgpIdentity) -> Vec<u8> {
        let policy = StandardPolicy::new();
        let helper = Helper {
            policy: &policy,
            secret: &identity.secret,
        };
        let mut decryptor = DecryptorBuilder::from_bytes(ciphertext)
            .unwrap()
            .with_policy(&policy, None, helper)
            .unwrap();
        let mut plaintext = Vec::new();
        decryptor.read_to_end(&mut plaintext).unwrap();
        plaintext
    }
}
