//! Security block: certificates and the message signature.
//!
//! The core only transports these. Signing and verification belong to the security
//! collaborator; here the algorithm codes are checked against the supported set and hash
//! lengths against the algorithm's digest size.

use bytes::Bytes;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

use crate::codec::{
    decode_list, encode_list, CodecError, LengthWidth, WireObject, WireReader, WireWriter,
};
use crate::config::CodecConfig;

/// Hash algorithms (TLS HashAlgorithm registry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HashAlgorithm {
    None = 0,
    Md5 = 1,
    Sha1 = 2,
    Sha224 = 3,
    Sha256 = 4,
    Sha384 = 5,
    Sha512 = 6,
}

impl HashAlgorithm {
    /// Digest length in bytes.
    pub const fn digest_len(self) -> usize {
        match self {
            HashAlgorithm::None => 0,
            HashAlgorithm::Md5 => 16,
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha224 => 28,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// Digest of `data`, for the algorithms this crate can compute.
    pub fn digest(self, data: &[u8]) -> Option<Vec<u8>> {
        match self {
            HashAlgorithm::Sha224 => Some(Sha224::digest(data).to_vec()),
            HashAlgorithm::Sha256 => Some(Sha256::digest(data).to_vec()),
            HashAlgorithm::Sha384 => Some(Sha384::digest(data).to_vec()),
            HashAlgorithm::Sha512 => Some(Sha512::digest(data).to_vec()),
            HashAlgorithm::None | HashAlgorithm::Md5 | HashAlgorithm::Sha1 => None,
        }
    }
}

impl TryFrom<u8> for HashAlgorithm {
    type Error = CodecError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => HashAlgorithm::None,
            1 => HashAlgorithm::Md5,
            2 => HashAlgorithm::Sha1,
            3 => HashAlgorithm::Sha224,
            4 => HashAlgorithm::Sha256,
            5 => HashAlgorithm::Sha384,
            6 => HashAlgorithm::Sha512,
            _ => return Err(CodecError::UnsupportedAlgorithm { kind: "hash", code }),
        })
    }
}

/// Signature algorithms (TLS SignatureAlgorithm registry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SignatureAlgorithm {
    Anonymous = 0,
    Rsa = 1,
    Dsa = 2,
    Ecdsa = 3,
}

impl TryFrom<u8> for SignatureAlgorithm {
    type Error = CodecError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => SignatureAlgorithm::Anonymous,
            1 => SignatureAlgorithm::Rsa,
            2 => SignatureAlgorithm::Dsa,
            3 => SignatureAlgorithm::Ecdsa,
            _ => {
                return Err(CodecError::UnsupportedAlgorithm {
                    kind: "signature",
                    code,
                })
            }
        })
    }
}

/// Certificate as carried on the wire; `cert_type` 0 is X.509.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericCertificate {
    pub cert_type: u8,
    pub certificate: Bytes,
}

impl WireObject for GenericCertificate {
    fn encode(&self, w: &mut WireWriter, _cfg: &CodecConfig) -> Result<(), CodecError> {
        w.put_u8(self.cert_type);
        w.put_opaque(LengthWidth::U16, &self.certificate)
    }

    fn decode(r: &mut WireReader<'_>, _cfg: &CodecConfig) -> Result<Self, CodecError> {
        let cert_type = r.get_u8()?;
        let certificate = Bytes::copy_from_slice(r.opaque(LengthWidth::U16)?);
        Ok(Self {
            cert_type,
            certificate,
        })
    }
}

const IDENTITY_CERT_HASH: u8 = 1;
const IDENTITY_CERT_HASH_NODE_ID: u8 = 2;
const IDENTITY_NONE: u8 = 3;

/// Who signed the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignerIdentity {
    CertHash { alg: HashAlgorithm, hash: Bytes },
    CertHashNodeId { alg: HashAlgorithm, hash: Bytes },
    None,
}

impl SignerIdentity {
    /// Identity naming `certificate` by its `alg` digest.
    pub fn cert_hash(alg: HashAlgorithm, certificate: &[u8]) -> Result<Self, CodecError> {
        let hash = alg.digest(certificate).ok_or(CodecError::UnsupportedAlgorithm {
            kind: "hash",
            code: alg as u8,
        })?;
        Ok(SignerIdentity::CertHash {
            alg,
            hash: Bytes::from(hash),
        })
    }

    fn type_code(&self) -> u8 {
        match self {
            SignerIdentity::CertHash { .. } => IDENTITY_CERT_HASH,
            SignerIdentity::CertHashNodeId { .. } => IDENTITY_CERT_HASH_NODE_ID,
            SignerIdentity::None => IDENTITY_NONE,
        }
    }
}

fn decode_hash(r: &mut WireReader<'_>) -> Result<(HashAlgorithm, Bytes), CodecError> {
    let alg = HashAlgorithm::try_from(r.get_u8()?)?;
    let hash = r.opaque(LengthWidth::U8)?;
    if hash.len() != alg.digest_len() {
        return Err(CodecError::Malformed(format!(
            "{alg:?} hash of {} bytes, expected {}",
            hash.len(),
            alg.digest_len()
        )));
    }
    Ok((alg, Bytes::copy_from_slice(hash)))
}

impl WireObject for SignerIdentity {
    fn encode(&self, w: &mut WireWriter, _cfg: &CodecConfig) -> Result<(), CodecError> {
        w.put_u8(self.type_code());
        w.put_field(LengthWidth::U16, |w| match self {
            SignerIdentity::CertHash { alg, hash }
            | SignerIdentity::CertHashNodeId { alg, hash } => {
                w.put_u8(*alg as u8);
                w.put_opaque(LengthWidth::U8, hash)
            }
            SignerIdentity::None => Ok(()),
        })
    }

    fn decode(r: &mut WireReader<'_>, _cfg: &CodecConfig) -> Result<Self, CodecError> {
        let identity_type = r.get_u8()?;
        r.decode_field(LengthWidth::U16, |value| match identity_type {
            IDENTITY_CERT_HASH => {
                let (alg, hash) = decode_hash(value)?;
                Ok(SignerIdentity::CertHash { alg, hash })
            }
            IDENTITY_CERT_HASH_NODE_ID => {
                let (alg, hash) = decode_hash(value)?;
                Ok(SignerIdentity::CertHashNodeId { alg, hash })
            }
            IDENTITY_NONE => Ok(SignerIdentity::None),
            other => Err(CodecError::UnsupportedType(other as u16)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub hash: HashAlgorithm,
    pub algorithm: SignatureAlgorithm,
    pub identity: SignerIdentity,
    pub value: Bytes,
}

impl Signature {
    pub fn anonymous() -> Self {
        Self {
            hash: HashAlgorithm::None,
            algorithm: SignatureAlgorithm::Anonymous,
            identity: SignerIdentity::None,
            value: Bytes::new(),
        }
    }
}

impl WireObject for Signature {
    fn encode(&self, w: &mut WireWriter, cfg: &CodecConfig) -> Result<(), CodecError> {
        w.put_u8(self.hash as u8);
        w.put_u8(self.algorithm as u8);
        self.identity.encode(w, cfg)?;
        w.put_opaque(LengthWidth::U16, &self.value)
    }

    fn decode(r: &mut WireReader<'_>, cfg: &CodecConfig) -> Result<Self, CodecError> {
        let hash = HashAlgorithm::try_from(r.get_u8()?)?;
        let algorithm = SignatureAlgorithm::try_from(r.get_u8()?)?;
        let identity = SignerIdentity::decode(r, cfg)?;
        let value = Bytes::copy_from_slice(r.opaque(LengthWidth::U16)?);
        Ok(Self {
            hash,
            algorithm,
            identity,
            value,
        })
    }
}

/// Certificates plus signature over the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityBlock {
    pub certificates: Vec<GenericCertificate>,
    pub signature: Signature,
}

impl Default for SecurityBlock {
    fn default() -> Self {
        Self {
            certificates: Vec::new(),
            signature: Signature::anonymous(),
        }
    }
}

impl WireObject for SecurityBlock {
    fn encode(&self, w: &mut WireWriter, cfg: &CodecConfig) -> Result<(), CodecError> {
        encode_list(w, LengthWidth::U16, &self.certificates, cfg)?;
        self.signature.encode(w, cfg)
    }

    fn decode(r: &mut WireReader<'_>, cfg: &CodecConfig) -> Result<Self, CodecError> {
        let certificates = decode_list(r, LengthWidth::U16, cfg)?;
        let signature = Signature::decode(r, cfg)?;
        Ok(Self {
            certificates,
            signature,
        })
    }
}
