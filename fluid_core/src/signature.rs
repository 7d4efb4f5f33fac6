//! Content signatures.
//!
//! A signature is the URL-safe base64 (no padding) encoding of a digest of
//! the blob bytes. The same input yields the same signature across runs and
//! platforms; murmur uses the x64 128-bit variant, so 64-bit targets are the
//! reference.

use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use md5::{Digest as _, Md5};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Sha224, Sha256};

use crate::error::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha224,
    #[default]
    Sha256,
    Murmur,
}

impl HashAlgorithm {
    pub const ALL: [HashAlgorithm; 5] = [
        HashAlgorithm::Md5,
        HashAlgorithm::Sha1,
        HashAlgorithm::Sha224,
        HashAlgorithm::Sha256,
        HashAlgorithm::Murmur,
    ];
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(HashAlgorithm::Md5),
            "sha1" => Ok(HashAlgorithm::Sha1),
            "sha224" => Ok(HashAlgorithm::Sha224),
            "sha256" => Ok(HashAlgorithm::Sha256),
            "murmur" => Ok(HashAlgorithm::Murmur),
            other => Err(Error::Config(format!("unknown hashing algorithm '{other}'"))),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha224 => "sha224",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Murmur => "murmur",
        };
        f.write_str(name)
    }
}

/// Signs `data` with the given algorithm.
pub fn signature(alg: HashAlgorithm, data: &[u8]) -> String {
    let digest = match alg {
        HashAlgorithm::Md5 => Md5::digest(data).to_vec(),
        HashAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
        HashAlgorithm::Sha224 => Sha224::digest(data).to_vec(),
        HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        HashAlgorithm::Murmur => {
            // murmur3 reads through io::Read; an in-memory cursor cannot fail.
            let sum = murmur3::murmur3_x64_128(&mut std::io::Cursor::new(data), 0)
                .expect("in-memory read");
            sum.to_be_bytes().to_vec()
        }
    };
    URL_SAFE_NO_PAD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CANON: &[u8] = b"The eagle flies at midnight";

    #[test]
    fn known_vectors() {
        assert_eq!(signature(HashAlgorithm::Md5, CANON), "UPo8xAOMJzMMfi6FRJTGGQ");
        assert_eq!(
            signature(HashAlgorithm::Sha1, CANON),
            "ddd1hFDMqHPp1_QWxKsggbEeuIE"
        );
        assert_eq!(
            signature(HashAlgorithm::Sha224, CANON),
            "kP4LwHw2LqagkR0xKxx8wYMUcvjY698k3L5iaA"
        );
        assert_eq!(
            signature(HashAlgorithm::Sha256, CANON),
            "BT5kuWbJ_z-3eDVnXfj2ou0eTHBdPcniq3wATmAStRw"
        );
        assert_eq!(
            signature(HashAlgorithm::Murmur, CANON),
            "pOalFoebLnN03XVP31S9gw"
        );
    }

    #[test]
    fn deterministic_across_calls() {
        for alg in HashAlgorithm::ALL {
            assert_eq!(signature(alg, CANON), signature(alg, CANON), "{alg}");
        }
    }

    #[test]
    fn names_parse() {
        for alg in HashAlgorithm::ALL {
            assert_eq!(alg.to_string().parse::<HashAlgorithm>().unwrap(), alg);
        }
        assert!("blake3".parse::<HashAlgorithm>().is_err());
    }
}
