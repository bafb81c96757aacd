//! RSA deploy keys: PEM private half stored on the BuildConfig, OpenSSH
//! public half registered with the git host for read-only clones.

use portal_operator::error::{Error, Result};

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use openssl::rsa::Rsa;
use sha2::{Digest, Sha256};

pub const DEPLOY_KEY_BITS: u32 = 4096;

#[derive(Clone, Debug)]
pub struct DeployKeyPair {
    pub public_key: String,
    pub private_key: String,
    pub fingerprint: String,
}

pub fn generate_deploy_key_pair(bits: u32) -> Result<DeployKeyPair> {
    let rsa = Rsa::generate(bits).map_err(key_error)?;
    let private_pem = rsa.private_key_to_pem().map_err(key_error)?;
    let private_key = String::from_utf8(private_pem)
        .map_err(|e| Error::DependencyUnavailable(format!("deploy key generation failed: {e}")))?;

    let mut blob = Vec::new();
    write_string(&mut blob, b"ssh-rsa");
    write_mpint(&mut blob, &rsa.e().to_vec());
    write_mpint(&mut blob, &rsa.n().to_vec());
    let public_key = format!("ssh-rsa {}", STANDARD.encode(&blob));
    let fingerprint = fingerprint(public_key.as_bytes());

    Ok(DeployKeyPair {
        public_key,
        private_key,
        fingerprint,
    })
}

/// `SHA256:{digest}` over the textual OpenSSH public key line.
fn fingerprint(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
}

fn write_string(buf: &mut Vec<u8>, value: &[u8]) {
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.extend_from_slice(value);
}

// mpint per RFC 4251: strip redundant leading zeros, then pad with one zero
// byte when the high bit would flip the sign.
fn write_mpint(buf: &mut Vec<u8>, value: &[u8]) {
    let mut bytes = value;
    while bytes.len() > 1 && bytes[0] == 0 {
        bytes = &bytes[1..];
    }
    let needs_pad = bytes.first().is_some_and(|b| b & 0x80 != 0);
    let len = bytes.len() + usize::from(needs_pad);
    buf.extend_from_slice(&(len as u32).to_be_bytes());
    if needs_pad {
        buf.push(0);
    }
    buf.extend_from_slice(bytes);
}

fn key_error(err: openssl::error::ErrorStack) -> Error {
    Error::DependencyUnavailable(format!("deploy key generation failed: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_pair_has_expected_shapes() {
        let pair = generate_deploy_key_pair(2048).unwrap();
        assert!(pair.public_key.starts_with("ssh-rsa AAAA"));
        assert!(!pair.public_key.contains('\n'));
        assert!(pair.private_key.contains("BEGIN RSA PRIVATE KEY"));
        assert!(pair.fingerprint.starts_with("SHA256:"));
        assert!(!pair.fingerprint.ends_with('='));
    }

    #[test]
    fn test_fingerprint_hashes_the_openssh_line() {
        let pair = generate_deploy_key_pair(2048).unwrap();
        let expected = format!(
            "SHA256:{}",
            STANDARD_NO_PAD.encode(Sha256::digest(pair.public_key.as_bytes()))
        );
        assert_eq!(pair.fingerprint, expected);
    }

    #[test]
    fn test_generated_pairs_are_distinct() {
        let a = generate_deploy_key_pair(2048).unwrap();
        let b = generate_deploy_key_pair(2048).unwrap();
        assert_ne!(a.public_key, b.public_key);
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn test_write_mpint_pads_high_bit() {
        let mut buf = Vec::new();
        write_mpint(&mut buf, &[0x80, 0x01]);
        assert_eq!(buf, vec![0, 0, 0, 3, 0, 0x80, 0x01]);
    }

    #[test]
    fn test_write_mpint_strips_leading_zeros() {
        let mut buf = Vec::new();
        write_mpint(&mut buf, &[0x00, 0x00, 0x7f]);
        assert_eq!(buf, vec![0, 0, 0, 1, 0x7f]);
    }
}
