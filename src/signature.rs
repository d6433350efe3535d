// src/signature.rs

//! Trove signature checking
//!
//! Key management and the signature algorithm live behind
//! [`SignatureVerifier`]; the commit pipeline only compares the trust each
//! signature earns against the threshold it requires.

use crate::error::{Error, Result};
use crate::hash::Sha1Digest;
use crate::trove::{Trove, TroveSignature};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TrustLevel {
    Untrusted,
    Marginal,
    Full,
    Ultimate,
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrustLevel::Untrusted => "untrusted",
            TrustLevel::Marginal => "marginal",
            TrustLevel::Full => "full",
            TrustLevel::Ultimate => "ultimate",
        };
        f.write_str(s)
    }
}

pub trait SignatureVerifier: Send + Sync {
    /// Check `signature` over a trove digest and report the signer's trust
    ///
    /// An invalid signature is an error, not a low trust level.
    fn verify(&self, digest: &Sha1Digest, signature: &TroveSignature) -> Result<TrustLevel>;
}

/// Accepts every signature without checking it and trusts none of them
#[derive(Debug, Default, Clone, Copy)]
pub struct NoKeys;

impl SignatureVerifier for NoKeys {
    fn verify(&self, _digest: &Sha1Digest, _signature: &TroveSignature) -> Result<TrustLevel> {
        Ok(TrustLevel::Untrusted)
    }
}

/// Trust a trove must earn to be committed
pub fn required_trust(require_signatures: bool) -> TrustLevel {
    if require_signatures {
        TrustLevel::Full
    } else {
        TrustLevel::Untrusted
    }
}

/// Verify every signature on `trove` and enforce `threshold`
///
/// Returns the best trust level any signature earned.
pub fn verify_trove(
    trove: &Trove,
    verifier: &dyn SignatureVerifier,
    threshold: TrustLevel,
) -> Result<TrustLevel> {
    let signatures = &trove.info().signatures;
    if signatures.is_empty() {
        if threshold > TrustLevel::Untrusted {
            return Err(Error::MissingSignature(trove.key().to_string()));
        }
        return Ok(TrustLevel::Untrusted);
    }

    let digest = trove.info().sha1.unwrap_or_else(|| trove.compute_digest());
    let mut best = TrustLevel::Untrusted;
    for signature in signatures {
        let trust = verifier.verify(&digest, signature)?;
        debug!(
            "Signature by {} on {}: {}",
            signature.fingerprint,
            trove.key(),
            trust
        );
        best = best.max(trust);
    }

    if best < threshold {
        return Err(Error::UntrustedSignature {
            trove: trove.key().to_string(),
            found: best.to_string(),
            required: threshold.to_string(),
        });
    }
    Ok(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flavor::Flavor;

    struct Keyring(Vec<(&'static str, TrustLevel)>);

    impl SignatureVerifier for Keyring {
        fn verify(&self, _digest: &Sha1Digest, signature: &TroveSignature) -> Result<TrustLevel> {
            self.0
                .iter()
                .find(|(fp, _)| *fp == signature.fingerprint)
                .map(|(_, trust)| *trust)
                .ok_or_else(|| Error::NotFound(format!("key {}", signature.fingerprint)))
        }
    }

    fn signed(fingerprints: &[&str]) -> Trove {
        let mut trove = Trove::new(
            "foo",
            "/conary.example.com@rpl:devel/1.0-1-1".parse().unwrap(),
            Flavor::new(),
        );
        for fp in fingerprints {
            trove.info_mut().signatures.push(TroveSignature {
                fingerprint: fp.to_string(),
                signature: vec![0],
            });
        }
        trove
    }

    #[test]
    fn test_threshold_follows_policy() {
        assert_eq!(required_trust(true), TrustLevel::Full);
        assert_eq!(required_trust(false), TrustLevel::Untrusted);
        assert!(TrustLevel::Untrusted < TrustLevel::Marginal);
        assert!(TrustLevel::Full < TrustLevel::Ultimate);
    }

    #[test]
    fn test_unsigned_trove() {
        let trove = signed(&[]);
        assert!(verify_trove(&trove, &NoKeys, TrustLevel::Untrusted).is_ok());
        assert!(matches!(
            verify_trove(&trove, &NoKeys, TrustLevel::Full),
            Err(Error::MissingSignature(_))
        ));
    }

    #[test]
    fn test_best_signature_wins() {
        let keys = Keyring(vec![("aa", TrustLevel::Marginal), ("bb", TrustLevel::Full)]);
        let trove = signed(&["aa", "bb"]);
        assert_eq!(
            verify_trove(&trove, &keys, TrustLevel::Full).unwrap(),
            TrustLevel::Full
        );

        let weak = signed(&["aa"]);
        assert!(matches!(
            verify_trove(&weak, &keys, TrustLevel::Full),
            Err(Error::UntrustedSignature { .. })
        ));
    }

    #[test]
    fn test_bad_signature_fails_even_without_policy() {
        let keys = Keyring(vec![]);
        let trove = signed(&["cc"]);
        assert!(verify_trove(&trove, &keys, TrustLevel::Untrusted).is_err());
    }
}
