//! One-time authorization codes
//!
//! RFC 6238 TOTP: HMAC-SHA1 over the 30-second time step, dynamic truncation,
//! 6 decimal digits. Verification accepts the current step and one step either side
//! to tolerate clock skew between client and responder.

use chrono::Utc;
use ring::hmac;

/// Seconds per time step
pub const TIME_STEP: u64 = 30;

/// Steps accepted on either side of the current one
pub const SKEW_STEPS: u64 = 1;

const DIGITS_MODULUS: u32 = 1_000_000;

/// Generates and verifies codes from a shared secret
#[derive(Clone)]
pub struct OtpAuthorizer {
    key: hmac::Key,
}

impl std::fmt::Debug for OtpAuthorizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtpAuthorizer").finish_non_exhaustive()
    }
}

impl OtpAuthorizer {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, secret),
        }
    }

    /// Code for a given unix time
    pub fn code_at(&self, unix_secs: u64) -> u32 {
        let counter = unix_secs / TIME_STEP;
        let tag = hmac::sign(&self.key, &counter.to_be_bytes());
        let digest = tag.as_ref();

        // Dynamic truncation
        let offset = (digest[digest.len() - 1] & 0x0f) as usize;
        let binary = u32::from_be_bytes([
            digest[offset] & 0x7f,
            digest[offset + 1],
            digest[offset + 2],
            digest[offset + 3],
        ]);

        binary % DIGITS_MODULUS
    }

    /// Code for the current time step
    pub fn current(&self) -> u32 {
        self.code_at(now())
    }

    /// Verify a code against the current time
    pub fn verify(&self, code: u32) -> bool {
        self.verify_at(code, now())
    }

    /// Verify a code against a given unix time
    pub fn verify_at(&self, code: u32, unix_secs: u64) -> bool {
        if code >= DIGITS_MODULUS {
            return false;
        }

        let earliest = unix_secs.saturating_sub(SKEW_STEPS * TIME_STEP);
        let latest = unix_secs + SKEW_STEPS * TIME_STEP;

        let mut matched = false;
        let mut time = earliest;
        while time <= latest {
            // No early exit, every candidate step is computed
            matched |= self.code_at(time) == code;
            time += TIME_STEP;
        }
        matched
    }
}

fn now() -> u64 {
    Utc::now().timestamp().max(0) as u64
}
