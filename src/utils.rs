// src/utils.rs
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::NaiveDate;
use rand::Rng;
use regex::Regex;

pub fn is_valid_identifier(identifier: &str) -> bool {
    identifier.len() >= 3 && identifier.len() <= 120
}

pub fn is_valid_password(password: &str) -> bool {
    password.len() >= 6 && password.len() <= 72
}

pub fn hash_password(password: &str) -> Result<String, bcrypt::BcryptError> {
    hash(password, DEFAULT_COST)
}

pub fn verify_password(password: &str, hashed: &str) -> bool {
    verify(password, hashed).unwrap_or(false)
}

// EVM address format: "0x" followed by 40 hex chars. Bookkeeping label
// only, no checksum validation.
pub fn is_valid_evm_address(address: &str) -> bool {
    let re = Regex::new(r"^0x[a-fA-F0-9]{40}$").unwrap();
    re.is_match(address)
}

// Claimable referral codes: 4-32 chars, A-Z 0-9 _ -
pub fn is_valid_referral_code(code: &str) -> bool {
    let re = Regex::new(r"^[A-Z0-9_-]{4,32}$").unwrap();
    re.is_match(code)
}

// Unambiguous alphabet (no I/O/0/1) for generated codes.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

pub fn random_code(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

// Demo-only random 0x... address (NOT a real on-chain keypair).
pub fn random_hex_address() -> String {
    let mut rng = rand::thread_rng();
    let mut s = String::with_capacity(42);
    s.push_str("0x");
    for _ in 0..40 {
        let v: u8 = rng.gen_range(0..16);
        s.push(char::from_digit(v as u32, 16).unwrap());
    }
    s
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

pub fn date_str(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

pub fn add_days(d: NaiveDate, n: i64) -> NaiveDate {
    d + chrono::Duration::days(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evm_address_format() {
        assert!(is_valid_evm_address("0x52908400098527886e0f7030069857d2e4169ee7"));
        assert!(!is_valid_evm_address("0x123"));
        assert!(!is_valid_evm_address("52908400098527886e0f7030069857d2e4169ee7"));
    }

    #[test]
    fn referral_code_format() {
        assert!(is_valid_referral_code("U12ABC"));
        assert!(is_valid_referral_code("MY_CODE-9"));
        assert!(!is_valid_referral_code("abc"));
        assert!(!is_valid_referral_code("TOOLONGTOOLONGTOOLONGTOOLONGTOOLONG"));
    }

    #[test]
    fn generated_address_is_valid() {
        for _ in 0..10 {
            assert!(is_valid_evm_address(&random_hex_address()));
        }
    }

    #[test]
    fn password_roundtrip() {
        let h = hash_password("hunter22").unwrap();
        assert!(verify_password("hunter22", &h));
        assert!(!verify_password("hunter23", &h));
    }
}
