// src/user.rs
use serde::{Deserialize, Serialize};

use crate::db::{Database, UserRow, WalletRow};
use crate::error::{CoreError, CoreResult};
use crate::mailer::Mailer;
use crate::referrals;
use crate::utils;

#[derive(Debug, Deserialize)]
pub struct RegisterInput {
    pub name: String,
    pub identifier: String,
    pub password: String,
    pub referral_code: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterOutput {
    pub user_id: i64,
    pub wallet_address: String,
    pub referral_code: String,
    pub referred_by: Option<i64>,
}

/// Create the account, its referral code, the optional referral edge and the
/// default wallet in one transaction. A stale or self-pointing referral code
/// is dropped silently; signup never fails because of it.
pub fn register(db: &Database, mailer: &Mailer, input: RegisterInput) -> CoreResult<RegisterOutput> {
    let name = input.name.trim();
    let identifier = input.identifier.trim();
    if name.is_empty() {
        return Err(CoreError::validation("name must not be empty"));
    }
    if !utils::is_valid_identifier(identifier) {
        return Err(CoreError::validation("identifier must be 3-120 chars"));
    }
    if !utils::is_valid_password(&input.password) {
        return Err(CoreError::validation("password must be 6-72 chars"));
    }

    // bcrypt outside the connection lock
    let password_hash = utils::hash_password(&input.password)
        .map_err(|e| CoreError::validation(format!("password hashing failed: {}", e)))?;

    let (user_id, wallet_address, referral_code, referred_by) = {
        let mut conn = db.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let user_id = db
            .create_user(name, identifier, &password_hash, &tx)
            .map_err(|e| CoreError::from_store_unique(e, "identifier already registered"))?;

        let referral_code = referrals::generate_unique_code_tx(&tx, user_id)?;
        Database::insert_referral_code_tx(&tx, user_id, &referral_code)?;

        let referred_by =
            referrals::attribute_referral_tx(&tx, user_id, input.referral_code.as_deref())?;

        // Prefer a pooled custodial address; fall back to a generated one
        // when the pool runs dry.
        let (address, network, token_symbol) = match Database::take_pool_address_tx(&tx)? {
            Some(picked) => picked,
            None => (utils::random_hex_address(), "ethereum".to_string(), "USDT".to_string()),
        };
        Database::assign_wallet_tx(&tx, user_id, "Primary", &address, &network, &token_symbol)?;

        tx.commit()?;
        (user_id, address, referral_code, referred_by)
    };

    mailer.notify(
        identifier.to_string(),
        "Welcome".to_string(),
        format!("Hi {}, your account is ready. Your deposit address is {}.", name, wallet_address),
    );

    Ok(RegisterOutput {
        user_id,
        wallet_address,
        referral_code,
        referred_by,
    })
}

#[derive(Debug, Serialize)]
pub struct LoginOutput {
    pub user_id: i64,
    pub name: String,
}

pub fn login(db: &Database, mailer: &Mailer, identifier: &str, password: &str) -> CoreResult<LoginOutput> {
    let identifier = identifier.trim();
    let row = db.get_user_by_identifier(identifier)?;
    match row {
        Some((user_id, name, hash)) if utils::verify_password(password, &hash) => {
            mailer.notify(
                identifier.to_string(),
                "New sign-in".to_string(),
                format!("Hi {}, your account was just signed in to.", name),
            );
            Ok(LoginOutput { user_id, name })
        }
        // same error for unknown identifier and wrong password
        _ => Err(CoreError::validation("invalid identifier or password")),
    }
}

pub fn profile(db: &Database, user_id: i64) -> CoreResult<Option<UserRow>> {
    Ok(db.get_user(user_id)?)
}

pub fn wallets(db: &Database, user_id: i64) -> CoreResult<Vec<WalletRow>> {
    Ok(db.list_wallets(user_id)?)
}

/// Attach (or re-label) an address and make it the default.
pub fn add_wallet(
    db: &Database,
    user_id: i64,
    label: &str,
    address: &str,
    network: &str,
    token_symbol: &str,
) -> CoreResult<()> {
    let address = address.trim().to_lowercase();
    if !utils::is_valid_evm_address(&address) {
        return Err(CoreError::validation("address must be 0x + 40 hex chars"));
    }
    let label = label.trim();
    let label = if label.is_empty() { "Wallet" } else { label };
    db.set_default_wallet(user_id, label, &address, network, token_symbol)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn input(identifier: &str, code: Option<&str>) -> RegisterInput {
        RegisterInput {
            name: identifier.to_string(),
            identifier: identifier.to_string(),
            password: "secret1".to_string(),
            referral_code: code.map(|c| c.to_string()),
        }
    }

    #[test]
    fn register_assigns_default_wallet_and_code() {
        let db = setup();
        let out = register(&db, &Mailer::disabled(), input("a@x", None)).unwrap();

        assert!(utils::is_valid_evm_address(&out.wallet_address));
        assert_eq!(db.default_address(out.user_id).unwrap(), Some(out.wallet_address.clone()));
        let ws = wallets(&db, out.user_id).unwrap();
        assert_eq!(ws.len(), 1);
        assert!(ws[0].is_default);
        assert_eq!(db.referral_code_of(out.user_id).unwrap().unwrap().0, out.referral_code);
        assert!(out.referred_by.is_none());

        let p = profile(&db, out.user_id).unwrap().unwrap();
        assert_eq!(p.identifier, "a@x");
    }

    #[test]
    fn register_prefers_pooled_address_and_consumes_it() {
        let db = setup();
        db.add_pool_address("0x00000000000000000000000000000000000000aa", "ethereum", "USDT")
            .unwrap();

        let first = register(&db, &Mailer::disabled(), input("a@x", None)).unwrap();
        assert_eq!(first.wallet_address, "0x00000000000000000000000000000000000000aa");

        // pool is empty now, second signup falls back to a generated address
        let second = register(&db, &Mailer::disabled(), input("b@x", None)).unwrap();
        assert_ne!(second.wallet_address, first.wallet_address);
    }

    #[test]
    fn duplicate_identifier_is_a_conflict() {
        let db = setup();
        register(&db, &Mailer::disabled(), input("a@x", None)).unwrap();
        match register(&db, &Mailer::disabled(), input("a@x", None)) {
            Err(CoreError::Conflict(_)) => {}
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn referral_attribution_on_signup() {
        let db = setup();
        let referrer = register(&db, &Mailer::disabled(), input("ref@x", None)).unwrap();

        let ok = register(&db, &Mailer::disabled(), input("a@x", Some(&referrer.referral_code))).unwrap();
        assert_eq!(ok.referred_by, Some(referrer.user_id));
        assert_eq!(db.referrer_of(ok.user_id).unwrap(), Some(referrer.user_id));

        // unknown code is dropped, signup still succeeds
        let stale = register(&db, &Mailer::disabled(), input("b@x", Some("NOSUCHCODE"))).unwrap();
        assert!(stale.referred_by.is_none());
    }

    #[test]
    fn login_checks_password() {
        let db = setup();
        let out = register(&db, &Mailer::disabled(), input("a@x", None)).unwrap();

        let mailer = Mailer::disabled();
        let ok = login(&db, &mailer, "a@x", "secret1").unwrap();
        assert_eq!(ok.user_id, out.user_id);
        assert!(login(&db, &mailer, "a@x", "wrong!!").is_err());
        assert!(login(&db, &mailer, "nobody@x", "secret1").is_err());
    }

    #[test]
    fn add_wallet_validates_address() {
        let db = setup();
        let out = register(&db, &Mailer::disabled(), input("a@x", None)).unwrap();

        assert!(add_wallet(&db, out.user_id, "Cold", "0x123", "ethereum", "USDT").is_err());
        add_wallet(
            &db,
            out.user_id,
            "Cold",
            "0x00000000000000000000000000000000000000bb",
            "ethereum",
            "USDT",
        )
        .unwrap();
        assert_eq!(
            db.default_address(out.user_id).unwrap().unwrap(),
            "0x00000000000000000000000000000000000000bb"
        );
    }
}
