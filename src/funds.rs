// src/funds.rs
//
// Money movement around the custodial ledger: deposit intake and review,
// on-chain withdrawals, and PHP bank cash-outs. Debits go through the
// checked insert in db.rs so a row only ever exists if the balance covered
// it at write time.

use serde::Serialize;

use crate::config::Config;
use crate::db::{BankTransferRow, Database, DebitOutcome, DepositRow, TransferRow};
use crate::error::{CoreError, CoreResult};
use crate::mailer::Mailer;
use crate::utils;

/* ------------------------------- deposits ------------------------------- */

#[allow(clippy::too_many_arguments)]
pub fn record_deposit(
    db: &Database,
    user_id: i64,
    address: &str,
    amount: f64,
    token_symbol: &str,
    network: &str,
    source: Option<&str>,
    tx_hash: Option<&str>,
    image_path: Option<&str>,
) -> CoreResult<i64> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(CoreError::validation("amount must be positive"));
    }
    let address = address.trim().to_lowercase();
    let owned = db.list_wallets(user_id)?.iter().any(|w| w.address == address);
    if !owned {
        return Err(CoreError::validation("address does not belong to this user"));
    }
    let id = db.insert_deposit(
        user_id,
        &address,
        amount,
        token_symbol,
        network,
        source,
        tx_hash,
        image_path,
    )?;
    log::info!("deposit {} recorded: user {} amount {} {}", id, user_id, amount, token_symbol);
    Ok(id)
}

pub fn list_deposits(db: &Database, user_id: i64, address: Option<&str>) -> CoreResult<Vec<DepositRow>> {
    Ok(db.list_deposits(user_id, address)?)
}

/// Review step: pending -> verified | rejected. Only verified deposits fund
/// the balance.
pub fn review_deposit(db: &Database, mailer: &Mailer, deposit_id: i64, approve: bool) -> CoreResult<()> {
    let to = if approve { "verified" } else { "rejected" };
    if db.transition_deposit(deposit_id, "pending", to)? == 0 {
        return Err(CoreError::conflict("deposit is not pending"));
    }
    log::info!("deposit {} {}", deposit_id, to);
    notify_owner_of_deposit(db, mailer, deposit_id, to);
    Ok(())
}

fn notify_owner_of_deposit(db: &Database, mailer: &Mailer, deposit_id: i64, status: &str) {
    // best effort, review already committed
    let found = db.deposit_owner(deposit_id).ok().flatten();
    if let Some((identifier, amount, token)) = found {
        mailer.notify(
            identifier,
            format!("Deposit {}", status),
            format!("Your deposit of {} {} is now {}.", amount, token, status),
        );
    }
}

/* ----------------------------- withdrawals ----------------------------- */

pub fn withdraw(
    db: &Database,
    user_id: i64,
    from_address: &str,
    to_address: &str,
    amount: f64,
    token_symbol: &str,
    network: &str,
    note: Option<&str>,
) -> CoreResult<i64> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(CoreError::validation("amount must be positive"));
    }
    // stored addresses are lowercase, so the source must match that form
    let from_address = from_address.trim().to_lowercase();
    let to_address = to_address.trim().to_lowercase();
    if !utils::is_valid_evm_address(&to_address) {
        return Err(CoreError::validation("destination must be 0x + 40 hex chars"));
    }
    match db.create_transfer_checked(user_id, &from_address, &to_address, amount, token_symbol, network, note)? {
        DebitOutcome::Inserted(id) => {
            log::info!("withdrawal {} created: user {} amount {} {}", id, user_id, amount, token_symbol);
            Ok(id)
        }
        DebitOutcome::Insufficient { spendable } => Err(CoreError::InsufficientFunds { spendable }),
    }
}

pub fn list_withdrawals(db: &Database, user_id: i64) -> CoreResult<Vec<TransferRow>> {
    Ok(db.list_transfers(user_id)?)
}

// Withdrawal lifecycle: pending -> broadcast -> confirmed, with failed and
// cancelled as exits. Failed and cancelled rows stop counting against the
// balance; confirmed ones never do.
pub fn mark_withdrawal_broadcast(db: &Database, id: i64, tx_hash: &str) -> CoreResult<()> {
    if db.transition_transfer(id, "pending", "broadcast", Some(tx_hash))? == 0 {
        return Err(CoreError::conflict("withdrawal is not pending"));
    }
    Ok(())
}

pub fn mark_withdrawal_confirmed(db: &Database, id: i64) -> CoreResult<()> {
    if db.transition_transfer(id, "broadcast", "confirmed", None)? == 0 {
        return Err(CoreError::conflict("withdrawal is not broadcast"));
    }
    Ok(())
}

pub fn mark_withdrawal_failed(db: &Database, id: i64) -> CoreResult<()> {
    if db.transition_transfer(id, "pending", "failed", None)? == 0
        && db.transition_transfer(id, "broadcast", "failed", None)? == 0
    {
        return Err(CoreError::conflict("withdrawal is not in flight"));
    }
    Ok(())
}

pub fn cancel_withdrawal(db: &Database, user_id: i64, id: i64) -> CoreResult<()> {
    let owned = db.list_transfers(user_id)?.iter().any(|t| t.id == id);
    if !owned {
        return Err(CoreError::validation("no such withdrawal"));
    }
    if db.transition_transfer(id, "pending", "cancelled", None)? == 0 {
        return Err(CoreError::conflict("only pending withdrawals can be cancelled"));
    }
    Ok(())
}

/* ----------------------------- bank cash-outs ----------------------------- */

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CashoutQuote {
    pub rate_usdt_php: f64,
    pub fx_fee_pct: f64,
    pub payout_fee_php: f64,
    pub php_gross: f64,
    pub php_net: f64,
}

/// Price a cash-out: gross at the given (or fallback) rate, minus the FX
/// percentage fee and the flat payout fee.
pub fn quote_cashout(config: &Config, amount_usdt: f64, rate_usdt_php: Option<f64>) -> CoreResult<CashoutQuote> {
    if !amount_usdt.is_finite() || amount_usdt <= 0.0 {
        return Err(CoreError::validation("amount must be positive"));
    }
    let rate = match rate_usdt_php {
        Some(r) if r.is_finite() && r > 0.0 => r,
        Some(_) => return Err(CoreError::validation("rate must be positive")),
        None => config.fallback_usdt_php,
    };
    let php_gross = amount_usdt * rate;
    let php_net = php_gross * (1.0 - config.fx_fee_pct) - config.payout_fee_php;
    if php_net <= 0.0 {
        return Err(CoreError::validation("amount too small to cover fees"));
    }
    Ok(CashoutQuote {
        rate_usdt_php: rate,
        fx_fee_pct: config.fx_fee_pct,
        payout_fee_php: config.payout_fee_php,
        php_gross,
        php_net,
    })
}

#[allow(clippy::too_many_arguments)]
pub fn cashout(
    db: &Database,
    config: &Config,
    user_id: i64,
    from_address: &str,
    bank_code: &str,
    account_number: &str,
    account_name: &str,
    amount_usdt: f64,
    rate_usdt_php: Option<f64>,
) -> CoreResult<i64> {
    if !db.bank_exists(bank_code)? {
        return Err(CoreError::validation("unknown bank code"));
    }
    let from_address = from_address.trim().to_lowercase();
    let account_number = account_number.trim();
    if account_number.len() < 6
        || account_number.len() > 20
        || !account_number.chars().all(|c| c.is_ascii_digit())
    {
        return Err(CoreError::validation("account number must be 6-20 digits"));
    }
    if account_name.trim().is_empty() {
        return Err(CoreError::validation("account name must not be empty"));
    }

    let quote = quote_cashout(config, amount_usdt, rate_usdt_php)?;
    match db.create_bank_transfer_checked(
        user_id,
        &from_address,
        bank_code,
        account_number,
        account_name.trim(),
        amount_usdt,
        quote.rate_usdt_php,
        quote.fx_fee_pct,
        quote.payout_fee_php,
        quote.php_gross,
        quote.php_net,
        None,
    )? {
        DebitOutcome::Inserted(id) => {
            log::info!(
                "cash-out {} created: user {} amount {} USDT -> {:.2} PHP net",
                id, user_id, amount_usdt, quote.php_net
            );
            Ok(id)
        }
        DebitOutcome::Insufficient { spendable } => Err(CoreError::InsufficientFunds { spendable }),
    }
}

pub fn list_cashouts(db: &Database, user_id: i64) -> CoreResult<Vec<BankTransferRow>> {
    Ok(db.list_bank_transfers(user_id)?)
}

pub fn list_banks(db: &Database) -> CoreResult<Vec<(String, String, String)>> {
    Ok(db.list_banks()?)
}

// Cash-out lifecycle: processing -> sent -> received, failed as the exit.
pub fn mark_cashout_sent(db: &Database, id: i64, reference: &str) -> CoreResult<()> {
    if db.transition_bank_transfer(id, "processing", "sent", Some(reference))? == 0 {
        return Err(CoreError::conflict("cash-out is not processing"));
    }
    Ok(())
}

pub fn mark_cashout_received(db: &Database, id: i64) -> CoreResult<()> {
    if db.transition_bank_transfer(id, "sent", "received", None)? == 0 {
        return Err(CoreError::conflict("cash-out is not sent"));
    }
    Ok(())
}

pub fn mark_cashout_failed(db: &Database, id: i64) -> CoreResult<()> {
    if db.transition_bank_transfer(id, "processing", "failed", None)? == 0
        && db.transition_bank_transfer(id, "sent", "failed", None)? == 0
    {
        return Err(CoreError::conflict("cash-out is not in flight"));
    }
    Ok(())
}
