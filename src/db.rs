// src/db.rs
use rusqlite::{params, Connection, OptionalExtension, Result, Transaction};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub struct Database {
    pub conn: Arc<Mutex<Connection>>,
}

/* ------------------------------ row structs ------------------------------ */

#[derive(Debug, Clone, Serialize)]
pub struct UserRow {
    pub id: i64,
    pub name: String,
    pub identifier: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WalletRow {
    pub id: i64,
    pub label: Option<String>,
    pub address: String,
    pub network: String,
    pub token_symbol: String,
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DepositRow {
    pub id: i64,
    pub address: String,
    pub amount: f64,
    pub token_symbol: String,
    pub network: String,
    pub source: Option<String>,
    pub tx_hash: Option<String>,
    pub image_path: Option<String>,
    pub status: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferRow {
    pub id: i64,
    pub from_address: String,
    pub to_address: String,
    pub amount: f64,
    pub token_symbol: String,
    pub network: String,
    pub status: String,
    pub tx_hash: Option<String>,
    pub note: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BankTransferRow {
    pub id: i64,
    pub from_address: String,
    pub bank_code: String,
    pub account_number: String,
    pub account_name: String,
    pub amount_usdt: f64,
    pub rate_usdt_php: f64,
    pub fx_fee_pct: f64,
    pub payout_fee_php: f64,
    pub php_gross: f64,
    pub php_net: f64,
    pub status: String,
    pub reference: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionRow {
    pub id: i64,
    pub user_id: i64,
    pub from_address: String,
    pub symbol: String,
    pub amount_usdt: f64,
    pub token_symbol: String,
    pub contract_days: i64,
    pub rate_daily: f64,
    pub start_date: String,
    pub end_date: String,
    pub last_credit_date: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommissionRow {
    pub id: i64,
    pub source_user_id: i64,
    pub tier: i64,
    pub source_day: String,
    pub amount_usdt: f64,
    pub status: String,
    pub paid_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReferredUserRow {
    pub user_id: i64,
    pub name: String,
    pub identifier: String,
    pub created_at: String,
}

/// The five per-address aggregates plus the user-scoped referral figure
/// that go into one spendable computation.
#[derive(Debug, Clone, Copy, Default)]
pub struct BalanceParts {
    pub dep_verified: f64,
    pub dep_pending: f64,
    pub wd_active: f64,
    pub bank_active: f64,
    pub ai_active: f64,
    pub ai_profit: f64,
    pub referral_paid: f64,
}

impl BalanceParts {
    pub fn spendable(&self) -> f64 {
        self.dep_verified - self.wd_active - self.bank_active - self.ai_active
            + self.ai_profit
            + self.referral_paid
    }
}

/// Result of a read-then-insert debit performed under one connection lock.
#[derive(Debug)]
pub enum DebitOutcome {
    Inserted(i64),
    Insufficient { spendable: f64 },
}

const PH_BANKS: &[(&str, &str, &str)] = &[
    ("BDO", "BDO Unibank", "both"),
    ("BPI", "Bank of the Philippine Islands", "both"),
    ("MBTC", "Metrobank", "both"),
    ("LBP", "Land Bank of the Philippines", "both"),
    ("PNB", "Philippine National Bank", "both"),
    ("SECB", "Security Bank", "both"),
    ("CHIB", "China Banking Corporation", "both"),
    ("UBP", "UnionBank of the Philippines", "both"),
    ("RCBC", "Rizal Commercial Banking Corp.", "both"),
    ("EWB", "EastWest Bank", "both"),
    ("AUB", "Asia United Bank", "both"),
    ("PSB", "PSBank", "both"),
    ("PBCOM", "Philippine Bank of Communications", "both"),
    ("BNCOM", "Bank of Commerce", "both"),
    ("MAYA", "Maya Bank, Inc.", "instapay"),
    ("CIMB", "CIMB Bank Philippines", "instapay"),
    ("TONIK", "Tonik Digital Bank", "instapay"),
    ("UNO", "UNO Digital Bank", "instapay"),
    ("OFB", "Overseas Filipino Bank", "pesonet"),
    ("SEABANK", "SeaBank Philippines", "instapay"),
    ("GOTYME", "GoTyme Bank", "instapay"),
];

impl Database {
    pub fn new(db_file: &str) -> Result<Self> {
        let file_exists = Path::new(db_file).exists();
        let conn = Connection::open(db_file)?;
        conn.execute("PRAGMA foreign_keys = ON;", [])?;

        if !file_exists {
            log::info!("database file missing, initializing {}", db_file);
        } else {
            log::info!("database file exists, syncing schema");
        }

        // CREATE TABLE IF NOT EXISTS throughout, so re-running against an
        // existing file only adds what is missing.
        Self::initialize_database(&conn)?;

        Ok(Database {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON;", [])?;
        Self::initialize_database(&conn)?;
        Ok(Database {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn initialize_database(conn: &Connection) -> Result<()> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                identifier TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
            )
            "#,
            [],
        )?;

        // Reusable assignment pool; registration draws one of these.
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS address_pool (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                address TEXT NOT NULL UNIQUE,
                network TEXT NOT NULL DEFAULT 'ethereum',
                token_symbol TEXT NOT NULL DEFAULT 'USDT',
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS wallet_addresses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                label TEXT,
                address TEXT NOT NULL,
                network TEXT NOT NULL DEFAULT 'ethereum',
                token_symbol TEXT NOT NULL DEFAULT 'USDT',
                is_default INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                UNIQUE(user_id, address),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS banks (
                code TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                channel TEXT NOT NULL DEFAULT 'both',
                active INTEGER NOT NULL DEFAULT 1
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS deposits (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER,
                address TEXT NOT NULL,
                amount REAL NOT NULL,
                token_symbol TEXT NOT NULL DEFAULT 'USDT',
                network TEXT NOT NULL DEFAULT 'ethereum',
                source TEXT,
                tx_hash TEXT,
                image_path TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE SET NULL
            )
            "#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_dep_user_addr ON deposits (user_id, address)",
            [],
        )?;

        // Crypto withdrawals. Active = pending|broadcast|confirmed.
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS transfers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                from_address TEXT NOT NULL,
                to_address TEXT NOT NULL,
                amount REAL NOT NULL,
                token_symbol TEXT NOT NULL DEFAULT 'USDT',
                network TEXT NOT NULL DEFAULT 'ethereum',
                status TEXT NOT NULL DEFAULT 'pending',
                tx_hash TEXT,
                note TEXT,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            )
            "#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tr_user_from ON transfers (user_id, from_address)",
            [],
        )?;

        // Bank cash-outs. Active = processing|sent|received.
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS bank_transfers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                from_address TEXT NOT NULL,
                bank_code TEXT NOT NULL,
                account_number TEXT NOT NULL,
                account_name TEXT NOT NULL,
                amount_usdt REAL NOT NULL,
                rate_usdt_php REAL NOT NULL,
                fx_fee_pct REAL NOT NULL DEFAULT 0.01,
                payout_fee_php REAL NOT NULL DEFAULT 25.0,
                php_gross REAL NOT NULL,
                php_net REAL NOT NULL,
                token_symbol TEXT NOT NULL DEFAULT 'USDT',
                network TEXT NOT NULL DEFAULT 'bank',
                reference TEXT,
                status TEXT NOT NULL DEFAULT 'processing',
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            )
            "#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_bt_user_from ON bank_transfers (user_id, from_address)",
            [],
        )?;

        // One principal lock per (user, address, symbol); the upsert in
        // create_subscription_checked replaces terms and restarts accrual.
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS ai_subscriptions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                from_address TEXT NOT NULL,
                symbol TEXT NOT NULL,
                amount_usdt REAL NOT NULL,
                token_symbol TEXT NOT NULL DEFAULT 'USDT',
                contract_days INTEGER NOT NULL,
                rate_daily REAL NOT NULL,
                start_date TEXT NOT NULL,
                end_date TEXT NOT NULL,
                last_credit_date TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                UNIQUE(user_id, from_address, symbol),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            )
            "#,
            [],
        )?;

        // Idempotency substrate for both posters: unique per day.
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS ai_profit_ledger (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                from_address TEXT NOT NULL,
                symbol TEXT NOT NULL,
                amount_usdt REAL NOT NULL,
                day_date TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                UNIQUE(user_id, from_address, symbol, day_date),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            )
            "#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_pl_user_day ON ai_profit_ledger (user_id, day_date)",
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS referral_codes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL UNIQUE,
                code TEXT NOT NULL UNIQUE,
                clicks INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            )
            "#,
            [],
        )?;

        // At most one referrer per referee, linked once at signup.
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS referral_relations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                referrer_id INTEGER NOT NULL,
                referee_id INTEGER NOT NULL UNIQUE,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                FOREIGN KEY (referrer_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (referee_id) REFERENCES users(id) ON DELETE CASCADE
            )
            "#,
            [],
        )?;

        // (earner, source, day, tier) is the commission idempotency key.
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS referral_rewards (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                source_user_id INTEGER NOT NULL,
                tier INTEGER NOT NULL DEFAULT 1,
                source_day TEXT NOT NULL,
                amount_usdt REAL NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                paid_at TEXT,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                UNIQUE(user_id, source_user_id, source_day, tier),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            )
            "#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_rw_day_status ON referral_rewards (source_day, status)",
            [],
        )?;

        // Seed the bank master list once.
        let bank_count: i64 = conn.query_row("SELECT COUNT(*) FROM banks", [], |row| row.get(0))?;
        if bank_count == 0 {
            for (code, name, channel) in PH_BANKS {
                conn.execute(
                    "INSERT INTO banks (code, name, channel, active) VALUES (?, ?, ?, 1)",
                    params![code, name, channel],
                )?;
            }
        }

        Ok(())
    }

    /* ------------------------------ users ------------------------------ */

    pub fn create_user(
        &self,
        name: &str,
        identifier: &str,
        password_hash: &str,
        tx: &Transaction,
    ) -> Result<i64> {
        tx.execute(
            "INSERT INTO users (name, identifier, password_hash) VALUES (?, ?, ?)",
            params![name, identifier, password_hash],
        )?;
        Ok(tx.last_insert_rowid())
    }

    // (id, name, password_hash) by login identifier.
    pub fn get_user_by_identifier(&self, identifier: &str) -> Result<Option<(i64, String, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT id, name, password_hash FROM users WHERE identifier = ?")?;
        stmt.query_row(params![identifier], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })
        .optional()
    }

    pub fn get_user(&self, user_id: i64) -> Result<Option<UserRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, name, identifier FROM users WHERE id = ?")?;
        stmt.query_row(params![user_id], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                name: row.get(1)?,
                identifier: row.get(2)?,
            })
        })
        .optional()
    }

    /* ----------------------------- wallets ----------------------------- */

    pub fn pool_address_tx(tx: &Transaction) -> Result<Option<(String, String, String)>> {
        let mut stmt = tx.prepare(
            "SELECT address, network, token_symbol FROM address_pool ORDER BY RANDOM() LIMIT 1",
        )?;
        stmt.query_row([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .optional()
    }

    // Pop one pool address inside the caller's transaction; each pooled
    // address is handed out at most once.
    pub fn take_pool_address_tx(tx: &Transaction) -> Result<Option<(String, String, String)>> {
        let picked = Self::pool_address_tx(tx)?;
        if let Some((address, _, _)) = &picked {
            tx.execute("DELETE FROM address_pool WHERE address = ?", params![address])?;
        }
        Ok(picked)
    }

    pub fn add_pool_address(&self, address: &str, network: &str, token_symbol: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO address_pool (address, network, token_symbol) VALUES (?, ?, ?)",
            params![address.to_lowercase(), network, token_symbol],
        )?;
        Ok(())
    }

    // Upsert the wallet row and make it the only default, both inside the
    // caller's transaction.
    pub fn assign_wallet_tx(
        tx: &Transaction,
        user_id: i64,
        label: &str,
        address: &str,
        network: &str,
        token_symbol: &str,
    ) -> Result<()> {
        tx.execute(
            r#"
            INSERT INTO wallet_addresses (user_id, label, address, network, token_symbol, is_default)
            VALUES (?1, ?2, ?3, ?4, ?5, 1)
            ON CONFLICT(user_id, address) DO UPDATE SET
                label = excluded.label,
                network = excluded.network,
                token_symbol = excluded.token_symbol,
                is_default = 1
            "#,
            params![user_id, label, address, network, token_symbol],
        )?;
        tx.execute(
            "UPDATE wallet_addresses SET is_default = 0 WHERE user_id = ? AND address <> ?",
            params![user_id, address],
        )?;
        Ok(())
    }

    pub fn default_address(&self, user_id: i64) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT address FROM wallet_addresses WHERE user_id = ? AND is_default = 1 LIMIT 1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()
    }

    pub fn list_wallets(&self, user_id: i64) -> Result<Vec<WalletRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, label, address, network, token_symbol, is_default
            FROM wallet_addresses
            WHERE user_id = ?
            ORDER BY is_default DESC, id DESC
            "#,
        )?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok(WalletRow {
                    id: row.get(0)?,
                    label: row.get(1)?,
                    address: row.get(2)?,
                    network: row.get(3)?,
                    token_symbol: row.get(4)?,
                    is_default: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // Wallet-default switch is a two-row mutation; all-or-nothing.
    pub fn set_default_wallet(
        &self,
        user_id: i64,
        label: &str,
        address: &str,
        network: &str,
        token_symbol: &str,
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        Self::assign_wallet_tx(&tx, user_id, label, address, network, token_symbol)?;
        tx.commit()
    }

    /* ----------------------------- deposits ----------------------------- */

    #[allow(clippy::too_many_arguments)]
    pub fn insert_deposit(
        &self,
        user_id: i64,
        address: &str,
        amount: f64,
        token_symbol: &str,
        network: &str,
        source: Option<&str>,
        tx_hash: Option<&str>,
        image_path: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO deposits (user_id, address, amount, token_symbol, network, source, tx_hash, image_path, status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending')
            "#,
            params![user_id, address, amount, token_symbol, network, source, tx_hash, image_path],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_deposits(&self, user_id: i64, address: Option<&str>) -> Result<Vec<DepositRow>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = String::from(
            "SELECT id, address, amount, token_symbol, network, source, tx_hash, image_path, status, created_at
             FROM deposits WHERE user_id = ?",
        );
        if address.is_some() {
            sql.push_str(" AND address = ?2");
        }
        sql.push_str(" ORDER BY id DESC");
        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row| -> Result<DepositRow> {
            Ok(DepositRow {
                id: row.get(0)?,
                address: row.get(1)?,
                amount: row.get(2)?,
                token_symbol: row.get(3)?,
                network: row.get(4)?,
                source: row.get(5)?,
                tx_hash: row.get(6)?,
                image_path: row.get(7)?,
                status: row.get(8)?,
                created_at: row.get(9)?,
            })
        };
        let rows = match address {
            Some(addr) => stmt
                .query_map(params![user_id, addr], map_row)?
                .collect::<Result<Vec<_>, _>>()?,
            None => stmt
                .query_map(params![user_id], map_row)?
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(rows)
    }

    // (owner identifier, amount, token_symbol) for notification text.
    pub fn deposit_owner(&self, deposit_id: i64) -> Result<Option<(String, f64, String)>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            r#"
            SELECT u.identifier, d.amount, d.token_symbol
            FROM deposits d JOIN users u ON u.id = d.user_id
            WHERE d.id = ?
            "#,
            params![deposit_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
    }

    pub fn set_deposit_status(&self, deposit_id: i64, status: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE deposits SET status = ? WHERE id = ?",
            params![status, deposit_id],
        )
    }

    /* --------------------------- withdrawals --------------------------- */

    pub fn list_transfers(&self, user_id: i64) -> Result<Vec<TransferRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, from_address, to_address, amount, token_symbol, network, status, tx_hash, note, created_at
            FROM transfers WHERE user_id = ? ORDER BY id DESC
            "#,
        )?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok(TransferRow {
                    id: row.get(0)?,
                    from_address: row.get(1)?,
                    to_address: row.get(2)?,
                    amount: row.get(3)?,
                    token_symbol: row.get(4)?,
                    network: row.get(5)?,
                    status: row.get(6)?,
                    tx_hash: row.get(7)?,
                    note: row.get(8)?,
                    created_at: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // Guarded one-step transition; 0 changed rows means the row was not in
    // the expected state.
    pub fn transition_transfer(
        &self,
        transfer_id: i64,
        from: &str,
        to: &str,
        tx_hash: Option<&str>,
    ) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE transfers SET status = ?, tx_hash = COALESCE(?, tx_hash) WHERE id = ? AND status = ?",
            params![to, tx_hash, transfer_id, from],
        )
    }

    /* --------------------------- bank transfers --------------------------- */

    pub fn bank_exists(&self, code: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM banks WHERE code = ? AND active = 1",
                params![code],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn list_banks(&self) -> Result<Vec<(String, String, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT code, name, channel FROM banks WHERE active = 1 ORDER BY name ASC")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_bank_transfers(&self, user_id: i64) -> Result<Vec<BankTransferRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, from_address, bank_code, account_number, account_name,
                   amount_usdt, rate_usdt_php, fx_fee_pct, payout_fee_php,
                   php_gross, php_net, status, reference, created_at
            FROM bank_transfers WHERE user_id = ? ORDER BY id DESC
            "#,
        )?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok(BankTransferRow {
                    id: row.get(0)?,
                    from_address: row.get(1)?,
                    bank_code: row.get(2)?,
                    account_number: row.get(3)?,
                    account_name: row.get(4)?,
                    amount_usdt: row.get(5)?,
                    rate_usdt_php: row.get(6)?,
                    fx_fee_pct: row.get(7)?,
                    payout_fee_php: row.get(8)?,
                    php_gross: row.get(9)?,
                    php_net: row.get(10)?,
                    status: row.get(11)?,
                    reference: row.get(12)?,
                    created_at: row.get(13)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn transition_bank_transfer(
        &self,
        id: i64,
        from: &str,
        to: &str,
        reference: Option<&str>,
    ) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE bank_transfers SET status = ?, reference = COALESCE(?, reference) WHERE id = ? AND status = ?",
            params![to, reference, id, from],
        )
    }

    pub fn transition_deposit(&self, deposit_id: i64, from: &str, to: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE deposits SET status = ? WHERE id = ? AND status = ?",
            params![to, deposit_id, from],
        )
    }

    /* ------------------------- balance aggregates ------------------------- */

    fn balance_parts_with(
        conn: &Connection,
        user_id: i64,
        address: &str,
        token_symbol: &str,
    ) -> Result<BalanceParts> {
        let (dep_verified, dep_pending): (f64, f64) = conn.query_row(
            r#"
            SELECT COALESCE(SUM(CASE WHEN status = 'verified' THEN amount END), 0),
                   COALESCE(SUM(CASE WHEN status = 'pending' THEN amount END), 0)
            FROM deposits WHERE user_id = ? AND address = ? AND token_symbol = ?
            "#,
            params![user_id, address, token_symbol],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let wd_active: f64 = conn.query_row(
            r#"
            SELECT COALESCE(SUM(CASE WHEN status IN ('pending','broadcast','confirmed') THEN amount END), 0)
            FROM transfers WHERE user_id = ? AND from_address = ? AND token_symbol = ?
            "#,
            params![user_id, address, token_symbol],
            |row| row.get(0),
        )?;

        let bank_active: f64 = conn.query_row(
            r#"
            SELECT COALESCE(SUM(CASE WHEN status IN ('processing','sent','received') THEN amount_usdt END), 0)
            FROM bank_transfers WHERE user_id = ? AND from_address = ? AND token_symbol = ?
            "#,
            params![user_id, address, token_symbol],
            |row| row.get(0),
        )?;

        let ai_active: f64 = conn.query_row(
            r#"
            SELECT COALESCE(SUM(amount_usdt), 0)
            FROM ai_subscriptions
            WHERE user_id = ? AND from_address = ? AND token_symbol = ? AND status = 'active'
            "#,
            params![user_id, address, token_symbol],
            |row| row.get(0),
        )?;

        // Profit ledger is keyed per address; the symbol is the yield
        // product, not the settlement currency, so no symbol filter here.
        let ai_profit: f64 = conn.query_row(
            "SELECT COALESCE(SUM(amount_usdt), 0) FROM ai_profit_ledger WHERE user_id = ? AND from_address = ?",
            params![user_id, address],
            |row| row.get(0),
        )?;

        let referral_paid: f64 = conn.query_row(
            "SELECT COALESCE(SUM(amount_usdt), 0) FROM referral_rewards WHERE user_id = ? AND status = 'paid'",
            params![user_id],
            |row| row.get(0),
        )?;

        Ok(BalanceParts {
            dep_verified,
            dep_pending,
            wd_active,
            bank_active,
            ai_active,
            ai_profit,
            referral_paid,
        })
    }

    pub fn balance_parts(
        &self,
        user_id: i64,
        address: &str,
        token_symbol: &str,
    ) -> Result<BalanceParts> {
        let conn = self.conn.lock().unwrap();
        Self::balance_parts_with(&conn, user_id, address, token_symbol)
    }

    /* --------------------------- checked debits --------------------------- */
    // Read-then-insert under one lock guard so two debits against the same
    // balance cannot interleave within this process.

    #[allow(clippy::too_many_arguments)]
    pub fn create_transfer_checked(
        &self,
        user_id: i64,
        from_address: &str,
        to_address: &str,
        amount: f64,
        token_symbol: &str,
        network: &str,
        note: Option<&str>,
    ) -> Result<DebitOutcome> {
        let conn = self.conn.lock().unwrap();
        let parts = Self::balance_parts_with(&conn, user_id, from_address, token_symbol)?;
        let spendable = parts.spendable();
        if amount > spendable {
            return Ok(DebitOutcome::Insufficient { spendable });
        }
        conn.execute(
            r#"
            INSERT INTO transfers (user_id, from_address, to_address, amount, token_symbol, network, status, note)
            VALUES (?, ?, ?, ?, ?, ?, 'pending', ?)
            "#,
            params![user_id, from_address, to_address, amount, token_symbol, network, note],
        )?;
        Ok(DebitOutcome::Inserted(conn.last_insert_rowid()))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_bank_transfer_checked(
        &self,
        user_id: i64,
        from_address: &str,
        bank_code: &str,
        account_number: &str,
        account_name: &str,
        amount_usdt: f64,
        rate_usdt_php: f64,
        fx_fee_pct: f64,
        payout_fee_php: f64,
        php_gross: f64,
        php_net: f64,
        reference: Option<&str>,
    ) -> Result<DebitOutcome> {
        let conn = self.conn.lock().unwrap();
        let parts = Self::balance_parts_with(&conn, user_id, from_address, "USDT")?;
        let spendable = parts.spendable();
        if amount_usdt > spendable {
            return Ok(DebitOutcome::Insufficient { spendable });
        }
        conn.execute(
            r#"
            INSERT INTO bank_transfers
                (user_id, from_address, bank_code, account_number, account_name,
                 amount_usdt, rate_usdt_php, fx_fee_pct, payout_fee_php, php_gross, php_net,
                 token_symbol, network, reference, status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'USDT', 'bank', ?, 'processing')
            "#,
            params![
                user_id,
                from_address,
                bank_code,
                account_number,
                account_name,
                amount_usdt,
                rate_usdt_php,
                fx_fee_pct,
                payout_fee_php,
                php_gross,
                php_net,
                reference
            ],
        )?;
        Ok(DebitOutcome::Inserted(conn.last_insert_rowid()))
    }

    // Upsert by (user, address, symbol): a resubscription replaces the
    // principal and terms and resets last_credit_date, restarting accrual
    // from the new start date.
    #[allow(clippy::too_many_arguments)]
    pub fn create_subscription_checked(
        &self,
        user_id: i64,
        from_address: &str,
        symbol: &str,
        amount_usdt: f64,
        token_symbol: &str,
        contract_days: i64,
        rate_daily: f64,
        start_date: &str,
        end_date: &str,
    ) -> Result<DebitOutcome> {
        let conn = self.conn.lock().unwrap();
        let parts = Self::balance_parts_with(&conn, user_id, from_address, token_symbol)?;
        let spendable = parts.spendable();
        if amount_usdt > spendable {
            return Ok(DebitOutcome::Insufficient { spendable });
        }
        conn.execute(
            r#"
            INSERT INTO ai_subscriptions
                (user_id, from_address, symbol, amount_usdt, token_symbol, contract_days,
                 rate_daily, start_date, end_date, last_credit_date, status)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, 'active')
            ON CONFLICT(user_id, from_address, symbol) DO UPDATE SET
                amount_usdt = excluded.amount_usdt,
                token_symbol = excluded.token_symbol,
                contract_days = excluded.contract_days,
                rate_daily = excluded.rate_daily,
                start_date = excluded.start_date,
                end_date = excluded.end_date,
                last_credit_date = NULL,
                status = 'active'
            "#,
            params![
                user_id,
                from_address,
                symbol,
                amount_usdt,
                token_symbol,
                contract_days,
                rate_daily,
                start_date,
                end_date
            ],
        )?;
        Ok(DebitOutcome::Inserted(conn.last_insert_rowid()))
    }

    /* --------------------------- subscriptions --------------------------- */

    pub fn list_subscriptions(
        &self,
        user_id: i64,
        address: Option<&str>,
    ) -> Result<Vec<SubscriptionRow>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = String::from(
            r#"
            SELECT id, user_id, from_address, symbol, amount_usdt, token_symbol, contract_days,
                   rate_daily, start_date, end_date, last_credit_date, status
            FROM ai_subscriptions WHERE user_id = ?
            "#,
        );
        if address.is_some() {
            sql.push_str(" AND from_address = ?2");
        }
        sql.push_str(" ORDER BY symbol ASC");
        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row| -> Result<SubscriptionRow> {
            Ok(SubscriptionRow {
                id: row.get(0)?,
                user_id: row.get(1)?,
                from_address: row.get(2)?,
                symbol: row.get(3)?,
                amount_usdt: row.get(4)?,
                token_symbol: row.get(5)?,
                contract_days: row.get(6)?,
                rate_daily: row.get(7)?,
                start_date: row.get(8)?,
                end_date: row.get(9)?,
                last_credit_date: row.get(10)?,
                status: row.get(11)?,
            })
        };
        let rows = match address {
            Some(addr) => stmt
                .query_map(params![user_id, addr], map_row)?
                .collect::<Result<Vec<_>, _>>()?,
            None => stmt
                .query_map(params![user_id], map_row)?
                .collect::<Result<Vec<_>, _>>()?,
        };
        Ok(rows)
    }

    pub fn set_subscription_status(
        &self,
        user_id: i64,
        from_address: &str,
        symbol: &str,
        status: &str,
    ) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE ai_subscriptions SET status = ? WHERE user_id = ? AND from_address = ? AND symbol = ?",
            params![status, user_id, from_address, symbol],
        )
    }

    // Active subscriptions whose accrual may owe past days.
    pub fn subscriptions_for_accrual(&self, today: &str) -> Result<Vec<SubscriptionRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, user_id, from_address, symbol, amount_usdt, token_symbol, contract_days,
                   rate_daily, start_date, end_date, last_credit_date, status
            FROM ai_subscriptions
            WHERE status = 'active' AND start_date <= ?
            "#,
        )?;
        let rows = stmt
            .query_map(params![today], Self::map_subscription)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // Active subscriptions whose contract window includes the given day.
    pub fn subscriptions_in_window(&self, day: &str) -> Result<Vec<SubscriptionRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, user_id, from_address, symbol, amount_usdt, token_symbol, contract_days,
                   rate_daily, start_date, end_date, last_credit_date, status
            FROM ai_subscriptions
            WHERE status = 'active' AND start_date <= ?1 AND end_date >= ?1
            "#,
        )?;
        let rows = stmt
            .query_map(params![day], Self::map_subscription)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn map_subscription(row: &rusqlite::Row) -> Result<SubscriptionRow> {
        Ok(SubscriptionRow {
            id: row.get(0)?,
            user_id: row.get(1)?,
            from_address: row.get(2)?,
            symbol: row.get(3)?,
            amount_usdt: row.get(4)?,
            token_symbol: row.get(5)?,
            contract_days: row.get(6)?,
            rate_daily: row.get(7)?,
            start_date: row.get(8)?,
            end_date: row.get(9)?,
            last_credit_date: row.get(10)?,
            status: row.get(11)?,
        })
    }

    pub fn set_last_credit_date(&self, subscription_id: i64, day: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE ai_subscriptions SET last_credit_date = ? WHERE id = ?",
            params![day, subscription_id],
        )
    }

    pub fn complete_subscription(&self, subscription_id: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE ai_subscriptions SET status = 'completed' WHERE id = ?",
            params![subscription_id],
        )
    }

    // Full-day target for a given day across active subscriptions on an
    // address.
    pub fn expected_profit_for_day(&self, user_id: i64, address: &str, day: &str) -> Result<f64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            r#"
            SELECT COALESCE(SUM(amount_usdt * rate_daily), 0)
            FROM ai_subscriptions
            WHERE user_id = ? AND from_address = ? AND status = 'active'
              AND start_date <= ?3 AND end_date >= ?3
            "#,
            params![user_id, address, day],
            |row| row.get(0),
        )
    }

    /* --------------------------- profit ledger --------------------------- */

    // Conditional insert; returns whether the row was newly created. A
    // pre-existing row from a prior or concurrent run is a no-op, not an
    // error.
    pub fn insert_profit_ignore(
        &self,
        user_id: i64,
        address: &str,
        symbol: &str,
        amount: f64,
        day: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            r#"
            INSERT OR IGNORE INTO ai_profit_ledger (user_id, from_address, symbol, amount_usdt, day_date)
            VALUES (?, ?, ?, ?, ?)
            "#,
            params![user_id, address, symbol, amount, day],
        )?;
        Ok(changed > 0)
    }

    // Absolute overwrite for the realtime poster: the row converges to the
    // full-day credit as the day elapses.
    pub fn upsert_profit_absolute(
        &self,
        user_id: i64,
        address: &str,
        symbol: &str,
        amount: f64,
        day: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO ai_profit_ledger (user_id, from_address, symbol, amount_usdt, day_date)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(user_id, from_address, symbol, day_date) DO UPDATE SET
                amount_usdt = excluded.amount_usdt
            "#,
            params![user_id, address, symbol, amount, day],
        )?;
        Ok(())
    }

    pub fn profit_sum(&self, user_id: i64, address: &str) -> Result<f64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COALESCE(SUM(amount_usdt), 0) FROM ai_profit_ledger WHERE user_id = ? AND from_address = ?",
            params![user_id, address],
            |row| row.get(0),
        )
    }

    pub fn profit_sum_for_day(&self, user_id: i64, address: &str, day: &str) -> Result<f64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COALESCE(SUM(amount_usdt), 0) FROM ai_profit_ledger WHERE user_id = ? AND from_address = ? AND day_date = ?",
            params![user_id, address, day],
            |row| row.get(0),
        )
    }

    // All addresses and symbols: the commission base for a user-day.
    pub fn user_profit_for_day(&self, user_id: i64, day: &str) -> Result<f64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COALESCE(SUM(amount_usdt), 0) FROM ai_profit_ledger WHERE user_id = ? AND day_date = ?",
            params![user_id, day],
            |row| row.get(0),
        )
    }

    pub fn users_with_profit_on(&self, day: &str) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT user_id FROM ai_profit_ledger WHERE day_date = ? GROUP BY user_id")?;
        let rows = stmt
            .query_map(params![day], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /* ----------------------------- referrals ----------------------------- */

    pub fn referral_code_of(&self, user_id: i64) -> Result<Option<(String, i64)>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT code, clicks FROM referral_codes WHERE user_id = ?",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
    }

    // Claim replaces the user's existing code; a clash on the code itself
    // bubbles up as a unique violation.
    pub fn claim_referral_code(&self, user_id: i64, code: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO referral_codes (user_id, code) VALUES (?, ?)
            ON CONFLICT(user_id) DO UPDATE SET code = excluded.code
            "#,
            params![user_id, code],
        )?;
        Ok(())
    }

    pub fn insert_referral_code_tx(tx: &Transaction, user_id: i64, code: &str) -> Result<()> {
        tx.execute(
            "INSERT INTO referral_codes (user_id, code) VALUES (?, ?)",
            params![user_id, code],
        )?;
        Ok(())
    }

    pub fn code_exists_tx(tx: &Transaction, code: &str) -> Result<bool> {
        let found: Option<i64> = tx
            .query_row(
                "SELECT id FROM referral_codes WHERE code = ? LIMIT 1",
                params![code],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn code_owner_tx(tx: &Transaction, code: &str) -> Result<Option<i64>> {
        tx.query_row(
            "SELECT user_id FROM referral_codes WHERE code = ? LIMIT 1",
            params![code],
            |row| row.get(0),
        )
        .optional()
    }

    pub fn bump_code_clicks(&self, code: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE referral_codes SET clicks = clicks + 1 WHERE code = ?",
            params![code],
        )
    }

    pub fn insert_relation_tx(tx: &Transaction, referrer_id: i64, referee_id: i64) -> Result<bool> {
        let changed = tx.execute(
            "INSERT OR IGNORE INTO referral_relations (referrer_id, referee_id) VALUES (?, ?)",
            params![referrer_id, referee_id],
        )?;
        Ok(changed > 0)
    }

    pub fn referrer_of(&self, user_id: i64) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT referrer_id FROM referral_relations WHERE referee_id = ? LIMIT 1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()
    }

    pub fn referred_users(&self, referrer_id: i64, limit: i64) -> Result<Vec<ReferredUserRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT rr.referee_id, u.name, u.identifier, rr.created_at
            FROM referral_relations rr
            JOIN users u ON u.id = rr.referee_id
            WHERE rr.referrer_id = ?
            ORDER BY rr.id DESC
            LIMIT ?
            "#,
        )?;
        let rows = stmt
            .query_map(params![referrer_id, limit], |row| {
                Ok(ReferredUserRow {
                    user_id: row.get(0)?,
                    name: row.get(1)?,
                    identifier: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn referred_count(&self, referrer_id: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM referral_relations WHERE referrer_id = ?",
            params![referrer_id],
            |row| row.get(0),
        )
    }

    /* ----------------------------- commissions ----------------------------- */
    // The conflict arm only fires while the row is still pending: once the
    // payout scheduler marks a day paid, that history is append-only.

    #[allow(clippy::too_many_arguments)]
    pub fn upsert_commission_add(
        &self,
        earner_id: i64,
        source_user_id: i64,
        tier: i64,
        day: &str,
        amount: f64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO referral_rewards (user_id, source_user_id, tier, source_day, amount_usdt, status)
            VALUES (?, ?, ?, ?, ?, 'pending')
            ON CONFLICT(user_id, source_user_id, source_day, tier) DO UPDATE SET
                amount_usdt = referral_rewards.amount_usdt + excluded.amount_usdt
            WHERE referral_rewards.status = 'pending'
            "#,
            params![earner_id, source_user_id, tier, day, amount],
        )?;
        Ok(())
    }

    pub fn upsert_commission_set(
        &self,
        earner_id: i64,
        source_user_id: i64,
        tier: i64,
        day: &str,
        amount: f64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO referral_rewards (user_id, source_user_id, tier, source_day, amount_usdt, status)
            VALUES (?, ?, ?, ?, ?, 'pending')
            ON CONFLICT(user_id, source_user_id, source_day, tier) DO UPDATE SET
                amount_usdt = excluded.amount_usdt
            WHERE referral_rewards.status = 'pending'
            "#,
            params![earner_id, source_user_id, tier, day, amount],
        )?;
        Ok(())
    }

    pub fn commission_for(
        &self,
        earner_id: i64,
        source_user_id: i64,
        day: &str,
        tier: i64,
    ) -> Result<Option<(f64, String)>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            r#"
            SELECT amount_usdt, status FROM referral_rewards
            WHERE user_id = ? AND source_user_id = ? AND source_day = ? AND tier = ?
            "#,
            params![earner_id, source_user_id, day, tier],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
    }

    pub fn list_commissions(&self, earner_id: i64, limit: i64) -> Result<Vec<CommissionRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, source_user_id, tier, source_day, amount_usdt, status, paid_at
            FROM referral_rewards
            WHERE user_id = ?
            ORDER BY id DESC
            LIMIT ?
            "#,
        )?;
        let rows = stmt
            .query_map(params![earner_id, limit], |row| {
                Ok(CommissionRow {
                    id: row.get(0)?,
                    source_user_id: row.get(1)?,
                    tier: row.get(2)?,
                    source_day: row.get(3)?,
                    amount_usdt: row.get(4)?,
                    status: row.get(5)?,
                    paid_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // (paid, pending)
    pub fn commission_totals(&self, earner_id: i64) -> Result<(f64, f64)> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            r#"
            SELECT COALESCE(SUM(CASE WHEN status = 'paid' THEN amount_usdt END), 0),
                   COALESCE(SUM(CASE WHEN status = 'pending' THEN amount_usdt END), 0)
            FROM referral_rewards WHERE user_id = ?
            "#,
            params![earner_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
    }

    pub fn referral_paid_sum(&self, user_id: i64) -> Result<f64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COALESCE(SUM(amount_usdt), 0) FROM referral_rewards WHERE user_id = ? AND status = 'paid'",
            params![user_id],
            |row| row.get(0),
        )
    }

    // Bulk pending -> paid for one source day. The sole writer of 'paid'.
    pub fn pay_commissions_for_day(
        &self,
        day: &str,
        min_amount: f64,
        paid_at: &str,
    ) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            UPDATE referral_rewards
            SET status = 'paid', paid_at = ?
            WHERE source_day = ? AND status = 'pending' AND amount_usdt >= ?
            "#,
            params![paid_at, day, min_amount],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_bootstrap_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.conn.lock().unwrap();
        Database::initialize_database(&conn).unwrap();
        let banks: i64 = conn
            .query_row("SELECT COUNT(*) FROM banks", [], |row| row.get(0))
            .unwrap();
        assert_eq!(banks, 21); // seeded once, not twice
    }

    #[test]
    fn profit_ledger_unique_key_makes_insert_a_noop() {
        let db = Database::open_in_memory().unwrap();
        let uid = {
            let mut conn = db.conn.lock().unwrap();
            let tx = conn.transaction().unwrap();
            tx.execute(
                "INSERT INTO users (name, identifier, password_hash) VALUES ('a', 'a@x', 'h')",
                [],
            )
            .unwrap();
            let id = tx.last_insert_rowid();
            tx.commit().unwrap();
            id
        };
        assert!(db.insert_profit_ignore(uid, "0xabc", "BTC", 5.0, "2024-01-02").unwrap());
        assert!(!db.insert_profit_ignore(uid, "0xabc", "BTC", 9.0, "2024-01-02").unwrap());
        // first amount wins; the conflicting insert did not overwrite
        assert_eq!(db.profit_sum_for_day(uid, "0xabc", "2024-01-02").unwrap(), 5.0);
    }

    #[test]
    fn commission_upsert_leaves_paid_rows_alone() {
        let db = Database::open_in_memory().unwrap();
        for ident in ["e@x", "s@x"] {
            let mut conn = db.conn.lock().unwrap();
            let tx = conn.transaction().unwrap();
            tx.execute(
                "INSERT INTO users (name, identifier, password_hash) VALUES ('u', ?, 'h')",
                params![ident],
            )
            .unwrap();
            tx.commit().unwrap();
        }
        db.upsert_commission_set(1, 2, 1, "2024-01-01", 4.0).unwrap();
        db.pay_commissions_for_day("2024-01-01", 0.0, "2024-01-02T00:05:00Z").unwrap();
        db.upsert_commission_set(1, 2, 1, "2024-01-01", 99.0).unwrap();
        db.upsert_commission_add(1, 2, 1, "2024-01-01", 99.0).unwrap();
        let (amount, status) = db.commission_for(1, 2, "2024-01-01", 1).unwrap().unwrap();
        assert_eq!(amount, 4.0);
        assert_eq!(status, "paid");
    }
}
