//! The `Foo` service: the original demo's `Sum`/`Sleep` handlers, plus a
//! small in-memory ledger (`Balance`/`Transfer`) giving the demo an actual
//! bank flavor instead of pure arithmetic.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use gbankrpc_core::service::{ServiceBuilder, ServiceEntry};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct SumArgs {
    pub num1: i64,
    pub num2: i64,
}

#[derive(Serialize, Deserialize, Default)]
pub struct SumReply(pub i64);

#[derive(Serialize, Deserialize)]
pub struct AccountArgs {
    pub account: String,
}

#[derive(Serialize, Deserialize, Default)]
pub struct BalanceReply {
    pub account: String,
    pub balance_cents: i64,
}

#[derive(Serialize, Deserialize)]
pub struct TransferArgs {
    pub from: String,
    pub to: String,
    pub amount_cents: i64,
}

pub struct Foo {
    ledger: RwLock<HashMap<String, i64>>,
}

impl Foo {
    pub fn new() -> Foo {
        let mut ledger = HashMap::new();
        ledger.insert("alice".to_string(), 10_000);
        ledger.insert("bob".to_string(), 5_000);
        Foo {
            ledger: RwLock::new(ledger),
        }
    }

    fn balance_of(&self, account: &str) -> Result<i64, String> {
        self.ledger
            .read()
            .unwrap()
            .get(account)
            .copied()
            .ok_or_else(|| format!("no such account: {account}"))
    }
}

pub fn foo_service(handler: Foo) -> ServiceEntry {
    ServiceBuilder::new("Foo", handler)
        .method("Sum", |_h: Arc<Foo>, arg: SumArgs| async move {
            Ok::<_, String>(SumReply(arg.num1 + arg.num2))
        })
        .method("Sleep", |_h: Arc<Foo>, arg: SumArgs| async move {
            tokio::time::sleep(Duration::from_secs(arg.num1.max(0) as u64)).await;
            Ok::<_, String>(SumReply(arg.num1 + arg.num2))
        })
        .method("Balance", |h: Arc<Foo>, arg: AccountArgs| async move {
            let balance_cents = h.balance_of(&arg.account)?;
            Ok::<_, String>(BalanceReply {
                account: arg.account,
                balance_cents,
            })
        })
        .method("Transfer", |h: Arc<Foo>, arg: TransferArgs| async move {
            if arg.amount_cents <= 0 {
                return Err(format!(
                    "transfer amount must be positive: {}",
                    arg.amount_cents
                ));
            }
            let mut ledger = h.ledger.write().unwrap();
            let from_balance = *ledger
                .get(&arg.from)
                .ok_or_else(|| format!("no such account: {}", arg.from))?;
            if !ledger.contains_key(&arg.to) {
                return Err(format!("no such account: {}", arg.to));
            }
            if from_balance < arg.amount_cents {
                return Err(format!(
                    "insufficient funds in {}: have {from_balance}, need {}",
                    arg.from, arg.amount_cents
                ));
            }
            *ledger.get_mut(&arg.from).unwrap() -= arg.amount_cents;
            *ledger.get_mut(&arg.to).unwrap() += arg.amount_cents;
            let balance_cents = ledger[&arg.from];
            Ok::<_, String>(BalanceReply {
                account: arg.from,
                balance_cents,
            })
        })
        .build()
}
