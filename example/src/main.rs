use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

use twophase::{
    Coordinator, CoordinatorConfig, FnParticipant, MemoryLog, Participant, ParticipantError,
    TxContext,
};

// Account store that reserves funds on Prepare and applies them on Commit
struct Account {
    name: String,
    balance: Mutex<i64>,
    holds: Mutex<HashMap<String, i64>>,
    // Sign of the amount this account applies (debit or credit)
    direction: i64,
}

impl Account {
    fn new(name: &str, balance: i64, direction: i64) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            balance: Mutex::new(balance),
            holds: Mutex::new(HashMap::new()),
            direction,
        })
    }

    fn balance(&self) -> i64 {
        *self.balance.lock()
    }
}

#[async_trait]
impl Participant for Account {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self, ctx: &TxContext) -> Result<(), ParticipantError> {
        let amount: i64 = ctx.get_payload("amount")?;
        let delta = amount * self.direction;
        if *self.balance.lock() + delta < 0 {
            return Err(ParticipantError::rejected(format!(
                "{} cannot cover {}",
                self.name, amount
            )));
        }
        self.holds.lock().insert(ctx.id.to_string(), delta);
        Ok(())
    }

    async fn commit(&self, ctx: &TxContext) -> Result<(), ParticipantError> {
        // A repeated Commit finds no hold and changes nothing
        if let Some(delta) = self.holds.lock().remove(ctx.id.as_str()) {
            *self.balance.lock() += delta;
        }
        Ok(())
    }

    async fn rollback(&self, ctx: &TxContext) -> Result<(), ParticipantError> {
        self.holds.lock().remove(ctx.id.as_str());
        Ok(())
    }
}

async fn transfer(
    coordinator: &Coordinator,
    from: &Arc<Account>,
    to: &Arc<Account>,
    amount: i64,
) -> Result<()> {
    let id = coordinator.begin_with_payload(json!({ "amount": amount })).await;
    coordinator.register(&id, from.clone()).await?;
    coordinator.register(&id, to.clone()).await?;

    let audit = FnParticipant::new("audit").on_commit(|ctx: TxContext| async move {
        tracing::info!(tx_id = %ctx.id, "audit record written");
        Ok(())
    });
    coordinator.register(&id, audit.into_arc()).await?;

    coordinator
        .end(&id)
        .await
        .map_err(|e| anyhow!("transfer of {} failed: {}", amount, e))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = match CoordinatorConfig::from_yaml_file("coordinator.yaml") {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(error = %e, "Falling back to development config");
            CoordinatorConfig::development()
        }
    };
    let log = MemoryLog::new();
    let coordinator = Coordinator::with_log(config, Arc::new(log.clone()))?;

    let alice = Account::new("alice", 100, -1);
    let bob = Account::new("bob", 20, 1);

    transfer(&coordinator, &alice, &bob, 60).await?;
    if let Err(e) = transfer(&coordinator, &alice, &bob, 60).await {
        println!("{}", e);
    }

    println!("alice={} bob={}", alice.balance(), bob.balance());
    for line in log.lines() {
        println!("{}", line);
    }

    Ok(())
}
