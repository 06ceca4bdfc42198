//! Application Context
//!
//! Explicit dependency injection instead of process-wide singletons: one
//! struct owns every service and is passed to whatever needs it. Built in
//! `Init`, torn down in `Shutdown`.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::db::Database;
use crate::ledger::LedgerClient;
use crate::services::{
    AccountService, BalanceRegistry, EventProcessor, MarketService, OrderService, PositionService,
    ReconciliationService, SettlementBatcher,
};
use crate::ws::SubscriptionHub;

pub struct AppContext {
    pub config: AppConfig,
    pub db: Database,
    pub hub: Arc<SubscriptionHub>,
    pub orders: Arc<OrderService>,
    pub markets: Arc<MarketService>,
    pub accounts: Arc<AccountService>,
    pub positions: Arc<PositionService>,
    pub settlement: Arc<SettlementBatcher>,
    pub events: Arc<EventProcessor>,
    pub reconciliation: Arc<ReconciliationService>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl AppContext {
    /// Wire every service against the store and the given ledger client.
    pub async fn init(
        config: AppConfig,
        ledger: Arc<dyn LedgerClient>,
    ) -> Result<Self, crate::errors::CoreError> {
        let db = Database::connect(&config.database_path, config.database_wal_mode).await?;
        let hub = Arc::new(SubscriptionHub::new());
        let balances = Arc::new(BalanceRegistry::new());

        let orders = Arc::new(OrderService::new(
            db.clone(),
            ledger.clone(),
            hub.clone(),
            balances.clone(),
        ));
        let markets = Arc::new(MarketService::new(
            db.clone(),
            ledger.clone(),
            hub.clone(),
            config.admin_party.clone(),
        ));
        let accounts = Arc::new(AccountService::new(
            db.clone(),
            ledger.clone(),
            hub.clone(),
            balances.clone(),
            config.admin_party.clone(),
        ));
        let positions = Arc::new(PositionService::new(
            db.clone(),
            ledger.clone(),
            hub.clone(),
            balances.clone(),
        ));
        let settlement = Arc::new(SettlementBatcher::new(
            db.clone(),
            ledger.clone(),
            hub.clone(),
            balances.clone(),
            config.settlement.clone(),
            config.admin_party.clone(),
        ));
        let events = Arc::new(EventProcessor::new(
            db.clone(),
            ledger.clone(),
            hub.clone(),
            config.event_processor.clone(),
        ));
        let reconciliation = Arc::new(ReconciliationService::new(
            db.clone(),
            ledger.clone(),
            balances,
            config.reconciliation.clone(),
        ));

        let (stop_tx, stop_rx) = watch::channel(false);

        Ok(Self {
            config,
            db,
            hub,
            orders,
            markets,
            accounts,
            positions,
            settlement,
            events,
            reconciliation,
            stop_tx,
            stop_rx,
            workers: Vec::new(),
        })
    }

    /// Rehydrate the orderbooks and start every background worker.
    pub async fn run(&mut self) -> Result<(), crate::errors::CoreError> {
        let report = self.orders.initialize().await?;
        if !report.excluded.is_empty() {
            tracing::warn!(
                excluded = report.excluded.len(),
                "orders held back from the book pending settlement review"
            );
        }

        self.workers
            .push(self.settlement.clone().start(self.stop_rx.clone()));
        self.workers
            .push(self.events.clone().start(self.stop_rx.clone()));
        self.workers
            .push(self.reconciliation.clone().start(self.stop_rx.clone()));
        self.hub.clone().start_heartbeat(self.stop_rx.clone());
        Ok(())
    }

    /// Signal every worker, wait for them to drain, close the hub.
    pub async fn shutdown(mut self) {
        tracing::info!("shutting down");
        let _ = self.stop_tx.send(true);
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
        self.hub.shutdown();
        self.db.pool.close().await;
        tracing::info!("shutdown complete");
    }
}
