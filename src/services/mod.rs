//! Trading Core Services
//!
//! ```text
//! Transport (out of scope)
//!   ↓
//! OrderService ──→ MatchingEngine ──→ OrderBook (per market)
//!   │                                   ↑ rehydrated from the store
//!   ├─→ Store (orders, trades)          │
//!   └─→ SubscriptionHub events          │
//! SettlementBatcher ──→ LedgerClient    │
//! EventProcessor ←── ledger stream ──→ Projections
//! Reconciliation ←── ledger ACS ────→ Projections
//! ```

pub mod accounts;
pub mod balances;
pub mod events;
pub mod markets;
pub mod matching;
pub mod orderbook;
pub mod orders;
pub mod positions;
pub mod projections;
pub mod reconciliation;
pub mod settlement;

pub use accounts::AccountService;
pub use balances::BalanceRegistry;
pub use events::EventProcessor;
pub use markets::MarketService;
pub use orderbook::OrderBook;
pub use orders::OrderService;
pub use positions::PositionService;
pub use reconciliation::ReconciliationService;
pub use settlement::SettlementBatcher;
