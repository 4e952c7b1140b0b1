pub mod connection;
pub mod migrations;
pub mod repositories;

pub use connection::{connect, connect_with_settings, DbPool};
pub use repositories::{
    AppendOutcome, AuditLedger, InMemoryAuditLedger, InMemoryItemRepository,
    InMemoryPolicyRepository, InMemorySourceRepository, ItemRepository, PolicyRepository,
    RepositoryError, SourceRepository, SqlAuditLedger, SqlItemRepository, SqlPolicyRepository,
    SqlSourceRepository,
};
