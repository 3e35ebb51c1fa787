// ABOUTME: PostgreSQL side of the sync engine
// ABOUTME: Connections, catalog reads and range scans, change application, snapshot handling

pub mod backend;
pub mod connection;
pub mod reader;
pub mod writer;

pub use backend::{PgBackend, PgSnapshot};
pub use connection::{connect, connect_with_retry, init_tls_policy, ping};
pub use reader::PgTableReader;
pub use writer::PgTargetSession;
