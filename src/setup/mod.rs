// ABOUTME: Steps that run before the data sync: FDW provisioning and schema (DDL) sync
// ABOUTME: Both shell out or issue DDL against the target; neither touches table data

pub mod fdw;
pub mod schema;

pub use fdw::{fdw_statements, setup_fdw, FdwStatements, FDW_SERVER_NAME};
pub use schema::{sync_schema, ClientTools};
