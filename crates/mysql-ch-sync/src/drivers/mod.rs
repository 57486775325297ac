//! Store drivers.
//!
//! - [`mysql`]: the source side, over `mysql_async`
//! - [`clickhouse`]: the destination side and migration ledger, over the HTTP interface

pub mod clickhouse;
pub mod mysql;

pub use clickhouse::ClickHouseClient;
pub use mysql::MysqlSource;
