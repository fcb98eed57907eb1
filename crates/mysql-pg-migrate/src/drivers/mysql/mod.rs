//! MySQL source driver.
//!
//! - [`MysqlReader`]: catalog discovery and row streaming
//!
//! # Supported Versions
//!
//! - MySQL 5.7+, 8.0+
//! - MariaDB 10.2+

mod reader;

pub use reader::MysqlReader;
