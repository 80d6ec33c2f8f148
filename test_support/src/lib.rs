//! ABOUTME: Shared test doubles for the instrumented HTTP client and database handle
//! ABOUTME: Scripted transport, scripted SQL handle, and exposition text readers

pub mod exposition;
pub mod sql;
pub mod transport;

pub use exposition::sample_value;
pub use sql::{MockSqlError, MockSqlHandle, SqlCall};
pub use transport::{MockTransport, MockTransportError};
