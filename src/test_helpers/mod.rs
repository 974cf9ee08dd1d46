//! Shared helpers for unit tests.

pub mod fake_transport;
pub mod fixtures;
pub mod temp;

pub use fake_transport::FakeTransport;
pub use fixtures::FakeModuleBuilder;
pub use temp::TestContext;
